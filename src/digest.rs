// Copyright 2025 Janek Bevendorff
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use data_encoding::BASE32;
use md5::Md5;
use sha1::{Digest, Sha1};
use sha2::Sha256;

/// Hash algorithms accepted in WARC digest headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestAlgorithm {
    Sha1,
    Md5,
    Sha256,
}

impl DigestAlgorithm {
    /// Resolve a wire token (case-insensitive).
    pub fn from_token(token: &[u8]) -> Option<Self> {
        match token.to_ascii_lowercase().as_slice() {
            b"sha1" => Some(DigestAlgorithm::Sha1),
            b"md5" => Some(DigestAlgorithm::Md5),
            b"sha256" => Some(DigestAlgorithm::Sha256),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DigestAlgorithm::Sha1 => "sha1",
            DigestAlgorithm::Md5 => "md5",
            DigestAlgorithm::Sha256 => "sha256",
        }
    }

    pub fn hasher(&self) -> Hasher {
        match self {
            DigestAlgorithm::Sha1 => Hasher::Sha1(Sha1::new()),
            DigestAlgorithm::Md5 => Hasher::Md5(Md5::new()),
            DigestAlgorithm::Sha256 => Hasher::Sha256(Sha256::new()),
        }
    }
}

/// Incremental hasher over the supported algorithms.
pub enum Hasher {
    Sha1(Sha1),
    Md5(Md5),
    Sha256(Sha256),
}

impl Hasher {
    pub fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Sha1(h) => h.update(data),
            Hasher::Md5(h) => h.update(data),
            Hasher::Sha256(h) => h.update(data),
        }
    }

    pub fn finalize(self) -> Vec<u8> {
        match self {
            Hasher::Sha1(h) => h.finalize().to_vec(),
            Hasher::Md5(h) => h.finalize().to_vec(),
            Hasher::Sha256(h) => h.finalize().to_vec(),
        }
    }
}

/// Base32 rendering used in digest header values.
pub fn base32(digest: &[u8]) -> String {
    BASE32.encode(digest)
}

/// Render a raw digest as a `alg:base32` header value.
pub fn format_digest(algorithm: DigestAlgorithm, digest: &[u8]) -> String {
    format!("{}:{}", algorithm.as_str(), base32(digest))
}

/// Split an `alg:base32` header value into its token and digest parts.
pub fn split_digest_header(value: &[u8]) -> Option<(&[u8], &[u8])> {
    let colon = value.iter().position(|&b| b == b':')?;
    Some((value[..colon].trim_ascii(), value[colon + 1..].trim_ascii()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_resolution() {
        assert_eq!(DigestAlgorithm::from_token(b"SHA1"), Some(DigestAlgorithm::Sha1));
        assert_eq!(DigestAlgorithm::from_token(b"md5"), Some(DigestAlgorithm::Md5));
        assert_eq!(DigestAlgorithm::from_token(b"sha256"), Some(DigestAlgorithm::Sha256));
        assert_eq!(DigestAlgorithm::from_token(b"sha512"), None);
    }

    #[test]
    fn sha1_base32_known_value() {
        let mut hasher = DigestAlgorithm::Sha1.hasher();
        hasher.update(b"abc");
        assert_eq!(
            format_digest(DigestAlgorithm::Sha1, &hasher.finalize()),
            "sha1:VGMT4NSHA2AWVOR6EVYXQUGCNSONBWE5"
        );
    }

    #[test]
    fn incremental_matches_oneshot() {
        let mut split = DigestAlgorithm::Sha256.hasher();
        split.update(b"hello ");
        split.update(b"world");
        let mut whole = DigestAlgorithm::Sha256.hasher();
        whole.update(b"hello world");
        assert_eq!(split.finalize(), whole.finalize());
    }

    #[test]
    fn header_splitting() {
        let (token, digest) = split_digest_header(b"sha1: ABC123 ").unwrap();
        assert_eq!(token, b"sha1");
        assert_eq!(digest, b"ABC123");
        assert!(split_digest_header(b"no-colon").is_none());
    }
}
