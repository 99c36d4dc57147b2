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

use std::io;

pub type Result<T> = std::result::Result<T, WarcError>;

/// Errors surfaced while reading or writing WARC streams.
///
/// A cleanly ending stream is not an error; iteration simply stops.
/// Malformed input only becomes a `WarcError` when strict mode is enabled
/// on the iterator.
#[derive(Debug, thiserror::Error)]
pub enum WarcError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("malformed WARC record: {0}")]
    MalformedRecord(String),

    #[error("unsupported WARC version: {0}")]
    UnsupportedVersion(String),

    #[error("unsupported digest algorithm: {0}")]
    UnsupportedDigestAlgorithm(String),
}
