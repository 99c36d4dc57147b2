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

use std::collections::HashMap;
use std::io::{self, Write};

use encoding::all::ISO_8859_15;
use encoding::{DecoderTrap, Encoding};

use crate::reader::BufferedReader;

/// Charset for decoding header bytes into strings.
///
/// WARC headers are UTF-8, embedded HTTP headers are decoded as
/// ISO-8859-15. Decoding is lossy in both cases; header bytes are kept
/// verbatim and only the string views go through the charset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderEncoding {
    Unicode,
    Latin1,
}

/// Case-insensitive string key for the dictionary view of a header map.
#[derive(Debug, Eq, Clone)]
pub struct CaseInsensitiveKey(String);

impl CaseInsensitiveKey {
    pub fn new(s: impl Into<String>) -> Self {
        CaseInsensitiveKey(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl PartialEq for CaseInsensitiveKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.eq_ignore_ascii_case(&other.0)
    }
}

impl std::hash::Hash for CaseInsensitiveKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.to_lowercase().hash(state);
    }
}

impl From<&str> for CaseInsensitiveKey {
    fn from(s: &str) -> Self {
        CaseInsensitiveKey::new(s)
    }
}

impl From<CaseInsensitiveKey> for String {
    fn from(key: CaseInsensitiveKey) -> Self {
        key.0
    }
}

/// Ordered, case-insensitive multimap representing a WARC or HTTP header
/// block.
///
/// Names are stored as written; lookups ignore ASCII case. Duplicate names
/// are permitted and iteration preserves insertion order.
#[derive(Debug, Clone)]
pub struct HeaderMap {
    encoding: HeaderEncoding,
    status_line: Vec<u8>,
    entries: Vec<(Vec<u8>, Vec<u8>)>,
}

impl HeaderMap {
    pub fn new(encoding: HeaderEncoding) -> Self {
        HeaderMap {
            encoding,
            status_line: Vec::new(),
            entries: Vec::new(),
        }
    }

    pub fn encoding(&self) -> HeaderEncoding {
        self.encoding
    }

    fn decode(&self, bytes: &[u8]) -> String {
        match self.encoding {
            HeaderEncoding::Unicode => String::from_utf8_lossy(bytes).into_owned(),
            HeaderEncoding::Latin1 => ISO_8859_15
                .decode(bytes, DecoderTrap::Replace)
                .unwrap_or_default(),
        }
    }

    /// Status line decoded with the configured charset.
    pub fn status_line(&self) -> String {
        self.decode(&self.status_line)
    }

    /// Raw status line bytes.
    pub fn status_line_bytes(&self) -> &[u8] {
        &self.status_line
    }

    pub fn set_status_line(&mut self, status_line: impl AsRef<[u8]>) {
        self.status_line = status_line.as_ref().to_vec();
    }

    /// HTTP status code, if this is an HTTP header block.
    pub fn status_code(&self) -> Option<u16> {
        if !self.status_line.starts_with(b"HTTP/") {
            return None;
        }
        let mut parts = self.status_line.splitn(3, |&b| b == b' ');
        parts.next()?;
        String::from_utf8_lossy(parts.next()?).parse().ok()
    }

    /// HTTP reason phrase, if this is an HTTP header block and one was given.
    pub fn reason_phrase(&self) -> Option<String> {
        if !self.status_line.starts_with(b"HTTP/") {
            return None;
        }
        let mut parts = self.status_line.splitn(3, |&b| b == b' ');
        parts.next()?;
        parts.next()?;
        Some(self.decode(parts.next()?))
    }

    /// Value for a header name as a string.
    /// Values of duplicate headers are joined with `","`.
    pub fn get(&self, name: &str) -> Option<String> {
        Some(self.decode(&self.get_bytes(name.as_bytes())?))
    }

    /// Value for a header name as bytes.
    /// Values of duplicate headers are joined with `","`.
    pub fn get_bytes(&self, name: &[u8]) -> Option<Vec<u8>> {
        let values: Vec<&[u8]> = self
            .entries
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_slice())
            .collect();
        if values.is_empty() {
            None
        } else {
            Some(values.join(b",".as_slice()))
        }
    }

    pub fn contains_key(&self, name: &str) -> bool {
        let name = name.as_bytes();
        self.entries.iter().any(|(k, _)| k.eq_ignore_ascii_case(name))
    }

    /// Set a header, replacing the first occurrence of the name and
    /// dropping any later duplicates. Appends if the name is absent.
    pub fn set(&mut self, name: impl AsRef<str>, value: impl AsRef<str>) {
        self.set_bytes(name.as_ref().as_bytes(), value.as_ref().as_bytes());
    }

    pub fn set_bytes(&mut self, name: &[u8], value: &[u8]) {
        let mut replaced = false;
        self.entries.retain_mut(|entry| {
            if !entry.0.eq_ignore_ascii_case(name) {
                true
            } else if !replaced {
                *entry = (name.trim_ascii().to_vec(), value.trim_ascii().to_vec());
                replaced = true;
                true
            } else {
                false
            }
        });
        if !replaced {
            self.append_bytes(name, value);
        }
    }

    /// Append a header without checking for existing names.
    pub fn append(&mut self, name: impl AsRef<str>, value: impl AsRef<str>) {
        self.append_bytes(name.as_ref().as_bytes(), value.as_ref().as_bytes());
    }

    pub fn append_bytes(&mut self, name: &[u8], value: &[u8]) {
        self.entries
            .push((name.trim_ascii().to_vec(), value.trim_ascii().to_vec()));
    }

    /// Fold a continuation line into the previous header's value.
    ///
    /// Without a previous header, a synthetic pair with an empty name is
    /// created so malformed leading lines are preserved.
    pub fn add_continuation(&mut self, value: &[u8]) {
        match self.entries.last_mut() {
            Some(last) => {
                last.1.push(b' ');
                last.1.extend_from_slice(value);
            }
            None => self.entries.push((Vec::new(), value.to_vec())),
        }
    }

    /// Raw name/value pairs in insertion order.
    pub fn iter_bytes(&self) -> impl Iterator<Item = (&[u8], &[u8])> {
        self.entries.iter().map(|(k, v)| (k.as_slice(), v.as_slice()))
    }

    /// Decoded name/value pairs in insertion order.
    pub fn items(&self) -> impl Iterator<Item = (String, String)> + '_ {
        self.entries.iter().map(|(k, v)| (self.decode(k), self.decode(v)))
    }

    pub fn keys(&self) -> impl Iterator<Item = String> + '_ {
        self.entries.iter().map(|(k, _)| self.decode(k))
    }

    pub fn values(&self) -> impl Iterator<Item = String> + '_ {
        self.entries.iter().map(|(_, v)| self.decode(v))
    }

    /// Decoded dictionary view.
    /// Values of duplicate headers are joined with `","`.
    pub fn to_map(&self) -> HashMap<CaseInsensitiveKey, String> {
        let mut map: HashMap<CaseInsensitiveKey, String> = HashMap::new();
        for (k, v) in self.items() {
            map.entry(CaseInsensitiveKey::new(k))
                .and_modify(|existing| {
                    existing.push(',');
                    existing.push_str(&v);
                })
                .or_insert(v);
        }
        map
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.status_line.clear();
        self.entries.clear();
    }

    /// Serialize the header block, status line first, one `name: value`
    /// pair per line. The terminating blank line is not emitted.
    pub fn write<W: Write>(&self, writer: &mut W) -> io::Result<usize> {
        let mut written = 0usize;
        if !self.status_line.is_empty() {
            writer.write_all(&self.status_line)?;
            writer.write_all(b"\r\n")?;
            written += self.status_line.len() + 2;
        }
        for (name, value) in &self.entries {
            if !name.is_empty() {
                writer.write_all(name)?;
                writer.write_all(b": ")?;
                written += name.len() + 2;
            }
            writer.write_all(value)?;
            writer.write_all(b"\r\n")?;
            written += value.len() + 2;
        }
        Ok(written)
    }
}

/// Parse a header block from `reader` into `target` until the first blank
/// line (or EOF, for unterminated blocks).
///
/// With `has_status_line` set, the first non-continuation line is stored
/// as the status line instead of a header. Lines starting with whitespace
/// fold into the previous header; lines without a colon are preserved as
/// continuations as well.
///
/// Returns the number of bytes consumed, line terminators included.
pub fn parse_header_block(
    reader: &mut BufferedReader,
    target: &mut HeaderMap,
    has_status_line: bool,
) -> io::Result<u64> {
    let mut consumed = 0u64;
    let mut expect_status = has_status_line;
    loop {
        let line = reader.readline()?;
        consumed += line.len() as u64;
        if line.is_empty() || line == b"\r\n" || line == b"\n" {
            break;
        }
        if line[0] == b' ' || line[0] == b'\t' {
            target.add_continuation(line.trim_ascii());
            continue;
        }
        if expect_status {
            target.set_status_line(line.trim_ascii());
            expect_status = false;
            continue;
        }
        match line.iter().position(|&b| b == b':') {
            Some(i) => target.append_bytes(&line[..i], line[i + 1..].trim_ascii()),
            None => target.add_continuation(line.trim_ascii()),
        }
    }
    Ok(consumed)
}
