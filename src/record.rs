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

use std::cell::RefCell;
use std::fmt;
use std::io;
use std::rc::Rc;

use chrono::{DateTime, Utc};
use encoding::label::encoding_from_whatwg_label;
use log::warn;
use uuid::Uuid;

use crate::digest::{format_digest, split_digest_header, DigestAlgorithm};
use crate::error::Result;
use crate::headers::{parse_header_block, HeaderEncoding, HeaderMap};
use crate::reader::BufferedReader;
use crate::stream::{write_all, MemoryStream, Stream, StreamWriter};

const WRITE_CHUNK_SIZE: usize = 16384;
const DIGEST_CHUNK_SIZE: usize = 16384;

/// Payload reader shared between the archive iterator and its live record.
pub type SharedReader = Rc<RefCell<BufferedReader>>;

/// WARC record type.
///
/// Discriminants double as filter bits; `NoType` and `AnyType` are
/// filter/constructor sentinels and never appear on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WarcRecordType {
    WarcInfo = 2,
    Response = 4,
    Resource = 8,
    Request = 16,
    Metadata = 32,
    Revisit = 64,
    Conversion = 128,
    Continuation = 256,
    Unknown = 512,
    NoType = 0,
    AnyType = 0xFFFF,
}

impl WarcRecordType {
    /// Resolve a `WARC-Type` wire token (case-insensitive).
    /// Unrecognized tokens resolve to `Unknown`.
    pub fn from_token(token: &[u8]) -> Self {
        match token.to_ascii_lowercase().as_slice() {
            b"warcinfo" => WarcRecordType::WarcInfo,
            b"response" => WarcRecordType::Response,
            b"resource" => WarcRecordType::Resource,
            b"request" => WarcRecordType::Request,
            b"metadata" => WarcRecordType::Metadata,
            b"revisit" => WarcRecordType::Revisit,
            b"conversion" => WarcRecordType::Conversion,
            b"continuation" => WarcRecordType::Continuation,
            _ => WarcRecordType::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WarcRecordType::WarcInfo => "warcinfo",
            WarcRecordType::Response => "response",
            WarcRecordType::Resource => "resource",
            WarcRecordType::Request => "request",
            WarcRecordType::Metadata => "metadata",
            WarcRecordType::Revisit => "revisit",
            WarcRecordType::Conversion => "conversion",
            WarcRecordType::Continuation => "continuation",
            _ => "unknown",
        }
    }

    pub fn matches_bitmask(&self, bitmask: u16) -> bool {
        (*self as u16) & bitmask != 0
    }
}

impl fmt::Display for WarcRecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A WARC record.
///
/// Records yielded by the iterator share its buffered reader, limited to
/// the record's payload extent; the iterator reclaims the reader on the
/// next pull, so a record is valid only until then. Digest verification
/// tees the payload into memory and rebinds the reader, after which the
/// record stands on its own.
pub struct WarcRecord {
    record_type: WarcRecordType,
    headers: HeaderMap,
    is_http: bool,
    http_parsed: bool,
    http_charset: Option<String>,
    http_headers: Option<HeaderMap>,
    content_length: u64,
    reader: SharedReader,
    stream_pos: u64,
}

impl Default for WarcRecord {
    fn default() -> Self {
        Self::new()
    }
}

impl WarcRecord {
    /// Create a new empty WARC record.
    pub fn new() -> Self {
        let mut reader = BufferedReader::new(Box::new(MemoryStream::new()));
        reader.set_limit(0);
        WarcRecord {
            record_type: WarcRecordType::Unknown,
            headers: HeaderMap::new(HeaderEncoding::Unicode),
            is_http: false,
            http_parsed: false,
            http_charset: None,
            http_headers: None,
            content_length: 0,
            reader: Rc::new(RefCell::new(reader)),
            stream_pos: 0,
        }
    }

    pub(crate) fn from_parts(
        headers: HeaderMap,
        record_type: WarcRecordType,
        is_http: bool,
        content_length: u64,
        reader: SharedReader,
        stream_pos: u64,
    ) -> Self {
        WarcRecord {
            record_type,
            headers,
            is_http,
            http_parsed: false,
            http_charset: None,
            http_headers: None,
            content_length,
            reader,
            stream_pos,
        }
    }

    /// Record type (same as `headers["WARC-Type"]`).
    pub fn record_type(&self) -> WarcRecordType {
        self.record_type
    }

    /// Set the record type, updating the `WARC-Type` header.
    pub fn set_record_type(&mut self, record_type: WarcRecordType) {
        self.record_type = record_type;
        self.headers
            .set_bytes(b"WARC-Type", record_type.as_str().as_bytes());
    }

    /// Record ID (same as `headers["WARC-Record-ID"]`).
    pub fn record_id(&self) -> Option<String> {
        self.headers.get("WARC-Record-ID")
    }

    /// `WARC-Date` parsed as a UTC timestamp.
    pub fn record_date(&self) -> Option<DateTime<Utc>> {
        let date = self.headers.get("WARC-Date")?;
        DateTime::parse_from_rfc3339(&date)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    }

    /// WARC record headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// WARC record headers (mutable).
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Whether the record carries an `application/http` block.
    pub fn is_http(&self) -> bool {
        self.is_http
    }

    /// Set whether this record is an HTTP record.
    /// Also updates the record's `Content-Type` header accordingly.
    pub fn set_is_http(&mut self, is_http: bool) {
        self.is_http = is_http;
        if is_http {
            self.headers.set_bytes(
                b"Content-Type",
                match self.record_type {
                    WarcRecordType::Request => b"application/http; msgtype=request",
                    WarcRecordType::Response => b"application/http; msgtype=response",
                    _ => b"application/http",
                },
            );
        }
    }

    /// Whether HTTP headers have been parsed.
    pub fn is_http_parsed(&self) -> bool {
        self.http_parsed
    }

    /// HTTP headers, once parsed.
    pub fn http_headers(&self) -> Option<&HeaderMap> {
        self.http_headers.as_ref()
    }

    /// Plain HTTP Content-Type without additional fields such as `charset=`.
    pub fn http_content_type(&self) -> Option<String> {
        self.http_headers
            .as_ref()?
            .get("Content-Type")?
            .split(';')
            .next()
            .map(|s| s.trim().to_string())
    }

    /// HTTP charset as sent by the server.
    /// Only set if the value is a valid encoding label.
    pub fn http_charset(&self) -> Option<&str> {
        self.http_charset.as_deref()
    }

    /// Remaining record payload length in bytes.
    ///
    /// Starts out equal to the `Content-Length` header; once HTTP headers
    /// are parsed it is reduced to the length of the HTTP body.
    pub fn content_length(&self) -> u64 {
        self.content_length
    }

    /// Record start offset in the stream. On a block-compressed stream
    /// this is the offset on the compressed substrate.
    pub fn stream_pos(&self) -> u64 {
        self.stream_pos
    }

    /// Shared handle on the payload reader.
    pub fn reader(&self) -> SharedReader {
        Rc::clone(&self.reader)
    }

    /// Read up to `n` payload bytes.
    pub fn read(&mut self, n: usize) -> io::Result<Vec<u8>> {
        self.reader.borrow_mut().read(n)
    }

    /// Read the remaining payload.
    pub fn read_to_end(&mut self) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        loop {
            let chunk = self.reader.borrow_mut().read(DIGEST_CHUNK_SIZE)?;
            if chunk.is_empty() {
                return Ok(out);
            }
            out.extend_from_slice(&chunk);
        }
    }

    /// Parse the embedded HTTP header block and advance the payload reader
    /// to the HTTP body.
    ///
    /// Safe to call repeatedly; does nothing for non-HTTP records.
    pub fn parse_http(&mut self) -> io::Result<()> {
        if self.http_parsed || !self.is_http {
            return Ok(());
        }
        let mut http_headers = HeaderMap::new(HeaderEncoding::Latin1);
        let consumed =
            parse_header_block(&mut self.reader.borrow_mut(), &mut http_headers, true)?;
        self.content_length = self.content_length.saturating_sub(consumed);
        self.http_charset = http_headers
            .get("Content-Type")
            .and_then(|ct| extract_charset(&ct));
        self.http_headers = Some(http_headers);
        self.http_parsed = true;
        Ok(())
    }

    /// Replace the record payload with an in-memory buffer and update
    /// `Content-Length`.
    pub fn set_content(&mut self, content: impl Into<Vec<u8>>) {
        let content = content.into();
        self.content_length = content.len() as u64;
        self.headers
            .set("Content-Length", self.content_length.to_string());
        self.rebind_reader(content);
    }

    /// Initialize mandatory headers in a fresh record.
    ///
    /// `record_urn` is a `WARC-Record-ID` URN without the enclosing
    /// `<`/`>`; a random UUID URN is generated if unset.
    pub fn init_headers(
        &mut self,
        content_length: u64,
        record_type: Option<WarcRecordType>,
        record_urn: Option<&[u8]>,
    ) {
        self.init_headers_at(content_length, record_type, record_urn, Utc::now());
    }

    /// Same as [`init_headers`](Self::init_headers) with an explicit
    /// timestamp.
    pub fn init_headers_at(
        &mut self,
        content_length: u64,
        record_type: Option<WarcRecordType>,
        record_urn: Option<&[u8]>,
        date: DateTime<Utc>,
    ) {
        let urn = match record_urn {
            Some(urn) => urn.to_vec(),
            None => format!("urn:uuid:{}", Uuid::new_v4()).into_bytes(),
        };
        self.record_type = match record_type {
            None | Some(WarcRecordType::NoType) => self.record_type,
            Some(WarcRecordType::AnyType) => WarcRecordType::Unknown,
            Some(record_type) => record_type,
        };

        self.headers.clear();
        self.headers.set_status_line(b"WARC/1.1");
        self.headers
            .append_bytes(b"WARC-Type", self.record_type.as_str().as_bytes());
        self.headers.append_bytes(
            b"WARC-Date",
            date.format("%Y-%m-%dT%H:%M:%SZ").to_string().as_bytes(),
        );
        self.headers.append_bytes(
            b"WARC-Record-ID",
            format!("<{}>", String::from_utf8_lossy(&urn)).as_bytes(),
        );
        self.headers
            .append_bytes(b"Content-Length", content_length.to_string().as_bytes());
        self.content_length = content_length;
    }

    /// Verify the `WARC-Block-Digest` header against the record block.
    ///
    /// The block is tee'd into memory during hashing, so the payload stays
    /// readable afterwards. Returns `false` for records whose HTTP headers
    /// have already been parsed: the header bytes covered by the block
    /// digest are gone from the stream at that point.
    pub fn verify_block_digest(&mut self) -> Result<bool> {
        if self.http_parsed {
            warn!("cannot verify block digest after HTTP parsing");
            return Ok(false);
        }
        self.verify_digest("WARC-Block-Digest")
    }

    /// Verify the `WARC-Payload-Digest` header against the HTTP body.
    ///
    /// The payload digest is defined over the HTTP body only, so this
    /// returns `false` unless HTTP headers have been parsed.
    pub fn verify_payload_digest(&mut self) -> Result<bool> {
        if !self.http_parsed {
            return Ok(false);
        }
        self.verify_digest("WARC-Payload-Digest")
    }

    fn verify_digest(&mut self, header: &str) -> Result<bool> {
        let value = match self.headers.get_bytes(header.as_bytes()) {
            Some(value) => value,
            None => return Ok(false),
        };
        let (token, expected) = match split_digest_header(&value) {
            Some(parts) => parts,
            None => {
                warn!("malformed {} header", header);
                return Ok(false);
            }
        };
        let algorithm = match DigestAlgorithm::from_token(token) {
            Some(algorithm) => algorithm,
            None => {
                warn!(
                    "unsupported digest algorithm: {}",
                    String::from_utf8_lossy(token)
                );
                return Ok(false);
            }
        };
        let expected = expected.to_vec();

        let mut hasher = algorithm.hasher();
        let mut tee = Vec::new();
        {
            let mut reader = self.reader.borrow_mut();
            loop {
                let chunk = reader.read(DIGEST_CHUNK_SIZE)?;
                if chunk.is_empty() {
                    break;
                }
                hasher.update(&chunk);
                tee.extend_from_slice(&chunk);
            }
        }
        let computed = crate::digest::base32(&hasher.finalize());
        self.rebind_reader(tee);
        Ok(computed.as_bytes().eq_ignore_ascii_case(&expected))
    }

    fn rebind_reader(&mut self, content: Vec<u8>) {
        let len = content.len() as u64;
        let mut reader = BufferedReader::new(Box::new(MemoryStream::from_bytes(content)));
        reader.set_limit(len);
        self.reader = Rc::new(RefCell::new(reader));
    }

    /// Write the record onto a stream.
    ///
    /// Uses the default chunk size; see
    /// [`write_chunked`](Self::write_chunked).
    pub fn write(&mut self, out: &mut dyn Stream, checksum_data: bool) -> Result<u64> {
        self.write_chunked(out, checksum_data, WRITE_CHUNK_SIZE)
    }

    /// Write the record onto a stream, consuming the remaining payload.
    ///
    /// Without `checksum_data` on a record whose HTTP headers were never
    /// parsed, headers and payload pass straight through. Otherwise the
    /// block is re-materialized in memory: `Content-Length` is corrected
    /// and, with `checksum_data`, fresh SHA-1 block and payload digests are
    /// stored before serialization.
    ///
    /// On a block-compressing sink the record is wrapped in its own
    /// compression member. Returns the number of bytes written as reported
    /// by the sink.
    pub fn write_chunked(
        &mut self,
        out: &mut dyn Stream,
        checksum_data: bool,
        chunk_size: usize,
    ) -> Result<u64> {
        if out.block_compressed() {
            let mut total = out.begin_member()?;
            self.write_body(out, checksum_data, chunk_size)?;
            total += out.end_member()?;
            Ok(total)
        } else {
            self.write_body(out, checksum_data, chunk_size)
        }
    }

    fn write_body(
        &mut self,
        out: &mut dyn Stream,
        checksum_data: bool,
        chunk_size: usize,
    ) -> Result<u64> {
        if !checksum_data && !self.http_parsed {
            // Raw passthrough.
            let mut written = self.headers.write(&mut StreamWriter { inner: out })? as u64;
            write_all(out, b"\r\n")?;
            written += 2;
            loop {
                let chunk = self.reader.borrow_mut().read(chunk_size)?;
                if chunk.is_empty() {
                    break;
                }
                write_all(out, &chunk)?;
                written += chunk.len() as u64;
            }
            write_all(out, b"\r\n\r\n")?;
            Ok(written + 4)
        } else {
            // Re-materialize the block so Content-Length and digests can
            // be computed over what actually gets written.
            let mut block: Vec<u8> = Vec::new();
            let mut block_hasher = checksum_data.then(|| DigestAlgorithm::Sha1.hasher());
            let mut payload_hasher =
                (checksum_data && self.http_parsed).then(|| DigestAlgorithm::Sha1.hasher());

            if self.http_parsed {
                if let Some(http_headers) = &self.http_headers {
                    http_headers.write(&mut block)?;
                    block.extend_from_slice(b"\r\n");
                }
                if let Some(hasher) = block_hasher.as_mut() {
                    hasher.update(&block);
                }
            }
            loop {
                let chunk = self.reader.borrow_mut().read(chunk_size)?;
                if chunk.is_empty() {
                    break;
                }
                if let Some(hasher) = block_hasher.as_mut() {
                    hasher.update(&chunk);
                }
                if let Some(hasher) = payload_hasher.as_mut() {
                    hasher.update(&chunk);
                }
                block.extend_from_slice(&chunk);
            }

            self.headers.set("Content-Length", block.len().to_string());
            if let Some(hasher) = block_hasher {
                self.headers.set(
                    "WARC-Block-Digest",
                    format_digest(DigestAlgorithm::Sha1, &hasher.finalize()),
                );
            }
            if let Some(hasher) = payload_hasher {
                self.headers.set(
                    "WARC-Payload-Digest",
                    format_digest(DigestAlgorithm::Sha1, &hasher.finalize()),
                );
            }

            let written = self.headers.write(&mut StreamWriter { inner: out })? as u64;
            write_all(out, b"\r\n")?;
            write_all(out, &block)?;
            write_all(out, b"\r\n\r\n")?;
            Ok(written + 2 + block.len() as u64 + 4)
        }
    }
}

fn extract_charset(content_type: &str) -> Option<String> {
    let lower = content_type.to_lowercase();
    let rest = &lower[lower.find("charset=")? + "charset=".len()..];
    let charset = rest.split(';').next()?.trim().trim_matches('"').to_string();
    if charset.is_empty() {
        return None;
    }
    encoding_from_whatwg_label(&charset).map(|_| charset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn init_headers_populates_mandatory_fields() {
        let mut record = WarcRecord::new();
        let date = Utc.with_ymd_and_hms(2024, 5, 17, 8, 30, 0).unwrap();
        record.init_headers_at(5, Some(WarcRecordType::Resource), None, date);

        assert_eq!(record.headers().status_line(), "WARC/1.1");
        let keys: Vec<String> = record.headers().keys().collect();
        assert_eq!(
            keys,
            ["WARC-Type", "WARC-Date", "WARC-Record-ID", "Content-Length"]
        );
        assert_eq!(record.headers().get("WARC-Type").as_deref(), Some("resource"));
        assert_eq!(
            record.headers().get("WARC-Date").as_deref(),
            Some("2024-05-17T08:30:00Z")
        );
        let id = record.record_id().unwrap();
        assert!(id.starts_with("<urn:uuid:") && id.ends_with('>'));
        assert_eq!(record.content_length(), 5);
        assert_eq!(record.record_date(), Some(date));
    }

    #[test]
    fn init_headers_sentinels() {
        let mut record = WarcRecord::new();
        record.set_record_type(WarcRecordType::Response);
        record.init_headers(0, Some(WarcRecordType::NoType), Some(b"urn:uuid:test"));
        assert_eq!(record.record_type(), WarcRecordType::Response);
        assert_eq!(record.record_id().as_deref(), Some("<urn:uuid:test>"));

        record.init_headers(0, Some(WarcRecordType::AnyType), None);
        assert_eq!(record.record_type(), WarcRecordType::Unknown);
    }

    #[test]
    fn set_content_updates_length_and_reader() {
        let mut record = WarcRecord::new();
        record.init_headers(0, Some(WarcRecordType::Metadata), None);
        record.set_content(b"hello".to_vec());
        assert_eq!(record.content_length(), 5);
        assert_eq!(record.headers().get("Content-Length").as_deref(), Some("5"));
        assert_eq!(record.read(100).unwrap(), b"hello");
        assert_eq!(record.read(100).unwrap(), b"");
    }

    #[test]
    fn block_digest_verifies_and_tees() {
        let mut record = WarcRecord::new();
        record.init_headers(3, Some(WarcRecordType::Resource), None);
        record.set_content(b"abc".to_vec());
        record.headers_mut().set(
            "WARC-Block-Digest",
            "sha1:VGMT4NSHA2AWVOR6EVYXQUGCNSONBWE5",
        );
        assert!(record.verify_block_digest().unwrap());
        // Tee property: payload still readable after verification.
        assert_eq!(record.read(100).unwrap(), b"abc");
    }

    #[test]
    fn block_digest_mismatch_is_false() {
        let mut record = WarcRecord::new();
        record.init_headers(3, Some(WarcRecordType::Resource), None);
        record.set_content(b"abd".to_vec());
        record.headers_mut().set(
            "WARC-Block-Digest",
            "sha1:VGMT4NSHA2AWVOR6EVYXQUGCNSONBWE5",
        );
        assert!(!record.verify_block_digest().unwrap());
    }

    #[test]
    fn unsupported_digest_algorithm_is_false() {
        let mut record = WarcRecord::new();
        record.set_content(b"abc".to_vec());
        record
            .headers_mut()
            .set("WARC-Block-Digest", "sha512:AAAA");
        assert!(!record.verify_block_digest().unwrap());
        assert!(record.headers().contains_key("WARC-Block-Digest"));
    }

    #[test]
    fn payload_digest_requires_parsed_http() {
        let mut record = WarcRecord::new();
        record.set_content(b"abc".to_vec());
        record.headers_mut().set("WARC-Payload-Digest", "sha1:AAAA");
        assert!(!record.verify_payload_digest().unwrap());
    }

    #[test]
    fn set_is_http_couples_content_type() {
        let mut record = WarcRecord::new();
        record.set_record_type(WarcRecordType::Response);
        record.set_is_http(true);
        assert_eq!(
            record.headers().get("Content-Type").as_deref(),
            Some("application/http; msgtype=response")
        );
    }

    #[test]
    fn charset_extraction_validates_labels() {
        assert_eq!(
            extract_charset("text/html; charset=UTF-8").as_deref(),
            Some("utf-8")
        );
        assert_eq!(
            extract_charset("text/html; charset=\"iso-8859-1\"; x=y").as_deref(),
            Some("iso-8859-1")
        );
        assert_eq!(extract_charset("text/html; charset=bogus-charset"), None);
        assert_eq!(extract_charset("text/html"), None);
    }

    #[test]
    fn write_fast_path_is_verbatim() {
        let mut record = WarcRecord::new();
        let date = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        record.init_headers_at(5, Some(WarcRecordType::WarcInfo), Some(b"urn:uuid:x"), date);
        record.set_content(b"hello".to_vec());

        let mut out = MemoryStream::new();
        let written = record.write(&mut out, false).unwrap();
        let expected = b"WARC/1.1\r\n\
            WARC-Type: warcinfo\r\n\
            WARC-Date: 2024-01-01T00:00:00Z\r\n\
            WARC-Record-ID: <urn:uuid:x>\r\n\
            Content-Length: 5\r\n\
            \r\n\
            hello\r\n\r\n";
        assert_eq!(out.bytes(), expected);
        assert_eq!(written, expected.len() as u64);
    }

    #[test]
    fn write_with_checksums_sets_digest_headers() {
        let mut record = WarcRecord::new();
        record.init_headers(3, Some(WarcRecordType::Resource), None);
        record.set_content(b"abc".to_vec());

        let mut out = MemoryStream::new();
        record.write(&mut out, true).unwrap();
        assert_eq!(
            record.headers().get("WARC-Block-Digest").as_deref(),
            Some("sha1:VGMT4NSHA2AWVOR6EVYXQUGCNSONBWE5")
        );
        assert_eq!(record.headers().get("Content-Length").as_deref(), Some("3"));
        // No payload digest without parsed HTTP headers.
        assert!(!record.headers().contains_key("WARC-Payload-Digest"));
    }
}
