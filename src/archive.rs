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
use std::io;
use std::rc::Rc;

use log::warn;

use crate::error::{Result, WarcError};
use crate::headers::{parse_header_block, HeaderEncoding, HeaderMap};
use crate::reader::BufferedReader;
use crate::record::{WarcRecord, WarcRecordType};
use crate::stream::Stream;

/// Archive iterator configuration.
#[derive(Debug, Clone)]
pub struct ArchiveIteratorConfig {
    /// Parse HTTP headers of `application/http` records automatically.
    pub parse_http: bool,
    /// Skip records without a valid block digest.
    pub verify_digests: bool,
    /// Skip records with a Content-Length below this.
    pub min_content_length: Option<u64>,
    /// Skip records with a Content-Length above this.
    pub max_content_length: Option<u64>,
    /// Bitmask of record types to yield (others are skipped).
    pub record_type_filter: u16,
    /// Surface malformed records and unknown versions as errors instead of
    /// ending iteration.
    pub strict: bool,
}

impl Default for ArchiveIteratorConfig {
    fn default() -> Self {
        ArchiveIteratorConfig {
            parse_http: true,
            verify_digests: false,
            min_content_length: None,
            max_content_length: None,
            record_type_filter: WarcRecordType::AnyType as u16,
            strict: false,
        }
    }
}

/// Outcome of a single iterator pull.
pub enum NextRecord {
    Record(WarcRecord),
    Skipped,
    EndOfStream,
}

/// Record-by-record iterator over a WARC stream.
///
/// The iterator and its current record share one buffered reader; pulling
/// the next record consumes whatever payload the caller left unread, so a
/// yielded record is valid only until the next pull. The reader is closed
/// when the iterator is dropped.
pub struct ArchiveIterator {
    reader: Rc<RefCell<BufferedReader>>,
    config: ArchiveIteratorConfig,
    compressed: bool,
    has_current: bool,
    done: bool,
}

impl ArchiveIterator {
    pub fn new(stream: Box<dyn Stream>) -> Self {
        Self::with_config(stream, ArchiveIteratorConfig::default())
    }

    pub fn with_config(stream: Box<dyn Stream>, config: ArchiveIteratorConfig) -> Self {
        let compressed = stream.block_compressed();
        ArchiveIterator {
            reader: Rc::new(RefCell::new(BufferedReader::new(stream))),
            config,
            compressed,
            has_current: false,
            done: false,
        }
    }

    /// Pull the next record from the stream.
    ///
    /// Most callers iterate instead; `read_next` exposes skipped records
    /// as [`NextRecord::Skipped`] rather than looping over them.
    pub fn read_next(&mut self) -> Result<NextRecord> {
        let mut reader = self.reader.borrow_mut();

        if self.has_current {
            // Reclaim the reader: discard whatever the caller left unread.
            reader.consume(None)?;
            reader.reset_limit();
            self.has_current = false;
        }

        let version_line = loop {
            let line = reader.readline()?;
            if line.is_empty() {
                return Ok(NextRecord::EndOfStream);
            }
            if line == b"\r\n" || line == b"\n" {
                continue;
            }
            break line;
        };

        // The version line was delivered out of the record's own
        // compression member, so on block-compressed substrates the stream
        // position is that member's start offset; otherwise it is the
        // logical offset of the version line itself.
        let stream_pos = if self.compressed {
            reader.stream_tell()?
        } else {
            reader.tell() - version_line.len() as u64
        };

        let version = version_line.trim_ascii();
        if version != b"WARC/1.0" && version != b"WARC/1.1" {
            if self.config.strict {
                return Err(WarcError::UnsupportedVersion(
                    String::from_utf8_lossy(version).into_owned(),
                ));
            }
            warn!("stream does not continue with a WARC record, stopping");
            return Ok(NextRecord::EndOfStream);
        }

        let mut headers = HeaderMap::new(HeaderEncoding::Unicode);
        headers.set_status_line(version);
        parse_header_block(&mut reader, &mut headers, false)?;

        // One pass over the parsed headers for the framing metadata.
        let mut content_length: Option<Option<u64>> = None;
        let mut record_type: Option<WarcRecordType> = None;
        let mut content_type_seen = false;
        let mut is_http = false;
        for (name, value) in headers.iter_bytes() {
            if content_length.is_none() && name.eq_ignore_ascii_case(b"content-length") {
                content_length = Some(parse_content_length(value));
            } else if record_type.is_none() && name.eq_ignore_ascii_case(b"warc-type") {
                record_type = Some(WarcRecordType::from_token(value));
            } else if !content_type_seen && name.eq_ignore_ascii_case(b"content-type") {
                is_http = value.trim_ascii_start().starts_with(b"application/http");
                content_type_seen = true;
            }
            if content_length.is_some() && record_type.is_some() && content_type_seen {
                break;
            }
        }

        let content_length = match content_length {
            Some(Some(length)) => length,
            _ => {
                if self.config.strict {
                    return Err(WarcError::MalformedRecord(
                        "missing or invalid Content-Length".into(),
                    ));
                }
                warn!(
                    "record at {} has a missing or invalid Content-Length, stopping",
                    stream_pos
                );
                return Ok(NextRecord::EndOfStream);
            }
        };
        let record_type = record_type.unwrap_or(WarcRecordType::Unknown);

        let too_small = self
            .config
            .min_content_length
            .is_some_and(|min| content_length < min);
        let too_large = self
            .config
            .max_content_length
            .is_some_and(|max| content_length > max);
        if !record_type.matches_bitmask(self.config.record_type_filter) || too_small || too_large {
            reader.set_limit(content_length);
            reader.consume(None)?;
            reader.reset_limit();
            return Ok(NextRecord::Skipped);
        }

        reader.set_limit(content_length);
        drop(reader);
        self.has_current = true;

        let mut record = WarcRecord::from_parts(
            headers,
            record_type,
            is_http,
            content_length,
            Rc::clone(&self.reader),
            stream_pos,
        );

        if self.config.verify_digests {
            // Verification drains the shared reader into a private tee, so
            // the record detaches from the stream either way.
            let valid = record.verify_block_digest()?;
            {
                let mut reader = self.reader.borrow_mut();
                reader.consume(None)?;
                reader.reset_limit();
            }
            self.has_current = false;
            if !valid {
                warn!(
                    "skipping record at {} with missing or invalid block digest",
                    record.stream_pos()
                );
                return Ok(NextRecord::Skipped);
            }
        }

        if self.config.parse_http && record.is_http() {
            record.parse_http()?;
        }

        Ok(NextRecord::Record(record))
    }

    /// Close the underlying reader.
    pub fn close(&mut self) -> io::Result<()> {
        self.reader.borrow_mut().close()
    }
}

impl Drop for ArchiveIterator {
    fn drop(&mut self) {
        if let Ok(mut reader) = self.reader.try_borrow_mut() {
            let _ = reader.close();
        }
    }
}

impl Iterator for ArchiveIterator {
    type Item = Result<WarcRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            match self.read_next() {
                Ok(NextRecord::Record(record)) => return Some(Ok(record)),
                Ok(NextRecord::Skipped) => continue,
                Ok(NextRecord::EndOfStream) => {
                    self.done = true;
                    return None;
                }
                Err(err) => {
                    self.done = true;
                    return Some(Err(err));
                }
            }
        }
    }
}

fn parse_content_length(value: &[u8]) -> Option<u64> {
    std::str::from_utf8(value.trim_ascii()).ok()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::MemoryStream;

    fn iter(bytes: &[u8]) -> ArchiveIterator {
        ArchiveIterator::new(Box::new(MemoryStream::from_bytes(bytes.to_vec())))
    }

    fn iter_with(bytes: &[u8], config: ArchiveIteratorConfig) -> ArchiveIterator {
        ArchiveIterator::with_config(Box::new(MemoryStream::from_bytes(bytes.to_vec())), config)
    }

    const THREE_RECORDS: &[u8] = b"WARC/1.1\r\n\
        WARC-Type: warcinfo\r\n\
        Content-Length: 4\r\n\
        \r\n\
        info\r\n\r\n\
        WARC/1.1\r\n\
        WARC-Type: response\r\n\
        Content-Length: 8\r\n\
        \r\n\
        response\r\n\r\n\
        WARC/1.1\r\n\
        WARC-Type: request\r\n\
        Content-Length: 7\r\n\
        \r\n\
        request\r\n\r\n";

    #[test]
    fn minimal_warcinfo_record() {
        let mut archive =
            iter(b"WARC/1.1\r\nWARC-Type: warcinfo\r\nContent-Length: 5\r\n\r\nhello\r\n\r\n");
        let mut record = archive.next().unwrap().unwrap();
        assert_eq!(record.record_type(), WarcRecordType::WarcInfo);
        assert_eq!(record.content_length(), 5);
        assert_eq!(
            record.headers().get("Content-Length").as_deref(),
            Some("5")
        );
        assert_eq!(record.read(100).unwrap(), b"hello");
        assert!(archive.next().is_none());
    }

    #[test]
    fn http_response_parsing() {
        let body = b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\n\r\nhi";
        let raw = [
            b"WARC/1.1\r\n".as_slice(),
            b"WARC-Type: response\r\n",
            b"Content-Type: application/http; msgtype=response\r\n",
            format!("Content-Length: {}\r\n", body.len()).as_bytes(),
            b"\r\n",
            body,
            b"\r\n\r\n",
        ]
        .concat();

        let mut archive = iter(&raw);
        let mut record = archive.next().unwrap().unwrap();
        assert!(record.is_http());
        assert!(record.is_http_parsed());
        let http = record.http_headers().unwrap();
        assert_eq!(http.status_line(), "HTTP/1.1 200 OK");
        assert_eq!(http.status_code(), Some(200));
        assert_eq!(http.get("Content-Type").as_deref(), Some("text/plain"));
        assert_eq!(record.content_length(), 2);
        assert_eq!(record.read(100).unwrap(), b"hi");
    }

    #[test]
    fn http_parsing_can_be_disabled() {
        let raw = b"WARC/1.1\r\n\
            WARC-Type: response\r\n\
            Content-Type: application/http; msgtype=response\r\n\
            Content-Length: 20\r\n\
            \r\n\
            HTTP/1.1 200 OK\r\n\r\nx\r\n\r\n";
        let mut archive = iter_with(
            raw,
            ArchiveIteratorConfig {
                parse_http: false,
                ..Default::default()
            },
        );
        let mut record = archive.next().unwrap().unwrap();
        assert!(record.is_http());
        assert!(!record.is_http_parsed());
        assert_eq!(record.content_length(), 20);
        assert_eq!(record.read(1000).unwrap(), b"HTTP/1.1 200 OK\r\n\r\nx");
    }

    #[test]
    fn records_share_reader_and_unread_payload_is_reclaimed() {
        let mut archive = iter(THREE_RECORDS);
        let record = archive.next().unwrap().unwrap();
        assert_eq!(record.record_type(), WarcRecordType::WarcInfo);
        // Payload intentionally left unread.
        let mut record = archive.next().unwrap().unwrap();
        assert_eq!(record.record_type(), WarcRecordType::Response);
        assert_eq!(record.read(100).unwrap(), b"response");
        let record = archive.next().unwrap().unwrap();
        assert_eq!(record.record_type(), WarcRecordType::Request);
        assert!(archive.next().is_none());
    }

    #[test]
    fn type_filter_skips_other_records() {
        let mut archive = iter_with(
            THREE_RECORDS,
            ArchiveIteratorConfig {
                record_type_filter: WarcRecordType::Response as u16,
                ..Default::default()
            },
        );
        let record = archive.next().unwrap().unwrap();
        assert_eq!(record.record_type(), WarcRecordType::Response);
        assert!(archive.next().is_none());
    }

    #[test]
    fn content_length_bounds_filter() {
        let config = ArchiveIteratorConfig {
            min_content_length: Some(5),
            max_content_length: Some(7),
            ..Default::default()
        };
        let records: Vec<WarcRecordType> = iter_with(THREE_RECORDS, config)
            .map(|r| r.unwrap().record_type())
            .collect();
        assert_eq!(records, [WarcRecordType::Request]);
    }

    #[test]
    fn blank_line_resync_and_stream_pos() {
        let raw = [
            b"\r\n\r\n\r\n".as_slice(),
            b"WARC/1.1\r\nWARC-Type: metadata\r\nContent-Length: 1\r\n\r\nx\r\n\r\n",
        ]
        .concat();
        let mut archive = iter(&raw);
        let record = archive.next().unwrap().unwrap();
        assert_eq!(record.stream_pos(), 6);
    }

    #[test]
    fn stream_pos_is_strictly_increasing() {
        let positions: Vec<u64> = iter(THREE_RECORDS)
            .map(|r| r.unwrap().stream_pos())
            .collect();
        assert_eq!(positions.len(), 3);
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(positions[0], 0);
        // Offset of the second version line: record one is 56 bytes of
        // headers and payload plus the 4-byte separator tail.
        assert_eq!(positions[1], 60);
    }

    #[test]
    fn content_length_equals_header_at_yield() {
        for record in iter(THREE_RECORDS) {
            let record = record.unwrap();
            let header: u64 = record
                .headers()
                .get("Content-Length")
                .unwrap()
                .parse()
                .unwrap();
            assert_eq!(header, record.content_length());
        }
    }

    #[test]
    fn garbage_ends_iteration() {
        let mut archive = iter(b"not a warc stream\r\n");
        assert!(archive.next().is_none());
    }

    #[test]
    fn garbage_errors_in_strict_mode() {
        let mut archive = iter_with(
            b"HTTP/1.1 200 OK\r\n",
            ArchiveIteratorConfig {
                strict: true,
                ..Default::default()
            },
        );
        match archive.next() {
            Some(Err(WarcError::UnsupportedVersion(v))) => assert_eq!(v, "HTTP/1.1 200 OK"),
            other => panic!("expected version error, got {:?}", other.map(|r| r.is_ok())),
        }
    }

    #[test]
    fn missing_content_length_ends_iteration() {
        let mut archive = iter(b"WARC/1.1\r\nWARC-Type: metadata\r\n\r\n");
        assert!(archive.next().is_none());
    }

    #[test]
    fn invalid_content_length_errors_in_strict_mode() {
        let raw = b"WARC/1.1\r\nWARC-Type: metadata\r\nContent-Length: nan\r\n\r\n";
        let mut archive = iter_with(
            raw,
            ArchiveIteratorConfig {
                strict: true,
                ..Default::default()
            },
        );
        assert!(matches!(
            archive.next(),
            Some(Err(WarcError::MalformedRecord(_)))
        ));
    }

    #[test]
    fn verify_digests_skips_invalid_records() {
        let good = b"WARC/1.1\r\n\
            WARC-Type: resource\r\n\
            WARC-Block-Digest: sha1:VGMT4NSHA2AWVOR6EVYXQUGCNSONBWE5\r\n\
            Content-Length: 3\r\n\
            \r\n\
            abc\r\n\r\n";
        let bad = b"WARC/1.1\r\n\
            WARC-Type: resource\r\n\
            WARC-Block-Digest: sha1:AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA\r\n\
            Content-Length: 3\r\n\
            \r\n\
            abc\r\n\r\n";
        let none = b"WARC/1.1\r\n\
            WARC-Type: resource\r\n\
            Content-Length: 3\r\n\
            \r\n\
            abc\r\n\r\n";
        let raw = [good.as_slice(), bad, none].concat();

        let config = ArchiveIteratorConfig {
            verify_digests: true,
            ..Default::default()
        };
        let mut records: Vec<WarcRecord> = iter_with(&raw, config)
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(records.len(), 1);
        // The verified record was tee'd and stays readable.
        assert_eq!(records[0].read(100).unwrap(), b"abc");
    }

    #[test]
    fn warc_header_continuation_lines_fold() {
        let raw = b"WARC/1.1\r\n\
            WARC-Type: metadata\r\n\
            X-Foo: bar\r\n\
            \x20baz\r\n\
            Content-Length: 0\r\n\
            \r\n\r\n\r\n";
        let mut archive = iter(raw);
        let record = archive.next().unwrap().unwrap();
        assert_eq!(record.headers().get("X-Foo").as_deref(), Some("bar baz"));
    }
}
