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

//! Streaming reader and writer for WARC/1.0 and WARC/1.1 web archives.
//!
//! Records are pulled one at a time from arbitrarily large streams without
//! materializing them: each record exposes a reader limited to its payload
//! extent, and the iterator reclaims unread bytes on the next pull. Writing
//! supports raw passthrough as well as re-materialization with corrected
//! `Content-Length` and fresh SHA-1 digests, and both sides work over plain
//! or gzip-member-compressed streams.

pub mod archive;
pub mod digest;
pub mod error;
pub mod headers;
pub mod reader;
pub mod record;
pub mod stream;

pub use archive::{ArchiveIterator, ArchiveIteratorConfig, NextRecord};
pub use error::{Result, WarcError};
pub use headers::{parse_header_block, HeaderEncoding, HeaderMap};
pub use reader::BufferedReader;
pub use record::{SharedReader, WarcRecord, WarcRecordType};
pub use stream::{FileStream, GzipStream, MemoryStream, Stream};
