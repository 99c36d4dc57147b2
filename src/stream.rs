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

use std::fs::File;
use std::io::{self, BufRead, Read, Seek, SeekFrom, Write};
use std::mem;
use std::path::Path;

use flate2::bufread::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

/// Abstract byte source/sink consumed by the WARC machinery.
///
/// Streams are strictly sequential unless they implement `seek`. The
/// member hooks are no-ops on plain streams; block-compressing streams
/// override them so each WARC record can form its own compression member.
pub trait Stream {
    /// Read up to `buf.len()` bytes. Returns 0 at EOF.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write `buf`, returning the number of bytes accepted.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Current position on the stream.
    fn tell(&mut self) -> io::Result<u64>;

    /// Reposition the stream. Optional; in-memory buffers support it.
    fn seek(&mut self, pos: u64) -> io::Result<()> {
        let _ = pos;
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "stream is not seekable",
        ))
    }

    /// Release the underlying resource. Reads and writes fail afterwards.
    fn close(&mut self) -> io::Result<()>;

    /// Whether `tell` positions are meaningful only at compression member
    /// boundaries.
    fn block_compressed(&self) -> bool {
        false
    }

    /// Open a new compression member. Returns bytes written to the
    /// underlying sink.
    fn begin_member(&mut self) -> io::Result<u64> {
        Ok(0)
    }

    /// Finish the current compression member. Returns bytes written to the
    /// underlying sink.
    fn end_member(&mut self) -> io::Result<u64> {
        Ok(0)
    }
}

fn closed_err() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "stream is closed")
}

/// Write the whole of `buf`, retrying short writes.
pub(crate) fn write_all(stream: &mut dyn Stream, mut buf: &[u8]) -> io::Result<()> {
    while !buf.is_empty() {
        let n = stream.write(buf)?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "stream stopped accepting bytes",
            ));
        }
        buf = &buf[n..];
    }
    Ok(())
}

/// `io::Write` adapter over a `Stream`, used for header serialization.
pub(crate) struct StreamWriter<'a> {
    pub inner: &'a mut dyn Stream,
}

impl Write for StreamWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Growable in-memory stream.
///
/// Backs header/record fixtures in tests, `WarcRecord::set_content` and the
/// digest verification tee.
#[derive(Debug, Default)]
pub struct MemoryStream {
    cursor: io::Cursor<Vec<u8>>,
}

impl MemoryStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        MemoryStream {
            cursor: io::Cursor::new(bytes.into()),
        }
    }

    /// Buffer contents written (or wrapped) so far.
    pub fn bytes(&self) -> &[u8] {
        self.cursor.get_ref()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.cursor.into_inner()
    }
}

impl Stream for MemoryStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.cursor.read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.cursor.write(buf)
    }

    fn tell(&mut self) -> io::Result<u64> {
        Ok(self.cursor.position())
    }

    fn seek(&mut self, pos: u64) -> io::Result<()> {
        self.cursor.set_position(pos);
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        // The buffer stays inspectable after close.
        Ok(())
    }
}

/// File-backed stream with an explicit close.
pub struct FileStream {
    file: Option<File>,
}

impl FileStream {
    /// Open an existing file for reading.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        Ok(FileStream {
            file: Some(File::open(path)?),
        })
    }

    /// Create (or truncate) a file for writing.
    pub fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        Ok(FileStream {
            file: Some(File::create(path)?),
        })
    }

    fn file_mut(&mut self) -> io::Result<&mut File> {
        self.file.as_mut().ok_or_else(closed_err)
    }
}

impl Stream for FileStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file_mut()?.read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file_mut()?.write(buf)
    }

    fn tell(&mut self) -> io::Result<u64> {
        self.file_mut()?.stream_position()
    }

    fn seek(&mut self, pos: u64) -> io::Result<()> {
        self.file_mut()?.seek(SeekFrom::Start(pos))?;
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        self.file.take();
        Ok(())
    }
}

/// Byte-counting adapter so the gzip decoder can report positions on the
/// compressed substrate.
struct CountingReader {
    inner: Box<dyn Stream>,
    count: u64,
}

impl Read for CountingReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = Stream::read(&mut *self.inner, buf)?;
        self.count += n as u64;
        Ok(n)
    }
}

enum GzipState {
    Reading {
        /// Source handle held between members.
        source: Option<io::BufReader<CountingReader>>,
        /// Decoder for the member currently being read.
        member: Option<GzDecoder<io::BufReader<CountingReader>>>,
        /// Compressed start offset of the current member.
        member_start: u64,
    },
    Writing {
        sink: Box<dyn Stream>,
        member: Option<GzEncoder<Vec<u8>>>,
    },
    Closed,
}

/// Block-compressing gzip stream.
///
/// On the write side, every `begin_member`/`end_member` pair produces one
/// independently decodable gzip member; the member is buffered and flushed
/// to the sink on `end_member`. On the read side, members are decoded one
/// at a time: a single `read` call never crosses a member boundary, so no
/// caller can buffer ahead into the next member, and `tell` reports the
/// compressed start offset of the member the delivered bytes came from.
pub struct GzipStream {
    state: GzipState,
}

impl GzipStream {
    /// Decode gzip data from `inner`.
    pub fn reader(inner: Box<dyn Stream>) -> Self {
        GzipStream {
            state: GzipState::Reading {
                source: Some(io::BufReader::new(CountingReader { inner, count: 0 })),
                member: None,
                member_start: 0,
            },
        }
    }

    /// Compress into `inner`, one member at a time.
    pub fn writer(inner: Box<dyn Stream>) -> Self {
        GzipStream {
            state: GzipState::Writing {
                sink: inner,
                member: None,
            },
        }
    }
}

impl Stream for GzipStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.state {
            GzipState::Reading {
                source,
                member,
                member_start,
            } => {
                if buf.is_empty() {
                    return Ok(0);
                }
                loop {
                    match member.take() {
                        Some(mut decoder) => {
                            let n = decoder.read(buf)?;
                            if n > 0 {
                                *member = Some(decoder);
                                return Ok(n);
                            }
                            // Member exhausted; hand the source back and
                            // look for another member.
                            *source = Some(decoder.into_inner());
                        }
                        None => {
                            let mut reader = match source.take() {
                                Some(reader) => reader,
                                None => return Ok(0),
                            };
                            if reader.fill_buf()?.is_empty() {
                                *source = Some(reader);
                                return Ok(0);
                            }
                            *member_start =
                                reader.get_ref().count - reader.buffer().len() as u64;
                            *member = Some(GzDecoder::new(reader));
                        }
                    }
                }
            }
            GzipState::Writing { .. } => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "gzip stream is write-only",
            )),
            GzipState::Closed => Err(closed_err()),
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.state {
            GzipState::Writing { member, .. } => {
                let encoder = member
                    .get_or_insert_with(|| GzEncoder::new(Vec::new(), Compression::default()));
                encoder.write_all(buf)?;
                Ok(buf.len())
            }
            GzipState::Reading { .. } => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "gzip stream is read-only",
            )),
            GzipState::Closed => Err(closed_err()),
        }
    }

    fn tell(&mut self) -> io::Result<u64> {
        match &mut self.state {
            GzipState::Reading {
                source,
                member,
                member_start,
            } => {
                // Mid-member the position is the member's own start; between
                // members it is where the next member will begin.
                if member.is_some() {
                    return Ok(*member_start);
                }
                match source {
                    Some(reader) => {
                        Ok(reader.get_ref().count - reader.buffer().len() as u64)
                    }
                    None => Err(closed_err()),
                }
            }
            GzipState::Writing { sink, .. } => sink.tell(),
            GzipState::Closed => Err(closed_err()),
        }
    }

    fn close(&mut self) -> io::Result<()> {
        match mem::replace(&mut self.state, GzipState::Closed) {
            GzipState::Reading { source, member, .. } => {
                let reader = match member {
                    Some(decoder) => decoder.into_inner(),
                    None => match source {
                        Some(reader) => reader,
                        None => return Ok(()),
                    },
                };
                reader.into_inner().inner.close()
            }
            GzipState::Writing { mut sink, member } => {
                if let Some(encoder) = member {
                    let compressed = encoder.finish()?;
                    write_all(&mut *sink, &compressed)?;
                }
                sink.close()
            }
            GzipState::Closed => Ok(()),
        }
    }

    fn block_compressed(&self) -> bool {
        true
    }

    fn begin_member(&mut self) -> io::Result<u64> {
        match &mut self.state {
            GzipState::Writing { sink, member } => {
                // Finish a dangling member before starting the next one.
                let mut flushed = 0;
                if let Some(encoder) = member.take() {
                    let compressed = encoder.finish()?;
                    write_all(&mut **sink, &compressed)?;
                    flushed = compressed.len() as u64;
                }
                *member = Some(GzEncoder::new(Vec::new(), Compression::default()));
                Ok(flushed)
            }
            _ => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "not a write-mode gzip stream",
            )),
        }
    }

    fn end_member(&mut self) -> io::Result<u64> {
        match &mut self.state {
            GzipState::Writing { sink, member } => match member.take() {
                Some(encoder) => {
                    let compressed = encoder.finish()?;
                    write_all(&mut **sink, &compressed)?;
                    Ok(compressed.len() as u64)
                }
                None => Ok(0),
            },
            _ => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "not a write-mode gzip stream",
            )),
        }
    }
}
