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

use std::cmp::min;
use std::io;

use crate::stream::Stream;

const BUF_SIZE: usize = 64 * 1024;

/// Buffered reader over a [`Stream`] with a revocable byte limit.
///
/// The limit is how record framing is enforced: with a limit of `n` set,
/// `read` and `readline` behave as if the stream ended after `n` more
/// bytes. `consume` fast-forwards without delivering bytes and `tell`
/// counts every byte delivered or skipped, which makes it the logical
/// stream offset for an unbuffered substrate.
pub struct BufferedReader {
    stream: Box<dyn Stream>,
    buf: Vec<u8>,
    pos: usize,
    filled: usize,
    limit: Option<u64>,
    delivered: u64,
    stream_eof: bool,
    closed: bool,
}

impl BufferedReader {
    pub fn new(stream: Box<dyn Stream>) -> Self {
        BufferedReader {
            stream,
            buf: Vec::new(),
            pos: 0,
            filled: 0,
            limit: None,
            delivered: 0,
            stream_eof: false,
            closed: false,
        }
    }

    /// Refill the internal buffer if it is drained.
    /// Returns the number of buffered bytes available.
    fn fill(&mut self) -> io::Result<usize> {
        if self.pos < self.filled {
            return Ok(self.filled - self.pos);
        }
        if self.stream_eof {
            return Ok(0);
        }
        if self.buf.len() != BUF_SIZE {
            self.buf.resize(BUF_SIZE, 0);
        }
        let n = self.stream.read(&mut self.buf)?;
        self.pos = 0;
        self.filled = n;
        if n == 0 {
            self.stream_eof = true;
        }
        Ok(n)
    }

    fn account(&mut self, n: usize) {
        self.delivered += n as u64;
        if let Some(limit) = self.limit.as_mut() {
            *limit -= n as u64;
        }
    }

    /// Read up to `n` bytes, bounded by the active limit.
    pub fn read(&mut self, n: usize) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        while out.len() < n {
            let mut want = n - out.len();
            if let Some(limit) = self.limit {
                want = min(want as u64, limit) as usize;
            }
            if want == 0 || self.fill()? == 0 {
                break;
            }
            let take = min(want, self.filled - self.pos);
            out.extend_from_slice(&self.buf[self.pos..self.pos + take]);
            self.pos += take;
            self.account(take);
        }
        Ok(out)
    }

    /// Read one line including its `\n` terminator.
    ///
    /// Returns an empty buffer at EOF or when the limit is exhausted. A
    /// stream ending without a terminator yields the partial final line.
    pub fn readline(&mut self) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        loop {
            if self.limit == Some(0) || self.fill()? == 0 {
                break;
            }
            let mut end = self.filled;
            if let Some(limit) = self.limit {
                let window = usize::try_from(limit).unwrap_or(usize::MAX);
                end = min(end, self.pos.saturating_add(window));
            }
            match self.buf[self.pos..end].iter().position(|&b| b == b'\n') {
                Some(i) => {
                    out.extend_from_slice(&self.buf[self.pos..self.pos + i + 1]);
                    self.pos += i + 1;
                    self.account(i + 1);
                    break;
                }
                None => {
                    let take = end - self.pos;
                    out.extend_from_slice(&self.buf[self.pos..end]);
                    self.pos = end;
                    self.account(take);
                }
            }
        }
        Ok(out)
    }

    /// Impose a byte limit on subsequent reads.
    pub fn set_limit(&mut self, n: u64) {
        self.limit = Some(n);
    }

    /// Lift the active limit.
    pub fn reset_limit(&mut self) {
        self.limit = None;
    }

    /// Remaining bytes under the active limit, if one is set.
    pub fn limit(&self) -> Option<u64> {
        self.limit
    }

    /// Skip up to `n` bytes without delivering them.
    ///
    /// With `n == None`, skips to the limit, or to EOF if no limit is set.
    /// Returns the number of bytes skipped.
    pub fn consume(&mut self, n: Option<u64>) -> io::Result<u64> {
        let mut target = match (n, self.limit) {
            (Some(n), Some(limit)) => min(n, limit),
            (Some(n), None) => n,
            (None, Some(limit)) => limit,
            (None, None) => u64::MAX,
        };
        let mut skipped = 0u64;
        while target > 0 {
            if self.fill()? == 0 {
                break;
            }
            let take = min(target, (self.filled - self.pos) as u64) as usize;
            self.pos += take;
            self.account(take);
            skipped += take as u64;
            target -= take as u64;
        }
        Ok(skipped)
    }

    /// Total bytes delivered or skipped so far.
    pub fn tell(&self) -> u64 {
        self.delivered
    }

    /// Position reported by the underlying stream.
    ///
    /// For block-compressed substrates this is the compressed start offset
    /// of the member the buffered bytes came from. The internal buffer is
    /// always drained before it is refilled, so it never holds bytes from
    /// more than one stream read and cannot span a member boundary.
    pub fn stream_tell(&mut self) -> io::Result<u64> {
        self.stream.tell()
    }

    /// Whether the underlying stream reports block-boundary positions only.
    pub fn stream_block_compressed(&self) -> bool {
        self.stream.block_compressed()
    }

    pub fn close(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.stream.close()
    }
}

impl Drop for BufferedReader {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
