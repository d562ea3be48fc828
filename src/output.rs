//! Output engine: request staging and vectored writes.
//!
//! Small requests are appended to a stage buffer and leave with the next
//! flush. A request that would overflow the buffer is written together with
//! everything staged before it as one gathered write, borrowing the
//! caller's chunks instead of copying them.
//!
//! # Architecture
//!
//! ```text
//! send_request ─┬─► fits? ──► stage buffer ─────────────┐
//!               │                                       ├─► WriteBatch ─► writev ─► socket
//!               └─► overflow ─► staged bytes + request ─┘
//! ```
//!
//! Partial writes leave the batch positioned at the first unwritten byte;
//! the duty holder keeps calling [`write_batch`] until it is done.

use std::io::{self, IoSlice};

use crate::protocol::pad;
use crate::transport::Stream;

/// Default capacity of the stage buffer.
pub const DEFAULT_OUTPUT_BUFFER_SIZE: usize = 16384;

/// Zero bytes used for padding chunks to 4-byte boundaries.
static PAD: [u8; 3] = [0; 3];

/// Output-side bookkeeping, guarded by the connection lock.
#[derive(Debug)]
pub(crate) struct OutputState {
    /// Highest sequence number assigned.
    pub request: u32,
    /// Highest sequence number whose bytes fully reached the socket.
    pub request_written: u32,
    queue: Vec<u8>,
    capacity: usize,
}

impl OutputState {
    pub fn new(capacity: usize) -> Self {
        Self {
            request: 0,
            request_written: 0,
            queue: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Whether `len` more bytes fit in the stage buffer.
    #[inline]
    pub fn fits(&self, len: usize) -> bool {
        self.queue.len() + len <= self.capacity
    }

    #[inline]
    pub fn has_queued(&self) -> bool {
        !self.queue.is_empty()
    }

    /// Append already padded parts to the stage buffer.
    pub fn append(&mut self, parts: &[&[u8]]) {
        for part in parts {
            self.queue.extend_from_slice(part);
        }
    }

    /// Take the staged bytes for writing.
    pub fn take_queue(&mut self) -> Vec<u8> {
        std::mem::replace(&mut self.queue, Vec::new())
    }

    /// Give a written-out buffer back so its allocation is reused.
    pub fn recycle(&mut self, mut buf: Vec<u8>) {
        if self.queue.is_empty() && buf.capacity() >= self.capacity {
            buf.clear();
            self.queue = buf;
        }
    }
}

/// Split a request into padded parts ready for staging or writing.
///
/// With `big_length`, the extended length word goes right after the
/// 4-byte prefix of `fixed`.
pub(crate) fn request_parts<'a>(
    fixed: &'a [u8],
    big_length: Option<&'a [u8; 4]>,
    tail: &[&'a [u8]],
) -> Vec<&'a [u8]> {
    let mut parts = Vec::with_capacity(3 + tail.len() * 2);
    match big_length {
        Some(length) => {
            parts.push(&fixed[..4]);
            parts.push(&length[..]);
            parts.push(&fixed[4..]);
        }
        None => parts.push(fixed),
    }
    push_pad(&mut parts, fixed.len());
    for chunk in tail {
        parts.push(*chunk);
        push_pad(&mut parts, chunk.len());
    }
    parts.retain(|p| !p.is_empty());
    parts
}

fn push_pad(parts: &mut Vec<&[u8]>, len: usize) {
    let n = pad(len);
    if n > 0 {
        parts.push(&PAD[..n]);
    }
}

/// Bytes on their way to the socket: previously staged bytes followed by
/// the parts of one request.
#[derive(Debug)]
pub(crate) struct WriteBatch<'a> {
    staged: Vec<u8>,
    parts: Vec<&'a [u8]>,
    total: usize,
    written: usize,
}

impl<'a> WriteBatch<'a> {
    pub fn new(staged: Vec<u8>, parts: Vec<&'a [u8]>) -> Self {
        let total = staged.len() + parts.iter().map(|p| p.len()).sum::<usize>();
        Self {
            staged,
            parts,
            total,
            written: 0,
        }
    }

    #[inline]
    pub fn is_done(&self) -> bool {
        self.written >= self.total
    }

    #[cfg(test)]
    pub fn remaining(&self) -> usize {
        self.total - self.written
    }

    /// Record `n` more bytes as written.
    pub fn advance(&mut self, n: usize) {
        self.written = (self.written + n).min(self.total);
    }

    /// Hand the stage buffer back once the batch is done.
    pub fn into_staged(self) -> Vec<u8> {
        self.staged
    }

    /// Slices covering everything not yet written.
    pub fn remaining_slices(&self) -> Vec<IoSlice<'_>> {
        let mut slices = Vec::with_capacity(self.parts.len() + 1);
        let mut offset = 0;
        let chunks = std::iter::once(&self.staged[..]).chain(self.parts.iter().copied());

        for chunk in chunks {
            let start = offset;
            let end = offset + chunk.len();
            offset = end;
            if chunk.is_empty() || self.written >= end {
                continue;
            }
            let skip = self.written.saturating_sub(start);
            slices.push(IoSlice::new(&chunk[skip..]));
        }
        slices
    }
}

/// Write as much of `batch` as the socket takes without blocking.
///
/// Returns `Ok(())` when the batch is done or the socket would block;
/// `EINTR` is retried. Any other failure is returned.
pub(crate) fn write_batch(stream: &Stream, batch: &mut WriteBatch<'_>) -> io::Result<()> {
    while !batch.is_done() {
        let result = {
            let slices = batch.remaining_slices();
            stream.write_vectored(&slices)
        };
        match result {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "write_vectored returned 0",
                ))
            }
            Ok(n) => batch.advance(n),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_request_parts_pads_each_chunk() {
        let fixed = [1u8, 0, 0, 0, 9, 9];
        let tail: [&[u8]; 2] = [b"abc", b"defg"];
        let parts = request_parts(&fixed, None, &tail);

        let total: usize = parts.iter().map(|p| p.len()).sum();
        assert_eq!(total, 8 + 4 + 4);
        let flat: Vec<u8> = parts.concat();
        assert_eq!(&flat[..8], &[1, 0, 0, 0, 9, 9, 0, 0]);
        assert_eq!(&flat[8..12], b"abc\0");
        assert_eq!(&flat[12..], b"defg");
    }

    #[test]
    fn test_request_parts_inserts_big_length() {
        let fixed = [7u8, 1, 0, 0, 5, 5, 5, 5];
        let length = 3u32.to_ne_bytes();
        let parts = request_parts(&fixed, Some(&length), &[]);

        let flat: Vec<u8> = parts.concat();
        assert_eq!(flat.len(), 12);
        assert_eq!(&flat[..4], &[7, 1, 0, 0]);
        assert_eq!(&flat[4..8], &length);
        assert_eq!(&flat[8..], &[5, 5, 5, 5]);
    }

    #[test]
    fn test_output_state_staging() {
        let mut out = OutputState::new(8);
        assert!(out.fits(8));
        out.append(&[&b"abcd"[..]]);
        assert!(out.has_queued());
        assert!(!out.fits(8));

        let taken = out.take_queue();
        assert_eq!(taken, b"abcd");
        assert!(!out.has_queued());

        let mut big = Vec::with_capacity(16);
        big.extend_from_slice(b"xx");
        out.recycle(big);
        assert!(!out.has_queued());
    }

    #[test]
    fn test_remaining_slices_no_skip() {
        let batch = WriteBatch::new(b"stag".to_vec(), vec![&b"hello"[..], &b"!"[..]]);
        let slices = batch.remaining_slices();
        assert_eq!(slices.len(), 3);
        assert_eq!(batch.remaining(), 10);
    }

    #[test]
    fn test_remaining_slices_partial_staged() {
        let mut batch = WriteBatch::new(b"stag".to_vec(), vec![&b"hello"[..]]);
        batch.advance(2);
        let slices = batch.remaining_slices();
        assert_eq!(slices.len(), 2);
        assert_eq!(&*slices[0], b"ag");
        assert_eq!(&*slices[1], b"hello");
    }

    #[test]
    fn test_remaining_slices_skip_into_parts() {
        let mut batch = WriteBatch::new(Vec::new(), vec![&b"abc"[..], &b"defgh"[..]]);
        batch.advance(5);
        let slices = batch.remaining_slices();
        assert_eq!(slices.len(), 1);
        assert_eq!(&*slices[0], b"fgh");

        batch.advance(3);
        assert!(batch.is_done());
        assert!(batch.remaining_slices().is_empty());
    }

    #[test]
    fn test_write_batch_to_socket() {
        let (a, mut b) = UnixStream::pair().unwrap();
        let stream = Stream::from(a);
        let mut batch = WriteBatch::new(b"1234".to_vec(), vec![&b"5678"[..], &b"9"[..]]);

        write_batch(&stream, &mut batch).unwrap();
        assert!(batch.is_done());

        let mut buf = [0u8; 9];
        b.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"123456789");
    }

    #[test]
    fn test_write_batch_stops_on_would_block() {
        let (a, _b) = UnixStream::pair().unwrap();
        let stream = Stream::from(a);
        stream.set_nonblocking(true).unwrap();

        let big = vec![0u8; 8 * 1024 * 1024];
        let mut batch = WriteBatch::new(Vec::new(), vec![&big[..]]);
        write_batch(&stream, &mut batch).unwrap();
        assert!(!batch.is_done());
        assert!(batch.remaining() > 0);
    }
}
