//! Byte-stream plumbing between caller-supplied I/O and the demuxer.
//!
//! Callers hand us a [`Callbacks`] implementation (file, memory, any `Read`, or their own).
//! [`ByteStream`] wraps it into a buffered `Read + Seek` that:
//! - tracks the logical byte position itself (so `tell` is only consulted once, at open)
//! - distinguishes a clean end of stream from a read that stops short of the known length
//! - emulates forward seeks on unseekable inputs by reading and discarding
//! - invokes the `close` callback exactly once

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

use tracing::{trace, warn};

/// Smallest read-ahead buffer we accept; anything lower makes EBML header reads thrash.
pub const MIN_READ_BUFFER: usize = 4 * 1024;

/// Caller-supplied I/O operations backing one stream.
///
/// Only `read` is mandatory. A stream is considered seekable when `length` returns `Some` *and*
/// `tell` returns `Some`; `seek` is then expected to work for any offset in `0..=length`.
pub trait Callbacks: Send {
    /// Total stream length in bytes, or `None` if unknown (unseekable).
    fn length(&mut self) -> Option<u64> {
        None
    }

    /// Current byte offset, or `None` if the stream can't report it.
    fn tell(&mut self) -> Option<u64> {
        None
    }

    /// Reposition to an absolute byte offset from the start of the stream.
    fn seek(&mut self, offset: u64) -> io::Result<()> {
        let _ = offset;
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "stream does not support seeking",
        ))
    }

    /// Read up to `buf.len()` bytes. `Ok(0)` means end of stream.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Release the underlying resource. Called exactly once by [`ByteStream`].
    fn close(&mut self) {}
}

/// Callbacks over any seekable reader.
pub struct ReaderCallbacks<R> {
    inner: R,
}

impl<R: Read + Seek + Send> ReaderCallbacks<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }
}

/// Callbacks over a file on disk.
pub type FileCallbacks = ReaderCallbacks<File>;

impl ReaderCallbacks<File> {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        Ok(Self::new(File::open(path)?))
    }
}

impl<R: Read + Seek + Send> Callbacks for ReaderCallbacks<R> {
    fn length(&mut self) -> Option<u64> {
        let current = self.inner.stream_position().ok()?;
        let end = self.inner.seek(SeekFrom::End(0)).ok()?;
        self.inner.seek(SeekFrom::Start(current)).ok()?;
        Some(end)
    }

    fn tell(&mut self) -> Option<u64> {
        self.inner.stream_position().ok()
    }

    fn seek(&mut self, offset: u64) -> io::Result<()> {
        self.inner.seek(SeekFrom::Start(offset)).map(|_| ())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

/// Callbacks over a read-only, forward-only source (stdin, sockets, HTTP bodies).
///
/// Seeking and rewinding a stream opened this way fail with `UnseekableStream`.
pub struct UnseekableCallbacks<R> {
    inner: R,
}

impl<R: Read + Send> UnseekableCallbacks<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }
}

impl<R: Read + Send> Callbacks for UnseekableCallbacks<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

/// Callbacks over a fixed in-memory byte range.
pub struct MemoryCallbacks<B> {
    data: B,
    pos: usize,
}

impl<B: AsRef<[u8]> + Send> MemoryCallbacks<B> {
    pub fn new(data: B) -> Self {
        Self { data, pos: 0 }
    }
}

impl<B: AsRef<[u8]> + Send> Callbacks for MemoryCallbacks<B> {
    fn length(&mut self) -> Option<u64> {
        Some(self.data.as_ref().len() as u64)
    }

    fn tell(&mut self) -> Option<u64> {
        Some(self.pos as u64)
    }

    fn seek(&mut self, offset: u64) -> io::Result<()> {
        let len = self.data.as_ref().len();
        self.pos = usize::try_from(offset).unwrap_or(usize::MAX).min(len);
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let data = self.data.as_ref();
        let remaining = &data[self.pos.min(data.len())..];
        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        self.pos += n;
        Ok(n)
    }
}

/// Buffered `Read + Seek` view over a [`Callbacks`] set.
pub struct ByteStream {
    callbacks: Box<dyn Callbacks>,
    length: Option<u64>,
    seekable: bool,

    // Read-ahead buffer. `buf[cursor..]` holds bytes not yet handed out; the byte at
    // `buf[cursor]` sits at stream offset `raw_position - (buf.len() - cursor)`.
    buf: Vec<u8>,
    cursor: usize,
    capacity: usize,

    // Offset at which the next callback read will land.
    raw_position: u64,

    io_failed: bool,
    closed: bool,
}

impl ByteStream {
    pub fn new(mut callbacks: Box<dyn Callbacks>, buffer_size: usize) -> Self {
        let length = callbacks.length();
        let tell = match length {
            Some(_) => callbacks.tell(),
            None => None,
        };
        if length.is_some() && tell.is_none() {
            warn!("stream reports a length but no position; treating it as unseekable");
        }

        let seekable = length.is_some() && tell.is_some();
        let capacity = buffer_size.max(MIN_READ_BUFFER);
        trace!(?length, seekable, capacity, "byte stream created");

        Self {
            callbacks,
            length,
            seekable,
            buf: Vec::with_capacity(capacity),
            cursor: 0,
            capacity,
            raw_position: tell.unwrap_or(0),
            io_failed: false,
            closed: false,
        }
    }

    /// Total byte length, if the stream is seekable.
    pub fn length(&self) -> Option<u64> {
        if self.seekable { self.length } else { None }
    }

    pub fn is_seekable(&self) -> bool {
        self.seekable
    }

    /// Logical position of the next byte `read` will return.
    pub fn position(&self) -> u64 {
        self.raw_position - self.buffered() as u64
    }

    /// Whether a callback read has ever failed on this stream.
    pub fn io_failed(&self) -> bool {
        self.io_failed
    }

    /// Bytes between the current position and the known end, if the length is known.
    pub fn remaining(&self) -> Option<u64> {
        self.length.map(|len| len.saturating_sub(self.position()))
    }

    /// Invoke the close callback. Later calls (and drop) are no-ops.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.buf.clear();
        self.cursor = 0;
        self.callbacks.close();
    }

    fn buffered(&self) -> usize {
        self.buf.len() - self.cursor
    }

    fn read_raw(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        if self.closed {
            return Err(io::Error::other("stream already closed"));
        }
        if dst.is_empty() {
            return Ok(0);
        }

        loop {
            match self.callbacks.read(dst) {
                Ok(0) => {
                    if let Some(len) = self.length
                        && self.raw_position < len
                    {
                        self.io_failed = true;
                        return Err(io::Error::other(format!(
                            "read returned no data at offset {} of {len}",
                            self.raw_position
                        )));
                    }
                    return Ok(0);
                }
                Ok(n) if n > dst.len() => {
                    self.io_failed = true;
                    return Err(io::Error::other(format!(
                        "read callback reported {n} bytes for a {}-byte buffer",
                        dst.len()
                    )));
                }
                Ok(n) => {
                    self.raw_position += n as u64;
                    return Ok(n);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.io_failed = true;
                    return Err(e);
                }
            }
        }
    }

    fn fill_buf(&mut self) -> io::Result<usize> {
        self.buf.resize(self.capacity, 0);
        self.cursor = 0;

        let mut scratch = std::mem::take(&mut self.buf);
        let res = self.read_raw(&mut scratch);
        let n = *res.as_ref().unwrap_or(&0);
        scratch.truncate(n);
        self.buf = scratch;
        res
    }

    fn skip_forward(&mut self, mut count: u64) -> io::Result<()> {
        while count > 0 {
            if self.buffered() == 0 && self.fill_buf()? == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "end of stream while skipping forward",
                ));
            }
            let step = (self.buffered() as u64).min(count) as usize;
            self.cursor += step;
            count -= step as u64;
        }
        Ok(())
    }

    fn seek_to(&mut self, target: u64) -> io::Result<()> {
        let position = self.position();
        if target == position {
            return Ok(());
        }

        let buf_start = self.raw_position - self.buf.len() as u64;
        if target >= buf_start && target <= self.raw_position {
            self.cursor = (target - buf_start) as usize;
            return Ok(());
        }

        if self.seekable {
            self.callbacks.seek(target).inspect_err(|_| {
                self.io_failed = true;
            })?;
            self.raw_position = target;
            self.buf.clear();
            self.cursor = 0;
            return Ok(());
        }

        if target > position {
            return self.skip_forward(target - position);
        }

        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "cannot seek backwards on an unseekable stream",
        ))
    }
}

impl Read for ByteStream {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }

        if self.buffered() == 0 {
            // Large reads bypass the read-ahead buffer entirely.
            if out.len() >= self.capacity {
                self.buf.clear();
                self.cursor = 0;
                return self.read_raw(out);
            }
            if self.fill_buf()? == 0 {
                return Ok(0);
            }
        }

        let n = self.buffered().min(out.len());
        out[..n].copy_from_slice(&self.buf[self.cursor..self.cursor + n]);
        self.cursor += n;
        Ok(n)
    }
}

impl Seek for ByteStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::Current(delta) => self.position().checked_add_signed(delta),
            SeekFrom::End(delta) => match self.length() {
                Some(len) => len.checked_add_signed(delta),
                None => {
                    return Err(io::Error::new(
                        io::ErrorKind::Unsupported,
                        "stream length is unknown",
                    ));
                }
            },
        };

        let target = target.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "seek to a negative offset")
        })?;
        self.seek_to(target)?;
        Ok(target)
    }
}

impl Drop for ByteStream {
    fn drop(&mut self) {
        self.close();
    }
}
