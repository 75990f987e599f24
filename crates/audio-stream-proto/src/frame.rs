//! CRLF line framing over an accumulating byte stream.
//!
//! Both ends read whatever the socket hands them into a [`LineBuffer`] owned by the
//! connection, then peel complete tokens off the front with [`LineBuffer::next_frame`].
//! Bytes that trail a token (e.g. the binary file index after `STREAM\r\n`) stay buffered
//! for the caller to claim with [`LineBuffer::take_up_to`].

use std::io::{self, Read};

use bytes::{Buf, BytesMut};

/// Token terminator.
pub const DELIMITER: &[u8; 2] = b"\r\n";

/// Default fixed capacity for request/response line buffers.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Split one delimiter-terminated token off the front of `buf`.
///
/// On success the token is returned without its delimiter and `buf` is left holding only the
/// bytes that followed the delimiter. Returns `None` when `buf` holds no complete token; the
/// caller must append more bytes after the existing ones and retry.
pub fn extract_frame(buf: &mut BytesMut) -> Option<BytesMut> {
    let pos = find_delimiter(buf)?;
    let token = buf.split_to(pos);
    buf.advance(DELIMITER.len());
    Some(token)
}

fn find_delimiter(buf: &[u8]) -> Option<usize> {
    buf.windows(DELIMITER.len()).position(|w| w == DELIMITER)
}

/// Fixed-capacity accumulation buffer for line-framed input.
///
/// If the buffer fills up without ever containing a delimiter, the oldest quarter of it is
/// dropped to make room ("bleeding"). That only happens on malformed or hostile input and
/// loses data.
#[derive(Debug)]
pub struct LineBuffer {
    buf: BytesMut,
    capacity: usize,
    bled: u64,
}

impl LineBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(DELIMITER.len() + 1);
        Self {
            buf: BytesMut::with_capacity(capacity),
            capacity,
            bled: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Total bytes discarded by bleeding since creation.
    pub fn bled_bytes(&self) -> u64 {
        self.bled
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Extract the next complete token, if one is buffered.
    pub fn next_frame(&mut self) -> Option<BytesMut> {
        extract_frame(&mut self.buf)
    }

    /// Remove and return up to `n` leading bytes.
    pub fn take_up_to(&mut self, n: usize) -> BytesMut {
        let n = n.min(self.buf.len());
        self.buf.split_to(n)
    }

    /// Append bytes that were obtained elsewhere, bleeding if the capacity is exceeded.
    pub fn push(&mut self, mut bytes: &[u8]) {
        while !bytes.is_empty() {
            if self.buf.len() >= self.capacity {
                self.bleed();
            }
            let room = self.capacity - self.buf.len();
            let take = room.min(bytes.len());
            self.buf.extend_from_slice(&bytes[..take]);
            bytes = &bytes[take..];
        }
    }

    /// Perform one `read` from `reader`, appending after the unconsumed bytes.
    ///
    /// Returns the byte count from the underlying read, so `Ok(0)` means end of stream.
    /// Callers must extract every complete frame before calling this again.
    pub fn fill_from<R: Read>(&mut self, reader: &mut R) -> io::Result<usize> {
        if self.buf.len() >= self.capacity {
            if find_delimiter(&self.buf).is_some() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "complete frame pending; extract it before reading more",
                ));
            }
            self.bleed();
        }

        let start = self.buf.len();
        self.buf.resize(self.capacity, 0);
        match reader.read(&mut self.buf[start..]) {
            Ok(n) => {
                self.buf.truncate(start + n);
                Ok(n)
            }
            Err(e) => {
                self.buf.truncate(start);
                Err(e)
            }
        }
    }

    fn bleed(&mut self) {
        let drop = (self.capacity / 4).max(1).min(self.buf.len());
        tracing::warn!(
            capacity = self.capacity,
            dropped = drop,
            "line buffer filled without a delimiter; dropping oldest bytes"
        );
        self.buf.advance(drop);
        self.bled += drop as u64;
    }
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}
