//! Request commands and the binary fields that travel with them.

use std::io::{self, Read, Write};

use crate::ProtocolError;

pub const LIST_KEYWORD: &[u8] = b"LIST";
pub const STREAM_KEYWORD: &[u8] = b"STREAM";

/// Width of the big-endian file index that follows `STREAM\r\n`.
pub const FILE_INDEX_LEN: usize = 4;

/// Width of the big-endian total size that opens a stream response.
pub const SIZE_HEADER_LEN: usize = 4;

/// A command keyword as it appears on its own framed line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    List,
    /// The file index is not part of the line; it follows as raw bytes.
    Stream,
}

impl Command {
    pub fn parse(token: &[u8]) -> Result<Self, ProtocolError> {
        match token {
            LIST_KEYWORD => Ok(Command::List),
            STREAM_KEYWORD => Ok(Command::Stream),
            other => Err(ProtocolError::UnknownCommand(
                String::from_utf8_lossy(other).into_owned(),
            )),
        }
    }
}

/// A complete client request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    List,
    Stream { file_index: u32 },
}

impl Request {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Request::List => {
                let mut out = Vec::with_capacity(LIST_KEYWORD.len() + 2);
                out.extend_from_slice(LIST_KEYWORD);
                out.extend_from_slice(crate::frame::DELIMITER);
                out
            }
            Request::Stream { file_index } => {
                let mut out = Vec::with_capacity(STREAM_KEYWORD.len() + 2 + FILE_INDEX_LEN);
                out.extend_from_slice(STREAM_KEYWORD);
                out.extend_from_slice(crate::frame::DELIMITER);
                out.extend_from_slice(&file_index.to_be_bytes());
                out
            }
        }
    }

    /// Send the request in a single write so the index never trails the keyword by a syscall.
    pub fn write_to(&self, mut w: impl Write) -> io::Result<()> {
        w.write_all(&self.encode())?;
        w.flush()
    }
}

/// Write the size header of a stream response.
pub fn write_size_header(mut w: impl Write, total_size: u32) -> io::Result<()> {
    w.write_all(&total_size.to_be_bytes())
}

/// Read the size header of a stream response.
pub fn read_size_header(r: impl Read) -> Result<u32, ProtocolError> {
    let mut b = [0u8; SIZE_HEADER_LEN];
    read_exact_counted(r, &mut b, "size header")?;
    Ok(u32::from_be_bytes(b))
}

/// Complete a file index of which `prefix` (at most 4 bytes) has already been received.
pub fn read_file_index(prefix: &[u8], r: impl Read) -> Result<u32, ProtocolError> {
    if prefix.len() > FILE_INDEX_LEN {
        return Err(ProtocolError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            "file index prefix longer than the index",
        )));
    }
    let mut b = [0u8; FILE_INDEX_LEN];
    b[..prefix.len()].copy_from_slice(prefix);
    read_exact_counted(r, &mut b[prefix.len()..], "file index").map_err(|e| match e {
        ProtocolError::Truncated { what, got, .. } => ProtocolError::Truncated {
            what,
            expected: FILE_INDEX_LEN,
            got: got + prefix.len(),
        },
        other => other,
    })?;
    Ok(u32::from_be_bytes(b))
}

/// `read_exact` that reports how far it got when the stream ends early.
fn read_exact_counted(
    mut r: impl Read,
    buf: &mut [u8],
    what: &'static str,
) -> Result<(), ProtocolError> {
    let mut got = 0usize;
    while got < buf.len() {
        match r.read(&mut buf[got..]) {
            Ok(0) => {
                return Err(ProtocolError::Truncated {
                    what,
                    expected: buf.len(),
                    got,
                });
            }
            Ok(n) => got += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}
