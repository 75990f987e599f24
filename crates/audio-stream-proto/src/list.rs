//! List response encoding and reassembly.

use std::collections::BTreeMap;

use crate::ProtocolError;
use crate::frame::{DEFAULT_CAPACITY, DELIMITER, LineBuffer};

/// Decimal digits in the largest `u32` index.
const MAX_INDEX_DIGITS: usize = 10;

/// Longest entry name whose list line fits a default-capacity [`LineBuffer`] at any index.
pub const MAX_ENTRY_NAME_LEN: usize = DEFAULT_CAPACITY - MAX_INDEX_DIGITS - 1 - DELIMITER.len();

/// Encode a catalog listing, emitting entries from the highest index down so that the
/// index 0 line (the receiver's end-of-list marker) goes out last.
pub fn encode_list_response<S: AsRef<str>>(entries: &[S]) -> Vec<u8> {
    let approx: usize = entries.iter().map(|e| e.as_ref().len() + 8).sum();
    let mut out = Vec::with_capacity(approx);
    for (index, name) in entries.iter().enumerate().rev() {
        out.extend_from_slice(index.to_string().as_bytes());
        out.push(b':');
        out.extend_from_slice(name.as_ref().as_bytes());
        out.extend_from_slice(DELIMITER);
    }
    out
}

/// Parse one `"<index>:<name>"` line (delimiter already stripped).
pub fn parse_list_entry(line: &[u8]) -> Result<(u32, String), ProtocolError> {
    let malformed = || ProtocolError::MalformedListEntry(String::from_utf8_lossy(line).into_owned());

    let colon = line.iter().position(|&b| b == b':').ok_or_else(malformed)?;
    let (index, name) = (&line[..colon], &line[colon + 1..]);
    let index = std::str::from_utf8(index)
        .ok()
        .filter(|s| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()))
        .and_then(|s| s.parse::<u32>().ok())
        .ok_or_else(malformed)?;
    let name = std::str::from_utf8(name).map_err(|_| malformed())?;
    Ok((index, name.to_string()))
}

/// Rebuilds an index-ordered catalog from list lines arriving in any order.
#[derive(Debug, Default)]
pub struct ListAssembler {
    entries: BTreeMap<u32, String>,
    complete: bool,
}

impl ListAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one framed line. Returns `true` once the index 0 entry has arrived.
    pub fn push_line(&mut self, line: &[u8]) -> Result<bool, ProtocolError> {
        let (index, name) = parse_list_entry(line)?;
        if self.entries.insert(index, name).is_some() {
            return Err(ProtocolError::DuplicateIndex(index));
        }
        if index == 0 {
            self.complete = true;
        }
        Ok(self.complete)
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn received(&self) -> usize {
        self.entries.len()
    }

    /// Produce the catalog, indexed `0..n`.
    ///
    /// An assembler that saw no lines at all yields an empty catalog; one that saw lines but
    /// never the index 0 marker, or whose indices have gaps, is an incomplete listing.
    pub fn finish(self) -> Result<Vec<String>, ProtocolError> {
        let received = self.entries.len();
        if !self.complete && received > 0 {
            return Err(ProtocolError::IncompleteListing {
                received,
                missing: 0,
            });
        }
        let mut out = Vec::with_capacity(received);
        for (expected, (index, name)) in self.entries.into_iter().enumerate() {
            if index as usize != expected {
                return Err(ProtocolError::IncompleteListing {
                    received,
                    missing: expected as u32,
                });
            }
            out.push(name);
        }
        Ok(out)
    }
}

/// Decode a complete list response held in memory.
pub fn decode_list_response(bytes: &[u8]) -> Result<Vec<String>, ProtocolError> {
    let mut lines = LineBuffer::with_capacity(bytes.len() + 1);
    lines.push(bytes);
    let mut assembler = ListAssembler::new();
    while let Some(line) = lines.next_frame() {
        if assembler.push_line(&line)? {
            break;
        }
    }
    assembler.finish()
}
