use std::io;

/// Errors raised while encoding or decoding protocol messages.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("unknown command {0:?}")]
    UnknownCommand(String),

    #[error("file index {index} out of range (catalog holds {len} entries)")]
    IndexOutOfRange { index: u32, len: usize },

    #[error("truncated {what}: expected {expected} bytes, got {got}")]
    Truncated {
        what: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("malformed list entry {0:?}")]
    MalformedListEntry(String),

    #[error("duplicate list entry for index {0}")]
    DuplicateIndex(u32),

    #[error("incomplete listing: {received} entries received, index {missing} missing")]
    IncompleteListing { received: usize, missing: u32 },

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ProtocolError {
    /// True for failures of the underlying connection rather than of the peer's bytes.
    pub fn is_transport(&self) -> bool {
        matches!(self, ProtocolError::Io(_) | ProtocolError::Truncated { .. })
    }
}
