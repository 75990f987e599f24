//! Shared protocol primitives for `audio-stream-server` and `audio-stream-client`.
//!
//! One TCP connection carries a strictly serialized sequence of requests:
//!
//! | Direction | Message | Layout |
//! |---|---|---|
//! | C→S | list request | `"LIST\r\n"` |
//! | S→C | list response | N lines `"<index>:<name>\r\n"`, the index 0 line is sent last |
//! | C→S | stream request | `"STREAM\r\n"` + u32 BE file index |
//! | S→C | stream response | u32 BE total size, then exactly that many raw bytes |
//!
//! The receiver of a list response has no count or terminator to go by: the index 0 line
//! doubles as the end-of-list marker, so senders must keep emitting it last.

mod error;
pub mod frame;
pub mod list;
#[cfg(unix)]
pub mod readiness;
pub mod request;

pub use error::ProtocolError;
pub use frame::{LineBuffer, extract_frame};
pub use list::{
    ListAssembler, MAX_ENTRY_NAME_LEN, decode_list_response, encode_list_response,
};
pub use request::{Command, Request, read_file_index, read_size_header, write_size_header};
