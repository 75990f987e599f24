//! Audio Stream Client: browses a server's library and plays and/or saves its files.
//!
//! ## Transfers
//! `get`, `stream` and `stream+` all send one `STREAM` request and hand the socket to the
//! [`mux::StreamMux`], which feeds the player pipe, the output file, or both from a single
//! buffer until the declared size has been delivered.

pub mod cli;
pub mod config;
pub mod connection;
pub mod mux;
pub mod shell;
pub mod sinks;
