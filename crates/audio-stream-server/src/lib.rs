//! Audio Stream Server: serves a directory of audio files to `audio-stream-client` over the
//! `LIST`/`STREAM` TCP protocol.
//!
//! - [`catalog`] scans the library into an indexed list of files.
//! - [`dispatcher`] answers one connection's requests.
//! - [`manager`] accepts connections, refreshes the catalog and supervises session threads.

pub mod catalog;
pub mod cli;
pub mod config;
pub mod control;
pub mod dispatcher;
pub mod manager;
