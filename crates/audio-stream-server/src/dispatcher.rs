//! Per-connection request loop.
//!
//! Reads framed commands off the socket and answers them one at a time: a `LIST` gets the
//! catalog listing, a `STREAM` gets a size header followed by the raw file bytes. Unknown
//! commands and out-of-range indices are logged and skipped; the connection stays usable.

use std::fs::File;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use audio_stream_proto::frame::DEFAULT_CAPACITY;
use audio_stream_proto::request::FILE_INDEX_LEN;
use audio_stream_proto::{
    Command, LineBuffer, encode_list_response, read_file_index, write_size_header,
};

use crate::catalog::Catalog;

/// Tuning for one dispatcher.
#[derive(Clone, Debug)]
pub struct DispatcherConfig {
    /// Fixed capacity of the request line buffer.
    pub request_buffer_size: usize,
    /// Bytes read from disk per socket write while streaming.
    pub stream_chunk_size: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            request_buffer_size: DEFAULT_CAPACITY,
            stream_chunk_size: 64 * 1024,
        }
    }
}

/// What a session did before it ended.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SessionSummary {
    pub lists: u64,
    pub streams: u64,
    pub bytes_streamed: u64,
    pub rejected: u64,
}

pub struct Dispatcher<S> {
    stream: S,
    catalog: Arc<Catalog>,
    requests: LineBuffer,
    config: DispatcherConfig,
    summary: SessionSummary,
}

impl<S: Read + Write> Dispatcher<S> {
    pub fn new(stream: S, catalog: Arc<Catalog>, config: DispatcherConfig) -> Self {
        Self {
            stream,
            catalog,
            requests: LineBuffer::with_capacity(config.request_buffer_size),
            config,
            summary: SessionSummary::default(),
        }
    }

    /// Serve requests until the peer closes the connection.
    ///
    /// Transport failures and file errors end the session with `Err`; the peer cannot
    /// resynchronize once a stream response has been cut short.
    pub fn run(&mut self) -> Result<SessionSummary> {
        loop {
            while let Some(token) = self.requests.next_frame() {
                self.handle(&token)?;
            }
            let n = self
                .requests
                .fill_from(&mut self.stream)
                .context("read request")?;
            if n == 0 {
                if !self.requests.is_empty() {
                    tracing::debug!(
                        leftover = self.requests.len(),
                        "peer closed with a partial request buffered"
                    );
                }
                return Ok(self.summary);
            }
        }
    }

    pub fn into_stream(self) -> S {
        self.stream
    }

    fn handle(&mut self, token: &[u8]) -> Result<()> {
        match Command::parse(token) {
            Ok(Command::List) => self.send_listing(),
            Ok(Command::Stream) => self.serve_stream(),
            Err(e) => {
                tracing::warn!(error = %e, "ignoring request");
                self.summary.rejected += 1;
                Ok(())
            }
        }
    }

    fn send_listing(&mut self) -> Result<()> {
        let response = encode_list_response(self.catalog.entries());
        self.stream
            .write_all(&response)
            .and_then(|_| self.stream.flush())
            .context("write list response")?;
        self.summary.lists += 1;
        tracing::debug!(entries = self.catalog.len(), "sent listing");
        Ok(())
    }

    fn serve_stream(&mut self) -> Result<()> {
        // Index bytes may have arrived in the same read as the command line.
        let prefix = self.requests.take_up_to(FILE_INDEX_LEN);
        let index = read_file_index(&prefix, &mut self.stream).context("read STREAM file index")?;

        let path = match self.catalog.resolve(index) {
            Ok(path) => path,
            Err(e) => {
                tracing::warn!(index, error = %e, "rejecting stream request");
                self.summary.rejected += 1;
                return Ok(());
            }
        };

        let sent = self.send_file(&path)?;
        self.summary.streams += 1;
        self.summary.bytes_streamed += sent;
        tracing::info!(index, path = %path.display(), bytes = sent, "streamed file");
        Ok(())
    }

    fn send_file(&mut self, path: &Path) -> Result<u64> {
        let file = File::open(path).with_context(|| format!("open {:?}", path))?;
        let len = file
            .metadata()
            .with_context(|| format!("stat {:?}", path))?
            .len();
        let total: u32 = len
            .try_into()
            .map_err(|_| anyhow!("{:?} is {len} bytes, too large for the size header", path))?;

        write_size_header(&mut self.stream, total).context("write size header")?;

        let mut reader = file.take(u64::from(total));
        let mut buf = vec![0u8; self.config.stream_chunk_size.max(1)];
        let mut sent = 0u64;
        loop {
            let n = reader
                .read(&mut buf)
                .with_context(|| format!("read {:?}", path))?;
            if n == 0 {
                break;
            }
            self.stream
                .write_all(&buf[..n])
                .context("write file chunk")?;
            sent += n as u64;
        }
        self.stream.flush().context("flush stream response")?;

        if sent != u64::from(total) {
            bail!("{:?} shrank while streaming: sent {sent} of {total} bytes", path);
        }
        Ok(sent)
    }
}

/// Run a dispatcher over an accepted connection, logging its lifecycle.
pub fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    catalog: Arc<Catalog>,
    config: DispatcherConfig,
) -> Result<SessionSummary> {
    tracing::info!(peer = %peer, entries = catalog.len(), "session started");
    let mut dispatcher = Dispatcher::new(stream, catalog, config);
    let result = dispatcher.run();
    match &result {
        Ok(summary) => tracing::info!(
            peer = %peer,
            lists = summary.lists,
            streams = summary.streams,
            bytes = summary.bytes_streamed,
            "client disconnected"
        ),
        Err(e) => tracing::warn!(peer = %peer, "session aborted: {e:#}"),
    }
    result
}
