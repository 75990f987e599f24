//! One client connection to the server and the requests it can issue.

use std::io;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use audio_stream_proto::{
    LineBuffer, ListAssembler, ProtocolError, Request, read_size_header,
};

use crate::mux::{FdPoller, MuxOptions, Sink, SinkKind, StreamMux, TransferReport};
use crate::sinks::{PlayerCommand, SinkHandle, open_for_write, spawn_player};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum IndexError {
    #[error("Server library is empty or not retrieved yet")]
    NoListing,

    #[error("Invalid file index {index} (listing holds {len} files)")]
    OutOfRange { index: u32, len: usize },
}

#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// How long a listing may go quiet before the entries so far are taken as final.
    pub list_idle_timeout: Duration,
    /// How long to wait for the size header of a stream response.
    pub response_timeout: Duration,
    /// Where `get` and `stream+` save files.
    pub library_dir: PathBuf,
    pub player: PlayerCommand,
    pub mux: MuxOptions,
}

pub struct ServerConnection {
    stream: TcpStream,
    lines: LineBuffer,
    catalog: Vec<String>,
    options: ConnectionOptions,
    desynchronized: bool,
}

impl ServerConnection {
    pub fn connect(host: &str, port: u16, options: ConnectionOptions) -> Result<Self> {
        let addrs: Vec<SocketAddr> = (host, port)
            .to_socket_addrs()
            .with_context(|| format!("resolve {host}:{port}"))?
            .collect();
        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect(addr) {
                Ok(stream) => {
                    stream.set_nodelay(true).ok();
                    tracing::info!(server = %addr, "connected");
                    return Ok(Self {
                        stream,
                        lines: LineBuffer::default(),
                        catalog: Vec::new(),
                        options,
                        desynchronized: false,
                    });
                }
                Err(e) => {
                    tracing::debug!(server = %addr, "connect failed: {e}");
                    last_err = Some(e);
                }
            }
        }
        Err(match last_err {
            Some(e) => anyhow!(e).context(format!("connect {host}:{port}")),
            None => anyhow!("{host}:{port} resolved to no addresses"),
        })
    }

    /// True once a response was cut short, leaving unknown bytes on the socket.
    pub fn is_desynchronized(&self) -> bool {
        self.desynchronized
    }

    /// Fetch the server's listing and keep it for index validation.
    pub fn list(&mut self) -> Result<&[String]> {
        self.desynchronized = true;
        Request::List
            .write_to(&mut self.stream)
            .context("send LIST")?;
        self.stream
            .set_read_timeout(Some(self.options.list_idle_timeout))
            .context("set listing timeout")?;
        let received = self.receive_listing();
        self.stream
            .set_read_timeout(None)
            .context("clear listing timeout")?;
        let entries = received?;

        if !self.lines.is_empty() {
            tracing::warn!(
                bytes = self.lines.len(),
                "discarding unexpected bytes after listing"
            );
            self.lines.clear();
        }
        tracing::debug!(entries = entries.len(), "listing received");
        self.catalog = entries;
        self.desynchronized = false;
        Ok(&self.catalog)
    }

    fn receive_listing(&mut self) -> Result<Vec<String>> {
        let mut assembler = ListAssembler::new();
        loop {
            while let Some(line) = self.lines.next_frame() {
                if assembler.push_line(&line)? {
                    return Ok(assembler.finish()?);
                }
            }
            match self.lines.fill_from(&mut self.stream) {
                Ok(0) => bail!("server closed the connection during listing"),
                Ok(_) => {}
                Err(e) if is_timeout(&e) && assembler.received() == 0 && self.lines.is_empty() => {
                    return Ok(Vec::new());
                }
                Err(e) if is_timeout(&e) => {
                    // Entries arrived but index 0 never did.
                    return Ok(assembler.finish()?);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e).context("read listing"),
            }
        }
    }

    /// Resolve `index` against the last listing without contacting the server.
    pub fn validate_index(&self, index: u32) -> Result<&str, IndexError> {
        if self.catalog.is_empty() {
            return Err(IndexError::NoListing);
        }
        self.catalog
            .get(index as usize)
            .map(String::as_str)
            .ok_or(IndexError::OutOfRange {
                index,
                len: self.catalog.len(),
            })
    }

    /// Save file `index` under the library directory.
    pub fn get(&mut self, index: u32) -> Result<TransferReport> {
        let name = self.validate_index(index)?.to_string();
        let (file, path) = open_for_write(&self.options.library_dir, &name)?;
        tracing::info!(index, path = %path.display(), "saving");
        self.transfer(index, vec![Sink::new(SinkKind::File, file)])
    }

    /// Play file `index` through the external player.
    pub fn stream(&mut self, index: u32) -> Result<TransferReport> {
        self.validate_index(index)?;
        let (pipe, player) = spawn_player(&self.options.player)?;
        let result = self.transfer(index, vec![Sink::new(SinkKind::Playback, pipe)]);
        if let Err(e) = player.wait() {
            tracing::warn!("{e:#}");
        }
        result
    }

    /// Play file `index` and save it at the same time.
    pub fn stream_and_get(&mut self, index: u32) -> Result<TransferReport> {
        let name = self.validate_index(index)?.to_string();
        let (pipe, player) = spawn_player(&self.options.player)?;
        let (file, path) = match open_for_write(&self.options.library_dir, &name) {
            Ok(opened) => opened,
            Err(e) => {
                drop(pipe);
                if let Err(wait_err) = player.wait() {
                    tracing::warn!("{wait_err:#}");
                }
                return Err(e);
            }
        };
        tracing::info!(index, path = %path.display(), "playing and saving");
        let result = self.transfer(
            index,
            vec![
                Sink::new(SinkKind::Playback, pipe),
                Sink::new(SinkKind::File, file),
            ],
        );
        if let Err(e) = player.wait() {
            tracing::warn!("{e:#}");
        }
        result
    }

    /// Request file `index` and drain the response into `sinks`, which are closed on return.
    pub fn transfer(
        &mut self,
        index: u32,
        sinks: Vec<Sink<SinkHandle>>,
    ) -> Result<TransferReport> {
        let sink_fds = sinks.iter().map(|s| s.writer.as_raw_fd()).collect();

        self.desynchronized = true;
        Request::Stream { file_index: index }
            .write_to(&mut self.stream)
            .context("send STREAM")?;
        self.stream
            .set_read_timeout(Some(self.options.response_timeout))
            .context("set response timeout")?;
        let header = read_size_header(&mut self.stream);
        self.stream
            .set_read_timeout(None)
            .context("clear response timeout")?;
        let total = match header {
            Ok(total) => total,
            Err(ProtocolError::Io(e)) if is_timeout(&e) => {
                bail!(
                    "server sent no response to STREAM {index} within {:?}",
                    self.options.response_timeout
                );
            }
            Err(e) => return Err(e).context("read size header"),
        };
        tracing::debug!(index, total, "stream response started");

        let poller = FdPoller::new(self.stream.as_raw_fd(), sink_fds);
        let mut mux = StreamMux::new(&mut self.stream, sinks, poller, self.options.mux.clone())?;
        let report = mux.run(total).context("transfer")?;
        drop(mux);
        self.desynchronized = false;
        tracing::info!(index, bytes = report.total, "transfer complete");
        Ok(report)
    }
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}
