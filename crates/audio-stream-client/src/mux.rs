//! Stream multiplexer: drains one stream response from the server into one or two sinks.
//!
//! Bytes are read from the socket once, appended to a single [`FanOutBuffer`], and written
//! out to each sink at whatever pace that sink accepts. Each sink has its own cursor into the
//! buffer; after every pass the prefix that all sinks have consumed is dropped. The loop
//! blocks only in the readiness wait, which is bounded by [`MuxOptions::poll_timeout`].

use std::fmt;
use std::io::{self, Read, Write};
use std::os::fd::RawFd;
use std::time::Duration;

use audio_stream_proto::readiness::{self, Interest as FdInterest, Registration};
use bytes::{Buf, BytesMut};

/// Upper bound on simultaneously active sinks.
pub const MAX_SINKS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkKind {
    Playback,
    File,
}

impl fmt::Display for SinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SinkKind::Playback => f.write_str("playback"),
            SinkKind::File => f.write_str("file"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("no sink is active")]
    NoSinks,

    #[error("{0} sinks requested; at most 2 are supported")]
    TooManySinks(usize),

    #[error("read from server")]
    Source(#[source] io::Error),

    #[error("write to {kind} sink")]
    Sink {
        kind: SinkKind,
        #[source]
        source: io::Error,
    },

    #[error("readiness wait")]
    Poll(#[source] io::Error),

    #[error("server closed the connection after {received} of {expected} bytes")]
    UnexpectedEof { expected: u64, received: u64 },
}

/// One destination of a transfer.
#[derive(Debug)]
pub struct Sink<W> {
    pub kind: SinkKind,
    pub writer: W,
}

impl<W> Sink<W> {
    pub fn new(kind: SinkKind, writer: W) -> Self {
        Self { kind, writer }
    }
}

/// Received bytes not yet written to every sink, plus a write cursor per sink.
///
/// The buffer always spans from the slowest sink's cursor to the newest received byte once
/// [`FanOutBuffer::compact`] has run.
#[derive(Debug)]
pub struct FanOutBuffer {
    buf: BytesMut,
    cursors: Vec<usize>,
}

impl FanOutBuffer {
    pub fn new(sinks: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            cursors: vec![0; sinks],
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn append(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn cursor(&self, slot: usize) -> usize {
        self.cursors[slot]
    }

    /// Bytes the sink in `slot` has not written yet.
    pub fn pending(&self, slot: usize) -> &[u8] {
        &self.buf[self.cursors[slot]..]
    }

    /// Cursor of the sink that has written the least.
    pub fn min_cursor(&self) -> usize {
        self.cursors.iter().copied().min().unwrap_or(0)
    }

    pub fn has_pending(&self, slot: usize) -> bool {
        self.cursors[slot] < self.buf.len()
    }

    /// Record that the sink in `slot` accepted `n` more bytes.
    pub fn consume(&mut self, slot: usize, n: usize) {
        let cursor = &mut self.cursors[slot];
        debug_assert!(*cursor + n <= self.buf.len());
        *cursor = (*cursor + n).min(self.buf.len());
    }

    /// Drop the prefix every sink has written and rebase the cursors.
    ///
    /// Returns the number of bytes dropped.
    pub fn compact(&mut self) -> usize {
        let m = self.min_cursor();
        if m > 0 {
            self.buf.advance(m);
            for cursor in &mut self.cursors {
                *cursor -= m;
            }
        }
        m
    }
}

/// What the loop wants to hear about on the next wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interest {
    pub source: bool,
    pub sinks: Vec<bool>,
}

/// What the wait reported as ready. Flags for things that were not asked about are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Readiness {
    pub source: bool,
    pub sinks: Vec<bool>,
}

pub trait Poller {
    /// Block until something in `interest` is ready or `timeout` elapses.
    fn wait(&mut self, interest: &Interest, timeout: Duration) -> io::Result<Readiness>;
}

/// [`Poller`] over raw descriptors via `poll(2)`.
pub struct FdPoller {
    source: RawFd,
    sinks: Vec<RawFd>,
}

impl FdPoller {
    pub fn new(source: RawFd, sinks: Vec<RawFd>) -> Self {
        Self { source, sinks }
    }
}

impl Poller for FdPoller {
    fn wait(&mut self, interest: &Interest, timeout: Duration) -> io::Result<Readiness> {
        let mut registrations = Vec::with_capacity(1 + self.sinks.len());
        // None for the source, Some(slot) for a sink, one per registration.
        let mut owners = Vec::with_capacity(1 + self.sinks.len());
        if interest.source {
            registrations.push(Registration {
                fd: self.source,
                interest: FdInterest::Read,
            });
            owners.push(None);
        }
        for (slot, &fd) in self.sinks.iter().enumerate() {
            if interest.sinks.get(slot).copied().unwrap_or(false) {
                registrations.push(Registration {
                    fd,
                    interest: FdInterest::Write,
                });
                owners.push(Some(slot));
            }
        }

        let ready = readiness::wait(&registrations, timeout)?;
        let mut out = Readiness {
            source: false,
            sinks: vec![false; self.sinks.len()],
        };
        for (owner, is_ready) in owners.into_iter().zip(ready) {
            match owner {
                None => out.source = is_ready,
                Some(slot) => out.sinks[slot] = is_ready,
            }
        }
        Ok(out)
    }
}

#[derive(Debug, Clone)]
pub struct MuxOptions {
    pub poll_timeout: Duration,
    /// Largest single read from the socket.
    pub read_chunk: usize,
    /// Stop reading the socket while this many bytes are buffered. `None` never stops.
    pub max_buffered: Option<usize>,
}

impl Default for MuxOptions {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_millis(500),
            read_chunk: 64 * 1024,
            max_buffered: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferReport {
    pub total: u64,
    /// Bytes written to each sink, in sink order.
    pub delivered: Vec<u64>,
    pub reads: u64,
    pub idle_waits: u64,
    pub peak_buffered: usize,
}

pub struct StreamMux<R, W, P> {
    source: R,
    sinks: Vec<Sink<W>>,
    poller: P,
    options: MuxOptions,
}

impl<R: Read, W: Write, P: Poller> StreamMux<R, W, P> {
    pub fn new(
        source: R,
        sinks: Vec<Sink<W>>,
        poller: P,
        options: MuxOptions,
    ) -> Result<Self, TransferError> {
        match sinks.len() {
            0 => return Err(TransferError::NoSinks),
            n if n > MAX_SINKS => return Err(TransferError::TooManySinks(n)),
            _ => {}
        }
        Ok(Self {
            source,
            sinks,
            poller,
            options,
        })
    }

    /// Move exactly `total_size` bytes from the source into every sink.
    ///
    /// Never reads more than `total_size` bytes from the source, so a following response on
    /// the same connection is left untouched. Any error aborts the transfer; sinks keep
    /// whatever they had already accepted.
    pub fn run(&mut self, total_size: u32) -> Result<TransferReport, TransferError> {
        let total = u64::from(total_size);
        let mut report = TransferReport {
            total,
            delivered: vec![0; self.sinks.len()],
            ..TransferReport::default()
        };
        if total == 0 {
            return Ok(report);
        }

        let mut fan = FanOutBuffer::new(self.sinks.len());
        let mut scratch = vec![0u8; self.options.read_chunk.max(1)];
        let mut received = 0u64;
        let mut processed = 0u64;

        while processed < total {
            let outstanding = total - processed - fan.len() as u64;
            let capped = self
                .options
                .max_buffered
                .is_some_and(|cap| fan.len() >= cap);
            let interest = Interest {
                source: outstanding > 0 && !capped,
                sinks: (0..self.sinks.len()).map(|i| fan.has_pending(i)).collect(),
            };

            let ready = self
                .poller
                .wait(&interest, self.options.poll_timeout)
                .map_err(TransferError::Poll)?;
            let mut progressed = false;

            if interest.source && ready.source {
                let want = scratch.len().min(outstanding as usize);
                match self.source.read(&mut scratch[..want]) {
                    Ok(0) => {
                        return Err(TransferError::UnexpectedEof {
                            expected: total,
                            received,
                        });
                    }
                    Ok(n) => {
                        fan.append(&scratch[..n]);
                        received += n as u64;
                        report.reads += 1;
                        report.peak_buffered = report.peak_buffered.max(fan.len());
                        progressed = true;
                    }
                    Err(e) if is_retryable(&e) => {}
                    Err(e) => return Err(TransferError::Source(e)),
                }
            }

            for (slot, sink) in self.sinks.iter_mut().enumerate() {
                let sink_ready = ready.sinks.get(slot).copied().unwrap_or(false);
                if !sink_ready || !fan.has_pending(slot) {
                    continue;
                }
                match sink.writer.write(fan.pending(slot)) {
                    Ok(0) => {
                        return Err(TransferError::Sink {
                            kind: sink.kind,
                            source: io::Error::new(
                                io::ErrorKind::WriteZero,
                                "sink accepted no bytes",
                            ),
                        });
                    }
                    Ok(n) => {
                        fan.consume(slot, n);
                        report.delivered[slot] += n as u64;
                        progressed = true;
                    }
                    Err(e) if is_retryable(&e) => {}
                    Err(e) => {
                        return Err(TransferError::Sink {
                            kind: sink.kind,
                            source: e,
                        });
                    }
                }
            }

            processed += fan.compact() as u64;
            debug_assert_eq!(fan.len() as u64, received - processed);
            debug_assert_eq!(fan.min_cursor(), 0);
            if !progressed {
                report.idle_waits += 1;
            }
        }

        for sink in &mut self.sinks {
            sink.writer.flush().map_err(|source| TransferError::Sink {
                kind: sink.kind,
                source,
            })?;
        }
        tracing::debug!(
            total,
            reads = report.reads,
            peak_buffered = report.peak_buffered,
            idle_waits = report.idle_waits,
            "transfer complete"
        );
        Ok(report)
    }

    pub fn into_parts(self) -> (R, Vec<Sink<W>>) {
        (self.source, self.sinks)
    }
}

fn is_retryable(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}
