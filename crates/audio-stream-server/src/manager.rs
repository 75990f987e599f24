//! Accept loop and session bookkeeping.
//!
//! The manager owns the listening socket and the current catalog. Each pass through the loop
//! refreshes the catalog if it is due, waits (bounded) for a pending connection, checks the
//! control channel, and reaps sessions that have finished. Every accepted connection runs on
//! its own thread with the catalog snapshot that was current when it was accepted.

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use audio_stream_proto::readiness::wait_readable;
use crossbeam_channel::{Receiver, Sender, TryRecvError};

use crate::catalog::Catalog;
use crate::dispatcher::{DispatcherConfig, SessionSummary, serve_connection};

#[derive(Clone, Debug)]
pub struct ManagerConfig {
    /// Upper bound on one wait for a pending connection.
    pub poll_timeout: Duration,
    /// How often the library is rescanned.
    pub refresh_interval: Duration,
    pub dispatcher: DispatcherConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_millis(500),
            refresh_interval: Duration::from_millis(30_000),
            dispatcher: DispatcherConfig::default(),
        }
    }
}

/// Requests delivered to a running manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Quit,
}

struct Session {
    id: u64,
    peer: SocketAddr,
    handle: JoinHandle<Result<SessionSummary>>,
}

pub struct SessionManager {
    listener: TcpListener,
    library_dir: PathBuf,
    catalog: Arc<Catalog>,
    config: ManagerConfig,
    sessions: Vec<Session>,
    next_session_id: u64,
    last_refresh: Instant,
    control_tx: Sender<Control>,
    control_rx: Receiver<Control>,
}

impl SessionManager {
    /// Bind the listener and build the initial catalog.
    ///
    /// A library that cannot be scanned at startup is fatal; later refresh failures are not.
    pub fn bind(addr: SocketAddr, library_dir: &Path, config: ManagerConfig) -> Result<Self> {
        let catalog = Catalog::scan(library_dir)
            .with_context(|| format!("initial scan of {:?}", library_dir))?;
        tracing::info!(
            library = %library_dir.display(),
            entries = catalog.len(),
            "catalog loaded"
        );
        if catalog.is_empty() {
            tracing::warn!(library = %library_dir.display(), "library holds no supported files");
        }

        let listener = TcpListener::bind(addr).with_context(|| format!("bind {addr}"))?;
        listener
            .set_nonblocking(true)
            .context("set listener non-blocking")?;
        let (control_tx, control_rx) = crossbeam_channel::unbounded();

        Ok(Self {
            listener,
            library_dir: library_dir.to_path_buf(),
            catalog: Arc::new(catalog),
            config,
            sessions: Vec::new(),
            next_session_id: 1,
            last_refresh: Instant::now(),
            control_tx,
            control_rx,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// A sender for stopping the manager from another thread.
    pub fn control(&self) -> Sender<Control> {
        self.control_tx.clone()
    }

    pub fn catalog(&self) -> Arc<Catalog> {
        Arc::clone(&self.catalog)
    }

    /// Serve until a [`Control::Quit`] arrives, then wait for every session to end.
    pub fn run(mut self) -> Result<()> {
        tracing::info!(
            addr = %self.listener.local_addr().context("listener address")?,
            "accepting connections"
        );

        loop {
            if self.last_refresh.elapsed() >= self.config.refresh_interval {
                self.refresh_catalog();
            }

            match wait_readable(&self.listener, self.config.poll_timeout) {
                Ok(true) => self.accept_pending(),
                Ok(false) => {}
                Err(e) => tracing::warn!("wait on listener failed: {e}"),
            }

            match self.control_rx.try_recv() {
                Ok(Control::Quit) => {
                    tracing::info!("shutdown requested");
                    break;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => {}
            }

            self.reap_finished();
        }

        self.shutdown();
        Ok(())
    }

    /// Rescan the library and publish the result for connections accepted from now on.
    pub fn refresh_catalog(&mut self) {
        self.last_refresh = Instant::now();
        match Catalog::scan(&self.library_dir) {
            Ok(catalog) => {
                if catalog != *self.catalog {
                    tracing::info!(
                        before = self.catalog.len(),
                        after = catalog.len(),
                        "catalog changed"
                    );
                } else {
                    tracing::debug!(entries = catalog.len(), "catalog unchanged");
                }
                self.catalog = Arc::new(catalog);
            }
            Err(e) => {
                tracing::warn!("catalog refresh failed, keeping previous catalog: {e:#}");
            }
        }
    }

    fn accept_pending(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(e) = self.spawn_session(stream, peer) {
                        tracing::warn!(peer = %peer, "could not start session: {e:#}");
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::warn!("accept error: {e}");
                    return;
                }
            }
        }
    }

    fn spawn_session(&mut self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        stream
            .set_nonblocking(false)
            .context("set session socket blocking")?;
        stream.set_nodelay(true).ok();

        let id = self.next_session_id;
        self.next_session_id += 1;
        let catalog = Arc::clone(&self.catalog);
        let config = self.config.dispatcher.clone();
        let handle = std::thread::Builder::new()
            .name(format!("session-{id}"))
            .spawn(move || serve_connection(stream, peer, catalog, config))
            .context("spawn session thread")?;

        self.sessions.push(Session { id, peer, handle });
        tracing::debug!(session = id, active = self.sessions.len(), "session spawned");
        Ok(())
    }

    fn reap_finished(&mut self) {
        let (finished, running): (Vec<_>, Vec<_>) = std::mem::take(&mut self.sessions)
            .into_iter()
            .partition(|s| s.handle.is_finished());
        self.sessions = running;
        for session in finished {
            join_session(session);
        }
    }

    fn shutdown(self) {
        let Self {
            listener, sessions, ..
        } = self;
        drop(listener);
        if !sessions.is_empty() {
            tracing::info!(active = sessions.len(), "waiting for sessions to finish");
        }
        for session in sessions {
            join_session(session);
        }
        tracing::info!("server stopped");
    }
}

fn join_session(session: Session) {
    match session.handle.join() {
        Ok(Ok(_)) => tracing::debug!(session = session.id, peer = %session.peer, "session reaped"),
        Ok(Err(e)) => {
            tracing::warn!(session = session.id, peer = %session.peer, "session ended with error: {e:#}")
        }
        Err(_) => tracing::error!(session = session.id, peer = %session.peer, "session thread panicked"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use audio_stream_proto::{Request, decode_list_response, read_size_header};
    use std::io::{Read, Write};

    fn test_config() -> ManagerConfig {
        ManagerConfig {
            poll_timeout: Duration::from_millis(20),
            refresh_interval: Duration::from_secs(3600),
            dispatcher: DispatcherConfig::default(),
        }
    }

    fn start(
        library: &Path,
        config: ManagerConfig,
    ) -> (SocketAddr, Sender<Control>, JoinHandle<Result<()>>) {
        let manager = SessionManager::bind("127.0.0.1:0".parse().unwrap(), library, config).unwrap();
        let addr = manager.local_addr().unwrap();
        let control = manager.control();
        let handle = std::thread::spawn(move || manager.run());
        (addr, control, handle)
    }

    /// Send LIST and read until the index 0 line arrives.
    fn list(stream: &mut TcpStream) -> Vec<String> {
        Request::List.write_to(&mut *stream).unwrap();
        let mut received = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            stream.read_exact(&mut byte).unwrap();
            received.push(byte[0]);
            if received.ends_with(b"\r\n") {
                let last_line_start = received[..received.len() - 2]
                    .iter()
                    .rposition(|&b| b == b'\n')
                    .map(|p| p + 1)
                    .unwrap_or(0);
                if received[last_line_start..].starts_with(b"0:") {
                    break;
                }
            }
        }
        decode_list_response(&received).unwrap()
    }

    #[test]
    fn serves_list_and_stream_over_tcp() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("a.wav"), b"first").unwrap();
        std::fs::write(root.path().join("b.wav"), b"HELLO").unwrap();
        let (addr, control, handle) = start(root.path(), test_config());

        let mut stream = TcpStream::connect(addr).unwrap();
        assert_eq!(list(&mut stream), vec!["a.wav", "b.wav"]);

        Request::Stream { file_index: 1 }.write_to(&mut stream).unwrap();
        let size = read_size_header(&mut stream).unwrap();
        let mut body = vec![0u8; size as usize];
        stream.read_exact(&mut body).unwrap();
        assert_eq!(body, b"HELLO");

        drop(stream);
        control.send(Control::Quit).unwrap();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn refreshed_catalog_applies_to_new_connections_only() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("a.wav"), b"a").unwrap();
        let config = ManagerConfig {
            refresh_interval: Duration::from_millis(50),
            ..test_config()
        };
        let (addr, control, handle) = start(root.path(), config);

        let mut early = TcpStream::connect(addr).unwrap();
        assert_eq!(list(&mut early), vec!["a.wav"]);

        std::fs::write(root.path().join("b.wav"), b"b").unwrap();
        std::thread::sleep(Duration::from_millis(300));

        let mut late = TcpStream::connect(addr).unwrap();
        assert_eq!(list(&mut late), vec!["a.wav", "b.wav"]);
        assert_eq!(list(&mut early), vec!["a.wav"]);

        drop(early);
        drop(late);
        control.send(Control::Quit).unwrap();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn misbehaving_client_does_not_stop_the_listener() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("a.wav"), b"a").unwrap();
        let (addr, control, handle) = start(root.path(), test_config());

        {
            let mut bad = TcpStream::connect(addr).unwrap();
            bad.write_all(b"STREAM\r\n\x00").unwrap();
        }

        let mut good = TcpStream::connect(addr).unwrap();
        assert_eq!(list(&mut good), vec!["a.wav"]);

        drop(good);
        control.send(Control::Quit).unwrap();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn failed_refresh_keeps_previous_catalog() {
        let root = tempfile::tempdir().unwrap();
        let library = root.path().join("lib");
        std::fs::create_dir(&library).unwrap();
        std::fs::write(library.join("a.wav"), b"a").unwrap();

        let mut manager =
            SessionManager::bind("127.0.0.1:0".parse().unwrap(), &library, test_config()).unwrap();
        std::fs::remove_dir_all(&library).unwrap();
        manager.refresh_catalog();
        assert_eq!(manager.catalog().entries(), &["a.wav"]);
    }

    #[test]
    fn bind_fails_when_library_is_missing() {
        let root = tempfile::tempdir().unwrap();
        let missing = root.path().join("missing");
        let result = SessionManager::bind("127.0.0.1:0".parse().unwrap(), &missing, test_config());
        assert!(result.is_err());
    }

    #[test]
    fn quit_with_no_clients_returns_promptly() {
        let root = tempfile::tempdir().unwrap();
        let (_addr, control, handle) = start(root.path(), test_config());
        control.send(Control::Quit).unwrap();
        handle.join().unwrap().unwrap();
    }
}
