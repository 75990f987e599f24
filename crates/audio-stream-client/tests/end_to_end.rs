use std::io::Read;
use std::net::{SocketAddr, TcpListener};
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use audio_stream_client::connection::{ConnectionOptions, IndexError, ServerConnection};
use audio_stream_client::mux::{MuxOptions, Sink, SinkKind};
use audio_stream_client::shell::{Shell, ShellCommand};
use audio_stream_client::sinks::{PlayerCommand, open_for_write};
use audio_stream_proto::MAX_ENTRY_NAME_LEN;
use audio_stream_server::manager::{Control, ManagerConfig, SessionManager};
use crossbeam_channel::Sender;

struct Server {
    addr: SocketAddr,
    control: Sender<Control>,
    handle: Option<JoinHandle<anyhow::Result<()>>>,
}

impl Server {
    fn start(library: &Path) -> Self {
        Self::start_with(library, ManagerConfig::default().refresh_interval)
    }

    fn start_with(library: &Path, refresh_interval: Duration) -> Self {
        let config = ManagerConfig {
            poll_timeout: Duration::from_millis(20),
            refresh_interval,
            ..ManagerConfig::default()
        };
        let manager =
            SessionManager::bind("127.0.0.1:0".parse().unwrap(), library, config).unwrap();
        let addr = manager.local_addr().unwrap();
        let control = manager.control();
        let handle = std::thread::spawn(move || manager.run());
        Self {
            addr,
            control,
            handle: Some(handle),
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        let _ = self.control.send(Control::Quit);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn options(save_dir: &Path, player: &str, boot_delay: Duration) -> ConnectionOptions {
    ConnectionOptions {
        list_idle_timeout: Duration::from_millis(300),
        response_timeout: Duration::from_secs(2),
        library_dir: save_dir.to_path_buf(),
        player: PlayerCommand::from_command_line(player, boot_delay).unwrap(),
        mux: MuxOptions {
            poll_timeout: Duration::from_millis(50),
            read_chunk: 4096,
            max_buffered: None,
        },
    }
}

fn connect(server: &Server, save_dir: &Path) -> ServerConnection {
    let options = options(save_dir, "cat", Duration::ZERO);
    ServerConnection::connect("127.0.0.1", server.addr.port(), options).unwrap()
}

fn sample(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

fn library_with(files: &[(&str, Vec<u8>)]) -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    for (name, body) in files {
        let path = dir.path().join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, body).unwrap();
    }
    dir
}

#[test]
fn every_file_downloads_byte_identical() {
    let files = vec![
        ("a.wav", sample(5, 1)),
        ("album/b.flac", sample(300_000, 2)),
        ("c.mp3", Vec::new()),
    ];
    let library = library_with(&files);
    let server = Server::start(library.path());
    let saved = tempfile::tempdir().unwrap();

    let mut conn = connect(&server, saved.path());
    let listing = conn.list().unwrap().to_vec();
    assert_eq!(listing, vec!["a.wav", "album/b.flac", "c.mp3"]);

    for (index, (name, body)) in files.iter().enumerate() {
        let report = conn.get(index as u32).unwrap();
        assert_eq!(report.total, body.len() as u64);
        assert_eq!(&std::fs::read(saved.path().join(name)).unwrap(), body);
    }
}

#[test]
fn stream_and_get_feeds_player_and_file() {
    let body = sample(200_000, 9);
    let library = library_with(&[("song.ogg", body.clone())]);
    let server = Server::start(library.path());
    let saved = tempfile::tempdir().unwrap();

    let mut conn = connect(&server, saved.path());
    conn.list().unwrap();
    let report = conn.stream_and_get(0).unwrap();
    assert_eq!(report.delivered, vec![body.len() as u64, body.len() as u64]);
    assert_eq!(std::fs::read(saved.path().join("song.ogg")).unwrap(), body);

    // The connection is still in step with the server afterwards.
    assert_eq!(conn.list().unwrap().len(), 1);
}

#[test]
fn indices_are_checked_before_anything_is_sent() {
    let library = library_with(&[("a.wav", sample(10, 0))]);
    let server = Server::start(library.path());
    let saved = tempfile::tempdir().unwrap();
    let mut conn = connect(&server, saved.path());

    assert_eq!(conn.validate_index(0), Err(IndexError::NoListing));
    conn.list().unwrap();
    assert_eq!(
        conn.validate_index(1),
        Err(IndexError::OutOfRange { index: 1, len: 1 })
    );
    assert!(conn.get(7).is_err());
    assert!(!conn.is_desynchronized());
    assert!(!saved.path().join("a.wav").exists());

    conn.get(0).unwrap();
    assert!(saved.path().join("a.wav").exists());
}

#[test]
fn empty_library_lists_nothing_after_idle_timeout() {
    let library = tempfile::tempdir().unwrap();
    let server = Server::start(library.path());
    let saved = tempfile::tempdir().unwrap();
    let mut conn = connect(&server, saved.path());
    assert!(conn.list().unwrap().is_empty());
    assert!(!conn.is_desynchronized());
}

#[test]
fn shell_recovers_after_a_failed_transfer() {
    let library = library_with(&[("a.wav", sample(100_000, 3))]);
    let server = Server::start(library.path());
    let saved = tempfile::tempdir().unwrap();

    // `true` exits before the transfer starts, so writing to it fails.
    let mut shell = Shell::new(
        "127.0.0.1",
        server.addr.port(),
        options(saved.path(), "true", Duration::from_millis(200)),
    );
    let mut out = Vec::new();
    shell
        .run(
            std::io::Cursor::new("list\nstream 0\nlist\nget 0\nquit\n"),
            &mut out,
        )
        .unwrap();
    let text = String::from_utf8(out).unwrap();

    assert_eq!(text.matches("0: a.wav").count(), 2, "{text}");
    assert!(text.contains("write to playback sink"), "{text}");
    assert!(text.contains("saved 100000 bytes"), "{text}");
    assert_eq!(
        std::fs::read(saved.path().join("a.wav")).unwrap(),
        sample(100_000, 3)
    );
}

#[test]
fn reconnect_forgets_the_listing_of_the_previous_session() {
    let library = library_with(&[("a.wav", sample(10, 1)), ("b.wav", sample(100_000, 2))]);
    let server = Server::start_with(library.path(), Duration::from_millis(50));
    let saved = tempfile::tempdir().unwrap();
    let mut shell = Shell::new(
        "127.0.0.1",
        server.addr.port(),
        options(saved.path(), "true", Duration::from_millis(200)),
    );
    let mut out = Vec::new();
    shell.execute(ShellCommand::List, &mut out).unwrap();
    shell.execute(ShellCommand::Stream(1), &mut out).unwrap();

    std::fs::remove_file(library.path().join("b.wav")).unwrap();
    std::thread::sleep(Duration::from_millis(300));

    let started = Instant::now();
    let mut after = Vec::new();
    shell.execute(ShellCommand::Get(1), &mut after).unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));
    shell.execute(ShellCommand::List, &mut after).unwrap();
    let text = String::from_utf8(after).unwrap();

    assert!(text.contains("not retrieved yet"), "{text}");
    assert!(text.contains("0: a.wav"), "{text}");
    assert!(!text.contains("b.wav"), "{text}");
    assert!(!saved.path().join("b.wav").exists());
}

#[test]
fn silent_server_times_out_and_leaves_connection_desynchronized() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let peer = std::thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        // Swallow requests and never answer.
        let mut sink = [0u8; 64];
        while matches!(stream.read(&mut sink), Ok(n) if n > 0) {}
    });

    let saved = tempfile::tempdir().unwrap();
    let mut conn =
        ServerConnection::connect("127.0.0.1", port, options(saved.path(), "cat", Duration::ZERO))
            .unwrap();
    let (file, _) = open_for_write(saved.path(), "a.wav").unwrap();

    let started = Instant::now();
    let err = conn
        .transfer(0, vec![Sink::new(SinkKind::File, file)])
        .unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(format!("{err:#}").contains("no response"), "{err:#}");
    assert!(conn.is_desynchronized());

    drop(conn);
    peer.join().unwrap();
}

#[test]
fn longest_listable_path_round_trips_and_longer_ones_are_skipped() {
    let component = "d".repeat(200);
    let dirs: PathBuf = std::iter::repeat_n(component.as_str(), 5).collect();
    let dirs = dirs.to_str().unwrap().to_string();
    let file_len = MAX_ENTRY_NAME_LEN - dirs.len() - 1;
    let longest = format!("{dirs}/{}.wav", "f".repeat(file_len - ".wav".len()));
    let too_long = format!("{dirs}/{}.wav", "g".repeat(file_len + 1 - ".wav".len()));
    assert_eq!(longest.len(), MAX_ENTRY_NAME_LEN);

    let body = sample(1000, 4);
    let library = library_with(&[
        (longest.as_str(), body.clone()),
        (too_long.as_str(), body.clone()),
        ("short.wav", sample(3, 5)),
    ]);
    let server = Server::start(library.path());
    let saved = tempfile::tempdir().unwrap();
    let mut conn = connect(&server, saved.path());

    assert_eq!(conn.list().unwrap().to_vec(), vec![longest.clone(), "short.wav".to_string()]);
    conn.get(0).unwrap();
    assert_eq!(std::fs::read(saved.path().join(&longest)).unwrap(), body);
}

#[test]
fn player_that_cannot_start_leaves_no_file_behind() {
    let library = library_with(&[("a.wav", sample(10, 6))]);
    let server = Server::start(library.path());
    let saved = tempfile::tempdir().unwrap();
    let options = options(saved.path(), "/nonexistent/player", Duration::ZERO);
    let mut conn = ServerConnection::connect("127.0.0.1", server.addr.port(), options).unwrap();

    conn.list().unwrap();
    assert!(conn.stream_and_get(0).is_err());
    assert!(!saved.path().join("a.wav").exists());
    assert!(!conn.is_desynchronized());
}
