//! Sink providers: the external player's stdin pipe and files under the save directory.

use std::fs::{self, DirBuilder, File, OpenOptions};
use std::io::{self, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use audio_stream_proto::readiness::set_nonblocking;

/// Mode for a save directory that does not exist yet.
const LIBRARY_DIR_MODE: u32 = 0o700;

/// Pids of players spawned and not yet waited on.
static LIVE_PLAYERS: Mutex<Vec<u32>> = Mutex::new(Vec::new());

fn live_players() -> MutexGuard<'static, Vec<u32>> {
    LIVE_PLAYERS.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Send `SIGTERM` to every player that has not been waited on yet.
///
/// Called from the interrupt handler right before the client exits.
pub fn stop_live_players() {
    let pids = std::mem::take(&mut *live_players());
    for pid in pids {
        terminate(pid);
    }
}

fn terminate(pid: u32) {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: kill(2) takes plain integers; the pid belongs to a child that has not been reaped.
    if unsafe { libc::kill(pid, libc::SIGTERM) } != 0 {
        tracing::debug!(pid, "could not signal player: {}", io::Error::last_os_error());
    }
}

/// A writable endpoint handed to the multiplexer.
#[derive(Debug)]
pub enum SinkHandle {
    Playback(ChildStdin),
    File(File),
}

impl Write for SinkHandle {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            SinkHandle::Playback(pipe) => pipe.write(buf),
            SinkHandle::File(file) => file.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            SinkHandle::Playback(pipe) => pipe.flush(),
            SinkHandle::File(file) => file.flush(),
        }
    }
}

impl AsRawFd for SinkHandle {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            SinkHandle::Playback(pipe) => pipe.as_raw_fd(),
            SinkHandle::File(file) => file.as_raw_fd(),
        }
    }
}

/// How to launch the external player.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerCommand {
    pub program: String,
    pub args: Vec<String>,
    /// Time given to the player to start before bytes are fed to it.
    pub boot_delay: Duration,
}

impl PlayerCommand {
    /// Split a shell-style command line on whitespace. Quoting is not supported.
    pub fn from_command_line(line: &str, boot_delay: Duration) -> Result<Self> {
        let mut parts = line.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| anyhow!("player command is empty"))?;
        Ok(Self {
            program,
            args: parts.collect(),
            boot_delay,
        })
    }
}

/// The running player, waited on once its input has been closed.
#[derive(Debug)]
pub struct PlayerProcess {
    child: Child,
    program: String,
}

impl PlayerProcess {
    /// Wait for the player to exit and log how it went.
    ///
    /// The sink handle must be dropped first, or a player reading to EOF never exits.
    pub fn wait(mut self) -> Result<ExitStatus> {
        let waited = self.child.wait();
        let pid = self.child.id();
        live_players().retain(|&live| live != pid);
        let status = waited.with_context(|| format!("wait for {}", self.program))?;
        match status.code() {
            Some(0) => tracing::info!(player = %self.program, "player exited"),
            Some(code) => tracing::warn!(player = %self.program, code, "player exited with an error"),
            None => tracing::warn!(player = %self.program, "player exited abnormally: {status}"),
        }
        Ok(status)
    }
}

/// Start the player with a non-blocking pipe on its stdin.
pub fn spawn_player(cmd: &PlayerCommand) -> Result<(SinkHandle, PlayerProcess)> {
    let mut child = Command::new(&cmd.program)
        .args(&cmd.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .spawn()
        .with_context(|| format!("spawn player {}", cmd.program))?;
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| anyhow!("player stdin was not piped"))?;
    set_nonblocking(&stdin).context("set player pipe non-blocking")?;
    tracing::debug!(player = %cmd.program, pid = child.id(), "player started");
    live_players().push(child.id());

    if !cmd.boot_delay.is_zero() {
        std::thread::sleep(cmd.boot_delay);
    }
    Ok((
        SinkHandle::Playback(stdin),
        PlayerProcess {
            child,
            program: cmd.program.clone(),
        },
    ))
}

/// Check that a server-supplied name stays inside the save directory.
pub fn validate_relative_path(rel: &str) -> Result<&Path> {
    let path = Path::new(rel);
    if rel.is_empty() {
        bail!("empty file name");
    }
    for component in path.components() {
        match component {
            Component::Normal(_) => {}
            Component::CurDir => {}
            other => bail!("refusing to write {rel:?}: unsupported path component {other:?}"),
        }
    }
    if path.file_name().is_none() {
        bail!("refusing to write {rel:?}: no file name");
    }
    Ok(path)
}

/// Mode bits of the save directory, creating it first if it is missing.
fn library_dir_mode(library_dir: &Path) -> Result<u32> {
    match fs::metadata(library_dir) {
        Ok(meta) if meta.is_dir() => Ok(meta.permissions().mode() & 0o777),
        Ok(_) => bail!("{:?} exists and is not a directory", library_dir),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            DirBuilder::new()
                .recursive(true)
                .mode(LIBRARY_DIR_MODE)
                .create(library_dir)
                .with_context(|| format!("create library dir {:?}", library_dir))?;
            tracing::info!(dir = %library_dir.display(), "created library directory");
            Ok(LIBRARY_DIR_MODE)
        }
        Err(e) => Err(e).with_context(|| format!("stat library dir {:?}", library_dir)),
    }
}

/// Open `library_dir/rel` for writing, truncating any previous copy.
///
/// Missing intermediate directories are created with the same mode as `library_dir`.
pub fn open_for_write(library_dir: &Path, rel: &str) -> Result<(SinkHandle, PathBuf)> {
    let rel_path = validate_relative_path(rel)?;
    let mode = library_dir_mode(library_dir)?;

    let mut dir = library_dir.to_path_buf();
    if let Some(parent) = rel_path.parent() {
        for component in parent.components() {
            dir.push(component);
            match DirBuilder::new().mode(mode).create(&dir) {
                Ok(()) => tracing::debug!(dir = %dir.display(), "created directory"),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists && dir.is_dir() => {}
                Err(e) => return Err(e).with_context(|| format!("create {:?}", dir)),
            }
        }
    }

    let path = library_dir.join(rel_path);
    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o666)
        .open(&path)
        .with_context(|| format!("open {:?} for writing", path))?;
    Ok((SinkHandle::File(file), path))
}
