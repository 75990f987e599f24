//! Configuration loading and parsing.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use crate::cli::Args;
use crate::connection::ConnectionOptions;
use crate::mux::MuxOptions;
use crate::sinks::PlayerCommand;

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 34567;
pub const DEFAULT_LIBRARY_DIR: &str = "saved";
pub const DEFAULT_PLAYER: &str = "ffplay -nodisp -autoexit -loglevel quiet -";
pub const DEFAULT_PLAYER_BOOT_DELAY_MS: u64 = 1000;
pub const DEFAULT_POLL_TIMEOUT_MS: u64 = 500;
pub const DEFAULT_READ_CHUNK_SIZE: usize = 64 * 1024;
pub const DEFAULT_LIST_IDLE_TIMEOUT_MS: u64 = 2000;
pub const DEFAULT_RESPONSE_TIMEOUT_MS: u64 = 5000;

/// Client configuration loaded from TOML.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    /// Save directory for `get` and `stream+`.
    pub library_dir: Option<String>,
    /// Player executable.
    pub player: Option<String>,
    /// Arguments for `player`; only used together with it.
    pub player_args: Option<Vec<String>>,
    pub player_boot_delay_ms: Option<u64>,
    pub poll_timeout_ms: Option<u64>,
    pub read_chunk_size: Option<usize>,
    /// Pause socket reads while this many bytes wait for a slow sink.
    pub max_buffered_bytes: Option<usize>,
    pub list_idle_timeout_ms: Option<u64>,
    /// Wait for the size header of a stream response before giving up on the connection.
    pub response_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ResolvedClientConfig {
    pub host: String,
    pub port: u16,
    pub connection: ConnectionOptions,
}

impl ClientConfig {
    /// Load configuration from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let raw =
            std::fs::read_to_string(path).with_context(|| format!("read config {:?}", path))?;
        let cfg = toml::from_str::<ClientConfig>(&raw)
            .with_context(|| format!("parse config {:?}", path))?;
        Ok(cfg)
    }
}

fn player_from(args: &Args, cfg: &ClientConfig, boot_delay: Duration) -> Result<PlayerCommand> {
    if let Some(line) = args.player.as_deref() {
        return PlayerCommand::from_command_line(line, boot_delay);
    }
    match cfg.player.as_deref() {
        Some(program) if cfg.player_args.is_some() => Ok(PlayerCommand {
            program: program.to_string(),
            args: cfg.player_args.clone().unwrap_or_default(),
            boot_delay,
        }),
        Some(line) => PlayerCommand::from_command_line(line, boot_delay),
        None => PlayerCommand::from_command_line(DEFAULT_PLAYER, boot_delay),
    }
}

/// Merge CLI flags over the file config over defaults.
pub fn resolve(args: &Args, cfg: &ClientConfig) -> Result<ResolvedClientConfig> {
    let host = args
        .host
        .clone()
        .or_else(|| cfg.host.clone())
        .unwrap_or_else(|| DEFAULT_HOST.to_string());
    let port = args.port.or(cfg.port).unwrap_or(DEFAULT_PORT);
    let library_dir = args
        .library
        .clone()
        .or_else(|| cfg.library_dir.as_deref().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_LIBRARY_DIR));

    let boot_delay = Duration::from_millis(
        cfg.player_boot_delay_ms
            .unwrap_or(DEFAULT_PLAYER_BOOT_DELAY_MS),
    );
    let player = player_from(args, cfg, boot_delay)?;

    let poll_ms = cfg.poll_timeout_ms.unwrap_or(DEFAULT_POLL_TIMEOUT_MS);
    let read_chunk = cfg.read_chunk_size.unwrap_or(DEFAULT_READ_CHUNK_SIZE);
    let idle_ms = cfg
        .list_idle_timeout_ms
        .unwrap_or(DEFAULT_LIST_IDLE_TIMEOUT_MS);
    let response_ms = cfg
        .response_timeout_ms
        .unwrap_or(DEFAULT_RESPONSE_TIMEOUT_MS);
    if poll_ms == 0 || read_chunk == 0 || idle_ms == 0 || response_ms == 0 {
        bail!("timeouts and read_chunk_size must be greater than zero");
    }
    if cfg.max_buffered_bytes == Some(0) {
        bail!("max_buffered_bytes must be greater than zero when set");
    }

    Ok(ResolvedClientConfig {
        host,
        port,
        connection: ConnectionOptions {
            list_idle_timeout: Duration::from_millis(idle_ms),
            response_timeout: Duration::from_millis(response_ms),
            library_dir,
            player,
            mux: MuxOptions {
                poll_timeout: Duration::from_millis(poll_ms),
                read_chunk,
                max_buffered: cfg.max_buffered_bytes,
            },
        },
    })
}
