//! Configuration loading and parsing.
//!
//! Settings come from three layers: command-line flags, an optional TOML file, then built-in
//! defaults.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use crate::cli::Args;
use crate::dispatcher::DispatcherConfig;
use crate::manager::ManagerConfig;

pub const DEFAULT_PORT: u16 = 34567;
pub const DEFAULT_LIBRARY_DIR: &str = "library";
pub const DEFAULT_REFRESH_INTERVAL_MS: u64 = 30_000;
pub const DEFAULT_POLL_TIMEOUT_MS: u64 = 500;
pub const DEFAULT_STREAM_CHUNK_SIZE: usize = 64 * 1024;
pub const DEFAULT_REQUEST_BUFFER_SIZE: usize = 1024;

/// Server configuration loaded from TOML.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Bind address without port.
    pub bind: Option<String>,
    /// Listening port.
    pub port: Option<u16>,
    /// Root of the served library.
    pub library_dir: Option<String>,
    /// Catalog rescan period in milliseconds.
    pub refresh_interval_ms: Option<u64>,
    /// Accept-loop wait bound in milliseconds.
    pub poll_timeout_ms: Option<u64>,
    /// Bytes read from disk per write while streaming.
    pub stream_chunk_size: Option<usize>,
    /// Fixed capacity of each session's request buffer.
    pub request_buffer_size: Option<usize>,
}

/// Fully resolved settings ready to start a manager.
#[derive(Debug, Clone)]
pub struct ResolvedServerConfig {
    pub bind: SocketAddr,
    pub library_dir: PathBuf,
    pub manager: ManagerConfig,
}

impl ServerConfig {
    /// Load configuration from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let raw =
            std::fs::read_to_string(path).with_context(|| format!("read config {:?}", path))?;
        let cfg = toml::from_str::<ServerConfig>(&raw)
            .with_context(|| format!("parse config {:?}", path))?;
        Ok(cfg)
    }
}

/// Merge CLI flags over the file config over defaults.
pub fn resolve(args: &Args, cfg: &ServerConfig) -> Result<ResolvedServerConfig> {
    let ip = match (args.bind, cfg.bind.as_deref()) {
        (Some(ip), _) => ip,
        (None, Some(raw)) => raw
            .trim()
            .parse::<IpAddr>()
            .with_context(|| format!("parse bind {raw}"))?,
        (None, None) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
    };
    let port = args.port.or(cfg.port).unwrap_or(DEFAULT_PORT);

    let library_dir = args
        .library
        .clone()
        .or_else(|| cfg.library_dir.as_deref().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_LIBRARY_DIR));

    let refresh_ms = cfg
        .refresh_interval_ms
        .unwrap_or(DEFAULT_REFRESH_INTERVAL_MS);
    let poll_ms = cfg.poll_timeout_ms.unwrap_or(DEFAULT_POLL_TIMEOUT_MS);
    if poll_ms == 0 {
        bail!("poll_timeout_ms must be greater than zero");
    }
    let stream_chunk_size = positive(
        "stream_chunk_size",
        cfg.stream_chunk_size.unwrap_or(DEFAULT_STREAM_CHUNK_SIZE),
    )?;
    let request_buffer_size = cfg
        .request_buffer_size
        .unwrap_or(DEFAULT_REQUEST_BUFFER_SIZE);
    if request_buffer_size < 16 {
        bail!("request_buffer_size must be at least 16 bytes");
    }

    Ok(ResolvedServerConfig {
        bind: SocketAddr::new(ip, port),
        library_dir,
        manager: ManagerConfig {
            poll_timeout: Duration::from_millis(poll_ms),
            refresh_interval: Duration::from_millis(refresh_ms),
            dispatcher: DispatcherConfig {
                request_buffer_size,
                stream_chunk_size,
            },
        },
    })
}

fn positive(name: &str, value: usize) -> Result<usize> {
    if value == 0 {
        bail!("{name} must be greater than zero");
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let resolved = resolve(&Args::default(), &ServerConfig::default()).unwrap();
        assert_eq!(resolved.bind, "0.0.0.0:34567".parse().unwrap());
        assert_eq!(resolved.library_dir, PathBuf::from("library"));
        assert_eq!(resolved.manager.refresh_interval, Duration::from_secs(30));
        assert_eq!(resolved.manager.poll_timeout, Duration::from_millis(500));
        assert_eq!(resolved.manager.dispatcher.request_buffer_size, 1024);
    }

    #[test]
    fn cli_flags_override_file_values() {
        let cfg: ServerConfig = toml::from_str(
            r#"
            bind = "127.0.0.1"
            port = 4000
            library_dir = "/srv/music"
            refresh_interval_ms = 1000
            "#,
        )
        .unwrap();
        let args = Args {
            port: Some(5000),
            ..Args::default()
        };
        let resolved = resolve(&args, &cfg).unwrap();
        assert_eq!(resolved.bind, "127.0.0.1:5000".parse().unwrap());
        assert_eq!(resolved.library_dir, PathBuf::from("/srv/music"));
        assert_eq!(resolved.manager.refresh_interval, Duration::from_secs(1));
    }

    #[test]
    fn bad_bind_is_rejected() {
        let cfg = ServerConfig {
            bind: Some("not an address".to_string()),
            ..ServerConfig::default()
        };
        assert!(resolve(&Args::default(), &cfg).is_err());
    }

    #[test]
    fn zero_sizes_are_rejected() {
        let cfg = ServerConfig {
            stream_chunk_size: Some(0),
            ..ServerConfig::default()
        };
        assert!(resolve(&Args::default(), &cfg).is_err());
    }

    #[test]
    fn unknown_keys_fail_to_parse() {
        assert!(toml::from_str::<ServerConfig>("colour = \"blue\"").is_err());
    }

    #[test]
    fn load_reads_file_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.toml");
        std::fs::write(&path, "port = 9000\n").unwrap();
        let cfg = ServerConfig::load(&path).unwrap();
        assert_eq!(cfg.port, Some(9000));
    }
}
