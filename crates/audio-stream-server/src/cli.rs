use std::net::IpAddr;
use std::path::PathBuf;

use clap::Parser;

const VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("GIT_SHA"),
    ", ",
    env!("BUILD_DATE"),
    ")"
);

#[derive(Parser, Debug, Default)]
#[command(name = "audio-stream-server", version = VERSION)]
pub struct Args {
    /// TCP port to listen on (default 34567)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Address to bind, e.g. 127.0.0.1 (default 0.0.0.0)
    #[arg(long)]
    pub bind: Option<IpAddr>,

    /// Directory whose audio files are served (default ./library)
    #[arg(short, long)]
    pub library: Option<PathBuf>,

    /// Optional TOML config file; command-line flags take precedence over it
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Don't watch stdin for `q`; stop with Ctrl-C only
    #[arg(long)]
    pub no_stdin: bool,
}
