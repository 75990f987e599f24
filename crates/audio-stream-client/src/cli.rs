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
#[command(name = "audio-stream-client", version = VERSION)]
pub struct Args {
    /// Server host name or address (default localhost)
    #[arg(short = 'a', long)]
    pub host: Option<String>,

    /// Server port (default 34567)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Directory that `get` and `stream+` save into (default ./saved)
    #[arg(short, long)]
    pub library: Option<PathBuf>,

    /// Player command line fed through stdin, e.g. "mpv --no-video -"
    #[arg(long)]
    pub player: Option<String>,

    /// Optional TOML config file; command-line flags take precedence over it
    #[arg(long)]
    pub config: Option<PathBuf>,
}
