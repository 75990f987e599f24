use anyhow::{Context, Result};
use audio_stream_client::{cli, config, shell::Shell, sinks};
use clap::Parser;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let args = cli::Args::parse();
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,audio_stream_client=info")
        }))
        .init();

    let file_cfg = match args.config.as_deref() {
        Some(path) => config::ClientConfig::load(path)?,
        None => config::ClientConfig::default(),
    };
    let resolved = config::resolve(&args, &file_cfg)?;

    ctrlc::set_handler(|| {
        sinks::stop_live_players();
        std::process::exit(130);
    })
    .context("install Ctrl-C handler")?;

    let mut shell = Shell::new(resolved.host, resolved.port, resolved.connection);
    shell.connect()?;
    let stdin = std::io::stdin();
    shell.run(stdin.lock(), std::io::stdout())
}
