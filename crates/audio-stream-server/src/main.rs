use anyhow::Result;
use audio_stream_server::{cli, config, control, manager::SessionManager};
use clap::Parser;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let args = cli::Args::parse();
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,audio_stream_server=info")
        }))
        .init();

    let file_cfg = match args.config.as_deref() {
        Some(path) => config::ServerConfig::load(path)?,
        None => config::ServerConfig::default(),
    };
    let resolved = config::resolve(&args, &file_cfg)?;
    tracing::info!(
        bind = %resolved.bind,
        library = %resolved.library_dir.display(),
        "starting server"
    );

    let manager = SessionManager::bind(resolved.bind, &resolved.library_dir, resolved.manager)?;
    control::install_interrupt_handler(manager.control())?;
    if !args.no_stdin {
        control::spawn_operator_input(manager.control())?;
        tracing::info!("press q then enter to stop");
    }
    manager.run()
}
