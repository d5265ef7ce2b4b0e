use std::sync::Arc;

use anyhow::Context as _;

mod chat;
mod db;
mod error;
mod fileshare;
mod identity;
mod logging;
mod p2p;
mod rpc;
mod service;
mod settings;

#[derive(clap::Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to the settings file. Created with defaults on first run.
    #[arg(short, long, default_value = "orcanet.json")]
    pub config: std::path::PathBuf,

    /// Log to stdout instead of a file.
    #[arg(short, long)]
    pub log_to_stdout: bool,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use clap::Parser as _;
    let args = Cli::parse();
    let _logging_guard = logging::init(&args);

    let settings = settings::load_settings(&args.config)
        .with_context(|| format!("failed to load settings from {}", args.config.display()))?;
    if settings.relay_address.is_empty() || settings.bootstrap_addresses.is_empty() {
        tracing::warn!(
            "relay or bootstrap addresses are not configured in {}; login will fail until they are",
            args.config.display()
        );
    }

    let db = Arc::new(
        db::Database::open(&settings.database_path)
            .with_context(|| format!("failed to open {}", settings.database_path.display()))?,
    );

    let service = Arc::new(service::P2pService::new(settings.clone(), db));
    rpc::RpcServer::new(service, settings.socket_path.clone())
        .run()
        .await
}
