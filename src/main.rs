use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tokio::sync::oneshot;

use farmhand::config::AgentConfig;
use farmhand::supervisor::SupervisorOptions;

#[derive(Parser)]
#[command(
    name = "farmhand",
    about = "Build-farm compilation agent",
    version,
    long_about = None
)]
struct Cli {
    /// Config file path (default: $FARMHAND_CONFIG, then /etc/farmhand/farmhand.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Only honor job offers carrying this password
    #[arg(long)]
    password: Option<String>,

    /// Foreground trial run; service flags are not persisted
    #[arg(long)]
    console: bool,

    /// Run worker binaries from the debug directory with -allowdebug
    #[arg(long)]
    super_debug: bool,

    /// Show worker process output even when the offer did not ask for it
    #[arg(long)]
    show_worker_output: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let cfg = match &cli.config {
        Some(path) => AgentConfig::load(path)?,
        None => AgentConfig::load_or_default(),
    };

    // RUST_LOG wins over the configured level.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.logging.level)),
        )
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        console = cli.console,
        "starting farmhand agent"
    );

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown_tx.send(());
        }
    });

    let opts = SupervisorOptions {
        password: cli.password,
        super_debug: cli.super_debug,
        force_show_output: cli.show_worker_output,
    };
    farmhand::serve(cfg, opts, cli.console, shutdown_rx).await
}
