use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use depot::metrics;
use depot::settings::AppConfig;
use depot::state::{default_observers, Registry, State};
use tokio::sync::broadcast;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[clap(version, about)]
/// Application CLI arguments
struct Args {
    /// whether to be verbose
    #[arg(short = 'v')]
    verbose: bool,

    /// path to a TOML config file
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let cfg = AppConfig::load(args.config.as_deref())?;
    depot::trace::init(cfg.logging.format)?;
    if args.verbose {
        info!(?args, ?cfg, "starting depot");
    }

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let metrics = match &cfg.metrics.addr {
        Some(addr) => {
            let addr: SocketAddr = addr.parse()?;
            let m = metrics::init()?;
            let server_metrics = m.clone();
            let rx = shutdown_tx.subscribe();
            tokio::spawn(async move {
                if let Err(e) = metrics::run_metrics_server(addr, server_metrics, rx).await {
                    error!(error = %e, "metrics server failed");
                }
            });
            Some(m)
        }
        None => None,
    };

    let state = State::open_with(&cfg, Registry::standard(), default_observers(), metrics).await?;
    info!(
        backend = ?cfg.database.backend,
        path = %cfg.database.path,
        "depot ready"
    );

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    let _ = shutdown_tx.send(());
    state.close().await?;
    depot::trace::shutdown();
    Ok(())
}
