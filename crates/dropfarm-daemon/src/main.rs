//! `dropfarm` daemon.
//!
//! Loads the fleet configuration, brings every enabled bot up and runs
//! until Ctrl+C, SIGTERM or the last bot stopping.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::mpsc;
use tracing::info;

use dropfarm_core::config::load_global_config;
use dropfarm_core::database::GlobalDatabase;

use dropfarm_daemon::bot::BotContext;
use dropfarm_daemon::platform::sim::{SimPlatform, SimWebSession};
use dropfarm_daemon::platform::{Callback, PlatformClient, WebSession};
use dropfarm_daemon::supervisor::{PlatformFactory, Supervisor, default_data_dir};

#[derive(Parser, Debug)]
#[command(name = "dropfarm-daemon")]
#[command(version, about = "Multi-account card-drop farming daemon")]
struct Args {
    /// Directory with global.json and one <bot>.json per account
    #[arg(long, default_value = "config", env = "DROPFARM_CONFIG_DIR")]
    config_dir: PathBuf,

    /// Directory for bot databases and sentry files (default: <config>/data)
    #[arg(long, env = "DROPFARM_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Log level filter for the daemon (e.g. "info", "debug", "warn")
    #[arg(long, default_value = "info", env = "DROPFARM_LOG_LEVEL")]
    log_level: String,

    /// Output logs as JSON (for structured log aggregation)
    #[arg(long, env = "DROPFARM_LOG_JSON")]
    log_json: bool,
}

/// The bundled offline transport. The real wire protocol ships as an
/// external collaborator implementing the same two traits.
struct OfflinePlatformFactory;

impl PlatformFactory for OfflinePlatformFactory {
    fn build(
        &self,
        _bot_name: &str,
    ) -> (
        Arc<dyn PlatformClient>,
        mpsc::Receiver<Callback>,
        Arc<dyn WebSession>,
    ) {
        let (platform, callbacks) = SimPlatform::new();
        (platform, callbacks, SimWebSession::new())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_filter = format!("dropfarm_daemon={}", args.log_level);
    dropfarm_core::tracing_init::init_tracing(&log_filter, args.log_json);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config_dir = %args.config_dir.display(),
        "Starting dropfarm-daemon"
    );

    let data_dir = args
        .data_dir
        .unwrap_or_else(|| default_data_dir(&args.config_dir));
    std::fs::create_dir_all(&data_dir)?;

    let global_config = load_global_config(&args.config_dir)?;
    let global_db = Arc::new(GlobalDatabase::load(data_dir.join("global.db.json"))?);
    let ctx = BotContext::new(global_config, global_db);

    let supervisor = Supervisor::new(ctx);
    supervisor
        .start_all(&args.config_dir, &data_dir, &OfflinePlatformFactory)
        .await?;

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    let mut exit = supervisor.subscribe_exit();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
        }
        _ = sigterm_future => {
            info!("Received SIGTERM shutdown signal");
        }
        _ = exit.wait_for(|fired| *fired) => {
            info!("All bots stopped");
        }
    }

    supervisor.shutdown().await;
    info!("Daemon stopped");
    Ok(())
}
