//! kilnd: the kiln compile cache daemon.
//!
//! Loads the configuration, opens the artifact store (taking exclusive
//! ownership of the cache root), wires up the dispatcher, and serves framed
//! build requests until interrupted.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use kiln_core::{Clock, ConfigError, DaemonConfig, SystemClock};
use kiln_daemon::{
    CompileBackend, Context, DispatchStats, Dispatcher, LocalBackend, RemoteBackend, Server,
    WorkerPool,
};
use kiln_store::ArtifactStore;

mod error;

use error::CliExitCode;

/// Distributed compile cache daemon.
#[derive(Parser)]
#[command(name = "kilnd")]
#[command(version)]
#[command(about = "Distributed compile cache and build coordinator")]
struct Cli {
    /// Path to the JSON configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Cache root directory; overrides the config file.
    #[arg(long)]
    cache_root: Option<PathBuf>,

    /// Listen address; overrides the config file.
    #[arg(long)]
    listen: Option<String>,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        1 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "configuration error");
            return CliExitCode::Config.into();
        }
    };

    match run(config).await {
        Ok(()) => CliExitCode::Success.into(),
        Err(code) => code.into(),
    }
}

fn load_config(cli: &Cli) -> Result<DaemonConfig, ConfigError> {
    let mut config = match &cli.config {
        Some(path) => DaemonConfig::from_file(path)?,
        None => {
            let root = cli.cache_root.clone().ok_or_else(|| ConfigError::Invalid {
                reason: "either --config or --cache-root is required".into(),
            })?;
            DaemonConfig::new(root)
        }
    };
    if let Some(root) = &cli.cache_root {
        config.cache_root = root.clone();
    }
    if let Some(listen) = &cli.listen {
        config.listen = Some(listen.clone());
    }
    config.validate()?;
    Ok(config)
}

async fn run(config: DaemonConfig) -> Result<(), CliExitCode> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());

    let store = ArtifactStore::open(
        &config.cache_root,
        config.cache_bytes,
        config.compress,
        Arc::clone(&clock),
    )
    .map_err(|e| {
        error!(error = %e, "failed to open artifact store");
        CliExitCode::from(&e)
    })?;

    let local: Arc<dyn CompileBackend> = Arc::new(LocalBackend::new(
        config.local_build_cap_ms.map(Duration::from_millis),
    ));
    let remote: Option<Arc<dyn CompileBackend>> = config.remote_endpoint.as_ref().map(|endpoint| {
        info!(endpoint = %endpoint, "remote builder configured");
        Arc::new(RemoteBackend::new(
            endpoint.clone(),
            Duration::from_millis(config.remote_deadline_ms),
            config.remote_error_threshold,
            config.remote_secret.clone(),
        )) as Arc<dyn CompileBackend>
    });

    let stats = Arc::new(DispatchStats::new());
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::new(store),
        local,
        remote,
        WorkerPool::new(config.workers),
        config.queue_high_watermark,
        Context {
            clock,
            stats: Arc::clone(&stats),
        },
    ));

    let Some(listen) = config.listen.clone() else {
        error!("no listen address configured; nothing to serve");
        return Err(CliExitCode::Config);
    };

    let server = Server::bind(dispatcher, config.remote_secret.clone(), &listen)
        .await
        .map_err(|e| {
            error!(error = %e, listen = %listen, "failed to bind listen address");
            CliExitCode::Io
        })?;
    let shutdown = server.shutdown_handle();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            shutdown.notify_one();
        }
    });

    let result = server.run().await;
    info!(stats = ?stats.snapshot(), "daemon exiting");
    result.map_err(|e| {
        error!(error = %e, "server failed");
        CliExitCode::Io
    })
}
