use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use hp_core::services::config_source::ConfigSource;
use hp_core::services::engine::ReservationEngine;
use hp_core::services::executor_client::{ExecutorClient, HttpExecutorClient};
use hp_core::services::inventory::HostInventory;
use hp_core::services::verifier::ReconciliationVerifier;

const DEFAULT_SYNC_INTERVAL_SECS: u64 = 30;
const DEFAULT_VERIFY_INTERVAL_SECS: u64 = 60;

struct Options {
    repo: String,
    data_dir: PathBuf,
    sync_interval: Duration,
    verify_interval: Duration,
    debug_log: bool,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    let Some(options) = parse_args() else {
        eprintln!(
            "usage: hp-daemon --repo <git-url> [--data-dir <dir>] \
             [--sync-interval <secs>] [--verify-interval <secs>] [--debug]"
        );
        std::process::exit(2);
    };

    let _guard = setup_logging(options.debug_log);

    let token = std::env::var("HOSTPOOL_TOKEN").unwrap_or_else(|_| {
        warn!("HOSTPOOL_TOKEN is not set; executor calls will be unauthenticated");
        String::new()
    });

    std::fs::create_dir_all(&options.data_dir)?;
    let config = Arc::new(ConfigSource::new(
        options.repo.clone(),
        options.data_dir.join("config-repo"),
    ));
    let inventory = Arc::new(HostInventory::new());
    let client: Arc<dyn ExecutorClient> = Arc::new(HttpExecutorClient::new(token)?);
    let engine = Arc::new(ReservationEngine::new(
        config.clone(),
        inventory.clone(),
        client.clone(),
    ));
    let verifier = Arc::new(ReconciliationVerifier::new(
        config.clone(),
        engine.clone(),
        client.clone(),
    ));

    // First sync has no fallback Snapshot, so a failure here is fatal.
    let snapshot = config.sync().await?;
    inventory.reconcile(&snapshot);
    info!(
        version = %snapshot.source_version,
        executors = snapshot.executors.len(),
        hosts = snapshot.hosts.len(),
        "pool initialized"
    );
    probe_executors(&client, &snapshot).await;

    let sync_interval = options.sync_interval;
    let verify_interval = options.verify_interval;

    let sync_task = {
        let config = config.clone();
        let inventory = inventory.clone();
        let engine = engine.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(sync_interval);
            tick.tick().await; // immediate first tick already handled above
            loop {
                tick.tick().await;
                match config.sync().await {
                    Ok(snapshot) => {
                        inventory.clear_sync_error();
                        inventory.reconcile(&snapshot);
                        // New hosts may satisfy queued demand right away.
                        engine.schedule().await;
                    }
                    Err(e) => {
                        warn!(error = %e, "config sync failed; keeping last good snapshot");
                        inventory.record_sync_error(&e);
                    }
                }
            }
        })
    };

    let verify_task = {
        let verifier = verifier.clone();
        let inventory = inventory.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(verify_interval);
            loop {
                tick.tick().await;
                verifier.run_pass().await;
                inventory.sweep();
            }
        })
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
        result = sync_task => error!(?result, "sync loop exited unexpectedly"),
        result = verify_task => error!(?result, "verifier loop exited unexpectedly"),
    }

    Ok(())
}

/// Log-only compatibility handshake against every registry executor.
async fn probe_executors(client: &Arc<dyn ExecutorClient>, snapshot: &hp_core::models::Snapshot) {
    for executor in &snapshot.executors {
        match client.discover(executor).await {
            Ok(report) if report.pool_fingerprint != executor.pool_fingerprint => warn!(
                executor = %executor,
                theirs = %report.pool_fingerprint,
                ours = %executor.pool_fingerprint,
                "executor is enrolled against a different pool"
            ),
            Ok(report) => debug!(executor = %executor, version = %report.version, "discovered"),
            Err(e) => warn!(executor = %executor, error = %e, "discover probe failed"),
        }
    }
}

fn parse_args() -> Option<Options> {
    let args: Vec<String> = std::env::args().collect();

    let value_of = |flag: &str| {
        args.iter()
            .position(|a| a == flag)
            .and_then(|i| args.get(i + 1))
            .cloned()
    };

    let repo = value_of("--repo")?;
    let data_dir = value_of("--data-dir")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(".hostpool"));
    let sync_interval = Duration::from_secs(
        value_of("--sync-interval")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_SYNC_INTERVAL_SECS),
    );
    let verify_interval = Duration::from_secs(
        value_of("--verify-interval")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_VERIFY_INTERVAL_SECS),
    );
    let debug_log = args.iter().any(|a| a == "--debug");

    Some(Options {
        repo,
        data_dir,
        sync_interval,
        verify_interval,
        debug_log,
    })
}

/// Stdout logging by default; `--debug` adds a rolling file in CWD. Returns
/// the appender guard that must stay alive for the program's duration.
fn setup_logging(debug_log: bool) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    if debug_log {
        let file_appender = tracing_appender::rolling::never(".", "hp-daemon.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        tracing_subscriber::fmt()
            .with_writer(non_blocking)
            .with_env_filter(tracing_subscriber::EnvFilter::new("debug"))
            .with_ansi(false)
            .init();
        Some(guard)
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        None
    }
}
