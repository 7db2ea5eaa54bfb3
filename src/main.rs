use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use serde::Serialize;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use windowguard::config::{LoggingConfig, WindowguardConfig};
use windowguard::ratelimit::{Decision, FlushTask, WindowLimiter, WindowSnapshot};
use windowguard::store::{KeyValueStore, MemoryStore, StoreStats};

/// Drive a shared fixed-window limiter from several simulated processes.
#[derive(Debug, Parser)]
#[command(name = "windowguard", version, about)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Total events to submit
    #[arg(short, long, default_value_t = 20)]
    events: u64,

    /// Independent limiter instances sharing the store
    #[arg(short, long, default_value_t = 4)]
    workers: u64,

    /// Override the configured limit
    #[arg(long)]
    limit: Option<u64>,

    /// Run the background flush task while submitting
    #[arg(long)]
    flush: bool,
}

#[derive(Debug, Default, Serialize)]
struct Report {
    allowed: u64,
    denied: u64,
    limit: u64,
    window: WindowSnapshot,
    store: StoreStats,
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.level.as_str()));

    if logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = WindowguardConfig::load(cli.config.as_deref())?;
    if let Some(limit) = cli.limit {
        config.limiter.limit = limit;
    }
    init_tracing(&config.logging);

    info!("Starting Windowguard");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        base_key = %config.limiter.base_key,
        limit = config.limiter.limit,
        interval_secs = config.limiter.interval_secs,
        "Configuration loaded"
    );

    let store = Arc::new(MemoryStore::new());
    let settings = &config.limiter;
    let workers = cli.workers.max(1);

    let limiters = (0..workers)
        .map(|_| {
            let store: Arc<dyn KeyValueStore> = store.clone();
            WindowLimiter::new(
                store,
                settings.base_key.clone(),
                settings.limit,
                settings.interval(),
                settings.flush_interval(),
            )
            .map(|l| {
                Arc::new(
                    l.with_failure_policy(settings.failure_policy)
                        .with_max_cas_retries(settings.max_cas_retries),
                )
            })
        })
        .collect::<windowguard::error::Result<Vec<_>>>()?;

    let flush = if cli.flush {
        Some(FlushTask::spawn(limiters[0].clone())?)
    } else {
        None
    };

    let per_worker = cli.events / workers;
    let extra = cli.events % workers;
    let tasks = limiters.iter().enumerate().map(|(i, limiter)| {
        let limiter = limiter.clone();
        let count = per_worker + u64::from((i as u64) < extra);
        tokio::spawn(async move {
            let mut decisions = Vec::with_capacity(count as usize);
            for _ in 0..count {
                decisions.push(limiter.decide().await);
            }
            decisions
        })
    });

    let mut report = Report {
        limit: settings.limit,
        ..Default::default()
    };

    tokio::select! {
        results = futures::future::join_all(tasks) => {
            for decisions in results {
                for decision in decisions? {
                    match decision {
                        Decision::Allowed => report.allowed += 1,
                        Decision::Denied => report.denied += 1,
                    }
                }
            }
        }
        _ = shutdown_signal() => {
            warn!("Interrupted before all events were submitted");
        }
    }

    if let Some(handle) = flush {
        handle.shutdown().await;
    }

    report.window = limiters[0].snapshot().await?;
    report.store = store.stats();
    println!("{}", serde_json::to_string_pretty(&report)?);

    info!("Windowguard stopped");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
