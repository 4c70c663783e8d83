//! JetStream Controller
//!
//! Reconciles JetStream CRDs (`jetstream.nats.io/v1beta2`) with a NATS cluster:
//! - Account: connection domain and JetStream account verification
//! - Stream: creates, updates and deletes streams
//! - Consumer: creates, recreates and deletes durable consumers
//! - StreamTemplate: creates and deletes stream templates
//!
//! Runs either the legacy loop (periodic list-all plus change feed) or the
//! managed loop (watch-driven controllers behind leader election).

mod backoff;
mod cache;
mod config;
mod connection;
mod controller;
mod credentials;
mod engine;
mod error;
mod finalizer;
mod health;
mod manager;
mod queue;
mod reconciler;
mod status;
mod watcher;
mod writer;

#[cfg(test)]
mod engine_test;
#[cfg(test)]
mod test_utils;

use crate::backoff::ExponentialBackoff;
use crate::cache::ObjectCache;
use crate::config::{Args, ControllerConfig, LogFormat};
use crate::connection::{ConnectionDomain, ConnectionManager, NatsConnector};
use crate::controller::LegacyLoop;
use crate::credentials::{CredentialStore, KubeSecretReader};
use crate::engine::{Engine, EngineSettings};
use crate::error::ControllerError;
use crate::health::HealthState;
use crate::manager::ManagedLoop;
use crate::watcher::CacheFeeds;
use crate::writer::KubeObjectWriter;
use anyhow::Context;
use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Exit status after SIGINT
const EXIT_INTERRUPTED: u8 = 130;
/// Change events buffered between the cache and the legacy loop
const CHANGE_FEED_CAPACITY: usize = 4096;
/// How long SIGTERM waits for in-flight work
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Signal that ended the process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signal {
    Interrupt,
    Terminate,
}

fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_file(true)
            .with_line_number(true)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            // --help and --version are not errors
            let code = if e.use_stderr() { 1 } else { 0 };
            let _ = e.print();
            return ExitCode::from(code);
        }
    };
    init_logging(args.log_format);

    match run(args).await {
        Ok(code) => code,
        Err(e) => {
            error!("Controller failed: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> anyhow::Result<ExitCode> {
    info!("Starting JetStream Controller v{}", env!("CARGO_PKG_VERSION"));
    let config = args.validate()?;
    log_config(&config);

    if rustls::crypto::ring::default_provider().install_default().is_err() {
        warn!("A rustls crypto provider was already installed");
    }

    // Removed on drop when no cache dir was given
    let (cache_root, _temp_dir) = match &config.cache_dir {
        Some(dir) => {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("creating cache dir {}", dir.display()))?;
            (dir.clone(), None)
        }
        None => {
            let dir = tempfile::tempdir().context("creating temporary cache dir")?;
            (dir.path().to_path_buf(), Some(dir))
        }
    };

    let client = kube::Client::try_default()
        .await
        .context("connecting to the Kubernetes API")?;

    let shutdown = CancellationToken::new();
    let health = Arc::new(HealthState::default());
    health.set_live();
    let health_server = tokio::spawn(health::serve(
        config.health_addr,
        Arc::clone(&health),
        shutdown.child_token(),
    ));

    let connections = Arc::new(ConnectionManager::new(Arc::new(NatsConnector), Arc::clone(&health)));

    if let Some(global) = &config.global {
        let connected = tokio::select! {
            connected = connect_global(&connections, global) => connected,
            signal = wait_for_signal() => {
                return Ok(exit_on_signal(signal?, &shutdown, &connections));
            }
        };
        connected?;
    } else {
        info!("No global connection, every object must reference an Account");
    }

    let cache = Arc::new(ObjectCache::new());
    let engine = Arc::new(Engine::new(
        Arc::clone(&cache),
        Arc::clone(&connections),
        Arc::new(KubeObjectWriter::new(client.clone())),
        Arc::new(CredentialStore::new(
            Arc::new(KubeSecretReader::new(client.clone())),
            cache_root,
        )),
        EngineSettings {
            read_only: config.read_only,
            global: config.global.clone(),
            crd_connect: config.crd_connect,
            ..EngineSettings::default()
        },
    ));
    if config.read_only {
        spawn_dry_run_log(&engine);
    }

    let feeds = CacheFeeds::new(client.clone(), config.namespace.clone(), Arc::clone(&cache));
    let events = (!config.control_loop).then(|| cache.subscribe(CHANGE_FEED_CAPACITY));
    let supervisor = watcher::supervise(feeds.spawn(&shutdown), shutdown.child_token());

    let driver = {
        let shutdown = shutdown.child_token();
        let engine = Arc::clone(&engine);
        let config = config.clone();
        async move {
            match events {
                Some(events) => {
                    LegacyLoop::new(engine, config.cleanup_period, config.workers)
                        .run(events, shutdown)
                        .await
                }
                None => ManagedLoop::new(client, engine, &config).run(shutdown).await,
            }
        }
    };
    let running = async { tokio::try_join!(supervisor, driver).map(|_| ()) };
    tokio::pin!(running);

    let code = tokio::select! {
        result = &mut running => {
            shutdown.cancel();
            result?;
            ExitCode::SUCCESS
        }
        signal = wait_for_signal() => match signal? {
            Signal::Interrupt => exit_on_signal(Signal::Interrupt, &shutdown, &connections),
            Signal::Terminate => {
                info!("Received SIGTERM, shutting down gracefully");
                shutdown.cancel();
                match tokio::time::timeout(SHUTDOWN_GRACE, &mut running).await {
                    Ok(Err(e)) => warn!("Control loop stopped with error during shutdown: {}", e),
                    Ok(Ok(())) => {}
                    Err(_) => warn!("In-flight work did not finish within {:?}", SHUTDOWN_GRACE),
                }
                ExitCode::SUCCESS
            }
        },
    };

    connections.shutdown();
    if let Ok(Err(e)) = health_server.await {
        warn!("Health server stopped with error: {}", e);
    }
    info!("JetStream Controller stopped");
    Ok(code)
}

fn log_config(config: &ControllerConfig) {
    info!("Configuration:");
    info!("  Namespace: {}", config.namespace.as_deref().unwrap_or("all namespaces"));
    match &config.global {
        Some(global) => info!("  Servers: {}", global.servers_display()),
        None => info!("  Servers: none (--crd-connect)"),
    }
    info!("  Control loop: {}", if config.control_loop { "managed" } else { "legacy" });
    info!("  Cleanup period: {:?}", config.cleanup_period);
    info!("  Sync interval: {:?}", config.sync_interval);
    info!("  Workers: {}", config.workers);
    info!("  Read-only: {}", config.read_only);
    info!("  CRD connect: {}", config.crd_connect);
    info!("  Leader election: {}", config.lease.is_some());
}

/// Connect the global domain, retrying while the broker is unreachable
async fn connect_global(
    connections: &ConnectionManager,
    global: &jetstream_client::ConnectionConfig,
) -> anyhow::Result<()> {
    let mut backoff = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(30));
    loop {
        match connections.acquire(&ConnectionDomain::Global, global).await {
            Ok(_) => return Ok(()),
            Err(e @ ControllerError::Auth(_)) => {
                return Err(e).context("global NATS credentials rejected");
            }
            Err(e) if e.is_network() => {
                let delay = backoff.next_backoff();
                warn!("NATS unreachable ({}), retrying in {:?}", e, delay);
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e).context("connecting to NATS"),
        }
    }
}

fn exit_on_signal(signal: Signal, shutdown: &CancellationToken, connections: &ConnectionManager) -> ExitCode {
    shutdown.cancel();
    match signal {
        Signal::Interrupt => {
            warn!("Received SIGINT, exiting");
            connections.shutdown();
            ExitCode::from(EXIT_INTERRUPTED)
        }
        Signal::Terminate => {
            info!("Received SIGTERM, exiting");
            ExitCode::SUCCESS
        }
    }
}

async fn wait_for_signal() -> anyhow::Result<Signal> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                Ok(Signal::Interrupt)
            }
            _ = sigterm.recv() => Ok(Signal::Terminate),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        Ok(Signal::Interrupt)
    }
}

/// Log what read-only mode would have changed
fn spawn_dry_run_log(engine: &Engine) {
    let mut reports = engine.dry_run_reports();
    tokio::spawn(async move {
        loop {
            match reports.recv().await {
                Ok(report) => {
                    let reason = report
                        .status
                        .as_ref()
                        .and_then(|s| s.condition(crds::CONDITION_READY))
                        .map(|c| c.reason.clone())
                        .unwrap_or_default();
                    info!(
                        key = %report.key,
                        operations = ?report.operations,
                        reason = %reason,
                        "read-only: changes not applied"
                    );
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!("read-only report log skipped {} report(s)", n);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}
