//! Dripline: durable multi-step email chains with engagement branching,
//! adaptive pacing and operator-approved drafts.
//!
//! Main entry point that wires the engine, restores state and starts the
//! wake loop and the HTTP server.

use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use dripline_api::{ApiServer, AppState};
use dripline_chains::demo;
use dripline_chains::{ChainCatalog, ChainOrchestrator, Collaborators, InMemoryStore, WakeLoop};
use dripline_channels::{
    ChannelSnapshot, InteractionLog, OperatorInbox, ProfileTags, SendGridMailer,
    TemplateDraftGenerator,
};
use dripline_core::config::AppConfig;
use dripline_core::event_bus::LogSink;
use dripline_core::{Clock, SystemClock};
use tokio::sync::watch;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "dripline")]
#[command(about = "Durable, engagement-aware email chain engine")]
#[command(version)]
struct Cli {
    /// TOML config file, layered under environment variables
    #[arg(long, env = "DRIPLINE_CONFIG")]
    config: Option<String>,

    /// Node identifier (overrides config)
    #[arg(long, env = "DRIPLINE__NODE_ID")]
    node_id: Option<String>,

    /// HTTP port (overrides config)
    #[arg(long, env = "DRIPLINE__API__HTTP_PORT")]
    http_port: Option<u16>,

    /// Snapshot file for processes and drafts (overrides config)
    #[arg(long, env = "DRIPLINE__STORE__SNAPSHOT_PATH")]
    snapshot_path: Option<String>,

    /// Do not register the demo chains
    #[arg(long, default_value_t = false)]
    no_seed: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dripline=info,tower_http=info".into()),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("Dripline starting up");

    let mut config = AppConfig::load_from(cli.config.as_deref()).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });

    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    if let Some(port) = cli.http_port {
        config.api.http_port = port;
    }
    if let Some(path) = cli.snapshot_path {
        config.store.snapshot_path = Some(path);
    }
    if cli.no_seed {
        config.catalog.seed_demo = false;
    }

    info!(
        node_id = %config.node_id,
        http_port = config.api.http_port,
        snapshot_path = ?config.store.snapshot_path,
        "Configuration loaded"
    );

    // Chain catalog
    let catalog = ChainCatalog::new();
    if let Some(path) = &config.catalog.definitions_path {
        catalog.load_file(path)?;
    }
    if config.catalog.seed_demo {
        let seeded = demo::seed(&catalog, &config.pacing)?;
        info!(chains = seeded, "Demo chains registered");
    }
    if catalog.is_empty() {
        warn!("No chain definitions loaded; enrollments will find no chains");
    }

    // Process store, restored from the last snapshot when configured
    let store = Arc::new(match &config.store.snapshot_path {
        Some(path) => InMemoryStore::load_from(path)?,
        None => InMemoryStore::new(),
    });

    // Collaborators
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let interactions = InteractionLog::shared();
    let mailer = Arc::new(SendGridMailer::new(
        config.email.clone(),
        interactions.clone(),
        clock.clone(),
    ));
    let tags = Arc::new(ProfileTags::new());
    let inbox = Arc::new(OperatorInbox::new());

    // Unsubscribes, suppressions and tags must be back before the first send
    let channels_path = config.store.channels_snapshot_path();
    if let Some(path) = &channels_path {
        ChannelSnapshot::load_from(path)?.restore(&interactions, &mailer, &tags);
    }

    let orchestrator = ChainOrchestrator::new(
        catalog,
        store.clone(),
        Collaborators {
            sender: mailer.clone(),
            event_log: interactions.clone(),
            tags: tags.clone(),
            drafts: Arc::new(TemplateDraftGenerator::default()),
            notifier: inbox.clone(),
        },
        clock,
        &config,
    )
    .with_event_sink(Arc::new(LogSink));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Wake loop
    let wake_loop = WakeLoop::new(
        store.clone(),
        orchestrator.timers(),
        Arc::new(orchestrator.clone()),
        &config.scheduler,
    );
    let wake_handle = tokio::spawn(wake_loop.run(shutdown_rx.clone()));

    // Periodic snapshots
    let snapshot_handle = config.store.snapshot_path.clone().map(|path| {
        let store = store.clone();
        let channels_path = channels_path.clone();
        let (interactions, mailer, tags) = (interactions.clone(), mailer.clone(), tags.clone());
        let mut shutdown = shutdown_rx.clone();
        let every = Duration::from_secs(config.store.snapshot_interval_secs.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = store.save_to(&path) {
                            error!(error = %e, path = %path, "Snapshot write failed");
                        }
                        if let Some(channels_path) = &channels_path {
                            let snapshot = ChannelSnapshot::capture(&interactions, &mailer, &tags);
                            if let Err(e) = snapshot.save_to(channels_path) {
                                error!(error = %e, path = %channels_path, "Channel snapshot write failed");
                            }
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    });

    let api_server = ApiServer::new(
        config.clone(),
        AppState {
            orchestrator,
            mailer: mailer.clone(),
            interactions: interactions.clone(),
            inbox,
            tags: tags.clone(),
            node_id: config.node_id.clone(),
            start_time: Instant::now(),
        },
    );

    if let Err(e) = api_server.start_metrics() {
        error!(error = %e, "Failed to start metrics exporter");
    }

    info!("Dripline is ready to serve traffic");

    let served = api_server
        .start_http(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for shutdown signal");
            }
            info!("Shutdown signal received");
        })
        .await;

    let _ = shutdown_tx.send(true);
    if let Err(e) = wake_handle.await {
        error!(error = %e, "Wake loop task failed");
    }
    if let Some(handle) = snapshot_handle {
        if let Err(e) = handle.await {
            error!(error = %e, "Snapshot task failed");
        }
    }
    if let Some(path) = &config.store.snapshot_path {
        store.save_to(path)?;
        info!(path = %path, processes = store.process_count(), "Final snapshot written");
    }
    if let Some(path) = &channels_path {
        ChannelSnapshot::capture(&interactions, &mailer, &tags).save_to(path)?;
        info!(path = %path, interactions = interactions.len(), "Final channel snapshot written");
    }

    served
}
