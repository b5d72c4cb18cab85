//! Dedicated game server fleet controller.
//!
//! Runs the instance, collection and autoscaler controllers against an
//! in-memory object store seeded from a manifest.

use std::sync::Arc;

use anyhow::Result;
use dgs_api::{LabelSelector, Resource};
use dgs_controller::{
    config,
    controllers::{self, AutoscalerReconciler, CollectionReconciler, GameServerReconciler},
    manifest::Manifest,
    portregistry::PortRegistry,
    state::ControllerContext,
    store::{Clients, Informer, Informers},
};
use dgs_reconcile::{Controller, SyncHandler};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = config::Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to DGS_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting dedicated game server controller");
    info!(
        namespace = %config.namespace,
        min_port = config.min_port,
        max_port = config.max_port,
        "Configuration loaded"
    );

    let clients = Clients::in_memory();
    if let Some(path) = &config.seed_manifest {
        if let Err(e) = Manifest::from_file(path)?.apply(&clients).await {
            error!(error = %e, "Failed to apply seed manifest");
            return Err(e);
        }
    }

    // Create shutdown channel for graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Seed the port pool from instances that already hold host ports
    let existing = clients
        .game_servers
        .list(Some(&config.namespace), &LabelSelector::everything())
        .await?;
    let (ports, ports_task) = PortRegistry::new(config.min_port, config.max_port, &existing)?;

    let informers = Informers::new(&clients);
    let ctx = ControllerContext::new(clients.clone(), informers.listers(), ports.clone())
        .with_callbacks(config.callbacks.clone());

    let game_servers = Controller::new(GameServerReconciler::new(ctx.clone()))
        .wait_for_cache(informers.game_servers.synced())
        .wait_for_cache(informers.pods.synced())
        .wait_for_cache(informers.nodes.synced());
    controllers::gameserver::register(&informers, &game_servers.queue(), &ctx);

    let collections = Controller::new(CollectionReconciler::new(ctx.clone()))
        .wait_for_cache(informers.collections.synced())
        .wait_for_cache(informers.game_servers.synced());
    controllers::collection::register(&informers, &collections.queue(), &ctx);

    let autoscaler = Controller::new(AutoscalerReconciler::new(ctx.clone()))
        .wait_for_cache(informers.collections.synced())
        .wait_for_cache(informers.game_servers.synced());
    controllers::autoscaler::register(&informers, &autoscaler.queue());

    // Start informers after every handler is registered so none misses the initial list
    let informer_handles = vec![
        spawn_informer("game-servers", informers.game_servers.clone(), &shutdown_rx),
        spawn_informer("collections", informers.collections.clone(), &shutdown_rx),
        spawn_informer("pods", informers.pods.clone(), &shutdown_rx),
        spawn_informer("nodes", informers.nodes.clone(), &shutdown_rx),
    ];

    let controller_handles = vec![
        spawn_controller(game_servers, config.workers.game_servers, &shutdown_rx),
        spawn_controller(collections, config.workers.collections, &shutdown_rx),
        spawn_controller(autoscaler, config.workers.autoscaler, &shutdown_rx),
    ];

    // Wait for shutdown signal (Ctrl+C)
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }
    info!("Received shutdown signal");

    // Signal shutdown to all workers
    let _ = shutdown_tx.send(true);

    info!("Waiting for controllers to shut down...");
    for handle in controller_handles.into_iter().chain(informer_handles) {
        if let Err(e) = tokio::time::timeout(config.shutdown_timeout, handle).await {
            warn!(error = %e, "Worker did not shut down in time");
        }
    }

    // No reconciler can call the registry any more
    ports.stop();
    if let Err(e) = tokio::time::timeout(config.shutdown_timeout, ports_task).await {
        warn!(error = %e, "Port registry did not shut down in time");
    }

    info!("Controller shutdown complete");
    Ok(())
}

fn spawn_informer<K: Resource>(
    name: &'static str,
    informer: Arc<Informer<K>>,
    shutdown_rx: &watch::Receiver<bool>,
) -> JoinHandle<()> {
    let shutdown_rx = shutdown_rx.clone();
    tokio::spawn(async move {
        if let Err(e) = informer.run(shutdown_rx).await {
            error!(informer = name, error = %e, "Informer failed");
        }
    })
}

fn spawn_controller<H: SyncHandler>(
    controller: Controller<H>,
    workers: usize,
    shutdown_rx: &watch::Receiver<bool>,
) -> JoinHandle<()> {
    let shutdown_rx = shutdown_rx.clone();
    tokio::spawn(async move {
        if let Err(e) = controller.run(workers, shutdown_rx).await {
            error!(controller = controller.handler().name(), error = %e, "Controller failed");
        }
    })
}
