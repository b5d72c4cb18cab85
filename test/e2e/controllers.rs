//! End-to-end tests running the controllers against informer caches.

use std::sync::Arc;
use std::time::Duration;

use dgs_api::{labels, GameServerHealth, LabelSelector, Resource};
use dgs_controller::controllers::{self, CollectionReconciler, GameServerReconciler};
use dgs_controller::events::MemoryRecorder;
use dgs_controller::names::SequentialNameGenerator;
use dgs_controller::portregistry::PortRegistry;
use dgs_controller::state::ControllerContext;
use dgs_controller::status::StatusReporter;
use dgs_controller::store::{Clients, Informer, Informers};
use dgs_controller::testing::{collection, NAMESPACE};
use dgs_reconcile::{BackoffPolicy, Controller, SyncHandler};
use tokio::sync::watch;
use tokio::task::JoinHandle;

const POOL_SIZE: usize = 50;

struct Fleet {
    clients: Clients,
    ports: PortRegistry,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Fleet {
    fn start() -> Self {
        let clients = Clients::in_memory();
        let (ports, _) = PortRegistry::new(22000, 22000 + POOL_SIZE as u16 - 1, &[]).unwrap();
        let informers = Informers::new(&clients);
        let ctx = ControllerContext::new(clients.clone(), informers.listers(), ports.clone())
            .with_recorder(Arc::new(MemoryRecorder::new()))
            .with_names(Arc::new(SequentialNameGenerator::new()));
        let backoff = BackoffPolicy::fixed_curve(Duration::from_millis(1), Duration::from_millis(50));

        let game_servers =
            Controller::with_backoff(GameServerReconciler::new(ctx.clone()), backoff.clone())
                .wait_for_cache(informers.game_servers.synced())
                .wait_for_cache(informers.pods.synced());
        controllers::gameserver::register(&informers, &game_servers.queue(), &ctx);

        let collections = Controller::with_backoff(CollectionReconciler::new(ctx.clone()), backoff)
            .wait_for_cache(informers.collections.synced())
            .wait_for_cache(informers.game_servers.synced());
        controllers::collection::register(&informers, &collections.queue(), &ctx);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tasks = vec![
            spawn_informer(informers.game_servers.clone(), &shutdown_rx),
            spawn_informer(informers.collections.clone(), &shutdown_rx),
            spawn_informer(informers.pods.clone(), &shutdown_rx),
            spawn_controller(game_servers, &shutdown_rx),
            spawn_controller(collections, &shutdown_rx),
        ];

        Self {
            clients,
            ports,
            shutdown_tx,
            tasks,
        }
    }

    async fn stop(self) {
        self.shutdown_tx.send(true).unwrap();
        for task in self.tasks {
            tokio::time::timeout(Duration::from_secs(5), task)
                .await
                .unwrap()
                .unwrap();
        }
        self.ports.stop();
    }
}

fn spawn_informer<K: Resource>(
    informer: Arc<Informer<K>>,
    shutdown_rx: &watch::Receiver<bool>,
) -> JoinHandle<()> {
    let rx = shutdown_rx.clone();
    tokio::spawn(async move { informer.run(rx).await.unwrap() })
}

fn spawn_controller<H: SyncHandler>(
    controller: Controller<H>,
    shutdown_rx: &watch::Receiver<bool>,
) -> JoinHandle<()> {
    let rx = shutdown_rx.clone();
    tokio::spawn(async move { controller.run(2, rx).await.unwrap() })
}

/// Poll `check` until it holds, failing the test after a few seconds.
async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

async fn members(clients: &Clients, col: &str) -> usize {
    clients
        .game_servers
        .list(
            Some(NAMESPACE),
            &LabelSelector::from_label(labels::COLLECTION_NAME, col),
        )
        .await
        .unwrap()
        .len()
}

async fn pods(clients: &Clients) -> usize {
    clients
        .pods
        .list(None, &LabelSelector::everything())
        .await
        .unwrap()
        .len()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_fleet_converges_and_cleans_up() {
    let fleet = Fleet::start();
    let clients = &fleet.clients;

    clients.collections.create(collection("arena", 3)).await.unwrap();

    eventually("three members with pods", || async move {
        members(clients, "arena").await == 3 && pods(clients).await == 3
    })
    .await;

    clients.collections.delete(NAMESPACE, "arena").await.unwrap();

    let ports = &fleet.ports;
    eventually("instances, pods and ports released", || async move {
        let instances = clients
            .game_servers
            .list(None, &LabelSelector::everything())
            .await
            .unwrap();
        instances.is_empty()
            && pods(clients).await == 0
            && ports.available().await.unwrap() == POOL_SIZE
    })
    .await;

    fleet.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_member_is_replaced() {
    let fleet = Fleet::start();
    let clients = &fleet.clients;

    clients.collections.create(collection("arena", 2)).await.unwrap();
    eventually("two members", || async move { members(clients, "arena").await == 2 }).await;

    let victim = clients
        .game_servers
        .list(
            Some(NAMESPACE),
            &LabelSelector::from_label(labels::COLLECTION_NAME, "arena"),
        )
        .await
        .unwrap()
        .remove(0);
    StatusReporter::new(clients.clone())
        .set_server_status(NAMESPACE, &victim.metadata.name, GameServerHealth::Failed)
        .await
        .unwrap();

    eventually("failure counted and slot refilled", || async move {
        let col = clients
            .collections
            .get(NAMESPACE, "arena")
            .await
            .unwrap()
            .unwrap();
        col.status.dgs_times_failed == 1 && members(clients, "arena").await == 2
    })
    .await;

    let detached = clients
        .game_servers
        .get(NAMESPACE, &victim.metadata.name)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(detached.original_collection_name(), Some("arena"));

    fleet.stop().await;
}
