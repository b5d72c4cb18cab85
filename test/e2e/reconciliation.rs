//! Integration tests for collection, instance and autoscaler reconciliation.
//!
//! Each test drives reconcile passes by hand against the in-memory store, the
//! way the controller workers would after the corresponding watch events.

use std::collections::HashSet;

use chrono::Duration;
use dgs_api::{
    AutoScalerDetails, CollectionHealth, DedicatedGameServer, DedicatedGameServerCollection,
    FailBehavior, GameServerHealth, ObjectKey, PodPhase,
};
use dgs_controller::clock::Clock;
use dgs_controller::controllers::autoscaler::ScaleDecision;
use dgs_controller::store;
use dgs_controller::testing::{autoscaled_collection, collection, game_server, Harness, NAMESPACE};

fn key(name: &str) -> ObjectKey {
    ObjectKey::new(NAMESPACE, name)
}

/// Reconcile every instance in the namespace once.
async fn sync_game_servers(h: &Harness) {
    let reconciler = h.game_servers();
    for dgs in h.all_game_servers().await {
        reconciler.reconcile(&key(&dgs.metadata.name)).await.unwrap();
    }
}

async fn update_collection(
    h: &Harness,
    name: &str,
    mutate: impl Fn(&mut DedicatedGameServerCollection) -> bool + Send + Sync,
) {
    store::modify(
        h.clients.collections.as_ref(),
        &key(name),
        &h.ctx.retry,
        mutate,
    )
    .await
    .unwrap();
}

fn scaler(cool_down_in_minutes: u32) -> AutoScalerDetails {
    AutoScalerDetails {
        minimum_replicas: 1,
        maximum_replicas: 10,
        scale_in_threshold: 20,
        scale_out_threshold: 80,
        enabled: true,
        cool_down_in_minutes,
        max_players_per_server: 10,
        last_scale_operation_date_time: None,
    }
}

#[tokio::test]
async fn test_collection_converges_to_replicas() {
    let h = Harness::new();
    h.clients.collections.create(collection("arena", 4)).await.unwrap();

    for _ in 0..3 {
        h.collections().reconcile(&key("arena")).await.unwrap();
        sync_game_servers(&h).await;
    }

    let members = h.members("arena").await;
    assert_eq!(members.len(), 4);
    for dgs in &members {
        assert_eq!(h.pods_of(&dgs.metadata.name).await.len(), 1);
        assert!(dgs.metadata.is_owned_by("DedicatedGameServerCollection", "arena"));
    }
}

#[tokio::test]
async fn test_host_ports_unique_across_collections_and_instances() {
    let h = Harness::with_port_range(21000, 21009);
    h.clients.collections.create(collection("red", 4)).await.unwrap();
    h.clients.collections.create(collection("blue", 4)).await.unwrap();
    h.clients.game_servers.create(game_server("solo")).await.unwrap();

    h.collections().reconcile(&key("red")).await.unwrap();
    h.collections().reconcile(&key("blue")).await.unwrap();
    sync_game_servers(&h).await;

    let ports: Vec<u16> = h
        .all_game_servers()
        .await
        .iter()
        .flat_map(|d| d.exposed_host_ports())
        .collect();
    assert_eq!(ports.len(), 9);
    assert_eq!(ports.iter().collect::<HashSet<_>>().len(), 9);
    assert!(ports.iter().all(|p| (21000..=21009).contains(p)));
    assert_eq!(h.ports.available().await.unwrap(), 1);
}

#[tokio::test]
async fn test_scale_in_detaches_surplus() {
    let h = Harness::new();
    h.converged_collection(collection("arena", 5), &[]).await;
    assert_eq!(h.members("arena").await.len(), 5);

    update_collection(&h, "arena", |col| {
        col.spec.replicas = 3;
        true
    })
    .await;
    h.collections().reconcile(&key("arena")).await.unwrap();

    let all = h.all_game_servers().await;
    assert_eq!(all.len(), 5);
    assert_eq!(h.members("arena").await.len(), 3);

    let detached: Vec<_> = all.iter().filter(|d| d.collection_name().is_none()).collect();
    assert_eq!(detached.len(), 2);
    for dgs in detached {
        assert!(dgs.status.marked_for_deletion);
        assert!(dgs.metadata.owner_references.is_empty());
        assert_eq!(dgs.original_collection_name(), Some("arena"));
    }

    // Stable on the next pass.
    h.collections().reconcile(&key("arena")).await.unwrap();
    assert_eq!(h.members("arena").await.len(), 3);
    assert_eq!(h.all_game_servers().await.len(), 5);
}

#[tokio::test]
async fn test_drained_instances_are_deleted_only_without_players() {
    let h = Harness::new();
    h.converged_collection(collection("arena", 4), &[]).await;
    update_collection(&h, "arena", |col| {
        col.spec.replicas = 2;
        true
    })
    .await;
    h.collections().reconcile(&key("arena")).await.unwrap();

    let detached: Vec<_> = h
        .all_game_servers()
        .await
        .into_iter()
        .filter(|d| d.status.marked_for_deletion)
        .collect();
    assert_eq!(detached.len(), 2);
    let busy = &detached[0].metadata.name;
    let idle = &detached[1].metadata.name;
    h.status().set_active_players(NAMESPACE, busy, 1).await.unwrap();

    sync_game_servers(&h).await;

    assert!(h.game_server(busy).await.is_some());
    assert!(h.game_server(idle).await.is_none());
    assert_eq!(h.members("arena").await.len(), 2);

    // Once the last player leaves it goes too.
    h.status().set_active_players(NAMESPACE, busy, 0).await.unwrap();
    sync_game_servers(&h).await;
    assert!(h.game_server(busy).await.is_none());
}

/// Fail one healthy member of `col` and return its name.
async fn fail_one_member(h: &Harness, col: &str) -> String {
    let Some(victim) = h
        .members(col)
        .await
        .into_iter()
        .find(|d| d.status.health == GameServerHealth::Healthy)
    else {
        panic!("no healthy member left in {col}");
    };
    h.status()
        .set_server_status(NAMESPACE, &victim.metadata.name, GameServerHealth::Failed)
        .await
        .unwrap();
    victim.metadata.name
}

/// Run the collection through enough passes to react to a failure and refill.
async fn settle(h: &Harness, col: &str) {
    for _ in 0..3 {
        h.collections().reconcile(&key(col)).await.unwrap();
        h.mark_members_ready(col).await;
    }
}

#[derive(Debug, PartialEq)]
struct FleetState {
    members: usize,
    failed_members: usize,
    failed_detached: usize,
    times_failed: u32,
    health: CollectionHealth,
}

async fn fleet_state(h: &Harness, col: &str) -> FleetState {
    let all = h.all_game_servers().await;
    let failed = |d: &&DedicatedGameServer| d.status.health == GameServerHealth::Failed;
    let collection = h.collection(col).await.unwrap();
    FleetState {
        members: all.iter().filter(|d| d.collection_name() == Some(col)).count(),
        failed_members: all
            .iter()
            .filter(failed)
            .filter(|d| d.collection_name() == Some(col))
            .count(),
        failed_detached: all
            .iter()
            .filter(failed)
            .filter(|d| d.collection_name().is_none())
            .count(),
        times_failed: collection.status.dgs_times_failed,
        health: collection.status.dgs_collection_health,
    }
}

#[tokio::test]
async fn test_removed_failures_then_intervention() {
    let h = Harness::new();
    let mut col = collection("arena", 7);
    col.spec.dgs_max_failures = 2;
    h.converged_collection(col, &[]).await;

    // Each failure below the limit is detached and replaced.
    fail_one_member(&h, "arena").await;
    settle(&h, "arena").await;
    assert_eq!(
        fleet_state(&h, "arena").await,
        FleetState {
            members: 7,
            failed_members: 0,
            failed_detached: 1,
            times_failed: 1,
            health: CollectionHealth::Healthy,
        }
    );

    // Reaching the limit still refills the slot.
    fail_one_member(&h, "arena").await;
    settle(&h, "arena").await;
    assert_eq!(
        fleet_state(&h, "arena").await,
        FleetState {
            members: 7,
            failed_members: 0,
            failed_detached: 2,
            times_failed: 2,
            health: CollectionHealth::Healthy,
        }
    );

    // The next failure stays in the collection and needs an operator.
    let stuck = fail_one_member(&h, "arena").await;
    settle(&h, "arena").await;
    assert_eq!(
        fleet_state(&h, "arena").await,
        FleetState {
            members: 7,
            failed_members: 1,
            failed_detached: 2,
            times_failed: 2,
            health: CollectionHealth::NeedsIntervention,
        }
    );
    assert_eq!(h.game_server(&stuck).await.unwrap().collection_name(), Some("arena"));

    // Further failures change nothing but the failed count.
    fail_one_member(&h, "arena").await;
    settle(&h, "arena").await;
    assert_eq!(
        fleet_state(&h, "arena").await,
        FleetState {
            members: 7,
            failed_members: 2,
            failed_detached: 2,
            times_failed: 2,
            health: CollectionHealth::NeedsIntervention,
        }
    );
    assert_eq!(h.all_game_servers().await.len(), 9);

    // Resetting the counter lets the collection handle them and refill.
    update_collection(&h, "arena", |col| {
        col.status.dgs_times_failed = 0;
        true
    })
    .await;
    settle(&h, "arena").await;
    assert_eq!(
        fleet_state(&h, "arena").await,
        FleetState {
            members: 7,
            failed_members: 0,
            failed_detached: 4,
            times_failed: 2,
            health: CollectionHealth::Healthy,
        }
    );
}

#[tokio::test]
async fn test_deleted_failures_then_intervention() {
    let h = Harness::new();
    let mut col = collection("arena", 5);
    col.spec.dgs_max_failures = 2;
    col.spec.dgs_fail_behavior = FailBehavior::Delete;
    h.converged_collection(col, &[]).await;

    for times_failed in 1..=2 {
        let victim = fail_one_member(&h, "arena").await;
        settle(&h, "arena").await;
        assert!(h.game_server(&victim).await.is_none());
        assert_eq!(
            fleet_state(&h, "arena").await,
            FleetState {
                members: 5,
                failed_members: 0,
                failed_detached: 0,
                times_failed,
                health: CollectionHealth::Healthy,
            }
        );
    }

    for failed_members in 1..=2 {
        let victim = fail_one_member(&h, "arena").await;
        settle(&h, "arena").await;
        assert!(h.game_server(&victim).await.is_some());
        assert_eq!(
            fleet_state(&h, "arena").await,
            FleetState {
                members: 5,
                failed_members,
                failed_detached: 0,
                times_failed: 2,
                health: CollectionHealth::NeedsIntervention,
            }
        );
    }
    assert_eq!(h.all_game_servers().await.len(), 5);
}

#[tokio::test]
async fn test_failure_batch_overshooting_threshold() {
    let h = Harness::new();
    let mut col = collection("arena", 3);
    col.spec.dgs_max_failures = 2;
    h.converged_collection(col, &[]).await;

    for dgs in h.members("arena").await {
        h.status()
            .set_server_status(NAMESPACE, &dgs.metadata.name, GameServerHealth::Failed)
            .await
            .unwrap();
    }
    settle(&h, "arena").await;

    // The whole batch is handled and replaced even though it passes the limit.
    assert_eq!(
        fleet_state(&h, "arena").await,
        FleetState {
            members: 3,
            failed_members: 0,
            failed_detached: 3,
            times_failed: 3,
            health: CollectionHealth::Healthy,
        }
    );

    fail_one_member(&h, "arena").await;
    settle(&h, "arena").await;
    assert_eq!(
        fleet_state(&h, "arena").await,
        FleetState {
            members: 3,
            failed_members: 1,
            failed_detached: 3,
            times_failed: 3,
            health: CollectionHealth::NeedsIntervention,
        }
    );
}

#[tokio::test]
async fn test_unparented_instance_reports_public_address() {
    let h = Harness::new();
    h.create_node("node-1", Some("52.1.1.1"), "10.0.0.4").await;
    h.clients.game_servers.create(game_server("solo")).await.unwrap();

    sync_game_servers(&h).await;
    h.run_pod("solo", "node-1").await;
    sync_game_servers(&h).await;

    let dgs = h.game_server("solo").await.unwrap();
    assert_eq!(dgs.status.pod_phase, Some(PodPhase::Running));
    assert_eq!(dgs.status.public_ip.as_deref(), Some("52.1.1.1"));
    let pod = &h.pods_of("solo").await[0];
    assert_eq!(pod.spec.containers[0].ports[0].host_port, dgs.exposed_host_ports().first().copied());
}

#[tokio::test]
async fn test_autoscaler_cooldown_window() {
    let h = Harness::new();
    h.converged_collection(autoscaled_collection("arena", 2, scaler(10)), &[9, 10])
        .await;
    let now = h.clock.now();

    let inside = (now - Duration::minutes(9)).to_rfc3339();
    update_collection(&h, "arena", |col| {
        if let Some(details) = col.spec.autoscaler_details.as_mut() {
            details.last_scale_operation_date_time = Some(inside.clone());
        }
        true
    })
    .await;
    assert_eq!(h.autoscaler().reconcile(&key("arena")).await.unwrap(), None);
    assert_eq!(h.collection("arena").await.unwrap().spec.replicas, 2);

    let outside = (now - Duration::minutes(11)).to_rfc3339();
    update_collection(&h, "arena", |col| {
        if let Some(details) = col.spec.autoscaler_details.as_mut() {
            details.last_scale_operation_date_time = Some(outside.clone());
        }
        true
    })
    .await;
    assert_eq!(
        h.autoscaler().reconcile(&key("arena")).await.unwrap(),
        Some(ScaleDecision::Out)
    );
    assert_eq!(h.collection("arena").await.unwrap().spec.replicas, 3);
}

#[tokio::test]
async fn test_autoscaler_ignores_malformed_timestamp() {
    let h = Harness::new();
    h.converged_collection(autoscaled_collection("arena", 3, scaler(10)), &[0, 1, 0])
        .await;
    update_collection(&h, "arena", |col| {
        if let Some(details) = col.spec.autoscaler_details.as_mut() {
            details.last_scale_operation_date_time = Some("not a timestamp".to_string());
        }
        true
    })
    .await;

    assert_eq!(
        h.autoscaler().reconcile(&key("arena")).await.unwrap(),
        Some(ScaleDecision::In)
    );
    let col = h.collection("arena").await.unwrap();
    assert_eq!(col.spec.replicas, 2);
    assert_eq!(col.status.dgs_collection_health, CollectionHealth::Creating);
}

#[tokio::test]
async fn test_autoscaled_collection_follows_new_target() {
    let h = Harness::new();
    h.converged_collection(autoscaled_collection("arena", 2, scaler(0)), &[10, 10])
        .await;

    h.autoscaler().reconcile(&key("arena")).await.unwrap();
    h.collections().reconcile(&key("arena")).await.unwrap();

    assert_eq!(h.members("arena").await.len(), 3);
}
