//! Status-reporting effects.
//!
//! Game server processes report player counts, health and session state
//! through an HTTP front-end; this is what that front-end calls. Each
//! operation is one read-modify-write of the instance's status, retried on
//! conflict.

use dgs_api::{
    DedicatedGameServer, GameServerHealth, GameServerState, LabelSelector, ObjectKey,
};
use dgs_reconcile::RetryPolicy;
use tracing::info;

use crate::store::{self, Clients, StoreError};

/// Writes status fields reported by running game servers.
#[derive(Clone)]
pub struct StatusReporter {
    clients: Clients,
    retry: RetryPolicy,
}

impl StatusReporter {
    pub fn new(clients: Clients) -> Self {
        Self {
            clients,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Record the number of connected players.
    pub async fn set_active_players(
        &self,
        namespace: &str,
        name: &str,
        count: u32,
    ) -> Result<DedicatedGameServer, StoreError> {
        let updated = self
            .update(namespace, name, |dgs| {
                if dgs.status.active_players == count {
                    return false;
                }
                dgs.status.active_players = count;
                true
            })
            .await?;
        info!(namespace, name, active_players = count, "Active players updated");
        Ok(updated)
    }

    /// Record the health reported by the game server.
    pub async fn set_server_status(
        &self,
        namespace: &str,
        name: &str,
        health: GameServerHealth,
    ) -> Result<DedicatedGameServer, StoreError> {
        let updated = self
            .update(namespace, name, |dgs| {
                if dgs.status.health == health {
                    return false;
                }
                dgs.status.health = health;
                true
            })
            .await?;
        info!(namespace, name, health = %health, "Server status updated");
        Ok(updated)
    }

    /// Record the game session state.
    pub async fn set_server_state(
        &self,
        namespace: &str,
        name: &str,
        state: GameServerState,
    ) -> Result<DedicatedGameServer, StoreError> {
        self.update(namespace, name, |dgs| {
            if dgs.status.state == state {
                return false;
            }
            dgs.status.state = state;
            true
        })
        .await
    }

    pub async fn set_marked_for_deletion(
        &self,
        namespace: &str,
        name: &str,
        marked: bool,
    ) -> Result<DedicatedGameServer, StoreError> {
        self.update(namespace, name, |dgs| {
            if dgs.status.marked_for_deletion == marked {
                return false;
            }
            dgs.status.marked_for_deletion = marked;
            true
        })
        .await
    }

    /// Instances in `namespace` that can accept players right now.
    pub async fn ready_servers(
        &self,
        namespace: &str,
    ) -> Result<Vec<DedicatedGameServer>, StoreError> {
        let all = self
            .clients
            .game_servers
            .list(Some(namespace), &LabelSelector::everything())
            .await?;
        Ok(all.into_iter().filter(DedicatedGameServer::is_ready).collect())
    }

    async fn update<F>(
        &self,
        namespace: &str,
        name: &str,
        mutate: F,
    ) -> Result<DedicatedGameServer, StoreError>
    where
        F: Fn(&mut DedicatedGameServer) -> bool + Send + Sync,
    {
        let key = ObjectKey::new(namespace, name);
        store::modify(self.clients.game_servers.as_ref(), &key, &self.retry, mutate)
            .await?
            .ok_or_else(|| StoreError::not_found::<DedicatedGameServer>(&key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dgs_api::{ObjectMeta, PodPhase};

    async fn reporter_with(names: &[&str]) -> (StatusReporter, Clients) {
        let clients = Clients::in_memory();
        for name in names {
            clients
                .game_servers
                .create(DedicatedGameServer {
                    metadata: ObjectMeta::new("default", *name),
                    ..Default::default()
                })
                .await
                .unwrap();
        }
        (StatusReporter::new(clients.clone()), clients)
    }

    #[tokio::test]
    async fn test_set_active_players_and_health() {
        let (reporter, clients) = reporter_with(&["arena-a"]).await;

        reporter
            .set_active_players("default", "arena-a", 7)
            .await
            .unwrap();
        reporter
            .set_server_status("default", "arena-a", GameServerHealth::Healthy)
            .await
            .unwrap();
        reporter
            .set_server_state("default", "arena-a", GameServerState::Running)
            .await
            .unwrap();

        let dgs = clients
            .game_servers
            .get("default", "arena-a")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(dgs.status.active_players, 7);
        assert_eq!(dgs.status.health, GameServerHealth::Healthy);
        assert_eq!(dgs.status.state, GameServerState::Running);
    }

    #[tokio::test]
    async fn test_repeated_report_does_not_write() {
        let (reporter, _clients) = reporter_with(&["arena-a"]).await;

        let first = reporter
            .set_active_players("default", "arena-a", 3)
            .await
            .unwrap();
        let second = reporter
            .set_active_players("default", "arena-a", 3)
            .await
            .unwrap();
        assert_eq!(
            first.metadata.resource_version,
            second.metadata.resource_version
        );
    }

    #[tokio::test]
    async fn test_unknown_server_is_not_found() {
        let (reporter, _clients) = reporter_with(&[]).await;
        let err = reporter
            .set_server_status("default", "missing", GameServerHealth::Failed)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_ready_servers() {
        let (reporter, clients) = reporter_with(&["arena-a", "arena-b", "arena-c"]).await;
        for name in ["arena-a", "arena-b", "arena-c"] {
            let mut dgs = clients
                .game_servers
                .get("default", name)
                .await
                .unwrap()
                .unwrap();
            dgs.status.health = GameServerHealth::Healthy;
            dgs.status.pod_phase = Some(PodPhase::Running);
            clients.game_servers.update(dgs).await.unwrap();
        }
        reporter
            .set_marked_for_deletion("default", "arena-b", true)
            .await
            .unwrap();
        reporter
            .set_server_status("default", "arena-c", GameServerHealth::Failed)
            .await
            .unwrap();

        let ready = reporter.ready_servers("default").await.unwrap();
        let names: Vec<_> = ready.iter().map(|d| d.metadata.name.as_str()).collect();
        assert_eq!(names, vec!["arena-a"]);
    }
}
