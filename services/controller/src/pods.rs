//! Workload unit construction.

use dgs_api::{
    labels, DedicatedGameServer, EnvVar, ObjectMeta, OwnerReference, Pod, PodSpec, PodStatus,
    RestartPolicy,
};

use crate::config::CallbackConfig;

pub const ENV_SERVER_NAME: &str = "SERVER_NAME";
pub const ENV_SERVER_NAMESPACE: &str = "SERVER_NAMESPACE";
pub const ENV_SET_ACTIVE_PLAYERS_URL: &str = "SET_ACTIVE_PLAYERS_URL";
pub const ENV_SET_SERVER_STATUS_URL: &str = "SET_SERVER_STATUS_URL";

/// Build the pod that runs `dgs`.
///
/// The pod shares the instance's name, so creating it twice is rejected by
/// the store instead of producing a second pod. Every container gets the
/// instance identity and the status callback URLs in its environment.
pub fn build_pod(dgs: &DedicatedGameServer, callbacks: &CallbackConfig) -> Pod {
    let env = [
        EnvVar::new(ENV_SERVER_NAME, &dgs.metadata.name),
        EnvVar::new(ENV_SERVER_NAMESPACE, &dgs.metadata.namespace),
        EnvVar::new(ENV_SET_ACTIVE_PLAYERS_URL, callbacks.set_active_players_url()),
        EnvVar::new(ENV_SET_SERVER_STATUS_URL, callbacks.set_server_status_url()),
    ];

    let containers = dgs
        .spec
        .template
        .containers
        .iter()
        .cloned()
        .map(|mut container| {
            container.env.retain(|e| env.iter().all(|injected| injected.name != e.name));
            container.env.extend(env.iter().cloned());
            container
        })
        .collect();

    let mut metadata = ObjectMeta::new(&dgs.metadata.namespace, &dgs.metadata.name)
        .with_label(labels::GAME_SERVER_NAME, &dgs.metadata.name)
        .with_label(labels::IS_GAME_SERVER, "true");
    metadata
        .owner_references
        .push(OwnerReference::controlled_by(dgs));

    Pod {
        metadata,
        spec: PodSpec {
            containers,
            restart_policy: RestartPolicy::Never,
            node_name: None,
        },
        status: PodStatus::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dgs_api::{ContainerPort, ContainerSpec, PodPhase, PodTemplate, Protocol};

    #[test]
    fn test_pod_carries_identity_ports_and_callbacks() {
        let mut port = ContainerPort::new(7777, Protocol::Udp);
        port.host_port = Some(20123);
        let dgs = DedicatedGameServer {
            metadata: ObjectMeta::new("games", "arena-abcde"),
            spec: dgs_api::DedicatedGameServerSpec {
                template: PodTemplate {
                    containers: vec![ContainerSpec {
                        name: "server".to_string(),
                        image: "example/arena:1.0".to_string(),
                        ports: vec![port],
                        env: vec![EnvVar::new(ENV_SERVER_NAME, "stale"), EnvVar::new("MAP", "dust")],
                        ..Default::default()
                    }],
                },
                ports_to_expose: vec![7777],
            },
            ..Default::default()
        };
        let callbacks = CallbackConfig {
            api_server_url: "http://api.local/".to_string(),
            access_code: "abc".to_string(),
        };

        let pod = build_pod(&dgs, &callbacks);

        assert_eq!(pod.metadata.name, "arena-abcde");
        assert_eq!(pod.metadata.namespace, "games");
        assert_eq!(pod.metadata.label(labels::GAME_SERVER_NAME), Some("arena-abcde"));
        assert!(pod.metadata.is_owned_by("DedicatedGameServer", "arena-abcde"));
        assert_eq!(pod.status.phase, PodPhase::Pending);
        assert_eq!(pod.spec.restart_policy, RestartPolicy::Never);

        let container = &pod.spec.containers[0];
        assert_eq!(container.ports[0].host_port, Some(20123));
        let env = |name: &str| {
            container
                .env
                .iter()
                .filter(|e| e.name == name)
                .map(|e| e.value.as_str())
                .collect::<Vec<_>>()
        };
        assert_eq!(env(ENV_SERVER_NAME), vec!["arena-abcde"]);
        assert_eq!(env(ENV_SERVER_NAMESPACE), vec!["games"]);
        assert_eq!(env("MAP"), vec!["dust"]);
        assert_eq!(
            env(ENV_SET_ACTIVE_PLAYERS_URL),
            vec!["http://api.local/setactiveplayers?code=abc"]
        );
        assert_eq!(
            env(ENV_SET_SERVER_STATUS_URL),
            vec!["http://api.local/setserverstatus?code=abc"]
        );
    }
}
