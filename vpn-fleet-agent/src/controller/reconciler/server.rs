use std::{sync::Arc, time::Duration};

use chrono::Utc;
use k8s_openapi::api::core::v1::{Pod, Secret, Service, ServiceSpec};
use kube::{runtime::controller::Action, Resource, ResourceExt};
use log::{debug, info, warn};
use vpn_fleet_core::{
    kubernetes::{is_conflict, service::get_service_endpoint},
    resources::{
        crd::v1alpha1::vpnserver::{VPNServer, VPNServerStatus},
        key::ServerKey,
        server::{
            pod::{is_pod_available, is_pod_ready, is_pod_terminating, sort_oldest_first},
            secret::read_server_private_key,
            ServerRelease, ServerReleaseBuilder,
        },
    },
    wireguard::{
        interface::InterfaceTarget,
        keys::{KeyGenerationError, KeyGenerator, OsKeyGenerator, WgKey},
    },
};

use crate::config::AgentConfig;

use super::{
    context::ReconcilerContext,
    error::{ErrorClass, ReconcilerError},
    status::{degraded_status, desired_status, PeerSync, ServerObservation, Telemetry},
};

pub async fn reconcile_server(
    object: Arc<VPNServer>,
    context: Arc<ReconcilerContext>,
) -> Result<Action, ReconcilerError> {
    let key = ServerKey::from_resource(object.as_ref())
        .ok_or(ReconcilerError::MissingObjectMetadata)?;

    if object.meta().deletion_timestamp.is_some() {
        context.peers.forget_server(&key).await;
        context.server_failures.reset(&key);

        return Ok(Action::await_change());
    }

    match try_reconcile(&object, &key, &context).await {
        Ok(()) => {
            context.server_failures.reset(&key);

            Ok(Action::requeue(context.config.resync()))
        }
        Err(error) => {
            let failures = context.server_failures.record_failure(&key);
            let class = error.class();

            if failures < context.config.retry_budget || class == ErrorClass::Conflict {
                return Err(error);
            }

            // sync failures already reported themselves
            if !matches!(error, ReconcilerError::InterfaceSync(_)) {
                if let Err(status_error) = report_degraded(&object, &context, &error).await {
                    warn!("Couldn't mark server {key} as degraded! {status_error}");
                }
            }

            if class == ErrorClass::Deterministic {
                warn!("Giving up on server {key} until its spec changes! {error}");
                context.server_failures.reset(&key);

                return Ok(Action::await_change());
            }

            Err(error)
        }
    }
}

pub fn reconcile_server_error(
    object: Arc<VPNServer>,
    error: &ReconcilerError,
    context: Arc<ReconcilerContext>,
) -> Action {
    let failures = ServerKey::from_resource(object.as_ref())
        .map(|key| context.server_failures.failures(&key))
        .unwrap_or(1);

    Action::requeue(retry_delay(&context.config, error, failures))
}

/// Conflicts are retried right away, everything else backs off.
pub fn retry_delay(config: &AgentConfig, error: &ReconcilerError, failures: u32) -> Duration {
    match error.class() {
        ErrorClass::Conflict => config.backoff_base(),
        _ => config.backoff().delay_with_jitter(failures),
    }
}

async fn try_reconcile(
    object: &VPNServer,
    key: &ServerKey,
    context: &ReconcilerContext,
) -> Result<(), ReconcilerError> {
    let spec = object.spec.validate()?;
    let release = build_release(object, context)?;
    let (secret, private_key) = ensure_server_key(&release, context).await?;
    let service = ensure_service(&release, context).await?;
    let nodes = context.api_call(context.workloads.list_nodes()).await?;
    let endpoint = get_service_endpoint(&service, &nodes);
    let (instances, scaled) = scale_instances(&release, &secret, key, spec.replicas, context).await?;

    let ready = instances.iter().filter(|pod| is_pod_ready(pod)).count();
    let available = instances.iter().filter(|pod| is_pod_available(pod)).count();
    let (peer_sync, sync_error) = sync_peers(object, key, ready, context).await;

    let observation = ServerObservation {
        generation: object.metadata.generation,
        desired: spec.replicas,
        replicas: count(instances.len()),
        ready: count(ready),
        available: count(available),
        scaled,
        public_key: private_key.get_public().to_base64(),
        endpoint,
        peer_sync,
    };

    write_status(object, context, |previous| {
        desired_status(previous, &observation, Utc::now())
    })
    .await?;

    match sync_error {
        Some(error) => Err(error),
        None => Ok(()),
    }
}

fn build_release(
    object: &VPNServer,
    context: &ReconcilerContext,
) -> Result<ServerRelease, ReconcilerError> {
    Ok(ServerReleaseBuilder::default()
        .with_server_crd(object)?
        .agent_image(context.config.agent_image.to_owned())
        .service_type(context.config.service_type)
        .build()?)
}

/// Reads the server key, generating it on first use. An existing secret is never rewritten.
async fn ensure_server_key(
    release: &ServerRelease,
    context: &ReconcilerContext,
) -> Result<(Secret, WgKey), ReconcilerError> {
    let name = release.get_name();
    let namespace = release.get_namespace();

    if let Some(secret) = context
        .api_call(context.workloads.get_secret(&namespace, &name))
        .await?
    {
        let private_key = read_server_private_key(&secret)?;

        return Ok((secret, private_key));
    }

    let private_key = OsKeyGenerator
        .generate()?
        .get_private_key()
        .copied()
        .ok_or(KeyGenerationError::PublicOnly)?;
    let secret = release.generate_secret(&private_key);

    context
        .api_call(context.workloads.apply_secret(&secret))
        .await?;

    info!(
        "Generated a new key for server '{}' in '{namespace}' namespace, public key: {}",
        release.name,
        private_key.get_public()
    );

    Ok((secret, private_key))
}

async fn ensure_service(
    release: &ServerRelease,
    context: &ReconcilerContext,
) -> Result<Service, ReconcilerError> {
    let desired = release.generate_service();
    let existing = context
        .api_call(
            context
                .workloads
                .get_service(&release.get_namespace(), &release.get_name()),
        )
        .await?;

    if let Some(existing) = existing {
        if service_matches(&existing, &desired) {
            return Ok(existing);
        }
    }

    debug!("Applying service of server '{}'...", release.name);

    context
        .api_call(context.workloads.apply_service(&desired))
        .await
}

/// Compares only the fields the controller declares, the rest is filled in by the cluster.
fn service_matches(existing: &Service, desired: &Service) -> bool {
    let (existing, desired) = match (&existing.spec, &desired.spec) {
        (Some(existing), Some(desired)) => (existing, desired),
        _ => return false,
    };
    let ports = |spec: &ServiceSpec| {
        spec.ports
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(|port| (port.name.to_owned(), port.port, port.protocol.to_owned()))
            .collect::<Vec<_>>()
    };

    existing.type_ == desired.type_
        && existing.selector == desired.selector
        && ports(existing) == ports(desired)
}

/// Brings the number of live instances to `replicas`. Extra instances are removed
/// oldest first. Returns the instances left and whether anything changed.
async fn scale_instances(
    release: &ServerRelease,
    secret: &Secret,
    key: &ServerKey,
    replicas: i32,
    context: &ReconcilerContext,
) -> Result<(Vec<Pod>, bool), ReconcilerError> {
    let mut instances = context
        .api_call(context.workloads.list_instances(key))
        .await?;
    instances.retain(|pod| !is_pod_terminating(pod));
    sort_oldest_first(&mut instances);

    let desired = usize::try_from(replicas).unwrap_or_default();
    let current = instances.len();

    if current < desired {
        info!(
            "Scaling server {key} up from {current} to {desired} instance(s)..."
        );

        let pod = release.generate_pod(secret)?;

        for _ in current..desired {
            context
                .api_call(context.workloads.create_instance(&pod))
                .await?;
        }

        return Ok((instances, true));
    }

    if current > desired {
        info!(
            "Scaling server {key} down from {current} to {desired} instance(s)..."
        );

        let remaining = instances.split_off(current - desired);

        for pod in instances {
            context
                .api_call(
                    context
                        .workloads
                        .delete_instance(&key.namespace, &pod.name_any()),
                )
                .await?;
        }

        return Ok((remaining, true));
    }

    Ok((instances, false))
}

async fn sync_peers(
    object: &VPNServer,
    key: &ServerKey,
    ready: usize,
    context: &ReconcilerContext,
) -> (PeerSync, Option<ReconcilerError>) {
    if ready == 0 {
        return (PeerSync::Skipped, None);
    }

    let target = InterfaceTarget::new(key.to_owned(), &object.spec.interface);
    let exhausted = context.server_failures.failures(key) + 1 >= context.config.retry_budget;

    let (telemetry, error) = match context.peers.sync_server(&target).await {
        Ok(outcome) if outcome.is_clean() => {
            if outcome.changes > 0 {
                info!("Applied {} peer change(s) to server {key}!", outcome.changes);
            }

            return (PeerSync::Clean(Telemetry::from(&outcome)), None);
        }
        Ok(outcome) => {
            for (public_key, error) in &outcome.failures {
                warn!("Peer {public_key} couldn't be applied to server {key}! {error}");
            }

            (
                Some(Telemetry::from(&outcome)),
                ReconcilerError::InterfaceSync(outcome.failures.len()),
            )
        }
        Err(error) => (None, ReconcilerError::from(error)),
    };

    let peer_sync = PeerSync::Failed {
        telemetry,
        reason: error.reason(),
        message: error.to_string(),
        exhausted,
    };

    (peer_sync, Some(error))
}

async fn report_degraded(
    object: &VPNServer,
    context: &ReconcilerContext,
    error: &ReconcilerError,
) -> Result<(), ReconcilerError> {
    let generation = object.metadata.generation;

    write_status(object, context, |previous| {
        degraded_status(previous, generation, error, Utc::now())
    })
    .await
}

/// Replaces the status when it differs from the current one. A conflicting write
/// re-reads the server and tries again, unless its spec changed in the meantime.
async fn write_status(
    object: &VPNServer,
    context: &ReconcilerContext,
    build: impl Fn(Option<&VPNServerStatus>) -> VPNServerStatus,
) -> Result<(), ReconcilerError> {
    let name = object.name_any();
    let namespace = object.namespace().unwrap_or_default();
    let mut current = object.to_owned();

    for _ in 0..=context.config.conflict_retries {
        let status = build(current.status.as_ref());

        if current.status.as_ref() == Some(&status) {
            return Ok(());
        }

        match context
            .api_call(context.status.write_status(&current, &status))
            .await
        {
            Err(ReconcilerError::KubeApiError(error)) if is_conflict(&error) => {
                debug!("Status of server '{name}' changed concurrently, re-reading it...");
            }
            result => return result,
        }

        current = match context
            .api_call(context.status.get_server(&namespace, &name))
            .await?
        {
            Some(latest) if latest.metadata.generation == object.metadata.generation => latest,
            Some(_) => return Err(ReconcilerError::Conflict),
            None => return Ok(()),
        };
    }

    Err(ReconcilerError::Conflict)
}

fn count(value: usize) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use chrono::Utc;
    use kube::runtime::controller::Action;
    use vpn_fleet_core::{
        peers::Peer,
        resources::{
            crd::v1alpha1::conditions::{find_condition, CONDITION_AVAILABLE, CONDITION_DEGRADED},
            key::ServerKey,
            server::ServerReleaseBuilder,
        },
        wireguard::{
            interface::InterfaceTarget,
            keys::{KeyGenerator, OsKeyGenerator},
        },
    };

    use crate::{
        config::AgentConfig,
        controller::reconciler::{
            error::{tests::api_error, ReconcilerError},
            fakes::{instance, is_true, server, Harness},
        },
    };

    use super::{reconcile_server, retry_delay, service_matches};

    #[tokio::test]
    async fn first_pass_creates_everything_once() {
        let harness = Harness::new(Some(server(2)), Vec::new());

        harness.reconcile_server().await.unwrap();

        let mutations = harness.workloads.mutations();
        assert_eq!(
            mutations
                .iter()
                .filter(|mutation| mutation.starts_with("create"))
                .count(),
            2
        );
        assert!(mutations.contains(&"apply secret vpn-fleet-edge".to_owned()));
        assert!(mutations.contains(&"apply service vpn-fleet-edge".to_owned()));

        let status = harness.last_status();
        assert_eq!(status.replicas, 0);
        assert!(status.public_key.is_some());
        assert_eq!(status.observed_generation, Some(1));
    }

    #[tokio::test]
    async fn converged_server_is_left_alone() {
        let harness = Harness::new(Some(server(2)), Vec::new());

        harness.reconcile_server().await.unwrap();
        harness.reconcile_server().await.unwrap();

        let mutations = harness.workloads.mutations().len();
        let writes = harness.status.writes().len();
        let public_key = harness.last_status().public_key;

        harness.reconcile_server().await.unwrap();

        assert_eq!(harness.workloads.mutations().len(), mutations);
        assert_eq!(harness.status.writes().len(), writes);
        assert_eq!(harness.last_status().public_key, public_key);
        assert_eq!(harness.last_status().ready_replicas, 2);
    }

    #[tokio::test]
    async fn scale_down_removes_the_oldest_instances() {
        let pods = vec![
            instance("vpn-fleet-edge-b", 200, true),
            instance("vpn-fleet-edge-c", 300, true),
            instance("vpn-fleet-edge-a", 100, true),
        ];
        let harness = Harness::new(Some(server(3)), pods);

        harness.reconcile_server().await.unwrap();
        assert_eq!(harness.last_status().ready_replicas, 3);

        harness.status.update_spec(|spec| spec.replicas = 1);
        harness.reconcile_server().await.unwrap();
        harness.reconcile_server().await.unwrap();

        assert_eq!(harness.workloads.pod_names(), vec!["vpn-fleet-edge-c"]);
        assert_eq!(harness.last_status().ready_replicas, 1);
        assert_eq!(harness.last_status().observed_generation, Some(2));

        for status in harness.status.writes() {
            assert!(is_true(&status, CONDITION_AVAILABLE));
            assert!(!is_true(&status, CONDITION_DEGRADED));
        }
    }

    #[tokio::test]
    async fn existing_key_is_reused() {
        let harness = Harness::new(Some(server(1)), Vec::new());

        harness.reconcile_server().await.unwrap();
        let public_key = harness.last_status().public_key;

        let fresh = Harness::new(Some(server(1)), Vec::new());
        *fresh.workloads.secrets.lock().unwrap() = harness.workloads.secrets.lock().unwrap().clone();
        fresh.reconcile_server().await.unwrap();

        assert_eq!(fresh.last_status().public_key, public_key);
        assert!(!fresh
            .workloads
            .mutations()
            .iter()
            .any(|mutation| mutation.starts_with("apply secret")));
    }

    #[tokio::test]
    async fn conflicting_status_write_is_retried() {
        let harness = Harness::new(Some(server(1)), vec![instance("vpn-fleet-edge-a", 100, true)]);

        harness.status.interfere(1);
        harness.reconcile_server().await.unwrap();

        assert_eq!(harness.status.writes().len(), 1);
        assert_eq!(harness.last_status().ready_replicas, 1);
    }

    #[tokio::test]
    async fn spec_change_during_the_pass_aborts_the_write() {
        let harness = Harness::new(Some(server(1)), vec![instance("vpn-fleet-edge-a", 100, true)]);
        let stale = Arc::new(harness.status.current());

        harness.status.update_spec(|spec| spec.port = 51821);

        let error = reconcile_server(stale, harness.context.clone())
            .await
            .unwrap_err();

        assert!(matches!(error, ReconcilerError::Conflict));
        assert!(harness.status.writes().is_empty());
    }

    #[tokio::test]
    async fn invalid_spec_degrades_after_the_budget() {
        let harness = Harness::new(Some(server(0)), Vec::new());

        let first = harness.reconcile_server().await.unwrap_err();
        assert!(matches!(first, ReconcilerError::InvalidSpec(_)));
        assert!(harness.status.writes().is_empty());

        let second = harness.reconcile_server().await.unwrap();
        assert_eq!(second, Action::await_change());

        let status = harness.last_status();
        let degraded = find_condition(&status.conditions, CONDITION_DEGRADED).unwrap();
        assert!(degraded.is_true());
        assert_eq!(degraded.reason, "InvalidSpec");
        assert!(harness.workloads.mutations().is_empty());
    }

    #[tokio::test]
    async fn persistent_sync_failure_degrades_the_server() {
        let harness = Harness::new(Some(server(1)), vec![instance("vpn-fleet-edge-a", 100, true)]);
        let key = ServerKey::new("vpn", "edge");
        let peer_key = *OsKeyGenerator.generate().unwrap().get_public_key();

        harness.store.insert(Peer {
            server: key.clone(),
            name: "alice".to_owned(),
            public_key: peer_key,
            address: "10.0.0.2".parse().unwrap(),
            allowed_ips: vec!["10.0.0.2/32".parse().unwrap()],
            active: true,
            rotation: 0,
            last_handshake: None,
            rx_bytes: 0,
            tx_bytes: 0,
            created_at: Utc::now(),
        });
        harness.interface.fail_adds_for(peer_key, 100);

        let first = harness.reconcile_server().await.unwrap_err();
        assert!(matches!(first, ReconcilerError::InterfaceSync(1)));
        assert!(!is_true(&harness.last_status(), CONDITION_DEGRADED));

        let second = harness.reconcile_server().await.unwrap_err();
        assert!(matches!(second, ReconcilerError::InterfaceSync(1)));
        assert!(is_true(&harness.last_status(), CONDITION_DEGRADED));

        harness.interface.fail_adds_for(peer_key, 0);
        harness.reconcile_server().await.unwrap();

        let status = harness.last_status();
        assert!(is_true(&status, CONDITION_AVAILABLE));
        assert!(!is_true(&status, CONDITION_DEGRADED));
        assert!(harness
            .interface
            .peer(&InterfaceTarget::new(key, "wg0"), &peer_key)
            .is_some());
    }

    #[test]
    fn conflicts_skip_the_backoff() {
        let config = AgentConfig::default();
        let conflict = retry_delay(&config, &ReconcilerError::Conflict, 4);
        let transient = retry_delay(&config, &ReconcilerError::from(api_error(503)), 3);

        assert_eq!(conflict, Duration::from_millis(500));
        assert!(transient >= Duration::from_secs(2));
        assert!(transient <= Duration::from_millis(2_200));
    }

    #[test]
    fn services_differing_in_ports_are_reapplied() {
        let release = ServerReleaseBuilder::default()
            .with_server_crd(&server(1))
            .unwrap()
            .agent_image("agent".to_owned())
            .build()
            .unwrap();
        let desired = release.generate_service();
        let mut moved = desired.clone();
        moved.spec.as_mut().unwrap().ports.as_mut().unwrap()[0].port = 51821;

        assert!(service_matches(&desired, &desired));
        assert!(!service_matches(&moved, &desired));
    }
}
