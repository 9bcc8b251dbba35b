//! In-memory stand-ins for the cluster, shared by the reconciler tests.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use k8s_openapi::{
    api::core::v1::{Node, Pod, PodCondition, PodStatus, Secret, Service},
    apimachinery::pkg::apis::meta::v1::Time,
};
use kube::{core::ObjectMeta, runtime::controller::Action, ResourceExt};
use vpn_fleet_core::{
    peers::memory::MemoryPeerStore,
    resources::{
        crd::v1alpha1::{
            conditions::find_condition,
            vpnpeer::{VPNPeer, VPNPeerSpec, VPNPeerStatus},
            vpnserver::{VPNServer, VPNServerSpec, VPNServerStatus},
        },
        key::ServerKey,
    },
    wireguard::memory::MemoryInterface,
};

use crate::{
    config::AgentConfig,
    controller::workloads::{PeerState, StatusWriter, Workloads},
};

use super::{
    context::ReconcilerContext, error::tests::api_error, error::ReconcilerError,
    server::reconcile_server,
};

#[derive(Default)]
pub struct FakeWorkloads {
    pub pods: Mutex<Vec<Pod>>,
    pub secrets: Mutex<Vec<Secret>>,
    pub services: Mutex<Vec<Service>>,
    mutations: Mutex<Vec<String>>,
    created: Mutex<i64>,
}

impl FakeWorkloads {
    pub fn with_pods(pods: Vec<Pod>) -> Self {
        Self {
            pods: Mutex::new(pods),
            ..Default::default()
        }
    }

    /// Every call that changed something, e.g. `delete vpn-fleet-edge-a`.
    pub fn mutations(&self) -> Vec<String> {
        self.mutations.lock().unwrap().clone()
    }

    pub fn pod_names(&self) -> Vec<String> {
        self.pods.lock().unwrap().iter().map(|pod| pod.name_any()).collect()
    }

    pub fn secret(&self, name: &str) -> Option<Secret> {
        self.secrets
            .lock()
            .unwrap()
            .iter()
            .find(|secret| secret.name_any() == name)
            .cloned()
    }

    fn record(&self, mutation: String) {
        self.mutations.lock().unwrap().push(mutation);
    }
}

#[async_trait]
impl Workloads for FakeWorkloads {
    async fn list_instances(&self, _server: &ServerKey) -> Result<Vec<Pod>, kube::Error> {
        Ok(self.pods.lock().unwrap().clone())
    }

    async fn create_instance(&self, pod: &Pod) -> Result<(), kube::Error> {
        let created = {
            let mut created = self.created.lock().unwrap();
            *created += 1;
            *created
        };
        let prefix = pod.metadata.generate_name.clone().unwrap_or_default();
        let name = format!("{prefix}new{created}");

        self.record(format!("create {name}"));
        self.pods
            .lock()
            .unwrap()
            .push(instance(&name, 1_000 + created, true));

        Ok(())
    }

    async fn delete_instance(&self, _namespace: &str, name: &str) -> Result<(), kube::Error> {
        self.record(format!("delete {name}"));
        self.pods.lock().unwrap().retain(|pod| pod.name_any() != name);

        Ok(())
    }

    async fn get_secret(&self, _namespace: &str, name: &str) -> Result<Option<Secret>, kube::Error> {
        Ok(self.secret(name))
    }

    async fn apply_secret(&self, secret: &Secret) -> Result<(), kube::Error> {
        self.record(format!("apply secret {}", secret.name_any()));

        let mut secrets = self.secrets.lock().unwrap();
        secrets.retain(|existing| existing.name_any() != secret.name_any());
        secrets.push(secret.clone());

        Ok(())
    }

    async fn delete_secret(&self, _namespace: &str, name: &str) -> Result<(), kube::Error> {
        self.record(format!("delete secret {name}"));
        self.secrets
            .lock()
            .unwrap()
            .retain(|secret| secret.name_any() != name);

        Ok(())
    }

    async fn get_service(&self, _namespace: &str, name: &str) -> Result<Option<Service>, kube::Error> {
        Ok(self
            .services
            .lock()
            .unwrap()
            .iter()
            .find(|service| service.name_any() == name)
            .cloned())
    }

    async fn apply_service(&self, service: &Service) -> Result<Service, kube::Error> {
        self.record(format!("apply service {}", service.name_any()));

        let mut services = self.services.lock().unwrap();
        services.retain(|existing| existing.name_any() != service.name_any());
        services.push(service.clone());

        Ok(service.clone())
    }

    async fn list_nodes(&self) -> Result<Vec<Node>, kube::Error> {
        Ok(Vec::new())
    }
}

/// Plays the API server for server objects and status writes, resource versions included.
pub struct FakeStatus {
    server: Mutex<Option<VPNServer>>,
    writes: Mutex<Vec<VPNServerStatus>>,
    peer_states: Mutex<Vec<(String, PeerState)>>,
    conflicts: Mutex<u32>,
}

impl FakeStatus {
    pub fn new(server: Option<VPNServer>) -> Self {
        Self {
            server: Mutex::new(server),
            writes: Mutex::new(Vec::new()),
            peer_states: Mutex::new(Vec::new()),
            conflicts: Mutex::new(0),
        }
    }

    pub fn current(&self) -> VPNServer {
        self.server
            .lock()
            .unwrap()
            .clone()
            .expect("the fake holds a server")
    }

    pub fn writes(&self) -> Vec<VPNServerStatus> {
        self.writes.lock().unwrap().clone()
    }

    pub fn peer_states(&self) -> Vec<(String, PeerState)> {
        self.peer_states.lock().unwrap().clone()
    }

    pub fn last_peer_state(&self, peer: &str) -> Option<PeerState> {
        self.peer_states()
            .into_iter()
            .rev()
            .find(|(name, _)| name == peer)
            .map(|(_, state)| state)
    }

    /// Someone else modifies the object right before the next `times` writes.
    pub fn interfere(&self, times: u32) {
        *self.conflicts.lock().unwrap() = times;
    }

    pub fn update_spec(&self, update: impl FnOnce(&mut VPNServerSpec)) {
        let mut server = self.server.lock().unwrap();
        let server = server.as_mut().expect("the fake holds a server");

        update(&mut server.spec);
        server.metadata.generation = server.metadata.generation.map(|generation| generation + 1);
        bump(server);
    }
}

fn bump(server: &mut VPNServer) {
    let version = server
        .metadata
        .resource_version
        .as_deref()
        .and_then(|version| version.parse::<u64>().ok())
        .unwrap_or_default();

    server.metadata.resource_version = Some((version + 1).to_string());
}

#[async_trait]
impl StatusWriter for FakeStatus {
    async fn write_status(&self, server: &VPNServer, status: &VPNServerStatus) -> Result<(), kube::Error> {
        let mut stored = self.server.lock().unwrap();
        let stored = match stored.as_mut() {
            Some(stored) => stored,
            None => return Err(api_error(404)),
        };
        let mut conflicts = self.conflicts.lock().unwrap();

        if *conflicts > 0 {
            *conflicts -= 1;
            bump(stored);
        }

        if stored.metadata.resource_version != server.metadata.resource_version {
            return Err(api_error(409));
        }

        stored.status = Some(status.clone());
        bump(stored);
        self.writes.lock().unwrap().push(status.clone());

        Ok(())
    }

    async fn get_server(&self, _namespace: &str, _name: &str) -> Result<Option<VPNServer>, kube::Error> {
        Ok(self.server.lock().unwrap().clone())
    }

    async fn write_peer_state(&self, peer: &VPNPeer, state: &PeerState) -> Result<(), kube::Error> {
        self.peer_states
            .lock()
            .unwrap()
            .push((peer.name_any(), state.clone()));

        Ok(())
    }
}

pub struct Harness {
    pub workloads: Arc<FakeWorkloads>,
    pub status: Arc<FakeStatus>,
    pub store: Arc<MemoryPeerStore>,
    pub interface: Arc<MemoryInterface>,
    pub context: Arc<ReconcilerContext>,
}

impl Harness {
    pub fn new(server: Option<VPNServer>, pods: Vec<Pod>) -> Self {
        let workloads = Arc::new(FakeWorkloads::with_pods(pods));
        let status = Arc::new(FakeStatus::new(server));
        let store = Arc::new(MemoryPeerStore::default());
        let interface = Arc::new(MemoryInterface::default());
        let context = Arc::new(ReconcilerContext::new(
            config(),
            workloads.clone(),
            status.clone(),
            store.clone(),
            interface.clone(),
        ));

        Self {
            workloads,
            status,
            store,
            interface,
            context,
        }
    }

    /// One ready instance of the `edge` server, already reconciled.
    pub async fn with_running_server() -> Self {
        Self::running(server(1)).await
    }

    pub async fn running(server: VPNServer) -> Self {
        let harness = Self::new(Some(server), vec![instance("vpn-fleet-edge-a", 100, true)]);

        harness
            .reconcile_server()
            .await
            .expect("the server reconciles");

        harness
    }

    pub async fn reconcile_server(&self) -> Result<Action, ReconcilerError> {
        reconcile_server(self.status.current().into(), self.context.clone()).await
    }

    pub fn last_status(&self) -> VPNServerStatus {
        self.status.current().status.unwrap_or_default()
    }
}

pub fn config() -> AgentConfig {
    AgentConfig {
        api_timeout_secs: 1,
        retry_budget: 2,
        interface_retries: 1,
        ..Default::default()
    }
}

pub fn server(replicas: i32) -> VPNServer {
    let mut server = VPNServer::new(
        "edge",
        VPNServerSpec {
            replicas,
            image: "lscr.io/linuxserver/wireguard:latest".to_owned(),
            port: 51820,
            interface: "wg0".to_owned(),
            address: "10.0.0.1/24".to_owned(),
            dns: Some("1.1.1.1".to_owned()),
            allowed_ips: "0.0.0.0/0".to_owned(),
            resources: None,
            node_selector: None,
            tolerations: None,
            affinity: None,
        },
    );

    server.metadata.namespace = Some("vpn".to_owned());
    server.metadata.uid = Some("1f0e6b4a-0000-4000-8000-000000000001".to_owned());
    server.metadata.generation = Some(1);
    server.metadata.resource_version = Some("1".to_owned());

    server
}

pub fn peer(name: &str, rotation: u32, status: Option<VPNPeerStatus>) -> VPNPeer {
    let mut peer = VPNPeer::new(
        name,
        VPNPeerSpec {
            server: "edge".to_owned(),
            rotation,
        },
    );

    peer.metadata.namespace = Some("vpn".to_owned());
    peer.metadata.uid = Some(format!("2a6c1d3e-0000-4000-8000-{:0>12}", name.len()));
    peer.status = status;

    peer
}

pub fn instance(name: &str, created_secs: i64, ready: bool) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_owned()),
            namespace: Some("vpn".to_owned()),
            creation_timestamp: Some(Time(Utc.timestamp_opt(created_secs, 0).unwrap())),
            ..Default::default()
        },
        status: Some(PodStatus {
            phase: Some("Running".to_owned()),
            conditions: Some(vec![PodCondition {
                type_: "Ready".to_owned(),
                status: if ready { "True" } else { "False" }.to_owned(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn is_true(status: &VPNServerStatus, type_: &str) -> bool {
    find_condition(&status.conditions, type_)
        .map(|condition| condition.is_true())
        .unwrap_or(false)
}
