use std::sync::Arc;

use k8s_openapi::NamespaceResourceScope;
use kube::{Api, Client, Resource};
use log::info;
use vpn_fleet_core::{kubernetes::peer_store::KubePeerStore, CONTROLLER_FIELD_MANAGER};

use crate::{config::AgentConfig, exec::PodExecInterface};

use self::{
    node::start_node_reflector,
    peer::{start_peer_controller, PeerControllerContext},
    reconciler::context::ReconcilerContext,
    server::start_server_controller,
    workloads::{KubeStatusWriter, KubeWorkloads},
};

pub mod backoff;
pub mod node;
pub mod peer;
pub mod reconciler;
pub mod server;
pub mod workloads;

pub async fn main_controller(client: Client, config: AgentConfig) {
    info!(
        "Watching {} with {} worker(s)...",
        config
            .namespace
            .as_deref()
            .map(|namespace| format!("'{namespace}' namespace"))
            .unwrap_or_else(|| "all namespaces".to_owned()),
        config.workers
    );

    let (reflector, nodes) = start_node_reflector(&client);

    let context = Arc::new(ReconcilerContext::new(
        config,
        Arc::new(KubeWorkloads::new(
            client.clone(),
            nodes,
            CONTROLLER_FIELD_MANAGER,
        )),
        Arc::new(KubeStatusWriter::new(client.clone(), CONTROLLER_FIELD_MANAGER)),
        Arc::new(KubePeerStore::new(client.clone(), CONTROLLER_FIELD_MANAGER)),
        Arc::new(PodExecInterface::new(client.clone())),
    ));
    let peer_context = Arc::new(PeerControllerContext {
        client: client.clone(),
        reconciler: context.clone(),
    });

    tokio::select! {
        _ = reflector => {},
        _ = async {
            tokio::join!(
                start_server_controller(client, context),
                start_peer_controller(peer_context),
            )
        } => {},
    }

    info!("Controllers stopped!");
}

/// Api scoped to the watched namespace, or cluster-wide when none is configured.
fn watched_api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = NamespaceResourceScope>,
    <K as Resource>::DynamicType: Default,
{
    match namespace {
        Some(namespace) => Api::namespaced(client.clone(), namespace),
        None => Api::all(client.clone()),
    }
}
