use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod, Secret, Service};
use kube::{
    api::{DeleteParams, PatchParams, PostParams},
    runtime::reflector::Store,
    Client,
};
use serde_json::{json, Value};
use vpn_fleet_core::{
    kubernetes::{
        operations::{
            apply_resource, list_resources, patch_resource_status, try_get_resource,
            try_remove_resource,
        },
        GetApi,
    },
    resources::{
        crd::v1alpha1::{
            vpnpeer::{VPNPeer, VPNPeerState},
            vpnserver::{VPNServer, VPNServerStatus},
        },
        key::ServerKey,
        labels::get_server_listparams,
    },
};

/// Backing objects of a server: instances, key material and the service.
#[async_trait]
pub trait Workloads: Send + Sync {
    async fn list_instances(&self, server: &ServerKey) -> Result<Vec<Pod>, kube::Error>;
    async fn create_instance(&self, pod: &Pod) -> Result<(), kube::Error>;
    async fn delete_instance(&self, namespace: &str, name: &str) -> Result<(), kube::Error>;
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, kube::Error>;
    async fn apply_secret(&self, secret: &Secret) -> Result<(), kube::Error>;
    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), kube::Error>;
    async fn get_service(&self, namespace: &str, name: &str)
        -> Result<Option<Service>, kube::Error>;
    async fn apply_service(&self, service: &Service) -> Result<Service, kube::Error>;
    async fn list_nodes(&self) -> Result<Vec<Node>, kube::Error>;
}

#[async_trait]
pub trait StatusWriter: Send + Sync {
    /// Replaces the server status. Fails with a conflict when the object was modified
    /// after `server` was read.
    async fn write_status(
        &self,
        server: &VPNServer,
        status: &VPNServerStatus,
    ) -> Result<(), kube::Error>;

    async fn get_server(&self, namespace: &str, name: &str)
        -> Result<Option<VPNServer>, kube::Error>;

    /// Writes the request-level part of a peer status. The record itself, including
    /// the rotation its key answers, is kept by the peer store.
    async fn write_peer_state(&self, peer: &VPNPeer, state: &PeerState)
        -> Result<(), kube::Error>;
}

/// Request-level fields of a `VPNPeer` status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerState {
    pub state: VPNPeerState,
    pub message: Option<String>,
}

impl PeerState {
    pub fn of(peer: &VPNPeer) -> Option<Self> {
        peer.status.as_ref().map(|status| Self {
            state: status.state,
            message: status.message.to_owned(),
        })
    }
}

pub struct KubeWorkloads {
    client: Client,
    nodes: Store<Node>,
    patch_params: PatchParams,
}

impl KubeWorkloads {
    pub fn new(client: Client, nodes: Store<Node>, field_manager: &str) -> Self {
        Self {
            client,
            nodes,
            patch_params: PatchParams::apply(field_manager).force(),
        }
    }
}

#[async_trait]
impl Workloads for KubeWorkloads {
    async fn list_instances(&self, server: &ServerKey) -> Result<Vec<Pod>, kube::Error> {
        list_resources::<Pod>(
            &self.client,
            &server.namespace,
            &get_server_listparams(&server.name),
        )
        .await
    }

    async fn create_instance(&self, pod: &Pod) -> Result<(), kube::Error> {
        let namespace = pod.metadata.namespace.as_deref().unwrap_or_default();

        self.client
            .namespaced_api::<Pod>(namespace)
            .create(&PostParams::default(), pod)
            .await?;

        Ok(())
    }

    async fn delete_instance(&self, namespace: &str, name: &str) -> Result<(), kube::Error> {
        try_remove_resource::<Pod>(&self.client, name, namespace, &DeleteParams::default()).await
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, kube::Error> {
        try_get_resource::<Secret>(&self.client, name, namespace).await
    }

    async fn apply_secret(&self, secret: &Secret) -> Result<(), kube::Error> {
        apply_resource(&self.client, secret, &self.patch_params).await?;

        Ok(())
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), kube::Error> {
        try_remove_resource::<Secret>(&self.client, name, namespace, &DeleteParams::default())
            .await
    }

    async fn get_service(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Service>, kube::Error> {
        try_get_resource::<Service>(&self.client, name, namespace).await
    }

    async fn apply_service(&self, service: &Service) -> Result<Service, kube::Error> {
        apply_resource(&self.client, service, &self.patch_params).await
    }

    async fn list_nodes(&self) -> Result<Vec<Node>, kube::Error> {
        Ok(self
            .nodes
            .state()
            .iter()
            .map(|node| node.as_ref().to_owned())
            .collect())
    }
}

pub struct KubeStatusWriter {
    client: Client,
    patch_params: PatchParams,
}

impl KubeStatusWriter {
    pub fn new(client: Client, field_manager: &str) -> Self {
        Self {
            client,
            patch_params: PatchParams::apply(field_manager),
        }
    }
}

#[async_trait]
impl StatusWriter for KubeStatusWriter {
    async fn write_status(
        &self,
        server: &VPNServer,
        status: &VPNServerStatus,
    ) -> Result<(), kube::Error> {
        let name = server.metadata.name.as_deref().unwrap_or_default();
        let namespace = server.metadata.namespace.as_deref().unwrap_or_default();

        let status = status_with_explicit_nulls(status)?;

        patch_resource_status::<VPNServer, Value>(
            &self.client,
            &status,
            name,
            namespace,
            server.metadata.resource_version.as_deref(),
            &self.patch_params,
        )
        .await?;

        Ok(())
    }

    async fn get_server(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<VPNServer>, kube::Error> {
        try_get_resource::<VPNServer>(&self.client, name, namespace).await
    }

    async fn write_peer_state(
        &self,
        peer: &VPNPeer,
        state: &PeerState,
    ) -> Result<(), kube::Error> {
        let name = peer.metadata.name.as_deref().unwrap_or_default();
        let namespace = peer.metadata.namespace.as_deref().unwrap_or_default();
        let status = json!({
            "state": state.state,
            "message": state.message,
        });

        patch_resource_status::<VPNPeer, Value>(
            &self.client,
            &status,
            name,
            namespace,
            None,
            &self.patch_params,
        )
        .await?;

        Ok(())
    }
}

/// Unset optional fields become `null` so the merge patch clears stale values.
fn status_with_explicit_nulls(status: &VPNServerStatus) -> Result<Value, kube::Error> {
    let mut value = serde_json::to_value(status).map_err(kube::Error::SerdeError)?;

    if let Some(fields) = value.as_object_mut() {
        for field in OPTIONAL_STATUS_FIELDS {
            fields.entry(field).or_insert(Value::Null);
        }
    }

    Ok(value)
}

const OPTIONAL_STATUS_FIELDS: [&str; 5] = [
    "publicKey",
    "endpoint",
    "connectedClients",
    "totalTraffic",
    "observedGeneration",
];

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};
    use vpn_fleet_core::resources::crd::v1alpha1::vpnserver::VPNServerStatus;

    use super::status_with_explicit_nulls;

    #[test]
    fn unset_status_fields_are_cleared() {
        let status = VPNServerStatus {
            replicas: 1,
            endpoint: Some("203.0.113.7:51820".to_owned()),
            ..Default::default()
        };

        let value = status_with_explicit_nulls(&status).unwrap();

        assert_eq!(value["endpoint"], "203.0.113.7:51820");
        assert_eq!(value["publicKey"], Value::Null);
        assert!(value.as_object().unwrap().contains_key("totalTraffic"));
    }
}
