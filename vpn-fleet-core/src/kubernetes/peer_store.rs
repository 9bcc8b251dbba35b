use std::net::Ipv4Addr;

use async_trait::async_trait;
use ipnet::Ipv4Net;
use kube::{
    api::{ListParams, PatchParams},
    Client, ResourceExt,
};
use log::warn;
use serde_json::{json, Value};

use crate::{
    kubernetes::{is_not_found, operations::list_resources, GetApi},
    peers::{Peer, PeerStore, StoreError},
    resources::{
        crd::v1alpha1::vpnpeer::{VPNPeer, VPNPeerState},
        key::ServerKey,
    },
    wireguard::keys::WgKey,
};

/// Keeps peer records in the status of their `VPNPeer` objects.
#[derive(Clone)]
pub struct KubePeerStore {
    client: Client,
    patch_params: PatchParams,
}

impl KubePeerStore {
    pub fn new(client: Client, field_manager: &str) -> Self {
        Self {
            client,
            patch_params: PatchParams::apply(field_manager),
        }
    }

    async fn patch(&self, namespace: &str, name: &str, status: Value) -> Result<(), StoreError> {
        let api = self.client.namespaced_api::<VPNPeer>(namespace);

        api.patch_status(
            name,
            &self.patch_params,
            &kube::api::Patch::Merge(json!({ "status": status })),
        )
        .await?;

        Ok(())
    }
}

#[async_trait]
impl PeerStore for KubePeerStore {
    async fn list(&self, server: &ServerKey) -> Result<Vec<Peer>, StoreError> {
        let objects =
            list_resources::<VPNPeer>(&self.client, &server.namespace, &ListParams::default())
                .await?;

        Ok(objects
            .iter()
            .filter(|object| object.spec.server == server.name)
            .filter_map(|object| match peer_from_object(server, object) {
                Ok(peer) => peer,
                Err(error) => {
                    warn!("Skipping an unreadable peer record! {error}");
                    None
                }
            })
            .collect())
    }

    async fn save(&self, peer: &Peer) -> Result<(), StoreError> {
        let state = match peer.active {
            true => VPNPeerState::Active,
            false => VPNPeerState::Revoked,
        };
        let status = json!({
            "state": state,
            "publicKey": peer.public_key.to_base64(),
            "address": peer.address.to_string(),
            "allowedIps": peer.allowed_ips.iter().map(|ip| ip.to_string()).collect::<Vec<_>>(),
            "active": peer.active,
            "observedRotation": peer.rotation,
            "lastHandshake": peer.last_handshake,
            "rxBytes": peer.rx_bytes,
            "txBytes": peer.tx_bytes,
            "createdAt": peer.created_at,
            "message": Value::Null,
        });

        self.patch(&peer.server.namespace, &peer.name, status).await
    }

    async fn remove(&self, server: &ServerKey, name: &str) -> Result<(), StoreError> {
        let status = json!({
            "state": VPNPeerState::Pending,
            "publicKey": Value::Null,
            "address": Value::Null,
            "allowedIps": Value::Null,
            "active": false,
            "observedRotation": Value::Null,
            "lastHandshake": Value::Null,
            "rxBytes": Value::Null,
            "txBytes": Value::Null,
            "createdAt": Value::Null,
        });

        match self.patch(&server.namespace, name, status).await {
            Err(StoreError::Kube(error)) if is_not_found(&error) => Ok(()),
            result => result,
        }
    }
}

/// `Ok(None)` for objects that don't hold a record (yet).
fn peer_from_object(server: &ServerKey, object: &VPNPeer) -> Result<Option<Peer>, StoreError> {
    let name = object.name_any();
    let status = match &object.status {
        Some(status) => status,
        None => return Ok(None),
    };
    let (public_key, address, created_at) =
        match (&status.public_key, &status.address, status.created_at) {
            (Some(public_key), Some(address), Some(created_at)) => (public_key, address, created_at),
            _ => return Ok(None),
        };
    let invalid = |reason: &str| StoreError::InvalidRecord(name.to_owned(), reason.to_owned());

    let public_key = WgKey::from_base64(public_key).map_err(|_| invalid("public key"))?;
    let address = address
        .parse::<Ipv4Addr>()
        .map_err(|_| invalid("address"))?;
    let allowed_ips = match &status.allowed_ips {
        Some(allowed_ips) => allowed_ips
            .iter()
            .map(|ip| ip.parse::<Ipv4Net>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| invalid("allowed IPs"))?,
        None => vec![Ipv4Net::from(address)],
    };

    Ok(Some(Peer {
        server: server.to_owned(),
        name,
        public_key,
        address,
        allowed_ips,
        active: status.active,
        rotation: status.observed_rotation.unwrap_or_default(),
        last_handshake: status.last_handshake,
        rx_bytes: status.rx_bytes.unwrap_or_default(),
        tx_bytes: status.tx_bytes.unwrap_or_default(),
        created_at,
    }))
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use kube::core::ObjectMeta;

    use crate::{
        resources::{
            crd::v1alpha1::vpnpeer::{VPNPeer, VPNPeerSpec, VPNPeerState, VPNPeerStatus},
            key::ServerKey,
        },
        wireguard::keys::{KeyGenerator, OsKeyGenerator},
    };

    use super::peer_from_object;

    fn object(status: Option<VPNPeerStatus>) -> VPNPeer {
        VPNPeer {
            metadata: ObjectMeta {
                name: Some("alice".to_owned()),
                namespace: Some("vpn".to_owned()),
                ..Default::default()
            },
            spec: VPNPeerSpec {
                server: "edge".to_owned(),
                rotation: 0,
            },
            status,
        }
    }

    #[test]
    fn pending_objects_hold_no_record() {
        let server = ServerKey::new("vpn", "edge");

        assert!(peer_from_object(&server, &object(None)).unwrap().is_none());
        assert!(peer_from_object(&server, &object(Some(VPNPeerStatus::default())))
            .unwrap()
            .is_none());
    }

    #[test]
    fn status_is_read_back_into_a_record() {
        let server = ServerKey::new("vpn", "edge");
        let key = *OsKeyGenerator.generate().unwrap().get_public_key();
        let status = VPNPeerStatus {
            state: VPNPeerState::Active,
            public_key: Some(key.to_base64()),
            address: Some("10.0.0.3".to_owned()),
            allowed_ips: Some(vec!["10.0.0.3/32".to_owned()]),
            active: true,
            observed_rotation: Some(2),
            rx_bytes: Some(10),
            created_at: Some(Utc::now()),
            ..Default::default()
        };

        let peer = peer_from_object(&server, &object(Some(status))).unwrap().unwrap();

        assert_eq!(peer.name, "alice");
        assert_eq!(peer.public_key, key);
        assert_eq!(peer.address.to_string(), "10.0.0.3");
        assert_eq!(peer.rx_bytes, 10);
        assert_eq!(peer.rotation, 2);
        assert!(peer.active);
    }

    #[test]
    fn malformed_records_are_reported() {
        let server = ServerKey::new("vpn", "edge");
        let status = VPNPeerStatus {
            public_key: Some("nope".to_owned()),
            address: Some("10.0.0.3".to_owned()),
            created_at: Some(Utc::now()),
            ..Default::default()
        };

        assert!(peer_from_object(&server, &object(Some(status))).is_err());
    }
}
