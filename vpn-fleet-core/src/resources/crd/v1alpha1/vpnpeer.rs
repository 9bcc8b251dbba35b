use std::fmt::Display;

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

/// A client-add request, its status carries the peer record.
#[skip_serializing_none]
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(
    group = "vpn-fleet.dev",
    version = "v1alpha1",
    kind = "VPNPeer",
    namespaced,
    status = "VPNPeerStatus",
    shortname = "vpnp",
    printcolumn = r#"{"name":"Server", "type":"string", "jsonPath":".spec.server"}"#,
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Address", "type":"string", "jsonPath":".status.address"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VPNPeerSpec {
    /// name of the VPNServer in the same namespace
    pub server: String,
    /// raising this value requests a key rotation
    #[serde(default)]
    pub rotation: u32,
}

#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VPNPeerStatus {
    pub state: VPNPeerState,
    pub public_key: Option<String>,
    pub address: Option<String>,
    pub allowed_ips: Option<Vec<String>>,
    #[serde(default)]
    pub active: bool,
    pub last_handshake: Option<DateTime<Utc>>,
    pub rx_bytes: Option<u64>,
    pub tx_bytes: Option<u64>,
    /// rotation the current key was issued for, written together with the key
    pub observed_rotation: Option<u32>,
    pub created_at: Option<DateTime<Utc>>,
    pub message: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum VPNPeerState {
    #[default]
    Pending,
    Active,
    Revoked,
    ErrorDuplicateName,
    ErrorPoolExhausted,
    ErrorInterfaceSync,
    ErrorServerNotReady,
}

impl Display for VPNPeerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VPNPeerState::Pending => f.write_str("waiting for the controller"),
            VPNPeerState::Active => f.write_str("active"),
            VPNPeerState::Revoked => f.write_str("revoked"),
            VPNPeerState::ErrorDuplicateName => {
                f.write_str("another peer with this name exists on the server")
            }
            VPNPeerState::ErrorPoolExhausted => f.write_str("server address pool is exhausted"),
            VPNPeerState::ErrorInterfaceSync => {
                f.write_str("couldn't apply the peer to the live interface")
            }
            VPNPeerState::ErrorServerNotReady => f.write_str("server isn't ready yet"),
        }
    }
}
