use std::{net::Ipv4Addr, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ipnet::Ipv4Net;
use thiserror::Error;

use crate::{
    resources::key::ServerKey,
    wireguard::{interface::DeclaredPeer, keys::WgKey},
};

pub mod manager;

#[cfg(any(test, feature = "testing"))]
pub mod memory;

/// Peers that handshaked within this window count as connected.
pub const CONNECTED_WINDOW_SECS: i64 = 3 * 60;

/// Authoritative peer record of a server. Never carries the private key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub server: ServerKey,
    pub name: String,
    pub public_key: WgKey,
    pub address: Ipv4Addr,
    pub allowed_ips: Vec<Ipv4Net>,
    pub active: bool,
    /// rotation request the current key was issued for
    pub rotation: u32,
    pub last_handshake: Option<DateTime<Utc>>,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub created_at: DateTime<Utc>,
}

impl Peer {
    pub fn declared(&self) -> DeclaredPeer {
        DeclaredPeer {
            public_key: self.public_key,
            allowed_ips: self.allowed_ips.to_owned(),
        }
    }

    pub fn is_connected(&self, now: DateTime<Utc>) -> bool {
        self.last_handshake
            .map(|handshake| (now - handshake).num_seconds() <= CONNECTED_WINDOW_SECS)
            .unwrap_or(false)
    }

    pub fn summary(&self) -> PeerSummary {
        PeerSummary {
            name: self.name.to_owned(),
            public_key: self.public_key,
            address: self.address,
            allowed_ips: self.allowed_ips.to_owned(),
            active: self.active,
            rotation: self.rotation,
            last_handshake: self.last_handshake,
            rx_bytes: self.rx_bytes,
            tx_bytes: self.tx_bytes,
        }
    }
}

/// Public view of a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSummary {
    pub name: String,
    pub public_key: WgKey,
    pub address: Ipv4Addr,
    pub allowed_ips: Vec<Ipv4Net>,
    pub active: bool,
    pub rotation: u32,
    pub last_handshake: Option<DateTime<Utc>>,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Kubernetes API error! {}", .0)]
    Kube(#[from] kube::Error),
    #[error("Peer store call timed out after {:?}!", .0)]
    Timeout(Duration),
    #[error("Peer record '{}' can't be stored! {}", .0, .1)]
    InvalidRecord(String, String),
    #[error("Peer store is unavailable! {}", .0)]
    Unavailable(String),
}

#[async_trait]
pub trait PeerStore: Send + Sync {
    /// Every record of the server, active or not.
    async fn list(&self, server: &ServerKey) -> Result<Vec<Peer>, StoreError>;
    async fn save(&self, peer: &Peer) -> Result<(), StoreError>;
    async fn remove(&self, server: &ServerKey, name: &str) -> Result<(), StoreError>;
}

#[async_trait]
impl<T: PeerStore + ?Sized> PeerStore for Arc<T> {
    async fn list(&self, server: &ServerKey) -> Result<Vec<Peer>, StoreError> {
        (**self).list(server).await
    }

    async fn save(&self, peer: &Peer) -> Result<(), StoreError> {
        (**self).save(peer).await
    }

    async fn remove(&self, server: &ServerKey, name: &str) -> Result<(), StoreError> {
        (**self).remove(server, name).await
    }
}
