use std::{collections::HashMap, fmt::Display, future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ipnet::Ipv4Net;
use log::{debug, info, warn};
use thiserror::Error;

use crate::{helpers::with_timeout, resources::key::ServerKey};

use super::keys::WgKey;

/// Live tunnel interface of a server, or of one of its instances.
///
/// Commands sent to a server-wide target reach every instance it currently has.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InterfaceTarget {
    pub server: ServerKey,
    pub interface: String,
    pub instance: Option<String>,
}

impl InterfaceTarget {
    pub fn new(server: ServerKey, interface: impl Into<String>) -> Self {
        Self {
            server,
            interface: interface.into(),
            instance: None,
        }
    }

    pub fn on_instance(&self, instance: impl Into<String>) -> Self {
        Self {
            instance: Some(instance.into()),
            ..self.to_owned()
        }
    }
}

impl Display for InterfaceTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.instance {
            Some(instance) => write!(f, "{} ({} on {instance})", self.server, self.interface),
            None => write!(f, "{} ({})", self.server, self.interface),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclaredPeer {
    pub public_key: WgKey,
    pub allowed_ips: Vec<Ipv4Net>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LivePeer {
    pub public_key: WgKey,
    pub allowed_ips: Vec<Ipv4Net>,
    pub last_handshake: Option<DateTime<Utc>>,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

impl LivePeer {
    pub fn new(public_key: WgKey, allowed_ips: Vec<Ipv4Net>) -> Self {
        Self {
            public_key,
            allowed_ips,
            last_handshake: None,
            rx_bytes: 0,
            tx_bytes: 0,
        }
    }
}

#[derive(Debug, Error)]
pub enum InterfaceError {
    #[error("Interface command failed! {}", .0)]
    Command(String),
    #[error("Couldn't parse the interface status! {}", .0)]
    Status(String),
    #[error("Interface call timed out after {:?}!", .0)]
    Timeout(Duration),
    #[error("No live instance of {} is available!", .0)]
    Unavailable(String),
}

/// Incremental, per-peer control over a live tunnel interface.
///
/// Implementations must never reinitialize the whole interface to apply
/// a single peer change, other peers' sessions have to survive every call.
#[async_trait]
pub trait InterfaceControl: Send + Sync {
    async fn add_peer(
        &self,
        target: &InterfaceTarget,
        key: &WgKey,
        allowed_ips: &[Ipv4Net],
    ) -> Result<(), InterfaceError>;

    async fn remove_peer(&self, target: &InterfaceTarget, key: &WgKey)
        -> Result<(), InterfaceError>;

    async fn set_allowed_ips(
        &self,
        target: &InterfaceTarget,
        key: &WgKey,
        allowed_ips: &[Ipv4Net],
    ) -> Result<(), InterfaceError>;

    async fn query_status(&self, target: &InterfaceTarget) -> Result<Vec<LivePeer>, InterfaceError>;

    /// Per-instance targets of a server-wide target.
    async fn instances(&self, target: &InterfaceTarget) -> Result<Vec<InterfaceTarget>, InterfaceError> {
        Ok(vec![target.to_owned()])
    }
}

#[async_trait]
impl<T: InterfaceControl + ?Sized> InterfaceControl for Arc<T> {
    async fn add_peer(
        &self,
        target: &InterfaceTarget,
        key: &WgKey,
        allowed_ips: &[Ipv4Net],
    ) -> Result<(), InterfaceError> {
        (**self).add_peer(target, key, allowed_ips).await
    }

    async fn remove_peer(
        &self,
        target: &InterfaceTarget,
        key: &WgKey,
    ) -> Result<(), InterfaceError> {
        (**self).remove_peer(target, key).await
    }

    async fn set_allowed_ips(
        &self,
        target: &InterfaceTarget,
        key: &WgKey,
        allowed_ips: &[Ipv4Net],
    ) -> Result<(), InterfaceError> {
        (**self).set_allowed_ips(target, key, allowed_ips).await
    }

    async fn query_status(&self, target: &InterfaceTarget) -> Result<Vec<LivePeer>, InterfaceError> {
        (**self).query_status(target).await
    }

    async fn instances(&self, target: &InterfaceTarget) -> Result<Vec<InterfaceTarget>, InterfaceError> {
        (**self).instances(target).await
    }
}

#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// total attempts per command, at least one is always made
    pub attempts: u32,
    pub timeout: Duration,
    pub retry_delay: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            attempts: 3,
            timeout: Duration::from_secs(10),
            retry_delay: Duration::from_millis(250),
        }
    }
}

#[derive(Debug, Default)]
pub struct SyncReport {
    pub added: Vec<WgKey>,
    pub updated: Vec<WgKey>,
    pub removed: Vec<WgKey>,
    pub failed: Vec<(WgKey, InterfaceError)>,
    /// status of the declared peers that were already live before the pass,
    /// merged across instances
    pub live: Vec<LivePeer>,
}

impl SyncReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn changes(&self) -> usize {
        self.added.len() + self.updated.len() + self.removed.len()
    }
}

/// Applies peer changes to a live interface with bounded retries and a timeout on every call.
pub struct InterfaceSynchronizer<'a, C: ?Sized> {
    control: &'a C,
    settings: &'a SyncSettings,
}

impl<'a, C: InterfaceControl + ?Sized> InterfaceSynchronizer<'a, C> {
    pub fn new(control: &'a C, settings: &'a SyncSettings) -> Self {
        Self { control, settings }
    }

    pub async fn add_peer(
        &self,
        target: &InterfaceTarget,
        key: &WgKey,
        allowed_ips: &[Ipv4Net],
    ) -> Result<(), InterfaceError> {
        info!("Adding peer {key} to {target}...");

        self.attempt("add a peer", || self.control.add_peer(target, key, allowed_ips))
            .await
    }

    pub async fn remove_peer(&self, target: &InterfaceTarget, key: &WgKey) -> Result<(), InterfaceError> {
        info!("Removing peer {key} from {target}...");

        self.attempt("remove a peer", || self.control.remove_peer(target, key))
            .await
    }

    pub async fn set_allowed_ips(
        &self,
        target: &InterfaceTarget,
        key: &WgKey,
        allowed_ips: &[Ipv4Net],
    ) -> Result<(), InterfaceError> {
        info!("Updating allowed IPs of peer {key} on {target}...");

        self.attempt("update allowed IPs", || {
            self.control.set_allowed_ips(target, key, allowed_ips)
        })
        .await
    }

    pub async fn query_status(&self, target: &InterfaceTarget) -> Result<Vec<LivePeer>, InterfaceError> {
        self.attempt("query the interface", || self.control.query_status(target))
            .await
    }

    /// Brings every instance of the live interface in line with `declared` using only
    /// per-peer commands. Each instance is compared and corrected on its own.
    ///
    /// A failing command is recorded in the report and doesn't stop the remaining peers
    /// from being applied. Only a failure to read the live state aborts the pass, before
    /// any command is sent.
    pub async fn synchronize(
        &self,
        target: &InterfaceTarget,
        declared: &[DeclaredPeer],
    ) -> Result<SyncReport, InterfaceError> {
        let instances = self
            .attempt("list the instances", || self.control.instances(target))
            .await?;

        if instances.is_empty() {
            return Err(InterfaceError::Unavailable(target.to_string()));
        }

        let mut statuses = Vec::with_capacity(instances.len());

        for instance in instances {
            let live = self.query_status(&instance).await?;

            statuses.push((instance, live));
        }

        let mut report = SyncReport::default();
        let mut observed = Vec::with_capacity(statuses.len());

        for (instance, live) in statuses {
            observed.push(self.synchronize_instance(&instance, declared, live, &mut report).await);
        }

        report.live = merge_live(observed);

        debug!(
            "Synchronized {target} with {} change(s) and {} failure(s)!",
            report.changes(),
            report.failed.len()
        );

        Ok(report)
    }

    /// Returns the declared peers that were live on the instance.
    async fn synchronize_instance(
        &self,
        instance: &InterfaceTarget,
        declared: &[DeclaredPeer],
        live: Vec<LivePeer>,
        report: &mut SyncReport,
    ) -> Vec<LivePeer> {
        let mut live = live
            .into_iter()
            .map(|peer| (peer.public_key, peer))
            .collect::<HashMap<_, _>>();
        let mut observed = Vec::new();

        // additions go first so an address moving between keys is never left unrouted
        for peer in declared {
            let key = peer.public_key;

            match live.remove(&key) {
                Some(live_peer) => {
                    if !same_networks(&live_peer.allowed_ips, &peer.allowed_ips) {
                        match self.set_allowed_ips(instance, &key, &peer.allowed_ips).await {
                            Ok(_) => report.updated.push(key),
                            Err(error) => report.failed.push((key, error)),
                        }
                    }

                    observed.push(live_peer);
                }
                None => match self.add_peer(instance, &key, &peer.allowed_ips).await {
                    Ok(_) => report.added.push(key),
                    Err(error) => report.failed.push((key, error)),
                },
            }
        }

        for key in live.into_keys() {
            match self.remove_peer(instance, &key).await {
                Ok(_) => report.removed.push(key),
                Err(error) => report.failed.push((key, error)),
            }
        }

        observed
    }

    async fn attempt<T, F, Fut>(&self, description: &str, mut call: F) -> Result<T, InterfaceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, InterfaceError>>,
    {
        let attempts = self.settings.attempts.max(1);
        let mut attempt = 1;

        loop {
            let result = with_timeout(self.settings.timeout, call())
                .await
                .unwrap_or(Err(InterfaceError::Timeout(self.settings.timeout)));

            match result {
                Ok(value) => return Ok(value),
                Err(error) if attempt >= attempts => return Err(error),
                Err(error) => {
                    warn!("Attempt {attempt}/{attempts} to {description} failed! {error}");

                    tokio::time::sleep(self.settings.retry_delay * attempt).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// Folds the status of several instances into one entry per key.
///
/// A client is connected to one instance at a time, so traffic adds up and
/// the latest handshake wins.
pub fn merge_live(instances: Vec<Vec<LivePeer>>) -> Vec<LivePeer> {
    let mut merged: HashMap<WgKey, LivePeer> = HashMap::new();

    for peer in instances.into_iter().flatten() {
        match merged.get_mut(&peer.public_key) {
            Some(existing) => {
                existing.rx_bytes += peer.rx_bytes;
                existing.tx_bytes += peer.tx_bytes;
                existing.last_handshake = existing.last_handshake.max(peer.last_handshake);
            }
            None => {
                merged.insert(peer.public_key, peer);
            }
        }
    }

    merged.into_values().collect()
}

fn same_networks(left: &[Ipv4Net], right: &[Ipv4Net]) -> bool {
    let mut left = left.to_vec();
    let mut right = right.to_vec();

    left.sort_unstable();
    right.sort_unstable();

    left == right
}
