use std::{
    collections::HashMap,
    future::Future,
    net::{IpAddr, Ipv4Addr},
    sync::Arc,
    time::Duration,
};

use chrono::Utc;
use ipnet::{IpNet, Ipv4Net};
use log::{error, info, warn};
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::{
    helpers::with_timeout,
    ip::allocations::{AddressAllocator, AllocationsError},
    resources::key::ServerKey,
    wireguard::{
        interface::{
            InterfaceControl, InterfaceError, InterfaceSynchronizer, InterfaceTarget, LivePeer,
            SyncSettings,
        },
        keys::{KeyGenerationError, KeyGenerator, OsKeyGenerator, WgKey},
        peer_config::PeerConfig,
    },
};

use super::{Peer, PeerStore, PeerSummary, StoreError};

/// Everything the manager needs to know about a server to hand out peers.
#[derive(Debug, Clone)]
pub struct ServerProfile {
    pub target: InterfaceTarget,
    /// server address with the prefix of its peer pool
    pub address: Ipv4Net,
    pub dns: Option<IpAddr>,
    pub client_allowed_ips: Vec<IpNet>,
    pub endpoint: Option<String>,
    pub public_key: WgKey,
    pub keepalive: u16,
}

impl ServerProfile {
    pub fn key(&self) -> &ServerKey {
        &self.target.server
    }

    pub fn pool(&self) -> Ipv4Net {
        self.address.trunc()
    }
}

#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub api_timeout: Duration,
    pub sync: SyncSettings,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            api_timeout: Duration::from_secs(10),
            sync: SyncSettings::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("Peer '{}' already exists on this server!", .0)]
    DuplicateName(String),
    #[error("Peer '{}' doesn't exist on this server!", .0)]
    NotFound(String),
    #[error("Key of peer '{}' already answers rotation {}!", .0, .1)]
    AlreadyRotated(String, u32),
    #[error("No free addresses left on {}!", .0)]
    PoolExhausted(ServerKey),
    #[error("Couldn't apply the peer to the live interface! {}", .0)]
    InterfaceSync(#[from] InterfaceError),
    #[error("Couldn't generate keys! {}", .0)]
    KeyGeneration(#[from] KeyGenerationError),
    #[error("Peer store error! {}", .0)]
    Store(#[from] StoreError),
    #[error("Server is not usable for peers! {}", .0)]
    InvalidServer(String),
}

impl PeerError {
    /// Errors worth retrying later, everything else is a rejected operation.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::InterfaceSync(_) | Self::Store(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevokeOutcome {
    Revoked(Ipv4Addr),
    AlreadyRevoked,
}

#[derive(Debug, Default)]
pub struct SyncOutcome {
    pub peers: Vec<PeerSummary>,
    pub connected_clients: u32,
    pub total_traffic: u64,
    pub changes: usize,
    pub failures: Vec<(WgKey, InterfaceError)>,
}

impl SyncOutcome {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Creates, rotates and revokes peers of every server.
///
/// Operations on a single server are serialized. The address pool is never cached,
/// each operation rebuilds it from the stored records.
pub struct PeerManager<S, I, K = OsKeyGenerator> {
    store: S,
    interface: I,
    keys: K,
    settings: ManagerSettings,
    servers: Mutex<HashMap<ServerKey, Arc<Mutex<()>>>>,
}

impl<S: PeerStore, I: InterfaceControl> PeerManager<S, I> {
    pub fn new(store: S, interface: I, settings: ManagerSettings) -> Self {
        Self::with_key_generator(store, interface, OsKeyGenerator, settings)
    }
}

impl<S: PeerStore, I: InterfaceControl, K: KeyGenerator> PeerManager<S, I, K> {
    pub fn with_key_generator(store: S, interface: I, keys: K, settings: ManagerSettings) -> Self {
        Self {
            store,
            interface,
            keys,
            settings,
            servers: Mutex::new(HashMap::new()),
        }
    }

    /// Adds a new peer. `rotation` is the rotation request its first key answers.
    pub async fn create_peer(
        &self,
        profile: &ServerProfile,
        name: &str,
        rotation: u32,
    ) -> Result<PeerConfig, PeerError> {
        let server = profile.key();
        let _guard = self.lock(server).await;
        let (records, allocator) = self.load_pool(profile).await?;

        if records.iter().any(|peer| peer.active && peer.name == name) {
            return Err(PeerError::DuplicateName(name.to_owned()));
        }

        let address = allocator.allocate(name).await.map_err(|error| match error {
            AllocationsError::RangeExhausted => PeerError::PoolExhausted(server.to_owned()),
            other => PeerError::InvalidServer(other.to_string()),
        })?;

        let (private_key, public_key) = match self.generate_keys() {
            Ok(keys) => keys,
            Err(error) => {
                allocator.release(&address).await;
                return Err(error);
            }
        };

        let peer = Peer {
            server: server.to_owned(),
            name: name.to_owned(),
            public_key,
            address,
            allowed_ips: vec![Ipv4Net::from(address)],
            active: true,
            rotation,
            last_handshake: None,
            rx_bytes: 0,
            tx_bytes: 0,
            created_at: Utc::now(),
        };

        if let Err(error) = self.store_call(self.store.save(&peer)).await {
            allocator.release(&address).await;
            return Err(error.into());
        }

        let synchronizer = self.synchronizer();

        if let Err(error) = synchronizer
            .add_peer(&profile.target, &public_key, &peer.allowed_ips)
            .await
        {
            warn!("Rolling back peer '{name}' on {server}! {error}");

            // the key might have landed on some of the instances
            if let Err(cleanup) = synchronizer.remove_peer(&profile.target, &public_key).await {
                warn!("Couldn't clean up the half-added peer '{name}'! {cleanup}");
            }

            if let Err(rollback) = self.store_call(self.store.remove(server, name)).await {
                error!("Couldn't remove the record of peer '{name}' after a failed add! {rollback}");
            }

            allocator.release(&address).await;

            return Err(error.into());
        }

        info!("Created peer '{name}' ({address}) on {server}!");

        self.peer_config(profile, &peer, private_key)
    }

    pub async fn revoke_peer(&self, target: &InterfaceTarget, name: &str) -> Result<RevokeOutcome, PeerError> {
        let server = &target.server;
        let _guard = self.lock(server).await;
        let peer = self
            .store_call(self.store.list(server))
            .await?
            .into_iter()
            .find(|peer| peer.name == name)
            .ok_or_else(|| PeerError::NotFound(name.to_owned()))?;

        if !peer.active {
            info!("Peer '{name}' on {server} is already revoked!");

            return Ok(RevokeOutcome::AlreadyRevoked);
        }

        let revoked = Peer {
            active: false,
            ..peer.clone()
        };

        self.store_call(self.store.save(&revoked)).await?;

        if let Err(error) = self
            .synchronizer()
            .remove_peer(target, &peer.public_key)
            .await
        {
            warn!("Couldn't remove peer '{name}' from {server}, restoring its record! {error}");

            // the key is still live, its address has to stay taken
            if let Err(restore) = self.store_call(self.store.save(&peer)).await {
                error!("Couldn't restore the record of peer '{name}'! {restore}");
            }

            return Err(error.into());
        }

        info!("Revoked peer '{name}' on {server}, released {}!", peer.address);

        Ok(RevokeOutcome::Revoked(peer.address))
    }

    pub async fn list_peers(&self, server: &ServerKey) -> Result<Vec<PeerSummary>, PeerError> {
        let mut peers = self
            .store_call(self.store.list(server))
            .await?
            .iter()
            .map(Peer::summary)
            .collect::<Vec<_>>();

        peers.sort_by(|a, b| a.address.cmp(&b.address).then_with(|| a.name.cmp(&b.name)));

        Ok(peers)
    }

    /// Swaps the peer's key on the live interface and in its record.
    ///
    /// The new key is added before the old one is removed, so the peer's address
    /// is routed to a valid key for the whole operation. A request the stored key
    /// already answers is rejected with `AlreadyRotated`, each rotation request
    /// swaps the key once.
    pub async fn rotate_key(
        &self,
        profile: &ServerProfile,
        name: &str,
        rotation: u32,
    ) -> Result<PeerConfig, PeerError> {
        let server = profile.key();
        let target = &profile.target;
        let _guard = self.lock(server).await;
        let current = self
            .store_call(self.store.list(server))
            .await?
            .into_iter()
            .find(|peer| peer.active && peer.name == name)
            .ok_or_else(|| PeerError::NotFound(name.to_owned()))?;

        if current.rotation >= rotation {
            return Err(PeerError::AlreadyRotated(name.to_owned(), current.rotation));
        }

        let (private_key, public_key) = self.generate_keys()?;
        let synchronizer = self.synchronizer();

        if let Err(error) = synchronizer
            .add_peer(target, &public_key, &current.allowed_ips)
            .await
        {
            warn!("Couldn't add the rotated key of peer '{name}'! {error}");

            self.restore_key(target, &current, &public_key).await;

            return Err(error.into());
        }

        let rotated = Peer {
            public_key,
            rotation,
            last_handshake: None,
            rx_bytes: 0,
            tx_bytes: 0,
            ..current.clone()
        };

        if let Err(error) = self.store_call(self.store.save(&rotated)).await {
            warn!("Couldn't store the rotated key of peer '{name}', reverting! {error}");

            self.restore_key(target, &current, &public_key).await;

            return Err(error.into());
        }

        if let Err(error) = synchronizer.remove_peer(target, &current.public_key).await {
            warn!(
                "Old key of peer '{name}' is still live on {server}, it'll be removed on the next sync! {error}"
            );
        }

        info!("Rotated the key of peer '{name}' on {server}!");

        self.peer_config(profile, &rotated, private_key)
    }

    /// Applies every active record to the live interface and refreshes the peers' telemetry.
    pub async fn sync_server(&self, target: &InterfaceTarget) -> Result<SyncOutcome, PeerError> {
        let server = &target.server;
        let _guard = self.lock(server).await;
        let mut records = self.store_call(self.store.list(server)).await?;
        records.retain(|peer| peer.active);

        let declared = records.iter().map(Peer::declared).collect::<Vec<_>>();
        let report = self.synchronizer().synchronize(target, &declared).await?;
        let live = report
            .live
            .iter()
            .map(|peer| (peer.public_key, peer))
            .collect::<HashMap<_, _>>();
        let now = Utc::now();
        let mut outcome = SyncOutcome {
            changes: report.changes(),
            ..Default::default()
        };

        for record in records.iter_mut() {
            if let Some(live) = live.get(&record.public_key) {
                if refresh_telemetry(record, live) {
                    if let Err(error) = self.store_call(self.store.save(record)).await {
                        warn!("Couldn't store telemetry of peer '{}'! {error}", record.name);
                    }
                }
            }

            if record.is_connected(now) {
                outcome.connected_clients += 1;
            }

            outcome.total_traffic += record.rx_bytes + record.tx_bytes;
            outcome.peers.push(record.summary());
        }

        outcome.failures = report.failed;

        Ok(outcome)
    }

    /// Addresses currently taken by active peers, as rebuilt from the records.
    pub async fn addresses_in_use(&self, profile: &ServerProfile) -> Result<Vec<Ipv4Addr>, PeerError> {
        let _guard = self.lock(profile.key()).await;
        let (_, allocator) = self.load_pool(profile).await?;

        Ok(allocator.in_use().await)
    }

    /// Drops the per-server lock once the server is gone.
    pub async fn forget_server(&self, server: &ServerKey) {
        self.servers.lock().await.remove(server);
    }

    async fn lock(&self, server: &ServerKey) -> OwnedMutexGuard<()> {
        let slot = self
            .servers
            .lock()
            .await
            .entry(server.to_owned())
            .or_default()
            .clone();

        slot.lock_owned().await
    }

    /// Rebuilds the server's pool from its records. Active records that collide with
    /// an older one are deactivated.
    async fn load_pool(&self, profile: &ServerProfile) -> Result<(Vec<Peer>, AddressAllocator), PeerError> {
        let mut records = self.store_call(self.store.list(profile.key())).await?;

        records.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.name.cmp(&b.name))
        });

        let (allocator, troublemakers) = AddressAllocator::from_records(
            profile.address,
            profile.address.addr(),
            records
                .iter()
                .filter(|peer| peer.active)
                .map(|peer| (peer.name.as_str(), peer.address)),
        );
        let troublemakers = troublemakers
            .into_iter()
            .map(|(name, _)| name.to_owned())
            .collect::<Vec<_>>();

        for record in records.iter_mut() {
            if troublemakers.contains(&record.name) {
                warn!(
                    "Deactivating peer '{}' on {}, its address {} conflicts with the pool!",
                    record.name,
                    profile.key(),
                    record.address
                );

                record.active = false;
                self.store_call(self.store.save(record)).await?;
            }
        }

        Ok((records, allocator))
    }

    fn generate_keys(&self) -> Result<(WgKey, WgKey), PeerError> {
        match self.keys.generate()?.split() {
            (Some(private), public) => Ok((private, public)),
            (None, _) => Err(KeyGenerationError::PublicOnly.into()),
        }
    }

    /// Puts the previous key back in charge of the peer's addresses and drops the new one.
    async fn restore_key(&self, target: &InterfaceTarget, previous: &Peer, new_key: &WgKey) {
        let synchronizer = self.synchronizer();

        if let Err(error) = synchronizer
            .set_allowed_ips(target, &previous.public_key, &previous.allowed_ips)
            .await
        {
            error!("Couldn't restore allowed IPs of peer '{}'! {error}", previous.name);
        }

        if let Err(error) = synchronizer.remove_peer(target, new_key).await {
            warn!("Couldn't remove the discarded key of peer '{}'! {error}", previous.name);
        }
    }

    fn synchronizer(&self) -> InterfaceSynchronizer<'_, I> {
        InterfaceSynchronizer::new(&self.interface, &self.settings.sync)
    }

    async fn store_call<T>(
        &self,
        call: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        with_timeout(self.settings.api_timeout, call)
            .await
            .unwrap_or(Err(StoreError::Timeout(self.settings.api_timeout)))
    }

    fn peer_config(&self, profile: &ServerProfile, peer: &Peer, private_key: WgKey) -> Result<PeerConfig, PeerError> {
        let address = Ipv4Net::new(peer.address, profile.address.prefix_len())
            .map_err(|error| PeerError::InvalidServer(error.to_string()))?;

        Ok(PeerConfig::new(
            peer.name.to_owned(),
            address,
            profile.dns,
            private_key,
            peer.public_key,
            profile.public_key,
            profile.endpoint.to_owned(),
            profile.client_allowed_ips.to_owned(),
            profile.keepalive,
        ))
    }
}

fn refresh_telemetry(record: &mut Peer, live: &LivePeer) -> bool {
    let changed = record.last_handshake != live.last_handshake
        || record.rx_bytes != live.rx_bytes
        || record.tx_bytes != live.tx_bytes;

    record.last_handshake = live.last_handshake;
    record.rx_bytes = live.rx_bytes;
    record.tx_bytes = live.tx_bytes;

    changed
}
