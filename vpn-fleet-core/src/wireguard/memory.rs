use std::{
    collections::{BTreeMap, HashMap},
    sync::{Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ipnet::Ipv4Net;

use super::{
    interface::{merge_live, InterfaceControl, InterfaceError, InterfaceTarget, LivePeer},
    keys::WgKey,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterfaceCommand {
    Add { key: WgKey, allowed_ips: Vec<Ipv4Net> },
    Remove { key: WgKey },
    SetAllowedIps { key: WgKey, allowed_ips: Vec<Ipv4Net> },
}

impl InterfaceCommand {
    pub fn key(&self) -> &WgKey {
        match self {
            Self::Add { key, .. } => key,
            Self::Remove { key } => key,
            Self::SetAllowedIps { key, .. } => key,
        }
    }
}

#[derive(Default)]
struct MemoryState {
    interfaces: HashMap<InterfaceTarget, BTreeMap<WgKey, LivePeer>>,
    instances: HashMap<InterfaceTarget, Vec<String>>,
    commands: Vec<InterfaceCommand>,
    /// live keys after every applied command
    history: Vec<Vec<WgKey>>,
    failing_adds: HashMap<WgKey, u32>,
    failing_any_adds: u32,
    failing_removes: u32,
    failing_queries: u32,
}

/// In-memory interface that behaves like `wg set`: allowed IPs are exclusive
/// across peers and per-peer commands leave every other peer untouched.
///
/// A server runs as a single interface until instances are registered for it,
/// server-wide commands then reach each of them.
#[derive(Default)]
pub struct MemoryInterface {
    state: Mutex<MemoryState>,
}

impl MemoryInterface {
    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_instances(&self, target: &InterfaceTarget, names: &[&str]) {
        self.state()
            .instances
            .entry(target.to_owned())
            .or_default()
            .extend(names.iter().map(|name| name.to_string()));
    }

    pub fn commands(&self) -> Vec<InterfaceCommand> {
        self.state().commands.clone()
    }

    pub fn clear_commands(&self) {
        let mut state = self.state();

        state.commands.clear();
        state.history.clear();
    }

    pub fn history(&self) -> Vec<Vec<WgKey>> {
        self.state().history.clone()
    }

    pub fn peers(&self, target: &InterfaceTarget) -> Vec<LivePeer> {
        self.state()
            .interfaces
            .get(target)
            .map(|peers| peers.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn peer(&self, target: &InterfaceTarget, key: &WgKey) -> Option<LivePeer> {
        self.state()
            .interfaces
            .get(target)
            .and_then(|peers| peers.get(key))
            .cloned()
    }

    pub fn record_handshake(
        &self,
        target: &InterfaceTarget,
        key: &WgKey,
        at: DateTime<Utc>,
        rx_bytes: u64,
        tx_bytes: u64,
    ) {
        if let Some(peer) = self
            .state()
            .interfaces
            .get_mut(target)
            .and_then(|peers| peers.get_mut(key))
        {
            peer.last_handshake = Some(at);
            peer.rx_bytes = rx_bytes;
            peer.tx_bytes = tx_bytes;
        }
    }

    /// Makes the next `times` additions of `key` fail.
    pub fn fail_adds_for(&self, key: WgKey, times: u32) {
        self.state().failing_adds.insert(key, times);
    }

    /// Makes the next `times` additions fail, whatever the key.
    pub fn fail_adds(&self, times: u32) {
        self.state().failing_any_adds = times;
    }

    pub fn fail_removes(&self, times: u32) {
        self.state().failing_removes = times;
    }

    pub fn fail_queries(&self, times: u32) {
        self.state().failing_queries = times;
    }

    fn apply(state: &mut MemoryState, target: &InterfaceTarget, command: InterfaceCommand) {
        for instance in state.resolve(target) {
            Self::apply_on(state, &instance, command.clone());
        }
    }

    fn apply_on(state: &mut MemoryState, target: &InterfaceTarget, command: InterfaceCommand) {
        let peers = state.interfaces.entry(target.to_owned()).or_default();

        match &command {
            InterfaceCommand::Add { key, allowed_ips }
            | InterfaceCommand::SetAllowedIps { key, allowed_ips } => {
                for (other_key, other) in peers.iter_mut() {
                    if other_key != key {
                        other.allowed_ips.retain(|ip| !allowed_ips.contains(ip));
                    }
                }

                peers
                    .entry(*key)
                    .or_insert_with(|| LivePeer::new(*key, Vec::new()))
                    .allowed_ips = allowed_ips.to_owned();
            }
            InterfaceCommand::Remove { key } => {
                peers.remove(key);
            }
        }

        let snapshot = peers.keys().copied().collect();

        state.history.push(snapshot);
        state.commands.push(command);
    }
}

impl MemoryState {
    fn resolve(&self, target: &InterfaceTarget) -> Vec<InterfaceTarget> {
        match (&target.instance, self.instances.get(target)) {
            (None, Some(names)) => names.iter().map(|name| target.on_instance(name)).collect(),
            _ => vec![target.to_owned()],
        }
    }
}

fn consume_failure(counter: &mut u32) -> bool {
    if *counter > 0 {
        *counter -= 1;
        true
    } else {
        false
    }
}

#[async_trait]
impl InterfaceControl for MemoryInterface {
    async fn add_peer(
        &self,
        target: &InterfaceTarget,
        key: &WgKey,
        allowed_ips: &[Ipv4Net],
    ) -> Result<(), InterfaceError> {
        let mut state = self.state();

        if let Some(remaining) = state.failing_adds.get_mut(key) {
            if consume_failure(remaining) {
                return Err(InterfaceError::Command(format!("injected failure adding {key}")));
            }
        }

        if consume_failure(&mut state.failing_any_adds) {
            return Err(InterfaceError::Command(format!("injected failure adding {key}")));
        }

        let command = InterfaceCommand::Add {
            key: *key,
            allowed_ips: allowed_ips.to_owned(),
        };

        Self::apply(&mut state, target, command);

        Ok(())
    }

    async fn remove_peer(
        &self,
        target: &InterfaceTarget,
        key: &WgKey,
    ) -> Result<(), InterfaceError> {
        let mut state = self.state();

        if consume_failure(&mut state.failing_removes) {
            return Err(InterfaceError::Command(format!("injected failure removing {key}")));
        }

        Self::apply(&mut state, target, InterfaceCommand::Remove { key: *key });

        Ok(())
    }

    async fn set_allowed_ips(
        &self,
        target: &InterfaceTarget,
        key: &WgKey,
        allowed_ips: &[Ipv4Net],
    ) -> Result<(), InterfaceError> {
        let command = InterfaceCommand::SetAllowedIps {
            key: *key,
            allowed_ips: allowed_ips.to_owned(),
        };

        Self::apply(&mut self.state(), target, command);

        Ok(())
    }

    async fn query_status(&self, target: &InterfaceTarget) -> Result<Vec<LivePeer>, InterfaceError> {
        let mut state = self.state();

        if consume_failure(&mut state.failing_queries) {
            return Err(InterfaceError::Unavailable(target.server.to_string()));
        }

        let instances = state
            .resolve(target)
            .iter()
            .map(|instance| {
                state
                    .interfaces
                    .get(instance)
                    .map(|peers| peers.values().cloned().collect::<Vec<_>>())
                    .unwrap_or_default()
            })
            .collect();

        Ok(merge_live(instances))
    }

    async fn instances(&self, target: &InterfaceTarget) -> Result<Vec<InterfaceTarget>, InterfaceError> {
        Ok(self.state().resolve(target))
    }
}
