use std::{
    collections::{BTreeMap, HashMap},
    sync::{Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;

use crate::resources::key::ServerKey;

use super::{Peer, PeerStore, StoreError};

#[derive(Default)]
struct MemoryState {
    records: HashMap<ServerKey, BTreeMap<String, Peer>>,
    failing_saves: u32,
    saves: usize,
}

#[derive(Default)]
pub struct MemoryPeerStore {
    state: Mutex<MemoryState>,
}

impl MemoryPeerStore {
    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, server: &ServerKey, name: &str) -> Option<Peer> {
        self.state()
            .records
            .get(server)
            .and_then(|records| records.get(name))
            .cloned()
    }

    /// Puts a record in place without going through the manager, e.g. to simulate old state.
    pub fn insert(&self, peer: Peer) {
        self.state()
            .records
            .entry(peer.server.to_owned())
            .or_default()
            .insert(peer.name.to_owned(), peer);
    }

    pub fn fail_saves(&self, times: u32) {
        self.state().failing_saves = times;
    }

    /// Number of successful saves so far.
    pub fn saves(&self) -> usize {
        self.state().saves
    }
}

#[async_trait]
impl PeerStore for MemoryPeerStore {
    async fn list(&self, server: &ServerKey) -> Result<Vec<Peer>, StoreError> {
        Ok(self
            .state()
            .records
            .get(server)
            .map(|records| records.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn save(&self, peer: &Peer) -> Result<(), StoreError> {
        let mut state = self.state();

        if state.failing_saves > 0 {
            state.failing_saves -= 1;

            return Err(StoreError::Unavailable("injected save failure".to_owned()));
        }

        state
            .records
            .entry(peer.server.to_owned())
            .or_default()
            .insert(peer.name.to_owned(), peer.to_owned());
        state.saves += 1;

        Ok(())
    }

    async fn remove(&self, server: &ServerKey, name: &str) -> Result<(), StoreError> {
        if let Some(records) = self.state().records.get_mut(server) {
            records.remove(name);
        }

        Ok(())
    }
}
