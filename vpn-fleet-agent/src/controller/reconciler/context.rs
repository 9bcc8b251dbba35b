use std::{future::Future, sync::Arc};

use kube::runtime::reflector::ObjectRef;
use vpn_fleet_core::{
    helpers::with_timeout,
    peers::{manager::PeerManager, PeerStore},
    resources::{crd::v1alpha1::vpnpeer::VPNPeer, key::ServerKey},
    wireguard::interface::InterfaceControl,
};

use crate::{
    config::AgentConfig,
    controller::{
        backoff::RetryTracker,
        workloads::{StatusWriter, Workloads},
    },
};

use super::error::ReconcilerError;

pub type FleetPeerManager = PeerManager<Arc<dyn PeerStore>, Arc<dyn InterfaceControl>>;

pub struct ReconcilerContext {
    pub config: AgentConfig,
    pub workloads: Arc<dyn Workloads>,
    pub status: Arc<dyn StatusWriter>,
    pub peers: FleetPeerManager,
    pub server_failures: RetryTracker<ServerKey>,
    pub peer_failures: RetryTracker<ObjectRef<VPNPeer>>,
}

impl ReconcilerContext {
    pub fn new(
        config: AgentConfig,
        workloads: Arc<dyn Workloads>,
        status: Arc<dyn StatusWriter>,
        store: Arc<dyn PeerStore>,
        interface: Arc<dyn InterfaceControl>,
    ) -> Self {
        let peers = PeerManager::new(store, interface, config.manager_settings());

        Self {
            config,
            workloads,
            status,
            peers,
            server_failures: RetryTracker::default(),
            peer_failures: RetryTracker::default(),
        }
    }

    /// Runs a cluster call under the configured API timeout.
    pub async fn api_call<T, F>(&self, call: F) -> Result<T, ReconcilerError>
    where
        F: Future<Output = Result<T, kube::Error>>,
    {
        let timeout = self.config.api_timeout();

        with_timeout(timeout, call)
            .await
            .map_err(|_| ReconcilerError::Timeout(timeout))?
            .map_err(ReconcilerError::from)
    }
}

#[cfg(test)]
mod tests {
    use std::{future::pending, time::Duration};

    use crate::controller::reconciler::{
        error::{tests::api_error, ErrorClass, ReconcilerError},
        fakes::Harness,
    };

    #[tokio::test(start_paused = true)]
    async fn hanging_calls_time_out() {
        let harness = Harness::new(None, Vec::new());

        let error = harness
            .context
            .api_call(pending::<Result<(), kube::Error>>())
            .await
            .unwrap_err();

        assert!(matches!(error, ReconcilerError::Timeout(timeout) if timeout == Duration::from_secs(1)));
        assert_eq!(error.class(), ErrorClass::Transient);
    }

    #[tokio::test(start_paused = true)]
    async fn answers_within_the_timeout_pass_through() {
        let harness = Harness::new(None, Vec::new());

        let answered = harness
            .context
            .api_call(async {
                tokio::time::sleep(Duration::from_millis(900)).await;
                Ok::<_, kube::Error>(7)
            })
            .await
            .unwrap();
        let rejected = harness
            .context
            .api_call(async { Err::<(), _>(api_error(403)) })
            .await
            .unwrap_err();

        assert_eq!(answered, 7);
        assert!(matches!(rejected, ReconcilerError::KubeApiError(_)));
        assert_eq!(rejected.class(), ErrorClass::Deterministic);
    }
}
