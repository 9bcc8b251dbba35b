use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::{
    runtime::{
        controller::{self, Action},
        finalizer::{finalizer, Error as FinalizerError, Event},
        reflector::ObjectRef,
        watcher::Config,
        Controller,
    },
    Api, Client,
};
use log::{info, warn};
use vpn_fleet_core::{
    helpers::RequireMetadata, kubernetes::GetApi,
    resources::crd::v1alpha1::vpnpeer::VPNPeer,
};

use crate::helpers::handle_reconciliation_result;

use super::{
    reconciler::{
        context::ReconcilerContext,
        error::{ErrorClass, ReconcilerError},
        peer::{apply_peer, cleanup_peer},
        server::retry_delay,
    },
    watched_api,
};

pub const PEER_FINALIZER: &str = "vpnpeers.vpn-fleet.dev/cleanup";

/// The finalizer helper needs a live client, the rest goes through the shared context.
pub struct PeerControllerContext {
    pub client: Client,
    pub reconciler: Arc<ReconcilerContext>,
}

pub async fn start_peer_controller(context: Arc<PeerControllerContext>) {
    info!("Creating peer controller...");

    let client = context.client.clone();
    let config = &context.reconciler.config;
    let namespace = config.namespace.as_deref();
    let watcher_config = Config::default();
    let controller = Controller::new(
        watched_api::<VPNPeer>(&client, namespace),
        watcher_config.clone(),
    )
    .owns(watched_api::<Secret>(&client, namespace), watcher_config)
    .with_config(controller::Config::default().concurrency(config.workers))
    .shutdown_on_signal()
    .run(reconcile_peer, reconcile_peer_error, context.clone())
    .for_each(handle_reconciliation_result);

    info!("Peer controller created!");

    controller.await
}

pub async fn reconcile_peer(
    object: Arc<VPNPeer>,
    context: Arc<PeerControllerContext>,
) -> Result<Action, ReconcilerError> {
    let namespace = object.require_namespace_or(ReconcilerError::MissingObjectMetadata)?;
    let api: Api<VPNPeer> = context.client.namespaced_api(namespace);
    let key = ObjectRef::from_obj(object.as_ref());
    let reconciler = &context.reconciler;

    let result = finalizer(&api, PEER_FINALIZER, object.clone(), |event| async move {
        match event {
            Event::Apply(peer) => apply_peer(&peer, reconciler).await,
            Event::Cleanup(peer) => cleanup_peer(&peer, reconciler).await,
        }
    })
    .await
    .map_err(from_finalizer_error);

    match result {
        Ok(action) => {
            reconciler.peer_failures.reset(&key);

            Ok(action)
        }
        Err(error) => {
            let failures = reconciler.peer_failures.record_failure(&key);

            if error.class() == ErrorClass::Deterministic
                && failures >= reconciler.config.retry_budget
            {
                warn!("Giving up on peer {key} until it changes! {error}");
                reconciler.peer_failures.reset(&key);

                return Ok(Action::await_change());
            }

            Err(error)
        }
    }
}

pub fn reconcile_peer_error(
    object: Arc<VPNPeer>,
    error: &ReconcilerError,
    context: Arc<PeerControllerContext>,
) -> Action {
    let reconciler = &context.reconciler;
    let failures = reconciler
        .peer_failures
        .failures(&ObjectRef::from_obj(object.as_ref()));

    Action::requeue(retry_delay(&reconciler.config, error, failures))
}

fn from_finalizer_error(error: FinalizerError<ReconcilerError>) -> ReconcilerError {
    match error {
        FinalizerError::ApplyFailed(error) | FinalizerError::CleanupFailed(error) => error,
        FinalizerError::AddFinalizer(error) | FinalizerError::RemoveFinalizer(error) => {
            ReconcilerError::KubeApiError(error)
        }
        other => ReconcilerError::Finalizer(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use kube::runtime::finalizer::Error as FinalizerError;

    use crate::controller::reconciler::error::{tests::api_error, ErrorClass, ReconcilerError};

    use super::from_finalizer_error;

    #[test]
    fn reconciler_errors_pass_through_the_finalizer() {
        let error = from_finalizer_error(FinalizerError::ApplyFailed(ReconcilerError::Conflict));

        assert!(matches!(error, ReconcilerError::Conflict));
    }

    #[test]
    fn finalizer_patch_failures_keep_their_class() {
        let error = from_finalizer_error(FinalizerError::AddFinalizer(api_error(409)));

        assert_eq!(error.class(), ErrorClass::Conflict);
    }

    #[test]
    fn unnamed_objects_are_not_retried() {
        let error = from_finalizer_error(FinalizerError::UnnamedObject);

        assert!(matches!(error, ReconcilerError::Finalizer(_)));
        assert_eq!(error.class(), ErrorClass::Deterministic);
    }
}
