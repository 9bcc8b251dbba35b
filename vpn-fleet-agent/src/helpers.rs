use std::fmt::Display;

use kube::{
    runtime::{
        controller::{Action, Error as ControllerError},
        reflector::ObjectRef,
        watcher::Error as WatcherError,
    },
    Resource,
};
use log::{debug, error, warn};
use vpn_fleet_core::helpers::pretty_type_name;

/// Logs the outcome of a single reconciliation, meant for `Controller::for_each`.
pub fn handle_reconciliation_result<T, E>(
    result: Result<(ObjectRef<T>, Action), ControllerError<E, WatcherError>>,
) -> impl std::future::Future<Output = ()>
where
    T: Resource,
    E: Display,
{
    let resource_name = pretty_type_name::<T>();

    match result {
        Ok((object, action)) => debug!(
            "Reconciled {resource_name} '{}' in '{}' namespace. Next action: {action:?}",
            object.name,
            object.namespace.as_deref().unwrap_or("---"),
        ),
        Err(ControllerError::ObjectNotFound(object)) => {
            debug!("{resource_name} '{}' is gone!", object.name)
        }
        Err(ControllerError::ReconcilerFailed(reconciler_error, object)) => warn!(
            "{resource_name} reconciliation failed for '{}' in '{}' namespace! {reconciler_error}",
            object.name,
            object.namespace.as_deref().unwrap_or("---"),
        ),
        Err(ControllerError::QueueError(watcher_error)) => {
            error!("{resource_name} watcher has failed! {watcher_error}")
        }
        Err(other) => error!("{resource_name} controller failed! {other}"),
    }

    std::future::ready(())
}
