use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::{Pod, Secret, Service};
use kube::{
    runtime::{controller, watcher::Config, Controller},
    Client,
};
use log::info;
use vpn_fleet_core::resources::crd::v1alpha1::vpnserver::VPNServer;

use crate::helpers::handle_reconciliation_result;

use super::{
    reconciler::{
        context::ReconcilerContext,
        server::{reconcile_server, reconcile_server_error},
    },
    watched_api,
};

pub async fn start_server_controller(client: Client, context: Arc<ReconcilerContext>) {
    info!("Creating server controller...");

    let namespace = context.config.namespace.as_deref();
    let watcher_config = Config::default();
    let controller_config = controller::Config::default().concurrency(context.config.workers);
    let controller = Controller::new(
        watched_api::<VPNServer>(&client, namespace),
        watcher_config.clone(),
    )
    .owns(watched_api::<Pod>(&client, namespace), watcher_config.clone())
    .owns(
        watched_api::<Service>(&client, namespace),
        watcher_config.clone(),
    )
    .owns(watched_api::<Secret>(&client, namespace), watcher_config)
    .with_config(controller_config)
    .shutdown_on_signal()
    .run(reconcile_server, reconcile_server_error, context)
    .for_each(handle_reconciliation_result);

    info!("Server controller created!");

    controller.await
}
