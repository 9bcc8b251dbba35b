use futures::{Future, StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::{Node, NodeStatus};
use kube::{
    runtime::{
        reflector::{self, reflector, Store},
        watcher::{watcher, Config},
        WatchStreamExt,
    },
    Api, Client, ResourceExt,
};

/// Node cache used to resolve NodePort endpoints. Only node addresses are kept.
pub fn start_node_reflector(client: &Client) -> (impl Future<Output = ()>, Store<Node>) {
    let node_api: Api<Node> = Api::all(client.clone());
    let watcher = watcher(node_api, Config::default()).map_ok(|event| {
        event.modify(|node| {
            node.managed_fields_mut().clear();
            node.annotations_mut().clear();
            node.labels_mut().clear();
            node.finalizers_mut().clear();
            node.owner_references_mut().clear();
            node.spec = None;

            let addresses = node
                .status
                .as_ref()
                .and_then(|status| status.addresses.to_owned());

            node.status = Some(NodeStatus {
                addresses,
                ..Default::default()
            })
        })
    });
    let (store, writer) = reflector::store();
    let reflector = reflector(writer, watcher)
        .applied_objects()
        .for_each(|_| std::future::ready(()));

    (reflector, store)
}
