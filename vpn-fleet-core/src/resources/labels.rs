use std::collections::BTreeMap;

use kube::api::ListParams;

pub const SERVER_LABEL: &str = "vpn-fleet.dev/server";
pub const PEER_LABEL: &str = "vpn-fleet.dev/peer";

pub fn get_server_labels(server: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app.kubernetes.io/name".to_owned(), "vpn-fleet".to_owned()),
        ("app.kubernetes.io/component".to_owned(), "server".to_owned()),
        ("app.kubernetes.io/managed-by".to_owned(), "vpn-fleet-controller".to_owned()),
        (SERVER_LABEL.to_owned(), server.to_owned()),
    ])
}

pub fn get_server_listparams(server: &str) -> ListParams {
    ListParams::default().labels(&format!("{SERVER_LABEL}={server}"))
}

pub fn get_profile_labels(server: &str, peer: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app.kubernetes.io/name".to_owned(), "vpn-fleet".to_owned()),
        ("app.kubernetes.io/component".to_owned(), "profile".to_owned()),
        ("app.kubernetes.io/managed-by".to_owned(), "vpn-fleet-controller".to_owned()),
        (SERVER_LABEL.to_owned(), server.to_owned()),
        (PEER_LABEL.to_owned(), peer.to_owned()),
    ])
}
