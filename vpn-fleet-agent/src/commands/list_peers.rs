use anyhow::anyhow;
use chrono::{DateTime, Utc};
use kube::{api::ListParams, Client};
use serde::Serialize;
use vpn_fleet_core::{
    kubernetes::operations::{list_resources, try_get_resource},
    resources::crd::v1alpha1::{
        vpnpeer::{VPNPeer, VPNPeerState},
        vpnserver::VPNServer,
    },
};
use vpn_fleet_macros::TableOutputRow;

use crate::{
    cli::PeerListArgs,
    output::{CliPrint, TableCellOption},
};

pub async fn list_peers(args: PeerListArgs, namespace: &str, client: Client) -> anyhow::Result<()> {
    if try_get_resource::<VPNServer>(&client, &args.server, namespace)
        .await?
        .is_none()
    {
        return Err(anyhow!(
            "Server '{}' doesn't exist in '{namespace}' namespace!",
            args.server
        ));
    }

    let peers = list_resources::<VPNPeer>(&client, namespace, &ListParams::default()).await?;

    server_peers(&peers, &args.server).print(args.output)?;

    Ok(())
}

fn server_peers<'a>(peers: &'a [VPNPeer], server: &str) -> Vec<PeerView<'a>> {
    peers
        .iter()
        .filter(|peer| peer.spec.server == server)
        .map(PeerView::from)
        .collect()
}

#[derive(Serialize, TableOutputRow)]
struct PeerView<'a> {
    #[name_column]
    pub name: TableCellOption<&'a str>,
    pub address: TableCellOption<&'a str>,
    pub public_key: TableCellOption<&'a str>,
    pub state: TableCellOption<&'a VPNPeerState>,
    pub last_handshake: TableCellOption<&'a DateTime<Utc>>,
    pub rx_bytes: TableCellOption<u64>,
    pub tx_bytes: TableCellOption<u64>,
}

impl<'a> From<&'a VPNPeer> for PeerView<'a> {
    fn from(value: &'a VPNPeer) -> Self {
        let status = value.status.as_ref();

        PeerView {
            name: value.metadata.name.as_deref().into(),
            address: status.and_then(|s| s.address.as_deref()).into(),
            public_key: status.and_then(|s| s.public_key.as_deref()).into(),
            state: status.map(|s| &s.state).into(),
            last_handshake: status.and_then(|s| s.last_handshake.as_ref()).into(),
            rx_bytes: status.and_then(|s| s.rx_bytes).into(),
            tx_bytes: status.and_then(|s| s.tx_bytes).into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use vpn_fleet_core::resources::crd::v1alpha1::vpnpeer::{
        VPNPeer, VPNPeerSpec, VPNPeerState, VPNPeerStatus,
    };

    use crate::output::TableOutputRow;

    use super::server_peers;

    fn peer(name: &str, server: &str, status: Option<VPNPeerStatus>) -> VPNPeer {
        let mut peer = VPNPeer::new(
            name,
            VPNPeerSpec {
                server: server.to_owned(),
                rotation: 0,
            },
        );
        peer.status = status;

        peer
    }

    #[test]
    fn only_peers_of_the_server_are_listed() {
        let peers = vec![
            peer(
                "alice",
                "edge",
                Some(VPNPeerStatus {
                    state: VPNPeerState::Active,
                    address: Some("10.0.0.3".to_owned()),
                    rx_bytes: Some(512),
                    ..Default::default()
                }),
            ),
            peer("bob", "core", None),
            peer("carol", "edge", None),
        ];

        let views = server_peers(&peers, "edge");

        assert_eq!(views.len(), 2);
        assert_eq!(
            views[0].get_row(),
            vec!["alice", "10.0.0.3", "-", "active", "-", "512", "-"]
        );
        assert_eq!(views[1].get_name(), "carol");
        assert_eq!(views[1].get_row()[3], "-");
    }
}
