use ipnet::Ipv4Net;

use crate::peers::Peer;

use super::keys::WgKey;

/// Full interface configuration of a server instance, rendered once when the instance starts.
#[derive(Debug)]
pub struct ServerConfig<'a> {
    pub address: Ipv4Net,
    pub listen_port: u16,
    pub private_key: WgKey,
    pub peers: &'a [Peer],
}

impl ServerConfig<'_> {
    pub fn render(&self) -> String {
        let address = self.address;
        let port = self.listen_port;
        let private_key = self.private_key;
        let network = self.address.trunc();

        let mut config = format!(
            "[Interface]
Address = {address}
ListenPort = {port}
PrivateKey = {private_key}
PostUp = iptables -A FORWARD -i %i -j ACCEPT; iptables -t nat -A POSTROUTING -s {network} -j MASQUERADE
PostDown = iptables -D FORWARD -i %i -j ACCEPT; iptables -t nat -D POSTROUTING -s {network} -j MASQUERADE
"
        );

        for peer in self.peers.iter().filter(|peer| peer.active) {
            let name = &peer.name;
            let public_key = peer.public_key;
            let allowed_ips = peer
                .allowed_ips
                .iter()
                .map(|ip| ip.to_string())
                .collect::<Vec<_>>()
                .join(", ");

            config.push_str(&format!(
                "
# {name}
[Peer]
PublicKey = {public_key}
AllowedIPs = {allowed_ips}
"
            ));
        }

        config
    }
}
