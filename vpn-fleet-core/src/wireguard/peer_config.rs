use std::net::IpAddr;

use ipnet::{IpNet, Ipv4Net};

use super::keys::{AlreadyClaimed, ClaimablePrivateKey, WgKey};

/// One-time configuration bundle handed to a freshly created or rotated peer.
#[derive(Debug)]
pub struct PeerConfig {
    pub peer_name: String,
    /// peer address with the prefix of the server's pool
    pub address: Ipv4Net,
    pub dns: Option<IpAddr>,
    pub public_key: WgKey,
    pub server_public_key: WgKey,
    pub endpoint: Option<String>,
    pub allowed_ips: Vec<IpNet>,
    pub keepalive: u16,
    private_key: ClaimablePrivateKey,
}

impl PeerConfig {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        peer_name: String,
        address: Ipv4Net,
        dns: Option<IpAddr>,
        private_key: WgKey,
        public_key: WgKey,
        server_public_key: WgKey,
        endpoint: Option<String>,
        allowed_ips: Vec<IpNet>,
        keepalive: u16,
    ) -> Self {
        Self {
            peer_name,
            address,
            dns,
            public_key,
            server_public_key,
            endpoint,
            allowed_ips,
            keepalive,
            private_key: ClaimablePrivateKey::new(private_key),
        }
    }

    pub fn is_claimed(&self) -> bool {
        self.private_key.is_claimed()
    }

    /// Renders the client profile, taking the private key out of the bundle.
    pub fn claim_profile(&mut self) -> Result<String, AlreadyClaimed> {
        let private_key = self.private_key.claim()?;

        Ok(self.render(&private_key))
    }

    fn render(&self, private_key: &WgKey) -> String {
        let name = &self.peer_name;
        let address = self.address;
        let dns = self.dns.map(|i| format!("DNS = {i}\n")).unwrap_or_default();
        let public_key = self.server_public_key;
        let endpoint = self
            .endpoint
            .as_deref()
            .map(|e| format!("Endpoint = {e}\n"))
            .unwrap_or_default();
        let allowed_ips = self
            .allowed_ips
            .iter()
            .map(|ip| ip.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        let keepalive = self.keepalive;

        format!(
            "# {name}
[Interface]
PrivateKey = {private_key}
Address = {address}
{dns}
[Peer]
PublicKey = {public_key}
{endpoint}AllowedIPs = {allowed_ips}
PersistentKeepalive = {keepalive}
"
        )
    }
}

#[cfg(test)]
mod tests {
    use crate::wireguard::keys::{KeyGenerator, OsKeyGenerator};

    use super::PeerConfig;

    fn config(endpoint: Option<&str>) -> (PeerConfig, String) {
        let peer = OsKeyGenerator.generate().unwrap();
        let server = OsKeyGenerator.generate().unwrap();
        let (private, public) = peer.split();
        let private = private.unwrap();

        let config = PeerConfig::new(
            "alice".to_owned(),
            "10.0.0.3/24".parse().unwrap(),
            Some("1.1.1.1".parse().unwrap()),
            private,
            public,
            *server.get_public_key(),
            endpoint.map(str::to_owned),
            vec!["0.0.0.0/0".parse().unwrap()],
            25,
        );

        (config, private.to_base64())
    }

    #[test]
    fn profile_contains_client_settings() {
        let (mut config, private) = config(Some("203.0.113.7:51820"));
        let server_key = config.server_public_key.to_base64();
        let profile = config.claim_profile().unwrap();

        assert!(profile.contains(&format!("PrivateKey = {private}")));
        assert!(profile.contains("Address = 10.0.0.3/24"));
        assert!(profile.contains("DNS = 1.1.1.1"));
        assert!(profile.contains(&format!("PublicKey = {server_key}")));
        assert!(profile.contains("Endpoint = 203.0.113.7:51820"));
        assert!(profile.contains("AllowedIPs = 0.0.0.0/0"));
        assert!(profile.contains("PersistentKeepalive = 25"));
    }

    #[test]
    fn profile_skips_unknown_endpoint() {
        let (mut config, _) = config(None);

        assert!(!config.claim_profile().unwrap().contains("Endpoint"));
    }

    #[test]
    fn profile_can_be_claimed_once() {
        let (mut config, _) = config(None);

        config.claim_profile().unwrap();

        assert!(config.is_claimed());
        assert!(config.claim_profile().is_err());
    }
}
