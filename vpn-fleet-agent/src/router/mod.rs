use std::{env::var, path::Path};

use kube::Client;
use log::info;
use thiserror::Error;
use vpn_fleet_core::{
    kubernetes::{operations::try_get_resource, peer_store::KubePeerStore},
    peers::{PeerStore, StoreError},
    resources::{
        crd::v1alpha1::vpnserver::{SpecValidationError, VPNServer},
        key::ServerKey,
        server::{
            pod::{config_file_path, SERVER_NAMESPACE_ENV, SERVER_NAME_ENV},
            secret::SERVER_PRIVATE_KEY,
        },
    },
    wireguard::{keys::WgKey, server_config::ServerConfig},
    CONTROLLER_FIELD_MANAGER,
};

use crate::config::ConfigError;

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("{}", .0)]
    Config(#[from] ConfigError),
    #[error("Kubernetes API call failed! Reason: {}", .0)]
    Kube(#[from] kube::Error),
    #[error("Server {} doesn't exist!", .0)]
    ServerNotFound(ServerKey),
    #[error("Invalid server spec! {}", .0)]
    InvalidSpec(#[from] SpecValidationError),
    #[error("Couldn't list peers! {}", .0)]
    Store(#[from] StoreError),
    #[error("Couldn't write the interface config! {}", .0)]
    Io(#[from] std::io::Error),
}

/// What a server instance knows about itself, passed in by its pod spec.
#[derive(Debug)]
pub struct RouterEnv {
    pub server: ServerKey,
    pub private_key: WgKey,
}

impl RouterEnv {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|name| var(name).ok())
    }

    fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let name = var(SERVER_NAME_ENV).ok_or(ConfigError::MissingEnv(SERVER_NAME_ENV))?;
        let namespace =
            var(SERVER_NAMESPACE_ENV).ok_or(ConfigError::MissingEnv(SERVER_NAMESPACE_ENV))?;
        let private_key = var(SERVER_PRIVATE_KEY)
            .ok_or(ConfigError::MissingEnv(SERVER_PRIVATE_KEY))
            .and_then(|key| {
                WgKey::from_base64(&key).map_err(|_| ConfigError::InvalidEnv(SERVER_PRIVATE_KEY))
            })?;

        Ok(Self {
            server: ServerKey::new(namespace, name),
            private_key,
        })
    }
}

/// Renders the complete interface config of this instance into the shared volume.
pub async fn main_router_init(client: Client) -> Result<(), RouterError> {
    let env = RouterEnv::from_env()?;
    let server =
        try_get_resource::<VPNServer>(&client, &env.server.name, &env.server.namespace)
            .await?
            .ok_or_else(|| RouterError::ServerNotFound(env.server.to_owned()))?;
    let spec = server.spec.validate()?;
    let peers = KubePeerStore::new(client, CONTROLLER_FIELD_MANAGER)
        .list(&env.server)
        .await?;

    let config = ServerConfig {
        address: spec.address,
        listen_port: spec.port,
        private_key: env.private_key,
        peers: &peers,
    }
    .render();

    let path = config_file_path(&server.spec.interface);
    write_config(Path::new(&path), &config).await?;

    info!(
        "Configuration of {} with {} peer(s) written to {path}!",
        env.server,
        peers.iter().filter(|peer| peer.active).count()
    );

    Ok(())
}

async fn write_config(path: &Path, config: &str) -> Result<(), std::io::Error> {
    if let Some(directory) = path.parent() {
        tokio::fs::create_dir_all(directory).await?;
    }

    tokio::fs::write(path, config).await
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use vpn_fleet_core::wireguard::keys::{KeyGenerator, OsKeyGenerator};

    use crate::config::ConfigError;

    use super::RouterEnv;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect();

        move |name: &str| vars.get(name).cloned()
    }

    #[test]
    fn environment_describes_the_server() {
        let key = OsKeyGenerator.generate().unwrap().get_private_key().copied().unwrap();
        let encoded = key.to_base64();

        let env = RouterEnv::from_vars(vars(&[
            ("VPN_FLEET_SERVER_NAME", "edge"),
            ("VPN_FLEET_SERVER_NAMESPACE", "vpn"),
            ("SERVER_PRIVATE_KEY", &encoded),
        ]))
        .unwrap();

        assert_eq!(env.server.to_string(), "vpn/edge");
        assert_eq!(env.private_key, key);
    }

    #[test]
    fn missing_key_is_reported() {
        let error = RouterEnv::from_vars(vars(&[
            ("VPN_FLEET_SERVER_NAME", "edge"),
            ("VPN_FLEET_SERVER_NAMESPACE", "vpn"),
        ]))
        .unwrap_err();

        assert_eq!(error, ConfigError::MissingEnv("SERVER_PRIVATE_KEY"));
    }

    #[test]
    fn garbage_key_is_reported() {
        let error = RouterEnv::from_vars(vars(&[
            ("VPN_FLEET_SERVER_NAME", "edge"),
            ("VPN_FLEET_SERVER_NAMESPACE", "vpn"),
            ("SERVER_PRIVATE_KEY", "not a key"),
        ]))
        .unwrap_err();

        assert_eq!(error, ConfigError::InvalidEnv("SERVER_PRIVATE_KEY"));
    }

    #[tokio::test]
    async fn config_is_written_with_its_directory() {
        let directory = std::env::temp_dir().join(format!("vpn-fleet-{}", std::process::id()));
        let path = directory.join("wg_confs").join("wg0.conf");

        super::write_config(&path, "[Interface]\n").await.unwrap();

        assert_eq!(tokio::fs::read_to_string(&path).await.unwrap(), "[Interface]\n");

        tokio::fs::remove_dir_all(&directory).await.unwrap();
    }
}
