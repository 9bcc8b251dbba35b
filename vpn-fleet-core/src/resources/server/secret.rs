use std::collections::BTreeMap;

use k8s_openapi::{api::core::v1::Secret, ByteString};

use crate::{resources::ResourceGenerationError, wireguard::keys::WgKey};

use super::ServerRelease;

pub const SERVER_PRIVATE_KEY: &str = "SERVER_PRIVATE_KEY";

impl ServerRelease {
    pub fn generate_secret(&self, server_private_key: &WgKey) -> Secret {
        let secret_data = BTreeMap::from([(
            SERVER_PRIVATE_KEY.to_owned(),
            ByteString(server_private_key.to_base64().into_bytes()),
        )]);

        Secret {
            metadata: self.generate_metadata(),
            data: Some(secret_data),
            ..Default::default()
        }
    }
}

pub fn read_server_private_key(secret: &Secret) -> Result<WgKey, ResourceGenerationError> {
    let data = secret
        .data
        .as_ref()
        .and_then(|data| data.get(SERVER_PRIVATE_KEY))
        .ok_or(ResourceGenerationError::DependentMissingData(
            SERVER_PRIVATE_KEY.into(),
        ))?;

    std::str::from_utf8(&data.0)
        .ok()
        .and_then(|key| WgKey::from_base64(key.trim()).ok())
        .ok_or(ResourceGenerationError::DependentInvalidData(
            SERVER_PRIVATE_KEY.into(),
        ))
}
