use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::{api::core::v1::Secret, ByteString};
use kube::{core::ObjectMeta, Resource};

use crate::helpers::RequireMetadata;

use super::{crd::v1alpha1::vpnpeer::VPNPeer, labels::get_profile_labels, ResourceGenerationError};

pub const PROFILE_KEY: &str = "profile";
pub const CLAIM_DEADLINE_ANNOTATION: &str = "vpn-fleet.dev/claim-deadline";

pub fn profile_secret_name(peer: &str) -> String {
    format!("{peer}-profile")
}

/// Wraps a rendered client profile in a secret owned by its `VPNPeer`.
///
/// The secret is the claim window: whoever reads it first deletes it, and the
/// controller removes it once `deadline` has passed.
pub fn generate_profile_secret(
    peer: &VPNPeer,
    profile: String,
    deadline: DateTime<Utc>,
) -> Result<Secret, ResourceGenerationError> {
    let name = peer.require_name_or(ResourceGenerationError::DependentMissingMetadataName)?;
    let namespace =
        peer.require_namespace_or(ResourceGenerationError::DependentMissingMetadataNamespace)?;
    let owner = peer
        .controller_owner_ref(&())
        .ok_or(ResourceGenerationError::DependentMissingMetadataName)?;

    Ok(Secret {
        metadata: ObjectMeta {
            name: Some(profile_secret_name(name)),
            namespace: Some(namespace.to_owned()),
            labels: Some(get_profile_labels(&peer.spec.server, name)),
            annotations: Some(BTreeMap::from([(
                CLAIM_DEADLINE_ANNOTATION.to_owned(),
                deadline.to_rfc3339(),
            )])),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(
            PROFILE_KEY.to_owned(),
            ByteString(profile.into_bytes()),
        )])),
        ..Default::default()
    })
}

pub fn read_profile(secret: &Secret) -> Result<String, ResourceGenerationError> {
    let data = secret
        .data
        .as_ref()
        .and_then(|data| data.get(PROFILE_KEY))
        .ok_or(ResourceGenerationError::DependentMissingData(PROFILE_KEY.into()))?;

    String::from_utf8(data.0.to_owned())
        .map_err(|_| ResourceGenerationError::DependentInvalidData(PROFILE_KEY.into()))
}

pub fn read_claim_deadline(secret: &Secret) -> Option<DateTime<Utc>> {
    secret
        .metadata
        .annotations
        .as_ref()?
        .get(CLAIM_DEADLINE_ANNOTATION)
        .and_then(|deadline| DateTime::parse_from_rfc3339(deadline).ok())
        .map(|deadline| deadline.with_timezone(&Utc))
}

/// Secrets without a readable deadline are treated as expired.
pub fn is_profile_expired(secret: &Secret, now: DateTime<Utc>) -> bool {
    read_claim_deadline(secret)
        .map(|deadline| deadline <= now)
        .unwrap_or(true)
}
