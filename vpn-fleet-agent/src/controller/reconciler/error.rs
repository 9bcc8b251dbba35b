use std::time::Duration;

use thiserror::Error;
use vpn_fleet_core::{
    kubernetes::is_conflict,
    peers::manager::PeerError,
    resources::{
        crd::v1alpha1::vpnserver::SpecValidationError, server::ServerReleaseBuilderError,
        ResourceGenerationError,
    },
    wireguard::keys::KeyGenerationError,
};

/// How the controller reacts to a failed pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// retried with backoff for as long as it takes
    Transient,
    /// re-read and retried right away, a bounded number of times
    Conflict,
    /// retried until the retry budget runs out, then reported as Degraded
    Deterministic,
}

#[derive(Debug, Error)]
pub enum ReconcilerError {
    #[error("Object is missing metadata!")]
    MissingObjectMetadata,
    #[error("Invalid server spec! {}", .0)]
    InvalidSpec(#[from] SpecValidationError),
    #[error("Kubernetes API call failed! Reason: {}", .0)]
    KubeApiError(#[from] kube::Error),
    #[error("Kubernetes API call timed out after {:?}!", .0)]
    Timeout(Duration),
    #[error("Object was modified concurrently, retries exhausted!")]
    Conflict,
    #[error("Couldn't prepare a server release! Reason: {}", .0)]
    ServerReleaseBuilderError(#[from] ServerReleaseBuilderError),
    #[error("Couldn't generate a server resource! Reason: {}", .0)]
    ResourceGenerationError(#[from] ResourceGenerationError),
    #[error("Couldn't generate the server key! Reason: {}", .0)]
    KeyGenerationError(#[from] KeyGenerationError),
    #[error("Peer operation failed! Reason: {}", .0)]
    PeerError(#[from] PeerError),
    #[error("{} peer(s) couldn't be applied to the live interface!", .0)]
    InterfaceSync(usize),
    #[error("Couldn't handle the finalizer! Reason: {}", .0)]
    Finalizer(String),
}

impl ReconcilerError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::KubeApiError(error) if is_conflict(error) => ErrorClass::Conflict,
            Self::KubeApiError(kube::Error::Api(response)) => match response.code {
                408 | 429 => ErrorClass::Transient,
                code if code >= 500 => ErrorClass::Transient,
                _ => ErrorClass::Deterministic,
            },
            Self::KubeApiError(_) => ErrorClass::Transient,
            Self::Timeout(_) => ErrorClass::Transient,
            Self::Conflict => ErrorClass::Conflict,
            Self::InterfaceSync(_) => ErrorClass::Transient,
            Self::PeerError(error) if error.is_transient() => ErrorClass::Transient,
            Self::PeerError(_) => ErrorClass::Deterministic,
            Self::MissingObjectMetadata
            | Self::InvalidSpec(_)
            | Self::ServerReleaseBuilderError(_)
            | Self::ResourceGenerationError(_)
            | Self::KeyGenerationError(_)
            | Self::Finalizer(_) => ErrorClass::Deterministic,
        }
    }

    /// Short CamelCase reason for status conditions.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::MissingObjectMetadata => "MissingMetadata",
            Self::InvalidSpec(_) => "InvalidSpec",
            Self::KubeApiError(_) | Self::Timeout(_) | Self::Conflict => "ApiError",
            Self::ServerReleaseBuilderError(_) | Self::ResourceGenerationError(_) => {
                "ResourceGenerationFailed"
            }
            Self::KeyGenerationError(_) => "KeyGenerationFailed",
            Self::PeerError(_) => "PeerSyncFailed",
            Self::InterfaceSync(_) => "InterfaceSyncFailed",
            Self::Finalizer(_) => "FinalizerFailed",
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use kube::{core::ErrorResponse, Error};
    use vpn_fleet_core::{
        peers::{manager::PeerError, StoreError},
        resources::{crd::v1alpha1::vpnserver::SpecValidationError, key::ServerKey},
    };

    use super::{ErrorClass, ReconcilerError};

    pub fn api_error(code: u16) -> Error {
        Error::Api(ErrorResponse {
            status: "Failure".to_owned(),
            message: "test".to_owned(),
            reason: "Test".to_owned(),
            code,
        })
    }

    #[test]
    fn api_errors_are_classified_by_code() {
        assert_eq!(
            ReconcilerError::from(api_error(409)).class(),
            ErrorClass::Conflict
        );
        assert_eq!(
            ReconcilerError::from(api_error(503)).class(),
            ErrorClass::Transient
        );
        assert_eq!(
            ReconcilerError::from(api_error(429)).class(),
            ErrorClass::Transient
        );
        assert_eq!(
            ReconcilerError::from(api_error(403)).class(),
            ErrorClass::Deterministic
        );
    }

    #[test]
    fn malformed_specs_are_deterministic() {
        let error = ReconcilerError::from(SpecValidationError::ReplicasOutOfRange(11));

        assert_eq!(error.class(), ErrorClass::Deterministic);
        assert_eq!(error.reason(), "InvalidSpec");
    }

    #[test]
    fn peer_errors_follow_their_own_classification() {
        let store = ReconcilerError::from(PeerError::Store(StoreError::Unavailable(
            "down".to_owned(),
        )));
        let exhausted =
            ReconcilerError::from(PeerError::PoolExhausted(ServerKey::new("vpn", "edge")));

        assert_eq!(store.class(), ErrorClass::Transient);
        assert_eq!(exhausted.class(), ErrorClass::Deterministic);
    }
}
