use std::{fmt::Display, str::FromStr};

use derive_builder::Builder;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{core::ObjectMeta, Resource};

use crate::helpers::RequireMetadata;

use super::{
    crd::v1alpha1::vpnserver::{VPNServer, VPNServerSpec},
    labels::get_server_labels,
    ResourceGenerationError,
};

pub mod placement;
pub mod pod;
pub mod secret;
pub mod service;

pub const DEFAULT_SERVER_SERVICE_ACCOUNT: &str = "vpn-fleet-server";

/// Everything needed to render the workloads of a single `VPNServer`.
#[derive(Debug, Clone, Builder)]
pub struct ServerRelease {
    pub name: String,
    pub namespace: String,
    pub spec: VPNServerSpec,
    pub owner: OwnerReference,
    pub agent_image: String,
    #[builder(default)]
    pub service_type: ServerServiceType,
    #[builder(default = "DEFAULT_SERVER_SERVICE_ACCOUNT.to_owned()")]
    pub service_account: String,
}

impl ServerReleaseBuilder {
    pub fn with_server_crd(&mut self, server: &VPNServer) -> Result<&mut Self, ResourceGenerationError> {
        let name = server.require_name_or(ResourceGenerationError::DependentMissingMetadataName)?;
        let namespace =
            server.require_namespace_or(ResourceGenerationError::DependentMissingMetadataNamespace)?;
        let owner = server
            .controller_owner_ref(&())
            .ok_or(ResourceGenerationError::DependentMissingMetadataName)?;

        Ok(self
            .name(name.to_owned())
            .namespace(namespace.to_owned())
            .spec(server.spec.to_owned())
            .owner(owner))
    }
}

impl ServerRelease {
    /// Name shared by the server's secret and service.
    pub fn get_name(&self) -> String {
        server_resource_name(&self.name)
    }

    pub fn get_namespace(&self) -> String {
        self.namespace.to_owned()
    }

    pub fn generate_metadata(&self) -> ObjectMeta {
        ObjectMeta {
            name: Some(self.get_name()),
            namespace: Some(self.get_namespace()),
            labels: Some(get_server_labels(&self.name)),
            owner_references: Some(vec![self.owner.to_owned()]),
            ..Default::default()
        }
    }
}

pub fn server_resource_name(server: &str) -> String {
    format!("vpn-fleet-{server}")
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ServerServiceType {
    #[default]
    LoadBalancer,
    NodePort,
    ClusterIp,
}

impl Display for ServerServiceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LoadBalancer => write!(f, "LoadBalancer"),
            Self::NodePort => write!(f, "NodePort"),
            Self::ClusterIp => write!(f, "ClusterIP"),
        }
    }
}

impl FromStr for ServerServiceType {
    type Err = ResourceGenerationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "loadbalancer" => Ok(Self::LoadBalancer),
            "nodeport" => Ok(Self::NodePort),
            "clusterip" => Ok(Self::ClusterIp),
            _ => Err(ResourceGenerationError::InvalidData(
                format!("unknown service type '{s}'").into(),
            )),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

    use crate::resources::crd::v1alpha1::vpnserver::VPNServerSpec;

    use super::{ServerRelease, ServerReleaseBuilder, ServerServiceType};

    pub fn release() -> ServerRelease {
        ServerReleaseBuilder::default()
            .name("edge".to_owned())
            .namespace("vpn".to_owned())
            .spec(VPNServerSpec {
                replicas: 2,
                image: "lscr.io/linuxserver/wireguard:latest".to_owned(),
                port: 51820,
                interface: "wg0".to_owned(),
                address: "10.0.0.1/24".to_owned(),
                dns: Some("1.1.1.1".to_owned()),
                allowed_ips: "0.0.0.0/0".to_owned(),
                resources: None,
                node_selector: None,
                tolerations: None,
                affinity: None,
            })
            .owner(OwnerReference {
                api_version: "vpn-fleet.dev/v1alpha1".to_owned(),
                kind: "VPNServer".to_owned(),
                name: "edge".to_owned(),
                uid: "6f1c2a3e-0000-4000-8000-000000000001".to_owned(),
                controller: Some(true),
                ..Default::default()
            })
            .agent_image("ghcr.io/vpn-fleet/agent:latest".to_owned())
            .build()
            .unwrap()
    }

    #[test]
    fn builder_fills_defaults() {
        let release = release();

        assert_eq!(release.service_type, ServerServiceType::LoadBalancer);
        assert_eq!(release.get_name(), "vpn-fleet-edge");
    }

    #[test]
    fn service_type_parses_case_insensitively() {
        assert_eq!("NodePort".parse::<ServerServiceType>().unwrap(), ServerServiceType::NodePort);
        assert_eq!("clusterip".parse::<ServerServiceType>().unwrap(), ServerServiceType::ClusterIp);
        assert!("Ingress".parse::<ServerServiceType>().is_err());
    }
}
