use std::{collections::BTreeMap, net::IpAddr};

use ipnet::{IpNet, Ipv4Net};
use kube::CustomResource;
use once_cell::sync::Lazy;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use thiserror::Error;

use super::conditions::Condition;

pub const MIN_REPLICAS: i32 = 1;
pub const MAX_REPLICAS: i32 = 10;

static INTERFACE_NAME_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_=+.-]{1,15}$").expect("interface name regex is valid"));

#[skip_serializing_none]
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(
    group = "vpn-fleet.dev",
    version = "v1alpha1",
    kind = "VPNServer",
    namespaced,
    status = "VPNServerStatus",
    shortname = "vpns",
    printcolumn = r#"{"name":"Replicas", "type":"integer", "jsonPath":".status.replicas"}"#,
    printcolumn = r#"{"name":"Ready", "type":"integer", "jsonPath":".status.readyReplicas"}"#,
    printcolumn = r#"{"name":"Endpoint", "type":"string", "jsonPath":".status.endpoint"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VPNServerSpec {
    /// number of server instances (1-10)
    pub replicas: i32,
    /// server container image
    pub image: String,
    /// UDP listen port
    pub port: i32,
    /// WireGuard interface name
    pub interface: String,
    /// server address with the prefix of the peer pool, e.g. 10.0.0.1/24
    pub address: String,
    /// DNS server handed to clients
    pub dns: Option<String>,
    /// comma separated list of CIDRs clients route through the tunnel
    #[serde(rename = "allowedIPs")]
    pub allowed_ips: String,
    pub resources: Option<ServerResources>,
    pub node_selector: Option<BTreeMap<String, String>>,
    pub tolerations: Option<Vec<ServerToleration>>,
    pub affinity: Option<ServerAffinity>,
}

#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VPNServerStatus {
    pub replicas: i32,
    pub ready_replicas: i32,
    pub available_replicas: i32,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// server public key
    pub public_key: Option<String>,
    /// publicly reachable host:port
    pub endpoint: Option<String>,
    pub connected_clients: Option<i32>,
    /// received and sent bytes of every peer
    pub total_traffic: Option<i64>,
    pub observed_generation: Option<i64>,
}

#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ServerResources {
    pub limits: Option<ResourceList>,
    pub requests: Option<ResourceList>,
}

#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ResourceList {
    pub cpu: Option<String>,
    pub memory: Option<String>,
}

#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ServerToleration {
    pub key: Option<String>,
    pub operator: Option<String>,
    pub value: Option<String>,
    pub effect: Option<String>,
}

#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServerAffinity {
    pub node_affinity: Option<ServerNodeAffinity>,
    pub pod_affinity: Option<ServerPodAffinity>,
    pub pod_anti_affinity: Option<ServerPodAffinity>,
}

#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServerNodeAffinity {
    pub required_during_scheduling_ignored_during_execution: Option<ServerNodeSelector>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServerNodeSelector {
    pub node_selector_terms: Vec<ServerNodeSelectorTerm>,
}

#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServerNodeSelectorTerm {
    pub match_expressions: Option<Vec<SelectorRequirement>>,
}

#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct SelectorRequirement {
    pub key: String,
    pub operator: String,
    pub values: Option<Vec<String>>,
}

#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServerPodAffinity {
    pub required_during_scheduling_ignored_during_execution: Option<Vec<ServerPodAffinityTerm>>,
}

#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServerPodAffinityTerm {
    pub label_selector: Option<ServerLabelSelector>,
    pub namespaces: Option<Vec<String>>,
    pub topology_key: String,
}

#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServerLabelSelector {
    pub match_labels: Option<BTreeMap<String, String>>,
    pub match_expressions: Option<Vec<SelectorRequirement>>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SpecValidationError {
    #[error("Replica count {} is out of the {MIN_REPLICAS}-{MAX_REPLICAS} range!", .0)]
    ReplicasOutOfRange(i32),
    #[error("Port {} is out of the 1-65535 range!", .0)]
    PortOutOfRange(i32),
    #[error("'{}' is not a valid interface name!", .0)]
    InvalidInterface(String),
    #[error("'{}' is not a valid IPv4 server address with a prefix!", .0)]
    InvalidAddress(String),
    #[error("Pool of '{}' has no room for peers!", .0)]
    PoolTooSmall(String),
    #[error("'{}' is not a valid DNS address!", .0)]
    InvalidDns(String),
    #[error("'{}' is not a valid allowed IPs entry!", .0)]
    InvalidAllowedIps(String),
    #[error("Server image can't be empty!")]
    MissingImage,
}

/// Parsed, validated view of a [`VPNServerSpec`].
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedSpec {
    pub replicas: i32,
    pub port: u16,
    pub address: Ipv4Net,
    pub dns: Option<IpAddr>,
    pub allowed_ips: Vec<IpNet>,
}

impl VPNServerSpec {
    pub fn validate(&self) -> Result<ValidatedSpec, SpecValidationError> {
        if !(MIN_REPLICAS..=MAX_REPLICAS).contains(&self.replicas) {
            return Err(SpecValidationError::ReplicasOutOfRange(self.replicas));
        }

        let port = u16::try_from(self.port)
            .ok()
            .filter(|port| *port > 0)
            .ok_or(SpecValidationError::PortOutOfRange(self.port))?;

        if !INTERFACE_NAME_REGEX.is_match(&self.interface) {
            return Err(SpecValidationError::InvalidInterface(self.interface.to_owned()));
        }

        if self.image.trim().is_empty() {
            return Err(SpecValidationError::MissingImage);
        }

        let address: Ipv4Net = self
            .address
            .trim()
            .parse()
            .map_err(|_| SpecValidationError::InvalidAddress(self.address.to_owned()))?;

        // 2 leading reservations and at least one peer
        if address.prefix_len() > 29 {
            return Err(SpecValidationError::PoolTooSmall(self.address.to_owned()));
        }

        let dns = self
            .dns
            .as_deref()
            .map(str::trim)
            .filter(|dns| !dns.is_empty())
            .map(|dns| {
                dns.parse::<IpAddr>()
                    .map_err(|_| SpecValidationError::InvalidDns(dns.to_owned()))
            })
            .transpose()?;

        let allowed_ips = self
            .allowed_ips
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(|entry| {
                entry
                    .parse::<IpNet>()
                    .map_err(|_| SpecValidationError::InvalidAllowedIps(entry.to_owned()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        if allowed_ips.is_empty() {
            return Err(SpecValidationError::InvalidAllowedIps(self.allowed_ips.to_owned()));
        }

        Ok(ValidatedSpec {
            replicas: self.replicas,
            port,
            address,
            dns,
            allowed_ips,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{SpecValidationError, VPNServerSpec};

    fn spec() -> VPNServerSpec {
        VPNServerSpec {
            replicas: 2,
            image: "lscr.io/linuxserver/wireguard:latest".to_owned(),
            port: 51820,
            interface: "wg0".to_owned(),
            address: "10.0.0.1/24".to_owned(),
            dns: Some("1.1.1.1".to_owned()),
            allowed_ips: "0.0.0.0/0, ::/0".to_owned(),
            resources: None,
            node_selector: None,
            tolerations: None,
            affinity: None,
        }
    }

    #[test]
    fn valid_spec_is_parsed() {
        let validated = spec().validate().unwrap();

        assert_eq!(validated.port, 51820);
        assert_eq!(validated.address.to_string(), "10.0.0.1/24");
        assert_eq!(validated.allowed_ips.len(), 2);
    }

    #[test]
    fn spec_deserializes_from_camel_case() {
        let spec: VPNServerSpec = serde_json::from_value(serde_json::json!({
            "replicas": 1,
            "image": "wg",
            "port": 51820,
            "interface": "wg0",
            "address": "10.8.0.1/24",
            "allowedIPs": "10.8.0.0/24",
            "nodeSelector": { "kubernetes.io/os": "linux" },
            "tolerations": [{ "key": "dedicated", "operator": "Exists" }]
        }))
        .unwrap();

        assert_eq!(spec.allowed_ips, "10.8.0.0/24");
        assert_eq!(spec.tolerations.unwrap()[0].key.as_deref(), Some("dedicated"));
        assert!(spec.dns.is_none());
    }

    #[test]
    fn invalid_fields_are_rejected() {
        let cases = [
            (VPNServerSpec { replicas: 0, ..spec() }, SpecValidationError::ReplicasOutOfRange(0)),
            (VPNServerSpec { replicas: 11, ..spec() }, SpecValidationError::ReplicasOutOfRange(11)),
            (VPNServerSpec { port: 0, ..spec() }, SpecValidationError::PortOutOfRange(0)),
            (VPNServerSpec { port: 70000, ..spec() }, SpecValidationError::PortOutOfRange(70000)),
            (
                VPNServerSpec { interface: "wg0 && reboot".to_owned(), ..spec() },
                SpecValidationError::InvalidInterface("wg0 && reboot".to_owned()),
            ),
            (
                VPNServerSpec { address: "10.0.0.1".to_owned(), ..spec() },
                SpecValidationError::InvalidAddress("10.0.0.1".to_owned()),
            ),
            (
                VPNServerSpec { address: "10.0.0.1/30".to_owned(), ..spec() },
                SpecValidationError::PoolTooSmall("10.0.0.1/30".to_owned()),
            ),
            (
                VPNServerSpec { dns: Some("dns.example".to_owned()), ..spec() },
                SpecValidationError::InvalidDns("dns.example".to_owned()),
            ),
            (
                VPNServerSpec { allowed_ips: "0.0.0.0/0,nope".to_owned(), ..spec() },
                SpecValidationError::InvalidAllowedIps("nope".to_owned()),
            ),
            (VPNServerSpec { image: " ".to_owned(), ..spec() }, SpecValidationError::MissingImage),
        ];

        for (spec, expected) in cases {
            assert_eq!(spec.validate(), Err(expected));
        }
    }
}
