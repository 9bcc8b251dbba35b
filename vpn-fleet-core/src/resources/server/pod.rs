use k8s_openapi::api::core::v1::{
    Capabilities, Container, ContainerPort, EmptyDirVolumeSource, EnvVar, EnvVarSource, Pod,
    PodSpec, Secret, SecretKeySelector, SecurityContext, Volume, VolumeMount,
};
use kube::{core::ObjectMeta, ResourceExt};

use crate::{helpers::RequireMetadata, resources::ResourceGenerationError};

use super::{secret::SERVER_PRIVATE_KEY, ServerRelease};

pub const EXPOSED_PORT_NAME: &str = "wireguard";
pub const EXPOSED_PORT_PROTOCOL: &str = "UDP";

pub const SERVER_NAME_ENV: &str = "VPN_FLEET_SERVER_NAME";
pub const SERVER_NAMESPACE_ENV: &str = "VPN_FLEET_SERVER_NAMESPACE";

pub const CONFIG_VOLUME_NAME: &str = "config";
pub const CONFIG_MOUNT_PATH: &str = "/config";

const INIT_CONTAINER_NAME: &str = "router-init";
pub const SERVER_CONTAINER_NAME: &str = "wireguard";

/// Location of the interface config rendered by `router init`.
pub fn config_file_path(interface: &str) -> String {
    format!("{CONFIG_MOUNT_PATH}/wg_confs/{interface}.conf")
}

impl ServerRelease {
    pub fn generate_pod_metadata(&self) -> ObjectMeta {
        ObjectMeta {
            name: None,
            generate_name: Some(format!("{}-", self.get_name())),
            ..self.generate_metadata()
        }
    }

    /// One server instance. Every replica is a separate pod so instances can be removed
    /// individually.
    pub fn generate_pod(&self, secret: &Secret) -> Result<Pod, ResourceGenerationError> {
        let secret_name = secret
            .require_name_or(ResourceGenerationError::DependentMissingMetadataName)?
            .to_owned();

        let config_mount = VolumeMount {
            name: CONFIG_VOLUME_NAME.to_owned(),
            mount_path: CONFIG_MOUNT_PATH.to_owned(),
            ..Default::default()
        };

        let init_container = Container {
            name: INIT_CONTAINER_NAME.to_owned(),
            image: Some(self.agent_image.to_owned()),
            image_pull_policy: Some("IfNotPresent".to_owned()),
            args: Some(vec!["router".to_owned(), "init".to_owned()]),
            env: Some(vec![
                EnvVar {
                    name: SERVER_NAME_ENV.to_owned(),
                    value: Some(self.name.to_owned()),
                    ..Default::default()
                },
                EnvVar {
                    name: SERVER_NAMESPACE_ENV.to_owned(),
                    value: Some(self.namespace.to_owned()),
                    ..Default::default()
                },
                EnvVar {
                    name: SERVER_PRIVATE_KEY.to_owned(),
                    value_from: Some(EnvVarSource {
                        secret_key_ref: Some(SecretKeySelector {
                            name: Some(secret_name),
                            key: SERVER_PRIVATE_KEY.to_owned(),
                            optional: Some(false),
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            ]),
            volume_mounts: Some(vec![config_mount.to_owned()]),
            ..Default::default()
        };

        let server_container = Container {
            name: SERVER_CONTAINER_NAME.to_owned(),
            image: Some(self.spec.image.to_owned()),
            image_pull_policy: Some("IfNotPresent".to_owned()),
            ports: Some(vec![ContainerPort {
                name: Some(EXPOSED_PORT_NAME.to_owned()),
                container_port: self.spec.port,
                protocol: Some(EXPOSED_PORT_PROTOCOL.to_owned()),
                ..Default::default()
            }]),
            resources: self.spec.resources.as_ref().map(|resources| resources.to_requirements()),
            security_context: Some(SecurityContext {
                capabilities: Some(Capabilities {
                    add: Some(vec!["NET_ADMIN".to_owned()]),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            volume_mounts: Some(vec![config_mount]),
            ..Default::default()
        };

        let pod_spec = PodSpec {
            affinity: self.spec.affinity.as_ref().map(|affinity| affinity.to_affinity()),
            automount_service_account_token: Some(true),
            containers: vec![server_container],
            init_containers: Some(vec![init_container]),
            node_selector: self.spec.node_selector.to_owned(),
            service_account_name: Some(self.service_account.to_owned()),
            tolerations: self.spec.tolerations.as_ref().map(|tolerations| {
                tolerations
                    .iter()
                    .map(|toleration| toleration.to_toleration())
                    .collect()
            }),
            volumes: Some(vec![Volume {
                name: CONFIG_VOLUME_NAME.to_owned(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Default::default()
            }]),
            ..Default::default()
        };

        Ok(Pod {
            metadata: self.generate_pod_metadata(),
            spec: Some(pod_spec),
            ..Default::default()
        })
    }
}

pub fn is_pod_terminating(pod: &Pod) -> bool {
    pod.metadata.deletion_timestamp.is_some()
}

/// Running with a true `Ready` condition.
pub fn is_pod_ready(pod: &Pod) -> bool {
    let status = match &pod.status {
        Some(status) => status,
        None => return false,
    };

    status.phase.as_deref() == Some("Running")
        && status
            .conditions
            .as_ref()
            .map(|conditions| {
                conditions
                    .iter()
                    .any(|condition| condition.type_ == "Ready" && condition.status == "True")
            })
            .unwrap_or(false)
}

pub fn is_pod_available(pod: &Pod) -> bool {
    is_pod_ready(pod) && !is_pod_terminating(pod)
}

/// Oldest pods first, names break ties so the order is stable.
pub fn sort_oldest_first(pods: &mut [Pod]) {
    pods.sort_by(|a, b| {
        a.metadata
            .creation_timestamp
            .as_ref()
            .map(|time| time.0)
            .cmp(&b.metadata.creation_timestamp.as_ref().map(|time| time.0))
            .then_with(|| a.name_any().cmp(&b.name_any()))
    });
}
