use k8s_openapi::{
    api::core::v1::{Service, ServicePort, ServiceSpec},
    apimachinery::pkg::util::intstr::IntOrString,
};

use crate::resources::labels::get_server_labels;

use super::{pod::EXPOSED_PORT_NAME, ServerRelease};

impl ServerRelease {
    pub fn generate_service(&self) -> Service {
        let port = ServicePort {
            name: Some(EXPOSED_PORT_NAME.to_owned()),
            port: self.spec.port,
            protocol: Some("UDP".to_owned()),
            target_port: Some(IntOrString::String(EXPOSED_PORT_NAME.to_owned())),
            ..Default::default()
        };

        Service {
            metadata: self.generate_metadata(),
            spec: Some(ServiceSpec {
                selector: Some(get_server_labels(&self.name)),
                type_: Some(self.service_type.to_string()),
                ports: Some(vec![port]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

    use crate::resources::{
        labels::SERVER_LABEL,
        server::{tests::release, ServerServiceType},
    };

    #[test]
    fn service_targets_the_server_pods() {
        let mut release = release();
        release.service_type = ServerServiceType::NodePort;

        let service = release.generate_service();
        let spec = service.spec.unwrap();
        let port = &spec.ports.unwrap()[0];

        assert_eq!(spec.type_.as_deref(), Some("NodePort"));
        assert_eq!(spec.selector.unwrap()[SERVER_LABEL], "edge");
        assert_eq!(port.port, 51820);
        assert_eq!(port.protocol.as_deref(), Some("UDP"));
        assert_eq!(port.target_port, Some(IntOrString::String("wireguard".to_owned())));
    }
}
