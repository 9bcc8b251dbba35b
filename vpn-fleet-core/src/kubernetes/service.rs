use std::net::{IpAddr, SocketAddr};

use itertools::chain;
use k8s_openapi::api::core::v1::{Node, NodeAddress, Service, ServiceSpec, ServiceStatus};

/// Every `host:port` clients could use to reach the service, best candidates first.
pub fn get_service_endpoints(service: &Service, nodes: &[Node]) -> Vec<String> {
    let service_spec = match service.spec.as_ref() {
        Some(spec) => spec,
        None => return Vec::new(),
    };
    let port = match get_first_port(service_spec) {
        Some(port) => port,
        None => return Vec::new(),
    };

    let external_ips = service_spec
        .external_ips
        .as_deref()
        .unwrap_or_default()
        .iter()
        .filter_map(|raw| raw.parse::<IpAddr>().ok())
        .map(|addr| SocketAddr::new(addr, port).to_string())
        .collect::<Vec<_>>();

    let service_kind = service_spec.type_.as_deref().unwrap_or("ClusterIP");
    let additional = match service_kind {
        "NodePort" => get_nodeport_endpoints(service_spec, nodes),
        "LoadBalancer" => chain![
            get_loadbalancer_endpoints(service.status.as_ref(), port),
            get_nodeport_endpoints(service_spec, nodes)
        ]
        .collect(),
        "ClusterIP" => get_clusterip_endpoints(service_spec, port),
        _ => Vec::new(),
    };

    chain![external_ips, additional].collect()
}

pub fn get_service_endpoint(service: &Service, nodes: &[Node]) -> Option<String> {
    get_service_endpoints(service, nodes).into_iter().next()
}

fn get_nodeport_endpoints(service_spec: &ServiceSpec, nodes: &[Node]) -> Vec<String> {
    let port = match get_first_node_port(service_spec) {
        Some(port) => port,
        None => return Vec::new(),
    };

    let node_ips_of_type = |kind: &'static str| {
        get_node_address_iterator(nodes)
            .filter(move |node_address| node_address.type_ == kind)
            .filter_map(|node_address| node_address.address.parse::<IpAddr>().ok())
            .map(move |addr| SocketAddr::new(addr, port).to_string())
    };

    chain![node_ips_of_type("ExternalIP"), node_ips_of_type("InternalIP")].collect()
}

fn get_loadbalancer_endpoints(service_status: Option<&ServiceStatus>, port: u16) -> Vec<String> {
    service_status
        .and_then(|s| s.load_balancer.as_ref())
        .and_then(|l| l.ingress.as_ref())
        .map(|ingress| {
            ingress
                .iter()
                .filter_map(|entry| match (&entry.ip, &entry.hostname) {
                    (Some(ip), _) => ip
                        .parse::<IpAddr>()
                        .ok()
                        .map(|ip| SocketAddr::new(ip, port).to_string()),
                    (None, Some(hostname)) => Some(format!("{hostname}:{port}")),
                    (None, None) => None,
                })
                .collect()
        })
        .unwrap_or_default()
}

fn get_clusterip_endpoints(service_spec: &ServiceSpec, port: u16) -> Vec<String> {
    service_spec
        .cluster_ips
        .as_deref()
        .unwrap_or_default()
        .iter()
        .filter_map(|ip| ip.parse::<IpAddr>().ok())
        .map(|ip| SocketAddr::new(ip, port).to_string())
        .collect()
}

fn get_node_address_iterator(nodes: &[Node]) -> impl Iterator<Item = &NodeAddress> {
    nodes
        .iter()
        .filter_map(|node| {
            node.status
                .as_ref()
                .and_then(|status| status.addresses.as_ref())
        })
        .flatten()
}

fn get_first_port(service_spec: &ServiceSpec) -> Option<u16> {
    service_spec
        .ports
        .as_ref()
        .and_then(|v| v.first())
        .and_then(|p| u16::try_from(p.port).ok())
}

fn get_first_node_port(service_spec: &ServiceSpec) -> Option<u16> {
    service_spec
        .ports
        .as_ref()
        .and_then(|i| i.first())
        .and_then(|i| i.node_port)
        .and_then(|port| u16::try_from(port).ok())
}
