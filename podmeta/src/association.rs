//! Picks the pod identifier for a piece of incoming telemetry.

use std::net::{IpAddr, SocketAddr};

use crate::kube::{Association, Attributes, PodIdentifier, TAG_NAMESPACE_NAME, TAG_POD_NAME};

/// Attribute carrying a pod IP.
pub const K8S_IP_LABEL: &str = "k8s.pod.ip";
/// Legacy client IP attribute.
pub const CLIENT_IP_LABEL: &str = "ip";
pub const HOST_NAME_LABEL: &str = "host.name";

pub const FROM_CONNECTION: &str = "connection";
pub const FROM_RESOURCE_ATTRIBUTE: &str = "resource_attribute";
pub const FROM_BUILD_HOSTNAME: &str = "build_hostname";

/// Sender IP of a connection given as `ip`, `ip:port` or `[ipv6]:port`.
pub fn connection_ip(addr: &str) -> Option<IpAddr> {
    let addr = addr.trim();
    if let Ok(ip) = addr.parse::<IpAddr>() {
        return Some(ip);
    }
    addr.parse::<SocketAddr>().ok().map(|sock| sock.ip())
}

/// Returns the attribute key the identifier came from and the identifier.
///
/// Without associations the pod IP attribute, the client IP attribute, the
/// connection address and an IP-valued `host.name` are tried in that order.
/// Otherwise the first association that yields a value wins.
pub fn extract_pod_id(
    attrs: &Attributes,
    connection: Option<IpAddr>,
    associations: &[Association],
) -> Option<(String, PodIdentifier)> {
    let attr = |key: &str| attrs.get(key).map(String::as_str).filter(|v| !v.is_empty());
    let hostname_ip = || attr(HOST_NAME_LABEL).filter(|h| h.parse::<IpAddr>().is_ok());

    if associations.is_empty() {
        let id = attr(K8S_IP_LABEL)
            .or_else(|| attr(CLIENT_IP_LABEL))
            .map(PodIdentifier::from)
            .or_else(|| connection.map(|ip| PodIdentifier::new(ip.to_string())))
            .or_else(|| hostname_ip().map(PodIdentifier::from))?;
        return Some((K8S_IP_LABEL.to_string(), id));
    }

    for association in associations {
        match association.from.as_str() {
            FROM_CONNECTION => {
                if let Some(ip) = connection {
                    return Some((K8S_IP_LABEL.to_string(), PodIdentifier::new(ip.to_string())));
                }
            }
            FROM_RESOURCE_ATTRIBUTE if association.name == HOST_NAME_LABEL => {
                if let Some(host) = hostname_ip() {
                    return Some((K8S_IP_LABEL.to_string(), PodIdentifier::from(host)));
                }
            }
            FROM_RESOURCE_ATTRIBUTE => {
                if let Some(value) = attr(&association.name) {
                    return Some((association.name.clone(), PodIdentifier::from(value)));
                }
            }
            FROM_BUILD_HOSTNAME => {
                let pod = attr(TAG_POD_NAME).unwrap_or_default();
                let namespace = attr(TAG_NAMESPACE_NAME).unwrap_or_default();
                if let Some(id) = PodIdentifier::from_name_namespace(pod, namespace) {
                    return Some((association.name.clone(), id));
                }
            }
            _ => {}
        }
    }
    None
}
