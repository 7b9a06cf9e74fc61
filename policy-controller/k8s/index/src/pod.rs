use netpol_controller_k8s_api::{self as k8s, Labels};
use std::net::IpAddr;
use tracing::warn;

/// The state of a pod that is relevant to policy enforcement.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Pod {
    pub(crate) labels: Labels,

    /// The pod's address, if it is scheduled and uses the pod network.
    pub(crate) ip: Option<IpAddr>,
}

// === impl Pod ===

impl Pod {
    pub(crate) fn from_resource(pod: &k8s::Pod) -> Self {
        Self {
            labels: pod.metadata.labels.clone().into(),
            ip: pod_ip(pod),
        }
    }
}

/// Returns the address a pod's traffic is matched by.
///
/// Pods that have terminated no longer own their address, and pods on the host network share the
/// node's address, so neither is enforced.
fn pod_ip(pod: &k8s::Pod) -> Option<IpAddr> {
    if pod
        .spec
        .as_ref()
        .and_then(|spec| spec.host_network)
        .unwrap_or(false)
    {
        return None;
    }

    let status = pod.status.as_ref()?;
    if matches!(status.phase.as_deref(), Some("Succeeded" | "Failed")) {
        return None;
    }

    let ip = status.pod_ip.as_deref().filter(|ip| !ip.is_empty())?;
    match ip.parse() {
        Ok(ip) => Some(ip),
        Err(error) => {
            warn!(%ip, %error, "Ignoring invalid pod IP");
            None
        }
    }
}
