//! Kubelet healthz probe

use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;

use super::HealthCheck;
use crate::Error;

/// Per-request timeout for the healthz probe
const KUBELET_TIMEOUT: Duration = Duration::from_secs(5);

/// Port the kubelet serves its health endpoint on
const KUBELET_PORT: u16 = 10250;

/// Probes the kubelet's `/healthz` endpoint over its internal address
///
/// A node without an InternalIP address is treated as healthy: the probe
/// is simply not applicable. The kubelet serves a cluster-internal
/// certificate, so verification is skipped for this probe.
pub struct KubeletCheck {
    client: reqwest::Client,
}

impl KubeletCheck {
    /// Build the probe with its dedicated HTTP client
    pub fn new() -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .timeout(KUBELET_TIMEOUT)
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| Error::internal(format!("build kubelet http client: {e}")))?;
        Ok(Self { client })
    }

    fn internal_ip(node: &Node) -> Option<&str> {
        node.status
            .as_ref()
            .and_then(|s| s.addresses.as_ref())
            .and_then(|addrs| addrs.iter().find(|a| a.type_ == "InternalIP"))
            .map(|a| a.address.as_str())
    }
}

#[async_trait]
impl HealthCheck for KubeletCheck {
    fn name(&self) -> &'static str {
        "kubelet"
    }

    async fn run(&self, node: &Node) -> (bool, String) {
        let Some(ip) = Self::internal_ip(node) else {
            return (true, String::new());
        };

        let url = format!("https://{ip}:{KUBELET_PORT}/healthz");
        match self.client.get(&url).send().await {
            Ok(resp) if resp.status() == reqwest::StatusCode::OK => (true, String::new()),
            Ok(resp) => (
                false,
                format!("kubelet unhealthy: status {}", resp.status().as_u16()),
            ),
            Err(e) => (false, format!("kubelet unreachable: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{NodeAddress, NodeStatus};

    fn node_with_addresses(addresses: Vec<NodeAddress>) -> Node {
        Node {
            status: Some(NodeStatus {
                addresses: Some(addresses),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn node_without_internal_ip_is_healthy() {
        let check = KubeletCheck::new().unwrap();
        let node = node_with_addresses(vec![NodeAddress {
            type_: "Hostname".to_string(),
            address: "node-a".to_string(),
        }]);

        let (healthy, reason) = check.run(&node).await;
        assert!(healthy);
        assert!(reason.is_empty());
    }

    #[test]
    fn internal_ip_is_picked_over_other_addresses() {
        let node = node_with_addresses(vec![
            NodeAddress {
                type_: "Hostname".to_string(),
                address: "node-a".to_string(),
            },
            NodeAddress {
                type_: "InternalIP".to_string(),
                address: "10.0.0.4".to_string(),
            },
        ]);
        assert_eq!(KubeletCheck::internal_ip(&node), Some("10.0.0.4"));
    }

    #[tokio::test]
    async fn unreachable_kubelet_reports_transport_error() {
        let check = KubeletCheck::new().unwrap();
        // Nothing listens on the kubelet port locally.
        let node = node_with_addresses(vec![NodeAddress {
            type_: "InternalIP".to_string(),
            address: "127.0.0.1".to_string(),
        }]);

        let (healthy, reason) = check.run(&node).await;
        assert!(!healthy);
        assert!(reason.starts_with("kubelet unreachable"));
    }
}
