//! Cordon / eviction / termination-wait protocol
//!
//! Draining uses the eviction API rather than pod deletion so that
//! disruption budgets are respected. The cluster signals a budget
//! refusal with a 429; those evictions are retried on a fixed interval
//! for a bounded window before the drain is abandoned.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cluster::ClusterApi;
use crate::config::ControllerConfig;
use crate::Error;

/// Poll interval while waiting for evicted pods to terminate
const TERMINATION_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Interval between retries of a budget-blocked eviction
///
/// `kubectl drain` waits the same 5 seconds between attempts.
const EVICTION_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// How long a single pod may stay budget-blocked before the drain aborts
const EVICTION_RETRY_WINDOW: Duration = Duration::from_secs(2 * 60);

/// Annotation the kubelet places on static mirror pods
const MIRROR_POD_ANNOTATION: &str = "kubernetes.io/config.mirror";

/// Drives the cordon and drain protocol for one node at a time
pub struct Drainer {
    cluster: Arc<dyn ClusterApi>,
    timeout: Duration,
    grace_period: Duration,
    ignore_daemon_sets: bool,
    delete_local_data: bool,
}

impl Drainer {
    /// Build a drainer over the given cluster seam
    pub fn new(cluster: Arc<dyn ClusterApi>, cfg: &ControllerConfig) -> Self {
        Self {
            cluster,
            timeout: cfg.drain_timeout,
            grace_period: cfg.drain_grace_period,
            ignore_daemon_sets: cfg.ignore_daemon_sets,
            delete_local_data: cfg.delete_local_data,
        }
    }

    /// Mark the node unschedulable
    ///
    /// Idempotent: an already-cordoned node is left untouched and the
    /// call succeeds without mutation.
    pub async fn cordon(&self, node_name: &str) -> Result<(), Error> {
        let node = self.cluster.get_node(node_name).await?;
        let unschedulable = node
            .spec
            .as_ref()
            .and_then(|s| s.unschedulable)
            .unwrap_or(false);
        if unschedulable {
            return Ok(());
        }
        self.cluster.set_unschedulable(node_name, true).await
    }

    /// Mark the node schedulable again
    ///
    /// Unused by the reconciler today but part of the drainer's contract.
    pub async fn uncordon(&self, node_name: &str) -> Result<(), Error> {
        let node = self.cluster.get_node(node_name).await?;
        let unschedulable = node
            .spec
            .as_ref()
            .and_then(|s| s.unschedulable)
            .unwrap_or(false);
        if !unschedulable {
            return Ok(());
        }
        self.cluster.set_unschedulable(node_name, false).await
    }

    /// Evict every movable pod from the node and wait for termination
    ///
    /// The whole sequence runs under the configured drain timeout. The
    /// first fatal pod error aborts the drain; a pod persistently
    /// refused by its disruption budget aborts it with
    /// [`Error::EvictionBlocked`].
    pub async fn drain(&self, node_name: &str) -> Result<(), Error> {
        match tokio::time::timeout(self.timeout, self.drain_inner(node_name)).await {
            Ok(result) => result,
            Err(_) => Err(Error::DeadlineExceeded {
                node: node_name.to_string(),
            }),
        }
    }

    async fn drain_inner(&self, node_name: &str) -> Result<(), Error> {
        let pods = self.eviction_set(node_name).await?;
        info!(node = %node_name, pods = pods.len(), "draining node");

        for pod in &pods {
            self.evict_with_retry(pod).await?;
        }

        self.wait_for_pods_to_terminate(node_name).await
    }

    /// List the node's pods and keep the ones a drain should evict
    async fn eviction_set(&self, node_name: &str) -> Result<Vec<Pod>, Error> {
        let pods = self.cluster.pods_on_node(node_name).await?;
        Ok(pods
            .into_iter()
            .filter(|pod| self.should_evict(pod))
            .collect())
    }

    fn should_evict(&self, pod: &Pod) -> bool {
        let phase = pod
            .status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .unwrap_or("");
        if phase == "Succeeded" || phase == "Failed" {
            return false;
        }

        if self.ignore_daemon_sets && is_daemon_set_pod(pod) {
            return false;
        }

        if is_mirror_pod(pod) {
            return false;
        }

        if !self.delete_local_data && has_local_storage(pod) {
            warn!(pod = %pod_id(pod), "pod has local storage, skipping");
            return false;
        }

        true
    }

    async fn evict_with_retry(&self, pod: &Pod) -> Result<(), Error> {
        let id = pod_id(pod);
        let namespace = pod.metadata.namespace.as_deref().unwrap_or("default");
        let name = pod.metadata.name.as_deref().unwrap_or("");
        let grace = self.grace_period.as_secs() as u32;

        match self.cluster.evict_pod(namespace, name, grace).await {
            Ok(()) => {
                debug!(pod = %id, "evicted pod");
                return Ok(());
            }
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) if e.is_too_many_requests() => {
                warn!(pod = %id, "eviction blocked by disruption budget, retrying");
            }
            Err(e) => {
                return Err(Error::EvictionFailed {
                    pod: id,
                    source: Box::new(e),
                })
            }
        }

        // Budget-blocked: retry on a fixed interval for a bounded window.
        let deadline = Instant::now() + EVICTION_RETRY_WINDOW;
        loop {
            tokio::time::sleep(EVICTION_RETRY_INTERVAL).await;
            if Instant::now() >= deadline {
                return Err(Error::EvictionBlocked { pod: id });
            }

            match self.cluster.evict_pod(namespace, name, grace).await {
                Ok(()) => {
                    debug!(pod = %id, "evicted pod after disruption budget cleared");
                    return Ok(());
                }
                Err(e) if e.is_not_found() => return Ok(()),
                Err(e) if e.is_too_many_requests() => continue,
                Err(e) => {
                    return Err(Error::EvictionFailed {
                        pod: id,
                        source: Box::new(e),
                    })
                }
            }
        }
    }

    async fn wait_for_pods_to_terminate(&self, node_name: &str) -> Result<(), Error> {
        loop {
            let remaining = self.eviction_set(node_name).await?;
            if remaining.is_empty() {
                return Ok(());
            }
            debug!(
                node = %node_name,
                pods = remaining.len(),
                "waiting for pods to terminate"
            );
            tokio::time::sleep(TERMINATION_POLL_INTERVAL).await;
        }
    }
}

fn is_daemon_set_pod(pod: &Pod) -> bool {
    pod.metadata
        .owner_references
        .as_ref()
        .is_some_and(|refs| refs.iter().any(|r| r.kind == "DaemonSet"))
}

fn is_mirror_pod(pod: &Pod) -> bool {
    pod.metadata
        .annotations
        .as_ref()
        .is_some_and(|a| a.contains_key(MIRROR_POD_ANNOTATION))
}

fn has_local_storage(pod: &Pod) -> bool {
    pod.spec
        .as_ref()
        .and_then(|s| s.volumes.as_ref())
        .is_some_and(|vols| vols.iter().any(|v| v.empty_dir.is_some()))
}

fn pod_id(pod: &Pod) -> String {
    format!(
        "{}/{}",
        pod.metadata.namespace.as_deref().unwrap_or("default"),
        pod.metadata.name.as_deref().unwrap_or("")
    )
}
