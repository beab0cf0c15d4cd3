//! Cloud provider abstraction
//!
//! The autoscaler and reconciler consume the provider through a small
//! capability set: resize a node pool, release a node, and read
//! cluster-wide utilisation. A disabled variant stands in when no cloud
//! subscription is configured, so the core never branches on `Option`.

use async_trait::async_trait;

#[cfg(test)]
use mockall::automock;

use crate::Error;

mod azure;

pub use azure::AzureCloud;

/// Cluster-wide utilisation fractions averaged over the recent window
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ClusterUtilization {
    /// CPU utilisation in `[0, 1]`
    pub cpu: f64,
    /// Memory (working set) utilisation in `[0, 1]`
    pub memory: f64,
}

/// Operations the controller needs from the cloud
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// True when the provider can actually perform scale operations
    ///
    /// The disabled variant reports false, which turns every autoscaling
    /// evaluation into a no-op.
    fn enabled(&self) -> bool;

    /// Resize the named pool to the desired node count
    ///
    /// Returns only once the cloud reports the operation durably
    /// complete.
    async fn scale_node_pool(&self, pool: &str, count: u32) -> Result<(), Error>;

    /// Release one node from the pool after a drain
    ///
    /// The pool's desired count is decremented and the cloud chooses
    /// which node to reclaim; a pool at one node or fewer is left alone.
    async fn delete_node(&self, pool: &str, node: &str) -> Result<(), Error>;

    /// Read cluster utilisation averaged over the recent metrics window
    async fn cluster_utilization(&self) -> Result<ClusterUtilization, Error>;
}

/// Provider used when no cloud subscription is configured
///
/// Utilisation reads as zero and scale operations succeed without doing
/// anything, which keeps the reconciler free of nil-checks.
pub struct DisabledCloud;

#[async_trait]
impl CloudProvider for DisabledCloud {
    fn enabled(&self) -> bool {
        false
    }

    async fn scale_node_pool(&self, _pool: &str, _count: u32) -> Result<(), Error> {
        Ok(())
    }

    async fn delete_node(&self, _pool: &str, _node: &str) -> Result<(), Error> {
        Ok(())
    }

    async fn cluster_utilization(&self) -> Result<ClusterUtilization, Error> {
        Ok(ClusterUtilization::default())
    }
}
