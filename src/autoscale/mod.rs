//! Cooldown- and bound-aware scale decisions
//!
//! The autoscaler runs at most once per reconciliation tick, serialised
//! by its own lock. Utilisation above the scale-up threshold grows the
//! pool by one node; utilisation below the scale-down threshold on both
//! axes shrinks it by one. Cooldowns gate successful actions only: a
//! failed cloud call leaves the timestamps untouched so the next tick
//! may retry immediately.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::alerting::{Alert, Alerter, Severity};
use crate::cloud::{CloudProvider, ClusterUtilization};
use crate::config::AutoscalingConfig;
use crate::metrics::{Metrics, Outcome};

/// Last successful scale actions; zero values mean "never", which always
/// compares as cooldown elapsed
#[derive(Debug, Default)]
struct ScaleState {
    last_scale_up: Option<Instant>,
    last_scale_down: Option<Instant>,
}

/// Makes one scale decision per reconciliation tick
pub struct Autoscaler {
    cloud: Arc<dyn CloudProvider>,
    alerter: Arc<Alerter>,
    metrics: Arc<Metrics>,
    config: AutoscalingConfig,
    state: Mutex<ScaleState>,
}

impl Autoscaler {
    /// Build the autoscaler over the given cloud seam
    pub fn new(
        cloud: Arc<dyn CloudProvider>,
        alerter: Arc<Alerter>,
        metrics: Arc<Metrics>,
        config: AutoscalingConfig,
    ) -> Self {
        Self {
            cloud,
            alerter,
            metrics,
            config,
            state: Mutex::new(ScaleState::default()),
        }
    }

    /// Evaluate utilisation and perform at most one resize step
    ///
    /// `node_count` is the number of nodes the cluster currently reports.
    pub async fn evaluate(&self, node_count: usize) {
        let mut state = self.state.lock().await;

        let util = match self.cloud.cluster_utilization().await {
            Ok(util) => util,
            Err(e) => {
                error!(error = %e, "failed to read cluster utilisation, skipping scale evaluation");
                return;
            }
        };

        debug!(
            cpu = util.cpu,
            memory = util.memory,
            nodes = node_count,
            "evaluating autoscaling"
        );
        self.metrics.set_cluster_utilization(util.cpu, util.memory);

        if !self.cloud.enabled() {
            return;
        }

        if util.cpu > self.config.scale_up_threshold || util.memory > self.config.scale_up_threshold
        {
            self.consider_scale_up(&mut state, node_count, util).await;
        }

        if util.cpu < self.config.scale_down_threshold
            && util.memory < self.config.scale_down_threshold
        {
            self.consider_scale_down(&mut state, node_count, util).await;
        }
    }

    async fn consider_scale_up(
        &self,
        state: &mut ScaleState,
        node_count: usize,
        util: ClusterUtilization,
    ) {
        if let Some(last) = state.last_scale_up {
            if last.elapsed() < self.config.scale_up_cooldown {
                debug!("scale-up cooldown active, skipping");
                return;
            }
        }

        let count = node_count as u32;
        if count >= self.config.max_nodes {
            info!(nodes = count, max = self.config.max_nodes, "cluster at maximum node count, cannot scale up");
            return;
        }

        let pool = &self.config.node_pools[0];
        let target = (count + 1).clamp(self.config.min_nodes, self.config.max_nodes);

        info!(pool = %pool, from = count, to = target, "scaling up node pool");
        if let Err(e) = self.cloud.scale_node_pool(pool, target).await {
            error!(pool = %pool, error = %e, "failed to scale up");
            self.metrics.inc_scale(pool, "up", Outcome::Failure);
            return;
        }

        state.last_scale_up = Some(Instant::now());
        self.metrics.inc_scale(pool, "up", Outcome::Success);

        self.alerter
            .send(Alert::new(
                Severity::Info,
                "Cluster scaled up",
                format!(
                    "Node pool {} scaled to {} nodes. CPU: {:.1}%, Memory: {:.1}%",
                    pool,
                    target,
                    util.cpu * 100.0,
                    util.memory * 100.0
                ),
                "nodePool",
                pool,
            ))
            .await;
    }

    async fn consider_scale_down(
        &self,
        state: &mut ScaleState,
        node_count: usize,
        util: ClusterUtilization,
    ) {
        if let Some(last) = state.last_scale_down {
            if last.elapsed() < self.config.scale_down_cooldown {
                debug!("scale-down cooldown active, skipping");
                return;
            }
        }

        let count = node_count as u32;
        if count <= self.config.min_nodes {
            info!(nodes = count, min = self.config.min_nodes, "cluster at minimum node count, cannot scale down");
            return;
        }

        let pool = &self.config.node_pools[0];
        let target = (count - 1).clamp(self.config.min_nodes, self.config.max_nodes);

        info!(pool = %pool, from = count, to = target, "scaling down node pool");
        if let Err(e) = self.cloud.scale_node_pool(pool, target).await {
            error!(pool = %pool, error = %e, "failed to scale down");
            self.metrics.inc_scale(pool, "down", Outcome::Failure);
            return;
        }

        state.last_scale_down = Some(Instant::now());
        self.metrics.inc_scale(pool, "down", Outcome::Success);

        self.alerter
            .send(Alert::new(
                Severity::Info,
                "Cluster scaled down",
                format!(
                    "Node pool {} scaled to {} nodes. CPU: {:.1}%, Memory: {:.1}%",
                    pool,
                    target,
                    util.cpu * 100.0,
                    util.memory * 100.0
                ),
                "nodePool",
                pool,
            ))
            .await;
    }

    /// Stamp the last successful scale-up, for tests exercising cooldowns
    #[cfg(test)]
    async fn force_last_scale_up(&self, at: Instant) {
        self.state.lock().await.last_scale_up = Some(at);
    }
}
