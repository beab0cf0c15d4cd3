//! Reconciliation loop and remediation dispatch
//!
//! The controller ticks on a fixed interval over a watcher-maintained
//! cache of the cluster's nodes. Each tick evaluates every node, folds
//! the result into the state store, and dispatches remediation for nodes
//! that crossed the unhealthy threshold. Remediation runs on its own
//! task, bounded by a semaphore, so a slow drain never delays the loop.
//! Autoscaling is evaluated once per tick after per-node work.

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Node;
use kube::api::Api;
use kube::runtime::reflector;
use kube::runtime::watcher;
use kube::{Client, ResourceExt};
use tokio::sync::Semaphore;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::alerting::{Alert, Alerter, Severity};
use crate::autoscale::Autoscaler;
use crate::cloud::CloudProvider;
use crate::config::Config;
use crate::drain::Drainer;
use crate::health::HealthEvaluator;
use crate::metrics::{Metrics, Outcome};
use crate::state::{DrainLease, NodeStateStore};
use crate::{Error, NODE_POOL_LABEL, NODE_POOL_LABEL_FALLBACK};

/// Everything the controller needs, wired up by `main`
pub struct ControllerOptions {
    /// Health evaluation pipeline
    pub evaluator: Arc<HealthEvaluator>,
    /// Cordon/drain driver
    pub drainer: Arc<Drainer>,
    /// Scale decision engine
    pub autoscaler: Arc<Autoscaler>,
    /// Alert egress
    pub alerter: Arc<Alerter>,
    /// Metrics collector
    pub metrics: Arc<Metrics>,
    /// Per-node state
    pub store: Arc<NodeStateStore>,
    /// Cloud provider, used for node replacement after a drain
    pub cloud: Arc<dyn CloudProvider>,
    /// Immutable configuration
    pub config: Arc<Config>,
    /// Cancelled on process shutdown
    pub shutdown: CancellationToken,
}

/// The reconciliation engine
#[derive(Clone)]
pub struct Controller {
    evaluator: Arc<HealthEvaluator>,
    drainer: Arc<Drainer>,
    autoscaler: Arc<Autoscaler>,
    alerter: Arc<Alerter>,
    metrics: Arc<Metrics>,
    store: Arc<NodeStateStore>,
    cloud: Arc<dyn CloudProvider>,
    config: Arc<Config>,
    drain_slots: Arc<Semaphore>,
    shutdown: CancellationToken,
}

impl Controller {
    /// Assemble the controller from its collaborators
    pub fn new(opts: ControllerOptions) -> Self {
        let drain_slots = Arc::new(Semaphore::new(opts.config.controller.max_concurrent_drains));
        Self {
            evaluator: opts.evaluator,
            drainer: opts.drainer,
            autoscaler: opts.autoscaler,
            alerter: opts.alerter,
            metrics: opts.metrics,
            store: opts.store,
            cloud: opts.cloud,
            config: opts.config,
            drain_slots,
            shutdown: opts.shutdown,
        }
    }

    /// Watch nodes and reconcile until shutdown
    ///
    /// Spawns the watch stream that maintains the node cache and the
    /// state store's key set, waits for the first full sync, then ticks
    /// every `reconcileInterval`.
    pub async fn run(&self, client: Client) -> Result<(), Error> {
        let nodes_api: Api<Node> = Api::all(client);
        let (reader, writer) = reflector::store::<Node>();
        let watch = reflector(writer, watcher(nodes_api, watcher::Config::default()));

        let store = self.store.clone();
        let metrics = self.metrics.clone();
        let watch_task = tokio::spawn(async move {
            let mut stream = Box::pin(watch);
            while let Some(event) = stream.next().await {
                match event {
                    Ok(watcher::Event::Delete(node)) => {
                        let name = node.name_any();
                        info!(node = %name, "node deleted");
                        store.remove(&name);
                        metrics.forget_node(&name);
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "node watch error"),
                }
            }
        });

        reader
            .wait_until_ready()
            .await
            .map_err(|e| Error::internal(format!("node cache sync: {e}")))?;
        info!("node cache synced, starting reconciliation loop");

        let period = self.config.controller.reconcile_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let started = Instant::now();
                    let nodes: Vec<Node> = reader.state().iter().map(|n| (**n).clone()).collect();
                    self.reconcile(&nodes).await;
                    self.metrics
                        .observe_reconcile_duration(started.elapsed().as_secs_f64());
                }
            }
        }

        watch_task.abort();
        info!("reconciliation loop stopped");
        Ok(())
    }

    /// One pass over the given node list
    pub async fn reconcile(&self, nodes: &[Node]) {
        self.metrics.set_node_count(nodes.len());

        for node in nodes {
            self.reconcile_node(node).await;
        }

        if self.config.autoscaling.enabled {
            self.autoscaler.evaluate(nodes.len()).await;
        }
    }

    async fn reconcile_node(&self, node: &Node) {
        let name = node.name_any();
        let result = self.evaluator.evaluate(node).await;
        let cordoned = node
            .spec
            .as_ref()
            .and_then(|s| s.unschedulable)
            .unwrap_or(false);

        let observation = self.store.observe(&name, cordoned, &result);
        self.metrics.set_node_health(&name, result.healthy);

        if result.healthy {
            return;
        }

        warn!(node = %name, reasons = ?result.reasons, "node unhealthy");

        if observation.unhealthy_count >= self.config.health_checks.unhealthy_threshold
            && !observation.drain_in_progress
        {
            self.dispatch_remediation(node, result.reasons);
        }
    }

    /// Start remediation on its own task, respecting the drain bound
    ///
    /// The per-node flag is flipped synchronously so the next tick sees
    /// the node as owned even before the task is scheduled.
    fn dispatch_remediation(&self, node: &Node, reasons: Vec<String>) {
        let name = node.name_any();

        let permit = match self.drain_slots.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                debug!(node = %name, "drain concurrency limit reached, deferring remediation");
                return;
            }
        };

        if self.store.set_drain_in_progress(&name, true) {
            // Lost the race to another dispatcher.
            return;
        }

        let ctrl = self.clone();
        let node = node.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let _lease = DrainLease::new(ctrl.store.clone(), node.name_any());
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!(node = %node.name_any(), "shutdown during remediation");
                }
                _ = ctrl.remediate(&node, &reasons) => {}
            }
        });
    }

    /// The cordon → drain → replace sequence for one unhealthy node
    async fn remediate(&self, node: &Node, reasons: &[String]) {
        let name = node.name_any();

        self.alerter
            .send(Alert::new(
                Severity::Warning,
                format!("Node {name} marked unhealthy"),
                format!("Reasons: {reasons:?}. Starting remediation."),
                "node",
                &name,
            ))
            .await;

        info!(node = %name, "cordoning node");
        if let Err(e) = self.drainer.cordon(&name).await {
            error!(node = %name, error = %e, "failed to cordon node");
            self.metrics.inc_cordon(&name, Outcome::Failure);
            return;
        }
        self.metrics.inc_cordon(&name, Outcome::Success);

        info!(node = %name, "draining node");
        if let Err(e) = self.drainer.drain(&name).await {
            error!(node = %name, error = %e, "failed to drain node");
            self.metrics.inc_drain(&name, Outcome::Failure);

            self.alerter
                .send(Alert::new(
                    Severity::Critical,
                    format!("Failed to drain node {name}"),
                    format!("Manual intervention required. Error: {e}"),
                    "node",
                    &name,
                ))
                .await;
            return;
        }
        self.metrics.inc_drain(&name, Outcome::Success);

        self.alerter
            .send(Alert::new(
                Severity::Info,
                format!("Node {name} drained successfully"),
                "Node has been cordoned and drained. Workloads migrated.",
                "node",
                &name,
            ))
            .await;

        if self.config.autoscaling.enabled {
            self.request_node_replacement(node, &name).await;
        }
    }

    async fn request_node_replacement(&self, node: &Node, name: &str) {
        let Some(pool) = node_pool(node) else {
            warn!(node = %name, "could not determine node pool for node");
            return;
        };

        info!(node = %name, pool = %pool, "requesting node replacement");
        if let Err(e) = self.cloud.delete_node(&pool, name).await {
            error!(node = %name, pool = %pool, error = %e, "failed to release node from cloud");
        }
    }
}

/// Pool label lookup with the AKS fallback key
fn node_pool(node: &Node) -> Option<String> {
    let labels = node.labels();
    labels
        .get(NODE_POOL_LABEL)
        .or_else(|| labels.get(NODE_POOL_LABEL_FALLBACK))
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerting::Alerter;
    use crate::cloud::MockCloudProvider;
    use crate::cluster::{ClusterApi, MockClusterApi};
    use crate::config::{AlertingConfig, Config};
    use chrono::Utc;
    use k8s_openapi::api::core::v1::{NodeCondition, NodeSpec, NodeStatus, Pod, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use kube::core::ErrorResponse;
    use std::time::Duration;

    fn ready_node(name: &str) -> Node {
        node_with(name, "Ready", "True")
    }

    fn node_with(name: &str, condition: &str, status: &str) -> Node {
        let mut node = Node::default();
        node.metadata.name = Some(name.to_string());
        let mut conditions = vec![NodeCondition {
            type_: "Ready".to_string(),
            status: "True".to_string(),
            last_heartbeat_time: Some(Time(Utc::now())),
            ..Default::default()
        }];
        if condition != "Ready" {
            conditions.push(NodeCondition {
                type_: condition.to_string(),
                status: status.to_string(),
                message: Some(format!("{condition} observed")),
                ..Default::default()
            });
        } else {
            conditions[0].status = status.to_string();
            conditions[0].message = Some("kubelet reported".to_string());
        }
        node.status = Some(NodeStatus {
            conditions: Some(conditions),
            ..Default::default()
        });
        node
    }

    fn labeled(mut node: Node, key: &str, value: &str) -> Node {
        node.metadata
            .labels
            .get_or_insert_with(Default::default)
            .insert(key.to_string(), value.to_string());
        node
    }

    fn uncordoned(mut node: Node) -> Node {
        node.spec = Some(NodeSpec {
            unschedulable: None,
            ..Default::default()
        });
        node
    }

    fn running_pod(name: &str) -> Pod {
        let mut pod = Pod::default();
        pod.metadata.name = Some(name.to_string());
        pod.metadata.namespace = Some("default".to_string());
        pod.status = Some(PodStatus {
            phase: Some("Running".to_string()),
            ..Default::default()
        });
        pod
    }

    fn too_many_requests() -> Error {
        Error::Kube(kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "disruption budget".to_string(),
            reason: "TooManyRequests".to_string(),
            code: 429,
        }))
    }

    fn test_config(checks: &[&str], threshold: u32) -> Config {
        let mut cfg = Config::default();
        cfg.health_checks.checks = checks.iter().map(|s| s.to_string()).collect();
        cfg.health_checks.unhealthy_threshold = threshold;
        cfg
    }

    fn controller(cluster: MockClusterApi, cloud: MockCloudProvider, cfg: Config) -> Controller {
        let config = Arc::new(cfg);
        let metrics = Arc::new(Metrics::new().unwrap());
        let alerter = Arc::new(Alerter::new(AlertingConfig::default()));
        let store = Arc::new(NodeStateStore::new());
        let evaluator =
            Arc::new(HealthEvaluator::from_config(&config.health_checks).unwrap());
        let cluster: Arc<dyn ClusterApi> = Arc::new(cluster);
        let drainer = Arc::new(Drainer::new(cluster, &config.controller));
        let cloud: Arc<dyn CloudProvider> = Arc::new(cloud);
        let autoscaler = Arc::new(Autoscaler::new(
            cloud.clone(),
            alerter.clone(),
            metrics.clone(),
            config.autoscaling.clone(),
        ));

        Controller::new(ControllerOptions {
            evaluator,
            drainer,
            autoscaler,
            alerter,
            metrics,
            store,
            cloud,
            config,
            shutdown: CancellationToken::new(),
        })
    }

    /// Poll until the predicate holds or a generous paused-clock allowance runs out
    async fn wait_until(mut predicate: impl FnMut() -> bool) {
        for _ in 0..200 {
            if predicate() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn steady_healthy_cluster_stays_untouched() {
        // Mocks have no expectations: any cluster or cloud call panics.
        let ctrl = controller(
            MockClusterApi::new(),
            MockCloudProvider::new(),
            test_config(&["node-condition"], 3),
        );
        let nodes = vec![ready_node("a"), ready_node("b"), ready_node("c")];

        for _ in 0..5 {
            ctrl.reconcile(&nodes).await;
        }

        let rendered = ctrl.metrics.render();
        assert!(rendered.contains("node_lifecycle_node_count 3"));
        for name in ["a", "b", "c"] {
            assert!(rendered.contains(&format!("node_lifecycle_health_status{{node=\"{name}\"}} 1")));
        }
        assert!(!rendered.contains("node_lifecycle_cordon_total{"));
        assert!(!rendered.contains("node_lifecycle_drain_total{"));
        assert!(!rendered.contains("node_lifecycle_scale_total{"));
    }

    #[tokio::test]
    async fn flapping_node_never_reaches_remediation() {
        let ctrl = controller(
            MockClusterApi::new(),
            MockCloudProvider::new(),
            test_config(&["node-condition"], 3),
        );

        for status in ["True", "False", "True", "False", "True"] {
            ctrl.reconcile(&[node_with("a", "Ready", status)]).await;
        }

        let state = ctrl.store.get("a").unwrap();
        assert!(state.healthy);
        assert_eq!(state.unhealthy_count, 0);
        assert!(!state.drain_in_progress);
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_disk_pressure_is_remediated_once() {
        let mut cluster = MockClusterApi::new();
        cluster
            .expect_get_node()
            .times(1)
            .returning(|_| Ok(uncordoned(ready_node("b"))));
        cluster
            .expect_set_unschedulable()
            .withf(|name, value| name == "b" && *value)
            .times(1)
            .returning(|_, _| Ok(()));
        cluster.expect_pods_on_node().returning(|_| Ok(vec![]));

        let ctrl = controller(
            cluster,
            MockCloudProvider::new(),
            test_config(&["disk-pressure"], 3),
        );
        let node = node_with("b", "DiskPressure", "True");

        for _ in 0..3 {
            ctrl.reconcile(&[node.clone()]).await;
        }

        let metrics = ctrl.metrics.clone();
        wait_until(move || {
            metrics
                .render()
                .contains("node_lifecycle_drain_total{node=\"b\",result=\"success\"} 1")
        })
        .await;

        // The remediation released its lease.
        let store = ctrl.store.clone();
        wait_until(move || !store.get("b").unwrap().drain_in_progress).await;

        let rendered = ctrl.metrics.render();
        assert!(rendered.contains("node_lifecycle_cordon_total{node=\"b\",result=\"success\"} 1"));
        assert_eq!(ctrl.store.get("b").unwrap().unhealthy_count, 3);
    }

    #[tokio::test]
    async fn hysteresis_requires_consecutive_failures() {
        // Two unhealthy ticks, a healthy one, then two more unhealthy:
        // the streak never reaches three, so no remediation starts.
        let ctrl = controller(
            MockClusterApi::new(),
            MockCloudProvider::new(),
            test_config(&["disk-pressure"], 3),
        );

        let pressured = node_with("b", "DiskPressure", "True");
        let calm = ready_node("b");
        for node in [&pressured, &pressured, &calm, &pressured, &pressured] {
            ctrl.reconcile(std::slice::from_ref(node)).await;
        }

        let state = ctrl.store.get("b").unwrap();
        assert_eq!(state.unhealthy_count, 2);
        assert!(!state.drain_in_progress);
    }

    #[tokio::test]
    async fn owned_nodes_are_not_redispatched() {
        // While a drain owns the node, further unhealthy ticks keep
        // counting but never start a second remediation.
        let ctrl = controller(
            MockClusterApi::new(),
            MockCloudProvider::new(),
            test_config(&["disk-pressure"], 3),
        );
        ctrl.store.set_drain_in_progress("b", true);

        let node = node_with("b", "DiskPressure", "True");
        for _ in 0..5 {
            ctrl.reconcile(&[node.clone()]).await;
        }

        assert_eq!(ctrl.store.get("b").unwrap().unhealthy_count, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn budget_blocked_drain_leaves_node_cordoned() {
        let mut cluster = MockClusterApi::new();
        cluster
            .expect_get_node()
            .returning(|_| Ok(uncordoned(ready_node("c"))));
        cluster
            .expect_set_unschedulable()
            .withf(|name, value| name == "c" && *value)
            .times(1)
            .returning(|_, _| Ok(()));
        cluster
            .expect_pods_on_node()
            .returning(|_| Ok(vec![running_pod("p")]));
        cluster
            .expect_evict_pod()
            .returning(|_, _, _| Err(too_many_requests()));

        let ctrl = controller(
            cluster,
            MockCloudProvider::new(),
            test_config(&["disk-pressure"], 3),
        );
        let node = node_with("c", "DiskPressure", "True");

        ctrl.remediate(&node, &["disk-pressure: DiskPressure observed".to_string()])
            .await;

        let rendered = ctrl.metrics.render();
        assert!(rendered.contains("node_lifecycle_cordon_total{node=\"c\",result=\"success\"} 1"));
        assert!(rendered.contains("node_lifecycle_drain_total{node=\"c\",result=\"failure\"} 1"));
    }

    #[tokio::test(start_paused = true)]
    async fn cordon_failure_aborts_before_drain() {
        let mut cluster = MockClusterApi::new();
        cluster.expect_get_node().returning(|_| {
            Err(Error::Kube(kube::Error::Api(ErrorResponse {
                status: "Failure".to_string(),
                message: "server unavailable".to_string(),
                reason: "ServiceUnavailable".to_string(),
                code: 503,
            })))
        });
        // No pods_on_node expectation: reaching the drain would panic.

        let ctrl = controller(
            cluster,
            MockCloudProvider::new(),
            test_config(&["disk-pressure"], 3),
        );

        ctrl.remediate(&node_with("b", "DiskPressure", "True"), &[]).await;

        let rendered = ctrl.metrics.render();
        assert!(rendered.contains("node_lifecycle_cordon_total{node=\"b\",result=\"failure\"} 1"));
        assert!(!rendered.contains("node_lifecycle_drain_total{"));
    }

    #[tokio::test(start_paused = true)]
    async fn drain_concurrency_is_bounded() {
        let mut cluster = MockClusterApi::new();
        // The single permitted drain hangs on a pod that never leaves.
        cluster
            .expect_get_node()
            .times(1)
            .returning(|_| Ok(uncordoned(ready_node("a"))));
        cluster
            .expect_set_unschedulable()
            .times(1)
            .returning(|_, _| Ok(()));
        cluster
            .expect_pods_on_node()
            .returning(|_| Ok(vec![running_pod("p")]));
        cluster.expect_evict_pod().returning(|_, _, _| Ok(()));

        let mut cfg = test_config(&["disk-pressure"], 3);
        cfg.controller.max_concurrent_drains = 1;
        cfg.controller.drain_timeout = Duration::from_secs(3600);
        let ctrl = controller(cluster, MockCloudProvider::new(), cfg);

        let nodes = vec![
            node_with("a", "DiskPressure", "True"),
            node_with("b", "DiskPressure", "True"),
        ];
        for _ in 0..3 {
            ctrl.reconcile(&nodes).await;
        }

        // The first node owns the only drain slot; the second waits.
        assert!(ctrl.store.get("a").unwrap().drain_in_progress);
        assert!(!ctrl.store.get("b").unwrap().drain_in_progress);
    }

    #[tokio::test(start_paused = true)]
    async fn replacement_is_requested_for_pooled_nodes() {
        let mut cluster = MockClusterApi::new();
        cluster
            .expect_get_node()
            .returning(|_| Ok(uncordoned(ready_node("b"))));
        cluster
            .expect_set_unschedulable()
            .returning(|_, _| Ok(()));
        cluster.expect_pods_on_node().returning(|_| Ok(vec![]));

        let mut cloud = MockCloudProvider::new();
        cloud
            .expect_delete_node()
            .withf(|pool, node| pool == "workers" && node == "b")
            .times(1)
            .returning(|_, _| Ok(()));

        let mut cfg = test_config(&["disk-pressure"], 3);
        cfg.autoscaling.enabled = true;
        cfg.autoscaling.node_pools = vec!["workers".to_string()];
        let ctrl = controller(cluster, cloud, cfg);

        let node = labeled(node_with("b", "DiskPressure", "True"), NODE_POOL_LABEL, "workers");
        ctrl.remediate(&node, &[]).await;
    }

    #[tokio::test(start_paused = true)]
    async fn replacement_skipped_without_pool_label() {
        let mut cluster = MockClusterApi::new();
        cluster
            .expect_get_node()
            .returning(|_| Ok(uncordoned(ready_node("b"))));
        cluster
            .expect_set_unschedulable()
            .returning(|_, _| Ok(()));
        cluster.expect_pods_on_node().returning(|_| Ok(vec![]));

        // delete_node has no expectation; a call would panic the mock.
        let mut cfg = test_config(&["disk-pressure"], 3);
        cfg.autoscaling.enabled = true;
        cfg.autoscaling.node_pools = vec!["workers".to_string()];
        let ctrl = controller(cluster, MockCloudProvider::new(), cfg);

        ctrl.remediate(&node_with("b", "DiskPressure", "True"), &[]).await;
    }

    #[test]
    fn pool_label_fallback_is_honoured() {
        let primary = labeled(ready_node("a"), NODE_POOL_LABEL, "workers");
        assert_eq!(node_pool(&primary), Some("workers".to_string()));

        let fallback = labeled(ready_node("a"), NODE_POOL_LABEL_FALLBACK, "agents");
        assert_eq!(node_pool(&fallback), Some("agents".to_string()));

        assert_eq!(node_pool(&ready_node("a")), None);
    }
}
