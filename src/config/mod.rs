//! Configuration loading and validation
//!
//! Configuration is a single YAML document with sections for the cloud
//! provider, health checks, alerting, the controller loop, and autoscaling.
//! Every field has a default, and a missing file is not an error: the
//! controller starts with built-in defaults so it can run in clusters that
//! mount no config at all.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tracing::info;

use crate::Error;

mod duration;

pub use duration::parse_duration;

/// Top-level configuration document
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct Config {
    /// Cloud provider credentials and cluster identity
    pub azure: AzureConfig,
    /// Health evaluation settings
    pub health_checks: HealthCheckConfig,
    /// Alert egress settings
    pub alerting: AlertingConfig,
    /// Reconciliation and drain settings
    pub controller: ControllerConfig,
    /// Autoscaling thresholds, cooldowns, and bounds
    pub autoscaling: AutoscalingConfig,
}

/// Azure credentials and cluster identity
///
/// An empty `subscriptionId` disables the cloud adapter entirely; the
/// controller then runs with health remediation only.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct AzureConfig {
    /// Azure subscription holding the cluster; empty disables Azure
    pub subscription_id: String,
    /// Resource group of the managed cluster
    pub resource_group: String,
    /// Managed cluster name
    pub cluster_name: String,
    /// Authenticate via the instance's managed identity
    pub use_managed_identity: bool,
    /// AAD tenant for client-secret authentication
    pub tenant_id: String,
    /// AAD application id for client-secret authentication
    pub client_id: String,
    /// AAD client secret; empty selects managed identity
    pub client_secret: String,
}

impl AzureConfig {
    /// True when a subscription is configured and the adapter should be built
    pub fn enabled(&self) -> bool {
        !self.subscription_id.is_empty()
    }
}

/// Health evaluation settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct HealthCheckConfig {
    /// Evaluation interval; the reconcile interval governs cadence today,
    /// this field is accepted for compatibility
    #[serde(deserialize_with = "duration::deserialize")]
    pub interval: Duration,
    /// Consecutive unhealthy evaluations before remediation starts
    pub unhealthy_threshold: u32,
    /// Names of the checks to run, in order
    pub checks: Vec<String>,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            unhealthy_threshold: 3,
            checks: vec![
                "node-condition".to_string(),
                "kubelet".to_string(),
                "disk-pressure".to_string(),
            ],
        }
    }
}

/// Alert egress settings
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct AlertingConfig {
    /// Master switch; when false all alerts are dropped
    pub enabled: bool,
    /// Slack incoming-webhook URL, empty to skip Slack
    #[serde(rename = "slackWebhookUrl")]
    pub slack_url: String,
    /// Channel override for the Slack message
    pub slack_channel: String,
    /// Generic webhook URLs receiving the JSON alert document
    pub webhook_urls: Vec<String>,
}

/// Reconciliation and drain settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct ControllerConfig {
    /// Interval between reconciliation ticks
    #[serde(deserialize_with = "duration::deserialize")]
    pub reconcile_interval: Duration,
    /// Total deadline for one node drain
    #[serde(deserialize_with = "duration::deserialize")]
    pub drain_timeout: Duration,
    /// Grace period passed to each pod eviction
    #[serde(deserialize_with = "duration::deserialize")]
    pub drain_grace_period: Duration,
    /// Skip pods owned by a DaemonSet when draining
    pub ignore_daemon_sets: bool,
    /// Evict pods with emptyDir volumes, destroying their local data
    pub delete_local_data: bool,
    /// Cluster-wide bound on concurrent node drains
    pub max_concurrent_drains: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            reconcile_interval: Duration::from_secs(60),
            drain_timeout: Duration::from_secs(5 * 60),
            drain_grace_period: Duration::from_secs(30),
            ignore_daemon_sets: true,
            delete_local_data: false,
            max_concurrent_drains: 1,
        }
    }
}

/// Autoscaling thresholds, cooldowns, and bounds
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct AutoscalingConfig {
    /// Master switch for scale decisions and node replacement
    pub enabled: bool,
    /// Utilisation fraction above which a scale-up is considered
    pub scale_up_threshold: f64,
    /// Utilisation fraction below which a scale-down is considered
    pub scale_down_threshold: f64,
    /// Minimum interval between successful scale-ups
    #[serde(deserialize_with = "duration::deserialize")]
    pub scale_up_cooldown: Duration,
    /// Minimum interval between successful scale-downs
    #[serde(deserialize_with = "duration::deserialize")]
    pub scale_down_cooldown: Duration,
    /// Lower bound on the cluster node count
    pub min_nodes: u32,
    /// Upper bound on the cluster node count
    pub max_nodes: u32,
    /// Node pools eligible for scaling; the first entry is used
    pub node_pools: Vec<String>,
}

impl Default for AutoscalingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            scale_up_threshold: 0.8,
            scale_down_threshold: 0.3,
            scale_up_cooldown: Duration::from_secs(5 * 60),
            scale_down_cooldown: Duration::from_secs(10 * 60),
            min_nodes: 1,
            max_nodes: 10,
            node_pools: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file
    ///
    /// A missing file yields the built-in defaults; a file that exists but
    /// fails to parse or validate is a fatal error.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let data = match std::fs::read_to_string(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "config file not found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(Error::config(format!(
                    "read {}: {}",
                    path.display(),
                    e
                )));
            }
        };

        let cfg: Config = serde_yaml::from_str(&data)
            .map_err(|e| Error::config(format!("parse {}: {}", path.display(), e)))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Check cross-field constraints that serde cannot express
    pub fn validate(&self) -> Result<(), Error> {
        let a = &self.autoscaling;
        if !(a.scale_up_threshold > 0.0 && a.scale_up_threshold <= 1.0) {
            return Err(Error::config(format!(
                "autoscaling.scaleUpThreshold {} must be in (0, 1]",
                a.scale_up_threshold
            )));
        }
        if !(a.scale_down_threshold >= 0.0 && a.scale_down_threshold < 1.0) {
            return Err(Error::config(format!(
                "autoscaling.scaleDownThreshold {} must be in [0, 1)",
                a.scale_down_threshold
            )));
        }
        if a.scale_down_threshold >= a.scale_up_threshold {
            return Err(Error::config(format!(
                "autoscaling.scaleDownThreshold {} must be below scaleUpThreshold {}",
                a.scale_down_threshold, a.scale_up_threshold
            )));
        }
        if a.min_nodes > a.max_nodes {
            return Err(Error::config(format!(
                "autoscaling.minNodes {} exceeds maxNodes {}",
                a.min_nodes, a.max_nodes
            )));
        }
        if a.enabled && a.node_pools.is_empty() {
            return Err(Error::config(
                "autoscaling.nodePools must name at least one pool when autoscaling is enabled",
            ));
        }
        if self.controller.max_concurrent_drains == 0 {
            return Err(Error::config(
                "controller.maxConcurrentDrains must be at least 1",
            ));
        }
        Ok(())
    }
}
