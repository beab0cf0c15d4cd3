//! Per-node health checks and aggregation
//!
//! Each check is a small capability examining a node snapshot read-only
//! and reporting healthy or a failure reason. The evaluator runs the
//! configured checks in order and aggregates their reasons; a node is
//! healthy only when every check passes.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use k8s_openapi::api::core::v1::{Node, NodeCondition};
use tracing::warn;

use crate::config::HealthCheckConfig;
use crate::Error;

mod kubelet;

pub use kubelet::KubeletCheck;

/// Heartbeats older than this mark a Ready node as stale
const HEARTBEAT_MAX_AGE_MINUTES: i64 = 5;

/// Aggregated outcome of one node evaluation
#[derive(Debug, Clone, Default)]
pub struct CheckResult {
    /// True iff every check passed
    pub healthy: bool,
    /// One `"<check>: <reason>"` entry per failing check, in check order
    pub reasons: Vec<String>,
}

/// A single health check over a node snapshot
///
/// Checks must not mutate the cluster; the node is examined read-only.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    /// Stable name used in configuration and failure reasons
    fn name(&self) -> &'static str;

    /// Evaluate the node, returning healthy or a failure reason
    async fn run(&self, node: &Node) -> (bool, String);
}

/// Find a status condition by kind
fn condition<'a>(node: &'a Node, kind: &str) -> Option<&'a NodeCondition> {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|conditions| conditions.iter().find(|c| c.type_ == kind))
}

/// Checks that the `Ready` condition is True with a fresh heartbeat
///
/// A node with no `Ready` condition at all is treated as healthy; the
/// check fails open rather than draining nodes on missing data.
pub struct ReadyCheck;

#[async_trait]
impl HealthCheck for ReadyCheck {
    fn name(&self) -> &'static str {
        "node-condition"
    }

    async fn run(&self, node: &Node) -> (bool, String) {
        let Some(cond) = condition(node, "Ready") else {
            return (true, String::new());
        };

        if cond.status != "True" {
            let message = cond.message.as_deref().unwrap_or("no message");
            return (false, format!("node not ready: {message}"));
        }

        if let Some(heartbeat) = &cond.last_heartbeat_time {
            if Utc::now() - heartbeat.0 > ChronoDuration::minutes(HEARTBEAT_MAX_AGE_MINUTES) {
                return (false, "node heartbeat stale".to_string());
            }
        }

        (true, String::new())
    }
}

/// Checks that a pressure-style condition is not True
///
/// Covers DiskPressure, MemoryPressure, PIDPressure, and
/// NetworkUnavailable; a missing condition is healthy.
pub struct ConditionAbsenceCheck {
    name: &'static str,
    condition: &'static str,
}

impl ConditionAbsenceCheck {
    /// The `disk-pressure` check
    pub fn disk_pressure() -> Self {
        Self {
            name: "disk-pressure",
            condition: "DiskPressure",
        }
    }

    /// The `memory-pressure` check
    pub fn memory_pressure() -> Self {
        Self {
            name: "memory-pressure",
            condition: "MemoryPressure",
        }
    }

    /// The `pid-pressure` check
    pub fn pid_pressure() -> Self {
        Self {
            name: "pid-pressure",
            condition: "PIDPressure",
        }
    }

    /// The `network` check
    pub fn network() -> Self {
        Self {
            name: "network",
            condition: "NetworkUnavailable",
        }
    }
}

#[async_trait]
impl HealthCheck for ConditionAbsenceCheck {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn run(&self, node: &Node) -> (bool, String) {
        match condition(node, self.condition) {
            Some(cond) if cond.status == "True" => {
                let message = cond
                    .message
                    .clone()
                    .unwrap_or_else(|| format!("{} is True", self.condition));
                (false, message)
            }
            _ => (true, String::new()),
        }
    }
}

/// Runs the configured checks and aggregates their outcomes
pub struct HealthEvaluator {
    checks: Vec<Box<dyn HealthCheck>>,
}

impl HealthEvaluator {
    /// Build the evaluator from the configured check names
    ///
    /// Unknown names are logged and skipped; an empty effective list
    /// falls back to the `node-condition` check alone.
    pub fn from_config(cfg: &HealthCheckConfig) -> Result<Self, Error> {
        let mut checks: Vec<Box<dyn HealthCheck>> = Vec::new();

        for name in &cfg.checks {
            match name.as_str() {
                "node-condition" => checks.push(Box::new(ReadyCheck)),
                "kubelet" => checks.push(Box::new(KubeletCheck::new()?)),
                "disk-pressure" => checks.push(Box::new(ConditionAbsenceCheck::disk_pressure())),
                "memory-pressure" => {
                    checks.push(Box::new(ConditionAbsenceCheck::memory_pressure()))
                }
                "pid-pressure" => checks.push(Box::new(ConditionAbsenceCheck::pid_pressure())),
                "network" => checks.push(Box::new(ConditionAbsenceCheck::network())),
                unknown => warn!(check = %unknown, "unknown health check, ignoring"),
            }
        }

        if checks.is_empty() {
            checks.push(Box::new(ReadyCheck));
        }

        Ok(Self { checks })
    }

    /// Evaluate one node against every configured check
    pub async fn evaluate(&self, node: &Node) -> CheckResult {
        let mut result = CheckResult {
            healthy: true,
            reasons: Vec::new(),
        };

        for check in &self.checks {
            let (healthy, reason) = check.run(node).await;
            if !healthy {
                result.healthy = false;
                result.reasons.push(format!("{}: {}", check.name(), reason));
            }
        }

        result
    }

    /// Names of the active checks, in evaluation order
    pub fn check_names(&self) -> Vec<&'static str> {
        self.checks.iter().map(|c| c.name()).collect()
    }
}
