//! Warden - Kubernetes node lifecycle controller
//!
//! Warden keeps the nodes of a managed cluster in a healthy, right-sized
//! state. A periodic reconciliation loop evaluates every node against a
//! configurable set of health checks, drives persistently unhealthy nodes
//! through a cordon/drain/replace sequence, and (when enabled) resizes the
//! node pool in response to cluster-wide utilisation reported by the cloud
//! provider.
//!
//! # Architecture
//!
//! - A node watcher maintains a cached view of the cluster's nodes and
//!   keeps the in-memory state store in sync with node deletions
//! - The reconciler ticks every `reconcileInterval`, evaluates each node,
//!   and dispatches remediation tasks for nodes past the unhealthy
//!   threshold
//! - Remediation runs on its own tasks, bounded by `maxConcurrentDrains`,
//!   so a slow drain never delays subsequent ticks
//!
//! # Modules
//!
//! - [`alerting`] - Slack and webhook alert egress
//! - [`autoscale`] - Cooldown- and bound-aware scale decisions
//! - [`cloud`] - Cloud provider abstraction (agent pools, cluster metrics)
//! - [`cluster`] - Kubernetes API access behind a mockable seam
//! - [`config`] - YAML configuration with defaults and validation
//! - [`controller`] - Reconciliation loop and remediation dispatch
//! - [`drain`] - Cordon / eviction / termination-wait protocol
//! - [`error`] - Error types for the controller
//! - [`health`] - Per-node health checks and aggregation
//! - [`metrics`] - Prometheus metrics and the exposition endpoint
//! - [`state`] - In-memory per-node state store

#![deny(missing_docs)]

pub mod alerting;
pub mod autoscale;
pub mod cloud;
pub mod cluster;
pub mod config;
pub mod controller;
pub mod drain;
pub mod error;
pub mod health;
pub mod metrics;
pub mod state;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Node label identifying the pool a node belongs to
pub const NODE_POOL_LABEL: &str = "agentpool";

/// Fallback node pool label set by AKS on newer clusters
pub const NODE_POOL_LABEL_FALLBACK: &str = "kubernetes.azure.com/agentpool";
