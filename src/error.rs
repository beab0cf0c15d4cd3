//! Error types for the node lifecycle controller

use thiserror::Error;

/// Main error type for controller operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Invalid configuration, fatal at startup
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// A pod eviction was persistently refused by a disruption budget
    #[error("eviction of pod {pod} blocked by disruption budget")]
    EvictionBlocked {
        /// Namespaced identity of the blocked pod
        pod: String,
    },

    /// A pod eviction failed for a reason other than a disruption budget
    #[error("eviction of pod {pod} failed: {source}")]
    EvictionFailed {
        /// Namespaced identity of the pod
        pod: String,
        /// Underlying cluster API error
        #[source]
        source: Box<Error>,
    },

    /// Cloud provider operation error
    #[error("cloud error: {0}")]
    Cloud(String),

    /// A drain did not complete within its deadline
    #[error("drain of node {node} exceeded its deadline")]
    DeadlineExceeded {
        /// Node whose drain timed out
        node: String,
    },

    /// Internal wiring error (watcher setup, metric registration)
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::ConfigInvalid(msg.into())
    }

    /// Create a cloud error with the given message
    pub fn cloud(msg: impl Into<String>) -> Self {
        Self::Cloud(msg.into())
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// True if this wraps a 404 from the cluster API
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(e)) if e.code == 404)
    }

    /// True if this wraps a 429 from the cluster API, which the eviction
    /// endpoint uses to signal a disruption budget refusal
    pub fn is_too_many_requests(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(e)) if e.code == 429)
    }
}
