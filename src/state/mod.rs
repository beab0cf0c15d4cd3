//! In-memory per-node state store
//!
//! The store is the authority for remediation hysteresis: it tracks how
//! many consecutive evaluations reported a node unhealthy and whether a
//! drain is currently running for it. State is rebuilt from scratch on
//! restart; nothing here is persisted.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::health::CheckResult;

/// Tracked state for one node
#[derive(Debug, Clone, Default)]
pub struct NodeState {
    /// Result of the last evaluation
    pub healthy: bool,
    /// Consecutive unhealthy evaluations; reset to zero by any healthy one
    pub unhealthy_count: u32,
    /// When the node was last evaluated
    pub last_check: Option<DateTime<Utc>>,
    /// Failure reasons from the last evaluation, empty when healthy
    pub reasons: Vec<String>,
    /// Mirror of the node's unschedulable flag
    pub cordoned: bool,
    /// True while a remediation sequence owns this node
    pub drain_in_progress: bool,
}

/// Snapshot of the fields the reconciler needs to decide on remediation
#[derive(Debug, Clone, Copy)]
pub struct Observation {
    /// Whether the evaluation that produced this observation was healthy
    pub healthy: bool,
    /// Consecutive unhealthy count after the evaluation
    pub unhealthy_count: u32,
    /// Whether a remediation already owns the node
    pub drain_in_progress: bool,
}

/// Thread-safe mapping from node name to [`NodeState`]
///
/// Entries are created lazily on first observation and removed when the
/// watcher reports a node deletion.
#[derive(Debug, Default)]
pub struct NodeStateStore {
    states: RwLock<HashMap<String, NodeState>>,
}

impl NodeStateStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold an evaluation result into the node's state
    ///
    /// Creates the entry if this is the first observation of the node.
    /// Returns the post-update fields the caller needs for dispatch.
    pub fn observe(&self, name: &str, cordoned: bool, result: &CheckResult) -> Observation {
        let mut states = self.states.write();
        let state = states.entry(name.to_string()).or_default();

        state.last_check = Some(Utc::now());
        state.healthy = result.healthy;
        state.reasons = result.reasons.clone();
        state.cordoned = cordoned;

        if result.healthy {
            state.unhealthy_count = 0;
        } else {
            state.unhealthy_count += 1;
        }

        Observation {
            healthy: state.healthy,
            unhealthy_count: state.unhealthy_count,
            drain_in_progress: state.drain_in_progress,
        }
    }

    /// Set the drain-in-progress flag, returning the prior value
    ///
    /// The flag gives per-node mutual exclusion: a caller that flips it
    /// from false to true owns the node's remediation until it flips it
    /// back. Taking the flag creates the entry if needed; clearing it
    /// never does, so a node deleted mid-drain stays deleted.
    pub fn set_drain_in_progress(&self, name: &str, value: bool) -> bool {
        let mut states = self.states.write();
        if value {
            let state = states.entry(name.to_string()).or_default();
            std::mem::replace(&mut state.drain_in_progress, true)
        } else {
            states
                .get_mut(name)
                .map(|state| std::mem::replace(&mut state.drain_in_progress, false))
                .unwrap_or(false)
        }
    }

    /// Drop a node's state entirely (the node left the cluster)
    pub fn remove(&self, name: &str) {
        self.states.write().remove(name);
    }

    /// Current state for one node, if observed
    pub fn get(&self, name: &str) -> Option<NodeState> {
        self.states.read().get(name).cloned()
    }

    /// Copy of the whole map, for tests and debugging
    pub fn snapshot(&self) -> HashMap<String, NodeState> {
        self.states.read().clone()
    }
}

/// Clears a node's drain-in-progress flag when dropped
///
/// Remediation tasks hold one of these so the flag is released on every
/// exit path, including panics and cancellation.
pub struct DrainLease {
    store: Arc<NodeStateStore>,
    node: String,
}

impl DrainLease {
    /// Take over responsibility for clearing the node's drain flag
    ///
    /// The caller must already have won the flag via
    /// [`NodeStateStore::set_drain_in_progress`].
    pub fn new(store: Arc<NodeStateStore>, node: String) -> Self {
        Self { store, node }
    }
}

impl Drop for DrainLease {
    fn drop(&mut self) {
        self.store.set_drain_in_progress(&self.node, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn healthy() -> CheckResult {
        CheckResult {
            healthy: true,
            reasons: Vec::new(),
        }
    }

    fn unhealthy(reason: &str) -> CheckResult {
        CheckResult {
            healthy: false,
            reasons: vec![reason.to_string()],
        }
    }

    #[test]
    fn creates_entries_lazily() {
        let store = NodeStateStore::new();
        assert!(store.get("node-a").is_none());

        store.observe("node-a", false, &healthy());
        let state = store.get("node-a").unwrap();
        assert!(state.healthy);
        assert_eq!(state.unhealthy_count, 0);
        assert!(state.last_check.is_some());
    }

    #[test]
    fn unhealthy_count_accumulates_and_resets() {
        let store = NodeStateStore::new();

        for expected in 1..=3 {
            let obs = store.observe("node-a", false, &unhealthy("disk-pressure: full"));
            assert_eq!(obs.unhealthy_count, expected);
        }

        // Invariant: any healthy evaluation resets the streak.
        let obs = store.observe("node-a", false, &healthy());
        assert!(obs.healthy);
        assert_eq!(obs.unhealthy_count, 0);
        assert!(store.get("node-a").unwrap().reasons.is_empty());
    }

    #[test]
    fn drain_flag_returns_prior_value() {
        let store = NodeStateStore::new();
        store.observe("node-a", false, &healthy());

        assert!(!store.set_drain_in_progress("node-a", true));
        assert!(store.set_drain_in_progress("node-a", true));
        assert!(store.set_drain_in_progress("node-a", false));
        assert!(!store.get("node-a").unwrap().drain_in_progress);
    }

    #[test]
    fn drain_flag_survives_observations() {
        let store = NodeStateStore::new();
        store.set_drain_in_progress("node-a", true);

        let obs = store.observe("node-a", true, &unhealthy("kubelet: unreachable"));
        assert!(obs.drain_in_progress);
        assert_eq!(obs.unhealthy_count, 1);
    }

    #[test]
    fn clearing_the_flag_does_not_resurrect_deleted_nodes() {
        let store = NodeStateStore::new();
        store.set_drain_in_progress("node-a", true);
        store.remove("node-a");

        assert!(!store.set_drain_in_progress("node-a", false));
        assert!(store.get("node-a").is_none());
    }

    #[test]
    fn remove_drops_state() {
        let store = NodeStateStore::new();
        store.observe("node-a", false, &healthy());
        store.observe("node-b", false, &healthy());

        store.remove("node-a");
        assert!(store.get("node-a").is_none());
        assert_eq!(store.snapshot().len(), 1);
    }

    #[test]
    fn lease_clears_flag_on_drop() {
        let store = Arc::new(NodeStateStore::new());
        store.set_drain_in_progress("node-a", true);

        {
            let _lease = DrainLease::new(store.clone(), "node-a".to_string());
            assert!(store.get("node-a").unwrap().drain_in_progress);
        }
        assert!(!store.get("node-a").unwrap().drain_in_progress);
    }

    #[test]
    fn lease_clears_flag_on_panic() {
        let store = Arc::new(NodeStateStore::new());
        store.set_drain_in_progress("node-a", true);

        let cloned = store.clone();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _lease = DrainLease::new(cloned, "node-a".to_string());
            panic!("remediation blew up");
        }));

        assert!(result.is_err());
        assert!(!store.get("node-a").unwrap().drain_in_progress);
    }
}
