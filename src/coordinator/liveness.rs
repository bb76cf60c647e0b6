//! Heartbeat-based liveness tracking
//!
//! Only the last heartbeat instant is stored per node. A node's state is
//! recomputed from `(last_heartbeat, now, timeout)` on every query:
//!
//! - `Live`: elapsed < timeout
//! - `Suspect`: timeout <= elapsed < 2 * timeout
//! - `Dead`: otherwise
//!
//! Only `Live` nodes are eligible for placement and reads. A node becomes
//! live again on its next heartbeat, there is no rejoin handshake.

use crate::common::{NodeId, NodeState};
use std::collections::{BTreeSet, HashMap};
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};

/// Default heartbeat timeout
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(10);

/// What a node told us in its last heartbeat
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeReport {
    pub address: Option<String>,
    pub capacity_bytes: u64,
    pub used_bytes: u64,
    pub chunk_count: u64,
}

/// Point-in-time view of one node
#[derive(Debug, Clone)]
pub struct NodeStatus {
    pub node_id: NodeId,
    pub last_heartbeat_at: Instant,
    pub state: NodeState,
    pub report: NodeReport,
}

#[derive(Debug)]
struct Entry {
    last_heartbeat: Instant,
    report: NodeReport,
}

/// Tracks last-seen instants per node; shared behind an `Arc`.
#[derive(Debug)]
pub struct LivenessTracker {
    timeout: Duration,
    nodes: RwLock<HashMap<NodeId, Entry>>,
}

impl LivenessTracker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            nodes: RwLock::new(HashMap::new()),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Record a heartbeat. Returns true if the node was unknown or not live
    /// just before it.
    pub fn heartbeat(&self, node: &str, now: Instant) -> bool {
        self.heartbeat_with(node, NodeReport::default(), now)
    }

    /// Record a heartbeat carrying a usage report.
    pub fn heartbeat_with(&self, node: &str, report: NodeReport, now: Instant) -> bool {
        let mut nodes = self.nodes.write().unwrap_or_else(PoisonError::into_inner);
        match nodes.get_mut(node) {
            Some(entry) => {
                let was_live = self.classify(entry.last_heartbeat, now).is_live();
                // Out-of-order heartbeats never move the timestamp backwards
                entry.last_heartbeat = entry.last_heartbeat.max(now);
                entry.report = report;
                !was_live
            }
            None => {
                nodes.insert(
                    node.to_string(),
                    Entry {
                        last_heartbeat: now,
                        report,
                    },
                );
                true
            }
        }
    }

    /// State implied by a heartbeat at `last` when observed at `now`
    pub fn classify(&self, last: Instant, now: Instant) -> NodeState {
        let elapsed = now.saturating_duration_since(last);
        if elapsed < self.timeout {
            NodeState::Live
        } else if elapsed < self.timeout * 2 {
            NodeState::Suspect
        } else {
            NodeState::Dead
        }
    }

    pub fn is_live(&self, node: &str, now: Instant) -> bool {
        let nodes = self.nodes.read().unwrap_or_else(PoisonError::into_inner);
        nodes
            .get(node)
            .map(|entry| self.classify(entry.last_heartbeat, now).is_live())
            .unwrap_or(false)
    }

    pub fn status(&self, node: &str, now: Instant) -> Option<NodeStatus> {
        let nodes = self.nodes.read().unwrap_or_else(PoisonError::into_inner);
        nodes.get(node).map(|entry| self.to_status(node, entry, now))
    }

    /// Every known node, sorted by id
    pub fn statuses(&self, now: Instant) -> Vec<NodeStatus> {
        let nodes = self.nodes.read().unwrap_or_else(PoisonError::into_inner);
        let mut statuses: Vec<NodeStatus> = nodes
            .iter()
            .map(|(id, entry)| self.to_status(id, entry, now))
            .collect();
        statuses.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        statuses
    }

    pub fn snapshot_live(&self, now: Instant) -> BTreeSet<NodeId> {
        let nodes = self.nodes.read().unwrap_or_else(PoisonError::into_inner);
        nodes
            .iter()
            .filter(|(_, entry)| self.classify(entry.last_heartbeat, now).is_live())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Drop all knowledge of a node (decommission).
    pub fn forget(&self, node: &str) -> bool {
        let mut nodes = self.nodes.write().unwrap_or_else(PoisonError::into_inner);
        nodes.remove(node).is_some()
    }

    fn to_status(&self, node: &str, entry: &Entry, now: Instant) -> NodeStatus {
        NodeStatus {
            node_id: node.to_string(),
            last_heartbeat_at: entry.last_heartbeat,
            state: self.classify(entry.last_heartbeat, now),
            report: entry.report.clone(),
        }
    }
}

impl Default for LivenessTracker {
    fn default() -> Self {
        Self::new(DEFAULT_HEARTBEAT_TIMEOUT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(10);

    #[test]
    fn test_unknown_node_is_not_live() {
        let tracker = LivenessTracker::new(TIMEOUT);
        assert!(!tracker.is_live("ghost", Instant::now()));
        assert!(tracker.status("ghost", Instant::now()).is_none());
    }

    #[test]
    fn test_state_follows_elapsed_time() {
        let tracker = LivenessTracker::new(TIMEOUT);
        let t0 = Instant::now();
        assert!(tracker.heartbeat("n1", t0));

        assert!(tracker.is_live("n1", t0 + Duration::from_secs(9)));

        let suspect = tracker.status("n1", t0 + TIMEOUT).unwrap();
        assert_eq!(suspect.state, NodeState::Suspect);
        assert!(!tracker.is_live("n1", t0 + TIMEOUT));

        let dead = tracker.status("n1", t0 + TIMEOUT * 2).unwrap();
        assert_eq!(dead.state, NodeState::Dead);
    }

    #[test]
    fn test_heartbeat_reinstates_immediately() {
        let tracker = LivenessTracker::new(TIMEOUT);
        let t0 = Instant::now();
        tracker.heartbeat("n1", t0);

        let later = t0 + Duration::from_secs(60);
        assert!(!tracker.is_live("n1", later));

        // Rejoin is reported, and the node is live at that very instant
        assert!(tracker.heartbeat("n1", later));
        assert!(tracker.is_live("n1", later));

        // A heartbeat from a node that is already live is not a rejoin
        assert!(!tracker.heartbeat("n1", later + Duration::from_secs(1)));
    }

    #[test]
    fn test_stale_heartbeat_does_not_rewind() {
        let tracker = LivenessTracker::new(TIMEOUT);
        let t0 = Instant::now();
        tracker.heartbeat("n1", t0 + Duration::from_secs(20));
        tracker.heartbeat("n1", t0);

        let status = tracker.status("n1", t0 + Duration::from_secs(25)).unwrap();
        assert_eq!(status.state, NodeState::Live);
    }

    #[test]
    fn test_snapshot_live() {
        let tracker = LivenessTracker::new(TIMEOUT);
        let t0 = Instant::now();
        tracker.heartbeat("a", t0);
        tracker.heartbeat("b", t0 + Duration::from_secs(8));

        let live = tracker.snapshot_live(t0 + Duration::from_secs(12));
        assert_eq!(live.into_iter().collect::<Vec<_>>(), vec!["b".to_string()]);
    }

    #[test]
    fn test_report_is_kept() {
        let tracker = LivenessTracker::new(TIMEOUT);
        let now = Instant::now();
        tracker.heartbeat_with(
            "n1",
            NodeReport {
                address: Some("http://10.0.0.1:6000".into()),
                capacity_bytes: 1 << 30,
                used_bytes: 512,
                chunk_count: 2,
            },
            now,
        );

        let status = tracker.status("n1", now).unwrap();
        assert_eq!(status.report.used_bytes, 512);
        assert_eq!(status.report.address.as_deref(), Some("http://10.0.0.1:6000"));
    }

    #[test]
    fn test_forget() {
        let tracker = LivenessTracker::new(TIMEOUT);
        let now = Instant::now();
        tracker.heartbeat("n1", now);
        assert!(tracker.forget("n1"));
        assert!(!tracker.forget("n1"));
        assert!(!tracker.is_live("n1", now));
    }
}
