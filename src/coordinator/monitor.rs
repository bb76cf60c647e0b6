//! Periodic liveness report
//!
//! Liveness itself is computed on demand; this task only notices when a
//! node's derived state changes, logs it and keeps the node gauges fresh.

use crate::common::{NodeId, NodeState};
use crate::coordinator::service::Coordinator;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use tokio::task::JoinHandle;

/// A node whose state differs from the previous evaluation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub node_id: NodeId,
    /// `None` the first time a node is seen
    pub from: Option<NodeState>,
    pub to: NodeState,
}

pub struct LivenessMonitor {
    coordinator: Coordinator,
    last: Mutex<HashMap<NodeId, NodeState>>,
}

impl LivenessMonitor {
    pub fn new(coordinator: Coordinator) -> Self {
        Self {
            coordinator,
            last: Mutex::new(HashMap::new()),
        }
    }

    /// Compare every node's current state with the last evaluation.
    pub fn evaluate(&self) -> Vec<Transition> {
        let placement = self.coordinator.placement();
        let now = placement.clock().now();
        let statuses = placement.liveness().statuses(now);

        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        let mut transitions = Vec::new();
        let mut live = 0u64;

        for status in &statuses {
            if status.state.is_live() {
                live += 1;
            }
            let previous = last.insert(status.node_id.clone(), status.state);
            if previous == Some(status.state) {
                continue;
            }

            match (previous, status.state) {
                (None, state) => {
                    tracing::info!(node = %status.node_id, %state, "tracking node")
                }
                (Some(from), NodeState::Live) => {
                    tracing::info!(node = %status.node_id, %from, "node recovered")
                }
                (Some(from), NodeState::Suspect) => {
                    tracing::warn!(node = %status.node_id, %from, "node missed its heartbeat deadline")
                }
                (Some(from), NodeState::Dead) => {
                    tracing::warn!(node = %status.node_id, %from, "node is dead")
                }
            }
            transitions.push(Transition {
                node_id: status.node_id.clone(),
                from: previous,
                to: status.state,
            });
        }

        // Decommissioned nodes disappear from the tracker
        last.retain(|node, _| statuses.iter().any(|s| &s.node_id == node));

        let metrics = self.coordinator.metrics();
        metrics.live_nodes.set(live);
        metrics.ring_nodes.set(placement.ring_nodes().len() as u64);

        transitions
    }

    /// Evaluate every `monitor_interval` until the task is aborted.
    pub fn start(self) -> JoinHandle<()> {
        let period = self.coordinator.config().monitor_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.evaluate();
            }
        })
    }
}
