//! Per-node state tracking with fence delay.
//!
//! The tracker turns the raw membership view and the LRM modes into the
//! [`NodeState`] machine the CRM acts on. A node must be continuously
//! non-online for the fence delay before fencing is authorised, and a gone
//! node's entry is kept for a grace period so a late rejoin is recognised.

use crate::types::{LrmMode, NodeInfo, NodeState};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::info;

/// Tracks the state machine of every known node.
pub struct NodeStatusTracker {
    status: BTreeMap<String, NodeState>,
    /// Last time each node was observed online (or first observed at all).
    last_online: HashMap<String, u64>,
    fence_delay: u64,
    gone_expiry: u64,
}

impl NodeStatusTracker {
    /// Rebuild the tracker from a persisted node status map. `last_online`
    /// starts fresh, so the fence delay is measured from the current
    /// master session.
    pub fn new(
        status: BTreeMap<String, NodeState>,
        now: u64,
        fence_delay: u64,
        gone_expiry: u64,
    ) -> Self {
        let last_online = status.keys().map(|n| (n.clone(), now)).collect();
        Self {
            status,
            last_online,
            fence_delay,
            gone_expiry,
        }
    }

    /// Feed one tick of membership and LRM mode observations.
    pub fn update(
        &mut self,
        membership: &BTreeMap<String, NodeInfo>,
        lrm_modes: &HashMap<String, LrmMode>,
        now: u64,
    ) {
        let mut known: BTreeSet<String> = self.status.keys().cloned().collect();
        known.extend(membership.keys().cloned());

        for node in known {
            let info = membership.get(&node);
            let online = info.map(|i| i.online).unwrap_or(false);
            let deleted = info.is_none();
            let maintenance = lrm_modes.get(&node) == Some(&LrmMode::Maintenance);

            if online {
                self.last_online.insert(node.clone(), now);
            } else {
                self.last_online.entry(node.clone()).or_insert(now);
            }

            let current = *self.status.entry(node.clone()).or_insert(NodeState::Unknown);
            let next = match current {
                NodeState::Online => {
                    if deleted || !online {
                        NodeState::Unknown
                    } else if maintenance {
                        NodeState::Maintenance
                    } else {
                        NodeState::Online
                    }
                }
                NodeState::Maintenance => {
                    if deleted || !online {
                        NodeState::Unknown
                    } else if !maintenance {
                        NodeState::Online
                    } else {
                        NodeState::Maintenance
                    }
                }
                NodeState::Unknown => {
                    if online {
                        NodeState::Online
                    } else if deleted {
                        NodeState::Gone
                    } else {
                        NodeState::Unknown
                    }
                }
                // Fencing progress is driven by the manager, not by
                // membership observations.
                NodeState::Fence => NodeState::Fence,
                NodeState::Gone => {
                    if online {
                        NodeState::Online
                    } else {
                        NodeState::Gone
                    }
                }
            };

            if next != current {
                info!(node = %node, from = %current, to = %next, "Node status change");
                self.status.insert(node.clone(), next);
            }

            if next == NodeState::Gone && self.offline_for(&node, now) >= self.gone_expiry {
                info!(node = %node, "Dropping long-gone node");
                self.status.remove(&node);
                self.last_online.remove(&node);
            }
        }
    }

    fn offline_for(&self, node: &str, now: u64) -> u64 {
        match self.last_online.get(node) {
            Some(&t) => now.saturating_sub(t),
            None => 0,
        }
    }

    /// True once the node has been continuously non-online for the fence
    /// delay.
    pub fn node_is_offline_delayed(&self, node: &str, now: u64) -> bool {
        !matches!(
            self.get(node),
            NodeState::Online | NodeState::Maintenance
        ) && self.offline_for(node, now) >= self.fence_delay
    }

    pub fn get(&self, node: &str) -> NodeState {
        self.status.get(node).copied().unwrap_or(NodeState::Unknown)
    }

    /// Authorise fencing of an unresponsive node.
    pub fn start_fence(&mut self, node: &str) {
        let current = self.get(node);
        if matches!(current, NodeState::Unknown | NodeState::Gone) {
            info!(node = %node, from = %current, "Node status change to fence");
            self.status.insert(node.to_string(), NodeState::Fence);
        }
    }

    /// Record a completed fence; recovery may proceed.
    pub fn finish_fence(&mut self, node: &str) {
        if self.get(node) == NodeState::Fence {
            info!(node = %node, "Node fenced, status back to unknown");
            self.status.insert(node.to_string(), NodeState::Unknown);
        }
    }

    /// Nodes currently online (excludes maintenance).
    pub fn online_nodes(&self) -> BTreeSet<String> {
        self.status
            .iter()
            .filter(|(_, s)| **s == NodeState::Online)
            .map(|(n, _)| n.clone())
            .collect()
    }

    /// Snapshot for the manager status document.
    pub fn status_map(&self) -> &BTreeMap<String, NodeState> {
        &self.status
    }
}
