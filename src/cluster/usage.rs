//! Node usage accounting for the placement scheduler.
//!
//! Usage is recomputed from scratch on every manager pass; nothing here is
//! incremental. Scores are "lower is better".

use crate::config::SchedulerMode;
use crate::types::{NodeStats, ServiceId, ServiceStats};
use std::collections::BTreeMap;

/// Pluggable node-scoring backend.
pub trait NodeUsage: Send + Sync {
    /// Register an online node.
    fn add_node(&mut self, node: &str);

    fn remove_node(&mut self, node: &str);

    fn contains_node(&self, node: &str) -> bool;

    /// Account a service's load to a node. `stats` is the service's static
    /// footprint where the backend uses one.
    fn add_service_usage_to_node(
        &mut self,
        node: &str,
        sid: &ServiceId,
        stats: Option<&ServiceStats>,
    );

    /// Score every registered node for starting `sid` there. Lower is
    /// better; ties are broken by node name at the call site.
    fn score_nodes_to_start_service(
        &self,
        sid: &ServiceId,
        stats: Option<&ServiceStats>,
    ) -> BTreeMap<String, f64>;
}

/// Service-count scoring.
#[derive(Debug, Default)]
pub struct UsageBasic {
    counts: BTreeMap<String, usize>,
}

impl UsageBasic {
    pub fn new() -> Self {
        Self::default()
    }
}

impl NodeUsage for UsageBasic {
    fn add_node(&mut self, node: &str) {
        self.counts.entry(node.to_string()).or_insert(0);
    }

    fn remove_node(&mut self, node: &str) {
        self.counts.remove(node);
    }

    fn contains_node(&self, node: &str) -> bool {
        self.counts.contains_key(node)
    }

    fn add_service_usage_to_node(
        &mut self,
        node: &str,
        _sid: &ServiceId,
        _stats: Option<&ServiceStats>,
    ) {
        *self.counts.entry(node.to_string()).or_insert(0) += 1;
    }

    fn score_nodes_to_start_service(
        &self,
        _sid: &ServiceId,
        _stats: Option<&ServiceStats>,
    ) -> BTreeMap<String, f64> {
        self.counts
            .iter()
            .map(|(node, count)| (node.clone(), *count as f64))
            .collect()
    }
}

#[derive(Debug, Clone, Default)]
struct StaticNode {
    stats: NodeStats,
    cpu: f64,
    mem: u64,
}

impl StaticNode {
    fn score_with(&self, extra: &ServiceStats) -> f64 {
        let cpu_share = if self.stats.cpus > 0.0 {
            (self.cpu + extra.maxcpu) / self.stats.cpus
        } else {
            1.0
        };
        let mem_share = if self.stats.memory > 0 {
            (self.mem + extra.maxmem) as f64 / self.stats.memory as f64
        } else {
            1.0
        };
        cpu_share * cpu_share + mem_share * mem_share
    }
}

/// Resource-aware scoring from static CPU/memory stats.
#[derive(Debug, Default)]
pub struct UsageStatic {
    nodes: BTreeMap<String, StaticNode>,
    node_stats: BTreeMap<String, NodeStats>,
}

impl UsageStatic {
    pub fn new(node_stats: BTreeMap<String, NodeStats>) -> Self {
        Self {
            nodes: BTreeMap::new(),
            node_stats,
        }
    }
}

impl NodeUsage for UsageStatic {
    fn add_node(&mut self, node: &str) {
        let stats = self.node_stats.get(node).copied().unwrap_or_default();
        self.nodes.entry(node.to_string()).or_insert(StaticNode {
            stats,
            cpu: 0.0,
            mem: 0,
        });
    }

    fn remove_node(&mut self, node: &str) {
        self.nodes.remove(node);
    }

    fn contains_node(&self, node: &str) -> bool {
        self.nodes.contains_key(node)
    }

    fn add_service_usage_to_node(
        &mut self,
        node: &str,
        _sid: &ServiceId,
        stats: Option<&ServiceStats>,
    ) {
        let entry = self.nodes.entry(node.to_string()).or_default();
        if let Some(stats) = stats {
            entry.cpu += stats.maxcpu;
            entry.mem += stats.maxmem;
        }
    }

    fn score_nodes_to_start_service(
        &self,
        _sid: &ServiceId,
        stats: Option<&ServiceStats>,
    ) -> BTreeMap<String, f64> {
        let extra = stats.copied().unwrap_or_default();
        self.nodes
            .iter()
            .map(|(node, usage)| (node.clone(), usage.score_with(&extra)))
            .collect()
    }
}

/// Build the usage backend for the configured scheduler mode.
///
/// Static mode needs per-node capacity; callers fall back to basic when
/// those stats are unavailable.
pub fn usage_for_mode(
    mode: SchedulerMode,
    node_stats: Option<BTreeMap<String, NodeStats>>,
) -> Box<dyn NodeUsage> {
    match (mode, node_stats) {
        (SchedulerMode::Static, Some(stats)) if !stats.is_empty() => {
            Box::new(UsageStatic::new(stats))
        }
        _ => Box::new(UsageBasic::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sid(s: &str) -> ServiceId {
        s.parse().unwrap()
    }

    #[test]
    fn test_basic_counts() {
        let mut usage = UsageBasic::new();
        usage.add_node("n1");
        usage.add_node("n2");
        usage.add_service_usage_to_node("n1", &sid("vm:100"), None);
        usage.add_service_usage_to_node("n1", &sid("vm:101"), None);

        let scores = usage.score_nodes_to_start_service(&sid("vm:102"), None);
        assert_eq!(scores["n1"], 2.0);
        assert_eq!(scores["n2"], 0.0);
    }

    #[test]
    fn test_static_prefers_empty_node() {
        let node_stats: BTreeMap<String, NodeStats> = [
            (
                "n1".to_string(),
                NodeStats {
                    cpus: 8.0,
                    memory: 16 << 30,
                },
            ),
            (
                "n3".to_string(),
                NodeStats {
                    cpus: 8.0,
                    memory: 16 << 30,
                },
            ),
        ]
        .into();
        let mut usage = UsageStatic::new(node_stats);
        usage.add_node("n1");
        usage.add_node("n3");

        let heavy = ServiceStats {
            maxcpu: 4.0,
            maxmem: 8 << 30,
        };
        usage.add_service_usage_to_node("n1", &sid("vm:100"), Some(&heavy));

        let light = ServiceStats {
            maxcpu: 1.0,
            maxmem: 1 << 30,
        };
        let scores = usage.score_nodes_to_start_service(&sid("vm:101"), Some(&light));
        assert!(scores["n3"] < scores["n1"]);
    }

    #[test]
    fn test_static_without_capacity_scores_worst() {
        let mut usage = UsageStatic::new(BTreeMap::new());
        usage.add_node("n1");
        let scores =
            usage.score_nodes_to_start_service(&sid("vm:100"), Some(&ServiceStats::default()));
        assert_eq!(scores["n1"], 2.0);
    }

    #[test]
    fn test_mode_fallback() {
        let usage = usage_for_mode(SchedulerMode::Static, None);
        // Fails closed to basic: counting still works without stats.
        let mut usage = usage;
        usage.add_node("n1");
        usage.add_service_usage_to_node("n1", &sid("vm:100"), None);
        let scores = usage.score_nodes_to_start_service(&sid("vm:101"), None);
        assert_eq!(scores["n1"], 1.0);
    }
}
