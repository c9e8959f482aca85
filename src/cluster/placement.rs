//! Placement decision for a single service.
//!
//! `select_service_node` resolves the service's effective group into
//! priority tiers, applies failback and failure-history rules, and picks
//! the best-scored node from the top tier.

use super::usage::NodeUsage;
use crate::types::{Group, ServiceConfig, ServiceId, ServiceStats};
use std::collections::{BTreeMap, BTreeSet};

/// How the caller wants the choice biased.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectPreference {
    /// Prefer staying on the current node when policy allows it.
    None,
    /// Always pick the best-scored node (recovery, rebalance).
    BestScore,
    /// Skip nodes that already failed and move past the current node.
    TryNext,
}

/// Non-member nodes of an unrestricted group run at this priority tier.
const NON_MEMBER_PRIORITY: i64 = -1;

/// Pick a node to run `sid` on, or `None` when no candidate exists right
/// now (the caller retries next tick).
#[allow(clippy::too_many_arguments)]
pub fn select_service_node(
    groups: &BTreeMap<String, Group>,
    usage: &dyn NodeUsage,
    sid: &ServiceId,
    stats: Option<&ServiceStats>,
    cd: &ServiceConfig,
    current_node: &str,
    failed_nodes: &[String],
    maintenance_node: Option<&str>,
    online_nodes: &BTreeSet<String>,
    preference: SelectPreference,
) -> Option<String> {
    let group = cd.group.as_deref().and_then(|name| groups.get(name));

    // Priority tiers of online candidates. An unknown or absent group means
    // a synthetic group of all online nodes.
    let mut tiers: BTreeMap<i64, BTreeSet<&str>> = BTreeMap::new();
    match group {
        Some(group) => {
            for (node, priority) in &group.nodes {
                if online_nodes.contains(node) {
                    tiers.entry(*priority as i64).or_default().insert(node);
                }
            }
            if !group.restricted {
                for node in online_nodes {
                    if !group.nodes.contains_key(node.as_str()) {
                        tiers
                            .entry(NON_MEMBER_PRIORITY)
                            .or_default()
                            .insert(node);
                    }
                }
            }
        }
        None => {
            for node in online_nodes {
                tiers.entry(0).or_default().insert(node);
            }
        }
    }

    let (_, mut top) = tiers.into_iter().next_back()?;

    if preference == SelectPreference::TryNext {
        for failed in failed_nodes {
            top.remove(failed.as_str());
        }
    }
    if top.is_empty() {
        return None;
    }

    if let Some(fallback) = maintenance_node {
        if top.contains(fallback) {
            return Some(fallback.to_string());
        }
    }

    if preference == SelectPreference::None {
        let nofailback = group.map(|g| g.nofailback).unwrap_or(false);
        let current_is_member = group
            .map(|g| g.nodes.contains_key(current_node))
            .unwrap_or(false);
        if nofailback && current_is_member && online_nodes.contains(current_node) {
            return Some(current_node.to_string());
        }

        if top.contains(current_node) {
            return Some(current_node.to_string());
        }
    }

    let scores = usage.score_nodes_to_start_service(sid, stats);
    let mut ordered: Vec<&str> = top.into_iter().collect();
    ordered.sort_by(|a, b| {
        let sa = scores.get(*a).copied().unwrap_or(f64::MAX);
        let sb = scores.get(*b).copied().unwrap_or(f64::MAX);
        sa.partial_cmp(&sb)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.cmp(b))
    });

    let chosen = match preference {
        SelectPreference::TryNext => {
            match ordered.iter().position(|n| *n == current_node) {
                Some(pos) => ordered[(pos + 1) % ordered.len()],
                None => ordered[0],
            }
        }
        _ => ordered[0],
    };

    Some(chosen.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::usage::UsageBasic;
    use crate::types::RequestState;

    fn sid() -> ServiceId {
        "vm:100".parse().unwrap()
    }

    fn cd(group: Option<&str>) -> ServiceConfig {
        ServiceConfig {
            node: "n1".to_string(),
            state: RequestState::Started,
            group: group.map(str::to_string),
            failback: true,
            max_restart: 1,
            max_relocate: 1,
            comment: None,
        }
    }

    fn online(nodes: &[&str]) -> BTreeSet<String> {
        nodes.iter().map(|n| n.to_string()).collect()
    }

    fn usage_with(nodes: &[(&str, usize)]) -> UsageBasic {
        let mut usage = UsageBasic::new();
        for (node, count) in nodes {
            usage.add_node(node);
            for i in 0..*count {
                usage.add_service_usage_to_node(
                    node,
                    &format!("vm:{}", 900 + i).parse().unwrap(),
                    None,
                );
            }
        }
        usage
    }

    fn group(nodes: &[(&str, u32)], restricted: bool, nofailback: bool) -> Group {
        Group {
            nodes: nodes.iter().map(|(n, p)| (n.to_string(), *p)).collect(),
            restricted,
            nofailback,
            comment: None,
        }
    }

    #[test]
    fn test_priority_wins_over_score() {
        let mut groups = BTreeMap::new();
        groups.insert("g".to_string(), group(&[("n2", 2), ("n3", 1)], false, false));
        let usage = usage_with(&[("n1", 0), ("n2", 5), ("n3", 0)]);

        let chosen = select_service_node(
            &groups,
            &usage,
            &sid(),
            None,
            &cd(Some("g")),
            "n1",
            &[],
            None,
            &online(&["n1", "n2", "n3"]),
            SelectPreference::BestScore,
        );
        // n2 has the highest priority even though n3 scores better.
        assert_eq!(chosen.as_deref(), Some("n2"));
    }

    #[test]
    fn test_unrestricted_adds_other_nodes_below() {
        let mut groups = BTreeMap::new();
        groups.insert("g".to_string(), group(&[("n2", 1)], false, false));
        let usage = usage_with(&[("n1", 0), ("n2", 0), ("n3", 0)]);

        // n2 offline: the remaining candidates are the non-member tier.
        let chosen = select_service_node(
            &groups,
            &usage,
            &sid(),
            None,
            &cd(Some("g")),
            "n1",
            &[],
            None,
            &online(&["n1", "n3"]),
            SelectPreference::BestScore,
        );
        assert_eq!(chosen.as_deref(), Some("n1"));
    }

    #[test]
    fn test_restricted_group_returns_none_when_empty() {
        let mut groups = BTreeMap::new();
        groups.insert("g".to_string(), group(&[("n2", 1)], true, false));
        let usage = usage_with(&[("n1", 0), ("n3", 0)]);

        let chosen = select_service_node(
            &groups,
            &usage,
            &sid(),
            None,
            &cd(Some("g")),
            "n1",
            &[],
            None,
            &online(&["n1", "n3"]),
            SelectPreference::BestScore,
        );
        assert_eq!(chosen, None);
    }

    #[test]
    fn test_nofailback_pins_current() {
        let mut groups = BTreeMap::new();
        groups.insert(
            "g".to_string(),
            group(&[("n1", 1), ("n2", 2)], false, true),
        );
        let usage = usage_with(&[("n1", 0), ("n2", 0)]);

        let chosen = select_service_node(
            &groups,
            &usage,
            &sid(),
            None,
            &cd(Some("g")),
            "n1",
            &[],
            None,
            &online(&["n1", "n2"]),
            SelectPreference::None,
        );
        // n2 has higher priority, but nofailback keeps the service on n1.
        assert_eq!(chosen.as_deref(), Some("n1"));
    }

    #[test]
    fn test_current_in_top_tier_stays() {
        let usage = usage_with(&[("n1", 9), ("n2", 0)]);
        let chosen = select_service_node(
            &BTreeMap::new(),
            &usage,
            &sid(),
            None,
            &cd(None),
            "n1",
            &[],
            None,
            &online(&["n1", "n2"]),
            SelectPreference::None,
        );
        assert_eq!(chosen.as_deref(), Some("n1"));
    }

    #[test]
    fn test_best_score_ties_break_by_name() {
        let usage = usage_with(&[("n2", 0), ("n3", 0)]);
        let chosen = select_service_node(
            &BTreeMap::new(),
            &usage,
            &sid(),
            None,
            &cd(None),
            "n1",
            &[],
            None,
            &online(&["n2", "n3"]),
            SelectPreference::BestScore,
        );
        assert_eq!(chosen.as_deref(), Some("n2"));
    }

    #[test]
    fn test_try_next_skips_failed_and_wraps() {
        let usage = usage_with(&[("n1", 0), ("n2", 0), ("n3", 0)]);

        let chosen = select_service_node(
            &BTreeMap::new(),
            &usage,
            &sid(),
            None,
            &cd(None),
            "n1",
            &[String::from("n2")],
            None,
            &online(&["n1", "n2", "n3"]),
            SelectPreference::TryNext,
        );
        // n2 failed already; after n1 the next candidate is n3.
        assert_eq!(chosen.as_deref(), Some("n3"));

        // All candidates failed: nothing to pick.
        let chosen = select_service_node(
            &BTreeMap::new(),
            &usage,
            &sid(),
            None,
            &cd(None),
            "n1",
            &["n1".into(), "n2".into(), "n3".into()],
            None,
            &online(&["n1", "n2", "n3"]),
            SelectPreference::TryNext,
        );
        assert_eq!(chosen, None);
    }

    #[test]
    fn test_maintenance_fallback_preferred() {
        let usage = usage_with(&[("n1", 0), ("n2", 5)]);
        let chosen = select_service_node(
            &BTreeMap::new(),
            &usage,
            &sid(),
            None,
            &cd(None),
            "n1",
            &[],
            Some("n2"),
            &online(&["n1", "n2"]),
            SelectPreference::None,
        );
        assert_eq!(chosen.as_deref(), Some("n2"));
    }
}
