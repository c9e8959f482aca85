//! End-to-end scenarios on the simulated cluster.
//!
//! Each test builds a small virtual cluster, steps the CRM and LRM loops
//! tick by tick through scripted failures, and asserts on the resulting
//! manager status.

use haven::config::{CrsConfig, HavenConfig, SchedulerMode};
use haven::crm::{Crm, CrmState};
use haven::env::sim::SimCluster;
use haven::env::{Environment, FenceStatus, HostShutdown};
use haven::lrm::Lrm;
use haven::types::{
    agent_lock_name, manager_lock_name, Group, LrmMode, NodeState, NodeStats, RequestState,
    ServiceConfig, ServiceId, ServiceState, ServiceStats,
};
use std::sync::Arc;

const TICK_SECS: u64 = 10;

struct Harness {
    cluster: SimCluster,
    crm: Crm,
    lrms: Vec<(String, Lrm)>,
}

impl Harness {
    /// Build a cluster; the CRM candidate runs on `crm_node`.
    fn new(nodes: &[&str], crm_node: &str) -> Self {
        let cluster = SimCluster::new();
        for node in nodes {
            cluster.add_node(node);
        }

        let config = HavenConfig::development("test");
        let crm_env: Arc<dyn Environment> = Arc::new(cluster.env_for(crm_node));
        let crm = Crm::new(crm_env, cluster.registry_for(crm_node), config.clone());

        let lrms = nodes
            .iter()
            .map(|node| {
                let env: Arc<dyn Environment> = Arc::new(cluster.env_for(node));
                let lrm = Lrm::new(env, cluster.registry_for(node), config.clone());
                (node.to_string(), lrm)
            })
            .collect();

        Self {
            cluster,
            crm,
            lrms,
        }
    }

    /// One cluster tick: every live LRM runs, then the CRM, then time
    /// advances.
    async fn tick(&mut self) {
        for (node, lrm) in &mut self.lrms {
            if self.cluster.is_powered(node) {
                // Errors here model transient KV failures (e.g. lost
                // quorum); the loops retry next tick.
                let _ = lrm.do_one_iteration().await;
                lrm.drain_workers().await;
            }
        }
        let _ = self.crm.do_one_iteration().await;
        self.cluster.advance(TICK_SECS);
    }

    async fn run_ticks(&mut self, count: usize) {
        for _ in 0..count {
            self.tick().await;
        }
    }

    /// Tick until the service satisfies the predicate, or panic after the
    /// given number of ticks.
    async fn run_until<F>(&mut self, sid: &ServiceId, max_ticks: usize, what: &str, pred: F)
    where
        F: Fn(&haven::types::ServiceStatus) -> bool,
    {
        for _ in 0..max_ticks {
            self.tick().await;
            if let Some(sd) = self.cluster.service_status(sid) {
                if pred(&sd) {
                    return;
                }
            }
        }
        panic!(
            "condition '{}' not reached for {} within {} ticks: {:?}",
            what,
            sid,
            max_ticks,
            self.cluster.service_status(sid)
        );
    }

    /// Replace a node's LRM with a fresh instance, as a daemon restart
    /// would.
    fn restart_lrm(&mut self, node: &str) {
        let env: Arc<dyn Environment> = Arc::new(self.cluster.env_for(node));
        let lrm = Lrm::new(
            env,
            self.cluster.registry_for(node),
            HavenConfig::development("test"),
        );
        if let Some(entry) = self.lrms.iter_mut().find(|(n, _)| n == node) {
            entry.1 = lrm;
        }
    }
}

fn service_on(node: &str) -> ServiceConfig {
    ServiceConfig {
        node: node.to_string(),
        state: RequestState::Started,
        group: None,
        failback: true,
        max_restart: 1,
        max_relocate: 1,
        comment: None,
    }
}

fn group_of(nodes: &[(&str, u32)], restricted: bool, nofailback: bool) -> Group {
    Group {
        nodes: nodes.iter().map(|(n, p)| (n.to_string(), *p)).collect(),
        restricted,
        nofailback,
        comment: None,
    }
}

fn sid(s: &str) -> ServiceId {
    s.parse().unwrap()
}

/// S1: a node with a running service loses power; the service is fenced
/// off the dead node and recovered on the best remaining one.
#[tokio::test]
async fn test_node_failure_recovery() {
    let mut h = Harness::new(&["n1", "n2", "n3"], "n3");
    let vm = sid("vm:100");
    h.cluster.set_group(
        "default",
        group_of(&[("n1", 0), ("n2", 0), ("n3", 0)], false, false),
    );
    let mut cd = service_on("n1");
    cd.group = Some("default".to_string());
    h.cluster.add_service(&vm, cd);

    h.run_until(&vm, 6, "started on n1", |sd| {
        sd.state == ServiceState::Started && sd.node == "n1" && sd.running
    })
    .await;
    assert_eq!(
        h.cluster.lock_holder(&agent_lock_name("n1")).as_deref(),
        Some("n1")
    );
    assert_eq!(
        h.cluster.lock_holder(manager_lock_name()).as_deref(),
        Some("n3")
    );

    let offline_at = h.cluster.now();
    h.cluster.power_off("n1");

    h.run_until(&vm, 40, "recovered elsewhere", |sd| {
        sd.state == ServiceState::Started && sd.node != "n1" && sd.running
    })
    .await;

    let sd = h.cluster.service_status(&vm).unwrap();
    // Equal scores on n2 and n3: the name tie-break picks n2.
    assert_eq!(sd.node, "n2");
    assert!(sd.failed_nodes.is_empty());

    // Progress bound: fence delay + lock lifetime + a few ticks.
    let elapsed = h.cluster.now() - offline_at;
    assert!(elapsed <= 60 + 120 + 3 * TICK_SECS, "took {}s", elapsed);

    // The fence episode was observed and the node is no longer fencing.
    let statuses: Vec<FenceStatus> = h
        .cluster
        .notifications()
        .iter()
        .filter(|n| n.node == "n1")
        .map(|n| n.status)
        .collect();
    assert_eq!(statuses, vec![FenceStatus::Fence, FenceStatus::Succeed]);
    let ms = h.cluster.manager_status();
    assert_eq!(ms.node_status["n1"], NodeState::Unknown);

    // The fenced node's agent lock is now held by the master.
    assert_eq!(
        h.cluster.lock_holder(&agent_lock_name("n1")).as_deref(),
        Some("n3")
    );
}

/// S2: repeated start errors relocate the service until `max_relocate` is
/// exhausted, then park it in error state.
#[tokio::test]
async fn test_start_error_relocate() {
    let mut h = Harness::new(&["n1", "n2"], "n2");
    let ct = sid("ct:200");
    h.cluster.add_service(&ct, service_on("n1"));
    h.cluster.script_start_failures(&ct, 2);

    h.run_until(&ct, 25, "error state", |sd| sd.state == ServiceState::Error)
        .await;

    let sd = h.cluster.service_status(&ct).unwrap();
    assert_eq!(sd.failed_nodes, vec!["n1".to_string(), "n2".to_string()]);
    assert!(!sd.running);

    // Disabling the service clears the error bookkeeping.
    h.cluster.set_service_request_state(&ct, RequestState::Disabled);
    h.run_until(&ct, 5, "stopped after disable", |sd| {
        sd.state == ServiceState::Stopped
    })
    .await;
    assert!(h.cluster.service_status(&ct).unwrap().failed_nodes.is_empty());
}

/// S3: with rebalance-on-start and the static scheduler, a newly started
/// service lands on the emptiest node instead of its home node.
#[tokio::test]
async fn test_rebalance_on_start() {
    let mut h = Harness::new(&["n1", "n2", "n3"], "n1");
    let stats = NodeStats {
        cpus: 8.0,
        memory: 16 << 30,
    };
    for node in ["n1", "n2", "n3"] {
        h.cluster.set_node_stats(node, stats);
    }
    h.cluster.set_crs(CrsConfig {
        scheduler: SchedulerMode::Static,
        rebalance_on_request_start: true,
    });

    // n1 and n2 carry load; n3 is empty.
    let heavy = ServiceStats {
        maxcpu: 4.0,
        maxmem: 8 << 30,
    };
    for (existing, node) in [("vm:101", "n1"), ("vm:102", "n2")] {
        let existing = sid(existing);
        h.cluster.add_service(&existing, service_on(node));
        h.cluster.set_service_stats(&existing, heavy);
    }

    let vm = sid("vm:100");
    let mut cd = service_on("n1");
    cd.state = RequestState::Stopped;
    h.cluster.add_service(&vm, cd);
    h.cluster.set_service_stats(
        &vm,
        ServiceStats {
            maxcpu: 1.0,
            maxmem: 1 << 30,
        },
    );

    h.run_ticks(6).await;
    assert_eq!(
        h.cluster.service_status(&vm).unwrap().state,
        ServiceState::Stopped
    );

    h.cluster.set_service_request_state(&vm, RequestState::Started);

    let mut saw_balance = false;
    for _ in 0..20 {
        h.tick().await;
        if let Some(sd) = h.cluster.service_status(&vm) {
            if sd.state == ServiceState::RequestStartBalance {
                assert_eq!(sd.node, "n1");
                assert_eq!(sd.target.as_deref(), Some("n3"));
                saw_balance = true;
            }
            if sd.state == ServiceState::Started && sd.running {
                break;
            }
        }
    }
    assert!(saw_balance, "request_start_balance was never entered");

    let sd = h.cluster.service_status(&vm).unwrap();
    assert_eq!(sd.state, ServiceState::Started);
    assert_eq!(sd.node, "n3");
}

/// S4: node maintenance drains services to other nodes and brings them
/// back once maintenance ends.
#[tokio::test]
async fn test_maintenance_round_trip() {
    let mut h = Harness::new(&["n1", "n2", "n3"], "n1");
    let vm = sid("vm:100");
    h.cluster.add_service(&vm, service_on("n2"));

    h.run_until(&vm, 6, "started on n2", |sd| {
        sd.state == ServiceState::Started && sd.node == "n2" && sd.running
    })
    .await;

    h.cluster.queue_command("enable-node-maintenance n2");
    h.run_until(&vm, 15, "drained off n2", |sd| {
        sd.state == ServiceState::Started && sd.node != "n2" && sd.running
    })
    .await;

    let sd = h.cluster.service_status(&vm).unwrap();
    assert_eq!(sd.maintenance_node.as_deref(), Some("n2"));
    let ms = h.cluster.manager_status();
    assert_eq!(ms.node_status["n2"], NodeState::Maintenance);
    assert_eq!(h.cluster.lrm_status("n2").mode, LrmMode::Maintenance);

    h.cluster.queue_command("disable-node-maintenance n2");
    h.run_until(&vm, 15, "back on n2", |sd| {
        sd.state == ServiceState::Started && sd.node == "n2" && sd.running
    })
    .await;
    assert_eq!(h.cluster.service_status(&vm).unwrap().maintenance_node, None);
    assert_eq!(
        h.cluster.manager_status().node_status["n2"],
        NodeState::Online
    );
}

/// S5: an LRM entering restart mode freezes its services; they thaw to
/// their configured state once it is back.
#[tokio::test]
async fn test_freeze_during_restart() {
    let mut h = Harness::new(&["n1", "n2"], "n2");
    let vm = sid("vm:100");
    let ct = sid("ct:201");
    h.cluster.add_service(&vm, service_on("n1"));
    let mut stopped = service_on("n1");
    stopped.state = RequestState::Stopped;
    h.cluster.add_service(&ct, stopped);

    h.run_until(&vm, 8, "started on n1", |sd| {
        sd.state == ServiceState::Started && sd.running
    })
    .await;

    h.cluster.set_shutdown("n1", HostShutdown::Reboot);
    h.run_until(&vm, 8, "frozen", |sd| sd.state == ServiceState::Freeze)
        .await;
    assert_eq!(
        h.cluster.service_status(&ct).unwrap().state,
        ServiceState::Freeze
    );

    // The daemon comes back after the reboot.
    h.cluster.set_shutdown("n1", HostShutdown::None);
    h.restart_lrm("n1");

    h.run_until(&vm, 10, "thawed and started", |sd| {
        sd.state == ServiceState::Started && sd.running
    })
    .await;
    h.run_until(&ct, 10, "thawed and stopped", |sd| {
        sd.state == ServiceState::Stopped
    })
    .await;
}

/// S6: flipping a service to `ignored` removes it from the manager status
/// while leaving the workload itself untouched.
#[tokio::test]
async fn test_ignored_service_removed() {
    let mut h = Harness::new(&["n1", "n2"], "n2");
    let vm = sid("vm:100");
    h.cluster.add_service(&vm, service_on("n1"));

    h.run_until(&vm, 8, "started on n1", |sd| {
        sd.state == ServiceState::Started && sd.running
    })
    .await;

    h.cluster.set_service_request_state(&vm, RequestState::Ignored);
    h.run_ticks(3).await;

    assert!(h.cluster.service_status(&vm).is_none());
    // The workload keeps running; nothing stopped it.
    assert_eq!(
        h.cluster.service_location(&vm),
        Some(("n1".to_string(), true))
    );
}

/// Property 1: at most one CRM holds the manager lock; a dead master is
/// replaced after the lock lifetime.
#[tokio::test]
async fn test_single_master_failover() {
    let cluster = SimCluster::new();
    cluster.add_node("n1");
    cluster.add_node("n2");
    let config = HavenConfig::development("test");

    let env1: Arc<dyn Environment> = Arc::new(cluster.env_for("n1"));
    let env2: Arc<dyn Environment> = Arc::new(cluster.env_for("n2"));
    let mut crm1 = Crm::new(env1, cluster.registry_for("n1"), config.clone());
    let mut crm2 = Crm::new(env2, cluster.registry_for("n2"), config);

    for _ in 0..5 {
        let _ = crm1.do_one_iteration().await;
        let _ = crm2.do_one_iteration().await;
        assert!(
            !(crm1.state() == CrmState::Master && crm2.state() == CrmState::Master),
            "two masters at once"
        );
        cluster.advance(TICK_SECS);
    }
    assert_eq!(crm1.state(), CrmState::Master);
    assert_eq!(crm2.state(), CrmState::Slave);

    cluster.power_off("n1");
    for _ in 0..15 {
        let _ = crm2.do_one_iteration().await;
        cluster.advance(TICK_SECS);
    }
    assert_eq!(crm2.state(), CrmState::Master);
    assert_eq!(
        cluster.lock_holder(manager_lock_name()).as_deref(),
        Some("n2")
    );
}

/// Property 8: a move command for the node the service already runs on is
/// logged and dropped without any state change.
#[tokio::test]
async fn test_move_command_idempotence() {
    let mut h = Harness::new(&["n1", "n2"], "n2");
    let vm = sid("vm:100");
    h.cluster.add_service(&vm, service_on("n1"));

    h.run_until(&vm, 8, "started on n1", |sd| {
        sd.state == ServiceState::Started && sd.running
    })
    .await;

    h.cluster.queue_command("migrate vm:100 n1");
    h.cluster.queue_command("migrate vm:100 n1");

    for _ in 0..5 {
        h.tick().await;
        let sd = h.cluster.service_status(&vm).unwrap();
        assert_eq!(sd.state, ServiceState::Started);
        assert_eq!(sd.node, "n1");
    }
}

/// Property 5: with `nofailback`, a service stays where it is even when a
/// higher-priority group node comes back.
#[tokio::test]
async fn test_nofailback_honoured() {
    let mut h = Harness::new(&["n1", "n2", "n3"], "n1");
    let vm = sid("vm:100");
    h.cluster
        .set_group("pinned", group_of(&[("n2", 1), ("n3", 2)], true, true));
    let mut cd = service_on("n2");
    cd.group = Some("pinned".to_string());
    h.cluster.add_service(&vm, cd);

    // n3 (the preferred node) is down at first.
    h.cluster.power_off("n3");
    h.run_until(&vm, 10, "started on n2", |sd| {
        sd.state == ServiceState::Started && sd.node == "n2" && sd.running
    })
    .await;

    h.cluster.power_on("n3");
    for _ in 0..8 {
        h.tick().await;
        let sd = h.cluster.service_status(&vm).unwrap();
        assert_eq!(sd.node, "n2", "nofailback service moved");
    }
}

/// Without `nofailback`, the same setup moves the service to the
/// higher-priority node as soon as it returns.
#[tokio::test]
async fn test_failback_to_higher_priority() {
    let mut h = Harness::new(&["n1", "n2", "n3"], "n1");
    let vm = sid("vm:100");
    h.cluster
        .set_group("tiered", group_of(&[("n2", 1), ("n3", 2)], true, false));
    let mut cd = service_on("n2");
    cd.group = Some("tiered".to_string());
    h.cluster.add_service(&vm, cd);

    h.cluster.power_off("n3");
    h.run_until(&vm, 10, "started on n2", |sd| {
        sd.state == ServiceState::Started && sd.node == "n2" && sd.running
    })
    .await;

    h.cluster.power_on("n3");
    h.run_until(&vm, 15, "moved to n3", |sd| {
        sd.state == ServiceState::Started && sd.node == "n3" && sd.running
    })
    .await;
}

/// An LRM that loses quorum with running services leaves the watchdog
/// armed and self-fences; the master recovers the services afterwards.
#[tokio::test]
async fn test_quorum_loss_self_fence() {
    let mut h = Harness::new(&["n1", "n2"], "n2");
    let vm = sid("vm:100");
    h.cluster.add_service(&vm, service_on("n1"));

    h.run_until(&vm, 8, "started on n1", |sd| {
        sd.state == ServiceState::Started && sd.running
    })
    .await;
    assert!(h.cluster.watchdog_armed("n1"));

    h.cluster.set_quorate("n1", false);

    h.run_until(&vm, 40, "recovered on n2", |sd| {
        sd.state == ServiceState::Started && sd.node == "n2" && sd.running
    })
    .await;
    // The watchdog fired: the isolated node rebooted itself.
    assert!(!h.cluster.is_powered("n1"));
}

/// Property 2: the simulated runtime never reports a service running on
/// two nodes; spot-check across a full failover.
#[tokio::test]
async fn test_single_owner_through_failover() {
    let mut h = Harness::new(&["n1", "n2"], "n2");
    let vm = sid("vm:100");
    h.cluster.add_service(&vm, service_on("n1"));

    h.run_until(&vm, 8, "started on n1", |sd| {
        sd.state == ServiceState::Started && sd.running
    })
    .await;

    h.cluster.queue_command("migrate vm:100 n2");
    for _ in 0..12 {
        h.tick().await;
        // service_location is the single source of runtime truth in the
        // simulator; it can only name one node.
        let location = h.cluster.service_location(&vm);
        assert!(location.is_some());
    }
    let sd = h.cluster.service_status(&vm).unwrap();
    assert_eq!(sd.node, "n2");
    assert_eq!(
        h.cluster.service_location(&vm),
        Some(("n2".to_string(), true))
    );
}

/// A stopped service accepts a relocate command and moves without being
/// started.
#[tokio::test]
async fn test_stopped_service_relocate() {
    let mut h = Harness::new(&["n1", "n2"], "n2");
    let vm = sid("vm:100");
    let mut cd = service_on("n1");
    cd.state = RequestState::Stopped;
    h.cluster.add_service(&vm, cd);

    h.run_until(&vm, 6, "stopped on n1", |sd| {
        sd.state == ServiceState::Stopped && sd.node == "n1"
    })
    .await;

    h.cluster.queue_command("relocate vm:100 n2");
    h.run_until(&vm, 10, "moved to n2", |sd| {
        sd.state == ServiceState::Stopped && sd.node == "n2"
    })
    .await;
    assert_eq!(
        h.cluster.service_location(&vm),
        Some(("n2".to_string(), false))
    );
}
