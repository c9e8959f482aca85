//! The manager: owner of the cluster-wide service state machine.
//!
//! While the CRM holds the manager lock, [`Manager::manage`] runs one
//! iteration: ingest membership, LRM reports and commands, evolve every
//! service record to a fixpoint, fence unresponsive nodes, and flush the
//! resulting [`ManagerStatus`] atomically.

use crate::cluster::{
    select_service_node, usage_for_mode, FenceRunner, NodeStatusTracker, NodeUsage,
    SelectPreference,
};
use crate::config::{CrsConfig, FenceConfig, GroupsConfig, HavenConfig, ResourcesConfig,
    SchedulerMode, TimingConfig};
use crate::crm::commands::CrmCommand;
use crate::env::{Environment, FenceNotification, FenceStatus};
use crate::error::Result;
use crate::resources::DriverRegistry;
use crate::types::{
    fresh_uid, LrmMode, ManagerStatus, NodeStats, RequestState, ServiceId, ServiceState,
    ServiceStats, ServiceStatus, WorkerResult,
};
use metrics::{counter, gauge};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Resource locks that are safe to clear when recovering from a fenced
/// node: the previous owner can no longer act on them.
const SAFE_RECOVERY_LOCKS: &[&str] = &["backup", "mounted"];

pub struct Manager {
    env: Arc<dyn Environment>,
    registry: Arc<DriverRegistry>,
    timing: TimingConfig,
    fence: FenceRunner,

    status: ManagerStatus,
    tracker: NodeStatusTracker,
    usage: Box<dyn NodeUsage>,
    crs: CrsConfig,

    // Per-iteration inputs.
    resources: ResourcesConfig,
    groups: GroupsConfig,
    fence_config: FenceConfig,
    lrm_modes: HashMap<String, LrmMode>,
    lrm_results: HashMap<String, WorkerResult>,
    node_stats: Option<BTreeMap<String, NodeStats>>,
    service_stats: HashMap<ServiceId, ServiceStats>,
    online_nodes: BTreeSet<String>,
    fence_notified: HashSet<String>,
}

impl Manager {
    /// Adopt the persisted manager status and start a master session.
    pub async fn new(
        env: Arc<dyn Environment>,
        registry: Arc<DriverRegistry>,
        config: &HavenConfig,
    ) -> Result<Self> {
        let status = env.read_manager_status().await?;
        let now = env.now().await;
        let tracker = NodeStatusTracker::new(
            status.node_status.clone(),
            now,
            config.timing.fence_delay_secs(),
            config.timing.gone_node_expiry_secs(),
        );

        Ok(Self {
            env,
            registry,
            timing: config.timing.clone(),
            fence: FenceRunner::new(config.fencing),
            status,
            tracker,
            usage: Box::new(crate::cluster::UsageBasic::new()),
            crs: CrsConfig::default(),
            resources: ResourcesConfig::default(),
            groups: GroupsConfig::default(),
            fence_config: FenceConfig::default(),
            lrm_modes: HashMap::new(),
            lrm_results: HashMap::new(),
            node_stats: None,
            service_stats: HashMap::new(),
            online_nodes: BTreeSet::new(),
            fence_notified: HashSet::new(),
        })
    }

    /// Current manager status (last flushed or in progress).
    pub fn status(&self) -> &ManagerStatus {
        &self.status
    }

    /// Run one manager iteration.
    pub async fn manage(&mut self) -> Result<()> {
        let started = Instant::now();
        let now = self.env.now().await;

        let membership = self.env.membership().await?;
        self.collect_lrm_state(&membership).await;
        self.tracker.update(&membership, &self.lrm_modes, now);

        let local = self.env.node_name().to_string();
        if !membership.get(&local).map(|i| i.online).unwrap_or(false) {
            warn!("Local node not operational, skipping manager iteration");
            return Ok(());
        }

        self.refresh_scheduler().await;

        self.resources = self.env.load_resources().await?;
        self.groups = self.env.load_groups().await?;
        self.fence_config = self.env.load_fence_config().await?;
        self.refresh_service_stats().await;

        self.reconcile_services();
        self.apply_crm_commands().await?;
        self.apply_restart_freeze();

        // Per-service transitions chain within one tick (e.g. stopped ->
        // request_start -> started), so the pass repeats until stable.
        let round_cap = 3 + 2 * self.status.service_status.len();
        let mut rounds = 0;
        loop {
            self.recompute_online_node_usage();

            let mut changed = false;
            let sids: Vec<ServiceId> = self.status.service_status.keys().cloned().collect();
            for sid in sids {
                changed |= self.advance_service(&sid, now).await;
            }
            changed |= self.process_fencing(now).await?;

            if !changed {
                break;
            }
            rounds += 1;
            if rounds > round_cap {
                error!(rounds, "Service state machine did not reach a fixpoint");
                break;
            }
        }

        self.status.master_node = local;
        self.status.node_status = self.tracker.status_map().clone();
        self.status.timestamp = now;
        self.env.write_manager_status(&self.status).await?;

        counter!("haven_crm_iterations_total").increment(1);
        gauge!("haven_crm_services_total").set(self.status.service_status.len() as f64);
        let elapsed = started.elapsed();
        if elapsed >= self.timing.loop_warn_threshold {
            warn!(elapsed_secs = elapsed.as_secs(), "Manager iteration took too long");
        }
        Ok(())
    }

    /// Read every node's LRM status; derive modes and merge worker results.
    async fn collect_lrm_state(&mut self, membership: &BTreeMap<String, crate::types::NodeInfo>) {
        self.lrm_modes.clear();
        self.lrm_results.clear();

        for node in membership.keys() {
            match self.env.read_lrm_status(node).await {
                Ok(status) => {
                    self.lrm_modes.insert(node.clone(), status.mode);
                    self.lrm_results.extend(status.results);
                }
                Err(e) => {
                    debug!(node = %node, error = %e, "No LRM status available");
                }
            }
        }
    }

    /// Pick up datacenter scheduler settings; they may change at runtime.
    async fn refresh_scheduler(&mut self) {
        match self.env.load_crs_config().await {
            Ok(crs) => {
                if crs != self.crs {
                    info!(scheduler = ?crs.scheduler, "Scheduler configuration changed");
                }
                self.crs = crs;
            }
            Err(e) => warn!(error = %e, "Failed to load scheduler configuration"),
        }

        self.node_stats = if self.crs.scheduler == SchedulerMode::Static {
            match self.env.node_stats().await {
                Ok(stats) if !stats.is_empty() => Some(stats),
                Ok(_) => {
                    warn!("Static scheduler selected but no node stats, using basic");
                    None
                }
                Err(e) => {
                    warn!(error = %e, "Node stats unavailable, using basic scheduler");
                    None
                }
            }
        } else {
            None
        };
    }

    /// Cache per-service static stats for the static scheduler.
    async fn refresh_service_stats(&mut self) {
        self.service_stats.clear();
        if self.node_stats.is_none() {
            return;
        }

        for (sid, cd) in &self.resources.services {
            let Ok(driver) = self.registry.get_for(sid) else {
                continue;
            };
            match driver.static_stats(sid.name(), &cd.node).await {
                Ok(stats) => {
                    self.service_stats.insert(sid.clone(), stats);
                }
                Err(e) => {
                    debug!(sid = %sid, error = %e, "No static stats for service");
                }
            }
        }
    }

    /// Add newly declared services, drop deleted or ignored ones.
    fn reconcile_services(&mut self) {
        for (sid, cd) in &self.resources.services {
            if cd.state == RequestState::Ignored {
                continue;
            }
            if self.status.service_status.contains_key(sid) {
                continue;
            }
            if self.registry.get(sid.kind()).is_none() {
                error!(sid = %sid, "Cannot manage service of unknown type");
                continue;
            }

            let state = if cd.state == RequestState::Started {
                ServiceState::RequestStart
            } else {
                ServiceState::RequestStop
            };
            info!(sid = %sid, node = %cd.node, state = %state, "Adding new service");
            self.status
                .service_status
                .insert(sid.clone(), ServiceStatus::new(state, cd.node.as_str()));
        }

        let stale: Vec<ServiceId> = self
            .status
            .service_status
            .keys()
            .filter(|sid| {
                match self.resources.services.get(*sid) {
                    None => true,
                    Some(cd) => cd.state == RequestState::Ignored,
                }
            })
            .cloned()
            .collect();
        for sid in stale {
            info!(sid = %sid, "Removing service from manager status");
            self.status.service_status.remove(&sid);
        }
    }

    /// Drain the command queue into service records and node requests.
    async fn apply_crm_commands(&mut self) -> Result<()> {
        for line in self.env.read_crm_commands().await? {
            let cmd = match line.parse::<CrmCommand>() {
                Ok(cmd) => cmd,
                Err(e) => {
                    warn!(command = %line, error = %e, "Ignoring malformed CRM command");
                    continue;
                }
            };

            match cmd {
                CrmCommand::Migrate { sid, target } => {
                    self.queue_move(&sid, target, true);
                }
                CrmCommand::Relocate { sid, target } => {
                    self.queue_move(&sid, target, false);
                }
                CrmCommand::Stop { sid, timeout } => {
                    match self.status.service_status.get_mut(&sid) {
                        Some(sd) => {
                            info!(sid = %sid, timeout, "Queueing stop request");
                            sd.cmd = Some(crate::types::ServiceCommand::Stop { timeout });
                        }
                        None => warn!(sid = %sid, "Stop command for unmanaged service"),
                    }
                }
                CrmCommand::EnableNodeMaintenance { node } => {
                    info!(node = %node, "Node maintenance requested");
                    self.status.node_request.entry(node).or_default().maintenance = true;
                }
                CrmCommand::DisableNodeMaintenance { node } => {
                    info!(node = %node, "Node maintenance cleared");
                    self.status.node_request.remove(&node);
                }
            }
        }
        Ok(())
    }

    fn queue_move(&mut self, sid: &ServiceId, target: String, online: bool) {
        let Some(sd) = self.status.service_status.get_mut(sid) else {
            warn!(sid = %sid, "Move command for unmanaged service");
            return;
        };
        if !self.tracker.status_map().contains_key(&target) {
            warn!(sid = %sid, target = %target, "Move command to unknown node");
            return;
        }
        if sd.node == target {
            info!(sid = %sid, node = %target, "Ignoring move request, service already on node");
            return;
        }
        sd.cmd = Some(if online {
            crate::types::ServiceCommand::Migrate { target }
        } else {
            crate::types::ServiceCommand::Relocate { target }
        });
    }

    /// An LRM in restart mode cannot execute work; freeze its services so
    /// no transition is attempted until it returns.
    fn apply_restart_freeze(&mut self) {
        for (sid, sd) in self.status.service_status.iter_mut() {
            if self.lrm_modes.get(&sd.node) != Some(&LrmMode::Restart) {
                continue;
            }
            if matches!(
                sd.state,
                ServiceState::Started | ServiceState::Stopped | ServiceState::RequestStop
            ) {
                info!(sid = %sid, node = %sd.node, from = %sd.state, "Freezing service");
                sd.state = ServiceState::Freeze;
                sd.uid = fresh_uid();
            }
        }
    }

    /// Rebuild the usage accounting from the current status. Counters are
    /// not incremental; this runs at the start of every fixpoint round.
    fn recompute_online_node_usage(&mut self) {
        self.online_nodes = self.tracker.online_nodes();

        let mut usage = usage_for_mode(self.crs.scheduler, self.node_stats.clone());
        for node in &self.online_nodes {
            usage.add_node(node);
        }

        for (sid, sd) in &self.status.service_status {
            let stats = self.service_stats.get(sid);
            match sd.state {
                ServiceState::Started
                | ServiceState::RequestStart
                | ServiceState::RequestStop
                | ServiceState::Freeze
                | ServiceState::Error => {
                    if usage.contains_node(&sd.node) {
                        usage.add_service_usage_to_node(&sd.node, sid, stats);
                    }
                }
                ServiceState::Migrate
                | ServiceState::Relocate
                | ServiceState::RequestStartBalance => {
                    if usage.contains_node(&sd.node) {
                        usage.add_service_usage_to_node(&sd.node, sid, stats);
                    }
                    if let Some(target) = &sd.target {
                        if usage.contains_node(target) {
                            usage.add_service_usage_to_node(target, sid, stats);
                        }
                    }
                }
                ServiceState::Stopped | ServiceState::Fence | ServiceState::Recovery => {}
            }
        }

        self.usage = usage;
    }

    /// Placement query for one service.
    pub(super) fn select_node(
        &self,
        sid: &ServiceId,
        cd: &crate::types::ServiceConfig,
        sd: &ServiceStatus,
        preference: SelectPreference,
    ) -> Option<String> {
        select_service_node(
            &self.groups.groups,
            self.usage.as_ref(),
            sid,
            self.service_stats.get(sid),
            cd,
            &sd.node,
            &sd.failed_nodes,
            sd.maintenance_node.as_deref(),
            &self.online_nodes,
            preference,
        )
    }

    pub(super) fn charge_usage(&mut self, node: &str, sid: &ServiceId) {
        let stats = self.service_stats.get(sid).copied();
        self.usage
            .add_service_usage_to_node(node, sid, stats.as_ref());
    }

    pub(super) fn node_online(&self, node: &str) -> bool {
        self.online_nodes.contains(node)
    }

    pub(super) fn tracker(&mut self) -> &mut NodeStatusTracker {
        &mut self.tracker
    }

    pub(super) fn lrm_mode(&self, node: &str) -> Option<LrmMode> {
        self.lrm_modes.get(node).copied()
    }

    pub(super) fn crs(&self) -> &CrsConfig {
        &self.crs
    }

    /// Run one state-machine step for a service. Returns whether the
    /// record changed in a way that requires another fixpoint round.
    async fn advance_service(&mut self, sid: &ServiceId, now: u64) -> bool {
        let Some(mut sd) = self.status.service_status.get(sid).cloned() else {
            return false;
        };
        let Some(cd) = self.resources.services.get(sid).cloned() else {
            return false;
        };

        // A result only counts when it refers to the current transition.
        let lrm_res = self
            .lrm_results
            .get(&sd.uid)
            .filter(|r| r.sid == *sid)
            .map(|r| r.exit_code);

        let before = (sd.state, sd.node.clone(), sd.target.clone());

        match sd.state {
            ServiceState::Stopped => self.next_state_stopped(sid, &cd, &mut sd, now),
            ServiceState::RequestStart => self.next_state_request_start(sid, &cd, &mut sd),
            ServiceState::Started => self.next_state_started(sid, &cd, &mut sd, lrm_res, now),
            ServiceState::Migrate | ServiceState::Relocate | ServiceState::RequestStartBalance => {
                self.next_state_moving(sid, &cd, &mut sd, lrm_res, now)
            }
            ServiceState::RequestStop => self.next_state_request_stop(sid, &cd, &mut sd, lrm_res, now),
            ServiceState::Freeze => self.next_state_freeze(sid, &cd, &mut sd),
            ServiceState::Error => self.next_state_error(sid, &cd, &mut sd),
            ServiceState::Recovery => self.next_state_recovery(sid, &cd, &mut sd).await,
            // Advanced by the fencing block.
            ServiceState::Fence => {}
        }

        let after = (sd.state, sd.node.clone(), sd.target.clone());
        let changed = before != after;
        if changed {
            info!(
                sid = %sid,
                from = %before.0,
                to = %sd.state,
                node = %sd.node,
                "Service state change"
            );
            sd.uid = fresh_uid();
        }
        self.status.service_status.insert(sid.clone(), sd);
        changed
    }

    /// Fence every node that carries a fence-state service; advance those
    /// services to recovery once the fence is proven.
    async fn process_fencing(&mut self, now: u64) -> Result<bool> {
        let fence_nodes: BTreeSet<String> = self
            .status
            .service_status
            .values()
            .filter(|sd| sd.state == ServiceState::Fence)
            .map(|sd| sd.node.clone())
            .collect();

        let mut changed = false;
        for node in fence_nodes {
            self.tracker.start_fence(&node);

            if !self.fence_notified.contains(&node) {
                self.notify_fence(&node, FenceStatus::Fence, now).await;
                self.fence_notified.insert(node.clone());
            }

            let fenced = self
                .fence
                .fence_node(self.env.as_ref(), &self.fence_config, &node)
                .await?;
            if !fenced {
                continue;
            }

            info!(node = %node, "Node fenced successfully");
            counter!("haven_nodes_fenced_total").increment(1);
            self.notify_fence(&node, FenceStatus::Succeed, now).await;
            self.fence_notified.remove(&node);
            self.tracker.finish_fence(&node);

            for (sid, sd) in self.status.service_status.iter_mut() {
                if sd.state == ServiceState::Fence && sd.node == node {
                    info!(sid = %sid, node = %node, "Service enters recovery");
                    sd.state = ServiceState::Recovery;
                    sd.uid = fresh_uid();
                    changed = true;
                }
            }
        }
        Ok(changed)
    }

    async fn notify_fence(&self, node: &str, status: FenceStatus, now: u64) {
        let notification = FenceNotification {
            status,
            node: node.to_string(),
            master_node: self.env.node_name().to_string(),
            timestamp: now,
            nodes: self.tracker.status_map().keys().cloned().collect(),
            resources: self
                .status
                .service_status
                .iter()
                .filter(|(_, sd)| sd.node == node)
                .map(|(sid, _)| sid.clone())
                .collect(),
        };
        if let Err(e) = self.env.send_fence_notification(&notification).await {
            warn!(node = %node, error = %e, "Failed to send fence notification");
        }
    }

    /// Recovery of one service from a fenced node, invoked from the
    /// recovery transition.
    pub(super) async fn recover_service(
        &mut self,
        sid: &ServiceId,
        cd: &crate::types::ServiceConfig,
        sd: &mut ServiceStatus,
        target: &str,
    ) {
        let fenced = sd.node.clone();

        if let Ok(driver) = self.registry.get_for(sid) {
            match driver
                .remove_locks(sid.name(), SAFE_RECOVERY_LOCKS, &fenced)
                .await
            {
                Ok(Some(lock)) => {
                    info!(sid = %sid, lock = %lock, "Removed stale resource lock for recovery")
                }
                Ok(None) => {}
                Err(e) => warn!(sid = %sid, error = %e, "Could not clear resource locks"),
            }
        }

        match self.env.steal_service(sid, &fenced, target).await {
            Ok(()) => {
                info!(sid = %sid, from = %fenced, to = %target, "Recovered service");
                counter!("haven_recoveries_total").increment(1);
                self.charge_usage(target, sid);
                sd.recover_to(target);
                sd.state = if cd.state == RequestState::Started {
                    ServiceState::Started
                } else {
                    ServiceState::RequestStop
                };
            }
            Err(e) => {
                error!(sid = %sid, error = %e, "Failed to move service config, retrying");
            }
        }
    }
}
