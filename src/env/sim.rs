//! Deterministic simulated environment for tests.
//!
//! One [`SimCluster`] holds the whole virtual cluster: a virtual clock, an
//! in-memory KV, per-node power and quorum state, lease-based locks and a
//! modelled watchdog. Tests drive the control loops tick by tick, script
//! failures (power loss, driver errors, fence agent results) and assert on
//! the resulting manager status.
//!
//! Virtual time only moves through [`SimCluster::advance`] (or an
//! environment `sleep`); nothing here reads the wall clock.

use super::{Environment, FenceNotification, HostShutdown};
use crate::config::{
    CrsConfig, FenceConfig, FenceDevice, GroupsConfig, ResourcesConfig,
};
use crate::error::{HavenError, Result};
use crate::resources::{DriverRegistry, ResourceDriver};
use crate::types::{
    Group, LrmStatus, ManagerStatus, NodeInfo, NodeStats, RequestState, ServiceConfig, ServiceId,
    ServiceStats, ServiceStatus,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_LOCK_LIFETIME: u64 = 120;
const DEFAULT_WATCHDOG_TIMEOUT: u64 = 60;

#[derive(Debug, Clone)]
struct SimNode {
    powered: bool,
    quorate: bool,
    stats: NodeStats,
    watchdog_open: bool,
    watchdog_last: u64,
    shutdown: HostShutdown,
}

impl Default for SimNode {
    fn default() -> Self {
        Self {
            powered: true,
            quorate: true,
            stats: NodeStats::default(),
            watchdog_open: false,
            watchdog_last: 0,
            shutdown: HostShutdown::None,
        }
    }
}

#[derive(Debug, Clone)]
struct SimLock {
    holder: String,
    last_touch: u64,
}

#[derive(Debug, Clone, Default)]
struct SimService {
    running: bool,
    node: Option<String>,
    fail_start: u32,
    fail_migrate: u32,
    stats: ServiceStats,
}

struct SimState {
    time: u64,
    lock_lifetime: u64,
    watchdog_timeout: u64,
    nodes: BTreeMap<String, SimNode>,
    locks: HashMap<String, SimLock>,
    manager_status: Option<ManagerStatus>,
    lrm_status: HashMap<String, LrmStatus>,
    crm_commands: Vec<String>,
    resources: ResourcesConfig,
    groups: GroupsConfig,
    fence_config: FenceConfig,
    crs: CrsConfig,
    services: HashMap<ServiceId, SimService>,
    fence_agent_codes: HashMap<String, i32>,
    fence_agent_log: Vec<(String, String)>,
    notifications: Vec<FenceNotification>,
}

impl SimState {
    fn lock_valid(&self, lock: &SimLock) -> bool {
        self.time.saturating_sub(lock.last_touch) < self.lock_lifetime
    }

    fn holds_valid_lock(&self, name: &str, node: &str) -> bool {
        self.locks
            .get(name)
            .map(|l| l.holder == node && self.lock_valid(l))
            .unwrap_or(false)
    }

    /// Fire expired watchdogs: the node reboots, losing everything it ran.
    fn check_watchdogs(&mut self) {
        let expired: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, n)| {
                n.powered
                    && n.watchdog_open
                    && self.time.saturating_sub(n.watchdog_last) > self.watchdog_timeout
            })
            .map(|(name, _)| name.clone())
            .collect();

        for name in expired {
            if let Some(node) = self.nodes.get_mut(&name) {
                node.powered = false;
                node.watchdog_open = false;
            }
            for svc in self.services.values_mut() {
                if svc.node.as_deref() == Some(name.as_str()) {
                    svc.running = false;
                }
            }
        }
    }
}

/// Handle on the shared simulated cluster.
#[derive(Clone)]
pub struct SimCluster {
    state: Arc<Mutex<SimState>>,
}

impl Default for SimCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl SimCluster {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                time: 0,
                lock_lifetime: DEFAULT_LOCK_LIFETIME,
                watchdog_timeout: DEFAULT_WATCHDOG_TIMEOUT,
                nodes: BTreeMap::new(),
                locks: HashMap::new(),
                manager_status: None,
                lrm_status: HashMap::new(),
                crm_commands: Vec::new(),
                resources: ResourcesConfig::default(),
                groups: GroupsConfig::default(),
                fence_config: FenceConfig::default(),
                crs: CrsConfig::default(),
                services: HashMap::new(),
                fence_agent_codes: HashMap::new(),
                fence_agent_log: Vec::new(),
                notifications: Vec::new(),
            })),
        }
    }

    /// An environment handle for one node's control loops.
    pub fn env_for(&self, node: &str) -> SimEnvironment {
        SimEnvironment {
            cluster: self.clone(),
            node: node.to_string(),
        }
    }

    /// A driver registry whose `vm` and `ct` drivers act on the simulated
    /// cluster from the given node.
    pub fn registry_for(&self, node: &str) -> Arc<DriverRegistry> {
        DriverRegistry::builder()
            .register(Arc::new(SimDriver {
                cluster: self.clone(),
                kind: "vm".to_string(),
                node: node.to_string(),
            }))
            .register(Arc::new(SimDriver {
                cluster: self.clone(),
                kind: "ct".to_string(),
                node: node.to_string(),
            }))
            .build()
    }

    pub fn add_node(&self, name: &str) {
        self.state
            .lock()
            .nodes
            .insert(name.to_string(), SimNode::default());
    }

    pub fn remove_node(&self, name: &str) {
        self.state.lock().nodes.remove(name);
    }

    pub fn set_node_stats(&self, name: &str, stats: NodeStats) {
        if let Some(node) = self.state.lock().nodes.get_mut(name) {
            node.stats = stats;
        }
    }

    /// Hard power failure: the node drops out of membership, its watchdog
    /// is gone and everything it ran is dead.
    pub fn power_off(&self, name: &str) {
        let mut state = self.state.lock();
        if let Some(node) = state.nodes.get_mut(name) {
            node.powered = false;
            node.watchdog_open = false;
        }
        for svc in state.services.values_mut() {
            if svc.node.as_deref() == Some(name) {
                svc.running = false;
            }
        }
    }

    pub fn power_on(&self, name: &str) {
        if let Some(node) = self.state.lock().nodes.get_mut(name) {
            node.powered = true;
            node.shutdown = HostShutdown::None;
        }
    }

    pub fn set_quorate(&self, name: &str, quorate: bool) {
        if let Some(node) = self.state.lock().nodes.get_mut(name) {
            node.quorate = quorate;
        }
    }

    pub fn set_shutdown(&self, name: &str, shutdown: HostShutdown) {
        if let Some(node) = self.state.lock().nodes.get_mut(name) {
            node.shutdown = shutdown;
        }
    }

    /// Advance virtual time, firing watchdogs that missed their window.
    pub fn advance(&self, secs: u64) {
        let mut state = self.state.lock();
        state.time += secs;
        state.check_watchdogs();
    }

    pub fn now(&self) -> u64 {
        self.state.lock().time
    }

    pub fn set_lock_lifetime(&self, secs: u64) {
        self.state.lock().lock_lifetime = secs;
    }

    pub fn add_service(&self, sid: &ServiceId, cd: ServiceConfig) {
        let mut state = self.state.lock();
        state.resources.services.insert(sid.clone(), cd);
        state.services.entry(sid.clone()).or_default();
    }

    pub fn set_service_request_state(&self, sid: &ServiceId, request: RequestState) {
        if let Some(cd) = self.state.lock().resources.services.get_mut(sid) {
            cd.state = request;
        }
    }

    pub fn remove_service(&self, sid: &ServiceId) {
        self.state.lock().resources.services.remove(sid);
    }

    /// Seed the runtime state of a service.
    pub fn set_service_running(&self, sid: &ServiceId, node: &str, running: bool) {
        let mut state = self.state.lock();
        let svc = state.services.entry(sid.clone()).or_default();
        svc.node = Some(node.to_string());
        svc.running = running;
    }

    /// Where the service currently runs, if anywhere.
    pub fn service_location(&self, sid: &ServiceId) -> Option<(String, bool)> {
        let state = self.state.lock();
        let svc = state.services.get(sid)?;
        svc.node.clone().map(|n| (n, svc.running))
    }

    pub fn set_service_stats(&self, sid: &ServiceId, stats: ServiceStats) {
        self.state.lock().services.entry(sid.clone()).or_default().stats = stats;
    }

    /// Make the next `count` start attempts of a service fail.
    pub fn script_start_failures(&self, sid: &ServiceId, count: u32) {
        self.state.lock().services.entry(sid.clone()).or_default().fail_start = count;
    }

    /// Make the next `count` migrations of a service fail.
    pub fn script_migrate_failures(&self, sid: &ServiceId, count: u32) {
        self.state.lock().services.entry(sid.clone()).or_default().fail_migrate = count;
    }

    pub fn set_group(&self, name: &str, group: Group) {
        self.state.lock().groups.groups.insert(name.to_string(), group);
    }

    pub fn set_fence_config(&self, config: FenceConfig) {
        self.state.lock().fence_config = config;
    }

    pub fn set_crs(&self, crs: CrsConfig) {
        self.state.lock().crs = crs;
    }

    /// Script the exit code of a fence agent (default is 0).
    pub fn script_fence_agent(&self, agent: &str, exit_code: i32) {
        self.state
            .lock()
            .fence_agent_codes
            .insert(agent.to_string(), exit_code);
    }

    pub fn fence_agent_invocations(&self) -> Vec<(String, String)> {
        self.state.lock().fence_agent_log.clone()
    }

    pub fn queue_command(&self, command: &str) {
        self.state.lock().crm_commands.push(command.to_string());
    }

    pub fn manager_status(&self) -> ManagerStatus {
        self.state.lock().manager_status.clone().unwrap_or_default()
    }

    pub fn service_status(&self, sid: &ServiceId) -> Option<ServiceStatus> {
        self.state
            .lock()
            .manager_status
            .as_ref()
            .and_then(|ms| ms.service_status.get(sid).cloned())
    }

    pub fn lrm_status(&self, node: &str) -> LrmStatus {
        self.state
            .lock()
            .lrm_status
            .get(node)
            .cloned()
            .unwrap_or_default()
    }

    pub fn notifications(&self) -> Vec<FenceNotification> {
        self.state.lock().notifications.clone()
    }

    pub fn lock_holder(&self, name: &str) -> Option<String> {
        let state = self.state.lock();
        state
            .locks
            .get(name)
            .filter(|l| state.lock_valid(l))
            .map(|l| l.holder.clone())
    }

    pub fn is_powered(&self, node: &str) -> bool {
        self.state
            .lock()
            .nodes
            .get(node)
            .map(|n| n.powered)
            .unwrap_or(false)
    }

    pub fn watchdog_armed(&self, node: &str) -> bool {
        self.state
            .lock()
            .nodes
            .get(node)
            .map(|n| n.watchdog_open)
            .unwrap_or(false)
    }
}

/// Per-node view of the simulated cluster.
pub struct SimEnvironment {
    cluster: SimCluster,
    node: String,
}

impl SimEnvironment {
    fn operational(&self, state: &SimState) -> bool {
        state
            .nodes
            .get(&self.node)
            .map(|n| n.powered && n.quorate)
            .unwrap_or(false)
    }
}

#[async_trait]
impl Environment for SimEnvironment {
    fn node_name(&self) -> &str {
        &self.node
    }

    async fn now(&self) -> u64 {
        self.cluster.state.lock().time
    }

    async fn sleep(&self, duration: Duration) {
        self.cluster.advance(duration.as_secs());
    }

    async fn quorate(&self) -> bool {
        let state = self.cluster.state.lock();
        self.operational(&state)
    }

    async fn membership(&self) -> Result<BTreeMap<String, NodeInfo>> {
        let state = self.cluster.state.lock();
        Ok(state
            .nodes
            .iter()
            .map(|(name, node)| {
                (
                    name.clone(),
                    NodeInfo {
                        online: node.powered && node.quorate,
                    },
                )
            })
            .collect())
    }

    async fn read_manager_status(&self) -> Result<ManagerStatus> {
        Ok(self.cluster.manager_status())
    }

    async fn write_manager_status(&self, status: &ManagerStatus) -> Result<()> {
        let mut state = self.cluster.state.lock();
        if !self.operational(&state) {
            return Err(HavenError::NoQuorum);
        }
        if !state.holds_valid_lock("ha_manager_lock", &self.node) {
            return Err(HavenError::LockLost(format!(
                "manager status write from '{}' without manager lock",
                self.node
            )));
        }
        state.manager_status = Some(status.clone());
        Ok(())
    }

    async fn read_lrm_status(&self, node: &str) -> Result<LrmStatus> {
        Ok(self.cluster.lrm_status(node))
    }

    async fn write_lrm_status(&self, status: &LrmStatus) -> Result<()> {
        let mut state = self.cluster.state.lock();
        if !self.operational(&state) {
            return Err(HavenError::NoQuorum);
        }
        state.lrm_status.insert(self.node.clone(), status.clone());
        Ok(())
    }

    async fn read_crm_commands(&self) -> Result<Vec<String>> {
        Ok(std::mem::take(&mut self.cluster.state.lock().crm_commands))
    }

    async fn queue_crm_command(&self, command: &str) -> Result<()> {
        self.cluster.queue_command(command);
        Ok(())
    }

    async fn load_resources(&self) -> Result<ResourcesConfig> {
        Ok(self.cluster.state.lock().resources.clone())
    }

    async fn load_groups(&self) -> Result<GroupsConfig> {
        Ok(self.cluster.state.lock().groups.clone())
    }

    async fn load_fence_config(&self) -> Result<FenceConfig> {
        Ok(self.cluster.state.lock().fence_config.clone())
    }

    async fn load_crs_config(&self) -> Result<CrsConfig> {
        Ok(self.cluster.state.lock().crs)
    }

    async fn acquire_lock(&self, name: &str) -> bool {
        let mut state = self.cluster.state.lock();
        if !self.operational(&state) {
            return false;
        }
        let time = state.time;
        let lifetime = state.lock_lifetime;

        // Acquire, refresh and expired-lease takeover are all the same
        // write; only a live foreign lease blocks us.
        let take = match state.locks.get(name) {
            Some(lock) if lock.holder == self.node => true,
            Some(lock) => time.saturating_sub(lock.last_touch) >= lifetime,
            None => true,
        };
        if take {
            state.locks.insert(
                name.to_string(),
                SimLock {
                    holder: self.node.clone(),
                    last_touch: time,
                },
            );
        }
        take
    }

    async fn release_lock(&self, name: &str) {
        let mut state = self.cluster.state.lock();
        if state
            .locks
            .get(name)
            .map(|l| l.holder == self.node)
            .unwrap_or(false)
        {
            state.locks.remove(name);
        }
    }

    async fn steal_service(&self, sid: &ServiceId, from: &str, to: &str) -> Result<()> {
        let mut state = self.cluster.state.lock();
        if !state.holds_valid_lock("ha_manager_lock", &self.node) {
            return Err(HavenError::LockLost(
                "steal_service without manager lock".to_string(),
            ));
        }
        state.resources.set_service_node(sid, from, to)
    }

    async fn watchdog_open(&self) -> Result<()> {
        let mut state = self.cluster.state.lock();
        let time = state.time;
        let node = state
            .nodes
            .get_mut(&self.node)
            .ok_or_else(|| HavenError::NodeNotFound(self.node.clone()))?;
        if !node.powered {
            return Err(HavenError::Watchdog("node is powered off".to_string()));
        }
        node.watchdog_open = true;
        node.watchdog_last = time;
        Ok(())
    }

    async fn watchdog_update(&self) -> bool {
        let mut state = self.cluster.state.lock();
        let time = state.time;
        match state.nodes.get_mut(&self.node) {
            Some(node) if node.powered && node.watchdog_open => {
                node.watchdog_last = time;
                true
            }
            _ => false,
        }
    }

    async fn watchdog_close(&self, graceful: bool) {
        if graceful {
            if let Some(node) = self.cluster.state.lock().nodes.get_mut(&self.node) {
                node.watchdog_open = false;
            }
        }
        // A non-graceful close leaves the countdown running; the node will
        // self-fence when time advances past the timeout.
    }

    async fn exec_fence_agent(&self, device: &FenceDevice, node: &str) -> Result<i32> {
        let mut state = self.cluster.state.lock();
        state
            .fence_agent_log
            .push((device.agent.clone(), node.to_string()));
        Ok(state.fence_agent_codes.get(&device.agent).copied().unwrap_or(0))
    }

    async fn send_fence_notification(&self, notification: &FenceNotification) -> Result<()> {
        self.cluster.state.lock().notifications.push(notification.clone());
        Ok(())
    }

    async fn node_stats(&self) -> Result<BTreeMap<String, NodeStats>> {
        let state = self.cluster.state.lock();
        Ok(state
            .nodes
            .iter()
            .filter(|(_, n)| n.powered)
            .map(|(name, n)| (name.clone(), n.stats))
            .collect())
    }

    async fn shutdown_request(&self) -> HostShutdown {
        self.cluster
            .state
            .lock()
            .nodes
            .get(&self.node)
            .map(|n| n.shutdown)
            .unwrap_or(HostShutdown::None)
    }
}

/// Simulated resource driver acting on the shared cluster state.
struct SimDriver {
    cluster: SimCluster,
    kind: String,
    node: String,
}

impl SimDriver {
    fn sid(&self, name: &str) -> Result<ServiceId> {
        ServiceId::new(self.kind.as_str(), name)
    }

    fn ensure_powered(&self, state: &SimState) -> Result<()> {
        let powered = state
            .nodes
            .get(&self.node)
            .map(|n| n.powered)
            .unwrap_or(false);
        if powered {
            Ok(())
        } else {
            Err(HavenError::ServiceFailed {
                sid: self.kind.clone(),
                reason: format!("node '{}' is down", self.node),
            })
        }
    }
}

#[async_trait]
impl ResourceDriver for SimDriver {
    fn kind(&self) -> &str {
        &self.kind
    }

    fn verify_name(&self, name: &str) -> Result<()> {
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(HavenError::InvalidServiceId(format!(
                "{}:{}",
                self.kind, name
            )));
        }
        Ok(())
    }

    fn config_file(&self, name: &str, node: &str) -> PathBuf {
        PathBuf::from(format!("/sim/{}/{}/{}.conf", node, self.kind, name))
    }

    async fn exists(&self, name: &str) -> Result<bool> {
        let sid = self.sid(name)?;
        Ok(self.cluster.state.lock().resources.services.contains_key(&sid))
    }

    async fn start(&self, name: &str, _max_restart: u32) -> Result<()> {
        let sid = self.sid(name)?;
        let mut state = self.cluster.state.lock();
        self.ensure_powered(&state)?;

        let svc = state.services.entry(sid.clone()).or_default();
        if svc.fail_start > 0 {
            svc.fail_start -= 1;
            return Err(HavenError::ServiceFailed {
                sid: sid.to_string(),
                reason: "scripted start failure".to_string(),
            });
        }
        svc.running = true;
        svc.node = Some(self.node.clone());
        Ok(())
    }

    async fn shutdown(&self, name: &str, _timeout: Option<u64>) -> Result<()> {
        let sid = self.sid(name)?;
        let mut state = self.cluster.state.lock();
        self.ensure_powered(&state)?;

        let svc = state.services.entry(sid).or_default();
        if svc.node.as_deref() == Some(self.node.as_str()) {
            svc.running = false;
        }
        Ok(())
    }

    async fn migrate(&self, name: &str, target: &str, online: bool) -> Result<()> {
        let sid = self.sid(name)?;
        let mut state = self.cluster.state.lock();
        self.ensure_powered(&state)?;

        let target_up = state
            .nodes
            .get(target)
            .map(|n| n.powered)
            .unwrap_or(false);
        if !target_up {
            return Err(HavenError::ServiceFailed {
                sid: sid.to_string(),
                reason: format!("migration target '{}' is down", target),
            });
        }

        {
            let svc = state.services.entry(sid.clone()).or_default();
            if svc.fail_migrate > 0 {
                svc.fail_migrate -= 1;
                return Err(HavenError::ServiceFailed {
                    sid: sid.to_string(),
                    reason: "scripted migration failure".to_string(),
                });
            }
        }

        state.resources.set_service_node(&sid, &self.node, target)?;
        let svc = state.services.entry(sid).or_default();
        svc.node = Some(target.to_string());
        if !online {
            svc.running = false;
        }
        Ok(())
    }

    async fn check_running(&self, name: &str) -> Result<bool> {
        let sid = self.sid(name)?;
        let state = self.cluster.state.lock();
        Ok(state
            .services
            .get(&sid)
            .map(|svc| svc.running && svc.node.as_deref() == Some(self.node.as_str()))
            .unwrap_or(false))
    }

    async fn remove_locks(
        &self,
        _name: &str,
        _locks: &[&str],
        _node: &str,
    ) -> Result<Option<String>> {
        Ok(None)
    }

    async fn static_stats(&self, name: &str, _node: &str) -> Result<ServiceStats> {
        let sid = self.sid(name)?;
        Ok(self
            .cluster
            .state
            .lock()
            .services
            .get(&sid)
            .map(|svc| svc.stats)
            .unwrap_or_default())
    }
}
