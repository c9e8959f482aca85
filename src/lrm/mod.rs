//! Local Resource Manager: executes service work on one node.
//!
//! The LRM holds its node's agent lock and keeps the hardware watchdog
//! armed while it does. Work items are read from the manager status,
//! executed against the resource drivers by a bounded worker pool, and the
//! exit codes are reported back keyed by the transition uid.
//!
//! Losing the agent lock while services run means losing the authority to
//! run them: the watchdog is deliberately left un-pinged so the node
//! self-fences, which is what allows the CRM to recover the services
//! elsewhere.

use crate::config::HavenConfig;
use crate::env::{Environment, HostShutdown};
use crate::error::Result;
use crate::resources::{DriverRegistry, ResourceDriver};
use crate::types::{
    agent_lock_name, LrmMode, LrmState, LrmStatus, ManagerStatus, ServiceId, ServiceState,
    ServiceStatus, WorkerResult, EXIT_ERROR, EXIT_IGNORED, EXIT_SUCCESS, EXIT_WRONG_NODE,
};
use metrics::{counter, gauge};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Work a single worker performs for one service transition.
#[derive(Debug, Clone, PartialEq, Eq)]
enum WorkItem {
    Start { max_restart: u32 },
    Stop { timeout: Option<u64> },
    Move { target: String, online: bool },
    BalanceMove { target: String },
}

struct WorkerOutcome {
    sid: ServiceId,
    uid: String,
    exit_code: i32,
}

/// The per-node LRM loop.
pub struct Lrm {
    env: Arc<dyn Environment>,
    registry: Arc<DriverRegistry>,
    config: HavenConfig,
    state: LrmState,
    mode: LrmMode,
    results: HashMap<String, WorkerResult>,
    workers: JoinSet<WorkerOutcome>,
    active_workers: HashMap<ServiceId, String>,
    shutdown_stops_queued: bool,
}

impl Lrm {
    pub fn new(
        env: Arc<dyn Environment>,
        registry: Arc<DriverRegistry>,
        config: HavenConfig,
    ) -> Self {
        Self {
            env,
            registry,
            config,
            state: LrmState::WaitForAgentLock,
            mode: LrmMode::Active,
            results: HashMap::new(),
            workers: JoinSet::new(),
            active_workers: HashMap::new(),
            shutdown_stops_queued: false,
        }
    }

    pub fn state(&self) -> LrmState {
        self.state
    }

    pub fn mode(&self) -> LrmMode {
        self.mode
    }

    /// Run the periodic loop until shutdown completes or a fatal error
    /// occurs.
    pub async fn run(&mut self) -> Result<()> {
        info!(node = %self.env.node_name(), "LRM starting");
        loop {
            match self.do_one_iteration().await {
                Ok(true) => {}
                Ok(false) => return Ok(()),
                Err(e) if e.is_retryable() => {
                    warn!(error = %e, "LRM iteration failed, retrying next tick");
                }
                Err(e) => {
                    error!(error = %e, "LRM iteration failed fatally");
                    return Err(e);
                }
            }
            self.env.sleep(self.config.timing.tick_interval).await;
        }
    }

    /// Run a single LRM step. Returns false once the loop should end
    /// (host shutdown or daemon restart).
    pub async fn do_one_iteration(&mut self) -> Result<bool> {
        let now = self.env.now().await;
        self.reap_workers();

        let manager_status = self.env.read_manager_status().await?;
        let resources = self.env.load_resources().await?;

        self.update_mode(&manager_status).await;

        let local = self.env.node_name().to_string();
        let owned: Vec<(ServiceId, ServiceStatus)> = manager_status
            .service_status
            .iter()
            .filter(|(_, sd)| sd.node == local)
            .map(|(sid, sd)| (sid.clone(), sd.clone()))
            .collect();

        self.update_agent_lock(&local, &owned).await?;

        if self.state == LrmState::Active {
            self.dispatch_work(&owned, &resources).await;
        }

        self.write_status(&manager_status, now).await?;

        gauge!("haven_lrm_active_workers").set(self.workers.len() as f64);

        match self.mode {
            LrmMode::Shutdown => self.handle_shutdown(&owned).await,
            LrmMode::Restart => self.handle_restart(&owned).await,
            _ => Ok(true),
        }
    }

    /// Derive the operating mode from host shutdown state and admin
    /// requests.
    async fn update_mode(&mut self, manager_status: &ManagerStatus) {
        let new_mode = match self.env.shutdown_request().await {
            HostShutdown::Reboot => LrmMode::Restart,
            HostShutdown::Shutdown => LrmMode::Shutdown,
            HostShutdown::None => {
                let maintenance = manager_status
                    .node_request
                    .get(self.env.node_name())
                    .map(|r| r.maintenance)
                    .unwrap_or(false);
                if maintenance {
                    LrmMode::Maintenance
                } else {
                    LrmMode::Active
                }
            }
        };

        if new_mode != self.mode {
            info!(from = %self.mode, to = %new_mode, "LRM mode change");
            self.mode = new_mode;
            if self.mode != LrmMode::Shutdown {
                self.shutdown_stops_queued = false;
            }
        }
    }

    /// Maintain the agent lock and the coupled watchdog.
    async fn update_agent_lock(
        &mut self,
        local: &str,
        owned: &[(ServiceId, ServiceStatus)],
    ) -> Result<()> {
        let lock_name = agent_lock_name(local);
        let wants_lock = !owned.is_empty() || !self.active_workers.is_empty();

        match self.state {
            LrmState::WaitForAgentLock => {
                if wants_lock && self.env.quorate().await {
                    if self.env.acquire_lock(&lock_name).await {
                        info!("Acquired agent lock");
                        self.env.watchdog_open().await?;
                        self.state = LrmState::Active;
                    } else {
                        info!("Waiting for agent lock");
                    }
                }
            }
            LrmState::Active => {
                let refreshed =
                    self.env.quorate().await && self.env.acquire_lock(&lock_name).await;
                if refreshed {
                    if !self.env.watchdog_update().await {
                        warn!("Watchdog update failed, node may self-fence");
                    }
                } else if self.services_running(owned) {
                    // Authority is gone while services run: leave the
                    // watchdog armed so the node self-fences.
                    error!("Lost agent lock with running services, awaiting self-fence");
                    self.state = LrmState::LostAgentLock;
                } else {
                    warn!("Lost agent lock, disarming watchdog");
                    self.env.watchdog_close(true).await;
                    self.state = LrmState::WaitForAgentLock;
                }
            }
            LrmState::LostAgentLock => {
                if self.env.quorate().await && self.env.acquire_lock(&lock_name).await {
                    info!("Re-acquired agent lock");
                    self.state = LrmState::Active;
                }
            }
        }
        Ok(())
    }

    fn services_running(&self, owned: &[(ServiceId, ServiceStatus)]) -> bool {
        !self.active_workers.is_empty()
            || owned.iter().any(|(_, sd)| {
                sd.running
                    || matches!(
                        sd.state,
                        ServiceState::Started
                            | ServiceState::Migrate
                            | ServiceState::Relocate
                            | ServiceState::RequestStop
                    )
            })
    }

    /// Spawn workers for every owned service whose state calls for local
    /// work, bounded by the worker pool size.
    async fn dispatch_work(
        &mut self,
        owned: &[(ServiceId, ServiceStatus)],
        resources: &crate::config::ResourcesConfig,
    ) {
        let local = self.env.node_name().to_string();

        for (sid, sd) in owned {
            if self.results.contains_key(&sd.uid) {
                continue;
            }
            if let Some(active_uid) = self.active_workers.get(sid) {
                // One worker per service; a stale worker must finish
                // before the new transition runs.
                if *active_uid != sd.uid {
                    debug!(sid = %sid, "Previous worker still running");
                }
                continue;
            }

            let item = match &sd.state {
                ServiceState::Started => {
                    let max_restart = resources
                        .services
                        .get(sid)
                        .map(|cd| cd.max_restart)
                        .unwrap_or(1);
                    WorkItem::Start { max_restart }
                }
                ServiceState::RequestStop => WorkItem::Stop { timeout: sd.timeout },
                ServiceState::Migrate => match &sd.target {
                    Some(target) => WorkItem::Move {
                        target: target.clone(),
                        online: true,
                    },
                    None => continue,
                },
                ServiceState::Relocate => match &sd.target {
                    Some(target) => WorkItem::Move {
                        target: target.clone(),
                        online: false,
                    },
                    None => continue,
                },
                ServiceState::RequestStartBalance => match &sd.target {
                    Some(target) => WorkItem::BalanceMove {
                        target: target.clone(),
                    },
                    None => continue,
                },
                _ => continue,
            };

            // The service configuration moved away (e.g. it was stolen
            // during recovery): report instead of acting on it.
            match resources.services.get(sid) {
                Some(cd) if cd.node != local => {
                    warn!(sid = %sid, config_node = %cd.node,
                        "Service configuration is on another node");
                    self.record_result(sid.clone(), sd.uid.clone(), EXIT_WRONG_NODE);
                    continue;
                }
                Some(_) => {}
                None => {
                    debug!(sid = %sid, "Service configuration gone, skipping work");
                    continue;
                }
            }

            if self.workers.len() >= self.config.lrm.max_workers {
                debug!(sid = %sid, "Worker pool exhausted, deferring work");
                continue;
            }

            let driver = self.registry.get(sid.kind()).cloned();
            let Some(driver) = driver else {
                error!(sid = %sid, "No driver for service type");
                self.record_result(sid.clone(), sd.uid.clone(), EXIT_ERROR);
                continue;
            };

            debug!(sid = %sid, uid = %sd.uid, work = ?item, "Spawning worker");
            self.active_workers.insert(sid.clone(), sd.uid.clone());
            let sid = sid.clone();
            let uid = sd.uid.clone();
            let timeout = self.config.lrm.worker_timeout;
            self.workers.spawn(async move {
                let exit_code = run_worker(driver, &sid, item, timeout).await;
                WorkerOutcome {
                    sid,
                    uid,
                    exit_code,
                }
            });
        }
    }

    /// Wait for every outstanding worker and record its result. Used by
    /// the shutdown paths and by deterministic tests.
    pub async fn drain_workers(&mut self) {
        while let Some(joined) = self.workers.join_next().await {
            match joined {
                Ok(outcome) => {
                    self.record_result(outcome.sid, outcome.uid, outcome.exit_code);
                }
                Err(e) => error!(error = %e, "Worker task failed"),
            }
        }
    }

    /// Collect finished workers without blocking.
    fn reap_workers(&mut self) {
        while let Some(joined) = self.workers.try_join_next() {
            match joined {
                Ok(outcome) => {
                    debug!(
                        sid = %outcome.sid,
                        uid = %outcome.uid,
                        exit_code = outcome.exit_code,
                        "Worker finished"
                    );
                    self.record_result(outcome.sid, outcome.uid, outcome.exit_code);
                }
                Err(e) => {
                    // A panicked worker loses its result; the CRM will
                    // re-request the transition.
                    error!(error = %e, "Worker task failed");
                }
            }
        }
    }

    fn record_result(&mut self, sid: ServiceId, uid: String, exit_code: i32) {
        counter!("haven_lrm_results_total").increment(1);
        self.active_workers.remove(&sid);
        self.results.insert(uid, WorkerResult { sid, exit_code });
    }

    /// Write the LRM status document, pruning results whose transition the
    /// manager has already moved past.
    async fn write_status(&mut self, manager_status: &ManagerStatus, now: u64) -> Result<()> {
        self.results.retain(|uid, _| {
            manager_status
                .service_status
                .values()
                .any(|sd| sd.uid == *uid)
        });

        let status = LrmStatus {
            mode: self.mode,
            state: self.state,
            timestamp: now,
            results: self.results.clone(),
        };
        self.env.write_lrm_status(&status).await
    }

    /// Host shutdown: request graceful stops, then wind down once nothing
    /// is left running.
    async fn handle_shutdown(&mut self, owned: &[(ServiceId, ServiceStatus)]) -> Result<bool> {
        if !self.shutdown_stops_queued {
            let timeout = self.config.lrm.shutdown_stop_timeout.as_secs();
            for (sid, sd) in owned {
                if matches!(sd.state, ServiceState::Started | ServiceState::Migrate
                    | ServiceState::Relocate | ServiceState::RequestStartBalance)
                {
                    info!(sid = %sid, timeout, "Requesting stop for host shutdown");
                    self.env
                        .queue_crm_command(&format!("stop {} {}", sid, timeout))
                        .await?;
                }
            }
            self.shutdown_stops_queued = true;
        }

        let still_busy = owned
            .iter()
            .any(|(_, sd)| !matches!(sd.state, ServiceState::Stopped | ServiceState::Error));
        if still_busy || !self.active_workers.is_empty() {
            return Ok(true);
        }

        info!("All services stopped, completing LRM shutdown");
        if self.state == LrmState::Active {
            self.env
                .release_lock(&agent_lock_name(self.env.node_name()))
                .await;
            self.env.watchdog_close(true).await;
        }
        Ok(false)
    }

    /// Daemon restart (host reboot or package upgrade): wait for the CRM
    /// to freeze our services, keep the agent lock so no fencing starts,
    /// and disarm the watchdog for the short gap.
    async fn handle_restart(&mut self, owned: &[(ServiceId, ServiceStatus)]) -> Result<bool> {
        let all_frozen = owned.iter().all(|(_, sd)| {
            matches!(
                sd.state,
                ServiceState::Freeze | ServiceState::Stopped | ServiceState::Error
            )
        });
        if !all_frozen || !self.active_workers.is_empty() {
            return Ok(true);
        }

        info!("Services frozen, stopping LRM for restart");
        if self.state == LrmState::Active {
            self.env.watchdog_close(true).await;
        }
        Ok(false)
    }
}

/// Execute one work item against the resource driver.
async fn execute_item(
    driver: &Arc<dyn ResourceDriver>,
    name: &str,
    item: WorkItem,
) -> Result<i32> {
    match item {
        WorkItem::Start { max_restart } => {
            if driver.check_running(name).await? {
                return Ok(EXIT_SUCCESS);
            }
            driver.start(name, max_restart).await?;
            Ok(EXIT_SUCCESS)
        }
        WorkItem::Stop { timeout } => {
            driver.shutdown(name, timeout).await?;
            Ok(EXIT_SUCCESS)
        }
        WorkItem::Move { target, online } => {
            driver.migrate(name, &target, online).await?;
            Ok(EXIT_SUCCESS)
        }
        WorkItem::BalanceMove { target } => {
            if driver.check_running(name).await? {
                return Ok(EXIT_IGNORED);
            }
            driver.migrate(name, &target, false).await?;
            Ok(EXIT_SUCCESS)
        }
    }
}

/// Run one work item with a wall-clock bound, mapping the result onto the
/// shared exit-code contract.
async fn run_worker(
    driver: Arc<dyn ResourceDriver>,
    sid: &ServiceId,
    item: WorkItem,
    timeout: Duration,
) -> i32 {
    let name = sid.name().to_string();

    match tokio::time::timeout(timeout, execute_item(&driver, &name, item)).await {
        Ok(Ok(code)) => code,
        Ok(Err(e)) => {
            warn!(sid = %sid, error = %e, "Worker failed");
            EXIT_ERROR
        }
        Err(_) => {
            warn!(sid = %sid, "Worker timed out");
            EXIT_ERROR
        }
    }
}
