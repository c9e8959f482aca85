//! Cluster Resource Manager: master election and the manager loop.
//!
//! Every node runs one CRM candidate. The candidate that holds the
//! cluster-wide manager lock is the master and runs [`Manager::manage`]
//! each tick; all others keep trying to take the lock over. Losing the
//! lock or quorum demotes the master immediately, before any further
//! status write.

mod commands;
mod manager;
mod transitions;

pub use commands::CrmCommand;
pub use manager::Manager;

use crate::config::HavenConfig;
use crate::env::Environment;
use crate::error::Result;
use crate::resources::DriverRegistry;
use crate::types::manager_lock_name;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Election state of this CRM candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrmState {
    /// The local partition has no quorum; nothing may be done.
    WaitForQuorum,
    /// Quorate but another node holds the manager lock.
    Slave,
    /// Holding the manager lock and running the manager.
    Master,
}

/// One CRM candidate loop.
pub struct Crm {
    env: Arc<dyn Environment>,
    registry: Arc<DriverRegistry>,
    config: HavenConfig,
    state: CrmState,
    manager: Option<Manager>,
}

impl Crm {
    pub fn new(
        env: Arc<dyn Environment>,
        registry: Arc<DriverRegistry>,
        config: HavenConfig,
    ) -> Self {
        Self {
            env,
            registry,
            config,
            state: CrmState::WaitForQuorum,
            manager: None,
        }
    }

    pub fn state(&self) -> CrmState {
        self.state
    }

    /// Access the manager while master (primarily for tests and status
    /// introspection).
    pub fn manager(&self) -> Option<&Manager> {
        self.manager.as_ref()
    }

    /// Run the periodic loop until a fatal error occurs.
    pub async fn run(&mut self) -> Result<()> {
        info!(node = %self.env.node_name(), "CRM starting");
        loop {
            if let Err(e) = self.do_one_iteration().await {
                if e.is_retryable() {
                    warn!(error = %e, "CRM iteration failed, retrying next tick");
                } else {
                    error!(error = %e, "CRM iteration failed fatally");
                    return Err(e);
                }
            }
            self.env.sleep(self.config.timing.tick_interval).await;
        }
    }

    /// Run a single election + manage step.
    pub async fn do_one_iteration(&mut self) -> Result<()> {
        if !self.env.quorate().await {
            if self.state != CrmState::WaitForQuorum {
                warn!("Lost quorum, stopping all manager activity");
                self.manager = None;
                self.state = CrmState::WaitForQuorum;
            }
            return Ok(());
        }

        if self.state == CrmState::WaitForQuorum {
            info!("Quorum established, joining election");
            self.state = CrmState::Slave;
        }

        let have_lock = self.env.acquire_lock(manager_lock_name()).await;
        match (self.state, have_lock) {
            (CrmState::Slave, true) => {
                info!("Acquired manager lock, promoting to master");
                self.manager = Some(
                    Manager::new(
                        Arc::clone(&self.env),
                        Arc::clone(&self.registry),
                        &self.config,
                    )
                    .await?,
                );
                self.state = CrmState::Master;
            }
            (CrmState::Master, false) => {
                // Authority is gone: abort before any status write.
                error!("Failed to refresh manager lock, demoting");
                self.manager = None;
                self.state = CrmState::Slave;
                return Ok(());
            }
            _ => {}
        }

        if self.state == CrmState::Master {
            if let Some(manager) = self.manager.as_mut() {
                manager.manage().await?;
            }
        }
        Ok(())
    }
}
