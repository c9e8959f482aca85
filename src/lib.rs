//! Haven - a cluster-wide high-availability manager for virtualised
//! workloads.
//!
//! Haven keeps a set of declared resources (virtual machines, containers)
//! running exactly once across a pool of nodes. It detects node and
//! service failures, fences unresponsive nodes through a hardware
//! watchdog or fence agents, recovers their services elsewhere, and
//! honours placement policies.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Haven                              │
//! ├─────────────────────────────────────────────────────────────┤
//! │  CRM: master election | service state machine | recovery    │
//! ├─────────────────────────────────────────────────────────────┤
//! │  LRM: agent lock | watchdog | worker pool | result report   │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Cluster: node status | fencing | usage | placement         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Environment: cluster KV | locks | watchdog | simulator     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every node runs one LRM and one CRM candidate. The candidate holding
//! the cluster-wide manager lock owns the authoritative
//! [`types::ManagerStatus`] document and decides recoveries and placement;
//! each LRM executes the work attached to services on its node and reports
//! results keyed by a per-transition uid.
//!
//! # Quick Start
//!
//! ```no_run
//! use haven::config::HavenConfig;
//!
//! #[tokio::main]
//! async fn main() -> haven::Result<()> {
//!     let config = HavenConfig::development("node1");
//!     haven::run(config).await
//! }
//! ```

pub mod cluster;
pub mod config;
pub mod crm;
pub mod env;
pub mod error;
pub mod lrm;
pub mod observability;
pub mod resources;
pub mod types;
pub mod watchdog;

// Re-exports
pub use error::{HavenError, Result};

use crate::config::HavenConfig;
use crate::crm::Crm;
use crate::env::{ClusterEnvironment, Environment};
use crate::lrm::Lrm;
use crate::resources::DriverRegistry;
use std::sync::Arc;
use tracing::{error, info};

/// Run the Haven node: one LRM and one CRM candidate on the production
/// environment.
pub async fn run(config: HavenConfig) -> Result<()> {
    config.validate()?;
    info!(node = %config.node.name, "Starting Haven node");

    let env: Arc<dyn Environment> = Arc::new(ClusterEnvironment::new(&config));
    let registry = DriverRegistry::builtin(&config.drivers);

    let mut lrm = Lrm::new(Arc::clone(&env), Arc::clone(&registry), config.clone());
    let lrm_handle = tokio::spawn(async move { lrm.run().await });

    let mut crm = Crm::new(env, registry, config);
    let crm_handle = tokio::spawn(async move { crm.run().await });

    tokio::select! {
        result = lrm_handle => {
            match result {
                Ok(Ok(())) => info!("LRM finished, shutting down"),
                Ok(Err(e)) => error!(error = %e, "LRM failed"),
                Err(e) => error!(error = %e, "LRM task aborted"),
            }
        }
        result = crm_handle => {
            match result {
                Ok(Ok(())) => info!("CRM finished, shutting down"),
                Ok(Err(e)) => error!(error = %e, "CRM failed"),
                Err(e) => error!(error = %e, "CRM task aborted"),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down");
        }
    }

    Ok(())
}
