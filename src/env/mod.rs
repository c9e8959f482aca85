//! Environment abstraction for the HA control loops.
//!
//! Everything the CRM and LRM touch outside their own process goes through
//! the [`Environment`] trait: time, quorum, cluster KV documents, named
//! locks, the watchdog, fence agents and notifications. This is the seam
//! that lets the production back-end and the deterministic simulator
//! coexist; the loops themselves cannot tell which one they run on.

mod cluster;
pub mod sim;

pub use cluster::ClusterEnvironment;

use crate::config::{CrsConfig, FenceDevice, GroupsConfig, ResourcesConfig};
use crate::error::Result;
use crate::types::{LrmStatus, ManagerStatus, NodeInfo, NodeStats, ServiceId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Host shutdown state as observed by the LRM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostShutdown {
    /// No shutdown in progress.
    None,
    /// The host is powering off.
    Shutdown,
    /// The host is rebooting.
    Reboot,
}

/// Fencing notification status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FenceStatus {
    /// Fencing of the node has started.
    Fence,
    /// Fencing of the node completed.
    Succeed,
}

/// Payload handed to the external notification system when a node is
/// fenced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FenceNotification {
    #[serde(rename = "fence-status")]
    pub status: FenceStatus,
    #[serde(rename = "failed-node")]
    pub node: String,
    #[serde(rename = "master-node")]
    pub master_node: String,
    #[serde(rename = "fence-timestamp")]
    pub timestamp: u64,
    /// All cluster nodes at the time of the event.
    pub nodes: Vec<String>,
    /// Services located on the failed node.
    pub resources: Vec<ServiceId>,
}

/// Uniform interface over the cluster runtime.
///
/// Named locks have an absolute lifetime enforced by the back-end:
/// `acquire_lock` both acquires and refreshes, and a lock whose owner has
/// not refreshed within the lifetime may be taken over by any other caller.
#[async_trait]
pub trait Environment: Send + Sync {
    /// Name of the local node.
    fn node_name(&self) -> &str;

    /// Current time in epoch seconds (virtual in the simulator).
    async fn now(&self) -> u64;

    /// Sleep between loop iterations (advances virtual time in the
    /// simulator).
    async fn sleep(&self, duration: Duration);

    /// Whether the local node is in the quorate partition.
    async fn quorate(&self) -> bool;

    /// Current cluster membership view.
    async fn membership(&self) -> Result<BTreeMap<String, NodeInfo>>;

    async fn read_manager_status(&self) -> Result<ManagerStatus>;

    /// Write the manager status document. Only the lock-holding CRM may
    /// call this.
    async fn write_manager_status(&self, status: &ManagerStatus) -> Result<()>;

    async fn read_lrm_status(&self, node: &str) -> Result<LrmStatus>;

    /// Write the local node's LRM status document.
    async fn write_lrm_status(&self, status: &LrmStatus) -> Result<()>;

    /// Drain the CRM command queue.
    async fn read_crm_commands(&self) -> Result<Vec<String>>;

    /// Append a command to the CRM command queue.
    async fn queue_crm_command(&self, command: &str) -> Result<()>;

    async fn load_resources(&self) -> Result<ResourcesConfig>;
    async fn load_groups(&self) -> Result<GroupsConfig>;
    async fn load_fence_config(&self) -> Result<crate::config::FenceConfig>;

    /// Datacenter-wide scheduling settings; may change between iterations.
    async fn load_crs_config(&self) -> Result<CrsConfig>;

    /// Acquire or refresh a named cluster lock for the local node.
    async fn acquire_lock(&self, name: &str) -> bool;

    /// Best-effort release; back-end expiry is the source of truth.
    async fn release_lock(&self, name: &str);

    /// Move a service declaration from `from` to `to` under manager-lock
    /// authority. This is the recovery path's config mutation.
    async fn steal_service(&self, sid: &ServiceId, from: &str, to: &str) -> Result<()>;

    async fn watchdog_open(&self) -> Result<()>;

    /// Ping the watchdog. Returns false when the update did not reach the
    /// multiplexer, in which case the node will reboot within the hardware
    /// timeout.
    async fn watchdog_update(&self) -> bool;

    /// Close the watchdog. A graceful close disarms it; a non-graceful
    /// close leaves it armed so the node self-fences.
    async fn watchdog_close(&self, graceful: bool);

    /// Run one fence agent against a node; returns the agent exit code.
    async fn exec_fence_agent(&self, device: &FenceDevice, node: &str) -> Result<i32>;

    async fn send_fence_notification(&self, notification: &FenceNotification) -> Result<()>;

    /// Static per-node capacity for the static usage scheduler.
    async fn node_stats(&self) -> Result<BTreeMap<String, NodeStats>>;

    /// Whether the host is shutting down or rebooting.
    async fn shutdown_request(&self) -> HostShutdown;
}
