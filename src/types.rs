//! Core type definitions for the Haven HA manager.
//!
//! This module contains the fundamental data types shared by the CRM and
//! LRM control loops, including service identifiers, per-service and
//! per-node state machines, and the two status documents exchanged through
//! the cluster KV.
//!
//! # Key Types
//!
//! - [`ServiceId`]: Typed `<type>:<name>` service identifier
//! - [`ManagerStatus`]: The CRM-owned authoritative status document
//! - [`LrmStatus`]: The per-node LRM status document
//! - [`ServiceState`] / [`NodeState`]: The two central state machines

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::HavenError;

/// Worker exit code: operation succeeded.
pub const EXIT_SUCCESS: i32 = 0;
/// Worker exit code: operation failed.
pub const EXIT_ERROR: i32 = 1;
/// Worker exit code: the service configuration lives on another node.
pub const EXIT_WRONG_NODE: i32 = 2;
/// Worker exit code: nothing to do (e.g. balance-start of a running service).
pub const EXIT_IGNORED: i32 = 3;

/// Unique identifier for a managed service, of the form `<type>:<name>`.
///
/// The `<type>` part selects a resource driver (e.g. `vm`, `ct`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ServiceId {
    kind: String,
    name: String,
}

impl ServiceId {
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> crate::Result<Self> {
        let kind = kind.into();
        let name = name.into();
        if kind.is_empty() || name.is_empty() || kind.contains(':') || name.contains(':') {
            return Err(HavenError::InvalidServiceId(format!("{}:{}", kind, name)));
        }
        Ok(Self { kind, name })
    }

    /// The resource type selecting the driver, e.g. `vm`.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// The driver-scoped service name, e.g. `100`.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl FromStr for ServiceId {
    type Err = HavenError;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.split_once(':') {
            Some((kind, name)) => Self::new(kind, name),
            None => Err(HavenError::InvalidServiceId(s.to_string())),
        }
    }
}

impl TryFrom<String> for ServiceId {
    type Error = HavenError;

    fn try_from(s: String) -> crate::Result<Self> {
        s.parse()
    }
}

impl From<ServiceId> for String {
    fn from(sid: ServiceId) -> Self {
        sid.to_string()
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.name)
    }
}

/// Requested service state from the resource configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestState {
    /// Keep the service running somewhere (`enabled` is a legacy alias).
    #[serde(alias = "enabled")]
    Started,
    /// Keep the service stopped but managed.
    Stopped,
    /// Stop the service and leave it alone until re-enabled.
    Disabled,
    /// Remove the service from CRM/LRM control entirely.
    Ignored,
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RequestState::Started => "started",
            RequestState::Stopped => "stopped",
            RequestState::Disabled => "disabled",
            RequestState::Ignored => "ignored",
        };
        f.write_str(s)
    }
}

/// Per-service configuration (`cd` in the control loops).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Home node of the service configuration.
    pub node: String,
    /// Requested state.
    #[serde(default = "default_request_state")]
    pub state: RequestState,
    /// Placement group, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    /// Move the service back to higher-priority nodes when they return.
    #[serde(default = "default_true")]
    pub failback: bool,
    /// Local start retries before the driver reports an error (lower bound).
    #[serde(default = "default_one")]
    pub max_restart: u32,
    /// Relocation attempts after start failures before giving up.
    #[serde(default = "default_one")]
    pub max_relocate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

fn default_request_state() -> RequestState {
    RequestState::Started
}

fn default_true() -> bool {
    true
}

fn default_one() -> u32 {
    1
}

/// A placement group: member nodes with priorities and placement flags.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Group {
    /// Member nodes mapped to their priority. Higher priority wins.
    pub nodes: BTreeMap<String, u32>,
    /// Services may only run on member nodes.
    #[serde(default)]
    pub restricted: bool,
    /// Do not move services back when a higher-priority node returns.
    #[serde(default)]
    pub nofailback: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

/// CRM-side per-service state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    Stopped,
    RequestStop,
    RequestStart,
    RequestStartBalance,
    Started,
    Fence,
    Recovery,
    Migrate,
    Relocate,
    Freeze,
    Error,
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServiceState::Stopped => "stopped",
            ServiceState::RequestStop => "request_stop",
            ServiceState::RequestStart => "request_start",
            ServiceState::RequestStartBalance => "request_start_balance",
            ServiceState::Started => "started",
            ServiceState::Fence => "fence",
            ServiceState::Recovery => "recovery",
            ServiceState::Migrate => "migrate",
            ServiceState::Relocate => "relocate",
            ServiceState::Freeze => "freeze",
            ServiceState::Error => "error",
        };
        f.write_str(s)
    }
}

/// A command attached to a service record by the CRM command queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verb", rename_all = "lowercase")]
pub enum ServiceCommand {
    Migrate { target: String },
    Relocate { target: String },
    Stop { timeout: u64 },
}

/// Per-service record inside [`ManagerStatus`] (`sd` in the control loops).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub state: ServiceState,
    /// Node currently responsible for the service.
    pub node: String,
    /// Migration/relocation target while a move is in flight.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Queued command, consumed by the state machine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<ServiceCommand>,
    /// Per-transition token; the LRM echoes it in results.
    pub uid: String,
    /// Nodes where a start attempt failed since the last success.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed_nodes: Vec<String>,
    /// Fallback node recorded when the home node entered maintenance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maintenance_node: Option<String>,
    /// Last confirmed runtime state reported by the LRM.
    #[serde(default)]
    pub running: bool,
    /// Stop timeout in seconds, carried from a `stop` command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

impl ServiceStatus {
    /// Create a fresh record for a newly managed service.
    pub fn new(state: ServiceState, node: impl Into<String>) -> Self {
        Self {
            state,
            node: node.into(),
            target: None,
            cmd: None,
            uid: fresh_uid(),
            failed_nodes: Vec::new(),
            maintenance_node: None,
            running: false,
            timeout: None,
        }
    }

    /// Move the record to `node` as part of recovery from a fenced node.
    ///
    /// This is the only place outside the regular transition table that may
    /// rewrite `node`.
    pub fn recover_to(&mut self, node: impl Into<String>) {
        self.node = node.into();
        self.target = None;
        self.uid = fresh_uid();
    }

    /// Verbose state string combining CRM state, runtime flag and request.
    pub fn verbose_state(&self, cd: Option<&ServiceConfig>) -> String {
        let mut out = self.state.to_string();
        if self.state == ServiceState::Started && !self.running {
            out.push_str(" (starting)");
        }
        if let Some(cd) = cd {
            match (cd.state, self.state) {
                (RequestState::Disabled, ServiceState::Stopped) => out.push_str(" (disabled)"),
                (RequestState::Stopped, ServiceState::Started) => out.push_str(" (stopping)"),
                _ => {}
            }
        }
        out
    }
}

/// Per-node state as tracked by the CRM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    Online,
    Maintenance,
    Unknown,
    Fence,
    Gone,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeState::Online => "online",
            NodeState::Maintenance => "maintenance",
            NodeState::Unknown => "unknown",
            NodeState::Fence => "fence",
            NodeState::Gone => "gone",
        };
        f.write_str(s)
    }
}

/// Admin requests recorded against a node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeRequest {
    #[serde(default)]
    pub maintenance: bool,
}

/// The authoritative cluster-wide status document, owned by the CRM master.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManagerStatus {
    #[serde(default)]
    pub master_node: String,
    #[serde(default)]
    pub timestamp: u64,
    #[serde(default)]
    pub node_status: BTreeMap<String, NodeState>,
    #[serde(default)]
    pub service_status: BTreeMap<ServiceId, ServiceStatus>,
    #[serde(default)]
    pub node_request: BTreeMap<String, NodeRequest>,
}

/// LRM operating mode, derived from admin requests and host shutdown state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LrmMode {
    Active,
    Maintenance,
    Restart,
    Shutdown,
}

impl fmt::Display for LrmMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LrmMode::Active => "active",
            LrmMode::Maintenance => "maintenance",
            LrmMode::Restart => "restart",
            LrmMode::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

/// LRM agent-lock state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LrmState {
    WaitForAgentLock,
    Active,
    LostAgentLock,
}

/// Result of one LRM worker invocation, keyed by the transition uid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerResult {
    pub sid: ServiceId,
    pub exit_code: i32,
}

/// Per-node status document written by the LRM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LrmStatus {
    pub mode: LrmMode,
    pub state: LrmState,
    #[serde(default)]
    pub timestamp: u64,
    #[serde(default)]
    pub results: HashMap<String, WorkerResult>,
}

impl Default for LrmStatus {
    fn default() -> Self {
        Self {
            mode: LrmMode::Active,
            state: LrmState::WaitForAgentLock,
            timestamp: 0,
            results: HashMap::new(),
        }
    }
}

/// One entry of the cluster membership view.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeInfo {
    pub online: bool,
}

/// Static capacity of a node, used by the static usage scheduler.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct NodeStats {
    /// Usable CPU cores (possibly fractional after overcommit weighting).
    pub cpus: f64,
    /// Usable memory in bytes.
    pub memory: u64,
}

/// Static footprint of a service, provided by its resource driver.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ServiceStats {
    pub maxcpu: f64,
    pub maxmem: u64,
}

/// Mint a fresh per-transition token.
pub fn fresh_uid() -> String {
    Uuid::new_v4().to_string()
}

/// Name of the cluster-wide manager lock electing the CRM master.
pub fn manager_lock_name() -> &'static str {
    "ha_manager_lock"
}

/// Name of the per-node agent lock electing one LRM and acting as the
/// fence token.
pub fn agent_lock_name(node: &str) -> String {
    format!("ha_agent_{}_lock", node)
}
