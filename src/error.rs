//! Error types for the Haven HA manager.
//!
//! This module provides a unified error type [`HavenError`] for all Haven
//! operations, along with a convenient [`Result`] type alias.
//!
//! # Error Categories
//!
//! - **Lock/Quorum**: Manager or agent lock loss, missing quorum
//! - **Cluster KV**: Read/write failures against the cluster filesystem
//! - **Config**: Invalid resources, groups, fence or daemon configuration
//! - **Service**: Resource driver and worker failures
//! - **Fence**: Fence agent execution failures
//! - **Watchdog**: Watchdog multiplexer socket failures

use std::io;
use thiserror::Error;

/// Main error type for Haven operations.
#[derive(Error, Debug)]
pub enum HavenError {
    // Lock and quorum errors
    #[error("Lock lost: {0}")]
    LockLost(String),

    #[error("No quorum in local partition")]
    NoQuorum,

    #[error("Not the manager. Manager is: {manager:?}")]
    NotManager { manager: Option<String> },

    // Cluster KV errors
    #[error("Cluster read failed: {path}: {reason}")]
    ClusterRead { path: String, reason: String },

    #[error("Cluster write failed: {path}: {reason}")]
    ClusterWrite { path: String, reason: String },

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    #[error("Invalid service id: {0}")]
    InvalidServiceId(String),

    #[error("Unknown resource type: {0}")]
    UnknownResourceType(String),

    // Service errors
    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error("Service operation failed: {sid}: {reason}")]
    ServiceFailed { sid: String, reason: String },

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    // Fence errors
    #[error("Fence agent failed: {agent}: {reason}")]
    FenceAgent { agent: String, reason: String },

    #[error("Fencing failed for node: {0}")]
    FenceFailed(String),

    // Watchdog errors
    #[error("Watchdog error: {0}")]
    Watchdog(String),

    // Conflicts
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Request timeout after {0}ms")]
    Timeout(u64),

    // External errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl HavenError {
    /// Check if error is retryable on the next loop iteration.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            HavenError::NoQuorum
                | HavenError::ClusterRead { .. }
                | HavenError::ClusterWrite { .. }
                | HavenError::Timeout(_)
                | HavenError::NotManager { .. }
        )
    }
}

impl From<serde_json::Error> for HavenError {
    fn from(e: serde_json::Error) -> Self {
        HavenError::Serialization(e.to_string())
    }
}

/// Result type alias for Haven operations.
pub type Result<T> = std::result::Result<T, HavenError>;
