//! Configuration module for Haven.
//!
//! Covers the daemon configuration file (node identity, timing, cluster
//! paths, scheduler settings) and the section-file formats stored in the
//! cluster KV: `resources.cfg`, `groups.cfg` and `fence.cfg`.

mod fence;
mod groups;
mod resources;
mod section;

pub use fence::{FenceConfig, FenceDevice};
pub use groups::GroupsConfig;
pub use resources::ResourcesConfig;
pub use section::{parse_sections, render_sections, Section};

use crate::error::{HavenError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration for a Haven node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HavenConfig {
    /// Node configuration.
    pub node: NodeConfig,
    /// Cluster KV and watchdog paths.
    pub cluster: ClusterConfig,
    /// Control loop timing.
    pub timing: TimingConfig,
    /// LRM worker pool settings.
    pub lrm: LrmConfig,
    /// Cluster resource scheduling settings.
    pub crs: CrsConfig,
    /// Fencing mode.
    pub fencing: FencingMode,
    /// Resource driver control programs.
    pub drivers: DriverConfig,
    /// Observability configuration.
    pub observability: ObservabilityConfig,
}

impl HavenConfig {
    /// Load configuration from a file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| HavenError::Config(format!("Failed to read config file: {}", e)))?;

        let config: Self = serde_json::from_str(&content)
            .map_err(|e| HavenError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.node.name.is_empty() {
            return Err(HavenError::InvalidConfig {
                field: "node.name".to_string(),
                reason: "Node name must not be empty".to_string(),
            });
        }

        // The tick must be short against the lock lifetime, otherwise a
        // healthy owner can lose its lock between refreshes.
        if self.timing.tick_interval * 3 >= self.timing.lock_lifetime {
            return Err(HavenError::InvalidConfig {
                field: "timing.tick_interval".to_string(),
                reason: "3 * tick_interval must be below lock_lifetime".to_string(),
            });
        }

        if self.timing.fence_delay < self.timing.tick_interval {
            return Err(HavenError::InvalidConfig {
                field: "timing.fence_delay".to_string(),
                reason: "fence_delay must be at least one tick".to_string(),
            });
        }

        if self.lrm.max_workers == 0 {
            return Err(HavenError::InvalidConfig {
                field: "lrm.max_workers".to_string(),
                reason: "At least one worker is required".to_string(),
            });
        }

        Ok(())
    }

    /// Create a minimal development configuration rooted under `/tmp`.
    pub fn development(node_name: &str) -> Self {
        Self {
            node: NodeConfig {
                name: node_name.to_string(),
            },
            cluster: ClusterConfig {
                base_dir: PathBuf::from("/tmp/haven/cluster"),
                watchdog_socket: PathBuf::from("/tmp/haven/watchdog.sock"),
            },
            ..Default::default()
        }
    }
}

/// Node-specific configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Cluster-unique node name.
    pub name: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "haven-node".to_string(),
        }
    }
}

/// Cluster filesystem and watchdog paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Mount point of the cluster filesystem.
    pub base_dir: PathBuf,
    /// Watchdog multiplexer socket.
    pub watchdog_socket: PathBuf,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("/etc/haven/cluster"),
            watchdog_socket: PathBuf::from("/run/watchdog-mux.sock"),
        }
    }
}

/// Control loop timing parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Target loop period for both CRM and LRM.
    #[serde(with = "humantime_serde")]
    pub tick_interval: Duration,
    /// Absolute lifetime of cluster locks.
    #[serde(with = "humantime_serde")]
    pub lock_lifetime: Duration,
    /// How long a node must be continuously offline before fencing.
    #[serde(with = "humantime_serde")]
    pub fence_delay: Duration,
    /// How long a gone node's entry is kept before deletion.
    #[serde(with = "humantime_serde")]
    pub gone_node_expiry: Duration,
    /// Iterations longer than this are logged.
    #[serde(with = "humantime_serde")]
    pub loop_warn_threshold: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(10),
            lock_lifetime: Duration::from_secs(120),
            fence_delay: Duration::from_secs(60),
            gone_node_expiry: Duration::from_secs(3600),
            loop_warn_threshold: Duration::from_secs(30),
        }
    }
}

impl TimingConfig {
    pub fn fence_delay_secs(&self) -> u64 {
        self.fence_delay.as_secs()
    }

    pub fn gone_node_expiry_secs(&self) -> u64 {
        self.gone_node_expiry.as_secs()
    }
}

/// LRM worker pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LrmConfig {
    /// Maximum concurrent resource workers.
    pub max_workers: usize,
    /// Wall-clock bound on a single worker invocation.
    #[serde(with = "humantime_serde")]
    pub worker_timeout: Duration,
    /// Stop timeout requested for services during a host shutdown.
    #[serde(with = "humantime_serde")]
    pub shutdown_stop_timeout: Duration,
}

impl Default for LrmConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            worker_timeout: Duration::from_secs(300),
            shutdown_stop_timeout: Duration::from_secs(60),
        }
    }
}

/// Node scoring backend for placement decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerMode {
    /// Score nodes by the number of services accounted to them.
    #[default]
    Basic,
    /// Score nodes by CPU/memory utilisation from static service stats.
    Static,
}

/// Cluster resource scheduling settings (datacenter-wide, may change at
/// runtime).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrsConfig {
    #[serde(default)]
    pub scheduler: SchedulerMode,
    /// Let the scheduler pick a better node when a service is started.
    #[serde(default)]
    pub rebalance_on_request_start: bool,
}

/// How unresponsive nodes are fenced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FencingMode {
    /// Rely on the hardware watchdog; stealing the agent lock proves the
    /// node rebooted or cannot act.
    #[default]
    Watchdog,
    /// Additionally run the configured fence devices.
    Hardware,
}

/// Control programs invoked by the exec-backed resource drivers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Control program for `vm` resources.
    pub vm_control: String,
    /// Control program for `ct` resources.
    pub ct_control: String,
    /// Directory holding per-service configuration files.
    pub config_dir: PathBuf,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            vm_control: "vmctl".to_string(),
            ct_control: "ctctl".to_string(),
            config_dir: PathBuf::from("/etc/haven/services"),
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Default log filter when `RUST_LOG` is unset.
    pub log_level: String,
    /// Emit JSON log lines.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = HavenConfig::development("n1");
        config.validate().unwrap();
    }

    #[test]
    fn test_tick_must_fit_lock_lifetime() {
        let mut config = HavenConfig::development("n1");
        config.timing.tick_interval = Duration::from_secs(60);
        let err = config.validate().unwrap_err();
        assert!(matches!(err, HavenError::InvalidConfig { .. }));
    }

    #[test]
    fn test_empty_node_name_rejected() {
        let mut config = HavenConfig::development("n1");
        config.node.name.clear();
        assert!(config.validate().is_err());
    }
}
