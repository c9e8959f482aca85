//! Fence orchestration.
//!
//! Fencing proves that an unresponsive node can no longer run its
//! services. In watchdog mode the proof is stealing the node's agent lock:
//! a live LRM keeps a hardware watchdog armed, so once the lock can be
//! taken the node has rebooted or cannot act. In hardware mode the
//! configured fence devices must additionally report success.

use crate::config::{FenceConfig, FencingMode};
use crate::env::Environment;
use crate::error::Result;
use crate::types::agent_lock_name;
use metrics::counter;
use tracing::{info, warn};

/// Fence agent exit code for "target already powered off".
const EXIT_ALREADY_OFF: i32 = 5;

/// Executes one fencing attempt per CRM tick until it succeeds.
pub struct FenceRunner {
    mode: FencingMode,
}

impl FenceRunner {
    pub fn new(mode: FencingMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> FencingMode {
        self.mode
    }

    /// Attempt to fence `node`. Returns `Ok(true)` once the node is proven
    /// fenced; a false result is retried by the caller on the next tick.
    pub async fn fence_node(
        &self,
        env: &dyn Environment,
        config: &FenceConfig,
        node: &str,
    ) -> Result<bool> {
        counter!("haven_fence_attempts_total", "node" => node.to_string()).increment(1);

        // The agent lock steal is always required: it is the proof that no
        // LRM can still act for this node.
        let lock_stolen = env.acquire_lock(&agent_lock_name(node)).await;

        match self.mode {
            FencingMode::Watchdog => {
                if !lock_stolen {
                    info!(node = %node, "Fence pending, agent lock still held");
                }
                Ok(lock_stolen)
            }
            FencingMode::Hardware => {
                let devices_ok = self.run_fence_devices(env, config, node).await?;
                if !devices_ok {
                    warn!(node = %node, "All fence device groups failed, retrying next tick");
                }
                Ok(lock_stolen && devices_ok)
            }
        }
    }

    /// Run the configured device groups; any fully successful group fences
    /// the node.
    async fn run_fence_devices(
        &self,
        env: &dyn Environment,
        config: &FenceConfig,
        node: &str,
    ) -> Result<bool> {
        let groups = config.groups();
        if groups.is_empty() {
            warn!(node = %node, "Hardware fencing selected but no fence devices configured");
            return Ok(false);
        }

        'group: for group in groups {
            for device in &group {
                let code = match env.exec_fence_agent(device, node).await {
                    Ok(code) => code,
                    Err(e) => {
                        warn!(
                            node = %node,
                            device = %device.name,
                            error = %e,
                            "Fence agent execution failed"
                        );
                        continue 'group;
                    }
                };

                match code {
                    0 => {}
                    EXIT_ALREADY_OFF => {
                        info!(node = %node, device = %device.name, "Fence target already off");
                    }
                    other => {
                        warn!(
                            node = %node,
                            device = %device.name,
                            exit_code = other,
                            "Fence device failed"
                        );
                        continue 'group;
                    }
                }
            }
            info!(node = %node, "Fence device group succeeded");
            return Ok(true);
        }

        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FenceDevice;
    use crate::env::sim::SimCluster;
    use std::time::Duration;

    fn device(name: &str, group: Option<&str>) -> FenceDevice {
        FenceDevice {
            name: name.to_string(),
            agent: format!("fence_{}", name),
            group: group.map(str::to_string),
            timeout: Duration::from_secs(30),
            args: vec![],
        }
    }

    #[tokio::test]
    async fn test_watchdog_fence_requires_lock_steal() {
        let cluster = SimCluster::new();
        cluster.add_node("n1");
        cluster.add_node("n2");
        let env1 = cluster.env_for("n1");
        let env2 = cluster.env_for("n2");

        // n1's LRM holds its own agent lock.
        assert!(env1.acquire_lock(&agent_lock_name("n1")).await);

        let runner = FenceRunner::new(FencingMode::Watchdog);
        let config = FenceConfig::default();

        // Lock is fresh: the steal must fail.
        assert!(!runner.fence_node(&env2, &config, "n1").await.unwrap());

        // After the lock lifetime passes without refresh, the steal works.
        cluster.advance(130);
        assert!(runner.fence_node(&env2, &config, "n1").await.unwrap());
    }

    #[tokio::test]
    async fn test_hardware_fence_group_semantics() {
        let cluster = SimCluster::new();
        cluster.add_node("n1");
        cluster.add_node("n2");
        let env = cluster.env_for("n2");

        let config = FenceConfig {
            devices: vec![
                device("psu1", Some("rack")),
                device("psu2", Some("rack")),
                device("pdu", None),
            ],
        };

        let runner = FenceRunner::new(FencingMode::Hardware);

        // First group fails on its second device; the singleton succeeds.
        cluster.script_fence_agent("fence_psu2", 1);
        assert!(runner.fence_node(&env, &config, "n1").await.unwrap());

        // Exit code 5 counts as success.
        cluster.script_fence_agent("fence_psu2", 5);
        cluster.script_fence_agent("fence_pdu", 1);
        assert!(runner.fence_node(&env, &config, "n1").await.unwrap());

        // Everything failing means no fence.
        cluster.script_fence_agent("fence_psu1", 1);
        cluster.script_fence_agent("fence_psu2", 1);
        cluster.script_fence_agent("fence_pdu", 1);
        assert!(!runner.fence_node(&env, &config, "n1").await.unwrap());
    }
}
