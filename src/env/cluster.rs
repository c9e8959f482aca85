//! Production environment backed by the cluster filesystem.
//!
//! Status documents are JSON files written atomically (temp file + rename)
//! under the cluster mount point, named locks are lease directories whose
//! holder file's mtime carries the last refresh, and the watchdog is the
//! multiplexer socket. Membership and quorum come from the `members`
//! document maintained by the cluster stack; this crate never computes
//! quorum itself.
//!
//! Layout under the base directory:
//!
//! ```text
//! manager_status            lrm_status/<node>
//! crm_commands              members
//! resources.cfg             groups.cfg
//! fence.cfg                 datacenter.cfg
//! priv/lock/<name>/holder   notifications/
//! ```

use super::{Environment, FenceNotification, HostShutdown};
use crate::config::{CrsConfig, FenceConfig, GroupsConfig, HavenConfig, ResourcesConfig};
use crate::error::{HavenError, Result};
use crate::types::{LrmStatus, ManagerStatus, NodeInfo, NodeStats, ServiceId};
use crate::watchdog::WatchdogClient;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::process::Command;
use tracing::{debug, warn};

/// One node entry in the externally maintained `members` document.
#[derive(Debug, Clone, Default, Deserialize)]
struct MemberEntry {
    online: bool,
    #[serde(default)]
    cpus: f64,
    #[serde(default)]
    memory: u64,
}

/// The `members` document: the cluster stack's membership and quorum view.
#[derive(Debug, Clone, Default, Deserialize)]
struct MembersDoc {
    quorate: bool,
    #[serde(default)]
    nodes: BTreeMap<String, MemberEntry>,
}

/// Filesystem-backed [`Environment`].
pub struct ClusterEnvironment {
    node: String,
    base_dir: PathBuf,
    watchdog_socket: PathBuf,
    lock_lifetime: Duration,
    watchdog: tokio::sync::Mutex<Option<WatchdogClient>>,
}

impl ClusterEnvironment {
    pub fn new(config: &HavenConfig) -> Self {
        Self {
            node: config.node.name.clone(),
            base_dir: config.cluster.base_dir.clone(),
            watchdog_socket: config.cluster.watchdog_socket.clone(),
            lock_lifetime: config.timing.lock_lifetime,
            watchdog: tokio::sync::Mutex::new(None),
        }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.base_dir.join(name)
    }

    fn lock_holder_file(&self, name: &str) -> PathBuf {
        self.base_dir.join("priv").join("lock").join(name).join("holder")
    }

    async fn read_text(&self, path: &Path) -> Result<Option<String>> {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(HavenError::ClusterRead {
                path: path.display().to_string(),
                reason: e.to_string(),
            }),
        }
    }

    /// Atomic write: temp file in the same directory, then rename.
    async fn write_text(&self, path: &Path, content: &str) -> Result<()> {
        let map_err = |e: std::io::Error| HavenError::ClusterWrite {
            path: path.display().to_string(),
            reason: e.to_string(),
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(map_err)?;
        }
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, content).await.map_err(map_err)?;
        tokio::fs::rename(&tmp, path).await.map_err(map_err)
    }

    async fn read_members(&self) -> Result<MembersDoc> {
        match self.read_text(&self.path("members")).await? {
            Some(content) => Ok(serde_json::from_str(&content)?),
            None => Ok(MembersDoc::default()),
        }
    }

    async fn holder_age(&self, holder_file: &Path) -> Result<Duration> {
        let meta = tokio::fs::metadata(holder_file).await?;
        let modified = meta.modified()?;
        Ok(SystemTime::now()
            .duration_since(modified)
            .unwrap_or_default())
    }
}

#[async_trait]
impl Environment for ClusterEnvironment {
    fn node_name(&self) -> &str {
        &self.node
    }

    async fn now(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    async fn quorate(&self) -> bool {
        match self.read_members().await {
            Ok(members) => members.quorate,
            Err(e) => {
                warn!(error = %e, "Cannot read membership, assuming no quorum");
                false
            }
        }
    }

    async fn membership(&self) -> Result<BTreeMap<String, NodeInfo>> {
        let members = self.read_members().await?;
        Ok(members
            .nodes
            .into_iter()
            .map(|(name, entry)| (name, NodeInfo { online: entry.online }))
            .collect())
    }

    async fn read_manager_status(&self) -> Result<ManagerStatus> {
        match self.read_text(&self.path("manager_status")).await? {
            Some(content) => Ok(serde_json::from_str(&content)?),
            None => Ok(ManagerStatus::default()),
        }
    }

    async fn write_manager_status(&self, status: &ManagerStatus) -> Result<()> {
        let content = serde_json::to_string_pretty(status)?;
        self.write_text(&self.path("manager_status"), &content).await
    }

    async fn read_lrm_status(&self, node: &str) -> Result<LrmStatus> {
        let path = self.path("lrm_status").join(node);
        match self.read_text(&path).await? {
            Some(content) => Ok(serde_json::from_str(&content)?),
            None => Ok(LrmStatus::default()),
        }
    }

    async fn write_lrm_status(&self, status: &LrmStatus) -> Result<()> {
        let content = serde_json::to_string_pretty(status)?;
        let path = self.path("lrm_status").join(&self.node);
        self.write_text(&path, &content).await
    }

    async fn read_crm_commands(&self) -> Result<Vec<String>> {
        let path = self.path("crm_commands");
        let Some(content) = self.read_text(&path).await? else {
            return Ok(Vec::new());
        };
        self.write_text(&path, "").await?;
        Ok(content
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn queue_crm_command(&self, command: &str) -> Result<()> {
        use tokio::io::AsyncWriteExt;
        let path = self.path("crm_commands");
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| HavenError::ClusterWrite {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
        file.write_all(format!("{}\n", command).as_bytes())
            .await
            .map_err(|e| HavenError::ClusterWrite {
                path: path.display().to_string(),
                reason: e.to_string(),
            })
    }

    async fn load_resources(&self) -> Result<ResourcesConfig> {
        match self.read_text(&self.path("resources.cfg")).await? {
            Some(content) => ResourcesConfig::parse(&content),
            None => Ok(ResourcesConfig::default()),
        }
    }

    async fn load_groups(&self) -> Result<GroupsConfig> {
        match self.read_text(&self.path("groups.cfg")).await? {
            Some(content) => GroupsConfig::parse(&content),
            None => Ok(GroupsConfig::default()),
        }
    }

    async fn load_fence_config(&self) -> Result<FenceConfig> {
        match self.read_text(&self.path("fence.cfg")).await? {
            Some(content) => FenceConfig::parse(&content),
            None => Ok(FenceConfig::default()),
        }
    }

    async fn load_crs_config(&self) -> Result<CrsConfig> {
        match self.read_text(&self.path("datacenter.cfg")).await? {
            Some(content) => Ok(serde_json::from_str(&content)?),
            None => Ok(CrsConfig::default()),
        }
    }

    async fn acquire_lock(&self, name: &str) -> bool {
        if !self.quorate().await {
            return false;
        }

        let holder_file = self.lock_holder_file(name);
        match self.read_text(&holder_file).await {
            Ok(Some(holder)) if holder.trim() == self.node => {
                // Refresh: rewriting the holder file bumps the mtime the
                // cluster side uses as last-touch time.
                self.write_text(&holder_file, &self.node).await.is_ok()
            }
            Ok(Some(holder)) => {
                match self.holder_age(&holder_file).await {
                    Ok(age) if age >= self.lock_lifetime => {
                        debug!(lock = %name, previous = %holder.trim(), "Taking over expired lock");
                        self.write_text(&holder_file, &self.node).await.is_ok()
                    }
                    Ok(_) => false,
                    Err(_) => false,
                }
            }
            Ok(None) => self.write_text(&holder_file, &self.node).await.is_ok(),
            Err(e) => {
                warn!(lock = %name, error = %e, "Lock read failed");
                false
            }
        }
    }

    async fn release_lock(&self, name: &str) {
        let holder_file = self.lock_holder_file(name);
        if let Ok(Some(holder)) = self.read_text(&holder_file).await {
            if holder.trim() == self.node {
                if let Some(dir) = holder_file.parent() {
                    let _ = tokio::fs::remove_dir_all(dir).await;
                }
            }
        }
    }

    async fn steal_service(&self, sid: &ServiceId, from: &str, to: &str) -> Result<()> {
        let path = self.path("resources.cfg");
        let content = self
            .read_text(&path)
            .await?
            .ok_or_else(|| HavenError::ServiceNotFound(sid.to_string()))?;

        let mut resources = ResourcesConfig::parse(&content)?;
        resources.set_service_node(sid, from, to)?;
        self.write_text(&path, &resources.render()).await
    }

    async fn watchdog_open(&self) -> Result<()> {
        let mut guard = self.watchdog.lock().await;
        if guard.is_none() {
            *guard = Some(WatchdogClient::connect(&self.watchdog_socket).await?);
        }
        Ok(())
    }

    async fn watchdog_update(&self) -> bool {
        match self.watchdog.lock().await.as_mut() {
            Some(client) => client.update().await,
            None => false,
        }
    }

    async fn watchdog_close(&self, graceful: bool) {
        if let Some(client) = self.watchdog.lock().await.take() {
            client.close(graceful).await;
        }
    }

    async fn exec_fence_agent(
        &self,
        device: &crate::config::FenceDevice,
        node: &str,
    ) -> Result<i32> {
        let args: Vec<String> = device
            .args
            .iter()
            .map(|a| a.replace("{node}", node))
            .collect();

        let child = Command::new(&device.agent)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .status();

        match tokio::time::timeout(device.timeout, child).await {
            Ok(Ok(status)) => Ok(status.code().unwrap_or(-1)),
            Ok(Err(e)) => Err(HavenError::FenceAgent {
                agent: device.agent.clone(),
                reason: e.to_string(),
            }),
            Err(_) => Err(HavenError::Timeout(device.timeout.as_millis() as u64)),
        }
    }

    async fn send_fence_notification(&self, notification: &FenceNotification) -> Result<()> {
        let stamp = chrono::DateTime::from_timestamp(notification.timestamp as i64, 0)
            .unwrap_or_default()
            .format("%Y%m%dT%H%M%SZ");
        let path = self
            .path("notifications")
            .join(format!("fence-{}-{}.json", notification.node, stamp));
        let content = serde_json::to_string_pretty(notification)?;
        self.write_text(&path, &content).await
    }

    async fn node_stats(&self) -> Result<BTreeMap<String, NodeStats>> {
        let members = self.read_members().await?;
        Ok(members
            .nodes
            .into_iter()
            .filter(|(_, entry)| entry.cpus > 0.0 || entry.memory > 0)
            .map(|(name, entry)| {
                (
                    name,
                    NodeStats {
                        cpus: entry.cpus,
                        memory: entry.memory,
                    },
                )
            })
            .collect())
    }

    async fn shutdown_request(&self) -> HostShutdown {
        let output = Command::new("systemctl")
            .arg("list-jobs")
            .stdin(Stdio::null())
            .output()
            .await;

        let Ok(output) = output else {
            return HostShutdown::None;
        };
        let jobs = String::from_utf8_lossy(&output.stdout);
        if jobs.contains("reboot.target") {
            HostShutdown::Reboot
        } else if jobs.contains("shutdown.target") || jobs.contains("poweroff.target") {
            HostShutdown::Shutdown
        } else {
            HostShutdown::None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ServiceState, ServiceStatus};

    fn test_env(dir: &Path, node: &str) -> ClusterEnvironment {
        let mut config = HavenConfig::development(node);
        config.cluster.base_dir = dir.to_path_buf();
        ClusterEnvironment::new(&config)
    }

    async fn write_members(env: &ClusterEnvironment, quorate: bool, nodes: &[(&str, bool)]) {
        let entries: Vec<String> = nodes
            .iter()
            .map(|(n, online)| format!("\"{}\": {{\"online\": {}}}", n, online))
            .collect();
        let doc = format!(
            "{{\"quorate\": {}, \"nodes\": {{{}}}}}",
            quorate,
            entries.join(",")
        );
        env.write_text(&env.path("members"), &doc).await.unwrap();
    }

    #[tokio::test]
    async fn test_manager_status_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let env = test_env(dir.path(), "n1");

        // Missing file yields an empty document.
        let status = env.read_manager_status().await.unwrap();
        assert!(status.service_status.is_empty());

        let mut status = ManagerStatus::default();
        status.master_node = "n1".to_string();
        status.service_status.insert(
            "vm:100".parse().unwrap(),
            ServiceStatus::new(ServiceState::Started, "n1"),
        );
        env.write_manager_status(&status).await.unwrap();

        let back = env.read_manager_status().await.unwrap();
        assert_eq!(back.master_node, "n1");
        assert_eq!(back.service_status.len(), 1);
    }

    #[tokio::test]
    async fn test_lock_acquire_and_refresh() {
        let dir = tempfile::tempdir().unwrap();
        let env1 = test_env(dir.path(), "n1");
        let env2 = test_env(dir.path(), "n2");
        write_members(&env1, true, &[("n1", true), ("n2", true)]).await;

        assert!(env1.acquire_lock("ha_manager_lock").await);
        assert!(env1.acquire_lock("ha_manager_lock").await);
        assert!(!env2.acquire_lock("ha_manager_lock").await);

        env1.release_lock("ha_manager_lock").await;
        assert!(env2.acquire_lock("ha_manager_lock").await);
    }

    #[tokio::test]
    async fn test_expired_lock_takeover() {
        let dir = tempfile::tempdir().unwrap();
        let env1 = test_env(dir.path(), "n1");
        let mut config = HavenConfig::development("n2");
        config.cluster.base_dir = dir.path().to_path_buf();
        config.timing.lock_lifetime = Duration::from_secs(0);
        let env2 = ClusterEnvironment::new(&config);
        write_members(&env1, true, &[("n1", true), ("n2", true)]).await;

        assert!(env1.acquire_lock("ha_manager_lock").await);
        // With a zero lifetime every lease is expired immediately.
        assert!(env2.acquire_lock("ha_manager_lock").await);
    }

    #[tokio::test]
    async fn test_no_quorum_blocks_locks() {
        let dir = tempfile::tempdir().unwrap();
        let env = test_env(dir.path(), "n1");
        write_members(&env, false, &[("n1", true)]).await;

        assert!(!env.quorate().await);
        assert!(!env.acquire_lock("ha_manager_lock").await);
    }

    #[tokio::test]
    async fn test_crm_command_queue_drains() {
        let dir = tempfile::tempdir().unwrap();
        let env = test_env(dir.path(), "n1");

        env.queue_crm_command("migrate vm:100 n2").await.unwrap();
        env.queue_crm_command("stop ct:200 60").await.unwrap();

        let commands = env.read_crm_commands().await.unwrap();
        assert_eq!(commands, vec!["migrate vm:100 n2", "stop ct:200 60"]);
        assert!(env.read_crm_commands().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_steal_service_rewrites_config() {
        let dir = tempfile::tempdir().unwrap();
        let env = test_env(dir.path(), "n1");
        env.write_text(&env.path("resources.cfg"), "vm: 100\n\tnode n1\n")
            .await
            .unwrap();

        let sid: ServiceId = "vm:100".parse().unwrap();
        env.steal_service(&sid, "n1", "n2").await.unwrap();

        let resources = env.load_resources().await.unwrap();
        assert_eq!(resources.services[&sid].node, "n2");

        // A second steal with a stale source node is rejected.
        assert!(env.steal_service(&sid, "n1", "n3").await.is_err());
    }

    #[tokio::test]
    async fn test_membership_and_stats() {
        let dir = tempfile::tempdir().unwrap();
        let env = test_env(dir.path(), "n1");
        env.write_text(
            &env.path("members"),
            r#"{"quorate": true, "nodes": {
                "n1": {"online": true, "cpus": 8.0, "memory": 17179869184},
                "n2": {"online": false}
            }}"#,
        )
        .await
        .unwrap();

        let membership = env.membership().await.unwrap();
        assert!(membership["n1"].online);
        assert!(!membership["n2"].online);

        let stats = env.node_stats().await.unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats["n1"].cpus, 8.0);
    }
}
