//! Exec-backed resource driver.
//!
//! Delegates service operations to an external control program (`vmctl`,
//! `ctctl`, ...) with a conventional subcommand interface:
//!
//! ```text
//! <prog> start <name> [--max-restart N]
//! <prog> shutdown <name> [--timeout SECS]
//! <prog> migrate <name> <target> [--online]
//! <prog> status <name>          # exit 0 = running
//! <prog> unlock <name> <lock>   # exit 0 = lock removed
//! ```
//!
//! Static stats are read from the service configuration file, which uses
//! `key value` lines (`cores`, `memory` in MiB).

use super::ResourceDriver;
use crate::error::{HavenError, Result};
use crate::types::ServiceStats;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// Resource driver shelling out to a control program.
pub struct ExecDriver {
    kind: String,
    program: String,
    config_dir: PathBuf,
}

impl ExecDriver {
    pub fn new(kind: &str, program: &str, config_dir: &Path) -> Self {
        Self {
            kind: kind.to_string(),
            program: program.to_string(),
            config_dir: config_dir.to_path_buf(),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<i32> {
        debug!(program = %self.program, ?args, "Invoking control program");
        let status = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .status()
            .await
            .map_err(|e| HavenError::ServiceFailed {
                sid: format!("{}:{}", self.kind, args.get(1).unwrap_or(&"?")),
                reason: format!("{} failed to spawn: {}", self.program, e),
            })?;
        Ok(status.code().unwrap_or(-1))
    }

    async fn run_expect_success(&self, args: &[&str]) -> Result<()> {
        let code = self.run(args).await?;
        if code == 0 {
            Ok(())
        } else {
            Err(HavenError::ServiceFailed {
                sid: format!("{}:{}", self.kind, args.get(1).unwrap_or(&"?")),
                reason: format!("{} {} exited with code {}", self.program, args[0], code),
            })
        }
    }
}

#[async_trait]
impl ResourceDriver for ExecDriver {
    fn kind(&self) -> &str {
        &self.kind
    }

    fn verify_name(&self, name: &str) -> Result<()> {
        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if valid {
            Ok(())
        } else {
            Err(HavenError::InvalidServiceId(format!(
                "{}:{}",
                self.kind, name
            )))
        }
    }

    fn config_file(&self, name: &str, node: &str) -> PathBuf {
        self.config_dir
            .join(node)
            .join(&self.kind)
            .join(format!("{}.conf", name))
    }

    async fn exists(&self, name: &str) -> Result<bool> {
        // The configuration lives under the node currently owning the
        // service, so scan all node directories.
        let mut entries = match tokio::fs::read_dir(&self.config_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let candidate = entry
                .path()
                .join(&self.kind)
                .join(format!("{}.conf", name));
            if tokio::fs::try_exists(&candidate).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn start(&self, name: &str, max_restart: u32) -> Result<()> {
        let retries = max_restart.to_string();
        self.run_expect_success(&["start", name, "--max-restart", &retries])
            .await
    }

    async fn shutdown(&self, name: &str, timeout: Option<u64>) -> Result<()> {
        match timeout {
            Some(secs) => {
                let secs = secs.to_string();
                self.run_expect_success(&["shutdown", name, "--timeout", &secs])
                    .await
            }
            None => self.run_expect_success(&["shutdown", name]).await,
        }
    }

    async fn migrate(&self, name: &str, target: &str, online: bool) -> Result<()> {
        if online {
            self.run_expect_success(&["migrate", name, target, "--online"])
                .await
        } else {
            self.run_expect_success(&["migrate", name, target]).await
        }
    }

    async fn check_running(&self, name: &str) -> Result<bool> {
        Ok(self.run(&["status", name]).await? == 0)
    }

    async fn remove_locks(
        &self,
        name: &str,
        locks: &[&str],
        _node: &str,
    ) -> Result<Option<String>> {
        for lock in locks {
            if self.run(&["unlock", name, lock]).await? == 0 {
                return Ok(Some(lock.to_string()));
            }
        }
        Ok(None)
    }

    async fn static_stats(&self, name: &str, node: &str) -> Result<ServiceStats> {
        let path = self.config_file(name, node);
        let content = tokio::fs::read_to_string(&path).await.map_err(|e| {
            HavenError::ClusterRead {
                path: path.display().to_string(),
                reason: e.to_string(),
            }
        })?;

        let mut stats = ServiceStats::default();
        for line in content.lines() {
            let mut parts = line.split_whitespace();
            match (parts.next(), parts.next()) {
                (Some("cores"), Some(v)) => {
                    stats.maxcpu = v.parse().unwrap_or(0.0);
                }
                (Some("memory"), Some(v)) => {
                    // memory is configured in MiB
                    stats.maxmem = v.parse::<u64>().unwrap_or(0) * 1024 * 1024;
                }
                _ => {}
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verify_name() {
        let driver = ExecDriver::new("vm", "vmctl", Path::new("/etc/haven/services"));
        assert!(driver.verify_name("100").is_ok());
        assert!(driver.verify_name("web-01").is_ok());
        assert!(driver.verify_name("").is_err());
        assert!(driver.verify_name("a b").is_err());
    }

    #[test]
    fn test_config_file_layout() {
        let driver = ExecDriver::new("ct", "ctctl", Path::new("/etc/haven/services"));
        assert_eq!(
            driver.config_file("200", "n1"),
            PathBuf::from("/etc/haven/services/n1/ct/200.conf")
        );
    }

    #[tokio::test]
    async fn test_static_stats_parse() {
        let dir = tempfile::tempdir().unwrap();
        let driver = ExecDriver::new("vm", "vmctl", dir.path());
        let conf_dir = dir.path().join("n1").join("vm");
        tokio::fs::create_dir_all(&conf_dir).await.unwrap();
        tokio::fs::write(conf_dir.join("100.conf"), "cores 4\nmemory 2048\nname web\n")
            .await
            .unwrap();

        let stats = driver.static_stats("100", "n1").await.unwrap();
        assert_eq!(stats.maxcpu, 4.0);
        assert_eq!(stats.maxmem, 2048 * 1024 * 1024);
    }
}
