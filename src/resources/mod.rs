//! Resource driver registry.
//!
//! Each service type (`vm`, `ct`, ...) is handled by one [`ResourceDriver`]
//! registered at process init. The registry is frozen before the control
//! loops start; drivers cannot be added or replaced afterwards.

mod exec;

pub use exec::ExecDriver;

use crate::config::DriverConfig;
use crate::error::{HavenError, Result};
use crate::types::{ServiceId, ServiceStats};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Capability set of a resource type.
///
/// Implementations must be idempotent where the operation allows it:
/// starting a running service and stopping a stopped one both succeed.
#[async_trait]
pub trait ResourceDriver: Send + Sync {
    /// The service type this driver handles.
    fn kind(&self) -> &str;

    /// Validate a driver-scoped service name.
    fn verify_name(&self, name: &str) -> Result<()>;

    /// Path of the service configuration file on a node.
    fn config_file(&self, name: &str, node: &str) -> PathBuf;

    /// Whether the service is declared at all.
    async fn exists(&self, name: &str) -> Result<bool>;

    /// Start the service on the local node. `max_restart` bounds local
    /// retry attempts before the driver reports failure.
    async fn start(&self, name: &str, max_restart: u32) -> Result<()>;

    /// Gracefully stop the service; a timeout of 0 requests a hard stop.
    async fn shutdown(&self, name: &str, timeout: Option<u64>) -> Result<()>;

    /// Move the service to `target`; `online` keeps it running during the
    /// move.
    async fn migrate(&self, name: &str, target: &str, online: bool) -> Result<()>;

    /// Whether the service is currently running on the local node.
    async fn check_running(&self, name: &str) -> Result<bool>;

    /// Remove the given lock markers from the service configuration,
    /// returning the removed lock if any. Used by recovery to clear locks
    /// that are safe to drop after a node was fenced.
    async fn remove_locks(
        &self,
        name: &str,
        locks: &[&str],
        node: &str,
    ) -> Result<Option<String>>;

    /// Static CPU/memory footprint for the static usage scheduler.
    async fn static_stats(&self, name: &str, node: &str) -> Result<ServiceStats>;
}

/// Frozen mapping from service type to driver.
pub struct DriverRegistry {
    drivers: HashMap<String, Arc<dyn ResourceDriver>>,
}

impl DriverRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder {
            drivers: HashMap::new(),
        }
    }

    /// Registry with the exec-backed `vm` and `ct` drivers.
    pub fn builtin(config: &DriverConfig) -> Arc<Self> {
        Self::builder()
            .register(Arc::new(ExecDriver::new(
                "vm",
                &config.vm_control,
                &config.config_dir,
            )))
            .register(Arc::new(ExecDriver::new(
                "ct",
                &config.ct_control,
                &config.config_dir,
            )))
            .build()
    }

    /// Look up the driver for a service type.
    pub fn get(&self, kind: &str) -> Option<&Arc<dyn ResourceDriver>> {
        self.drivers.get(kind)
    }

    /// Look up the driver for a service, failing on unknown types.
    pub fn get_for(&self, sid: &ServiceId) -> Result<&Arc<dyn ResourceDriver>> {
        self.get(sid.kind())
            .ok_or_else(|| HavenError::UnknownResourceType(sid.kind().to_string()))
    }

    /// Registered service types.
    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.drivers.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }
}

/// Builder collecting drivers before the registry is frozen.
pub struct RegistryBuilder {
    drivers: HashMap<String, Arc<dyn ResourceDriver>>,
}

impl RegistryBuilder {
    /// Register a driver. Registering the same type twice keeps the last
    /// driver and is a programmer error worth a panic in debug builds.
    pub fn register(mut self, driver: Arc<dyn ResourceDriver>) -> Self {
        let kind = driver.kind().to_string();
        debug_assert!(
            !self.drivers.contains_key(&kind),
            "duplicate driver registration for '{}'",
            kind
        );
        self.drivers.insert(kind, driver);
        self
    }

    /// Freeze the registry.
    pub fn build(self) -> Arc<DriverRegistry> {
        Arc::new(DriverRegistry {
            drivers: self.drivers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_registry() {
        let registry = DriverRegistry::builtin(&DriverConfig::default());
        assert_eq!(registry.kinds(), vec!["ct", "vm"]);

        let sid: ServiceId = "vm:100".parse().unwrap();
        assert!(registry.get_for(&sid).is_ok());

        let unknown: ServiceId = "lxd:100".parse().unwrap();
        assert!(matches!(
            registry.get_for(&unknown),
            Err(HavenError::UnknownResourceType(_))
        ));
    }
}
