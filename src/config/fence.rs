//! Parsing of the `fence.cfg` fence device declarations.

use super::section::parse_sections;
use crate::error::{HavenError, Result};
use std::collections::BTreeMap;
use std::time::Duration;

/// One configured fence device.
#[derive(Debug, Clone, PartialEq)]
pub struct FenceDevice {
    pub name: String,
    /// Fence agent executable.
    pub agent: String,
    /// Devices sharing a group key must all succeed together.
    pub group: Option<String>,
    /// Wall-clock bound on one agent invocation.
    pub timeout: Duration,
    /// Extra arguments; the literal `{node}` is replaced with the fence
    /// target at invocation time.
    pub args: Vec<String>,
}

/// The parsed fence device configuration.
#[derive(Debug, Clone, Default)]
pub struct FenceConfig {
    pub devices: Vec<FenceDevice>,
}

impl FenceConfig {
    /// Parse `fence.cfg` content.
    pub fn parse(input: &str) -> Result<Self> {
        let mut devices = Vec::new();

        for section in parse_sections(input)? {
            if section.kind != "device" {
                return Err(HavenError::Config(format!(
                    "unexpected section kind '{}' in fence config",
                    section.kind
                )));
            }

            let agent = section
                .get("agent")
                .ok_or_else(|| {
                    HavenError::Config(format!(
                        "fence device '{}': missing 'agent' property",
                        section.id
                    ))
                })?
                .to_string();

            devices.push(FenceDevice {
                name: section.id.clone(),
                agent,
                group: section.get("group").map(str::to_string),
                timeout: Duration::from_secs(section.get_u64("timeout", 60)?),
                args: section
                    .get("args")
                    .map(|raw| raw.split_whitespace().map(str::to_string).collect())
                    .unwrap_or_default(),
            });
        }

        Ok(Self { devices })
    }

    /// Partition devices into fence groups, preserving declaration order.
    ///
    /// Devices without an explicit group each form a singleton group.
    pub fn groups(&self) -> Vec<Vec<&FenceDevice>> {
        let mut named: BTreeMap<&str, usize> = BTreeMap::new();
        let mut groups: Vec<Vec<&FenceDevice>> = Vec::new();

        for device in &self.devices {
            match device.group.as_deref() {
                Some(key) => {
                    if let Some(&idx) = named.get(key) {
                        groups[idx].push(device);
                    } else {
                        named.insert(key, groups.len());
                        groups.push(vec![device]);
                    }
                }
                None => groups.push(vec![device]),
            }
        }

        groups
    }
}
