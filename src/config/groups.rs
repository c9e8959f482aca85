//! Parsing of the `groups.cfg` placement group declarations.

use super::section::parse_sections;
use crate::error::{HavenError, Result};
use crate::types::Group;
use std::collections::BTreeMap;

/// The parsed set of placement groups.
#[derive(Debug, Clone, Default)]
pub struct GroupsConfig {
    pub groups: BTreeMap<String, Group>,
}

impl GroupsConfig {
    /// Parse `groups.cfg` content.
    pub fn parse(input: &str) -> Result<Self> {
        let mut groups = BTreeMap::new();

        for section in parse_sections(input)? {
            if section.kind != "group" {
                return Err(HavenError::Config(format!(
                    "unexpected section kind '{}' in groups config",
                    section.kind
                )));
            }

            let nodes_raw = section.get("nodes").ok_or_else(|| {
                HavenError::Config(format!("group '{}': missing 'nodes' property", section.id))
            })?;

            let mut nodes = BTreeMap::new();
            for entry in nodes_raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
                let (node, priority) = match entry.split_once(':') {
                    Some((node, pri)) => {
                        let pri: u32 = pri.parse().map_err(|_| {
                            HavenError::Config(format!(
                                "group '{}': invalid priority in '{}'",
                                section.id, entry
                            ))
                        })?;
                        (node, pri)
                    }
                    None => (entry, 0),
                };
                nodes.insert(node.to_string(), priority);
            }

            if nodes.is_empty() {
                return Err(HavenError::Config(format!(
                    "group '{}': node list is empty",
                    section.id
                )));
            }

            let group = Group {
                nodes,
                restricted: section.get_bool("restricted", false)?,
                nofailback: section.get_bool("nofailback", false)?,
                comment: section.get("comment").map(str::to_string),
            };
            groups.insert(section.id.clone(), group);
        }

        Ok(Self { groups })
    }
}
