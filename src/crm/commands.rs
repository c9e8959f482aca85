//! Parsing of the CRM command queue.
//!
//! Commands arrive as newline-separated text in the cluster KV. Unknown or
//! malformed commands are logged and dropped by the manager.

use crate::error::{HavenError, Result};
use crate::types::ServiceId;
use std::str::FromStr;

/// One command from the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrmCommand {
    Migrate { sid: ServiceId, target: String },
    Relocate { sid: ServiceId, target: String },
    Stop { sid: ServiceId, timeout: u64 },
    EnableNodeMaintenance { node: String },
    DisableNodeMaintenance { node: String },
}

impl FromStr for CrmCommand {
    type Err = HavenError;

    fn from_str(line: &str) -> Result<Self> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let malformed = || HavenError::Config(format!("malformed CRM command '{}'", line));

        match parts.as_slice() {
            ["migrate", sid, target] => Ok(CrmCommand::Migrate {
                sid: sid.parse()?,
                target: target.to_string(),
            }),
            ["relocate", sid, target] => Ok(CrmCommand::Relocate {
                sid: sid.parse()?,
                target: target.to_string(),
            }),
            ["stop", sid, timeout] => Ok(CrmCommand::Stop {
                sid: sid.parse()?,
                timeout: timeout.parse().map_err(|_| malformed())?,
            }),
            ["enable-node-maintenance", node] => Ok(CrmCommand::EnableNodeMaintenance {
                node: node.to_string(),
            }),
            ["disable-node-maintenance", node] => Ok(CrmCommand::DisableNodeMaintenance {
                node: node.to_string(),
            }),
            _ => Err(malformed()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!(
            "migrate vm:100 n2".parse::<CrmCommand>().unwrap(),
            CrmCommand::Migrate {
                sid: "vm:100".parse().unwrap(),
                target: "n2".to_string()
            }
        );
        assert_eq!(
            "stop ct:200 60".parse::<CrmCommand>().unwrap(),
            CrmCommand::Stop {
                sid: "ct:200".parse().unwrap(),
                timeout: 60
            }
        );
        assert_eq!(
            "enable-node-maintenance n2".parse::<CrmCommand>().unwrap(),
            CrmCommand::EnableNodeMaintenance {
                node: "n2".to_string()
            }
        );
    }

    #[test]
    fn test_malformed_commands_rejected() {
        assert!("".parse::<CrmCommand>().is_err());
        assert!("migrate vm:100".parse::<CrmCommand>().is_err());
        assert!("stop ct:200 soon".parse::<CrmCommand>().is_err());
        assert!("destroy vm:100".parse::<CrmCommand>().is_err());
        assert!("migrate vm100 n2".parse::<CrmCommand>().is_err());
    }
}
