//! Parsing and validation of the `resources.cfg` service declarations.

use super::section::{parse_sections, render_sections, Section};
use crate::error::{HavenError, Result};
use crate::types::{RequestState, ServiceConfig, ServiceId};
use std::collections::BTreeMap;

/// The parsed set of declared services.
#[derive(Debug, Clone, Default)]
pub struct ResourcesConfig {
    pub services: BTreeMap<ServiceId, ServiceConfig>,
}

impl ResourcesConfig {
    /// Parse `resources.cfg` content.
    pub fn parse(input: &str) -> Result<Self> {
        let mut services = BTreeMap::new();

        for section in parse_sections(input)? {
            let sid = ServiceId::new(section.kind.as_str(), section.id.as_str())?;
            let config = parse_service(&sid, &section)?;
            if services.insert(sid.clone(), config).is_some() {
                return Err(HavenError::Config(format!(
                    "duplicate service declaration '{}'",
                    sid
                )));
            }
        }

        Ok(Self { services })
    }

    /// Render the declarations back into file content.
    pub fn render(&self) -> String {
        let sections: Vec<Section> = self
            .services
            .iter()
            .map(|(sid, cd)| {
                let mut section = Section::new(sid.kind(), sid.name());
                section.props.insert("node".into(), cd.node.clone());
                section.props.insert("state".into(), cd.state.to_string());
                if let Some(group) = &cd.group {
                    section.props.insert("group".into(), group.clone());
                }
                if !cd.failback {
                    section.props.insert("failback".into(), "0".into());
                }
                if cd.max_restart != 1 {
                    section
                        .props
                        .insert("max_restart".into(), cd.max_restart.to_string());
                }
                if cd.max_relocate != 1 {
                    section
                        .props
                        .insert("max_relocate".into(), cd.max_relocate.to_string());
                }
                if let Some(comment) = &cd.comment {
                    section.props.insert("comment".into(), comment.clone());
                }
                section
            })
            .collect();
        render_sections(&sections)
    }

    /// Move a service declaration from one node to another.
    ///
    /// Fails with [`HavenError::Conflict`] when the declaration is not on
    /// the expected source node, so a racing move is detected rather than
    /// silently overwritten.
    pub fn set_service_node(&mut self, sid: &ServiceId, from: &str, to: &str) -> Result<()> {
        let cd = self
            .services
            .get_mut(sid)
            .ok_or_else(|| HavenError::ServiceNotFound(sid.to_string()))?;
        if cd.node != from {
            return Err(HavenError::Conflict(format!(
                "service '{}' is on node '{}', expected '{}'",
                sid, cd.node, from
            )));
        }
        cd.node = to.to_string();
        Ok(())
    }
}

fn parse_service(sid: &ServiceId, section: &Section) -> Result<ServiceConfig> {
    let node = section
        .get("node")
        .ok_or_else(|| {
            HavenError::Config(format!("service '{}': missing 'node' property", sid))
        })?
        .to_string();

    let state = match section.get("state") {
        None => RequestState::Started,
        Some("started") | Some("enabled") => RequestState::Started,
        Some("stopped") => RequestState::Stopped,
        Some("disabled") => RequestState::Disabled,
        Some("ignored") => RequestState::Ignored,
        Some(other) => {
            return Err(HavenError::Config(format!(
                "service '{}': unknown state '{}'",
                sid, other
            )))
        }
    };

    Ok(ServiceConfig {
        node,
        state,
        group: section.get("group").map(str::to_string),
        failback: section.get_bool("failback", true)?,
        max_restart: section.get_u64("max_restart", 1)? as u32,
        max_relocate: section.get_u64("max_relocate", 1)? as u32,
        comment: section.get("comment").map(str::to_string),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_services() {
        let input = "\
vm: 100
\tnode n1
\tstate started
\tgroup web
\tmax_relocate 2

ct: 200
\tnode n2
\tstate enabled
\tfailback 0
";
        let config = ResourcesConfig::parse(input).unwrap();
        assert_eq!(config.services.len(), 2);

        let vm = &config.services[&"vm:100".parse().unwrap()];
        assert_eq!(vm.node, "n1");
        assert_eq!(vm.state, RequestState::Started);
        assert_eq!(vm.group.as_deref(), Some("web"));
        assert_eq!(vm.max_relocate, 2);
        assert_eq!(vm.max_restart, 1);

        let ct = &config.services[&"ct:200".parse().unwrap()];
        assert_eq!(ct.state, RequestState::Started);
        assert!(!ct.failback);
    }

    #[test]
    fn test_missing_node_rejected() {
        assert!(ResourcesConfig::parse("vm: 100\n\tstate started\n").is_err());
    }

    #[test]
    fn test_unknown_state_rejected() {
        assert!(ResourcesConfig::parse("vm: 100\n\tnode n1\n\tstate halted\n").is_err());
    }

    #[test]
    fn test_set_service_node_detects_conflict() {
        let mut config = ResourcesConfig::parse("vm: 100\n\tnode n1\n").unwrap();
        let sid: ServiceId = "vm:100".parse().unwrap();

        config.set_service_node(&sid, "n1", "n2").unwrap();
        assert_eq!(config.services[&sid].node, "n2");

        let err = config.set_service_node(&sid, "n1", "n3").unwrap_err();
        assert!(matches!(err, HavenError::Conflict(_)));
    }

    #[test]
    fn test_render_roundtrip() {
        let input = "vm: 100\n\tnode n1\n\tstate stopped\n\tmax_restart 3\n";
        let config = ResourcesConfig::parse(input).unwrap();
        let back = ResourcesConfig::parse(&config.render()).unwrap();
        assert_eq!(back.services[&"vm:100".parse().unwrap()].max_restart, 3);
        assert_eq!(
            back.services[&"vm:100".parse().unwrap()].state,
            RequestState::Stopped
        );
    }
}
