//! Parser for the section-file format used by the cluster configuration
//! files (`resources.cfg`, `groups.cfg`, `fence.cfg`).
//!
//! The format is one section per entity:
//!
//! ```text
//! vm: 100
//!     node n1
//!     state started
//!
//! group: web
//!     nodes n1:2,n2
//!     restricted 1
//! ```

use crate::error::{HavenError, Result};
use std::collections::BTreeMap;

/// One parsed section: `<kind>: <id>` plus indented `key value` properties.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub kind: String,
    pub id: String,
    pub props: BTreeMap<String, String>,
}

impl Section {
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
            props: BTreeMap::new(),
        }
    }

    /// Look up a property value.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.props.get(key).map(|s| s.as_str())
    }

    /// Parse a `0`/`1`/`true`/`false` flag property, defaulting when absent.
    pub fn get_bool(&self, key: &str, default: bool) -> Result<bool> {
        match self.get(key) {
            None => Ok(default),
            Some("0") | Some("false") => Ok(false),
            Some("1") | Some("true") => Ok(true),
            Some(other) => Err(HavenError::Config(format!(
                "section '{}: {}': property '{}' has invalid flag value '{}'",
                self.kind, self.id, key, other
            ))),
        }
    }

    /// Parse an unsigned integer property, defaulting when absent.
    pub fn get_u64(&self, key: &str, default: u64) -> Result<u64> {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => raw.parse().map_err(|_| {
                HavenError::Config(format!(
                    "section '{}: {}': property '{}' has invalid number '{}'",
                    self.kind, self.id, key, raw
                ))
            }),
        }
    }
}

/// Parse a section file. Comment lines start with `#`; blank lines are
/// ignored between sections.
pub fn parse_sections(input: &str) -> Result<Vec<Section>> {
    let mut sections: Vec<Section> = Vec::new();

    for (lineno, raw) in input.lines().enumerate() {
        let line = raw.trim_end();
        if line.trim().is_empty() || line.trim_start().starts_with('#') {
            continue;
        }

        let indented = line.starts_with(' ') || line.starts_with('\t');
        if !indented {
            let (kind, id) = line.split_once(':').ok_or_else(|| {
                HavenError::Config(format!("line {}: expected '<kind>: <id>'", lineno + 1))
            })?;
            let kind = kind.trim();
            let id = id.trim();
            if kind.is_empty() || id.is_empty() {
                return Err(HavenError::Config(format!(
                    "line {}: empty section kind or id",
                    lineno + 1
                )));
            }
            sections.push(Section::new(kind, id));
        } else {
            let section = sections.last_mut().ok_or_else(|| {
                HavenError::Config(format!(
                    "line {}: property outside of any section",
                    lineno + 1
                ))
            })?;
            let body = line.trim();
            let (key, value) = match body.split_once(char::is_whitespace) {
                Some((k, v)) => (k, v.trim()),
                None => (body, ""),
            };
            section.props.insert(key.to_string(), value.to_string());
        }
    }

    Ok(sections)
}

/// Render sections back into the canonical on-disk representation.
pub fn render_sections(sections: &[Section]) -> String {
    let mut out = String::new();
    for section in sections {
        out.push_str(&format!("{}: {}\n", section.kind, section.id));
        for (key, value) in &section.props {
            if value.is_empty() {
                out.push_str(&format!("\t{}\n", key));
            } else {
                out.push_str(&format!("\t{} {}\n", key, value));
            }
        }
        out.push('\n');
    }
    out
}
