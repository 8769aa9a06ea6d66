//! Flow loading (§6 "Flow file format"): reads a JSON or YAML document from
//! disk, deserializes it into a [`Flow`] — rejecting unknown top-level keys
//! via `Flow`'s `deny_unknown_fields` — and runs it through
//! [`crate::validation::validate_or_err`] before handing it back. The loader
//! is the single source of schema enforcement; nothing downstream
//! re-validates a `Flow` it receives.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::fs;
use std::path::Path;

use crate::errors::{Result, RunnerError};
use crate::protocol::Flow;
use crate::validation;

fn read_to_string(path: &Path) -> Result<String> {
    fs::read_to_string(path).map_err(|err| RunnerError::ConfigInvalid {
        message: format!("failed to read {}: {err}", path.display()),
    })
}

/// Parses `content` as either JSON or YAML based on whether it looks like a
/// JSON document (starts with `{`). Flow files are small enough that a
/// single heuristic is cheaper than shipping a format flag through the CLI.
fn parse_flow(content: &str) -> Result<Flow> {
    let trimmed = content.trim_start();
    if trimmed.starts_with('{') {
        serde_json::from_str(content).map_err(|err| RunnerError::ConfigInvalid {
            message: format!("invalid flow JSON: {err}"),
        })
    } else {
        serde_yaml::from_str(content).map_err(|err| RunnerError::ConfigInvalid {
            message: format!("invalid flow YAML: {err}"),
        })
    }
}

/// Loads and validates a single flow document.
pub fn load_flow_from_file<P: AsRef<Path>>(path: P) -> Result<Flow> {
    let path = path.as_ref();
    let content = read_to_string(path)?;
    let flow = parse_flow(&content)?;
    validation::validate_or_err(&flow)?;
    Ok(flow)
}

/// Loads every `.json`/`.yaml`/`.yml` file directly under `dir` as a flow,
/// keyed by `Flow::id`. Used at startup to build the router's known-flows
/// set without requiring a separate flow manifest.
pub fn load_flows_from_dir<P: AsRef<Path>>(dir: P) -> Result<HashMap<String, Flow>> {
    let dir = dir.as_ref();
    let mut flows = HashMap::new();

    let entries = fs::read_dir(dir).map_err(|err| RunnerError::ConfigInvalid {
        message: format!("failed to read flow directory {}: {err}", dir.display()),
    })?;

    for entry in entries {
        let entry = entry.map_err(|err| RunnerError::ConfigInvalid {
            message: format!("failed to read directory entry: {err}"),
        })?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let is_flow_file = matches!(
            path.extension().and_then(OsStr::to_str),
            Some("json") | Some("yaml") | Some("yml")
        );
        if !is_flow_file {
            continue;
        }
        let flow = load_flow_from_file(&path)?;
        flows.insert(flow.id.clone(), flow);
    }

    Ok(flows)
}
