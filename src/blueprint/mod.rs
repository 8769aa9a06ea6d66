//! Blueprint loading (§4.8, §6): parses the `---`-delimited frontmatter
//! agent descriptor format into a [`Blueprint`].

use std::path::Path;

use crate::errors::{Result, RunnerError};
use crate::protocol::Blueprint;

#[derive(serde::Deserialize)]
struct Frontmatter {
    model: String,
    provider: String,
    #[serde(default)]
    capabilities: Vec<String>,
    #[serde(default)]
    default_skills: Vec<String>,
}

/// Reads `path` and parses it as a blueprint file. `blueprint_missing` if
/// the file can't be read, `blueprint_invalid` if the frontmatter fences
/// are malformed or required keys are absent.
pub fn load(agent_id: &str, path: impl AsRef<Path>) -> Result<Blueprint> {
    let content = std::fs::read_to_string(path.as_ref()).map_err(|_| RunnerError::BlueprintMissing {
        agent_id: agent_id.to_string(),
    })?;
    parse(agent_id, &content)
}

/// Parses already-read blueprint text. Split out from [`load`] so tests
/// don't need a filesystem fixture for every case.
pub fn parse(agent_id: &str, content: &str) -> Result<Blueprint> {
    let content = content.strip_prefix('\u{feff}').unwrap_or(content);
    let rest = content.strip_prefix("---").ok_or_else(|| RunnerError::BlueprintInvalid {
        agent_id: agent_id.to_string(),
        message: "blueprint must begin with a '---' frontmatter fence".to_string(),
    })?;
    // the opening fence may be followed immediately by a newline
    let rest = rest.strip_prefix('\n').unwrap_or(rest);

    let fence_end = rest.find("\n---").ok_or_else(|| RunnerError::BlueprintInvalid {
        agent_id: agent_id.to_string(),
        message: "blueprint is missing a closing '---' fence".to_string(),
    })?;

    let frontmatter_text = &rest[..fence_end];
    let after_fence = &rest[fence_end + 4..];
    let system_prompt = after_fence.strip_prefix('\n').unwrap_or(after_fence).trim().to_string();

    let frontmatter: Frontmatter =
        serde_yaml::from_str(frontmatter_text).map_err(|e| RunnerError::BlueprintInvalid {
            agent_id: agent_id.to_string(),
            message: format!("invalid frontmatter: {e}"),
        })?;

    Ok(Blueprint {
        model: frontmatter.model,
        provider: frontmatter.provider,
        capabilities: frontmatter.capabilities,
        default_skills: frontmatter.default_skills,
        system_prompt,
    })
}
