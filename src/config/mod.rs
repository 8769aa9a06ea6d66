//! Runtime configuration: execution limits, portal registry, journal tuning.
//!
//! All of it is loaded once at startup (file + environment overrides) and
//! treated as an immutable, cloneable value threaded through the call graph
//! — the same treatment the source gives its execution limits.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ============================================================================
// Defaults
// ============================================================================

pub const DEFAULT_MAX_STEPS: usize = 100;
pub const DEFAULT_MAX_PARALLELISM_CAP: usize = 10;
pub const DEFAULT_STEP_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_GIT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_REVERT_CONCURRENCY: usize = 4;
pub const DEFAULT_BATCH_MAX_SIZE: usize = 50;
pub const DEFAULT_BATCH_FLUSH_MS: u64 = 250;

/// Execution limits guarding against malformed or adversarially large flow
/// documents (mirrors the source's `ExecutionLimits`, generalized from
/// HTTP-plan-specific caps to flow/step caps).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionLimits {
    /// Hard cap on the number of steps a flow document may declare.
    pub max_steps: usize,
    /// Hard cap on `settings.max_parallelism`; flows requesting more are
    /// clamped, not rejected.
    pub max_parallelism_cap: usize,
    /// Timeout applied to a step that declares neither its own
    /// `timeout_ms` nor inherits one from `Flow.settings`.
    pub default_step_timeout: Duration,
    /// Per-invocation timeout for every git subprocess call.
    pub git_timeout: Duration,
    /// Number of unauthorized files reverted concurrently per chunk.
    pub revert_concurrency: usize,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            max_steps: DEFAULT_MAX_STEPS,
            max_parallelism_cap: DEFAULT_MAX_PARALLELISM_CAP,
            default_step_timeout: Duration::from_secs(DEFAULT_STEP_TIMEOUT_SECS),
            git_timeout: Duration::from_secs(DEFAULT_GIT_TIMEOUT_SECS),
            revert_concurrency: DEFAULT_REVERT_CONCURRENCY,
        }
    }
}

impl ExecutionLimits {
    /// Restrictive limits, useful in tests that want fast failure on
    /// runaway plans.
    pub fn strict() -> Self {
        Self {
            max_steps: 10,
            max_parallelism_cap: 2,
            default_step_timeout: Duration::from_secs(5),
            git_timeout: Duration::from_secs(2),
            revert_concurrency: 2,
        }
    }

    pub fn from_env() -> Self {
        let mut limits = Self::default();

        if let Ok(val) = std::env::var("RUNNER_MAX_STEPS") {
            if let Ok(n) = val.parse() {
                limits.max_steps = n;
            }
        }
        if let Ok(val) = std::env::var("RUNNER_MAX_PARALLELISM") {
            if let Ok(n) = val.parse() {
                limits.max_parallelism_cap = n;
            }
        }
        if let Ok(val) = std::env::var("RUNNER_STEP_TIMEOUT_SECS") {
            if let Ok(n) = val.parse() {
                limits.default_step_timeout = Duration::from_secs(n);
            }
        }
        if let Ok(val) = std::env::var("RUNNER_GIT_TIMEOUT_SECS") {
            if let Ok(n) = val.parse() {
                limits.git_timeout = Duration::from_secs(n);
            }
        }
        if let Ok(val) = std::env::var("RUNNER_REVERT_CONCURRENCY") {
            if let Ok(n) = val.parse() {
                limits.revert_concurrency = n;
            }
        }

        limits
    }
}

/// A single violation found while checking a flow document against
/// [`ExecutionLimits`].
#[derive(Debug, Clone)]
pub struct LimitViolation {
    pub limit_name: String,
    pub limit_value: String,
    pub actual_value: String,
    pub message: String,
}

#[derive(Debug)]
pub struct LimitValidationResult {
    pub passed: bool,
    pub violations: Vec<LimitViolation>,
}

/// Checks a flow's step count against `limits.max_steps`. Separate from
/// schema validation (`validation` module) because it is a resource guard,
/// not a correctness check.
pub fn validate_limits(step_count: usize, limits: &ExecutionLimits) -> LimitValidationResult {
    let mut violations = Vec::new();

    if step_count > limits.max_steps {
        violations.push(LimitViolation {
            limit_name: "max_steps".to_string(),
            limit_value: limits.max_steps.to_string(),
            actual_value: step_count.to_string(),
            message: format!(
                "flow has {step_count} steps, maximum permitted is {}",
                limits.max_steps
            ),
        });
    }

    LimitValidationResult {
        passed: violations.is_empty(),
        violations,
    }
}

// ============================================================================
// Portal registry
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityMode {
    Sandboxed,
    Hybrid,
}

impl Default for SecurityMode {
    fn default() -> Self {
        Self::Sandboxed
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortalSpec {
    pub path: PathBuf,
    /// Allowlist of agent ids; `"*"` admits any agent.
    #[serde(default)]
    pub allowed_agents: Vec<String>,
    #[serde(default)]
    pub security_mode: SecurityMode,
}

// ============================================================================
// Journal tuning
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalConfig {
    pub db_path: PathBuf,
    #[serde(default = "default_batch_max_size")]
    pub batch_max_size: usize,
    #[serde(default = "default_batch_flush_ms")]
    pub batch_flush_ms: u64,
}

fn default_batch_max_size() -> usize {
    DEFAULT_BATCH_MAX_SIZE
}

fn default_batch_flush_ms() -> u64 {
    DEFAULT_BATCH_FLUSH_MS
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("runner-activity.db"),
            batch_max_size: DEFAULT_BATCH_MAX_SIZE,
            batch_flush_ms: DEFAULT_BATCH_FLUSH_MS,
        }
    }
}

// ============================================================================
// Top-level runner configuration
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunnerConfig {
    #[serde(default)]
    pub portals: HashMap<String, PortalSpec>,
    #[serde(default = "default_agent_id")]
    pub default_agent: String,
    #[serde(default)]
    pub journal: JournalConfig,
    #[serde(default)]
    pub limits: ExecutionLimits,
}

fn default_agent_id() -> String {
    "assistant".to_string()
}

impl RunnerConfig {
    pub fn from_file(path: impl AsRef<std::path::Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| anyhow::anyhow!("failed to read config file: {e}"))?;
        let config: Self = if path.as_ref().extension().and_then(|e| e.to_str()) == Some("json") {
            serde_json::from_str(&content)?
        } else {
            serde_yaml::from_str(&content)?
        };
        Ok(config)
    }
}
