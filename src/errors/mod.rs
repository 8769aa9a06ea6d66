//! Stable error taxonomy shared by every component.
//!
//! Every fallible operation in this crate returns a [`RunnerError`]. Each
//! variant carries a `kind()` string that is stable across versions: it is
//! what gets written into `StepResult::error.kind`, journalled, and shown to
//! callers. The message text is free to change; the kind string is the
//! contract.

use thiserror::Error;

/// The complete error taxonomy. Variant names mirror the `kind` strings
/// verbatim so `#[error]` messages and `kind()` never drift apart.
#[derive(Debug, Error, Clone)]
pub enum RunnerError {
    #[error("{message}")]
    ConfigInvalid { message: String },

    #[error("no flow with id '{flow_id}'")]
    FlowNotFound { flow_id: String },

    #[error("no blueprint for agent '{agent_id}'")]
    BlueprintMissing { agent_id: String },

    #[error("blueprint '{agent_id}' is malformed: {message}")]
    BlueprintInvalid { agent_id: String, message: String },

    #[error("agent '{agent}' is not permitted on portal '{portal}'{}", reason.as_ref().map(|r| format!(": {r}")).unwrap_or_default())]
    PermissionDenied {
        agent: String,
        portal: String,
        reason: Option<String>,
    },

    #[error("no portal registered under alias '{portal}'")]
    PortalNotFound { portal: String },

    #[error("request specifies both 'flow' and 'agent' selectors")]
    ConflictingSelectors,

    #[error("invalid step dependency graph: {message}")]
    InvalidDependencies { message: String, cycles: Vec<String> },

    #[error("{message}")]
    InvalidInput { message: String },

    #[error("{operation} timed out after {budget_ms}ms")]
    Timeout { operation: String, budget_ms: u64 },

    #[error("connection failure: {message}")]
    Connection { message: String },

    #[error("provider rate limited{}", retry_after_ms.map(|ms| format!(", retry after {ms}ms")).unwrap_or_default())]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("could not parse structured response: {message}")]
    InvalidResponse { message: String },

    #[error("git operation failed: {message}")]
    GitError {
        message: String,
        failed_files: Vec<String>,
    },

    #[error("agent execution failed: {message}")]
    AgentError { message: String },

    #[error("provider error: {message}")]
    Other { message: String },
}

impl RunnerError {
    /// The stable, lowercase-kebab identifier used for journaling and wire
    /// payloads. Matches the taxonomy table in the specification exactly.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConfigInvalid { .. } => "config_invalid",
            Self::FlowNotFound { .. } => "flow_not_found",
            Self::BlueprintMissing { .. } => "blueprint_missing",
            Self::BlueprintInvalid { .. } => "blueprint_invalid",
            Self::PermissionDenied { .. } => "permission_denied",
            Self::PortalNotFound { .. } => "portal_not_found",
            Self::ConflictingSelectors => "conflicting_selectors",
            Self::InvalidDependencies { .. } => "invalid_dependencies",
            Self::InvalidInput { .. } => "invalid_input",
            Self::Timeout { .. } => "timeout",
            Self::Connection { .. } => "connection",
            Self::RateLimited { .. } => "rate_limited",
            Self::InvalidResponse { .. } => "invalid_response",
            Self::GitError { .. } => "git_error",
            Self::AgentError { .. } => "agent_error",
            Self::Other { .. } => "other",
        }
    }

    /// Transient kinds are eligible for a step's retry policy; all others
    /// are fatal on first failure (§4.9, §7 propagation policy).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. }
                | Self::Connection { .. }
                | Self::RateLimited { .. }
                | Self::InvalidResponse { .. }
        )
    }
}

/// A minimal, serializable snapshot of an error for embedding into
/// `StepResult` / journal payloads without dragging the full error type
/// (and its `Clone` obligations on transient subprocess handles) along.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ErrorInfo {
    pub kind: String,
    pub message: String,
}

impl From<&RunnerError> for ErrorInfo {
    fn from(err: &RunnerError) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, RunnerError>;
