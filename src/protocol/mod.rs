//! Data model for requests, flows, steps, and their results.
//!
//! These are the wire/storage shapes shared by every component: the loader
//! deserializes them from JSON/YAML, the planner mutates `StepResult`s as a
//! flow runs, and the journal serializes fragments of them into
//! `ActivityEntry.payload`.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

fn default_weight() -> f64 {
    1.0
}

fn default_criterion_threshold() -> f64 {
    0.7
}

fn default_gate_threshold() -> f64 {
    0.8
}

fn default_on_fail() -> OnFail {
    OnFail::Halt
}

fn default_max_retries() -> u32 {
    1
}

fn default_max_attempts() -> u32 {
    1
}

// ============================================================================
// Request / routing
// ============================================================================

/// An incoming user request. `trace_id` is assigned once, at construction,
/// and never changes for the lifetime of the request and everything it
/// spawns (steps, journal entries).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub trace_id: Uuid,
    pub request_id: String,
    pub body: String,
    #[serde(default)]
    pub metadata: RequestMetadata,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestMetadata {
    pub flow: Option<String>,
    pub agent: Option<String>,
    pub portal: Option<String>,
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

impl Request {
    pub fn new(body: impl Into<String>, metadata: RequestMetadata) -> Self {
        Self {
            trace_id: Uuid::new_v4(),
            request_id: Uuid::new_v4().to_string(),
            body: body.into(),
            metadata,
        }
    }

    /// A request naming both a flow and an agent is invalid (§3, §4.10).
    pub fn has_conflicting_selectors(&self) -> bool {
        self.metadata.flow.is_some() && self.metadata.agent.is_some()
    }
}

/// Result of `Router::route`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RouteDecision {
    Flow { flow_id: String },
    Agent { agent_id: String },
}

// ============================================================================
// Blueprint
// ============================================================================

/// An agent descriptor loaded from a blueprint file. Immutable once loaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Blueprint {
    pub model: String,
    pub provider: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub default_skills: Vec<String>,
    pub system_prompt: String,
}

// ============================================================================
// Flow / Step
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Flow {
    pub id: String,
    pub name: String,
    pub version: String,
    pub steps: Vec<Step>,
    pub output: FlowOutput,
    #[serde(default)]
    pub settings: FlowSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowOutput {
    pub from: String,
    pub format: OutputFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Markdown,
    Json,
    Concat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowSettings {
    #[serde(default = "default_max_parallelism")]
    pub max_parallelism: usize,
    #[serde(default)]
    pub fail_fast: bool,
    pub timeout_ms: Option<u64>,
}

fn default_max_parallelism() -> usize {
    1
}

impl Default for FlowSettings {
    fn default() -> Self {
        Self {
            max_parallelism: default_max_parallelism(),
            fail_fast: false,
            timeout_ms: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepType {
    Agent,
    Gate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub step_type: StepType,
    pub agent: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    pub input: StepInput,
    #[serde(default)]
    pub retry: RetryPolicy,
    pub gate: Option<GateConfig>,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputSource {
    Request,
    Step,
    Literal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepInput {
    pub source: InputSource,
    pub step_id: Option<String>,
    #[serde(default = "default_transform")]
    pub transform: String,
    #[serde(default)]
    pub literal: Option<Value>,
}

fn default_transform() -> String {
    "passthrough".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: 0,
        }
    }
}

// ============================================================================
// StepResult
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepOutput {
    pub content: String,
    #[serde(default)]
    pub meta: HashMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    pub status: StepStatus,
    pub attempts: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub output: Option<StepOutput>,
    pub error: Option<crate::errors::ErrorInfo>,
}

impl StepResult {
    pub fn pending(step_id: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Pending,
            attempts: 0,
            started_at,
            ended_at: None,
            output: None,
            error: None,
        }
    }
}

// ============================================================================
// Gate / Criteria / Evaluation
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OnFail {
    Retry,
    Halt,
    ContinueWithWarning,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CriterionRef {
    Name(String),
    Inline(Criterion),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    pub criteria: Vec<CriterionRef>,
    #[serde(default = "default_gate_threshold")]
    pub threshold: f64,
    #[serde(default = "default_on_fail")]
    pub on_fail: OnFail,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Criterion {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default)]
    pub required: bool,
    #[serde(default = "default_criterion_threshold")]
    pub threshold: f64,
}

impl Criterion {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            weight: default_weight(),
            required: false,
            threshold: default_criterion_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CriterionScore {
    pub score: f64,
    pub reasoning: String,
    #[serde(default)]
    pub issues: Vec<String>,
    pub passed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub overall_score: f64,
    pub criteria_scores: HashMap<String, CriterionScore>,
    pub pass: bool,
    pub feedback: String,
    #[serde(default)]
    pub suggestions: Vec<String>,
    pub evaluated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GateAction {
    Passed,
    Retry,
    Halted,
    ContinuedWithWarning,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateResult {
    pub passed: bool,
    pub score: f64,
    pub evaluation: Option<EvaluationResult>,
    pub attempts: u32,
    pub action: GateAction,
    pub duration_ms: u64,
    pub error: Option<crate::errors::ErrorInfo>,
}

// ============================================================================
// Feedback loop (Reflexion)
// ============================================================================

fn default_min_improvement() -> f64 {
    0.02
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackConfig {
    pub criteria: Vec<CriterionRef>,
    pub target_score: f64,
    pub max_iterations: u32,
    #[serde(default = "default_min_improvement")]
    pub min_improvement: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StopReason {
    TargetReached,
    ScoreDegraded,
    NoImprovement,
    Error,
    MaxIterations,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationResult {
    pub iteration: u32,
    pub content: String,
    pub gate_result: GateResult,
    pub improvement: f64,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackResult {
    pub success: bool,
    pub stop_reason: StopReason,
    pub final_content: String,
    pub final_score: f64,
    pub total_iterations: u32,
    pub history: Vec<IterationResult>,
}

// ============================================================================
// Activity journal
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub id: Uuid,
    pub trace_id: Uuid,
    pub actor: String,
    pub agent_id: Option<String>,
    pub action_type: String,
    pub target: Option<String>,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
    pub level: ActivityLevel,
}

impl ActivityEntry {
    pub fn new(
        trace_id: Uuid,
        actor: impl Into<String>,
        action_type: impl Into<String>,
        payload: Value,
        level: ActivityLevel,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            trace_id,
            actor: actor.into(),
            agent_id: None,
            action_type: action_type.into(),
            target: None,
            payload,
            timestamp: Utc::now(),
            level,
        }
    }

    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }
}

// ============================================================================
// Agent Executor result
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub name: String,
    #[serde(default)]
    pub arguments: HashMap<String, Value>,
    pub result_summary: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangesetResult {
    pub branch: String,
    pub commit_sha: String,
    #[serde(default)]
    pub files_changed: Vec<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCallRecord>,
    pub execution_time_ms: u64,
}

// ============================================================================
// Flow run result
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowStatus {
    Succeeded,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowResult {
    pub status: FlowStatus,
    pub output: Option<String>,
    pub steps: HashMap<String, StepResult>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_detects_conflicting_selectors() {
        let req = Request::new(
            "do something",
            RequestMetadata {
                flow: Some("f1".into()),
                agent: Some("a1".into()),
                portal: None,
                extra: HashMap::new(),
            },
        );
        assert!(req.has_conflicting_selectors());
    }

    #[test]
    fn request_without_selectors_is_fine() {
        let req = Request::new("hi", RequestMetadata::default());
        assert!(!req.has_conflicting_selectors());
    }

    #[test]
    fn step_input_defaults_to_passthrough_transform() {
        let json = r#"{"source":"request"}"#;
        let input: StepInput = serde_json::from_str(json).unwrap();
        assert_eq!(input.transform, "passthrough");
    }

    #[test]
    fn flow_settings_default_parallelism_is_one() {
        let settings = FlowSettings::default();
        assert_eq!(settings.max_parallelism, 1);
        assert!(!settings.fail_fast);
    }

    #[test]
    fn gate_config_defaults_match_spec() {
        let json = r#"{"criteria":["correctness"]}"#;
        let gate: GateConfig = serde_json::from_str(json).unwrap();
        assert_eq!(gate.threshold, 0.8);
        assert_eq!(gate.on_fail, OnFail::Halt);
        assert_eq!(gate.max_retries, 1);
    }

    #[test]
    fn criterion_default_threshold_is_point_seven() {
        let c = Criterion::new("correctness");
        assert_eq!(c.threshold, 0.7);
        assert_eq!(c.weight, 1.0);
        assert!(!c.required);
    }
}
