//! Agent Executor (§4.8): portal/permission checks, blueprint load, prompt
//! construction, provider call, response validation, and git audit/revert.

use std::collections::HashMap;
use std::time::Instant;

use serde_json::{json, Value};
use uuid::Uuid;

use crate::blueprint;
use crate::config::ExecutionLimits;
use crate::errors::{ErrorInfo, Result, RunnerError};
use crate::git::{self, Git};
use crate::journal::ActivityJournal;
use crate::portal::PortalRegistry;
use crate::protocol::{ActivityLevel, ChangesetResult};
use crate::provider::{GenerateOptions, ModelProvider};

/// Everything a single `execute_step` call needs, gathered up front so the
/// function signature stays small as the pipeline grows.
pub struct ExecutionRequest<'a> {
    pub trace_id: Uuid,
    pub request_id: &'a str,
    pub agent_id: &'a str,
    pub portal: &'a str,
    pub blueprint_path: std::path::PathBuf,
    pub user_request: &'a str,
    pub execution_plan: &'a str,
}

/// Runs the full pipeline and returns the resulting changeset. Errors
/// propagate to the caller (the Flow Runner) after being journalled.
pub async fn execute_step(
    req: &ExecutionRequest<'_>,
    portals: &PortalRegistry,
    provider: Option<&dyn ModelProvider>,
    journal: &ActivityJournal,
    limits: &ExecutionLimits,
) -> Result<ChangesetResult> {
    let started = Instant::now();

    let result = run_pipeline(req, portals, provider, journal, limits, started).await;

    match &result {
        Ok(changeset) => {
            journal.log(
                crate::protocol::ActivityEntry::new(
                    req.trace_id,
                    "executor",
                    "execution_completed",
                    json!({
                        "branch": changeset.branch,
                        "files_changed": changeset.files_changed.len(),
                        "execution_time_ms": changeset.execution_time_ms,
                    }),
                    ActivityLevel::Info,
                )
                .with_agent(req.agent_id)
                .with_target(req.portal),
            );
        }
        Err(err) => {
            journal.log(
                crate::protocol::ActivityEntry::new(
                    req.trace_id,
                    "executor",
                    "execution_failed",
                    json!({"kind": err.kind(), "message": err.to_string()}),
                    ActivityLevel::Error,
                )
                .with_agent(req.agent_id)
                .with_target(req.portal),
            );
        }
    }

    result
}

async fn run_pipeline(
    req: &ExecutionRequest<'_>,
    portals: &PortalRegistry,
    provider: Option<&dyn ModelProvider>,
    journal: &ActivityJournal,
    limits: &ExecutionLimits,
    started: Instant,
) -> Result<ChangesetResult> {
    portals.get(req.portal)?;
    portals.check_agent(req.portal, req.agent_id)?;

    let agent_blueprint = blueprint::load(req.agent_id, &req.blueprint_path)?;
    let security_mode = portals.security_mode(req.portal)?;

    journal.log(
        crate::protocol::ActivityEntry::new(
            req.trace_id,
            "executor",
            "execution_started",
            json!({"agent_id": req.agent_id, "portal": req.portal}),
            ActivityLevel::Info,
        )
        .with_agent(req.agent_id)
        .with_target(req.portal),
    );

    let changeset = match provider {
        Some(provider) => {
            let prompt = build_prompt(req, &agent_blueprint.system_prompt, security_mode);
            match provider.generate(&prompt, GenerateOptions::default()).await {
                Ok(text) => parse_changeset(&text, req, started),
                // transient kinds propagate as-is so the step's retry policy
                // can act on them (§4.9, §7); anything else is a failed agent
                // call with no more specific home, so it becomes the
                // executor's catch-all rather than a faked success.
                Err(err) if err.is_transient() => return Err(err),
                Err(err) => {
                    return Err(RunnerError::AgentError {
                        message: format!("provider call failed: {err}"),
                    })
                }
            }
        }
        None => synthesize_changeset(req, started),
    };

    // Both security modes forbid unreviewed writes outside the changeset;
    // the audit phase is unconditional regardless of which one is active.
    let root = portals.root(req.portal)?.to_path_buf();
    let git = Git::new(root, limits.git_timeout);
    let authorized = git::authorized_set(&changeset.files_changed);
    let unauthorized = git::audit(&git, &authorized).await?;
    if !unauthorized.is_empty() {
        git::revert(&git, &unauthorized, limits.revert_concurrency).await?;
    }

    Ok(changeset)
}

fn build_prompt(req: &ExecutionRequest<'_>, system_prompt: &str, security_mode: crate::config::SecurityMode) -> String {
    format!(
        "{system_prompt}\n\n--- execution context ---\ntrace_id: {trace_id}\nrequest_id: {request_id}\nportal: {portal}\nsecurity_mode: {security_mode:?}\n--- end context ---\n\nUser request:\n{user_request}\n\nExecution plan:\n{execution_plan}\n\nRespond with a single JSON object matching: \
         {{\"branch\": string, \"commit_sha\": string, \"files_changed\": [string], \"description\": string, \"tool_calls\": [...], \"execution_time_ms\": number}}.",
        trace_id = req.trace_id,
        request_id = req.request_id,
        portal = req.portal,
        user_request = req.user_request,
        execution_plan = req.execution_plan,
    )
}

fn extract_json_object(text: &str) -> Option<Value> {
    if let Some(start) = text.find("```") {
        let after_fence = &text[start + 3..];
        let after_lang = after_fence.find('\n').map(|i| &after_fence[i + 1..]).unwrap_or(after_fence);
        if let Some(end) = after_lang.find("```") {
            if let Ok(value) = serde_json::from_str::<Value>(after_lang[..end].trim()) {
                return Some(value);
            }
        }
    }
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end > start {
        serde_json::from_str::<Value>(&text[start..=end]).ok()
    } else {
        None
    }
}

fn parse_changeset(text: &str, req: &ExecutionRequest<'_>, started: Instant) -> ChangesetResult {
    match extract_json_object(text).and_then(|v| serde_json::from_value::<ChangesetResult>(v).ok()) {
        Some(changeset) => changeset,
        None => synthesize_changeset(req, started),
    }
}

/// A deterministic placeholder used when no provider is configured, or the
/// provider's response couldn't be parsed into a `ChangesetResult`.
fn synthesize_changeset(req: &ExecutionRequest<'_>, started: Instant) -> ChangesetResult {
    let trace_prefix: String = req.trace_id.simple().to_string().chars().take(8).collect();
    ChangesetResult {
        branch: format!("auto/{}-{}", req.request_id, trace_prefix),
        commit_sha: "0".repeat(40),
        files_changed: Vec::new(),
        description: String::new(),
        tool_calls: Vec::new(),
        execution_time_ms: started.elapsed().as_millis() as u64,
    }
}

/// Turns a [`RunnerError`] into the shape the journal and `StepResult`
/// expect; kept here since the executor is the component that most often
/// needs to bridge from `RunnerError` to `ErrorInfo` outside a `?`.
pub fn error_payload(err: &RunnerError) -> HashMap<&'static str, String> {
    let info = ErrorInfo::from(err);
    HashMap::from([("kind", info.kind), ("message", info.message)])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExecutionLimits, PortalSpec, SecurityMode};
    use crate::provider::MockProvider;
    use std::collections::HashMap as StdHashMap;
    use std::time::Duration;

    fn portals(path: std::path::PathBuf, mode: SecurityMode) -> PortalRegistry {
        let mut map = StdHashMap::new();
        map.insert(
            "local".to_string(),
            PortalSpec {
                path,
                allowed_agents: vec!["reviewer".to_string()],
                security_mode: mode,
            },
        );
        PortalRegistry::new(map)
    }

    fn blueprint_file(dir: &std::path::Path) -> std::path::PathBuf {
        let path = dir.join("reviewer.md");
        std::fs::write(&path, "---\nmodel: m\nprovider: p\n---\nYou review code.").unwrap();
        path
    }

    fn journal() -> ActivityJournal {
        ActivityJournal::in_memory(50, 250).unwrap()
    }

    #[tokio::test]
    async fn synthesizes_changeset_when_no_provider_configured() {
        let dir = std::env::temp_dir().join(format!("exec-test-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let bp = blueprint_file(&dir);
        let registry = portals(dir.clone(), SecurityMode::Sandboxed);
        let journal = journal();
        let limits = ExecutionLimits {
            git_timeout: Duration::from_secs(2),
            ..ExecutionLimits::default()
        };

        // not a real git repo, so audit will fail with git_error; use hybrid
        // with no audit expectation isn't possible here, so we just assert
        // the pipeline gets past permission/blueprint stages by checking the
        // returned error is a git error, not permission/blueprint.
        let req = ExecutionRequest {
            trace_id: Uuid::new_v4(),
            request_id: "req-1",
            agent_id: "reviewer",
            portal: "local",
            blueprint_path: bp,
            user_request: "do the thing",
            execution_plan: "step 1",
        };
        let result = execute_step(&req, &registry, None, &journal, &limits).await;
        assert!(result.is_err());
        assert_eq!(result.unwrap_err().kind(), "git_error");
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn rejects_agent_not_allowed_on_portal() {
        let dir = std::env::temp_dir().join(format!("exec-test-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let bp = blueprint_file(&dir);
        let registry = portals(dir.clone(), SecurityMode::Sandboxed);
        let journal = journal();
        let limits = ExecutionLimits::default();

        let req = ExecutionRequest {
            trace_id: Uuid::new_v4(),
            request_id: "req-1",
            agent_id: "intruder",
            portal: "local",
            blueprint_path: bp,
            user_request: "x",
            execution_plan: "x",
        };
        let err = execute_step(&req, &registry, None, &journal, &limits).await.unwrap_err();
        assert_eq!(err.kind(), "permission_denied");
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn missing_blueprint_fails_before_provider_call() {
        let dir = std::env::temp_dir().join(format!("exec-test-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let registry = portals(dir.clone(), SecurityMode::Sandboxed);
        let journal = journal();
        let limits = ExecutionLimits::default();

        let req = ExecutionRequest {
            trace_id: Uuid::new_v4(),
            request_id: "req-1",
            agent_id: "reviewer",
            portal: "local",
            blueprint_path: dir.join("missing.md"),
            user_request: "x",
            execution_plan: "x",
        };
        let err = execute_step(&req, &registry, None, &journal, &limits).await.unwrap_err();
        assert_eq!(err.kind(), "blueprint_missing");
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn non_transient_provider_failure_becomes_agent_error() {
        let dir = std::env::temp_dir().join(format!("exec-test-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let bp = blueprint_file(&dir);
        let registry = portals(dir.clone(), SecurityMode::Sandboxed);
        let journal = journal();
        let limits = ExecutionLimits::default();
        let provider = MockProvider::with_results(vec![Err(RunnerError::InvalidInput {
            message: "the model rejected the prompt".to_string(),
        })]);

        let req = ExecutionRequest {
            trace_id: Uuid::new_v4(),
            request_id: "req-1",
            agent_id: "reviewer",
            portal: "local",
            blueprint_path: bp,
            user_request: "x",
            execution_plan: "x",
        };
        let err = execute_step(&req, &registry, Some(&provider), &journal, &limits).await.unwrap_err();
        assert_eq!(err.kind(), "agent_error");
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn transient_provider_failure_propagates_its_own_kind() {
        let dir = std::env::temp_dir().join(format!("exec-test-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let bp = blueprint_file(&dir);
        let registry = portals(dir.clone(), SecurityMode::Sandboxed);
        let journal = journal();
        let limits = ExecutionLimits::default();
        let provider = MockProvider::with_results(vec![Err(RunnerError::Timeout {
            operation: "provider.generate".to_string(),
            budget_ms: 10,
        })]);

        let req = ExecutionRequest {
            trace_id: Uuid::new_v4(),
            request_id: "req-1",
            agent_id: "reviewer",
            portal: "local",
            blueprint_path: bp,
            user_request: "x",
            execution_plan: "x",
        };
        let err = execute_step(&req, &registry, Some(&provider), &journal, &limits).await.unwrap_err();
        assert_eq!(err.kind(), "timeout");
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn parses_fenced_json_changeset() {
        let text = "Done.\n```json\n{\"branch\": \"b\", \"commit_sha\": \"abc\", \"files_changed\": [\"a.rs\"], \"execution_time_ms\": 5}\n```";
        let req = ExecutionRequest {
            trace_id: Uuid::new_v4(),
            request_id: "r",
            agent_id: "a",
            portal: "p",
            blueprint_path: "x".into(),
            user_request: "x",
            execution_plan: "x",
        };
        let changeset = parse_changeset(text, &req, Instant::now());
        assert_eq!(changeset.branch, "b");
        assert_eq!(changeset.files_changed, vec!["a.rs".to_string()]);
    }

    #[test]
    fn falls_back_to_synthetic_changeset_on_garbage() {
        let req = ExecutionRequest {
            trace_id: Uuid::new_v4(),
            request_id: "req-9",
            agent_id: "a",
            portal: "p",
            blueprint_path: "x".into(),
            user_request: "x",
            execution_plan: "x",
        };
        let changeset = parse_changeset("not json at all", &req, Instant::now());
        assert!(changeset.branch.starts_with("auto/req-9-"));
        assert_eq!(changeset.commit_sha, "0".repeat(40));
    }

    #[tokio::test]
    async fn mock_provider_is_reachable_via_trait_object() {
        let provider = MockProvider::constant("irrelevant");
        let opts = GenerateOptions::default();
        assert!(provider.generate("p", opts).await.is_ok());
    }
}
