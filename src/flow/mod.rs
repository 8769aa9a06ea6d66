//! Flow Runner (§4.9): resolves a [`Flow`]'s `depends_on` DAG, runs
//! independent steps concurrently up to `settings.max_parallelism`, wires
//! each step's inputs from its predecessors, and enforces per-step retry,
//! timeout, and fail-fast policy.
//!
//! Modeled the way the source's DAG scheduler is modeled (§9 "Concurrency
//! core"): steps are nodes with explicit `pending → ready → running →
//! {succeeded | failed | skipped | cancelled}` transitions, the runner's
//! main loop is the only mutator of the ready/in-flight partition, and a
//! `Semaphore` bounds concurrency. `tokio_util::sync::CancellationToken`
//! carries the single cancellation signal described in §5 into every
//! suspension point; a step observes it at the one suspension point that
//! matters for this crate — the await over its own executor/gate call —
//! which is coarser than per-subprocess-call cancellation but keeps the
//! token plumbing out of `executor`/`git`, which already own their own
//! per-call timeouts.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::json;
use tokio::sync::{Mutex, Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::ExecutionLimits;
use crate::context::{Context, TransformRegistry};
use crate::criteria::CriteriaRegistry;
use crate::errors::{ErrorInfo, Result, RunnerError};
use crate::executor::{self, ExecutionRequest};
use crate::gate;
use crate::journal::ActivityJournal;
use crate::portal::PortalRegistry;
use crate::protocol::{
    ActivityEntry, ActivityLevel, Flow, GateAction, InputSource, OutputFormat, Request, Step,
    StepInput, StepOutput, StepResult, StepStatus, StepType,
};
use crate::provider::ModelProvider;
use crate::validation;

/// Everything a flow run needs besides the [`Flow`] and [`Request`]
/// themselves, gathered so the entry point doesn't grow an unwieldy
/// parameter list as the pipeline matures.
pub struct RunnerDeps<'a> {
    pub portals: &'a PortalRegistry,
    pub provider: Option<&'a dyn ModelProvider>,
    pub journal: &'a ActivityJournal,
    pub criteria: &'a CriteriaRegistry,
    pub transforms: &'a TransformRegistry,
    pub blueprint_dir: &'a Path,
    pub limits: &'a ExecutionLimits,
}

/// Runs `flow` against `request` to completion and returns the shaped
/// [`crate::protocol::FlowResult`]. Performs structural + resource-limit
/// validation first; a flow that fails either never schedules a step.
pub async fn run(flow: &Flow, request: &Request, deps: &RunnerDeps<'_>) -> Result<crate::protocol::FlowResult> {
    validation::validate_or_err(flow)?;
    let limit_check = crate::config::validate_limits(flow.steps.len(), deps.limits);
    if !limit_check.passed {
        return Err(RunnerError::ConfigInvalid {
            message: limit_check
                .violations
                .iter()
                .map(|v| v.message.clone())
                .collect::<Vec<_>>()
                .join("; "),
        });
    }

    deps.journal.log(ActivityEntry::new(
        request.trace_id,
        "flow",
        "flow.started",
        json!({"flow_id": flow.id, "request_id": request.request_id}),
        ActivityLevel::Info,
    ));

    let run = FlowRun::new(flow, request, deps);
    let result = run.execute().await;

    deps.journal.log(ActivityEntry::new(
        request.trace_id,
        "flow",
        match result.status {
            crate::protocol::FlowStatus::Succeeded => "flow.succeeded",
            crate::protocol::FlowStatus::Failed => "flow.failed",
            crate::protocol::FlowStatus::Cancelled => "flow.cancelled",
        },
        json!({"flow_id": flow.id}),
        ActivityLevel::Info,
    ));

    Ok(result)
}

// ============================================================================
// Internal scheduling state
// ============================================================================

struct StepNode {
    step: Step,
    declared_index: usize,
    dependents: Vec<String>,
}

/// Shared, lock-guarded state the concurrently-running step tasks mutate.
/// Every field here is behind its own lock (or is itself lock-free, like
/// the semaphore/notify/cancellation token) so no single task ever needs
/// to hold more than one of these at once.
struct Shared<'a> {
    flow: &'a Flow,
    request: &'a Request,
    deps: &'a RunnerDeps<'a>,
    nodes: HashMap<String, StepNode>,
    results: Mutex<HashMap<String, StepResult>>,
    resolved: Mutex<HashSet<String>>,
    ready: Mutex<Vec<String>>,
    in_flight: Mutex<HashSet<String>>,
    semaphore: Semaphore,
    cancel: CancellationToken,
    fail_fast_triggered: Mutex<bool>,
    step_completed: Notify,
}

struct FlowRun<'a> {
    shared: Arc<Shared<'a>>,
}

impl<'a> FlowRun<'a> {
    fn new(flow: &'a Flow, request: &'a Request, deps: &'a RunnerDeps<'a>) -> Self {
        let mut nodes: HashMap<String, StepNode> = HashMap::new();
        for (index, step) in flow.steps.iter().enumerate() {
            nodes.insert(
                step.id.clone(),
                StepNode {
                    step: step.clone(),
                    declared_index: index,
                    dependents: Vec::new(),
                },
            );
        }
        let ids: Vec<String> = nodes.keys().cloned().collect();
        for id in &ids {
            let deps_of: Vec<String> = nodes[id].step.depends_on.clone();
            for dep in deps_of {
                if let Some(dep_node) = nodes.get_mut(&dep) {
                    dep_node.dependents.push(id.clone());
                }
            }
        }

        let mut ready: Vec<String> = nodes
            .iter()
            .filter(|(_, node)| node.step.depends_on.is_empty())
            .map(|(id, _)| id.clone())
            .collect();
        ready.sort_by_key(|id| nodes[id].declared_index);

        let max_parallelism = flow
            .settings
            .max_parallelism
            .min(deps.limits.max_parallelism_cap)
            .max(1);

        let shared = Arc::new(Shared {
            flow,
            request,
            deps,
            nodes,
            results: Mutex::new(HashMap::new()),
            resolved: Mutex::new(HashSet::new()),
            ready: Mutex::new(ready),
            in_flight: Mutex::new(HashSet::new()),
            semaphore: Semaphore::new(max_parallelism),
            cancel: CancellationToken::new(),
            fail_fast_triggered: Mutex::new(false),
            step_completed: Notify::new(),
        });

        Self { shared }
    }

    async fn execute(self) -> crate::protocol::FlowResult {
        loop {
            let to_launch: Vec<String> = {
                let mut ready = self.shared.ready.lock().await;
                std::mem::take(&mut *ready)
            };

            for step_id in to_launch {
                if self.shared.cancel.is_cancelled() {
                    self.mark_cancelled(&step_id).await;
                    continue;
                }
                self.shared.in_flight.lock().await.insert(step_id.clone());
                let shared = Arc::clone(&self.shared);
                tokio::spawn(async move {
                    let _permit = shared.semaphore.acquire().await.expect("semaphore closed");
                    run_step(Arc::clone(&shared), step_id.clone()).await;
                    shared.in_flight.lock().await.remove(&step_id);
                    shared.step_completed.notify_waiters();
                });
            }

            let done = {
                let ready = self.shared.ready.lock().await;
                let in_flight = self.shared.in_flight.lock().await;
                ready.is_empty() && in_flight.is_empty()
            };
            if done {
                break;
            }

            self.shared.step_completed.notified().await;
        }

        self.compose_result().await
    }

    async fn mark_cancelled(&self, step_id: &str) {
        let now = Utc::now();
        let mut results = self.shared.results.lock().await;
        results.insert(
            step_id.to_string(),
            StepResult {
                step_id: step_id.to_string(),
                status: StepStatus::Cancelled,
                attempts: 0,
                started_at: now,
                ended_at: Some(now),
                output: None,
                error: None,
            },
        );
        self.shared.resolved.lock().await.insert(step_id.to_string());
    }

    async fn compose_result(&self) -> crate::protocol::FlowResult {
        let results = self.shared.results.lock().await.clone();
        let any_failed = results
            .values()
            .any(|r| r.status == StepStatus::Failed);
        let any_cancelled = results
            .values()
            .any(|r| r.status == StepStatus::Cancelled);

        let status = if any_failed {
            crate::protocol::FlowStatus::Failed
        } else if any_cancelled {
            crate::protocol::FlowStatus::Cancelled
        } else {
            crate::protocol::FlowStatus::Succeeded
        };

        let output = if status == crate::protocol::FlowStatus::Succeeded {
            shape_output(self.shared.flow, &results)
        } else {
            None
        };

        crate::protocol::FlowResult {
            status,
            output,
            steps: results,
        }
    }
}

/// Shapes the terminal output per `flow.output.format`. Returns `None`
/// (rather than erroring the whole run) on `json` content that fails to
/// parse, matching `compose_result`'s policy of only shaping output for
/// an otherwise-successful run.
fn shape_output(flow: &Flow, results: &HashMap<String, StepResult>) -> Option<String> {
    match flow.output.format {
        OutputFormat::Markdown => results
            .get(&flow.output.from)
            .and_then(|r| r.output.as_ref())
            .map(|o| o.content.clone()),
        OutputFormat::Json => {
            let content = results.get(&flow.output.from)?.output.as_ref()?.content.clone();
            serde_json::from_str::<serde_json::Value>(&content).ok()?;
            Some(content)
        }
        OutputFormat::Concat => {
            let mut ordered: Vec<&Step> = Vec::new();
            // declaration order is recovered from the flow itself since
            // `results` doesn't preserve it.
            for step in &flow.steps {
                if results
                    .get(&step.id)
                    .map(|r| r.status == StepStatus::Succeeded)
                    .unwrap_or(false)
                {
                    ordered.push(step);
                }
            }
            let parts: Vec<String> = ordered
                .into_iter()
                .filter_map(|s| results.get(&s.id).and_then(|r| r.output.as_ref()).map(|o| o.content.clone()))
                .collect();
            Some(parts.join("\n\n"))
        }
    }
}

// ============================================================================
// Per-step execution
// ============================================================================

/// Runs one step to its terminal status, records the `StepResult`, and
/// wakes dependents (propagating a cascading skip on failure, per §4.9
/// rule 4 — independent of `fail_fast`, which additionally cancels
/// everything still in flight).
async fn run_step(shared: Arc<Shared<'_>>, step_id: String) {
    // a failed dependency resolved between scheduling and launch: skip
    // without ever invoking the executor/gate.
    let deps_ok = {
        let node = &shared.nodes[&step_id];
        let results = shared.results.lock().await;
        node.step
            .depends_on
            .iter()
            .all(|d| results.get(d).map(|r| r.status == StepStatus::Succeeded).unwrap_or(false))
    };

    let started_at = Utc::now();
    let result = if !deps_ok {
        StepResult {
            step_id: step_id.clone(),
            status: StepStatus::Skipped,
            attempts: 0,
            started_at,
            ended_at: Some(Utc::now()),
            output: None,
            error: Some(ErrorInfo {
                kind: "skipped".to_string(),
                message: "a dependency did not succeed".to_string(),
            }),
        }
    } else {
        shared.deps.journal.log(
            ActivityEntry::new(
                shared.request.trace_id,
                "flow",
                "step.started",
                json!({"step_id": step_id}),
                ActivityLevel::Info,
            )
            .with_target(step_id.as_str()),
        );

        let outcome = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => CancelledOrResult::Cancelled,
            r = execute_one_step(&shared, &step_id) => CancelledOrResult::Ran(r),
        };

        match outcome {
            CancelledOrResult::Cancelled => StepResult {
                step_id: step_id.clone(),
                status: StepStatus::Cancelled,
                attempts: 0,
                started_at,
                ended_at: Some(Utc::now()),
                output: None,
                error: None,
            },
            CancelledOrResult::Ran(result) => result,
        }
    };

    let status = result.status;
    {
        let mut results = shared.results.lock().await;
        results.insert(step_id.clone(), result);
    }
    shared.resolved.lock().await.insert(step_id.clone());

    match status {
        StepStatus::Succeeded => on_step_succeeded(&shared, &step_id).await,
        StepStatus::Failed => on_step_failed(&shared, &step_id).await,
        StepStatus::Skipped | StepStatus::Cancelled => {
            propagate_skip(&shared, &step_id).await;
        }
        StepStatus::Pending | StepStatus::Running => unreachable!("terminal status expected"),
    }
}

enum CancelledOrResult {
    Cancelled,
    Ran(StepResult),
}

async fn on_step_succeeded(shared: &Arc<Shared<'_>>, step_id: &str) {
    let node = &shared.nodes[step_id];
    let mut newly_ready = Vec::new();
    {
        let results = shared.results.lock().await;
        for dependent_id in &node.dependents {
            let dependent = &shared.nodes[dependent_id];
            let all_succeeded = dependent
                .step
                .depends_on
                .iter()
                .all(|d| results.get(d).map(|r| r.status == StepStatus::Succeeded).unwrap_or(false));
            let any_resolved_not_succeeded = dependent.step.depends_on.iter().any(|d| {
                results
                    .get(d)
                    .map(|r| r.status != StepStatus::Succeeded)
                    .unwrap_or(false)
            });
            if all_succeeded {
                newly_ready.push(dependent_id.clone());
            } else if any_resolved_not_succeeded {
                // handled by propagate_skip from whichever sibling failed
            }
        }
    }
    newly_ready.sort_by_key(|id| shared.nodes[id].declared_index);
    if !newly_ready.is_empty() {
        shared.ready.lock().await.extend(newly_ready);
    }
}

async fn on_step_failed(shared: &Arc<Shared<'_>>, step_id: &str) {
    propagate_skip(shared, step_id).await;

    if shared.flow.settings.fail_fast {
        let mut triggered = shared.fail_fast_triggered.lock().await;
        if !*triggered {
            *triggered = true;
            shared.cancel.cancel();
        }
    }
}

/// Marks every not-yet-started transitive dependent of `step_id` as
/// `skipped` and recurses — a single failure can orphan an entire
/// downstream subgraph.
async fn propagate_skip(shared: &Arc<Shared<'_>>, step_id: &str) {
    let node = &shared.nodes[step_id];
    let mut queue: Vec<String> = node.dependents.clone();
    let mut visited = HashSet::new();

    while let Some(id) = queue.pop() {
        if !visited.insert(id.clone()) {
            continue;
        }
        let already_resolved = shared.resolved.lock().await.contains(&id);
        let in_flight = shared.in_flight.lock().await.contains(&id);
        if already_resolved || in_flight {
            continue;
        }

        let now = Utc::now();
        shared.results.lock().await.insert(
            id.clone(),
            StepResult {
                step_id: id.clone(),
                status: StepStatus::Skipped,
                attempts: 0,
                started_at: now,
                ended_at: Some(now),
                output: None,
                error: Some(ErrorInfo {
                    kind: "skipped".to_string(),
                    message: "a dependency failed".to_string(),
                }),
            },
        );
        shared.resolved.lock().await.insert(id.clone());
        shared.deps.journal.log(
            ActivityEntry::new(
                shared.request.trace_id,
                "flow",
                "step.skipped",
                json!({"step_id": id}),
                ActivityLevel::Warn,
            )
            .with_target(id.as_str()),
        );

        queue.extend(shared.nodes[&id].dependents.clone());
    }
}

/// Dispatches to the agent or gate pipeline and returns the finished
/// `StepResult`, already journalled (`step.succeeded` / `step.failed`).
async fn execute_one_step(shared: &Arc<Shared<'_>>, step_id: &str) -> StepResult {
    let step = shared.nodes[step_id].step.clone();
    let started_at = Utc::now();

    let result = match step.step_type {
        StepType::Agent => run_agent_step(shared, &step, started_at).await,
        StepType::Gate => run_gate_step(shared, &step, started_at).await,
    };

    shared.deps.journal.log(
        ActivityEntry::new(
            shared.request.trace_id,
            "flow",
            if result.status == StepStatus::Succeeded {
                "step.succeeded"
            } else {
                "step.failed"
            },
            json!({"step_id": step_id, "attempts": result.attempts}),
            if result.status == StepStatus::Succeeded {
                ActivityLevel::Info
            } else {
                ActivityLevel::Error
            },
        )
        .with_target(step_id.to_string()),
    );

    result
}

fn effective_timeout(step: &Step, flow: &Flow, limits: &ExecutionLimits) -> Duration {
    step.timeout_ms
        .or(flow.settings.timeout_ms)
        .map(Duration::from_millis)
        .unwrap_or(limits.default_step_timeout)
}

/// Resolves a step's `input` spec into the text the step acts on:
/// `source=request` forwards the request body, `source=step` forwards the
/// named predecessor's output content, `source=literal` forwards the
/// literal value rendered as a string. The configured transform is
/// applied last.
async fn wire_input(shared: &Arc<Shared<'_>>, input: &StepInput) -> Result<String> {
    let raw = match input.source {
        InputSource::Request => shared.request.body.clone(),
        InputSource::Literal => match &input.literal {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        },
        InputSource::Step => {
            let step_id = input.step_id.as_ref().ok_or_else(|| RunnerError::InvalidInput {
                message: "input.source=step requires step_id".to_string(),
            })?;
            let results = shared.results.lock().await;
            results
                .get(step_id)
                .and_then(|r| r.output.as_ref())
                .map(|o| o.content.clone())
                .ok_or_else(|| RunnerError::InvalidInput {
                    message: format!("step '{step_id}' has no output yet"),
                })?
        }
    };

    let ctx = Context::new();
    shared.deps.transforms.apply(&input.transform, &raw, &ctx)
}

async fn run_agent_step(shared: &Arc<Shared<'_>>, step: &Step, started_at: chrono::DateTime<Utc>) -> StepResult {
    let content = match wire_input(shared, &step.input).await {
        Ok(c) => c,
        Err(err) => {
            return StepResult {
                step_id: step.id.clone(),
                status: StepStatus::Failed,
                attempts: 0,
                started_at,
                ended_at: Some(Utc::now()),
                output: None,
                error: Some(ErrorInfo::from(&err)),
            };
        }
    };

    let (result, attempts) = run_agent_with_retry(shared, step, &content).await;

    match result {
        Ok(changeset) => StepResult {
            step_id: step.id.clone(),
            status: StepStatus::Succeeded,
            attempts,
            started_at,
            ended_at: Some(Utc::now()),
            output: Some(StepOutput {
                content: if changeset.description.is_empty() {
                    changeset.branch.clone()
                } else {
                    changeset.description.clone()
                },
                meta: HashMap::from([
                    ("branch".to_string(), json!(changeset.branch)),
                    ("commit_sha".to_string(), json!(changeset.commit_sha)),
                    ("files_changed".to_string(), json!(changeset.files_changed)),
                ]),
            }),
            error: None,
        },
        Err(err) => StepResult {
            step_id: step.id.clone(),
            status: StepStatus::Failed,
            attempts,
            started_at,
            ended_at: Some(Utc::now()),
            output: None,
            error: Some(ErrorInfo::from(&err)),
        },
    }
}

/// Runs the executor with this crate's retry policy, applying a per-attempt
/// timeout and journalling each transient retry as `step.attempt_failed`.
async fn run_agent_with_retry(
    shared: &Arc<Shared<'_>>,
    step: &Step,
    content: &str,
) -> (Result<crate::protocol::ChangesetResult>, u32) {
    let budget = effective_timeout(step, shared.flow, shared.deps.limits);
    let portal_alias = shared
        .request
        .metadata
        .portal
        .clone()
        .unwrap_or_else(|| "default".to_string());

    let outcome = crate::retry::execute_with_retry(&step.retry, |attempt| {
        let shared = Arc::clone(shared);
        let step = step.clone();
        let content = content.to_string();
        let portal_alias = portal_alias.clone();
        async move {
            if attempt > 1 {
                shared.deps.journal.log(
                    ActivityEntry::new(
                        shared.request.trace_id,
                        "flow",
                        "step.attempt_failed",
                        json!({"step_id": step.id, "attempt": attempt - 1}),
                        ActivityLevel::Warn,
                    )
                    .with_target(step.id.as_str()),
                );
            }

            let lock = shared.deps.portals.lock_for(&portal_alias);
            let _guard = match &lock {
                Some(mutex) => Some(mutex.lock().await),
                None => None,
            };

            let blueprint_path = blueprint_path_for(shared.deps.blueprint_dir, &step.agent);
            let req = ExecutionRequest {
                trace_id: shared.request.trace_id,
                request_id: &shared.request.request_id,
                agent_id: &step.agent,
                portal: &portal_alias,
                blueprint_path,
                user_request: &content,
                execution_plan: &step.name,
            };

            let call = executor::execute_step(
                &req,
                shared.deps.portals,
                shared.deps.provider,
                shared.deps.journal,
                shared.deps.limits,
            );

            match tokio::time::timeout(budget, call).await {
                Ok(result) => result,
                Err(_) => Err(RunnerError::Timeout {
                    operation: format!("agent step '{}'", step.id),
                    budget_ms: budget.as_millis() as u64,
                }),
            }
        }
    })
    .await;

    (outcome.result, outcome.attempts)
}

async fn run_gate_step(shared: &Arc<Shared<'_>>, step: &Step, started_at: chrono::DateTime<Utc>) -> StepResult {
    let Some(gate_config) = step.gate.clone() else {
        return StepResult {
            step_id: step.id.clone(),
            status: StepStatus::Failed,
            attempts: 0,
            started_at,
            ended_at: Some(Utc::now()),
            output: None,
            error: Some(ErrorInfo {
                kind: "config_invalid".to_string(),
                message: "gate step is missing its gate config".to_string(),
            }),
        };
    };

    let Some(provider) = shared.deps.provider else {
        return StepResult {
            step_id: step.id.clone(),
            status: StepStatus::Failed,
            attempts: 0,
            started_at,
            ended_at: Some(Utc::now()),
            output: None,
            error: Some(ErrorInfo {
                kind: "agent_error".to_string(),
                message: "gate steps require a configured model provider".to_string(),
            }),
        };
    };

    let mut previous_attempts = 0u32;
    // a hard ceiling beyond max_retries guards against a misconfigured
    // gate (e.g. max_retries=0 with on_fail=retry) looping forever.
    let hard_cap = gate_config.max_retries.max(1) + 1;

    loop {
        let content = match wire_input(shared, &step.input).await {
            Ok(c) => c,
            Err(err) => {
                return StepResult {
                    step_id: step.id.clone(),
                    status: StepStatus::Failed,
                    attempts: previous_attempts,
                    started_at,
                    ended_at: Some(Utc::now()),
                    output: None,
                    error: Some(ErrorInfo::from(&err)),
                };
            }
        };

        let gate_result = gate::evaluate(
            &gate_config,
            shared.deps.criteria,
            provider,
            &content,
            Some(&shared.request.body),
            previous_attempts,
        )
        .await;
        previous_attempts = gate_result.attempts;

        match gate_result.action {
            GateAction::Passed => {
                return StepResult {
                    step_id: step.id.clone(),
                    status: StepStatus::Succeeded,
                    attempts: gate_result.attempts,
                    started_at,
                    ended_at: Some(Utc::now()),
                    output: Some(StepOutput {
                        content,
                        meta: HashMap::from([("score".to_string(), json!(gate_result.score))]),
                    }),
                    error: None,
                };
            }
            GateAction::ContinuedWithWarning => {
                return StepResult {
                    step_id: step.id.clone(),
                    status: StepStatus::Succeeded,
                    attempts: gate_result.attempts,
                    started_at,
                    ended_at: Some(Utc::now()),
                    output: Some(StepOutput {
                        content,
                        meta: HashMap::from([
                            ("score".to_string(), json!(gate_result.score)),
                            ("warning".to_string(), json!("gate failed; continuing per on_fail policy")),
                        ]),
                    }),
                    error: None,
                };
            }
            GateAction::Halted => {
                // halts the flow immediately regardless of fail_fast.
                let mut triggered = shared.fail_fast_triggered.lock().await;
                if !*triggered {
                    *triggered = true;
                    shared.cancel.cancel();
                }
                return StepResult {
                    step_id: step.id.clone(),
                    status: StepStatus::Failed,
                    attempts: gate_result.attempts,
                    started_at,
                    ended_at: Some(Utc::now()),
                    output: None,
                    error: gate_result.error.or(Some(ErrorInfo {
                        kind: "gate_halted".to_string(),
                        message: "gate halted the flow".to_string(),
                    })),
                };
            }
            GateAction::Retry => {
                if gate_result.attempts >= hard_cap {
                    return StepResult {
                        step_id: step.id.clone(),
                        status: StepStatus::Failed,
                        attempts: gate_result.attempts,
                        started_at,
                        ended_at: Some(Utc::now()),
                        output: None,
                        error: Some(ErrorInfo {
                            kind: "gate_halted".to_string(),
                            message: "gate retry budget exhausted without reaching max_retries decision".to_string(),
                        }),
                    };
                }
                if let Some(upstream_id) = step.input.step_id.clone() {
                    rerun_upstream(shared, &upstream_id).await;
                }
            }
        }
    }
}

/// Re-executes the agent step whose output a gate just rejected, and
/// overwrites its `StepResult` in place so the next wiring pass and the
/// final output shaping both see the fresh content.
async fn rerun_upstream(shared: &Arc<Shared<'_>>, upstream_id: &str) {
    let Some(node) = shared.nodes.get(upstream_id) else {
        return;
    };
    if node.step.step_type != StepType::Agent {
        return;
    }
    let started_at = Utc::now();
    let new_result = run_agent_step(shared, &node.step, started_at).await;
    shared.results.lock().await.insert(upstream_id.to_string(), new_result);
}

fn blueprint_path_for(blueprint_dir: &Path, agent_id: &str) -> PathBuf {
    blueprint_dir.join(format!("{agent_id}.md"))
}

/// Constructs a [`Request`] for a single-agent (non-flow) run, used by the
/// router's `{kind: agent}` path to share the same id-generation rules.
pub fn single_agent_request(body: impl Into<String>, agent_id: impl Into<String>, portal: Option<String>) -> Request {
    Request::new(
        body,
        crate::protocol::RequestMetadata {
            flow: None,
            agent: Some(agent_id.into()),
            portal,
            extra: HashMap::new(),
        },
    )
}

/// Trace id helper exposed for binaries that need to derive deterministic
/// ids for a synthetic single-agent run outside a full flow.
pub fn new_trace_id() -> Uuid {
    Uuid::new_v4()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExecutionLimits, PortalSpec, SecurityMode};
    use crate::protocol::{FlowOutput, FlowSettings, RequestMetadata, RetryPolicy};
    use crate::provider::MockProvider;
    use std::collections::HashMap as StdHashMap;

    fn blueprint_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("flow-test-bp-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("writer.md"),
            "---\nmodel: m\nprovider: p\n---\nYou write things.",
        )
        .unwrap();
        std::fs::write(
            dir.join("judge.md"),
            "---\nmodel: m\nprovider: p\n---\nYou judge things.",
        )
        .unwrap();
        dir
    }

    fn portal_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("flow-test-portal-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        std::process::Command::new("git").args(["init", "-q"]).current_dir(&dir).status().unwrap();
        std::process::Command::new("git")
            .args(["config", "user.email", "t@example.com"])
            .current_dir(&dir)
            .status()
            .unwrap();
        std::process::Command::new("git")
            .args(["config", "user.name", "t"])
            .current_dir(&dir)
            .status()
            .unwrap();
        std::fs::write(dir.join("README.md"), "hello").unwrap();
        std::process::Command::new("git").args(["add", "."]).current_dir(&dir).status().unwrap();
        std::process::Command::new("git")
            .args(["commit", "-q", "-m", "init"])
            .current_dir(&dir)
            .status()
            .unwrap();
        dir
    }

    fn portals(path: PathBuf) -> PortalRegistry {
        let mut map = StdHashMap::new();
        map.insert(
            "default".to_string(),
            PortalSpec {
                path,
                allowed_agents: vec!["*".to_string()],
                security_mode: SecurityMode::Sandboxed,
            },
        );
        PortalRegistry::new(map)
    }

    fn agent_step(id: &str, depends_on: Vec<&str>, source: InputSource, step_id: Option<&str>) -> Step {
        Step {
            id: id.to_string(),
            name: id.to_string(),
            step_type: StepType::Agent,
            agent: "writer".to_string(),
            depends_on: depends_on.into_iter().map(String::from).collect(),
            input: StepInput {
                source,
                step_id: step_id.map(String::from),
                transform: "passthrough".to_string(),
                literal: None,
            },
            retry: RetryPolicy::default(),
            gate: None,
            timeout_ms: None,
        }
    }

    fn flow(id: &str, steps: Vec<Step>, output_from: &str, settings: FlowSettings) -> Flow {
        Flow {
            id: id.to_string(),
            name: id.to_string(),
            version: "1".to_string(),
            steps,
            output: FlowOutput {
                from: output_from.to_string(),
                format: OutputFormat::Markdown,
            },
            settings,
        }
    }

    fn request() -> Request {
        Request::new(
            "do the thing",
            RequestMetadata {
                flow: Some("f".into()),
                agent: None,
                portal: Some("default".into()),
                extra: StdHashMap::new(),
            },
        )
    }

    #[tokio::test]
    async fn straight_line_flow_all_succeed() {
        let bp = blueprint_dir();
        let portal = portal_dir();
        let registry = portals(portal.clone());
        let journal = ActivityJournal::in_memory(50, 250).unwrap();
        let criteria = CriteriaRegistry::with_defaults();
        let transforms = TransformRegistry::with_defaults();
        let limits = ExecutionLimits::default();
        let provider = MockProvider::constant(
            r#"{"branch": "b", "commit_sha": "abc", "files_changed": [], "description": "done", "execution_time_ms": 1}"#,
        );

        let deps = RunnerDeps {
            portals: &registry,
            provider: Some(&provider),
            journal: &journal,
            criteria: &criteria,
            transforms: &transforms,
            blueprint_dir: &bp,
            limits: &limits,
        };

        let f = flow(
            "f",
            vec![
                agent_step("a", vec![], InputSource::Request, None),
                agent_step("b", vec!["a"], InputSource::Step, Some("a")),
                agent_step("c", vec!["b"], InputSource::Step, Some("b")),
            ],
            "c",
            FlowSettings::default(),
        );

        let result = run(&f, &request(), &deps).await.unwrap();
        assert_eq!(result.status, crate::protocol::FlowStatus::Succeeded);
        assert_eq!(result.steps.len(), 3);
        assert!(result.steps.values().all(|r| r.status == StepStatus::Succeeded));
        assert_eq!(result.output.as_deref(), Some("done"));

        std::fs::remove_dir_all(&bp).ok();
        std::fs::remove_dir_all(&portal).ok();
    }

    #[tokio::test]
    async fn parallel_independent_steps_both_succeed() {
        let bp = blueprint_dir();
        let portal = portal_dir();
        let registry = portals(portal.clone());
        let journal = ActivityJournal::in_memory(50, 250).unwrap();
        let criteria = CriteriaRegistry::with_defaults();
        let transforms = TransformRegistry::with_defaults();
        let limits = ExecutionLimits::default();
        let provider = MockProvider::constant(
            r#"{"branch": "b", "commit_sha": "abc", "files_changed": [], "description": "done", "execution_time_ms": 1}"#,
        );

        let deps = RunnerDeps {
            portals: &registry,
            provider: Some(&provider),
            journal: &journal,
            criteria: &criteria,
            transforms: &transforms,
            blueprint_dir: &bp,
            limits: &limits,
        };

        let f = flow(
            "f",
            vec![
                agent_step("a", vec![], InputSource::Request, None),
                agent_step("b", vec![], InputSource::Request, None),
            ],
            "a",
            FlowSettings {
                max_parallelism: 2,
                fail_fast: false,
                timeout_ms: None,
            },
        );

        let result = run(&f, &request(), &deps).await.unwrap();
        assert_eq!(result.status, crate::protocol::FlowStatus::Succeeded);
        assert!(result.steps.values().all(|r| r.status == StepStatus::Succeeded));

        std::fs::remove_dir_all(&bp).ok();
        std::fs::remove_dir_all(&portal).ok();
    }

    #[tokio::test]
    async fn failing_step_skips_transitive_successors_without_fail_fast() {
        let bp = blueprint_dir();
        let portal = portal_dir();
        let registry = portals(portal.clone());
        let journal = ActivityJournal::in_memory(50, 250).unwrap();
        let criteria = CriteriaRegistry::with_defaults();
        let transforms = TransformRegistry::with_defaults();
        let limits = ExecutionLimits::default();
        // a non-transient provider error fails the step outright (it isn't
        // retried and the executor doesn't mask it as a synthesized
        // success), so `a` fails and `b`/`c` are skipped.
        let provider = MockProvider::with_results(vec![Err(RunnerError::InvalidInput {
            message: "boom".to_string(),
        })]);

        let deps = RunnerDeps {
            portals: &registry,
            provider: Some(&provider),
            journal: &journal,
            criteria: &criteria,
            transforms: &transforms,
            blueprint_dir: &bp,
            limits: &limits,
        };

        let f = flow(
            "f",
            vec![
                agent_step("a", vec![], InputSource::Request, None),
                agent_step("b", vec!["a"], InputSource::Step, Some("a")),
                agent_step("c", vec!["b"], InputSource::Step, Some("b")),
            ],
            "c",
            FlowSettings::default(),
        );

        let result = run(&f, &request(), &deps).await.unwrap();
        assert_eq!(result.status, crate::protocol::FlowStatus::Failed);
        assert_eq!(result.steps["a"].status, StepStatus::Failed);
        assert_eq!(result.steps["a"].error.as_ref().unwrap().kind, "agent_error");
        assert_eq!(result.steps["b"].status, StepStatus::Skipped);
        assert_eq!(result.steps["c"].status, StepStatus::Skipped);

        std::fs::remove_dir_all(&bp).ok();
        std::fs::remove_dir_all(&portal).ok();
    }

    #[tokio::test]
    async fn unknown_transform_fails_the_step_as_invalid_input() {
        let bp = blueprint_dir();
        let portal = portal_dir();
        let registry = portals(portal.clone());
        let journal = ActivityJournal::in_memory(50, 250).unwrap();
        let criteria = CriteriaRegistry::with_defaults();
        let transforms = TransformRegistry::with_defaults();
        let limits = ExecutionLimits::default();
        let provider = MockProvider::constant("irrelevant");

        let deps = RunnerDeps {
            portals: &registry,
            provider: Some(&provider),
            journal: &journal,
            criteria: &criteria,
            transforms: &transforms,
            blueprint_dir: &bp,
            limits: &limits,
        };

        let mut step = agent_step("a", vec![], InputSource::Request, None);
        step.input.transform = "does-not-exist".to_string();
        let f = flow("f", vec![step], "a", FlowSettings::default());

        let result = run(&f, &request(), &deps).await.unwrap();
        assert_eq!(result.status, crate::protocol::FlowStatus::Failed);
        let step_result = &result.steps["a"];
        assert_eq!(step_result.status, StepStatus::Failed);
        assert_eq!(step_result.error.as_ref().unwrap().kind, "invalid_input");

        std::fs::remove_dir_all(&bp).ok();
        std::fs::remove_dir_all(&portal).ok();
    }

    #[tokio::test]
    async fn concat_output_joins_succeeded_steps_in_declaration_order() {
        let bp = blueprint_dir();
        let portal = portal_dir();
        let registry = portals(portal.clone());
        let journal = ActivityJournal::in_memory(50, 250).unwrap();
        let criteria = CriteriaRegistry::with_defaults();
        let transforms = TransformRegistry::with_defaults();
        let limits = ExecutionLimits::default();
        let provider = MockProvider::constant(
            r#"{"branch": "b", "commit_sha": "abc", "files_changed": [], "description": "part", "execution_time_ms": 1}"#,
        );

        let deps = RunnerDeps {
            portals: &registry,
            provider: Some(&provider),
            journal: &journal,
            criteria: &criteria,
            transforms: &transforms,
            blueprint_dir: &bp,
            limits: &limits,
        };

        let mut f = flow(
            "f",
            vec![
                agent_step("a", vec![], InputSource::Request, None),
                agent_step("b", vec!["a"], InputSource::Step, Some("a")),
            ],
            "b",
            FlowSettings::default(),
        );
        f.output.format = OutputFormat::Concat;

        let result = run(&f, &request(), &deps).await.unwrap();
        assert_eq!(result.output.as_deref(), Some("part\n\npart"));

        std::fs::remove_dir_all(&bp).ok();
        std::fs::remove_dir_all(&portal).ok();
    }

    #[tokio::test]
    async fn gate_retry_reruns_upstream_until_threshold_met() {
        let bp = blueprint_dir();
        let portal = portal_dir();
        let registry = portals(portal.clone());
        let journal = ActivityJournal::in_memory(50, 250).unwrap();
        let criteria = CriteriaRegistry::with_defaults();
        let transforms = TransformRegistry::with_defaults();
        let limits = ExecutionLimits::default();

        // `code` step: writer agent; `judge` gate: scores 0.6, 0.7, 0.95 in
        // turn as the spec's concrete scenario #3 describes. The single
        // provider backs both the agent and the judge calls in this
        // fixture, so the sequence below interleaves: agent call (code's
        // initial run), 3 judge calls, 2 more agent re-runs.
        let provider = MockProvider::with_responses(vec![
            r#"{"branch": "b", "commit_sha": "1", "files_changed": [], "description": "v1", "execution_time_ms": 1}"#.to_string(),
            r#"{"correctness": {"score": 0.6, "reasoning": "weak", "issues": []}}"#.to_string(),
            r#"{"branch": "b", "commit_sha": "2", "files_changed": [], "description": "v2", "execution_time_ms": 1}"#.to_string(),
            r#"{"correctness": {"score": 0.7, "reasoning": "better", "issues": []}}"#.to_string(),
            r#"{"branch": "b", "commit_sha": "3", "files_changed": [], "description": "v3", "execution_time_ms": 1}"#.to_string(),
            r#"{"correctness": {"score": 0.95, "reasoning": "great", "issues": []}}"#.to_string(),
        ]);

        let deps = RunnerDeps {
            portals: &registry,
            provider: Some(&provider),
            journal: &journal,
            criteria: &criteria,
            transforms: &transforms,
            blueprint_dir: &bp,
            limits: &limits,
        };

        let code_step = agent_step("code", vec![], InputSource::Request, None);
        let gate_step = Step {
            id: "judge".to_string(),
            name: "judge".to_string(),
            step_type: StepType::Gate,
            agent: "judge".to_string(),
            depends_on: vec!["code".to_string()],
            input: StepInput {
                source: InputSource::Step,
                step_id: Some("code".to_string()),
                transform: "passthrough".to_string(),
                literal: None,
            },
            retry: RetryPolicy::default(),
            gate: Some(crate::protocol::GateConfig {
                criteria: vec![crate::protocol::CriterionRef::Name("correctness".into())],
                threshold: 0.9,
                on_fail: crate::protocol::OnFail::Retry,
                max_retries: 3,
            }),
            timeout_ms: None,
        };

        let f = flow("f", vec![code_step, gate_step], "judge", FlowSettings::default());
        let result = run(&f, &request(), &deps).await.unwrap();

        assert_eq!(result.status, crate::protocol::FlowStatus::Succeeded);
        let judge_result = &result.steps["judge"];
        assert_eq!(judge_result.status, StepStatus::Succeeded);
        assert_eq!(judge_result.attempts, 3);

        std::fs::remove_dir_all(&bp).ok();
        std::fs::remove_dir_all(&portal).ok();
    }
}
