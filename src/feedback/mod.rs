//! Feedback Loop (§4.7, Reflexion pattern): alternates Gate evaluation and
//! an Improvement Agent call until the target score is reached, the
//! iteration budget runs out, improvement stalls, or the score degrades.

use std::time::Instant;

use crate::criteria::CriteriaRegistry;
use crate::errors::RunnerError;
use crate::gate;
use crate::protocol::{
    FeedbackConfig, FeedbackResult, GateAction, GateConfig, IterationResult, OnFail, StopReason,
};
use crate::provider::{GenerateOptions, ModelProvider};

/// Renders the judge's evaluation into the sole channel the improver sees:
/// current/target scores, per-criterion ✓/✗ status with reasoning and
/// issues, and the judge's suggestions.
fn compose_feedback(gate_result: &crate::protocol::GateResult, target_score: f64) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "Current score: {:.2} (target: {:.2})\n\n",
        gate_result.score, target_score
    ));
    if let Some(evaluation) = &gate_result.evaluation {
        let mut names: Vec<&String> = evaluation.criteria_scores.keys().collect();
        names.sort();
        for name in names {
            let cs = &evaluation.criteria_scores[name];
            let glyph = if cs.passed { "\u{2713}" } else { "\u{2717}" };
            out.push_str(&format!("{glyph} {name}: {:.2} — {}\n", cs.score, cs.reasoning));
            for issue in &cs.issues {
                out.push_str(&format!("  - {issue}\n"));
            }
        }
        if !evaluation.suggestions.is_empty() {
            out.push_str("\nSuggestions:\n");
            for suggestion in &evaluation.suggestions {
                out.push_str(&format!("- {suggestion}\n"));
            }
        }
    }
    out
}

fn improve_prompt(original_request: &str, current_content: &str, feedback: &str, iteration: u32) -> String {
    format!(
        "You are improving a previous response based on evaluator feedback.\n\n\
         Original request:\n{original_request}\n\n\
         Current content (iteration {iteration}):\n{current_content}\n\n\
         Evaluator feedback:\n{feedback}\n\n\
         Produce an improved version of the content addressing the feedback above."
    )
}

/// Runs the loop to completion. `judge_provider` backs the Gate Evaluator;
/// `improve_provider` backs the Improvement Agent — callers may pass the
/// same provider for both.
pub async fn run(
    config: &FeedbackConfig,
    registry: &CriteriaRegistry,
    judge_provider: &dyn ModelProvider,
    improve_provider: &dyn ModelProvider,
    original_request: &str,
    initial_content: &str,
) -> FeedbackResult {
    let gate_config = GateConfig {
        criteria: config.criteria.clone(),
        threshold: config.target_score,
        on_fail: OnFail::ContinueWithWarning,
        max_retries: config.max_iterations.max(1),
    };

    let mut history: Vec<IterationResult> = Vec::new();
    let mut current_content = initial_content.to_string();
    let mut previous_score = 0.0f64;
    let mut iteration = 0u32;

    loop {
        iteration += 1;
        let started = Instant::now();

        let gate_result = gate::evaluate(
            &gate_config,
            registry,
            judge_provider,
            &current_content,
            Some(original_request),
            iteration - 1,
        )
        .await;

        let improvement = gate_result.score - previous_score;
        let duration_ms = started.elapsed().as_millis() as u64;

        // Rule 1: target reached.
        if gate_result.action == GateAction::Passed {
            history.push(IterationResult {
                iteration,
                content: current_content.clone(),
                gate_result: gate_result.clone(),
                improvement,
                duration_ms,
            });
            return FeedbackResult {
                success: true,
                stop_reason: StopReason::TargetReached,
                final_content: current_content,
                final_score: gate_result.score,
                total_iterations: iteration,
                history,
            };
        }

        // Rule 2: score degraded from the previous (better) iteration.
        if iteration > 1 && improvement < 0.0 {
            let previous = history.last().expect("iteration > 1 implies prior history");
            let final_content = previous.content.clone();
            let final_score = previous.gate_result.score;
            history.push(IterationResult {
                iteration,
                content: current_content.clone(),
                gate_result: gate_result.clone(),
                improvement,
                duration_ms,
            });
            return FeedbackResult {
                success: false,
                stop_reason: StopReason::ScoreDegraded,
                final_content,
                final_score,
                total_iterations: iteration,
                history,
            };
        }

        // Rule 3: improvement below the configured minimum.
        if iteration > 1 && improvement < config.min_improvement {
            history.push(IterationResult {
                iteration,
                content: current_content.clone(),
                gate_result: gate_result.clone(),
                improvement,
                duration_ms,
            });
            return FeedbackResult {
                success: false,
                stop_reason: StopReason::NoImprovement,
                final_content: current_content,
                final_score: gate_result.score,
                total_iterations: iteration,
                history,
            };
        }

        // Rule 5 (checked before the improve call so a spent budget never
        // attempts one more generation): max iterations reached.
        if iteration >= config.max_iterations {
            history.push(IterationResult {
                iteration,
                content: current_content.clone(),
                gate_result: gate_result.clone(),
                improvement,
                duration_ms,
            });
            return FeedbackResult {
                success: false,
                stop_reason: StopReason::MaxIterations,
                final_content: current_content,
                final_score: gate_result.score,
                total_iterations: iteration,
                history,
            };
        }

        previous_score = gate_result.score;
        let feedback = compose_feedback(&gate_result, config.target_score);

        history.push(IterationResult {
            iteration,
            content: current_content.clone(),
            gate_result: gate_result.clone(),
            improvement,
            duration_ms,
        });

        let prompt = improve_prompt(original_request, &current_content, &feedback, iteration);
        match improve_provider.generate(&prompt, GenerateOptions::default()).await {
            Ok(new_content) => current_content = new_content,
            Err(err) => {
                return FeedbackResult {
                    success: false,
                    stop_reason: StopReason::Error,
                    final_content: current_content,
                    final_score: gate_result.score,
                    total_iterations: iteration,
                    history,
                }
                .with_error_logged(&err);
            }
        }
    }
}

impl FeedbackResult {
    fn with_error_logged(self, err: &RunnerError) -> Self {
        tracing::warn!(kind = err.kind(), "improvement agent failed, stopping feedback loop");
        self
    }
}
