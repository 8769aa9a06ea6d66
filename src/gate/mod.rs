//! Gate Evaluator (§4.6): applies a `GateConfig`'s threshold and
//! required-criteria policy to an `EvaluationResult`, producing a pass/fail
//! action decision that the Flow Runner and Feedback Loop both consume.

use std::time::Instant;

use crate::criteria::{check_required, CriteriaRegistry};
use crate::errors::ErrorInfo;
use crate::judge;
use crate::protocol::{GateAction, GateConfig, GateResult, OnFail};
use crate::provider::ModelProvider;

/// `evaluate(config, content, context?, previous_attempts) -> GateResult`.
/// Errors from the judge provider never propagate to the caller: they
/// produce a zero-score result with `action = halted` (or
/// `continued-with-warning` per policy) and `error` populated.
pub async fn evaluate(
    config: &GateConfig,
    registry: &CriteriaRegistry,
    provider: &dyn ModelProvider,
    content: &str,
    context: Option<&str>,
    previous_attempts: u32,
) -> GateResult {
    let started = Instant::now();
    let criteria = registry.resolve(&config.criteria);

    let evaluation = match judge::evaluate(provider, content, &criteria, context).await {
        Ok(evaluation) => evaluation,
        Err(err) => {
            let action = match config.on_fail {
                OnFail::ContinueWithWarning => GateAction::ContinuedWithWarning,
                _ => GateAction::Halted,
            };
            return GateResult {
                passed: false,
                score: 0.0,
                evaluation: None,
                attempts: previous_attempts + 1,
                action,
                duration_ms: started.elapsed().as_millis() as u64,
                error: Some(ErrorInfo::from(&err)),
            };
        }
    };

    let scores: std::collections::HashMap<String, f64> = evaluation
        .criteria_scores
        .iter()
        .map(|(name, cs)| (name.clone(), cs.score))
        .collect();

    let passed = evaluation.overall_score >= config.threshold
        && check_required(&scores, &criteria, config.threshold)
        && evaluation.pass;

    let action = if passed {
        GateAction::Passed
    } else if config.on_fail == OnFail::Retry && previous_attempts < config.max_retries.saturating_sub(1) {
        GateAction::Retry
    } else if config.on_fail == OnFail::ContinueWithWarning {
        GateAction::ContinuedWithWarning
    } else {
        GateAction::Halted
    };

    GateResult {
        passed,
        score: evaluation.overall_score,
        duration_ms: started.elapsed().as_millis() as u64,
        evaluation: Some(evaluation),
        attempts: previous_attempts + 1,
        action,
        error: None,
    }
}
