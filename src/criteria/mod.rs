//! Evaluation criteria registry (§4.4).
//!
//! Exposed as an initialized container passed to the Judge/Gate evaluators
//! (§9 "global registries"), not a process-wide singleton — this keeps test
//! ordering deterministic and the crate embeddable in a host that wants
//! several independent registries.

use std::collections::HashMap;

use crate::protocol::{Criterion, CriterionRef};

#[derive(Debug, Clone)]
pub struct CriteriaRegistry {
    criteria: HashMap<String, Criterion>,
}

impl CriteriaRegistry {
    pub fn new() -> Self {
        Self {
            criteria: HashMap::new(),
        }
    }

    /// A handful of criteria useful out of the box; callers extend via
    /// [`Self::register`].
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Criterion {
            required: true,
            ..Criterion::new("correctness")
        });
        registry.register(Criterion::new("completeness"));
        registry.register(Criterion::new("clarity"));
        registry.register(Criterion::new("safety"));
        registry
    }

    pub fn register(&mut self, criterion: Criterion) {
        self.criteria.insert(criterion.name.clone(), criterion);
    }

    pub fn get(&self, name: &str) -> Option<&Criterion> {
        self.criteria.get(name)
    }

    /// Resolves a `GateConfig.criteria` list (names or inline criteria) into
    /// concrete `Criterion` values. Unknown names are dropped silently, per
    /// spec; the caller inspects `resolved.len() < refs.len()` if it wants
    /// to report the shrinkage.
    pub fn resolve(&self, refs: &[CriterionRef]) -> Vec<Criterion> {
        refs.iter()
            .filter_map(|r| match r {
                CriterionRef::Name(name) => self.get(name).cloned(),
                CriterionRef::Inline(criterion) => Some(criterion.clone()),
            })
            .collect()
    }
}

impl Default for CriteriaRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Weighted mean: `Σ(score_i · w_i) / Σ(w_i)`; uniform weights if all
/// weights happen to be equal (including the all-1.0 default case).
pub fn weighted_overall_score(scores: &HashMap<String, f64>, criteria: &[Criterion]) -> f64 {
    let mut weighted_sum = 0.0;
    let mut weight_total = 0.0;

    for criterion in criteria {
        if let Some(score) = scores.get(&criterion.name) {
            weighted_sum += score * criterion.weight;
            weight_total += criterion.weight;
        }
    }

    if weight_total <= 0.0 {
        0.0
    } else {
        weighted_sum / weight_total
    }
}

/// `false` if any criterion marked `required` scores below its per-criterion
/// threshold (or the gate threshold, when the criterion has none of its
/// own — in this model every `Criterion` always carries a threshold via its
/// `default_criterion_threshold`, so "none" only arises for a bare name that
/// failed to resolve, which is handled upstream in `resolve`).
pub fn check_required(
    scores: &HashMap<String, f64>,
    criteria: &[Criterion],
    gate_threshold: f64,
) -> bool {
    for criterion in criteria {
        if !criterion.required {
            continue;
        }
        let score = scores.get(&criterion.name).copied().unwrap_or(0.0);
        let threshold = if criterion.threshold > 0.0 {
            criterion.threshold
        } else {
            gate_threshold
        };
        if score < threshold {
            return false;
        }
    }
    true
}
