//! Judge Evaluator (§4.5): turns a free-text judge response into a
//! validated [`EvaluationResult`].

use std::collections::HashMap;

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::criteria::weighted_overall_score;
use crate::errors::{Result, RunnerError};
use crate::protocol::{Criterion, CriterionScore, EvaluationResult};
use crate::provider::ModelProvider;

static FENCED_JSON_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```(?:json)?\s*\n?(\{.*?\})\s*```").expect("valid regex"));

static TRAILING_COMMA_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r",\s*([\]}])").expect("valid regex"));

static UNQUOTED_KEY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"([{,]\s*)([A-Za-z_][A-Za-z0-9_]*)(\s*:)"#).expect("valid regex"));

const DEFAULT_PASS_THRESHOLD: f64 = 0.7;

/// Builds the heuristic-extraction regex for a single criterion name. The
/// source's own regex is kept verbatim as a documented best-effort
/// fallback (§9 "Resolved — heuristic sentence extraction"): it can
/// misattribute a sentence when the criterion name co-occurs with
/// unrelated prose elsewhere in the response, so its output is used only
/// to fill `reasoning`/`score`, never to decide pass/fail directly.
fn heuristic_regex_for(name: &str) -> Option<Regex> {
    let pattern = format!(
        r"(?i){}[^.]*?([0-9]+(?:\.[0-9]+)?)\s*%?",
        regex::escape(name)
    );
    Regex::new(&pattern).ok()
}

fn heuristic_reasoning_regex_for(name: &str) -> Option<Regex> {
    let pattern = format!(r"(?is){}[^.]*\.\s*([^.]+\.)", regex::escape(name));
    Regex::new(&pattern).ok()
}

/// Clamp-and-percent-normalize a raw numeric judge score (§8 round-trip
/// property): `normalize(95)=0.95`, `normalize(-0.5)=0`, `normalize(150)=1.0`.
pub fn normalize_score(raw: f64) -> f64 {
    let scaled = if raw > 1.0 { raw / 100.0 } else { raw };
    scaled.clamp(0.0, 1.0)
}

fn value_to_score(value: &Value) -> f64 {
    match value {
        Value::Number(n) => n.as_f64().map(normalize_score).unwrap_or(0.0),
        Value::String(s) => s
            .trim()
            .trim_end_matches('%')
            .parse::<f64>()
            .map(normalize_score)
            .unwrap_or(0.0),
        _ => 0.0,
    }
}

/// Extracts the first fenced JSON block; if absent, the first `{...}` span.
fn extract_json_candidate(response: &str) -> Option<String> {
    if let Some(caps) = FENCED_JSON_RE.captures(response) {
        return caps.get(1).map(|m| m.as_str().to_string());
    }
    let start = response.find('{')?;
    let end = response.rfind('}')?;
    if end > start {
        Some(response[start..=end].to_string())
    } else {
        None
    }
}

/// Repairs common malformed-JSON patterns: trailing commas, unquoted
/// object keys, single quotes in place of double quotes.
fn repair_json(candidate: &str) -> String {
    let mut repaired = TRAILING_COMMA_RE.replace_all(candidate, "$1").to_string();
    repaired = UNQUOTED_KEY_RE
        .replace_all(&repaired, "$1\"$2\"$3")
        .to_string();
    repaired = repaired.replace('\'', "\"");
    repaired
}

/// Three-stage parse strategy (§4.5, §9 "Robust JSON extraction"): fenced
/// block / brace span → parse → repair-and-retry. Returns `None` rather
/// than erroring so the caller can fall through to heuristic extraction.
fn parse_judge_json(response: &str) -> Option<Value> {
    let candidate = extract_json_candidate(response)?;
    if let Ok(value) = serde_json::from_str::<Value>(&candidate) {
        return Some(value);
    }
    let repaired = repair_json(&candidate);
    serde_json::from_str::<Value>(&repaired).ok()
}

/// Heuristic last-resort extraction: for each criterion, scan the whole
/// response for `name[: -]+number` and a trailing sentence of reasoning.
fn heuristic_extract(response: &str, criteria: &[Criterion]) -> HashMap<String, CriterionScore> {
    let mut scores = HashMap::new();
    for criterion in criteria {
        let score = heuristic_regex_for(&criterion.name)
            .and_then(|re| re.captures(response))
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse::<f64>().ok())
            .map(normalize_score);

        let reasoning = heuristic_reasoning_regex_for(&criterion.name)
            .and_then(|re| re.captures(response))
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().trim().to_string())
            .unwrap_or_default();

        match score {
            Some(score) => {
                scores.insert(
                    criterion.name.clone(),
                    CriterionScore {
                        score,
                        reasoning,
                        issues: Vec::new(),
                        passed: score >= criterion.threshold,
                    },
                );
            }
            None => {
                scores.insert(
                    criterion.name.clone(),
                    CriterionScore {
                        score: 0.0,
                        reasoning,
                        issues: vec!["Criterion score not found in response".to_string()],
                        passed: false,
                    },
                );
            }
        }
    }
    scores
}

/// Normalizes a successfully-parsed JSON object into per-criterion scores,
/// filling in the spec-mandated placeholder for any criterion the judge
/// omitted.
fn normalize_parsed(parsed: &Value, criteria: &[Criterion]) -> HashMap<String, CriterionScore> {
    let mut scores = HashMap::new();
    let obj = parsed.as_object();

    for criterion in criteria {
        let entry = obj.and_then(|o| o.get(&criterion.name));
        match entry {
            Some(Value::Object(fields)) => {
                let score = fields
                    .get("score")
                    .map(value_to_score)
                    .unwrap_or(0.0);
                let reasoning = fields
                    .get("reasoning")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                let issues = fields
                    .get("issues")
                    .and_then(|v| v.as_array())
                    .map(|arr| {
                        arr.iter()
                            .filter_map(|v| v.as_str().map(str::to_string))
                            .collect()
                    })
                    .unwrap_or_default();
                scores.insert(
                    criterion.name.clone(),
                    CriterionScore {
                        passed: score >= criterion.threshold,
                        score,
                        reasoning,
                        issues,
                    },
                );
            }
            Some(other) => {
                let score = value_to_score(other);
                scores.insert(
                    criterion.name.clone(),
                    CriterionScore {
                        score,
                        reasoning: String::new(),
                        issues: Vec::new(),
                        passed: score >= criterion.threshold,
                    },
                );
            }
            None => {
                scores.insert(
                    criterion.name.clone(),
                    CriterionScore {
                        score: 0.0,
                        reasoning: String::new(),
                        issues: vec!["Criterion score not found in response".to_string()],
                        passed: false,
                    },
                );
            }
        }
    }

    scores
}

fn build_prompt(content: &str, criteria: &[Criterion], context: Option<&str>) -> String {
    let mut prompt = String::new();
    prompt.push_str("You are a strict evaluator. Score the following content against each named criterion.\n\n");
    if let Some(context) = context {
        prompt.push_str("Context:\n");
        prompt.push_str(context);
        prompt.push_str("\n\n");
    }
    prompt.push_str("Content to evaluate:\n");
    prompt.push_str(content);
    prompt.push_str("\n\nCriteria:\n");
    for criterion in criteria {
        prompt.push_str(&format!(
            "- {} (weight {}, required {}): {}\n",
            criterion.name, criterion.weight, criterion.required, criterion.description
        ));
    }
    prompt.push_str(
        "\nRespond with a single JSON object mapping each criterion name to \
         {\"score\": <0-100 or 0-1>, \"reasoning\": <string>, \"issues\": [<string>, ...]}.",
    );
    prompt
}

/// Calls the judge provider and produces a validated, normalized
/// `EvaluationResult`. Never returns a parse error to the caller — parse
/// failures degrade through repair then heuristic extraction.
pub async fn evaluate(
    provider: &dyn ModelProvider,
    content: &str,
    criteria: &[Criterion],
    context: Option<&str>,
) -> Result<EvaluationResult> {
    let prompt = build_prompt(content, criteria, context);
    let response = provider
        .generate(&prompt, Default::default())
        .await
        .map_err(|e| RunnerError::InvalidResponse {
            message: format!("judge provider call failed: {e}"),
        })?;

    Ok(evaluate_response(&response, criteria))
}

/// Parses and normalizes a judge response string directly — split out from
/// [`evaluate`] so the parse/repair/heuristic pipeline can be unit tested
/// without a provider in the loop.
pub fn evaluate_response(response: &str, criteria: &[Criterion]) -> EvaluationResult {
    let criteria_scores = match parse_judge_json(response) {
        Some(parsed) => normalize_parsed(&parsed, criteria),
        None => heuristic_extract(response, criteria),
    };

    let raw_scores: HashMap<String, f64> = criteria_scores
        .iter()
        .map(|(name, cs)| (name.clone(), cs.score))
        .collect();
    let overall_score = weighted_overall_score(&raw_scores, criteria);

    EvaluationResult {
        pass: overall_score >= DEFAULT_PASS_THRESHOLD,
        overall_score,
        criteria_scores,
        feedback: String::new(),
        suggestions: Vec::new(),
        evaluated_at: Utc::now(),
    }
}
