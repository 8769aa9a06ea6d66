// Module: Context
// Manages variable state, interpolation, and the named transform registry
// used for step input wiring.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

use crate::errors::{Result, RunnerError};

static INTERPOLATION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([A-Za-z0-9_.:-]+)\}").expect("valid interpolation regex"));

static FENCED_CODE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```[A-Za-z0-9_+-]*\n(.*?)```").expect("valid fence regex"));

/// Holds the execution state shared across a flow run: step outputs
/// accumulated so far, plus any ambient variables available for
/// interpolation (`${token}` / `${ENV_VAR}`).
#[derive(Debug, Default, Clone)]
pub struct Context {
    pub variables: HashMap<String, Value>,
}

impl Context {
    pub fn new() -> Self {
        Self {
            variables: HashMap::new(),
        }
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.variables.insert(key.into(), value);
    }

    pub fn extend(&mut self, entries: &HashMap<String, Value>) {
        for (k, v) in entries {
            self.variables.insert(k.clone(), v.clone());
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.variables.get(key)
    }

    /// Interpolates placeholders like `${token}` inside a string.
    pub fn interpolate_str(&self, input: &str) -> anyhow::Result<String> {
        let mut result = String::new();
        let mut last_index = 0;

        for capture in INTERPOLATION_RE.captures_iter(input) {
            let matched = capture.get(0).unwrap();
            result.push_str(&input[last_index..matched.start()]);
            let token = capture.get(1).unwrap().as_str();
            let resolved = self.resolve_token(token)?;
            result.push_str(&resolved);
            last_index = matched.end();
        }

        result.push_str(&input[last_index..]);
        Ok(result)
    }

    pub fn interpolate_value(&self, value: &Value) -> anyhow::Result<Value> {
        match value {
            Value::String(s) => Ok(Value::String(self.interpolate_str(s)?)),
            Value::Array(items) => {
                let mut result = Vec::with_capacity(items.len());
                for item in items {
                    result.push(self.interpolate_value(item)?);
                }
                Ok(Value::Array(result))
            }
            Value::Object(map) => {
                let mut new_map = Map::with_capacity(map.len());
                for (k, v) in map {
                    new_map.insert(k.clone(), self.interpolate_value(v)?);
                }
                Ok(Value::Object(new_map))
            }
            _ => Ok(value.clone()),
        }
    }

    fn resolve_token(&self, token: &str) -> anyhow::Result<String> {
        if let Some(rest) = token.strip_prefix("ENV_") {
            std::env::var(rest)
                .map_err(|_| anyhow::anyhow!("Missing environment variable '{}'.", rest))
        } else if let Some(value) = self.variables.get(token) {
            match value {
                Value::String(s) => Ok(s.clone()),
                primitive => Ok(primitive.to_string()),
            }
        } else {
            Err(anyhow::anyhow!("Missing context variable '{}'.", token))
        }
    }
}

// ============================================================================
// Transform registry (§4.9 "input wiring", §9 "any content string" transforms)
// ============================================================================

pub type TransformFn = fn(&str, &Context) -> Result<String>;

/// Pre-registered map from transform name to function, consulted by the
/// Flow Runner when wiring a step's `input.transform`. Unknown names fail
/// the step with `invalid_input`.
pub struct TransformRegistry {
    transforms: HashMap<String, TransformFn>,
}

impl TransformRegistry {
    pub fn with_defaults() -> Self {
        let mut transforms: HashMap<String, TransformFn> = HashMap::new();
        transforms.insert("passthrough".to_string(), passthrough as TransformFn);
        transforms.insert("extract_code".to_string(), extract_code as TransformFn);
        transforms.insert(
            "merge_as_context".to_string(),
            merge_as_context as TransformFn,
        );
        transforms.insert("template_fill".to_string(), template_fill as TransformFn);
        Self { transforms }
    }

    pub fn register(&mut self, name: impl Into<String>, f: TransformFn) {
        self.transforms.insert(name.into(), f);
    }

    pub fn apply(&self, name: &str, content: &str, ctx: &Context) -> Result<String> {
        match self.transforms.get(name) {
            Some(f) => f(content, ctx),
            None => Err(RunnerError::InvalidInput {
                message: format!("unknown transform '{name}'"),
            }),
        }
    }
}

fn passthrough(content: &str, _ctx: &Context) -> Result<String> {
    Ok(content.to_string())
}

/// Extracts the first fenced code block's body; falls back to the whole
/// content unchanged if no fence is present.
fn extract_code(content: &str, _ctx: &Context) -> Result<String> {
    match FENCED_CODE_RE.captures(content) {
        Some(caps) => Ok(caps.get(1).map(|m| m.as_str().trim().to_string()).unwrap_or_default()),
        None => Ok(content.to_string()),
    }
}

/// Wraps content as a labeled context block, suitable for folding a
/// predecessor's output into a downstream prompt alongside other context.
fn merge_as_context(content: &str, _ctx: &Context) -> Result<String> {
    Ok(format!("--- context ---\n{content}\n--- end context ---"))
}

/// Interpolates `${token}` placeholders in `content` against the shared
/// context's variables.
fn template_fill(content: &str, ctx: &Context) -> Result<String> {
    ctx.interpolate_str(content).map_err(|e| RunnerError::InvalidInput {
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interpolates_simple_token() {
        let mut ctx = Context::new();
        ctx.set("name", Value::String("world".into()));
        assert_eq!(ctx.interpolate_str("hello ${name}").unwrap(), "hello world");
    }

    #[test]
    fn interpolates_env_prefixed_token() {
        std::env::set_var("RUNNER_TEST_TOKEN", "secret");
        let ctx = Context::new();
        assert_eq!(
            ctx.interpolate_str("${ENV_RUNNER_TEST_TOKEN}").unwrap(),
            "secret"
        );
    }

    #[test]
    fn missing_token_errors() {
        let ctx = Context::new();
        assert!(ctx.interpolate_str("${missing}").is_err());
    }

    #[test]
    fn passthrough_returns_input_unchanged() {
        let registry = TransformRegistry::with_defaults();
        let ctx = Context::new();
        assert_eq!(registry.apply("passthrough", "abc", &ctx).unwrap(), "abc");
    }

    #[test]
    fn extract_code_pulls_fenced_block() {
        let registry = TransformRegistry::with_defaults();
        let ctx = Context::new();
        let content = "here is code:\n```rust\nfn main() {}\n```\nthanks";
        assert_eq!(
            registry.apply("extract_code", content, &ctx).unwrap(),
            "fn main() {}"
        );
    }

    #[test]
    fn extract_code_without_fence_returns_original() {
        let registry = TransformRegistry::with_defaults();
        let ctx = Context::new();
        assert_eq!(
            registry.apply("extract_code", "no code here", &ctx).unwrap(),
            "no code here"
        );
    }

    #[test]
    fn merge_as_context_wraps_content() {
        let registry = TransformRegistry::with_defaults();
        let ctx = Context::new();
        let wrapped = registry.apply("merge_as_context", "payload", &ctx).unwrap();
        assert!(wrapped.contains("payload"));
        assert!(wrapped.starts_with("--- context ---"));
    }

    #[test]
    fn unknown_transform_fails_with_invalid_input() {
        let registry = TransformRegistry::with_defaults();
        let ctx = Context::new();
        let err = registry.apply("nonexistent", "x", &ctx).unwrap_err();
        assert_eq!(err.kind(), "invalid_input");
    }
}
