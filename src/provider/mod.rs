//! Model Provider interface (§4.3): a uniform `generate(prompt, opts) ->
//! text` boundary plus typed error kinds, so the core never depends on a
//! concrete inference backend.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::timeout;

use crate::errors::{Result, RunnerError};

#[derive(Debug, Clone)]
pub struct GenerateOptions {
    pub temperature: f64,
    pub max_tokens: u32,
    pub timeout_ms: u64,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            temperature: 0.2,
            max_tokens: 4096,
            timeout_ms: 30_000,
        }
    }
}

/// The provider boundary every concrete backend (a local HTTP inference
/// server, a mock, ...) implements. Out of scope per §1: only this
/// interface, plus a mock used by this crate's own test suite, live here.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    async fn generate(&self, prompt: &str, opts: GenerateOptions) -> Result<String>;
}

/// A minimal `reqwest`-backed provider for a local inference server
/// exposing a single `{prompt, temperature, max_tokens} -> {text}` POST
/// endpoint. Concrete provider implementations are out of scope per §1;
/// this exists so the crate has at least one non-mock option wired to the
/// same HTTP client idiom used elsewhere in the stack.
pub struct HttpProvider {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpProvider {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[derive(serde::Serialize)]
struct GenerateRequest<'a> {
    prompt: &'a str,
    temperature: f64,
    max_tokens: u32,
}

#[derive(serde::Deserialize)]
struct GenerateResponse {
    text: String,
}

#[async_trait]
impl ModelProvider for HttpProvider {
    async fn generate(&self, prompt: &str, opts: GenerateOptions) -> Result<String> {
        let budget = Duration::from_millis(opts.timeout_ms);
        let request = self
            .client
            .post(&self.endpoint)
            .json(&GenerateRequest {
                prompt,
                temperature: opts.temperature,
                max_tokens: opts.max_tokens,
            })
            .send();

        let response = timeout(budget, request)
            .await
            .map_err(|_| RunnerError::Timeout {
                operation: "provider.generate".to_string(),
                budget_ms: opts.timeout_ms,
            })?
            .map_err(|e| {
                if e.is_timeout() {
                    RunnerError::Timeout {
                        operation: "provider.generate".to_string(),
                        budget_ms: opts.timeout_ms,
                    }
                } else if e.is_connect() {
                    RunnerError::Connection {
                        message: e.to_string(),
                    }
                } else {
                    RunnerError::Other {
                        message: e.to_string(),
                    }
                }
            })?;

        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(RunnerError::RateLimited {
                retry_after_ms: None,
            });
        }
        if !response.status().is_success() {
            return Err(RunnerError::Connection {
                message: format!("provider returned status {}", response.status()),
            });
        }

        let body: GenerateResponse = response
            .json()
            .await
            .map_err(|e| RunnerError::InvalidResponse {
                message: e.to_string(),
            })?;

        Ok(body.text)
    }
}

/// A scripted provider for tests: returns canned responses in order (or a
/// fixed response repeated), optionally failing on a given call index.
/// This is the crate's own test fixture, analogous to the hand-built
/// `Plan`/`Step` fixtures used throughout the source's test suites rather
/// than a mocking framework.
pub struct MockProvider {
    responses: Mutex<VecDeque<Result<String>>>,
    fallback: Option<String>,
}

impl MockProvider {
    pub fn with_responses(responses: Vec<String>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().map(Ok).collect()),
            fallback: None,
        }
    }

    pub fn with_results(results: Vec<Result<String>>) -> Self {
        Self {
            responses: Mutex::new(results.into()),
            fallback: None,
        }
    }

    pub fn constant(response: impl Into<String>) -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            fallback: Some(response.into()),
        }
    }
}

#[async_trait]
impl ModelProvider for MockProvider {
    async fn generate(&self, _prompt: &str, _opts: GenerateOptions) -> Result<String> {
        let mut queue = self.responses.lock().expect("mock provider lock");
        if let Some(next) = queue.pop_front() {
            return next;
        }
        if let Some(fallback) = &self.fallback {
            return Ok(fallback.clone());
        }
        Err(RunnerError::Other {
            message: "MockProvider exhausted its scripted responses".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_provider_returns_responses_in_order() {
        let provider = MockProvider::with_responses(vec!["a".into(), "b".into()]);
        assert_eq!(
            provider.generate("p", GenerateOptions::default()).await.unwrap(),
            "a"
        );
        assert_eq!(
            provider.generate("p", GenerateOptions::default()).await.unwrap(),
            "b"
        );
    }

    #[tokio::test]
    async fn mock_provider_constant_never_exhausts() {
        let provider = MockProvider::constant("same");
        for _ in 0..3 {
            assert_eq!(
                provider.generate("p", GenerateOptions::default()).await.unwrap(),
                "same"
            );
        }
    }

    #[tokio::test]
    async fn mock_provider_can_script_failures() {
        let provider = MockProvider::with_results(vec![
            Err(RunnerError::Timeout {
                operation: "x".into(),
                budget_ms: 10,
            }),
            Ok("recovered".into()),
        ]);
        assert!(provider.generate("p", GenerateOptions::default()).await.is_err());
        assert_eq!(
            provider.generate("p", GenerateOptions::default()).await.unwrap(),
            "recovered"
        );
    }
}
