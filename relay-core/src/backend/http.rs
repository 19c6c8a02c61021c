//! HTTP backend: one call to an upstream API, dispatched through a small
//! `Dialect` trait. Grounded on `dwctl::probes::executor::get_default_config`,
//! which dispatches payload construction on a descriptor field the same way.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};

use super::tokens;
use super::{Backend, BackendCtx, BackendResult, BackendSuccess, HealthCheck};
use crate::provider::{BackendVariant, HttpBackendConfig, HttpDialect};
use crate::request::RequestRecord;
use crate::response::TokenCounts;

/// Builds the provider-specific request body and extracts text/usage from the
/// provider-specific response body. Three zero-sized marker types implement this;
/// `by_name` is the registry the provider descriptor's `dialect` field selects.
pub trait Dialect: Send + Sync {
    fn build_request(&self, prompt: &str, model: &str) -> Value;
    fn extract_response(&self, body: &Value) -> Option<(String, Option<String>, Option<TokenCounts>)>;
}

pub struct AnthropicDialect;
pub struct OpenaiDialect;
pub struct GeminiDialect;

impl Dialect for AnthropicDialect {
    fn build_request(&self, prompt: &str, model: &str) -> Value {
        json!({
            "model": model,
            "max_tokens": 4096,
            "messages": [{"role": "user", "content": prompt}],
        })
    }

    fn extract_response(&self, body: &Value) -> Option<(String, Option<String>, Option<TokenCounts>)> {
        let content = body.get("content")?.as_array()?;
        let text: String = content.iter().filter_map(|c| c.get("text").and_then(Value::as_str)).collect();
        let tokens = body.get("usage").map(|u| {
            TokenCounts::new(
                u.get("input_tokens").and_then(Value::as_u64).unwrap_or(0) as u32,
                u.get("output_tokens").and_then(Value::as_u64).unwrap_or(0) as u32,
            )
        });
        Some((text, None, tokens))
    }
}

impl Dialect for OpenaiDialect {
    fn build_request(&self, prompt: &str, model: &str) -> Value {
        json!({
            "model": model,
            "messages": [{"role": "user", "content": prompt}],
        })
    }

    fn extract_response(&self, body: &Value) -> Option<(String, Option<String>, Option<TokenCounts>)> {
        let choices = body.get("choices")?.as_array()?;
        let text = choices.first()?.get("message")?.get("content")?.as_str()?.to_string();
        let tokens = body.get("usage").map(|u| TokenCounts {
            input: u.get("prompt_tokens").and_then(Value::as_u64).unwrap_or(0) as u32,
            output: u.get("completion_tokens").and_then(Value::as_u64).unwrap_or(0) as u32,
            total: u.get("total_tokens").and_then(Value::as_u64).unwrap_or(0) as u32,
        });
        Some((text, None, tokens))
    }
}

impl Dialect for GeminiDialect {
    fn build_request(&self, prompt: &str, _model: &str) -> Value {
        json!({
            "contents": [{"parts": [{"text": prompt}]}],
        })
    }

    fn extract_response(&self, body: &Value) -> Option<(String, Option<String>, Option<TokenCounts>)> {
        let candidates = body.get("candidates")?.as_array()?;
        let parts = candidates.first()?.get("content")?.get("parts")?.as_array()?;
        let text: String = parts.iter().filter_map(|p| p.get("text").and_then(Value::as_str)).collect();
        let tokens = body.get("usageMetadata").map(|u| TokenCounts {
            input: u.get("promptTokenCount").and_then(Value::as_u64).unwrap_or(0) as u32,
            output: u.get("candidatesTokenCount").and_then(Value::as_u64).unwrap_or(0) as u32,
            total: u.get("totalTokenCount").and_then(Value::as_u64).unwrap_or(0) as u32,
        });
        Some((text, None, tokens))
    }
}

pub fn by_name(dialect: HttpDialect) -> Box<dyn Dialect> {
    match dialect {
        HttpDialect::Anthropic => Box::new(AnthropicDialect),
        HttpDialect::Openai => Box::new(OpenaiDialect),
        HttpDialect::Gemini => Box::new(GeminiDialect),
    }
}

pub struct HttpBackend {
    config: HttpBackendConfig,
    default_model: Option<String>,
    cost_per_1k: Option<f64>,
    client: reqwest::Client,
    dialect: Box<dyn Dialect>,
}

impl HttpBackend {
    pub fn new(config: HttpBackendConfig, default_model: Option<String>, cost_per_1k: Option<f64>) -> Self {
        let dialect = by_name(config.dialect);
        Self {
            client: reqwest::Client::new(),
            dialect,
            config,
            default_model,
            cost_per_1k,
        }
    }

    fn api_key(&self) -> Option<String> {
        std::env::var(&self.config.api_key_env).ok()
    }

    fn model_for(&self, request: &RequestRecord) -> String {
        request
            .model
            .clone()
            .or_else(|| self.default_model.clone())
            .unwrap_or_else(|| "default".to_string())
    }

    async fn send(&self, prompt: &str, model: &str, ctx: &BackendCtx) -> Result<(reqwest::StatusCode, Option<Duration>, Value), BackendResult> {
        let payload = self.dialect.build_request(prompt, model);
        let mut builder = self
            .client
            .post(&self.config.api_base_url)
            .json(&payload)
            .timeout(ctx.remaining().max(Duration::from_millis(1)));
        if let Some(key) = self.api_key() {
            builder = builder.bearer_auth(key);
        }
        for (k, v) in &self.config.extra_headers {
            builder = builder.header(k.as_str(), v.as_str());
        }

        let resp = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => {
                return Err(BackendResult::TransientError { message: "cancelled before response".to_string() });
            }
            r = builder.send() => r,
        };

        let resp = resp.map_err(|e| {
            if e.is_timeout() {
                BackendResult::TransientError { message: "upstream request timed out".to_string() }
            } else {
                BackendResult::TransientError { message: e.to_string() }
            }
        })?;

        let status = resp.status();
        let retry_after = resp
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs);

        let body = resp.json::<Value>().await.unwrap_or(Value::Null);
        Ok((status, retry_after, body))
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn execute(&self, request: &RequestRecord, ctx: &BackendCtx) -> BackendResult {
        let model = self.model_for(request);
        let started = Instant::now();
        let (status, retry_after, body) = match self.send(&request.prompt, &model, ctx).await {
            Ok(v) => v,
            Err(result) => return result,
        };

        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return BackendResult::AuthRequired { hint_url: None };
        }
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return BackendResult::RateLimited { retry_after };
        }
        if status.is_server_error() {
            return BackendResult::TransientError {
                message: format!("upstream returned {status}"),
            };
        }
        if status.is_client_error() {
            return BackendResult::PermanentError {
                message: format!("upstream returned {status}"),
            };
        }

        match self.dialect.extract_response(&body) {
            Some((text, thinking, usage)) => {
                let tokens = usage.unwrap_or_else(|| tokens::estimate(&request.prompt, &text));
                let cost = self
                    .cost_per_1k
                    .map(|rate| (tokens.total as f64 / 1000.0) * rate)
                    .unwrap_or(0.0);
                let _ = started.elapsed();
                BackendResult::Success(BackendSuccess { text, thinking, tokens, cost })
            }
            None => BackendResult::PermanentError {
                message: "response did not match the configured dialect".to_string(),
            },
        }
    }

    async fn health_check(&self, ctx: &BackendCtx) -> HealthCheck {
        let started = Instant::now();
        match self.send("ping", &self.model_for(&ping_probe()), ctx).await {
            Ok((status, _, _)) if status.is_success() => HealthCheck::Ok,
            Ok((status, _, _)) if status.is_server_error() => HealthCheck::Down(format!("http {status}")),
            Ok((status, _, _)) => HealthCheck::Degraded(format!("http {status}")),
            Err(_) => HealthCheck::Down(format!("no response after {:?}", started.elapsed())),
        }
    }

    fn estimated_cost(&self, request: &RequestRecord) -> f64 {
        self.cost_per_1k
            .map(|rate| (tokens::estimate_tokens(&request.prompt) as f64 / 1000.0) * rate)
            .unwrap_or(0.0)
    }

    fn variant(&self) -> BackendVariant {
        BackendVariant::Http
    }
}

/// A throwaway record used only to resolve `model_for` during a health ping; the
/// ping never persists or appears in the store.
fn ping_probe() -> RequestRecord {
    RequestRecord::new("health-probe", None, None, "ping", 0, chrono::Duration::seconds(5), None, None, String::new(), true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openai_dialect_extracts_content_and_usage() {
        let body = json!({
            "choices": [{"message": {"content": "hi"}}],
            "usage": {"prompt_tokens": 3, "completion_tokens": 1, "total_tokens": 4},
        });
        let (text, thinking, tokens) = OpenaiDialect.extract_response(&body).unwrap();
        assert_eq!(text, "hi");
        assert!(thinking.is_none());
        let tokens = tokens.unwrap();
        assert_eq!(tokens.total, 4);
    }

    #[test]
    fn anthropic_dialect_joins_content_blocks() {
        let body = json!({"content": [{"type": "text", "text": "hel"}, {"type": "text", "text": "lo"}]});
        let (text, _, _) = AnthropicDialect.extract_response(&body).unwrap();
        assert_eq!(text, "hello");
    }

    #[test]
    fn gemini_dialect_extracts_parts() {
        let body = json!({"candidates": [{"content": {"parts": [{"text": "hi"}]}}]});
        let (text, _, _) = GeminiDialect.extract_response(&body).unwrap();
        assert_eq!(text, "hi");
    }
}
