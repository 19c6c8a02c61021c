//! The at-most-one response row that accompanies a terminal request.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::RequestId;
use crate::provider::BackendVariant;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenCounts {
    pub input: u32,
    pub output: u32,
    pub total: u32,
}

impl TokenCounts {
    pub fn new(input: u32, output: u32) -> Self {
        Self {
            input,
            output,
            total: input + output,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub request_id: RequestId,
    pub text: Option<String>,
    pub thinking: Option<String>,
    pub tokens: TokenCounts,
    pub latency_ms: u64,
    pub backend_variant: Option<BackendVariant>,
    pub provider_used: Option<String>,
    pub error_code: Option<&'static str>,
    pub error_message: Option<String>,
    pub cached: bool,
    pub completed_at: DateTime<Utc>,
}

impl Response {
    pub fn success(
        request_id: RequestId,
        text: String,
        thinking: Option<String>,
        tokens: TokenCounts,
        latency_ms: u64,
        backend_variant: BackendVariant,
        provider_used: String,
    ) -> Self {
        Self {
            request_id,
            text: Some(text),
            thinking,
            tokens,
            latency_ms,
            backend_variant: Some(backend_variant),
            provider_used: Some(provider_used),
            error_code: None,
            error_message: None,
            cached: false,
            completed_at: Utc::now(),
        }
    }

    pub fn from_cache(request_id: RequestId, text: String, thinking: Option<String>, tokens: TokenCounts, provider_used: String) -> Self {
        Self {
            request_id,
            text: Some(text),
            thinking,
            tokens,
            latency_ms: 0,
            backend_variant: None,
            provider_used: Some(provider_used),
            error_code: None,
            error_message: None,
            cached: true,
            completed_at: Utc::now(),
        }
    }

    pub fn failure(
        request_id: RequestId,
        code: &'static str,
        message: String,
        backend_variant: Option<BackendVariant>,
        provider_used: Option<String>,
        latency_ms: u64,
    ) -> Self {
        Self {
            request_id,
            text: None,
            thinking: None,
            tokens: TokenCounts::default(),
            latency_ms,
            backend_variant,
            provider_used,
            error_code: Some(code),
            error_message: Some(message),
            cached: false,
            completed_at: Utc::now(),
        }
    }

    pub fn cancelled(request_id: RequestId) -> Self {
        Self::failure(request_id, "cancelled", "request was cancelled".to_string(), None, None, 0)
    }

    pub fn timed_out(request_id: RequestId) -> Self {
        Self::failure(request_id, "timed_out", "request exceeded its deadline".to_string(), None, None, 0)
    }

    pub fn is_success(&self) -> bool {
        self.error_code.is_none()
    }
}
