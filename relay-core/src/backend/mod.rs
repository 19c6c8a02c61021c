//! The backend abstraction: a uniform `execute`/`health_check` interface over three
//! transports. Grounded on spec.md §4.2 and §9's "providers are data, not
//! subclasses" — `BackendKind` is a closed enum dispatching to exactly three
//! implementations, never a trait-object hierarchy that invites a fourth subclass.

pub mod cli;
pub mod http;
pub mod terminal;
pub mod tokens;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::provider::BackendVariant;
use crate::request::RequestRecord;
use crate::response::TokenCounts;

/// Carries the per-attempt deadline and cancellation signal every backend must
/// honor cooperatively.
#[derive(Debug, Clone)]
pub struct BackendCtx {
    pub deadline: DateTime<Utc>,
    pub cancel: CancellationToken,
}

impl BackendCtx {
    pub fn new(deadline: DateTime<Utc>, cancel: CancellationToken) -> Self {
        Self { deadline, cancel }
    }

    pub fn remaining(&self) -> Duration {
        (self.deadline - Utc::now()).to_std().unwrap_or_default()
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.deadline
    }
}

#[derive(Debug, Clone)]
pub struct BackendSuccess {
    pub text: String,
    pub thinking: Option<String>,
    pub tokens: TokenCounts,
    pub cost: f64,
}

/// The outcome of a single `execute` attempt. Mirrors spec.md §4.2 exactly; the
/// retry/fallback executor branches on this and never sees a transport detail.
#[derive(Debug, Clone)]
pub enum BackendResult {
    Success(BackendSuccess),
    AuthRequired { hint_url: Option<String> },
    TransientError { message: String },
    PermanentError { message: String },
    RateLimited { retry_after: Option<Duration> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthCheck {
    Ok,
    Degraded(String),
    Down(String),
}

#[async_trait]
pub trait Backend: Send + Sync {
    async fn execute(&self, request: &RequestRecord, ctx: &BackendCtx) -> BackendResult;
    async fn health_check(&self, ctx: &BackendCtx) -> HealthCheck;
    fn estimated_cost(&self, request: &RequestRecord) -> f64;
    fn variant(&self) -> BackendVariant;
}

/// Closed dispatch over the three concrete backend implementations.
pub enum BackendKind {
    Http(http::HttpBackend),
    Cli(cli::CliBackend),
    Terminal(terminal::TerminalBackend),
}

#[async_trait]
impl Backend for BackendKind {
    async fn execute(&self, request: &RequestRecord, ctx: &BackendCtx) -> BackendResult {
        match self {
            BackendKind::Http(b) => b.execute(request, ctx).await,
            BackendKind::Cli(b) => b.execute(request, ctx).await,
            BackendKind::Terminal(b) => b.execute(request, ctx).await,
        }
    }

    async fn health_check(&self, ctx: &BackendCtx) -> HealthCheck {
        match self {
            BackendKind::Http(b) => b.health_check(ctx).await,
            BackendKind::Cli(b) => b.health_check(ctx).await,
            BackendKind::Terminal(b) => b.health_check(ctx).await,
        }
    }

    fn estimated_cost(&self, request: &RequestRecord) -> f64 {
        match self {
            BackendKind::Http(b) => b.estimated_cost(request),
            BackendKind::Cli(b) => b.estimated_cost(request),
            BackendKind::Terminal(b) => b.estimated_cost(request),
        }
    }

    fn variant(&self) -> BackendVariant {
        match self {
            BackendKind::Http(b) => b.variant(),
            BackendKind::Cli(b) => b.variant(),
            BackendKind::Terminal(b) => b.variant(),
        }
    }
}

/// Strips ANSI escape sequences and common CLI tool banners from subprocess/pane
/// output before it's treated as response text. Shared by the `cli` and `terminal`
/// variants since both read raw TTY-ish output.
pub(crate) fn strip_ansi(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\u{1b}' {
            // ESC '[' ... final byte in 0x40..=0x7e
            if chars.peek() == Some(&'[') {
                chars.next();
                for c2 in chars.by_ref() {
                    if ('\x40'..='\x7e').contains(&c2) {
                        break;
                    }
                }
            }
            continue;
        }
        out.push(c);
    }
    out
}

/// Scans text for known auth-prompt substrings, case-insensitively.
pub(crate) fn contains_auth_indicator(text: &str, indicators: &[String]) -> bool {
    let lower = text.to_lowercase();
    indicators.iter().any(|ind| lower.contains(&ind.to_lowercase()))
}

/// Extracts the first `http(s)://...` URL from text, if any, for auth hint links.
pub(crate) fn extract_url(text: &str) -> Option<String> {
    let idx = text.find("http://").or_else(|| text.find("https://"))?;
    let rest = &text[idx..];
    let end = rest
        .find(|c: char| c.is_whitespace() || c == ')' || c == '"' || c == '\'')
        .unwrap_or(rest.len());
    Some(rest[..end].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_ansi_color_codes() {
        assert_eq!(strip_ansi("\x1b[31mred\x1b[0m text"), "red text");
    }

    #[test]
    fn finds_auth_indicator_case_insensitive() {
        assert!(contains_auth_indicator("Please SIGN IN to continue", &["sign in".to_string()]));
    }

    #[test]
    fn extracts_first_url() {
        assert_eq!(extract_url("visit https://example.com/auth now"), Some("https://example.com/auth".to_string()));
    }
}
