//! Terminal backend: writes the prompt into a pre-attached pane and polls its
//! output tail for a completion marker.
//!
//! No terminal-multiplexer crate is grounded anywhere in the retrieval pack, so
//! this is specified against a `PaneController` trait with an in-process fake,
//! `InMemoryPaneController` — the executor stays oblivious to whether panes are
//! real or faked, per spec.md §9's "keep provider-specific quirks inside the
//! variant" guidance. A real implementation would shell out to a multiplexer CLI
//! (e.g. `tmux send-keys` / `tmux capture-pane`) behind this same trait.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::sleep;

use super::tokens;
use super::{contains_auth_indicator, extract_url, strip_ansi, Backend, BackendCtx, BackendResult, BackendSuccess, HealthCheck};
use crate::provider::{BackendVariant, TerminalBackendConfig};
use crate::request::RequestRecord;

const DEFAULT_AUTH_INDICATORS: &[&str] = &["sign in", "authenticate", "oauth", "please log in"];

#[async_trait]
pub trait PaneController: Send + Sync {
    async fn write_prompt(&self, pane_id: &str, text: &str) -> std::io::Result<()>;
    async fn read_tail(&self, pane_id: &str) -> std::io::Result<String>;
}

/// A channel-backed fake pane: appends to an in-memory buffer per pane id instead
/// of driving a real terminal multiplexer.
pub struct InMemoryPaneController {
    panes: Mutex<HashMap<String, String>>,
}

impl InMemoryPaneController {
    pub fn new() -> Self {
        Self { panes: Mutex::new(HashMap::new()) }
    }

    /// Test hook: appends to a pane's tail, as if a CLI running in it had produced
    /// more output (including, eventually, the completion marker).
    pub async fn push_output(&self, pane_id: &str, text: &str) {
        let mut panes = self.panes.lock().await;
        panes.entry(pane_id.to_string()).or_default().push_str(text);
    }
}

impl Default for InMemoryPaneController {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PaneController for InMemoryPaneController {
    async fn write_prompt(&self, pane_id: &str, text: &str) -> std::io::Result<()> {
        let mut panes = self.panes.lock().await;
        let entry = panes.entry(pane_id.to_string()).or_default();
        entry.push_str("$ ");
        entry.push_str(text);
        entry.push('\n');
        Ok(())
    }

    async fn read_tail(&self, pane_id: &str) -> std::io::Result<String> {
        let panes = self.panes.lock().await;
        Ok(panes.get(pane_id).cloned().unwrap_or_default())
    }
}

pub struct TerminalBackend {
    config: TerminalBackendConfig,
    pane: Arc<dyn PaneController>,
    poll_interval: Duration,
    cost_per_1k: Option<f64>,
}

impl TerminalBackend {
    pub fn new(config: TerminalBackendConfig, pane: Arc<dyn PaneController>, cost_per_1k: Option<f64>) -> Self {
        Self {
            config,
            pane,
            poll_interval: Duration::from_millis(200),
            cost_per_1k,
        }
    }

    async fn send_and_wait(&self, prompt: &str, ctx: &BackendCtx) -> Result<String, String> {
        let full_prompt = format!("{}{}", self.config.prompt_prefix, prompt);
        self.pane.write_prompt(&self.config.pane_id, &full_prompt).await.map_err(|e| e.to_string())?;

        loop {
            if ctx.is_expired() {
                return Err("deadline exceeded".to_string());
            }
            let tail = self.pane.read_tail(&self.config.pane_id).await.map_err(|e| e.to_string())?;
            if let Some(idx) = tail.find(&self.config.completion_marker) {
                return Ok(tail[..idx].to_string());
            }
            let wait = self.poll_interval.min(ctx.remaining().max(Duration::from_millis(1)));
            tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => return Err("cancelled".to_string()),
                _ = sleep(wait) => {}
            }
        }
    }
}

#[async_trait]
impl Backend for TerminalBackend {
    async fn execute(&self, request: &RequestRecord, ctx: &BackendCtx) -> BackendResult {
        match self.send_and_wait(&request.prompt, ctx).await {
            Ok(raw) => {
                let output = strip_ansi(&raw);
                let indicators: Vec<String> = DEFAULT_AUTH_INDICATORS.iter().map(|s| s.to_string()).collect();
                if contains_auth_indicator(&output, &indicators) {
                    return BackendResult::AuthRequired { hint_url: extract_url(&output) };
                }
                let tokens = tokens::estimate(&request.prompt, &output);
                let cost = self.cost_per_1k.map(|r| (tokens.total as f64 / 1000.0) * r).unwrap_or(0.0);
                BackendResult::Success(BackendSuccess {
                    text: output,
                    thinking: None,
                    tokens,
                    cost,
                })
            }
            Err(message) => BackendResult::TransientError { message },
        }
    }

    async fn health_check(&self, ctx: &BackendCtx) -> HealthCheck {
        match self.send_and_wait("ping", ctx).await {
            Ok(_) => HealthCheck::Ok,
            Err(message) => HealthCheck::Down(message),
        }
    }

    fn estimated_cost(&self, request: &RequestRecord) -> f64 {
        self.cost_per_1k
            .map(|rate| (tokens::estimate_tokens(&request.prompt) as f64 / 1000.0) * rate)
            .unwrap_or(0.0)
    }

    fn variant(&self) -> BackendVariant {
        BackendVariant::Terminal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    fn ctx() -> BackendCtx {
        BackendCtx::new(chrono::Utc::now() + chrono::Duration::seconds(5), CancellationToken::new())
    }

    #[tokio::test]
    async fn completes_once_marker_appears() {
        let pane = Arc::new(InMemoryPaneController::new());
        let backend = TerminalBackend::new(
            TerminalBackendConfig {
                pane_id: "0".to_string(),
                prompt_prefix: "> ".to_string(),
                completion_marker: "<<DONE>>".to_string(),
            },
            pane.clone(),
            None,
        );

        let pane_for_writer = pane.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            pane_for_writer.push_output("0", "hello there<<DONE>>").await;
        });

        let request = RequestRecord::new("term", None, None, "hi", 0, chrono::Duration::seconds(5), None, None, String::new(), true);
        let result = backend.execute(&request, &ctx()).await;
        match result {
            BackendResult::Success(s) => assert_eq!(s.text.trim_start_matches("$ > hi\n"), "hello there"),
            other => panic!("expected success, got {other:?}"),
        }
    }
}
