//! CLI backend: a short-lived subprocess per request.
//!
//! Process hygiene is grounded on `fusillade::daemon`'s `scopeguard::guard` idiom
//! (there it guarantees an in-flight counter decrements on every exit path,
//! including a panic unwinding through the guard; here the same guard guarantees
//! the child process is terminated on every exit path) combined with a
//! SIGTERM-then-SIGKILL grace window, per spec.md §5's "CLI — SIGTERM then SIGKILL".

use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use scopeguard::guard;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;

use super::tokens;
use super::{contains_auth_indicator, extract_url, strip_ansi, Backend, BackendCtx, BackendResult, BackendSuccess, HealthCheck};
use crate::provider::{BackendVariant, CliBackendConfig};
use crate::request::RequestRecord;

const KILL_GRACE: Duration = Duration::from_secs(2);
const TRANSIENT_EXIT_HINTS: &[&str] = &["timeout", "connection reset", "temporarily unavailable", "econnrefused", "network"];
const MAX_ERROR_EXCERPT: usize = 300;

#[derive(Debug)]
enum RunError {
    Spawn(String),
    Wait(String),
    Cancelled,
    DeadlineExceeded,
}

pub struct CliBackend {
    config: CliBackendConfig,
    cost_per_1k: Option<f64>,
}

impl CliBackend {
    pub fn new(config: CliBackendConfig, cost_per_1k: Option<f64>) -> Self {
        Self { config, cost_per_1k }
    }

    fn render_args(&self, prompt: &str) -> Vec<String> {
        self.config.args_template.iter().map(|a| a.replace("{prompt}", prompt)).collect()
    }

    async fn run(&self, prompt: &str, ctx: &BackendCtx) -> Result<(std::process::ExitStatus, String), RunError> {
        let args = self.render_args(prompt);
        let prompt_via_stdin = !self.config.args_template.iter().any(|a| a.contains("{prompt}"));

        let mut cmd = Command::new(&self.config.command);
        cmd.args(&args)
            .envs(&self.config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| RunError::Spawn(e.to_string()))?;
        let pid = child.id();

        if prompt_via_stdin {
            if let Some(mut stdin) = child.stdin.take() {
                let _ = stdin.write_all(prompt.as_bytes()).await;
                let _ = stdin.shutdown().await;
            }
        } else {
            drop(child.stdin.take());
        }

        let mut child = guard(child, move |mut child| {
            if let Some(pid) = pid {
                terminate(pid);
            }
            let _ = child.start_kill();
        });

        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => {
                if let Some(pid) = pid {
                    terminate(pid);
                }
                if timeout(KILL_GRACE, child.wait()).await.is_err() {
                    let _ = child.start_kill();
                }
                Err(RunError::Cancelled)
            }
            result = timeout(ctx.remaining().max(Duration::from_millis(1)), child.wait()) => {
                match result {
                    Ok(Ok(status)) => {
                        let mut inner = scopeguard::ScopeGuard::into_inner(child);
                        let mut out = Vec::new();
                        if let Some(mut stdout) = inner.stdout.take() {
                            use tokio::io::AsyncReadExt;
                            let _ = stdout.read_to_end(&mut out).await;
                        }
                        Ok((status, strip_ansi(&String::from_utf8_lossy(&out))))
                    }
                    Ok(Err(e)) => Err(RunError::Wait(e.to_string())),
                    Err(_) => {
                        if let Some(pid) = pid {
                            terminate(pid);
                        }
                        let _ = timeout(KILL_GRACE, child.wait()).await;
                        Err(RunError::DeadlineExceeded)
                    }
                }
            }
        }
    }
}

#[cfg(unix)]
fn terminate(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
}

#[cfg(not(unix))]
fn terminate(_pid: u32) {}

fn excerpt(text: &str) -> String {
    text.chars().take(MAX_ERROR_EXCERPT).collect()
}

#[async_trait]
impl Backend for CliBackend {
    async fn execute(&self, request: &RequestRecord, _started_marker: &BackendCtx) -> BackendResult {
        let ctx = _started_marker;
        let _started = Instant::now();
        match self.run(&request.prompt, ctx).await {
            Ok((status, output)) => {
                if contains_auth_indicator(&output, &self.config.auth_indicators) {
                    return BackendResult::AuthRequired { hint_url: extract_url(&output) };
                }
                if status.success() {
                    let tokens = tokens::estimate(&request.prompt, &output);
                    let cost = self.cost_per_1k.map(|r| (tokens.total as f64 / 1000.0) * r).unwrap_or(0.0);
                    BackendResult::Success(BackendSuccess {
                        text: output,
                        thinking: None,
                        tokens,
                        cost,
                    })
                } else {
                    let lower = output.to_lowercase();
                    let transient = TRANSIENT_EXIT_HINTS.iter().any(|hint| lower.contains(hint));
                    let message = format!("exit {:?}: {}", status.code(), excerpt(&output));
                    if transient {
                        BackendResult::TransientError { message }
                    } else {
                        BackendResult::PermanentError { message }
                    }
                }
            }
            Err(RunError::Cancelled) => BackendResult::TransientError {
                message: "cancelled".to_string(),
            },
            Err(RunError::DeadlineExceeded) => BackendResult::TransientError {
                message: "deadline exceeded".to_string(),
            },
            Err(RunError::Spawn(message)) => BackendResult::PermanentError { message },
            Err(RunError::Wait(message)) => BackendResult::TransientError { message },
        }
    }

    async fn health_check(&self, ctx: &BackendCtx) -> HealthCheck {
        match self.run("ping", ctx).await {
            Ok((status, _)) if status.success() => HealthCheck::Ok,
            Ok((status, output)) => HealthCheck::Degraded(format!("exit {:?}: {}", status.code(), excerpt(&output))),
            Err(e) => HealthCheck::Down(format!("{e:?}")),
        }
    }

    fn estimated_cost(&self, request: &RequestRecord) -> f64 {
        self.cost_per_1k
            .map(|rate| (tokens::estimate_tokens(&request.prompt) as f64 / 1000.0) * rate)
            .unwrap_or(0.0)
    }

    fn variant(&self) -> BackendVariant {
        BackendVariant::Cli
    }
}
