//! AI invocation capability.
//!
//! The engine never spawns processes itself; it hands an [`AgentRequest`]
//! to an [`AgentRunner`] and consumes the resulting event stream. The
//! production runner drives the `claude` CLI ([`ClaudeCliRunner`]); tests
//! substitute scripted fakes.

pub mod claude;
pub mod stream;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub use claude::ClaudeCliRunner;

/// Read and search only.
pub const READ_TOOLS: &[&str] = &["Read", "Glob", "Grep"];
/// Full editing authority including shell access.
pub const IMPLEMENT_TOOLS: &[&str] = &["Read", "Write", "Edit", "MultiEdit", "Glob", "Grep", "Bash"];
/// Inspection plus shell for running checks.
pub const AUDIT_TOOLS: &[&str] = &["Read", "Glob", "Grep", "Bash"];
/// File read/write/search with no shell or execute capability.
pub const FIX_TOOLS: &[&str] = &["Read", "Write", "Edit", "MultiEdit", "Glob", "Grep"];

/// One agent invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentRequest {
    pub prompt: String,
    pub model: Option<String>,
    pub working_dir: PathBuf,
    /// Directories readable in addition to `working_dir`
    pub extra_dirs: Vec<PathBuf>,
    pub tools: Vec<String>,
    pub timeout: Option<Duration>,
}

impl AgentRequest {
    pub fn new(prompt: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            prompt: prompt.into(),
            model: None,
            working_dir: working_dir.into(),
            extra_dirs: Vec::new(),
            tools: Vec::new(),
            timeout: None,
        }
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }

    pub fn with_extra_dirs(mut self, dirs: Vec<PathBuf>) -> Self {
        self.extra_dirs = dirs;
        self
    }

    pub fn with_tools(mut self, tools: &[&str]) -> Self {
        self.tools = tools.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Events produced while an agent runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    /// Incremental assistant text
    TextDelta(String),
    /// The agent's terminal answer
    FinalText(String),
    /// The invocation failed; terminal
    Error(String),
    ToolStart { name: String, description: String },
    ToolEnd { name: String },
    /// Diagnostic line from the underlying process
    Log(String),
}

#[async_trait]
pub trait AgentRunner: Send + Sync {
    /// Start an invocation. The stream ends when the agent finishes, fails,
    /// times out, or `cancel` fires.
    async fn run(
        &self,
        request: AgentRequest,
        cancel: CancellationToken,
    ) -> anyhow::Result<BoxStream<'static, AgentEvent>>;
}

/// Receives every agent event as it streams.
#[async_trait]
pub trait AgentObserver: Send + Sync {
    async fn on_event(&self, event: &AgentEvent) -> anyhow::Result<()>;
}

/// What an invocation produced once its stream is drained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentOutcome {
    Completed { text: String },
    Failed { error: String },
}

/// Run an agent to completion.
///
/// The final text prefers an explicit [`AgentEvent::FinalText`] over the
/// accumulated deltas. Observer errors are logged and never abort the run.
pub async fn invoke(
    runner: &dyn AgentRunner,
    request: AgentRequest,
    cancel: &CancellationToken,
    observer: Option<&dyn AgentObserver>,
) -> AgentOutcome {
    if cancel.is_cancelled() {
        return AgentOutcome::Failed {
            error: "cancelled".to_string(),
        };
    }

    let mut stream = match runner.run(request, cancel.clone()).await {
        Ok(stream) => stream,
        Err(e) => {
            return AgentOutcome::Failed {
                error: format!("{:#}", e),
            };
        }
    };

    let mut accumulated = String::new();
    let mut final_text: Option<String> = None;
    let mut error: Option<String> = None;

    while let Some(event) = stream.next().await {
        if let Some(observer) = observer
            && let Err(e) = observer.on_event(&event).await
        {
            warn!(error = %e, "Agent observer failed; continuing");
        }
        match event {
            AgentEvent::TextDelta(text) => accumulated.push_str(&text),
            AgentEvent::FinalText(text) => final_text = Some(text),
            AgentEvent::Error(message) => {
                error = Some(message);
                break;
            }
            AgentEvent::ToolStart { .. } | AgentEvent::ToolEnd { .. } | AgentEvent::Log(_) => {}
        }
    }

    if let Some(error) = error {
        return AgentOutcome::Failed { error };
    }
    if cancel.is_cancelled() {
        return AgentOutcome::Failed {
            error: "cancelled".to_string(),
        };
    }
    AgentOutcome::Completed {
        text: final_text.unwrap_or(accumulated),
    }
}
