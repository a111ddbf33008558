//! [`AgentRunner`] backed by the `claude` CLI in stream-json mode.

use std::process::Stdio;
use std::time::Instant;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::stream::events_from_line;
use super::{AgentEvent, AgentRequest, AgentRunner};

const STDERR_TAIL_BYTES: usize = 2000;

/// Spawns `claude --print --output-format stream-json` per invocation.
#[derive(Debug, Clone)]
pub struct ClaudeCliRunner {
    claude_cmd: String,
    skip_permissions: bool,
}

impl ClaudeCliRunner {
    pub fn new(claude_cmd: impl Into<String>, skip_permissions: bool) -> Self {
        Self {
            claude_cmd: claude_cmd.into(),
            skip_permissions,
        }
    }

    /// Command-line flags for one request, in the order they are passed.
    pub fn flags(&self, request: &AgentRequest) -> Vec<String> {
        let mut flags = Vec::new();
        if self.skip_permissions {
            flags.push("--dangerously-skip-permissions".to_string());
        }
        flags.push("--print".to_string());
        flags.push("--output-format".to_string());
        flags.push("stream-json".to_string());
        flags.push("--verbose".to_string());
        if let Some(model) = &request.model {
            flags.push("--model".to_string());
            flags.push(model.clone());
        }
        for dir in &request.extra_dirs {
            flags.push("--add-dir".to_string());
            flags.push(dir.to_string_lossy().into_owned());
        }
        if !request.tools.is_empty() {
            flags.push("--allowedTools".to_string());
            flags.push(request.tools.join(","));
        }
        flags
    }
}

#[async_trait]
impl AgentRunner for ClaudeCliRunner {
    async fn run(
        &self,
        request: AgentRequest,
        cancel: CancellationToken,
    ) -> Result<BoxStream<'static, AgentEvent>> {
        let flags = self.flags(&request);
        debug!(cmd = %self.claude_cmd, flags = %flags.join(" "), "Spawning agent");

        let mut child = Command::new(&self.claude_cmd)
            .args(&flags)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .current_dir(&request.working_dir)
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn '{}'", self.claude_cmd))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(request.prompt.as_bytes())
                .await
                .context("Failed to write prompt to stdin")?;
            stdin.shutdown().await.context("Failed to close stdin")?;
        }

        let stdout = child.stdout.take().context("Failed to get stdout")?;
        let mut stderr = child.stderr.take().context("Failed to get stderr")?;
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            let _ = stderr.read_to_string(&mut buf).await;
            buf
        });

        let (tx, rx) = mpsc::channel::<AgentEvent>(64);
        let timeout = request.timeout;

        tokio::spawn(async move {
            let start = Instant::now();
            let mut reader = BufReader::new(stdout).lines();
            let mut tool_names = Vec::new();
            let mut saw_result = false;
            let deadline = async {
                match timeout {
                    Some(limit) => tokio::time::sleep(limit).await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::pin!(deadline);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        let _ = child.kill().await;
                        tx.send(AgentEvent::Error("cancelled".to_string())).await.ok();
                        return;
                    }
                    _ = &mut deadline => {
                        let _ = child.kill().await;
                        let secs = timeout.map(|t| t.as_secs()).unwrap_or_default();
                        tx.send(AgentEvent::Error(format!("Agent timed out after {}s", secs))).await.ok();
                        return;
                    }
                    line = reader.next_line() => match line {
                        Ok(Some(line)) => {
                            if line.trim().is_empty() {
                                continue;
                            }
                            for event in events_from_line(&line, &mut tool_names) {
                                saw_result |= matches!(event, AgentEvent::FinalText(_) | AgentEvent::Error(_));
                                if tx.send(event).await.is_err() {
                                    // Receiver dropped; nobody is listening
                                    let _ = child.kill().await;
                                    return;
                                }
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            tx.send(AgentEvent::Error(format!("Failed to read agent output: {}", e))).await.ok();
                            let _ = child.kill().await;
                            return;
                        }
                    }
                }
            }

            let status = child.wait().await;
            let stderr = stderr_task.await.unwrap_or_default();
            debug!(elapsed_secs = start.elapsed().as_secs_f64(), "Agent process exited");

            match status {
                Ok(status) if !status.success() && !saw_result => {
                    let tail = tail(&stderr, STDERR_TAIL_BYTES);
                    tx.send(AgentEvent::Error(format!(
                        "Agent exited with {}{}",
                        status,
                        if tail.is_empty() { String::new() } else { format!(": {}", tail) }
                    )))
                    .await
                    .ok();
                }
                Ok(_) => {
                    if !stderr.trim().is_empty() {
                        tx.send(AgentEvent::Log(tail(&stderr, STDERR_TAIL_BYTES).to_string()))
                            .await
                            .ok();
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Failed to wait for agent process");
                    tx.send(AgentEvent::Error(format!("Failed to wait for agent: {}", e)))
                        .await
                        .ok();
                }
            }
        });

        Ok(stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|event| (event, rx)) }).boxed())
    }
}

fn tail(text: &str, max_bytes: usize) -> &str {
    let text = text.trim();
    if text.len() <= max_bytes {
        return text;
    }
    let mut start = text.len() - max_bytes;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;

    #[test]
    fn test_flags_include_request_options() {
        let runner = ClaudeCliRunner::new("claude", true);
        let request = AgentRequest::new("prompt", "/proj")
            .with_model(Some("opus".into()))
            .with_extra_dirs(vec![PathBuf::from("/ws")])
            .with_tools(&["Read", "Grep"]);
        let flags = runner.flags(&request);
        assert_eq!(flags[0], "--dangerously-skip-permissions");
        assert!(flags.windows(2).any(|w| w == ["--model", "opus"]));
        assert!(flags.windows(2).any(|w| w == ["--add-dir", "/ws"]));
        assert!(flags.windows(2).any(|w| w == ["--allowedTools", "Read,Grep"]));
    }

    #[test]
    fn test_flags_without_options() {
        let runner = ClaudeCliRunner::new("claude", false);
        let flags = runner.flags(&AgentRequest::new("prompt", "/proj"));
        assert_eq!(flags, vec!["--print", "--output-format", "stream-json", "--verbose"]);
    }

    #[test]
    fn test_tail_keeps_end() {
        assert_eq!(tail("  short  ", 10), "short");
        assert_eq!(tail("abcdefghij", 3), "hij");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_runs_script_and_streams_events() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-claude.sh");
        std::fs::write(
            &script,
            "#!/bin/sh\ncat > /dev/null\n\
echo '{\"type\":\"assistant\",\"message\":{\"content\":[{\"type\":\"text\",\"text\":\"hi\"}]}}'\n\
echo '{\"type\":\"result\",\"subtype\":\"success\",\"result\":\"done\",\"is_error\":false}'\n",
        )
        .unwrap();
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let runner = ClaudeCliRunner::new(script.to_string_lossy(), false);
        let stream = runner
            .run(AgentRequest::new("prompt", dir.path()), CancellationToken::new())
            .await
            .unwrap();
        let events: Vec<AgentEvent> = stream.collect().await;
        assert!(events.contains(&AgentEvent::TextDelta("hi".into())));
        assert!(events.contains(&AgentEvent::FinalText("done".into())));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_kills_agent() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("slow-claude.sh");
        std::fs::write(&script, "#!/bin/sh\ncat > /dev/null\nsleep 30\n").unwrap();
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let runner = ClaudeCliRunner::new(script.to_string_lossy(), false);
        let request = AgentRequest::new("prompt", dir.path()).with_timeout(Some(Duration::from_millis(200)));
        let events: Vec<AgentEvent> = runner
            .run(request, CancellationToken::new())
            .await
            .unwrap()
            .collect()
            .await;
        match events.last() {
            Some(AgentEvent::Error(message)) => assert!(message.contains("timed out")),
            other => panic!("Expected timeout error, got {:?}", other),
        }
    }
}
