//! Agent invocation.
//!
//! The LLM agent is a black box behind the [`Agent`] trait: given a model,
//! budgets, and a prompt it produces text plus accounting metadata, or
//! fails. The production implementation shells out to an external CLI and
//! reads a single JSON object from its stdout; the prompt travels over
//! stdin so it never hits the argv limit.

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::config::PipelineConfig;

/// Everything the agent needs for one invocation.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub model: String,
    pub max_turns: u32,
    pub max_budget_usd: f64,
    pub permission_mode: String,
    pub prompt: String,
}

impl AgentRequest {
    pub fn new(model: impl Into<String>, max_turns: u32, max_budget_usd: f64, prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            max_turns,
            max_budget_usd,
            permission_mode: "acceptEdits".to_string(),
            prompt: prompt.into(),
        }
    }
}

/// Wire format returned by the agent CLI.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentOutcome {
    pub text: String,
    #[serde(default)]
    pub cost_usd: f64,
    #[serde(default)]
    pub num_turns: u32,
    #[serde(default)]
    pub session_id: String,
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Failed to spawn agent process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Failed to write prompt to agent stdin: {0}")]
    Stdin(#[source] std::io::Error),

    #[error("Agent exited with code {code}: {stderr}")]
    NonZeroExit { code: i32, stderr: String },

    #[error("Agent produced unparseable output: {0}")]
    Wire(#[source] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Black-box agent callable. The runner owns the wall-clock timeout; an
/// implementation only has to guarantee the child dies when the future is
/// dropped.
#[async_trait]
pub trait Agent: Send + Sync {
    async fn run(&self, request: &AgentRequest) -> Result<AgentOutcome, AgentError>;
}

/// Production agent: an external command configured via `AGENT_COMMAND`.
pub struct CommandAgent {
    program: String,
    base_args: Vec<String>,
}

impl CommandAgent {
    pub fn new(command_line: &str) -> Self {
        let mut parts = command_line.split_whitespace().map(String::from);
        let program = parts.next().unwrap_or_else(|| "claude-agent".to_string());
        Self { program, base_args: parts.collect() }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(&config.agent_command())
    }

    fn build_command(&self, request: &AgentRequest) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.base_args)
            .arg("--model")
            .arg(&request.model)
            .arg("--max-turns")
            .arg(request.max_turns.to_string())
            .arg("--max-budget-usd")
            .arg(format!("{:.2}", request.max_budget_usd))
            .arg("--permission-mode")
            .arg(&request.permission_mode)
            .arg("--output-format")
            .arg("json")
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            // The runner enforces the timeout by dropping this future;
            // the child must not outlive it.
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl Agent for CommandAgent {
    async fn run(&self, request: &AgentRequest) -> Result<AgentOutcome, AgentError> {
        let mut child = self.build_command(request).spawn().map_err(AgentError::Spawn)?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(request.prompt.as_bytes())
                .await
                .map_err(AgentError::Stdin)?;
            stdin.shutdown().await.map_err(AgentError::Stdin)?;
        }

        let output = child.wait_with_output().await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AgentError::NonZeroExit {
                code: output.status.code().unwrap_or(-1),
                stderr: stderr.trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        serde_json::from_str(&stdout).map_err(AgentError::Wire)
    }
}

#[cfg(test)]
pub(crate) mod stub {
    //! Scripted agent for unit tests: pops one canned response per call.

    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    pub(crate) struct StubAgent {
        responses: Mutex<VecDeque<Result<AgentOutcome, AgentError>>>,
        pub(crate) requests: Mutex<Vec<AgentRequest>>,
    }

    impl StubAgent {
        pub(crate) fn new() -> Self {
            Self {
                responses: Mutex::new(VecDeque::new()),
                requests: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn push_text(self, text: &str) -> Self {
            let next = self.responses.lock().unwrap().len();
            self.responses.lock().unwrap().push_back(Ok(AgentOutcome {
                text: text.to_string(),
                cost_usd: 0.25,
                num_turns: 3,
                session_id: format!("session-{next}"),
            }));
            self
        }

        pub(crate) fn push_outcome(self, outcome: AgentOutcome) -> Self {
            self.responses.lock().unwrap().push_back(Ok(outcome));
            self
        }

        pub(crate) fn push_error(self, message: &str) -> Self {
            self.responses.lock().unwrap().push_back(Err(AgentError::NonZeroExit {
                code: 1,
                stderr: message.to_string(),
            }));
            self
        }
    }

    #[async_trait]
    impl Agent for StubAgent {
        async fn run(&self, request: &AgentRequest) -> Result<AgentOutcome, AgentError> {
            self.requests.lock().unwrap().push(request.clone());
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| panic!("StubAgent ran out of scripted responses"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_agent_splits_program_and_args() {
        let agent = CommandAgent::new("claude-agent --endpoint local");
        assert_eq!(agent.program, "claude-agent");
        assert_eq!(agent.base_args, vec!["--endpoint", "local"]);
    }

    #[test]
    fn test_command_agent_bare_program() {
        let agent = CommandAgent::new("claude-agent");
        assert_eq!(agent.program, "claude-agent");
        assert!(agent.base_args.is_empty());
    }

    #[test]
    fn test_agent_request_default_permission_mode() {
        let req = AgentRequest::new("model-x", 10, 2.0, "do the thing");
        assert_eq!(req.permission_mode, "acceptEdits");
    }

    #[test]
    fn test_outcome_wire_defaults() {
        let outcome: AgentOutcome = serde_json::from_str(r#"{"text": "hi"}"#).unwrap();
        assert_eq!(outcome.text, "hi");
        assert_eq!(outcome.cost_usd, 0.0);
        assert_eq!(outcome.num_turns, 0);
        assert_eq!(outcome.session_id, "");
    }

    #[test]
    fn test_outcome_wire_full() {
        let outcome: AgentOutcome = serde_json::from_str(
            r#"{"text": "VERDICT: PASS", "cost_usd": 1.25, "num_turns": 7, "session_id": "abc"}"#,
        )
        .unwrap();
        assert_eq!(outcome.cost_usd, 1.25);
        assert_eq!(outcome.num_turns, 7);
        assert_eq!(outcome.session_id, "abc");
    }

    #[tokio::test]
    async fn test_command_agent_missing_binary_is_spawn_error() {
        let agent = CommandAgent::new("definitely-not-a-real-binary-xyz");
        let req = AgentRequest::new("m", 1, 0.1, "p");
        let err = agent.run(&req).await.unwrap_err();
        assert!(matches!(err, AgentError::Spawn(_)));
    }

    #[cfg(unix)]
    fn write_fake_agent(dir: &std::path::Path, body: &str) -> std::path::PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let script = dir.join("fake-agent.sh");
        std::fs::write(&script, format!("#!/bin/sh\n{body}\n")).unwrap();
        let mut perms = std::fs::metadata(&script).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&script, perms).unwrap();
        script
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_agent_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_fake_agent(
            dir.path(),
            r#"cat > /dev/null
printf '{"text":"VERDICT: PASS","cost_usd":0.5,"num_turns":2,"session_id":"s"}'"#,
        );
        let agent = CommandAgent::new(script.to_str().unwrap());
        let req = AgentRequest::new("m", 1, 0.1, "prompt body");
        let outcome = agent.run(&req).await.unwrap();
        assert_eq!(outcome.text, "VERDICT: PASS");
        assert_eq!(outcome.num_turns, 2);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_agent_nonzero_exit_carries_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_fake_agent(
            dir.path(),
            "cat > /dev/null\necho 'budget exhausted' >&2\nexit 3",
        );
        let agent = CommandAgent::new(script.to_str().unwrap());
        let req = AgentRequest::new("m", 1, 0.1, "p");
        match agent.run(&req).await.unwrap_err() {
            AgentError::NonZeroExit { code, stderr } => {
                assert_eq!(code, 3);
                assert!(stderr.contains("budget exhausted"));
            }
            other => panic!("Expected NonZeroExit, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_agent_garbage_stdout_is_wire_error() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_fake_agent(dir.path(), "cat > /dev/null\necho 'not json'");
        let agent = CommandAgent::new(script.to_str().unwrap());
        let req = AgentRequest::new("m", 1, 0.1, "p");
        assert!(matches!(agent.run(&req).await.unwrap_err(), AgentError::Wire(_)));
    }
}
