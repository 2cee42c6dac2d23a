//! Agent backend that shells out to a coding-agent CLI binary, using
//! `tokio::process` so a run can be raced against a timeout without a
//! polling loop.
//!
//! The subprocess is expected to emit one JSON object per line on stdout
//! when `OutputFormat::StreamJson` is requested, matching [`super::AgentEvent`]'s
//! tagged shape; a missing `session_id`/`agent_type`/`timestamp` field is
//! filled in from the call's context before decoding.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU8, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use uuid::Uuid;

use super::{Agent, AgentError, AgentEvent, ExecutionOptions, ExecutionResult, OutputFormat};

pub struct CliAgent {
    agent_type: String,
    binary_path: PathBuf,
    extra_args: Vec<String>,
    default_format: AtomicU8,
}

impl CliAgent {
    pub fn new(agent_type: impl Into<String>, binary_path: impl Into<PathBuf>) -> Self {
        Self { agent_type: agent_type.into(), binary_path: binary_path.into(), extra_args: Vec::new(), default_format: AtomicU8::new(0) }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    fn format_flag(format: OutputFormat) -> &'static str {
        match format {
            OutputFormat::Text => "text",
            OutputFormat::StreamJson => "stream-json",
        }
    }

    async fn run(&self, prompt: &str, options: &ExecutionOptions, session_id: &str) -> Result<ExecutionResult, AgentError> {
        let mut cmd = Command::new(&self.binary_path);
        cmd.args(&self.extra_args)
            .arg("--output-format")
            .arg(Self::format_flag(options.output_format))
            .arg(prompt)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &options.project_path {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| AgentError::ExecutionFailed(e.to_string()))?;
        let stdout = child.stdout.take().ok_or_else(|| AgentError::ExecutionFailed("no stdout pipe".into()))?;
        let mut stderr = child.stderr.take().ok_or_else(|| AgentError::ExecutionFailed("no stderr pipe".into()))?;

        let result = match options.output_format {
            OutputFormat::Text => {
                let mut reader = BufReader::new(stdout);
                let mut output = String::new();
                reader
                    .read_to_string(&mut output)
                    .await
                    .map_err(|e| AgentError::ExecutionFailed(e.to_string()))?;
                ExecutionResult { output, session_id: Some(session_id.to_string()) }
            }
            OutputFormat::StreamJson => self.drain_stream_json(stdout, options, session_id).await?,
        };

        let mut stderr_text = String::new();
        let _ = stderr.read_to_string(&mut stderr_text).await;

        let status = child.wait().await.map_err(|e| AgentError::ExecutionFailed(e.to_string()))?;
        if !status.success() {
            return Err(AgentError::ExecutionFailed(if stderr_text.is_empty() {
                format!("agent exited with {status}")
            } else {
                stderr_text
            }));
        }
        Ok(result)
    }

    async fn drain_stream_json(
        &self,
        stdout: tokio::process::ChildStdout,
        options: &ExecutionOptions,
        session_id: &str,
    ) -> Result<ExecutionResult, AgentError> {
        let mut lines = BufReader::new(stdout).lines();
        let mut assistant_text = String::new();
        while let Some(line) = lines.next_line().await.map_err(|e| AgentError::ExecutionFailed(e.to_string()))? {
            if line.trim().is_empty() {
                continue;
            }
            let event = self.parse_event(&line, session_id)?;
            if let AgentEvent::Assistant { text, .. } | AgentEvent::StreamDelta { delta: text, .. } = &event {
                assistant_text.push_str(text);
            }
            if let Some(handler) = &options.handler {
                handler.on_event(event).await;
            }
        }
        Ok(ExecutionResult { output: assistant_text, session_id: Some(session_id.to_string()) })
    }

    /// Fills in `session_id`/`agent_type`/`timestamp` when the subprocess
    /// omitted them, then decodes into the normalized event enum.
    fn parse_event(&self, line: &str, session_id: &str) -> Result<AgentEvent, AgentError> {
        let mut value: serde_json::Value =
            serde_json::from_str(line).map_err(|e| AgentError::MalformedEvent(e.to_string()))?;
        let obj = value.as_object_mut().ok_or_else(|| AgentError::MalformedEvent("event is not a JSON object".into()))?;
        obj.entry("session_id").or_insert_with(|| session_id.into());
        obj.entry("agent_type").or_insert_with(|| self.agent_type.clone().into());
        obj.entry("timestamp").or_insert_with(|| Utc::now().to_rfc3339().into());
        serde_json::from_value(value).map_err(|e| AgentError::MalformedEvent(e.to_string()))
    }
}

#[async_trait]
impl Agent for CliAgent {
    async fn execute(&self, prompt: &str, options: ExecutionOptions) -> Result<ExecutionResult, AgentError> {
        if !self.is_available().await {
            return Err(AgentError::Unavailable(self.binary_path.display().to_string()));
        }
        let session_id = options.session_id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());

        match options.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, self.run(prompt, &options, &session_id)).await {
                Ok(result) => result,
                Err(_) => Err(AgentError::Timeout(timeout)),
            },
            None => self.run(prompt, &options, &session_id).await,
        }
    }

    async fn is_available(&self) -> bool {
        Command::new(&self.binary_path)
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    fn agent_type(&self) -> &str {
        &self.agent_type
    }

    fn set_default_format(&self, format: OutputFormat) {
        self.default_format.store(format as u8, Ordering::SeqCst);
    }

    fn default_format(&self) -> OutputFormat {
        match self.default_format.load(Ordering::SeqCst) {
            0 => OutputFormat::Text,
            _ => OutputFormat::StreamJson,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn is_available_false_for_missing_binary() {
        let agent = CliAgent::new("nope", "/definitely/not/a/real/binary-xyz");
        assert!(!agent.is_available().await);
    }

    #[tokio::test]
    async fn execute_reports_unavailable_without_running() {
        let agent = CliAgent::new("nope", "/definitely/not/a/real/binary-xyz");
        let err = agent.execute("hi", ExecutionOptions::default()).await.unwrap_err();
        assert!(matches!(err, AgentError::Unavailable(_)));
    }

    #[test]
    fn default_format_round_trips() {
        let agent = CliAgent::new("mock", "/bin/true");
        assert_eq!(agent.default_format(), OutputFormat::Text);
        agent.set_default_format(OutputFormat::StreamJson);
        assert_eq!(agent.default_format(), OutputFormat::StreamJson);
    }

    #[test]
    fn parse_event_fills_missing_context_fields() {
        let agent = CliAgent::new("mock", "/bin/true");
        let event = agent.parse_event(r#"{"type":"assistant","text":"hi"}"#, "sess-1").unwrap();
        match event {
            AgentEvent::Assistant { session_id, agent_type, text, .. } => {
                assert_eq!(session_id, "sess-1");
                assert_eq!(agent_type, "mock");
                assert_eq!(text, "hi");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
