//! Scripted agent backend for tests and for demo/dev deployments with no
//! CLI binary configured. Returns canned responses in order, cycling once
//! exhausted.

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use super::{Agent, AgentError, AgentEvent, ExecutionOptions, ExecutionResult, OutputFormat};

pub struct MockAgent {
    agent_type: String,
    responses: Vec<String>,
    next: AtomicUsize,
    default_format: AtomicU8,
}

impl MockAgent {
    pub fn new(agent_type: impl Into<String>, responses: Vec<String>) -> Self {
        Self { agent_type: agent_type.into(), responses, next: AtomicUsize::new(0), default_format: AtomicU8::new(0) }
    }

    fn next_response(&self) -> String {
        if self.responses.is_empty() {
            return String::new();
        }
        let idx = self.next.fetch_add(1, Ordering::SeqCst) % self.responses.len();
        self.responses[idx].clone()
    }
}

#[async_trait]
impl Agent for MockAgent {
    async fn execute(&self, _prompt: &str, options: ExecutionOptions) -> Result<ExecutionResult, AgentError> {
        let session_id = options.session_id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());
        let text = self.next_response();

        if options.output_format == OutputFormat::StreamJson {
            if let Some(handler) = &options.handler {
                let now = Utc::now();
                handler
                    .on_event(AgentEvent::Init { session_id: session_id.clone(), agent_type: self.agent_type.clone(), timestamp: now, model: None })
                    .await;
                handler
                    .on_event(AgentEvent::Assistant { session_id: session_id.clone(), agent_type: self.agent_type.clone(), timestamp: now, text: text.clone() })
                    .await;
                handler
                    .on_event(AgentEvent::Result { session_id: session_id.clone(), agent_type: self.agent_type.clone(), timestamp: now, success: true, summary: Some(text.clone()) })
                    .await;
            }
        }

        Ok(ExecutionResult { output: text, session_id: Some(session_id) })
    }

    async fn is_available(&self) -> bool {
        true
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
    use std::sync::Mutex;

    #[tokio::test]
    async fn execute_cycles_through_responses() {
        let agent = MockAgent::new("mock", vec!["a".into(), "b".into()]);
        let r1 = agent.execute("x", ExecutionOptions::default()).await.unwrap();
        let r2 = agent.execute("x", ExecutionOptions::default()).await.unwrap();
        let r3 = agent.execute("x", ExecutionOptions::default()).await.unwrap();
        assert_eq!(r1.output, "a");
        assert_eq!(r2.output, "b");
        assert_eq!(r3.output, "a");
    }

    struct Collector(Mutex<Vec<AgentEvent>>);
    #[async_trait]
    impl super::super::EventHandler for Collector {
        async fn on_event(&self, event: AgentEvent) {
            self.0.lock().unwrap().push(event);
        }
    }

    #[tokio::test]
    async fn stream_json_emits_init_assistant_result() {
        let agent = MockAgent::new("mock", vec!["hello".into()]);
        let collector = std::sync::Arc::new(Collector(Mutex::new(Vec::new())));
        let options = ExecutionOptions { output_format: OutputFormat::StreamJson, handler: Some(collector.clone()), ..ExecutionOptions::default() };
        agent.execute("x", options).await.unwrap();
        let events = collector.0.lock().unwrap();
        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], AgentEvent::Init { .. }));
        assert!(matches!(events[1], AgentEvent::Assistant { .. }));
        assert!(matches!(events[2], AgentEvent::Result { .. }));
    }
}
