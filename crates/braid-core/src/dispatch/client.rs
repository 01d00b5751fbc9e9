//! Agent transport: the request/response exchange with the external agent
//! endpoint, behind a trait so tests and the CLI can inject mocks.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::config::AgentConfig;
use crate::{BraidError, Result};

/// One agent call: task text plus the assembled context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInvocation {
    pub task_title: String,
    pub task_description: String,
    pub context: serde_json::Value,
    pub input_data: serde_json::Value,
}

/// What the agent returns on success.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentReply {
    pub output_data: serde_json::Value,
    #[serde(default)]
    pub summary: Option<String>,
}

/// Call failure, split by whether a retry can possibly help.
#[derive(Debug, Error)]
pub enum AgentCallError {
    #[error("retryable agent error: {0}")]
    Retryable(String),
    #[error("non-retryable agent error: {0}")]
    NonRetryable(String),
}

#[async_trait]
pub trait AgentClient: Send + Sync {
    async fn invoke(&self, invocation: &AgentInvocation)
        -> std::result::Result<AgentReply, AgentCallError>;
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

/// Wire response; a `non_retryable` status sentinel aborts the retry loop.
#[derive(Debug, Deserialize)]
struct WireReply {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    output_data: serde_json::Value,
    #[serde(default)]
    summary: Option<String>,
}

pub struct HttpAgentClient {
    http: reqwest::Client,
    endpoint: String,
}

impl HttpAgentClient {
    pub fn new(config: &AgentConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .connect_timeout(config.connect_timeout())
            .build()
            .map_err(|e| BraidError::Config(format!("failed to build http client: {e}")))?;
        Ok(Self {
            http,
            endpoint: config.endpoint.clone(),
        })
    }
}

#[async_trait]
impl AgentClient for HttpAgentClient {
    async fn invoke(
        &self,
        invocation: &AgentInvocation,
    ) -> std::result::Result<AgentReply, AgentCallError> {
        debug!(task_title = %invocation.task_title, "calling agent endpoint");

        let response = self
            .http
            .post(&self.endpoint)
            .json(invocation)
            .send()
            .await
            .map_err(|e| AgentCallError::Retryable(format!("request failed: {e}")))?;

        let status = response.status();
        if status.is_server_error() || status.as_u16() == 429 {
            return Err(AgentCallError::Retryable(format!(
                "agent endpoint returned {status}"
            )));
        }
        if !status.is_success() {
            return Err(AgentCallError::NonRetryable(format!(
                "agent endpoint returned {status}"
            )));
        }

        let reply: WireReply = response
            .json()
            .await
            .map_err(|e| AgentCallError::Retryable(format!("malformed agent response: {e}")))?;

        match reply.status.as_deref() {
            Some("non_retryable") => Err(AgentCallError::NonRetryable(
                reply.error.unwrap_or_else(|| "agent refused the task".into()),
            )),
            Some("error") => Err(AgentCallError::Retryable(
                reply.error.unwrap_or_else(|| "agent reported an error".into()),
            )),
            _ => Ok(AgentReply {
                output_data: reply.output_data,
                summary: reply.summary,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wire_reply_defaults() {
        let reply: WireReply = serde_json::from_value(json!({
            "output_data": {"ok": true}
        }))
        .unwrap();
        assert!(reply.status.is_none());
        assert_eq!(reply.output_data, json!({"ok": true}));
    }

    #[test]
    fn non_retryable_sentinel_parses() {
        let reply: WireReply = serde_json::from_value(json!({
            "status": "non_retryable",
            "error": "task is unprocessable"
        }))
        .unwrap();
        assert_eq!(reply.status.as_deref(), Some("non_retryable"));
        assert_eq!(reply.error.as_deref(), Some("task is unprocessable"));
    }

    #[test]
    fn invocation_serializes_all_fields() {
        let invocation = AgentInvocation {
            task_title: "summarize".into(),
            task_description: "summarize the draft".into(),
            context: json!({"immediate_upstream": {}}),
            input_data: json!({"text": "hello"}),
        };
        let value = serde_json::to_value(&invocation).unwrap();
        assert_eq!(value["task_title"], "summarize");
        assert!(value.get("context").is_some());
        assert!(value.get("input_data").is_some());
    }
}
