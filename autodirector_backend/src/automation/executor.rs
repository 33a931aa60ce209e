//! Side effects for routed, non-mood actions.
//!
//! The engine never talks to OBS, the soundboard or the overlay directly. It
//! hands every executable action to an [`ActionExecutor`] and records what
//! comes back.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::{Duration, Instant};

use super::types::{ActionResult, ActionType};

const MAX_ERROR_BODY_CHARS: usize = 300;

#[async_trait]
pub trait ActionExecutor: Send + Sync {
    /// Perform `action_type`. Failures come back as `success: false`; this
    /// never panics or errors past the call boundary.
    async fn execute(&self, action_type: ActionType, params: &Value) -> ActionResult;
}

/// Posts each action as JSON to an overlay/OBS bridge webhook.
pub struct HttpActionExecutor {
    http: reqwest::Client,
    url: String,
}

impl HttpActionExecutor {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build action webhook client")?;
        Ok(Self {
            http,
            url: url.into(),
        })
    }

    async fn post(&self, action_type: ActionType, params: &Value) -> Result<Value> {
        let response = self
            .http
            .post(&self.url)
            .json(&json!({
                "action_type": action_type,
                "params": params,
                "sent_at": chrono::Utc::now(),
            }))
            .send()
            .await
            .with_context(|| format!("action webhook {} unreachable", self.url))?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            let snippet: String = body.chars().take(MAX_ERROR_BODY_CHARS).collect();
            anyhow::bail!("action webhook returned {}: {}", status, snippet.trim());
        }
        Ok(serde_json::from_str(&body).unwrap_or(Value::Null))
    }
}

#[async_trait]
impl ActionExecutor for HttpActionExecutor {
    async fn execute(&self, action_type: ActionType, params: &Value) -> ActionResult {
        let started = Instant::now();
        let outcome = self.post(action_type, params).await;
        let execution_time_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(metadata) => {
                // Bridges may answer 200 with an explicit failure flag.
                if metadata.get("success").and_then(Value::as_bool) == Some(false) {
                    let error = metadata
                        .get("error")
                        .and_then(Value::as_str)
                        .unwrap_or("bridge reported failure")
                        .to_string();
                    return failure(action_type, execution_time_ms, error, metadata);
                }
                ActionResult {
                    success: true,
                    action_type,
                    execution_time_ms,
                    error: None,
                    metadata,
                }
            }
            Err(error) => {
                tracing::warn!("Action {} failed: {:#}", action_type, error);
                failure(action_type, execution_time_ms, format!("{:#}", error), Value::Null)
            }
        }
    }
}

fn failure(action_type: ActionType, execution_time_ms: u64, error: String, metadata: Value) -> ActionResult {
    ActionResult {
        success: false,
        action_type,
        execution_time_ms,
        error: Some(error),
        metadata,
    }
}

/// Used when no bridge is configured: logs the action and reports success.
#[derive(Debug, Default)]
pub struct LoggingActionExecutor;

#[async_trait]
impl ActionExecutor for LoggingActionExecutor {
    async fn execute(&self, action_type: ActionType, params: &Value) -> ActionResult {
        tracing::info!("[dry executor] {} {}", action_type, params);
        ActionResult {
            success: true,
            action_type,
            execution_time_ms: 0,
            error: None,
            metadata: json!({ "executor": "logging" }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn logging_executor_always_succeeds() {
        let result = LoggingActionExecutor
            .execute(ActionType::GraphicShow, &json!({ "graphic": "poll" }))
            .await;
        assert!(result.success);
        assert_eq!(result.action_type, ActionType::GraphicShow);
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn unreachable_webhook_reports_failure() {
        // Port 9 (discard) on loopback is closed in test environments.
        let executor =
            HttpActionExecutor::new("http://127.0.0.1:9/actions", Duration::from_millis(500))
                .unwrap();
        let result = executor
            .execute(ActionType::SoundboardPlay, &json!({ "sound": "airhorn" }))
            .await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("unreachable"));
    }
}
