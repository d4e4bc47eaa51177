//! Chat language model client.
//!
//! Talks to an OpenAI-compatible chat-completions endpoint. Two modes:
//! blocking completion (used by the relevance gate) and token streaming
//! over a bounded channel (used for answer generation). Dropping the
//! stream receiver cancels the in-flight request.

use anyhow::{bail, Result};
use async_trait::async_trait;
use futures::StreamExt;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::config::LlmConfig;
use crate::models::Message;

/// Buffered tokens between the HTTP stream and the consumer.
const STREAM_CHANNEL_CAPACITY: usize = 32;

#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Run a chat exchange to completion and return the full reply.
    async fn complete(&self, messages: &[Message]) -> Result<String>;

    /// Stream reply tokens as they are generated. The request is aborted
    /// when the receiver is dropped.
    async fn stream(&self, messages: &[Message]) -> Result<mpsc::Receiver<Result<String>>>;
}

pub struct HttpChatModel {
    endpoint: String,
    model: String,
    api_key: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl HttpChatModel {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env).map_err(|_| {
            anyhow::anyhow!("environment variable {} not set for LLM API", config.api_key_env)
        })?;

        Ok(Self {
            endpoint: config.endpoint.clone(),
            model: config.model.clone(),
            api_key,
            timeout: Duration::from_secs(config.timeout_secs),
            client: reqwest::Client::new(),
        })
    }

    async fn send_request(&self, messages: &[Message], stream: bool) -> Result<reqwest::Response> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "stream": stream,
        });

        let mut request = self
            .client
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body);
        // A whole-request timeout would cut long token streams short, so
        // only blocking completions get one.
        if !stream {
            request = request.timeout(self.timeout);
        }

        let response = request.send().await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!("LLM API error {}: {}", status, text);
        }
        Ok(response)
    }
}

#[async_trait]
impl ChatModel for HttpChatModel {
    async fn complete(&self, messages: &[Message]) -> Result<String> {
        let response = self.send_request(messages, false).await?;
        let json: serde_json::Value = response.json().await?;
        json.pointer("/choices/0/message/content")
            .and_then(|c| c.as_str())
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("invalid LLM response: missing message content"))
    }

    async fn stream(&self, messages: &[Message]) -> Result<mpsc::Receiver<Result<String>>> {
        let response = self.send_request(messages, true).await?;
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);

        tokio::spawn(async move {
            let mut body = response.bytes_stream();
            let mut buf = String::new();

            while let Some(chunk) = body.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        let _ = tx.send(Err(e.into())).await;
                        return;
                    }
                };
                buf.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(pos) = buf.find('\n') {
                    let line = buf[..pos].trim().to_string();
                    buf.drain(..=pos);

                    let Some(data) = line.strip_prefix("data: ") else {
                        continue;
                    };
                    if data == "[DONE]" {
                        return;
                    }
                    if let Some(token) = parse_stream_token(data) {
                        // Receiver dropped: stop pulling from the socket.
                        if tx.send(Ok(token)).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });

        Ok(rx)
    }
}

/// Extract the content delta from one SSE data payload, if any.
fn parse_stream_token(data: &str) -> Option<String> {
    let json: serde_json::Value = serde_json::from_str(data).ok()?;
    let content = json.pointer("/choices/0/delta/content")?.as_str()?;
    if content.is_empty() {
        None
    } else {
        Some(content.to_string())
    }
}
