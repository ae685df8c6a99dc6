//! LLM service seam.
//!
//! The pipeline only needs `complete(messages) -> content`. [`LlmClient`]
//! implements it against an OpenAI-compatible `/chat/completions` endpoint;
//! tests substitute scripted fakes.
//!
//! Every call goes through [`complete_with_timeout`]: a timeout, transport
//! error or cancellation comes back as `Err` and callers fall back.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use skillpipe_core::config::LlmConfig;

mod openai;


#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: &str) -> Self {
        Self {
            role: "system".to_string(),
            content: content.to_string(),
        }
    }

    pub fn user(content: &str) -> Self {
        Self {
            role: "user".to_string(),
            content: content.to_string(),
        }
    }

    pub fn assistant(content: &str) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
}

impl CompletionRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            temperature: Some(0.0),
            max_tokens: None,
        }
    }

    #[must_use]
    pub fn max_tokens(mut self, max: u32) -> Self {
        self.max_tokens = Some(max);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub content: String,
}

#[async_trait]
pub trait LlmService: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion>;
}

/// Run one completion bounded by `timeout` and `cancel`.
pub async fn complete_with_timeout(
    llm: &dyn LlmService,
    request: &CompletionRequest,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<String> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => anyhow::bail!("LLM call cancelled"),
        res = tokio::time::timeout(timeout, llm.complete(request)) => {
            let completion = res
                .map_err(|_| anyhow::anyhow!("LLM call timed out after {}s", timeout.as_secs()))??;
            Ok(completion.content)
        }
    }
}

// ─── Response helpers ───────────────────────────────────────────────────────

/// Strip a surrounding ```json / ``` fence.
pub fn strip_code_fences(raw: &str) -> &str {
    let mut s = raw.trim();
    if let Some(rest) = s.strip_prefix("```json") {
        s = rest;
    } else if let Some(rest) = s.strip_prefix("```") {
        s = rest;
    }
    if let Some(rest) = s.strip_suffix("```") {
        s = rest;
    }
    s.trim()
}

/// The outermost `{ ... }` span in a response that may wrap JSON in prose.
pub fn extract_json_object(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    (end > start).then(|| &raw[start..=end])
}

/// The outermost `[ ... ]` span.
pub fn extract_json_array(raw: &str) -> Option<&str> {
    let start = raw.find('[')?;
    let end = raw.rfind(']')?;
    (end > start).then(|| &raw[start..=end])
}

// ─── OpenAI-compatible client ───────────────────────────────────────────────

pub struct LlmClient {
    http: reqwest::Client,
    api_base: String,
    api_key: String,
    model: String,
}

impl LlmClient {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1) * 2))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
        })
    }

    /// Client from env, or `None` when no API key is configured.
    pub fn from_env() -> Option<Self> {
        let cfg = LlmConfig::try_from_env()?;
        match Self::new(&cfg) {
            Ok(c) => Some(c),
            Err(e) => {
                tracing::warn!("LLM client unavailable: {:#}", e);
                None
            }
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}
