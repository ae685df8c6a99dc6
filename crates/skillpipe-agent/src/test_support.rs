//! Fakes and fixtures shared by unit tests.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;

use skillpipe_core::catalog::StaticCatalog;

use crate::llm::{Completion, CompletionRequest, LlmService};

/// Replies with queued answers in order, then with `fallback`.
pub struct ScriptedLlm {
    replies: Mutex<Vec<String>>,
    fallback: String,
    calls: Mutex<usize>,
}

impl ScriptedLlm {
    pub fn new(replies: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.iter().rev().map(|s| s.to_string()).collect()),
            fallback: "CANNOT_INFER".to_string(),
            calls: Mutex::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl LlmService for ScriptedLlm {
    async fn complete(&self, _request: &CompletionRequest) -> Result<Completion> {
        *self.calls.lock().unwrap() += 1;
        let content = self
            .replies
            .lock()
            .unwrap()
            .pop()
            .unwrap_or_else(|| self.fallback.clone());
        Ok(Completion { content })
    }
}

pub const CATALOG_YAML: &str = r#"
tools:
  - id: read_file
    description: Read a text file
    keywords: [read, 读取]
    required_permissions: [fs.read]
    schema:
      parameters:
        - {name: path, type: string, required: true}
      returns: {type: object, fields: [content]}
  - id: summarize
    description: Summarize text
    keywords: [summarize, 总结]
    schema:
      parameters:
        - {name: content, type: string, required: true}
      returns: {type: object, fields: [summary]}
  - id: send_email
    description: Send an email
    keywords: [email, 邮件]
    risk_level: medium
    required_permissions: [net.send]
    schema:
      parameters:
        - {name: to, type: string, required: true, entity: email}
        - {name: body, type: string, required: true, entity: summary}
  - id: weather
    description: Current weather for a city
    keywords: [weather, 天气]
    schema:
      parameters:
        - {name: city, type: string, required: true, entity: city}
        - {name: units, type: string, default: metric}
      returns: {type: object, fields: [temp]}
  - id: weather_backup
    description: Secondary weather provider
    keywords: [weather, 天气]
    schema:
      parameters:
        - {name: city, type: string, required: true, entity: city}
      returns: {type: object, fields: [temp]}
skills:
  - id: files
    tools: [read_file]
    keywords: [file, 文件]
  - id: forecast
    tools: [weather, weather_backup]
    keywords: [forecast, 预报]
  - id: comms
    tools: [send_email]
"#;

pub fn sample_catalog() -> Arc<StaticCatalog> {
    Arc::new(StaticCatalog::from_yaml_str(CATALOG_YAML).unwrap())
}
