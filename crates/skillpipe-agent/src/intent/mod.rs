//! Intent Classifier.
//!
//! Tiers, first hit wins:
//! 1. exact normalized phrase (`Rule`, 0.98)
//! 2. keyword (`Keyword`, 0.80..0.95 by how much of the utterance the keyword covers)
//! 3. regex pattern (`Regex`, 0.75)
//! 4. LLM (`Llm`); malformed or failed responses become `CLARIFICATION`
//! 5. no LLM configured: `NEW_TASK` via `Fallback`, or `CLARIFICATION` for empty input
//!
//! Tiers 1-3 are pure and deterministic.

mod rules;


use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::llm::{
    complete_with_timeout, extract_json_object, strip_code_fences, ChatMessage, CompletionRequest,
    LlmService,
};
use crate::types::{safe_truncate, ClassifyMethod, ConversationState, Intent, IntentKind};

pub(crate) use rules::contains_keyword;
pub use rules::{normalize, IntentRules, RuleSpec};

const EXACT_CONFIDENCE: f32 = 0.98;
const REGEX_CONFIDENCE: f32 = 0.75;
const MALFORMED_CONFIDENCE: f32 = 0.2;
const DEFAULT_LLM_CONFIDENCE: f32 = 0.6;
const FALLBACK_CONFIDENCE: f32 = 0.5;

const CLASSIFY_PROMPT: &str = r#"You classify a user's message in an ongoing task conversation.

Intents:
- CONTINUE_EXECUTION: the user wants the current task to go on as planned
- MODIFY_REQUIREMENT: the user changes a parameter or requirement of the current task
- NEW_TASK: the user asks for something new
- CLARIFICATION: the message is a question or too ambiguous to act on
- CANCEL_TASK: the user wants to stop the current task

Reply with a single JSON object and nothing else:
{"intent": "<one of the intents>", "confidence": <0..1>, "reason": "<short reason>", "extracted_info": {<optional key facts>}}"#;

/// `getStats()` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ClassifierStats {
    pub rules_count: usize,
    pub keywords_count: usize,
    pub patterns_count: usize,
}

/// Outcome of parsing an LLM classification answer.
#[derive(Debug, Clone, PartialEq)]
pub enum LlmIntentResponse {
    Parsed(Intent),
    Malformed(String),
}

#[derive(Debug, Deserialize)]
struct RawLlmIntent {
    intent: String,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default, alias = "extractedInfo")]
    extracted_info: Option<Value>,
}

/// Parse a raw LLM answer. Never coerces: anything that is not a JSON object
/// with a known `intent` is `Malformed`.
pub fn parse_llm_intent(raw: &str) -> LlmIntentResponse {
    let cleaned = strip_code_fences(raw);
    let Some(json) = extract_json_object(cleaned) else {
        return LlmIntentResponse::Malformed(raw.to_string());
    };
    let parsed: RawLlmIntent = match serde_json::from_str(json) {
        Ok(p) => p,
        Err(_) => return LlmIntentResponse::Malformed(raw.to_string()),
    };
    let Some(kind) = IntentKind::parse(&parsed.intent) else {
        return LlmIntentResponse::Malformed(raw.to_string());
    };
    let confidence = parsed
        .confidence
        .filter(|c| c.is_finite())
        .map(|c| c as f32)
        .unwrap_or(DEFAULT_LLM_CONFIDENCE);
    let mut intent = Intent::new(
        kind,
        confidence,
        ClassifyMethod::Llm,
        parsed.reason.unwrap_or_else(|| "llm classification".to_string()),
    );
    intent.extracted_info = parsed.extracted_info.filter(|v| !v.is_null());
    LlmIntentResponse::Parsed(intent)
}

pub struct IntentClassifier {
    rules: IntentRules,
    llm: Option<Arc<dyn LlmService>>,
    llm_timeout: Duration,
}

impl IntentClassifier {
    pub fn new(rules: IntentRules) -> Self {
        Self {
            rules,
            llm: None,
            llm_timeout: Duration::from_secs(15),
        }
    }

    #[must_use]
    pub fn with_llm(mut self, llm: Arc<dyn LlmService>, timeout: Duration) -> Self {
        self.llm = Some(llm);
        self.llm_timeout = timeout;
        self
    }

    pub fn stats(&self) -> ClassifierStats {
        ClassifierStats {
            rules_count: self.rules.exact.len(),
            keywords_count: self.rules.keywords.len(),
            patterns_count: self.rules.patterns.len(),
        }
    }

    /// Tiers 1-3 only. `None` when no deterministic rule fires.
    pub fn classify_deterministic(&self, utterance: &str) -> Option<Intent> {
        let norm = normalize(utterance);
        if norm.is_empty() {
            return None;
        }
        if let Some(kind) = self.rules.exact_match(&norm) {
            return Some(Intent::new(
                kind,
                EXACT_CONFIDENCE,
                ClassifyMethod::Rule,
                format!("exact phrase '{}'", norm),
            ));
        }
        if let Some((kw, kind)) = self.rules.keyword_match(&norm) {
            let coverage = kw.chars().count() as f32 / norm.chars().count().max(1) as f32;
            let confidence = (0.8 + 0.15 * coverage.min(1.0)).min(0.95);
            return Some(Intent::new(
                kind,
                confidence,
                ClassifyMethod::Keyword,
                format!("keyword '{}'", kw),
            ));
        }
        if let Some((re, kind)) = self.rules.pattern_match(&norm) {
            return Some(Intent::new(
                kind,
                REGEX_CONFIDENCE,
                ClassifyMethod::Regex,
                format!("pattern /{}/", re.as_str()),
            ));
        }
        None
    }

    pub async fn classify(
        &self,
        utterance: &str,
        ctx: &ConversationState,
        cancel: &CancellationToken,
    ) -> Intent {
        if let Some(intent) = self.classify_deterministic(utterance) {
            tracing::debug!(kind = %intent.kind, method = ?intent.method, "intent classified");
            return intent;
        }
        if utterance.trim().is_empty() {
            return Intent::new(
                IntentKind::Clarification,
                0.1,
                ClassifyMethod::Fallback,
                "empty utterance",
            );
        }
        let Some(llm) = self.llm.as_ref() else {
            return Intent::new(
                IntentKind::NewTask,
                FALLBACK_CONFIDENCE,
                ClassifyMethod::Fallback,
                "no deterministic rule matched; no LLM configured",
            );
        };

        let request = CompletionRequest::new(vec![
            ChatMessage::system(CLASSIFY_PROMPT),
            ChatMessage::user(&build_user_prompt(utterance, ctx)),
        ])
        .max_tokens(256);

        match complete_with_timeout(llm.as_ref(), &request, self.llm_timeout, cancel).await {
            Ok(raw) => match parse_llm_intent(&raw) {
                LlmIntentResponse::Parsed(intent) => intent,
                LlmIntentResponse::Malformed(raw) => {
                    tracing::warn!("Malformed LLM intent response: {}", safe_truncate(&raw, 200));
                    Intent::new(
                        IntentKind::Clarification,
                        MALFORMED_CONFIDENCE,
                        ClassifyMethod::Llm,
                        "malformed LLM response",
                    )
                }
            },
            Err(e) => {
                tracing::warn!("Intent LLM call failed: {:#}", e);
                Intent::new(
                    IntentKind::Clarification,
                    MALFORMED_CONFIDENCE,
                    ClassifyMethod::Llm,
                    format!("LLM unavailable: {}", e),
                )
            }
        }
    }
}

fn build_user_prompt(utterance: &str, ctx: &ConversationState) -> String {
    let mut prompt = String::new();
    if let Some(goal) = ctx.active_goal.as_deref() {
        prompt.push_str(&format!("Current task: {}\n", goal));
    }
    let history = ctx.recent_history(5);
    if !history.is_empty() {
        prompt.push_str(&format!("Recent messages:\n{}\n", safe_truncate(&history, 2000)));
    }
    prompt.push_str(&format!("Message to classify: {}", utterance));
    prompt
}
