//! Slot Filler.
//!
//! Per declared parameter, first source that yields a well-typed value wins:
//! 1. explicit: caller-supplied values, then `name=value` / `name: value`
//!    fragments in the task description or the utterance (`user`, 1.0)
//! 2. entity lookup from earlier turns or upstream task outputs (`inferred`)
//! 3. LLM with the parameter's prompt template, required parameters only
//!    (`inferred`, 0.6). `CANNOT_INFER` means no answer.
//! 4. declared default (`default`, 0.5)
//!
//! Anything left is `unresolved` with confidence 0. Every resolution is
//! appended to slot history, best-effort.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use chrono::Utc;
use regex::Regex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use skillpipe_core::catalog::{ParameterSpec, ToolDefinition};
use skillpipe_core::records::{SlotHistoryEntry, SlotSource};
use skillpipe_telemetry::{record_best_effort, TelemetryRecord, TelemetryStore};

use crate::llm::{complete_with_timeout, strip_code_fences, ChatMessage, CompletionRequest, LlmService};
use crate::types::{safe_truncate, ConversationState, Slot, Task};

/// Sentinel an LLM returns when a slot cannot be inferred.
pub const CANNOT_INFER: &str = "CANNOT_INFER";

const ENTITY_CONFIDENCE: f32 = 0.8;
const NAME_MATCH_CONFIDENCE: f32 = 0.7;
const LLM_CONFIDENCE: f32 = 0.6;
const DEFAULT_CONFIDENCE: f32 = 0.5;

const DEFAULT_SLOT_PROMPT: &str = "Extract the value of the parameter '{{slot}}' ({{description}}) for the request below.\n\
Request: {{utterance}}\n\
Recent conversation:\n{{history}}\n\n\
Reply with the value only. If it cannot be determined from the text, reply exactly CANNOT_INFER.";

static ASSIGNMENT: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r#"([A-Za-z_][A-Za-z0-9_]*)\s*[=:：]\s*(?:"([^"]*)"|'([^']*)'|([^\s,，;；]+))"#).ok()
});

/// `name=value` / `name: "quoted value"` fragments, first occurrence wins.
pub fn parse_assignments(text: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    let Some(re) = ASSIGNMENT.as_ref() else {
        return out;
    };
    for cap in re.captures_iter(text) {
        let value = cap
            .get(2)
            .or_else(|| cap.get(3))
            .or_else(|| cap.get(4))
            .map(|m| m.as_str().to_string());
        if let (Some(name), Some(value)) = (cap.get(1), value) {
            out.entry(name.as_str().to_string()).or_insert(value);
        }
    }
    out
}

/// Outcome of the LLM tier for one slot.
enum LlmSlot {
    Value(Value),
    CannotInfer,
    Unavailable,
}

pub struct SlotFiller {
    llm: Option<Arc<dyn LlmService>>,
    llm_timeout: Duration,
    store: Arc<dyn TelemetryStore>,
}

impl SlotFiller {
    pub fn new(store: Arc<dyn TelemetryStore>) -> Self {
        Self {
            llm: None,
            llm_timeout: Duration::from_secs(15),
            store,
        }
    }

    #[must_use]
    pub fn with_llm(mut self, llm: Arc<dyn LlmService>, timeout: Duration) -> Self {
        self.llm = Some(llm);
        self.llm_timeout = timeout;
        self
    }

    /// Deterministic tiers only (explicit, entity, default). No LLM calls and
    /// nothing written to history; used to score candidate tools.
    pub fn preview(
        &self,
        task: &Task,
        tool: &ToolDefinition,
        state: &ConversationState,
    ) -> BTreeMap<String, Slot> {
        let assignments = Assignments::collect(task, state);
        tool.schema
            .parameters
            .iter()
            .map(|p| {
                let slot = deterministic(p, &assignments, state)
                    .or_else(|| default_slot(p))
                    .unwrap_or_else(|| Slot::unresolved(&p.name));
                (p.name.clone(), slot)
            })
            .collect()
    }

    pub async fn fill(
        &self,
        task: &Task,
        tool: &ToolDefinition,
        state: &ConversationState,
        cancel: &CancellationToken,
    ) -> BTreeMap<String, Slot> {
        let assignments = Assignments::collect(task, state);
        let mut slots = BTreeMap::new();
        for param in &tool.schema.parameters {
            let slot = match deterministic(param, &assignments, state) {
                Some(slot) => slot,
                None => self.infer_or_default(param, task, state, cancel).await,
            };
            self.append_history(state, task, &slot);
            slots.insert(param.name.clone(), slot);
        }
        slots
    }

    async fn infer_or_default(
        &self,
        param: &ParameterSpec,
        task: &Task,
        state: &ConversationState,
        cancel: &CancellationToken,
    ) -> Slot {
        if param.required {
            match self.infer_with_llm(param, task, state, cancel).await {
                LlmSlot::Value(v) => {
                    return Slot::resolved(&param.name, v, SlotSource::Inferred, LLM_CONFIDENCE)
                }
                LlmSlot::CannotInfer => {
                    tracing::debug!(task = %task.id, slot = %param.name, "LLM cannot infer slot");
                }
                LlmSlot::Unavailable => {}
            }
        }
        default_slot(param).unwrap_or_else(|| Slot::unresolved(&param.name))
    }

    async fn infer_with_llm(
        &self,
        param: &ParameterSpec,
        task: &Task,
        state: &ConversationState,
        cancel: &CancellationToken,
    ) -> LlmSlot {
        let Some(llm) = self.llm.as_ref() else {
            return LlmSlot::Unavailable;
        };
        let template = param.prompt.as_deref().unwrap_or(DEFAULT_SLOT_PROMPT);
        let utterance = if task.description == state.utterance {
            task.description.clone()
        } else {
            format!("{} (from: {})", task.description, state.utterance)
        };
        let description = param
            .description
            .clone()
            .unwrap_or_else(|| format!("{:?}", param.kind).to_lowercase());
        let prompt = template
            .replace("{{slot}}", &param.name)
            .replace("{{description}}", &description)
            .replace("{{utterance}}", &utterance)
            .replace("{{history}}", safe_truncate(&state.recent_history(5), 2000));
        let request = CompletionRequest::new(vec![ChatMessage::user(&prompt)]).max_tokens(128);

        let raw = match complete_with_timeout(llm.as_ref(), &request, self.llm_timeout, cancel).await {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(slot = %param.name, "Slot LLM call failed: {:#}", e);
                return LlmSlot::Unavailable;
            }
        };
        let answer = strip_code_fences(&raw).trim().trim_matches(|c| c == '"' || c == '\'').trim();
        if answer.is_empty() || answer.to_uppercase().contains(CANNOT_INFER) {
            return LlmSlot::CannotInfer;
        }
        let value = serde_json::from_str::<Value>(answer)
            .unwrap_or_else(|_| Value::String(answer.to_string()));
        match param
            .kind
            .coerce(&value)
            .or_else(|| param.kind.coerce(&Value::String(answer.to_string())))
        {
            Some(v) => LlmSlot::Value(v),
            None => {
                tracing::debug!(slot = %param.name, "LLM value '{}' does not fit {:?}", answer, param.kind);
                LlmSlot::CannotInfer
            }
        }
    }

    fn append_history(&self, state: &ConversationState, task: &Task, slot: &Slot) {
        let entry = SlotHistoryEntry {
            conversation_id: state.conversation_id.clone(),
            task_id: task.id.clone(),
            slot: slot.name.clone(),
            value: slot.value.clone().unwrap_or(Value::Null),
            source: slot.source,
            confidence: slot.confidence,
            recorded_at: Utc::now(),
        };
        record_best_effort(self.store.as_ref(), &TelemetryRecord::SlotResolution(entry));
    }
}

/// Inline assignments, task description first.
struct Assignments {
    task: HashMap<String, String>,
    utterance: HashMap<String, String>,
}

impl Assignments {
    fn collect(task: &Task, state: &ConversationState) -> Self {
        Self {
            task: parse_assignments(&task.description),
            utterance: parse_assignments(&state.utterance),
        }
    }

    /// Candidates for `name`, task description first.
    fn get(&self, name: &str) -> Vec<Value> {
        [self.task.get(name), self.utterance.get(name)]
            .into_iter()
            .flatten()
            .map(|s| Value::String(s.clone()))
            .collect()
    }
}

fn deterministic(
    param: &ParameterSpec,
    assignments: &Assignments,
    state: &ConversationState,
) -> Option<Slot> {
    let explicit = state
        .explicit_values
        .get(&param.name)
        .cloned()
        .into_iter()
        .chain(assignments.get(&param.name));
    for raw in explicit {
        match param.kind.coerce(&raw) {
            Some(v) => return Some(Slot::resolved(&param.name, v, SlotSource::User, 1.0)),
            None => tracing::debug!(slot = %param.name, "explicit value {} does not fit {:?}", raw, param.kind),
        }
    }

    let by_entity = param
        .entity
        .as_ref()
        .and_then(|e| state.entities.get(e))
        .map(|v| (v, ENTITY_CONFIDENCE));
    let by_name = || state.entities.get(&param.name).map(|v| (v, NAME_MATCH_CONFIDENCE));
    if let Some((raw, confidence)) = by_entity.or_else(by_name) {
        if let Some(v) = param.kind.coerce(raw) {
            return Some(Slot::resolved(&param.name, v, SlotSource::Inferred, confidence));
        }
    }
    None
}

fn default_slot(param: &ParameterSpec) -> Option<Slot> {
    param
        .default
        .as_ref()
        .map(|v| Slot::resolved(&param.name, v.clone(), SlotSource::Default, DEFAULT_CONFIDENCE))
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;
    use serde_json::json;
    use skillpipe_core::catalog::{ParamType, ToolSchema};
    use skillpipe_telemetry::{MemoryStore, RecordFilter, RecordKind};

    use crate::llm::Completion;

    struct FixedLlm(&'static str);

    #[async_trait]
    impl LlmService for FixedLlm {
        async fn complete(&self, _request: &CompletionRequest) -> Result<Completion> {
            Ok(Completion {
                content: self.0.to_string(),
            })
        }
    }

    fn param(name: &str, kind: ParamType, required: bool) -> ParameterSpec {
        ParameterSpec {
            name: name.to_string(),
            kind,
            required,
            description: None,
            default: None,
            entity: None,
            prompt: None,
        }
    }

    fn tool(params: Vec<ParameterSpec>) -> ToolDefinition {
        ToolDefinition {
            id: "send_email".to_string(),
            description: String::new(),
            schema: ToolSchema {
                parameters: params,
                ..Default::default()
            },
            risk_level: Default::default(),
            required_permissions: Default::default(),
            examples: vec![],
            keywords: vec![],
            handler: None,
        }
    }

    #[test]
    fn test_parse_assignments() {
        let a = parse_assignments(r#"send to=bob@example.com subject: "Hello there", count=3"#);
        assert_eq!(a["to"], "bob@example.com");
        assert_eq!(a["subject"], "Hello there");
        assert_eq!(a["count"], "3");
        assert!(parse_assignments("no assignments here").is_empty());
    }

    #[tokio::test]
    async fn test_resolution_order_and_provenance() {
        let store = Arc::new(MemoryStore::default());
        let filler = SlotFiller::new(store.clone());
        let mut to = param("to", ParamType::String, true);
        to.entity = Some("email".to_string());
        let mut priority = param("priority", ParamType::Integer, false);
        priority.default = Some(json!(3));
        let t = tool(vec![
            param("subject", ParamType::String, true),
            to,
            priority,
            param("body", ParamType::String, true),
        ]);
        let task = Task::new("t1", "email the report subject=weekly");
        let state = ConversationState::new("c1", "email the report subject=weekly")
            .with_entity("email", json!("alice@example.com"));

        let slots = filler.fill(&task, &t, &state, &CancellationToken::new()).await;

        assert_eq!(slots["subject"].source, SlotSource::User);
        assert_eq!(slots["subject"].value, Some(json!("weekly")));
        assert_eq!(slots["to"].source, SlotSource::Inferred);
        assert_eq!(slots["to"].confidence, ENTITY_CONFIDENCE);
        assert_eq!(slots["priority"].source, SlotSource::Default);
        assert_eq!(slots["priority"].value, Some(json!(3)));
        assert_eq!(slots["body"].source, SlotSource::Unresolved);
        assert_eq!(slots["body"].confidence, 0.0);

        let history = store
            .query(&RecordFilter::kind(RecordKind::SlotResolution))
            .unwrap();
        assert_eq!(history.len(), 4);
    }

    #[tokio::test]
    async fn test_explicit_values_are_coerced() {
        let filler = SlotFiller::new(Arc::new(MemoryStore::default()));
        let t = tool(vec![param("count", ParamType::Integer, true)]);
        let task = Task::new("t1", "repeat count=4");
        let state = ConversationState::new("c1", "repeat count=4");
        let slots = filler.fill(&task, &t, &state, &CancellationToken::new()).await;
        assert_eq!(slots["count"].value, Some(json!(4)));

        // a value of the wrong type does not count as explicit input
        let task = Task::new("t1", "repeat count=many");
        let slots = filler.fill(&task, &t, &state, &CancellationToken::new()).await;
        assert_eq!(slots["count"].value, Some(json!(4)), "falls back to the utterance");
    }

    #[tokio::test]
    async fn test_llm_tier_and_sentinel() {
        let t = tool(vec![param("city", ParamType::String, true)]);
        let task = Task::new("t1", "what's the weather");
        let state = ConversationState::new("c1", "what's the weather in Paris");

        let filler = SlotFiller::new(Arc::new(MemoryStore::default()))
            .with_llm(Arc::new(FixedLlm("\"Paris\"")), Duration::from_secs(1));
        let slots = filler.fill(&task, &t, &state, &CancellationToken::new()).await;
        assert_eq!(slots["city"].source, SlotSource::Inferred);
        assert_eq!(slots["city"].value, Some(json!("Paris")));

        let filler = SlotFiller::new(Arc::new(MemoryStore::default()))
            .with_llm(Arc::new(FixedLlm("CANNOT_INFER")), Duration::from_secs(1));
        let slots = filler.fill(&task, &t, &state, &CancellationToken::new()).await;
        assert_eq!(slots["city"].source, SlotSource::Unresolved);
        assert_eq!(slots["city"].confidence, 0.0);
        assert!(slots["city"].value.is_none());
    }

    #[tokio::test]
    async fn test_sentinel_falls_back_to_default() {
        let mut units = param("units", ParamType::String, true);
        units.default = Some(json!("metric"));
        let t = tool(vec![units]);
        let filler = SlotFiller::new(Arc::new(MemoryStore::default()))
            .with_llm(Arc::new(FixedLlm("cannot_infer")), Duration::from_secs(1));
        let task = Task::new("t1", "weather");
        let state = ConversationState::new("c1", "weather");
        let slots = filler.fill(&task, &t, &state, &CancellationToken::new()).await;
        assert_eq!(slots["units"].source, SlotSource::Default);
    }

    #[test]
    fn test_preview_writes_no_history() {
        let store = Arc::new(MemoryStore::default());
        let filler = SlotFiller::new(store.clone());
        let t = tool(vec![param("text", ParamType::String, true)]);
        let task = Task::new("t1", "echo text=hi");
        let state = ConversationState::new("c1", "echo text=hi");
        let slots = filler.preview(&task, &t, &state);
        assert!(slots["text"].is_resolved());
        assert!(store.is_empty());
    }
}
