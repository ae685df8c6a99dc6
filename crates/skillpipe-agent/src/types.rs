//! Shared types for the pipeline.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use skillpipe_core::catalog::{SkillId, ToolId};
use skillpipe_core::records::SlotSource;

use crate::error::PipelineError;

pub type TaskId = String;

// ─── UTF-8 safe string helpers ──────────────────────────────────────────────

/// Truncate a string at a safe UTF-8 char boundary (from the start).
/// Returns a &str of at most `max_bytes` bytes, never splitting a multi-byte character.
pub fn safe_truncate(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

// ─── Intent ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IntentKind {
    ContinueExecution,
    ModifyRequirement,
    NewTask,
    Clarification,
    CancelTask,
}

impl IntentKind {
    pub const ALL: [IntentKind; 5] = [
        IntentKind::ContinueExecution,
        IntentKind::ModifyRequirement,
        IntentKind::NewTask,
        IntentKind::Clarification,
        IntentKind::CancelTask,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            IntentKind::ContinueExecution => "CONTINUE_EXECUTION",
            IntentKind::ModifyRequirement => "MODIFY_REQUIREMENT",
            IntentKind::NewTask => "NEW_TASK",
            IntentKind::Clarification => "CLARIFICATION",
            IntentKind::CancelTask => "CANCEL_TASK",
        }
    }

    /// Accepts the canonical names plus lowercase / kebab variants LLMs tend to produce.
    pub fn parse(raw: &str) -> Option<Self> {
        let norm = raw.trim().to_uppercase().replace(['-', ' '], "_");
        Self::ALL.into_iter().find(|k| k.as_str() == norm)
    }

    /// Whether this intent produces a plan.
    pub fn routes_to_planner(&self) -> bool {
        matches!(
            self,
            IntentKind::ContinueExecution | IntentKind::ModifyRequirement | IntentKind::NewTask
        )
    }
}

impl fmt::Display for IntentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClassifyMethod {
    /// Exact match against a normalized phrase.
    Rule,
    Keyword,
    Regex,
    Llm,
    /// Nothing matched and no LLM is configured.
    Fallback,
}

impl ClassifyMethod {
    pub fn is_deterministic(&self) -> bool {
        matches!(
            self,
            ClassifyMethod::Rule | ClassifyMethod::Keyword | ClassifyMethod::Regex
        )
    }
}

/// Classified intent of one utterance. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    pub kind: IntentKind,
    pub confidence: f32,
    pub method: ClassifyMethod,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extracted_info: Option<Value>,
}

impl Intent {
    pub fn new(kind: IntentKind, confidence: f32, method: ClassifyMethod, reason: impl Into<String>) -> Self {
        Self {
            kind,
            confidence: confidence.clamp(0.0, 1.0),
            method,
            reason: reason.into(),
            extracted_info: None,
        }
    }
}

// ─── Slot ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Slot {
    pub name: String,
    pub value: Option<Value>,
    pub source: SlotSource,
    pub confidence: f32,
}

impl Slot {
    pub fn resolved(name: &str, value: Value, source: SlotSource, confidence: f32) -> Self {
        Self {
            name: name.to_string(),
            value: Some(value),
            source,
            confidence: confidence.clamp(0.0, 1.0),
        }
    }

    pub fn unresolved(name: &str) -> Self {
        Self {
            name: name.to_string(),
            value: None,
            source: SlotSource::Unresolved,
            confidence: 0.0,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.source != SlotSource::Unresolved && self.value.is_some()
    }
}

/// Resolved slots as a JSON params object. Unresolved slots are left out.
pub fn slots_to_params(slots: &BTreeMap<String, Slot>) -> Value {
    let mut map = Map::new();
    for slot in slots.values() {
        if let (true, Some(v)) = (slot.is_resolved(), slot.value.as_ref()) {
            map.insert(slot.name.clone(), v.clone());
        }
    }
    Value::Object(map)
}

// ─── Task ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Ready,
    Running,
    Retrying,
    Succeeded,
    Failed,
    Skipped,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Skipped
        )
    }

    /// Legal edges of the per-task state machine:
    /// `pending → ready → running → {succeeded | retrying → running | failed}`,
    /// `skipped` from any non-terminal state, `ready → pending` when a
    /// dependency is re-opened. Re-opening a succeeded task goes through
    /// [`Task::reopen`].
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (Pending, Ready) | (Ready, Pending) | (Ready, Running) => true,
            (Running, Succeeded) | (Running, Failed) | (Running, Retrying) => true,
            (Retrying, Running) => true,
            (from, Skipped) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Ready => "ready",
            TaskStatus::Running => "running",
            TaskStatus::Retrying => "retrying",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_candidate: Option<ToolId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skill: Option<SkillId>,
    #[serde(default)]
    pub depends_on: BTreeSet<TaskId>,
    pub status: TaskStatus,
    #[serde(default)]
    pub retry_count: u32,
    /// Longest dependency chain starting at this task. Higher runs first.
    #[serde(default)]
    pub priority: u32,
    #[serde(default)]
    pub slots: BTreeMap<String, Slot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Set by `TaskGraph::mark_stale`; the only way a succeeded task runs again.
    #[serde(default)]
    pub stale: bool,
    /// Replacement added by re-planning after this task failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replaced_by: Option<TaskId>,
}

impl Task {
    pub fn new(id: impl Into<TaskId>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            tool_candidate: None,
            skill: None,
            depends_on: BTreeSet::new(),
            status: TaskStatus::Pending,
            retry_count: 0,
            priority: 0,
            slots: BTreeMap::new(),
            result: None,
            error: None,
            stale: false,
            replaced_by: None,
        }
    }

    #[must_use]
    pub fn with_tool(mut self, tool: impl Into<ToolId>) -> Self {
        self.tool_candidate = Some(tool.into());
        self
    }

    #[must_use]
    pub fn with_dependency(mut self, dep: impl Into<TaskId>) -> Self {
        self.depends_on.insert(dep.into());
        self
    }

    pub fn transition(&mut self, next: TaskStatus) -> Result<(), PipelineError> {
        if !self.status.can_transition_to(next) {
            return Err(PipelineError::InvalidTransition {
                task: self.id.clone(),
                from: self.status,
                to: next,
            });
        }
        tracing::trace!(task = %self.id, from = %self.status, to = %next, "task transition");
        self.status = next;
        Ok(())
    }

    /// Re-open a succeeded task that has been marked stale.
    pub(crate) fn reopen(&mut self) -> Result<(), PipelineError> {
        if self.status != TaskStatus::Succeeded {
            return Err(PipelineError::InvalidTransition {
                task: self.id.clone(),
                from: self.status,
                to: TaskStatus::Pending,
            });
        }
        self.stale = true;
        self.status = TaskStatus::Pending;
        self.retry_count = 0;
        self.result = None;
        self.error = None;
        Ok(())
    }

    /// Required slots that are still unresolved.
    pub fn unresolved_required(&self, required: &[String]) -> Vec<String> {
        required
            .iter()
            .filter(|name| !self.slots.get(*name).is_some_and(Slot::is_resolved))
            .cloned()
            .collect()
    }
}

// ─── Conversation state ─────────────────────────────────────────────────────

/// What the pipeline knows about the conversation when a turn starts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversationState {
    pub conversation_id: String,
    /// Current user utterance.
    pub utterance: String,
    /// Slot values supplied explicitly by the caller (form fields, CLI flags).
    #[serde(default)]
    pub explicit_values: Map<String, Value>,
    /// Values known from earlier turns, keyed by entity type (e.g. `email`, `city`).
    #[serde(default)]
    pub entities: HashMap<String, Value>,
    /// Earlier utterances, oldest first.
    #[serde(default)]
    pub history: Vec<String>,
    /// Goal of the task the conversation is working on, if any.
    #[serde(default)]
    pub active_goal: Option<String>,
}

impl ConversationState {
    pub fn new(conversation_id: impl Into<String>, utterance: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            utterance: utterance.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_goal(mut self, goal: impl Into<String>) -> Self {
        self.active_goal = Some(goal.into());
        self
    }

    #[must_use]
    pub fn with_entity(mut self, entity: impl Into<String>, value: Value) -> Self {
        self.entities.insert(entity.into(), value);
        self
    }

    #[must_use]
    pub fn with_value(mut self, slot: impl Into<String>, value: Value) -> Self {
        self.explicit_values.insert(slot.into(), value);
        self
    }

    /// Last `n` history lines joined for prompts.
    pub fn recent_history(&self, n: usize) -> String {
        let start = self.history.len().saturating_sub(n);
        self.history[start..].join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_state_machine_edges() {
        let mut t = Task::new("t1", "do it");
        t.transition(TaskStatus::Ready).unwrap();
        t.transition(TaskStatus::Running).unwrap();
        t.transition(TaskStatus::Retrying).unwrap();
        t.transition(TaskStatus::Running).unwrap();
        t.transition(TaskStatus::Succeeded).unwrap();
        assert!(matches!(
            t.transition(TaskStatus::Running),
            Err(PipelineError::InvalidTransition { .. })
        ));
        assert!(t.transition(TaskStatus::Skipped).is_err());
    }

    #[test]
    fn test_pending_cannot_jump_to_running() {
        let mut t = Task::new("t1", "x");
        assert!(t.transition(TaskStatus::Running).is_err());
        assert!(t.transition(TaskStatus::Skipped).is_ok());
    }

    #[test]
    fn test_intent_kind_parse_variants() {
        assert_eq!(IntentKind::parse("continue_execution"), Some(IntentKind::ContinueExecution));
        assert_eq!(IntentKind::parse("cancel-task"), Some(IntentKind::CancelTask));
        assert_eq!(IntentKind::parse("whatever"), None);
    }

    #[test]
    fn test_slots_to_params_skips_unresolved() {
        let mut slots = BTreeMap::new();
        slots.insert("a".into(), Slot::resolved("a", json!(1), SlotSource::User, 1.0));
        slots.insert("b".into(), Slot::unresolved("b"));
        assert_eq!(slots_to_params(&slots), json!({"a": 1}));
    }

    #[test]
    fn test_safe_truncate_respects_char_boundary() {
        assert_eq!(safe_truncate("你好世界", 4), "你");
        assert_eq!(safe_truncate("abc", 10), "abc");
    }
}
