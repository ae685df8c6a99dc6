//! Per-turn request and report types.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use skillpipe_core::catalog::{Permission, ToolId};
use skillpipe_core::records::ToolExecutionRecord;

use crate::types::{ConversationState, Intent, Task, TaskId, TaskStatus};

/// Input to one turn.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub conversation: ConversationState,
    pub permissions: BTreeSet<Permission>,
    /// Explicit confirmation for risk-gated tools.
    pub confirmed: bool,
    /// Cancelling aborts LLM calls and in-flight tool calls of this turn.
    pub cancel: CancellationToken,
}

impl TurnRequest {
    pub fn new(conversation: ConversationState) -> Self {
        Self {
            conversation,
            permissions: BTreeSet::new(),
            confirmed: false,
            cancel: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn with_permissions<I, P>(mut self, permissions: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Permission>,
    {
        self.permissions.extend(permissions.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn confirmed(mut self, confirmed: bool) -> Self {
        self.confirmed = confirmed;
        self
    }

    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnOutcome {
    /// Every task succeeded.
    Completed,
    /// Some tasks failed or were skipped; the rest of the results stand.
    Partial,
    /// The utterance was ambiguous.
    NeedsClarification,
    /// Nothing failed, but some tasks wait for slot values from the user.
    NeedsInput,
    /// The user cancelled, or the turn's token fired.
    Cancelled,
    /// No plan could be produced.
    PlanFailed,
}

impl fmt::Display for TurnOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TurnOutcome::Completed => "completed",
            TurnOutcome::Partial => "partial",
            TurnOutcome::NeedsClarification => "needs_clarification",
            TurnOutcome::NeedsInput => "needs_input",
            TurnOutcome::Cancelled => "cancelled",
            TurnOutcome::PlanFailed => "plan_failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskSummary {
    pub id: TaskId,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool: Option<ToolId>,
    pub status: TaskStatus,
    pub retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replaced_by: Option<TaskId>,
}

impl From<&Task> for TaskSummary {
    fn from(t: &Task) -> Self {
        Self {
            id: t.id.clone(),
            description: t.description.clone(),
            tool: t.tool_candidate.clone(),
            status: t.status,
            retry_count: t.retry_count,
            result: t.result.clone(),
            error: t.error.clone(),
            replaced_by: t.replaced_by.clone(),
        }
    }
}

/// Result of one turn. Unrecoverable failures show up here as failed and
/// skipped task lists, never as a panic or an opaque error.
#[derive(Debug, Clone, Serialize)]
pub struct TurnReport {
    pub conversation_id: String,
    pub intent: Intent,
    pub outcome: TurnOutcome,
    /// Goal the plan was built from; the caller keeps it as the active goal.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub goal: Option<String>,
    pub tasks: Vec<TaskSummary>,
    /// Every dispatch attempt, in completion order.
    pub records: Vec<ToolExecutionRecord>,
    pub failed: Vec<TaskId>,
    pub skipped: Vec<TaskId>,
    /// Required slots still missing, per task.
    pub pending_slots: BTreeMap<TaskId, Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl TurnReport {
    pub(crate) fn new(conversation_id: &str, intent: Intent) -> Self {
        Self {
            conversation_id: conversation_id.to_string(),
            intent,
            outcome: TurnOutcome::Completed,
            goal: None,
            tasks: Vec::new(),
            records: Vec::new(),
            failed: Vec::new(),
            skipped: Vec::new(),
            pending_slots: BTreeMap::new(),
            error: None,
            duration_ms: 0,
        }
    }

    pub fn task(&self, id: &str) -> Option<&TaskSummary> {
        self.tasks.iter().find(|t| t.id == id)
    }

    /// Results of succeeded tasks keyed by task id.
    pub fn results(&self) -> BTreeMap<&str, &Value> {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Succeeded)
            .filter_map(|t| t.result.as_ref().map(|r| (t.id.as_str(), r)))
            .collect()
    }
}
