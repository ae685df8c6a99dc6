//! Quality Gate: post-dispatch checkpoint for one task attempt.
//!
//! | record | verdict |
//! |---|---|
//! | success, result matches the declared return shape | `Accept` |
//! | success, wrong shape | `Replan` |
//! | failure, retry budget left | `Retry` (same tool, same params) |
//! | failure, budget exhausted | `Abort` (task fails, dependents skipped) |

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use skillpipe_core::catalog::ToolCatalog;
use skillpipe_core::records::ToolExecutionRecord;

use crate::types::Task;

pub const DEFAULT_MAX_RETRIES: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GateAction {
    Accept,
    Retry,
    Replan,
    Abort,
}

impl fmt::Display for GateAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            GateAction::Accept => "accept",
            GateAction::Retry => "retry",
            GateAction::Replan => "replan",
            GateAction::Abort => "abort",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Verdict {
    pub ok: bool,
    pub action: GateAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Verdict {
    fn accept() -> Self {
        Self {
            ok: true,
            action: GateAction::Accept,
            reason: None,
        }
    }

    fn reject(action: GateAction, reason: impl Into<String>) -> Self {
        Self {
            ok: false,
            action,
            reason: Some(reason.into()),
        }
    }
}

pub struct QualityGate {
    catalog: Arc<dyn ToolCatalog>,
    max_retries: u32,
}

impl QualityGate {
    pub fn new(catalog: Arc<dyn ToolCatalog>) -> Self {
        Self {
            catalog,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn validate(&self, task: &Task, record: &ToolExecutionRecord) -> Verdict {
        if !record.success {
            let error = record.error.as_deref().unwrap_or("tool reported failure");
            return if task.retry_count < self.max_retries {
                Verdict::reject(
                    GateAction::Retry,
                    format!("attempt {} failed: {}", task.retry_count + 1, error),
                )
            } else {
                Verdict::reject(
                    GateAction::Abort,
                    format!("failed after {} attempt(s): {}", task.retry_count + 1, error),
                )
            };
        }

        let Some(tool) = self.catalog.get_tool(&record.tool_id) else {
            return Verdict::reject(
                GateAction::Replan,
                format!("tool '{}' is no longer in the catalog", record.tool_id),
            );
        };
        let result = record.result.as_ref().unwrap_or(&Value::Null);
        let problems = tool.schema.returns.mismatches(result);
        if problems.is_empty() {
            Verdict::accept()
        } else {
            tracing::debug!(task = %task.id, tool = %tool.id, "Result shape mismatch: {}", problems.join("; "));
            Verdict::reject(GateAction::Replan, problems.join("; "))
        }
    }
}
