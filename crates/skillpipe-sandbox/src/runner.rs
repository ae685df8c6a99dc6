//! Sandboxed dispatch.
//!
//! Order of checks: catalog lookup, permissions, risk confirmation, handler
//! binding. Any rejection returns before the handler runs and leaves no
//! execution record. Once the handler starts, every outcome (value, error,
//! panic, timeout, cancellation) is captured into a `ToolExecutionRecord`
//! with its duration.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use skillpipe_core::catalog::{Permission, ToolCatalog, ToolDefinition};
use skillpipe_core::observability::{
    audit_dispatch_completed, audit_dispatch_rejected, audit_dispatch_started,
};
use skillpipe_core::records::ToolExecutionRecord;
use skillpipe_telemetry::{record_best_effort, TelemetryRecord, TelemetryStore};

use crate::error::DispatchError;
use crate::handler::{ToolContext, ToolHandler};
use crate::policy::{check_permissions, RiskPolicy};
use crate::registry::HandlerRegistry;
use crate::usage::UsageCounters;

/// Default per-call timeout (seconds)
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub task_id: String,
    pub tool_id: String,
    pub params: Value,
    pub caller_permissions: BTreeSet<Permission>,
    /// Explicit user confirmation for risk-gated tools.
    pub confirmed: bool,
    /// Skill the scheduler selected the tool through, for usage attribution.
    pub skill_id: Option<String>,
    pub attempt: u32,
    pub cancel: CancellationToken,
}

impl DispatchRequest {
    pub fn new(task_id: impl Into<String>, tool_id: impl Into<String>, params: Value) -> Self {
        Self {
            task_id: task_id.into(),
            tool_id: tool_id.into(),
            params,
            caller_permissions: BTreeSet::new(),
            confirmed: false,
            skill_id: None,
            attempt: 1,
            cancel: CancellationToken::new(),
        }
    }
}

enum Outcome {
    Finished(anyhow::Result<Value>),
    Panicked(String),
    TimedOut,
    Cancelled,
}

pub struct Sandbox {
    catalog: Arc<dyn ToolCatalog>,
    handlers: HandlerRegistry,
    usage: Arc<UsageCounters>,
    store: Arc<dyn TelemetryStore>,
    policy: RiskPolicy,
    timeout: Duration,
    workspace: PathBuf,
}

impl Sandbox {
    pub fn new(
        catalog: Arc<dyn ToolCatalog>,
        handlers: HandlerRegistry,
        store: Arc<dyn TelemetryStore>,
    ) -> Self {
        let unbound = handlers.unbound_tools(catalog.as_ref());
        if !unbound.is_empty() {
            tracing::warn!("Catalog tools without a registered handler: {}", unbound.join(", "));
        }
        Self {
            catalog,
            handlers,
            usage: Arc::new(UsageCounters::new()),
            store,
            policy: RiskPolicy::default(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            workspace: PathBuf::from("."),
        }
    }

    #[must_use]
    pub fn with_policy(mut self, policy: RiskPolicy) -> Self {
        self.policy = policy;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_workspace(mut self, workspace: PathBuf) -> Self {
        self.workspace = workspace;
        self
    }

    /// Share usage counters across sandboxes (e.g. one per conversation).
    #[must_use]
    pub fn with_usage(mut self, usage: Arc<UsageCounters>) -> Self {
        self.usage = usage;
        self
    }

    pub fn catalog(&self) -> &Arc<dyn ToolCatalog> {
        &self.catalog
    }

    pub fn usage(&self) -> &Arc<UsageCounters> {
        &self.usage
    }

    pub fn store(&self) -> &Arc<dyn TelemetryStore> {
        &self.store
    }

    pub fn policy(&self) -> &RiskPolicy {
        &self.policy
    }

    pub async fn dispatch(
        &self,
        req: DispatchRequest,
    ) -> Result<ToolExecutionRecord, DispatchError> {
        let tool = self
            .catalog
            .get_tool(&req.tool_id)
            .ok_or_else(|| self.reject(&req, DispatchError::UnknownTool(req.tool_id.clone())))?;
        check_permissions(tool, &req.caller_permissions).map_err(|e| self.reject(&req, e))?;
        self.policy
            .check(tool, req.confirmed)
            .map_err(|e| self.reject(&req, e))?;
        let handler = self.handlers.get(tool.handler_key()).cloned().ok_or_else(|| {
            self.reject(
                &req,
                DispatchError::MissingHandler {
                    tool: tool.id.clone(),
                    handler: tool.handler_key().to_string(),
                },
            )
        })?;
        if req.cancel.is_cancelled() {
            return Err(DispatchError::Cancelled {
                tool: tool.id.clone(),
                duration_ms: 0,
            });
        }

        audit_dispatch_started(&req.task_id, &tool.id, tool.risk_level, req.attempt);
        tracing::debug!(task = %req.task_id, tool = %tool.id, attempt = req.attempt, "dispatching");

        let ctx = ToolContext {
            task_id: req.task_id.clone(),
            tool_id: tool.id.clone(),
            attempt: req.attempt,
            workspace: self.workspace.clone(),
            cancel: req.cancel.clone(),
        };
        let started = Instant::now();
        let outcome = self.run_handler(handler, req.params.clone(), ctx, &req.cancel).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let mut cancelled = false;
        let (result, error) = match outcome {
            Outcome::Finished(Ok(value)) => {
                let reported = tool_reported_error(&value);
                (Some(value), reported)
            }
            Outcome::Finished(Err(e)) => (None, Some(format!("{:#}", e))),
            Outcome::Panicked(msg) => (None, Some(format!("tool panicked: {}", msg))),
            Outcome::TimedOut => (
                None,
                Some(format!("timed out after {}ms", self.timeout.as_millis())),
            ),
            Outcome::Cancelled => {
                cancelled = true;
                (None, Some("cancelled".to_string()))
            }
        };
        let success = error.is_none();
        let skill_id = req.skill_id.clone().or_else(|| self.default_skill(tool));

        let record = ToolExecutionRecord {
            task_id: req.task_id.clone(),
            tool_id: tool.id.clone(),
            skill_id,
            params: req.params,
            result,
            success,
            duration_ms,
            error,
            attempt: req.attempt,
            recorded_at: Utc::now(),
        };

        if success {
            self.usage.record_success(&tool.id, record.skill_id.as_deref());
        } else {
            tracing::warn!(
                task = %record.task_id,
                tool = %record.tool_id,
                "tool failed: {}",
                record.error.as_deref().unwrap_or("")
            );
        }
        record_best_effort(
            self.store.as_ref(),
            &TelemetryRecord::Execution(record.clone()),
        );
        audit_dispatch_completed(
            &record.task_id,
            &record.tool_id,
            success,
            duration_ms,
            record.error.as_deref(),
        );

        if cancelled {
            return Err(DispatchError::Cancelled {
                tool: record.tool_id,
                duration_ms,
            });
        }
        Ok(record)
    }

    fn reject(&self, req: &DispatchRequest, err: DispatchError) -> DispatchError {
        tracing::warn!(task = %req.task_id, tool = %req.tool_id, "dispatch rejected: {}", err);
        audit_dispatch_rejected(&req.task_id, &req.tool_id, &err.to_string());
        err
    }

    fn default_skill(&self, tool: &ToolDefinition) -> Option<String> {
        self.catalog
            .skills_for_tool(&tool.id)
            .first()
            .map(|s| s.id.clone())
    }

    async fn run_handler(
        &self,
        handler: Arc<dyn ToolHandler>,
        params: Value,
        ctx: ToolContext,
        cancel: &CancellationToken,
    ) -> Outcome {
        let handle = tokio::spawn(async move { handler.execute(&params, &ctx).await });
        let abort = handle.abort_handle();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                abort.abort();
                Outcome::Cancelled
            }
            res = tokio::time::timeout(self.timeout, handle) => {
                match res {
                    Err(_) => {
                        abort.abort();
                        Outcome::TimedOut
                    }
                    Ok(Err(join_err)) if join_err.is_panic() => {
                        Outcome::Panicked(panic_message(join_err.into_panic()))
                    }
                    Ok(Err(join_err)) => Outcome::Finished(Err(anyhow::anyhow!(join_err))),
                    Ok(Ok(result)) => Outcome::Finished(result),
                }
            }
        }
    }
}

/// `{"success": false, "error": ".."}` is a failure even though the handler returned Ok.
fn tool_reported_error(value: &Value) -> Option<String> {
    let obj = value.as_object()?;
    if obj.get("success").and_then(Value::as_bool) != Some(false) {
        return None;
    }
    Some(
        obj.get("error")
            .and_then(Value::as_str)
            .unwrap_or("tool reported failure")
            .to_string(),
    )
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
