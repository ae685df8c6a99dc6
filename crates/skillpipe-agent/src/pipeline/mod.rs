//! Turn pipeline: classify → plan → (fill slots → select → dispatch →
//! validate) per task, with bounded parallelism across ready tasks.
//!
//! Each task runs in two steps. *Prepare* picks the tool and fills its
//! slots while the task is still `ready`; only a task whose required slots
//! all resolved moves to `running` and gets a *dispatch* step. Retries
//! re-dispatch the same tool with the same parameters.

mod report;

#[cfg(test)]
mod tests;

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::{BoxFuture, FutureExt};
use futures_util::stream::{FuturesUnordered, StreamExt};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use skillpipe_core::catalog::{ToolCatalog, ToolId};
use skillpipe_core::config::PipelineConfig;
use skillpipe_core::records::{Stage, ToolExecutionRecord};
use skillpipe_sandbox::{DispatchError, HandlerRegistry, RiskPolicy, Sandbox, UsageCounters};
use skillpipe_telemetry::{NullStore, PerformanceMonitor, TelemetryStore};

use crate::error::PipelineError;
use crate::intent::{IntentClassifier, IntentRules};
use crate::llm::LlmService;
use crate::planning_rules::{seed_rules, PlanningRule};
use crate::quality_gate::{GateAction, QualityGate};
use crate::scheduler::{unresolved_required, DispatchContext, Selection, SkillScheduler};
use crate::slots::SlotFiller;
use crate::task_planner::{TaskGraph, TaskPlanner};
use crate::types::{ConversationState, IntentKind, Slot, Task, TaskId, TaskStatus};

pub use report::{TaskSummary, TurnOutcome, TurnReport, TurnRequest};

type Slots = BTreeMap<String, Slot>;

/// What a finished step hands back to the scheduling loop.
enum StepResult {
    Prepared {
        task_id: TaskId,
        prepared: Prepared,
    },
    Dispatched {
        task_id: TaskId,
        selection: Selection,
        slots: Slots,
        result: Result<ToolExecutionRecord, PipelineError>,
    },
}

enum Prepared {
    Ready { selection: Selection, slots: Slots },
    Unresolved { slots: Slots, missing: Vec<String> },
    NoTool,
}

pub struct PipelineBuilder {
    catalog: Arc<dyn ToolCatalog>,
    handlers: HandlerRegistry,
    llm: Option<Arc<dyn LlmService>>,
    store: Arc<dyn TelemetryStore>,
    config: PipelineConfig,
    intent_rules: IntentRules,
    planning_rules: Vec<PlanningRule>,
    workspace: Option<PathBuf>,
    usage: Option<Arc<UsageCounters>>,
}

impl PipelineBuilder {
    #[must_use]
    pub fn llm(mut self, llm: Arc<dyn LlmService>) -> Self {
        self.llm = Some(llm);
        self
    }

    #[must_use]
    pub fn store(mut self, store: Arc<dyn TelemetryStore>) -> Self {
        self.store = store;
        self
    }

    #[must_use]
    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn intent_rules(mut self, rules: IntentRules) -> Self {
        self.intent_rules = rules;
        self
    }

    #[must_use]
    pub fn planning_rules(mut self, rules: Vec<PlanningRule>) -> Self {
        self.planning_rules = rules;
        self
    }

    #[must_use]
    pub fn workspace(mut self, workspace: PathBuf) -> Self {
        self.workspace = Some(workspace);
        self
    }

    /// Share usage counters with other pipelines (one per conversation).
    #[must_use]
    pub fn usage(mut self, usage: Arc<UsageCounters>) -> Self {
        self.usage = Some(usage);
        self
    }

    pub fn build(self) -> Pipeline {
        let cfg = self.config;
        let llm_timeout = Duration::from_secs(cfg.llm_timeout_secs.max(1));

        let mut sandbox = Sandbox::new(Arc::clone(&self.catalog), self.handlers, Arc::clone(&self.store))
            .with_policy(RiskPolicy::parse(&cfg.confirm_risk))
            .with_timeout(Duration::from_secs(cfg.tool_timeout_secs.max(1)));
        if let Some(ws) = self.workspace {
            sandbox = sandbox.with_workspace(ws);
        }
        if let Some(usage) = self.usage {
            sandbox = sandbox.with_usage(usage);
        }

        let mut classifier = IntentClassifier::new(self.intent_rules);
        let mut filler = SlotFiller::new(Arc::clone(&self.store));
        let mut planner = TaskPlanner::new(Arc::clone(&self.catalog))
            .with_rules(self.planning_rules)
            .with_max_tasks(cfg.max_plan_tasks)
            .with_llm_planning(cfg.llm_planning);
        if let Some(llm) = self.llm {
            classifier = classifier.with_llm(Arc::clone(&llm), llm_timeout);
            filler = filler.with_llm(Arc::clone(&llm), llm_timeout);
            planner = planner.with_llm(llm, llm_timeout);
        }

        Pipeline {
            gate: QualityGate::new(Arc::clone(&self.catalog)).with_max_retries(cfg.max_retries),
            scheduler: SkillScheduler::new(Arc::new(sandbox)),
            monitor: PerformanceMonitor::new(self.store),
            catalog: self.catalog,
            classifier,
            filler,
            planner,
            max_parallel: cfg.max_parallel.max(1),
        }
    }
}

pub struct Pipeline {
    catalog: Arc<dyn ToolCatalog>,
    classifier: IntentClassifier,
    filler: SlotFiller,
    planner: TaskPlanner,
    scheduler: SkillScheduler,
    gate: QualityGate,
    monitor: PerformanceMonitor,
    max_parallel: usize,
}

impl Pipeline {
    pub fn builder(catalog: Arc<dyn ToolCatalog>, handlers: HandlerRegistry) -> PipelineBuilder {
        PipelineBuilder {
            catalog,
            handlers,
            llm: None,
            store: Arc::new(NullStore),
            config: PipelineConfig::default(),
            intent_rules: IntentRules::builtin(),
            planning_rules: seed_rules(),
            workspace: None,
            usage: None,
        }
    }

    pub fn catalog(&self) -> &Arc<dyn ToolCatalog> {
        &self.catalog
    }

    pub fn classifier(&self) -> &IntentClassifier {
        &self.classifier
    }

    pub fn planner(&self) -> &TaskPlanner {
        &self.planner
    }

    pub fn filler(&self) -> &SlotFiller {
        &self.filler
    }

    pub fn scheduler(&self) -> &SkillScheduler {
        &self.scheduler
    }

    pub fn gate(&self) -> &QualityGate {
        &self.gate
    }

    pub fn monitor(&self) -> &PerformanceMonitor {
        &self.monitor
    }

    pub fn usage(&self) -> &Arc<UsageCounters> {
        self.scheduler.sandbox().usage()
    }

    /// Run one turn end to end. Never fails: problems are reported in the
    /// [`TurnReport`].
    pub async fn run_turn(&self, req: TurnRequest) -> TurnReport {
        let started = Instant::now();
        let state = &req.conversation;

        let timer = self.monitor.start(Stage::Classify);
        let intent = self
            .classifier
            .classify(&state.utterance, state, &req.cancel)
            .await;
        timer
            .with("kind", intent.kind.as_str())
            .with("method", serde_json::to_value(intent.method).unwrap_or(Value::Null))
            .finish();

        let mut report = TurnReport::new(&state.conversation_id, intent.clone());
        match intent.kind {
            _ if req.cancel.is_cancelled() => report.outcome = TurnOutcome::Cancelled,
            IntentKind::CancelTask => report.outcome = TurnOutcome::Cancelled,
            IntentKind::Clarification => report.outcome = TurnOutcome::NeedsClarification,
            _ => self.plan_and_execute(&req, &mut report).await,
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        tracing::info!(
            conversation = %report.conversation_id,
            intent = %report.intent.kind,
            outcome = %report.outcome,
            tasks = report.tasks.len(),
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            "Turn finished in {}ms",
            report.duration_ms
        );
        report
    }

    async fn plan_and_execute(&self, req: &TurnRequest, report: &mut TurnReport) {
        let state = &req.conversation;
        let mut timer = self.monitor.start(Stage::Plan);
        let planned = match self.planner.goal_for(&report.intent, &state.utterance, state) {
            Ok(goal) => {
                report.goal = Some(goal);
                self.planner
                    .plan(&report.intent, &state.utterance, state, &req.cancel)
                    .await
            }
            Err(e) => Err(e),
        };
        let mut graph = match planned {
            Ok(graph) => {
                timer.set("tasks", graph.len());
                timer.finish();
                graph
            }
            Err(e) => {
                timer.set("error", e.to_string());
                timer.finish();
                tracing::warn!("Planning failed: {}", e);
                report.outcome = if req.cancel.is_cancelled() {
                    TurnOutcome::Cancelled
                } else {
                    TurnOutcome::PlanFailed
                };
                report.error = Some(e.to_string());
                return;
            }
        };

        let cancelled = self.execute(&mut graph, req, report).await;

        report.tasks = graph.tasks().map(TaskSummary::from).collect();
        report.failed = graph
            .tasks()
            .filter(|t| t.status == TaskStatus::Failed && t.replaced_by.is_none())
            .map(|t| t.id.clone())
            .collect();
        report.skipped = graph
            .tasks()
            .filter(|t| t.status == TaskStatus::Skipped)
            .map(|t| t.id.clone())
            .collect();
        let all_succeeded = graph
            .tasks()
            .filter(|t| t.replaced_by.is_none())
            .all(|t| t.status == TaskStatus::Succeeded);

        report.outcome = if cancelled {
            TurnOutcome::Cancelled
        } else if all_succeeded {
            TurnOutcome::Completed
        } else if !report.pending_slots.is_empty() && report.failed.is_empty() {
            TurnOutcome::NeedsInput
        } else {
            TurnOutcome::Partial
        };
    }

    /// Drive the graph until nothing is ready or in flight. Returns whether
    /// the turn was cancelled.
    pub async fn execute(&self, graph: &mut TaskGraph, req: &TurnRequest, report: &mut TurnReport) -> bool {
        let mut in_flight: HashSet<TaskId> = HashSet::new();
        let mut steps: FuturesUnordered<BoxFuture<'_, StepResult>> = FuturesUnordered::new();
        let mut cancelled = false;

        loop {
            if !cancelled && req.cancel.is_cancelled() {
                tracing::info!("Turn cancelled; draining {} in-flight step(s)", steps.len());
                cancelled = true;
            }
            if !cancelled {
                graph.promote_ready();
                for id in graph.ready_tasks() {
                    if steps.len() >= self.max_parallel {
                        break;
                    }
                    if in_flight.contains(&id) {
                        continue;
                    }
                    let Some(task) = graph.get(&id).cloned() else {
                        continue;
                    };
                    let state = task_state(graph, &task, &req.conversation);
                    in_flight.insert(id);
                    steps.push(self.prepare(task, state, &req.cancel).boxed());
                }
            }

            let Some(step) = steps.next().await else {
                break;
            };
            match step {
                StepResult::Prepared { task_id, prepared } => {
                    let cancelled_now = cancelled || req.cancel.is_cancelled();
                    match self.on_prepared(graph, report, req, &task_id, prepared, cancelled_now) {
                        Some(next) => steps.push(next),
                        None => {
                            in_flight.remove(&task_id);
                        }
                    }
                }
                StepResult::Dispatched {
                    task_id,
                    selection,
                    slots,
                    result,
                } => {
                    let cancelled_now = cancelled || req.cancel.is_cancelled();
                    match self.on_dispatched(graph, report, req, &task_id, selection, slots, result, cancelled_now) {
                        Some(next) => steps.push(next),
                        None => {
                            in_flight.remove(&task_id);
                        }
                    }
                }
            }
        }

        if cancelled || req.cancel.is_cancelled() {
            graph.skip_remaining("turn cancelled");
            return true;
        }
        let stranded = graph.skip_remaining("no runnable path");
        if !stranded.is_empty() {
            tracing::warn!("Tasks left without a runnable path: {}", stranded.join(", "));
        }
        false
    }

    #[allow(clippy::too_many_arguments)]
    fn on_prepared<'a>(
        &'a self,
        graph: &mut TaskGraph,
        report: &mut TurnReport,
        req: &'a TurnRequest,
        task_id: &str,
        prepared: Prepared,
        cancelled: bool,
    ) -> Option<BoxFuture<'a, StepResult>> {
        let task = graph.get_mut(task_id)?;
        if cancelled {
            let _ = task.transition(TaskStatus::Skipped);
            return None;
        }
        match prepared {
            Prepared::Ready { selection, slots } => {
                task.slots = slots.clone();
                task.tool_candidate = Some(selection.tool_id.clone());
                if let Err(e) = task.transition(TaskStatus::Running) {
                    tracing::warn!("{}", e);
                    return None;
                }
                let snapshot = task.clone();
                Some(self.dispatch_step(snapshot, selection, slots, req).boxed())
            }
            Prepared::Unresolved { slots, missing } => {
                tracing::info!(task = %task_id, "Waiting for slots: {}", missing.join(", "));
                task.slots = slots;
                task.error = Some(format!("missing required slots: {}", missing.join(", ")));
                let _ = task.transition(TaskStatus::Skipped);
                report.pending_slots.insert(task_id.to_string(), missing);
                graph.propagate_failure(task_id);
                None
            }
            Prepared::NoTool => {
                task.error = Some(PipelineError::NoTool(task_id.to_string()).to_string());
                let _ = task.transition(TaskStatus::Skipped);
                graph.propagate_failure(task_id);
                None
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn on_dispatched<'a>(
        &'a self,
        graph: &mut TaskGraph,
        report: &mut TurnReport,
        req: &'a TurnRequest,
        task_id: &str,
        selection: Selection,
        slots: Slots,
        result: Result<ToolExecutionRecord, PipelineError>,
        cancelled: bool,
    ) -> Option<BoxFuture<'a, StepResult>> {
        let record = match result {
            Ok(record) => record,
            Err(PipelineError::Dispatch(DispatchError::Cancelled { .. })) => {
                let task = graph.get_mut(task_id)?;
                task.error = Some("cancelled".to_string());
                let _ = task.transition(TaskStatus::Skipped);
                return None;
            }
            Err(e) => {
                tracing::warn!(task = %task_id, "Dispatch rejected: {}", e);
                let task = graph.get_mut(task_id)?;
                task.error = Some(e.to_string());
                let _ = task.transition(TaskStatus::Failed);
                graph.propagate_failure(task_id);
                return None;
            }
        };
        report.records.push(record.clone());

        let verdict = {
            let task = graph.get(task_id)?;
            let timer = self
                .monitor
                .start(Stage::Validate)
                .with("task", task_id)
                .with("tool", record.tool_id.as_str());
            let verdict = self.gate.validate(task, &record);
            timer.with("action", verdict.action.to_string()).finish();
            verdict
        };

        let task = graph.get_mut(task_id)?;
        match verdict.action {
            GateAction::Accept => {
                task.result = record.result;
                task.error = None;
                let _ = task.transition(TaskStatus::Succeeded);
                None
            }
            GateAction::Retry => {
                task.retry_count += 1;
                task.error = verdict.reason;
                let _ = task.transition(TaskStatus::Retrying);
                if cancelled {
                    let _ = task.transition(TaskStatus::Skipped);
                    return None;
                }
                tracing::info!(task = %task_id, attempt = task.retry_count + 1, "Retrying task");
                if let Err(e) = task.transition(TaskStatus::Running) {
                    tracing::warn!("{}", e);
                    return None;
                }
                let snapshot = task.clone();
                Some(self.dispatch_step(snapshot, selection, slots, req).boxed())
            }
            GateAction::Abort => {
                tracing::warn!(task = %task_id, "Task failed: {}", verdict.reason.as_deref().unwrap_or(""));
                task.error = verdict.reason;
                let _ = task.transition(TaskStatus::Failed);
                graph.propagate_failure(task_id);
                None
            }
            GateAction::Replan => {
                task.error = verdict.reason;
                let _ = task.transition(TaskStatus::Failed);
                match self.planner.replan(graph, task_id) {
                    Ok(Some(replacement)) => {
                        tracing::info!(task = %task_id, replacement = %replacement, "Task replaced after result mismatch");
                    }
                    Ok(None) => {
                        graph.propagate_failure(task_id);
                    }
                    Err(e) => {
                        tracing::warn!(task = %task_id, "Re-planning failed: {}", e);
                        graph.propagate_failure(task_id);
                    }
                }
                None
            }
        }
    }

    /// Pick a tool and fill its slots. The task stays `ready` meanwhile.
    async fn prepare(&self, task: Task, state: ConversationState, cancel: &CancellationToken) -> StepResult {
        let mut timer = self.monitor.start(Stage::FillSlots).with("task", task.id.as_str());
        let candidates = self.scheduler.candidates(&task);
        let previews: BTreeMap<ToolId, Slots> = candidates
            .tools
            .iter()
            .filter_map(|id| {
                self.catalog
                    .get_tool(id)
                    .map(|tool| (id.clone(), self.filler.preview(&task, tool, &state)))
            })
            .collect();
        let selected = self
            .scheduler
            .select(&task, &candidates, &previews)
            .and_then(|s| self.catalog.get_tool(&s.tool_id).map(|tool| (s, tool)));
        let Some((selection, tool)) = selected else {
            timer.set("outcome", "no_tool");
            return StepResult::Prepared {
                task_id: task.id,
                prepared: Prepared::NoTool,
            };
        };

        let slots = self.filler.fill(&task, tool, &state, cancel).await;
        let missing = unresolved_required(tool, &slots);
        timer.set("tool", selection.tool_id.as_str());
        timer.set("unresolved", missing.len());
        timer.finish();

        let prepared = if missing.is_empty() {
            Prepared::Ready { selection, slots }
        } else {
            Prepared::Unresolved { slots, missing }
        };
        StepResult::Prepared {
            task_id: task.id,
            prepared,
        }
    }

    async fn dispatch_step(&self, task: Task, selection: Selection, slots: Slots, req: &TurnRequest) -> StepResult {
        let attempt = task.retry_count + 1;
        let timer = self
            .monitor
            .start(Stage::Execute)
            .with("task", task.id.as_str())
            .with("tool", selection.tool_id.as_str())
            .with("attempt", attempt);
        let ctx = DispatchContext {
            permissions: &req.permissions,
            confirmed: req.confirmed,
            cancel: &req.cancel,
        };
        let result = self.scheduler.dispatch(&task, &selection, &slots, attempt, ctx).await;
        timer
            .with("success", matches!(&result, Ok(r) if r.success))
            .finish();
        StepResult::Dispatched {
            task_id: task.id,
            selection,
            slots,
            result,
        }
    }
}

/// Conversation state for one task: upstream outputs become entities, so a
/// parameter named like an upstream output field (or declaring it as its
/// entity) resolves from it.
fn task_state(graph: &TaskGraph, task: &Task, base: &ConversationState) -> ConversationState {
    let mut state = base.clone();
    for dep in &task.depends_on {
        let Some(upstream) = graph.get(dep) else {
            continue;
        };
        match upstream.result.as_ref() {
            Some(Value::Object(fields)) => {
                for (k, v) in fields {
                    state.entities.insert(k.clone(), v.clone());
                }
            }
            Some(other) => {
                state.entities.insert(dep.clone(), other.clone());
            }
            None => {}
        }
    }
    state
}
