//! Skill Scheduler: narrow candidate tools through skills, pick the one whose
//! schema best fits the task's slots, and dispatch it through the sandbox.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use skillpipe_core::catalog::{Permission, SkillId, ToolCatalog, ToolDefinition, ToolId};
use skillpipe_core::records::ToolExecutionRecord;
use skillpipe_sandbox::{DispatchRequest, Sandbox};

use crate::error::PipelineError;
use crate::types::{slots_to_params, Slot, Task};

/// Candidate tools for a task and the skill they were narrowed through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidates {
    pub tools: Vec<ToolId>,
    pub skill: Option<SkillId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub tool_id: ToolId,
    pub skill_id: Option<SkillId>,
    pub score: i32,
}

/// Caller-side inputs to one dispatch.
#[derive(Debug, Clone, Copy)]
pub struct DispatchContext<'a> {
    pub permissions: &'a BTreeSet<Permission>,
    pub confirmed: bool,
    pub cancel: &'a CancellationToken,
}

pub struct SkillScheduler {
    catalog: Arc<dyn ToolCatalog>,
    sandbox: Arc<Sandbox>,
}

impl SkillScheduler {
    pub fn new(sandbox: Arc<Sandbox>) -> Self {
        Self {
            catalog: Arc::clone(sandbox.catalog()),
            sandbox,
        }
    }

    pub fn sandbox(&self) -> &Arc<Sandbox> {
        &self.sandbox
    }

    /// Narrowing order: the task's skill, the planner's tool alone, skills
    /// matching the description, every tool. The planner's candidate is
    /// always included.
    pub fn candidates(&self, task: &Task) -> Candidates {
        let (mut tools, skill) = if let Some(skill) = task.skill.as_ref() {
            (self.catalog.list_by_skill(skill), Some(skill.clone()))
        } else if task.tool_candidate.is_some() {
            (Vec::new(), None)
        } else {
            let matching: Vec<_> = self
                .catalog
                .skills()
                .into_iter()
                .filter(|s| s.matches(&task.description))
                .collect();
            if matching.is_empty() {
                (self.catalog.tools().iter().map(|t| t.id.clone()).collect(), None)
            } else {
                let tools: BTreeSet<ToolId> = matching.iter().flat_map(|s| s.tools.iter().cloned()).collect();
                let skill = (matching.len() == 1).then(|| matching[0].id.clone());
                (tools.into_iter().collect(), skill)
            }
        };
        if let Some(tool) = task.tool_candidate.as_ref() {
            if !tools.contains(tool) && self.catalog.get_tool(tool).is_some() {
                tools.insert(0, tool.clone());
            }
        }
        Candidates { tools, skill }
    }

    /// Schema fit of `tool` for the given slots: +2 per resolved required
    /// parameter, +1 per resolved optional one, -3 per unresolved required
    /// one, +1 for the planner's own pick.
    pub fn score(&self, tool: &ToolDefinition, task: &Task, slots: &BTreeMap<String, Slot>) -> i32 {
        let mut score = 0;
        for p in &tool.schema.parameters {
            let resolved = slots.get(&p.name).is_some_and(Slot::is_resolved);
            score += match (p.required, resolved) {
                (true, true) => 2,
                (false, true) => 1,
                (true, false) => -3,
                (false, false) => 0,
            };
        }
        if task.tool_candidate.as_deref() == Some(tool.id.as_str()) {
            score += 1;
        }
        score
    }

    /// Best-scoring candidate. Ties keep candidate order, so the planner's
    /// pick wins a tie.
    pub fn select(
        &self,
        task: &Task,
        candidates: &Candidates,
        previews: &BTreeMap<ToolId, BTreeMap<String, Slot>>,
    ) -> Option<Selection> {
        let mut best: Option<Selection> = None;
        for tool_id in &candidates.tools {
            let (Some(tool), Some(slots)) = (self.catalog.get_tool(tool_id), previews.get(tool_id)) else {
                continue;
            };
            let score = self.score(tool, task, slots);
            if best.as_ref().map_or(true, |b| score > b.score) {
                best = Some(Selection {
                    tool_id: tool_id.clone(),
                    skill_id: candidates
                        .skill
                        .clone()
                        .filter(|s| self.catalog.list_by_skill(s).contains(tool_id)),
                    score,
                });
            }
        }
        best
    }

    /// Dispatch `tool_id` with the task's slots. A task with an unresolved
    /// required slot is refused here, before the sandbox is reached.
    pub async fn dispatch(
        &self,
        task: &Task,
        selection: &Selection,
        slots: &BTreeMap<String, Slot>,
        attempt: u32,
        ctx: DispatchContext<'_>,
    ) -> Result<ToolExecutionRecord, PipelineError> {
        let tool = self
            .catalog
            .get_tool(&selection.tool_id)
            .ok_or_else(|| PipelineError::NoTool(task.id.clone()))?;
        let unresolved = unresolved_required(tool, slots);
        if !unresolved.is_empty() {
            return Err(PipelineError::SlotUnresolved {
                task: task.id.clone(),
                slots: unresolved,
            });
        }

        let mut request = DispatchRequest::new(&task.id, &tool.id, slots_to_params(slots));
        request.caller_permissions = ctx.permissions.clone();
        request.confirmed = ctx.confirmed;
        request.skill_id = selection.skill_id.clone();
        request.attempt = attempt;
        request.cancel = ctx.cancel.clone();
        Ok(self.sandbox.dispatch(request).await?)
    }
}

/// Names of required parameters without a resolved slot.
pub fn unresolved_required(tool: &ToolDefinition, slots: &BTreeMap<String, Slot>) -> Vec<String> {
    tool.required_parameters()
        .filter(|p| !slots.get(&p.name).is_some_and(Slot::is_resolved))
        .map(|p| p.name.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use skillpipe_core::records::SlotSource;
    use skillpipe_sandbox::{from_fn, DispatchError, HandlerRegistry};
    use skillpipe_telemetry::{MemoryStore, TelemetryStore};

    use crate::test_support::sample_catalog;

    fn scheduler(store: Arc<MemoryStore>) -> SkillScheduler {
        let catalog = sample_catalog();
        let handlers = HandlerRegistry::builder()
            .register(
                "weather",
                from_fn(|params: serde_json::Value, _ctx| async move {
                    Ok(json!({"temp": 21, "city": params["city"]}))
                }),
            )
            .register(
                "send_email",
                from_fn(|_params: serde_json::Value, _ctx| async move { Ok(json!({"sent": true})) }),
            )
            .build();
        SkillScheduler::new(Arc::new(Sandbox::new(catalog, handlers, store)))
    }

    fn slot(name: &str, value: serde_json::Value) -> (String, Slot) {
        (name.to_string(), Slot::resolved(name, value, SlotSource::User, 1.0))
    }

    #[test]
    fn test_candidates_narrow_through_skill() {
        let s = scheduler(Arc::new(MemoryStore::default()));
        let mut task = Task::new("t1", "weather city=Paris").with_tool("weather");
        task.skill = Some("forecast".into());
        let c = s.candidates(&task);
        assert_eq!(c.tools, vec!["weather", "weather_backup"]);
        assert_eq!(c.skill.as_deref(), Some("forecast"));

        let task = Task::new("t2", "send the 预报").with_tool("send_email");
        assert_eq!(s.candidates(&task).tools, vec!["send_email"]);

        let c = s.candidates(&Task::new("t2", "next week's 预报"));
        assert_eq!(c.tools, vec!["weather", "weather_backup"]);
        assert_eq!(c.skill.as_deref(), Some("forecast"));

        let task = Task::new("t3", "anything").with_tool("summarize");
        assert_eq!(s.candidates(&task).tools, vec!["summarize"]);
        assert_eq!(s.candidates(&Task::new("t4", "anything")).tools.len(), 5);
    }

    #[test]
    fn test_select_prefers_schema_fit_then_planner_pick() {
        let s = scheduler(Arc::new(MemoryStore::default()));
        let task = Task::new("t1", "weather").with_tool("weather_backup");
        let candidates = Candidates {
            tools: vec!["weather".into(), "weather_backup".into()],
            skill: Some("forecast".into()),
        };
        let slots: BTreeMap<_, _> = [slot("city", json!("Paris"))].into();
        let mut previews = BTreeMap::new();
        previews.insert("weather".to_string(), slots.clone());
        previews.insert("weather_backup".to_string(), slots);
        // weather: city(2) + units unresolved optional(0) = 2; backup: city(2) + pick(1) = 3
        let sel = s.select(&task, &candidates, &previews).unwrap();
        assert_eq!(sel.tool_id, "weather_backup");
        assert_eq!(sel.skill_id.as_deref(), Some("forecast"));
        assert_eq!(sel.score, 3);

        let mut previews2 = previews.clone();
        previews2.insert(
            "weather".to_string(),
            [slot("city", json!("Paris")), slot("units", json!("metric"))].into(),
        );
        let tie = s.select(&task, &candidates, &previews2).unwrap();
        assert_eq!(tie.tool_id, "weather", "equal score keeps candidate order");
    }

    #[tokio::test]
    async fn test_dispatch_refuses_unresolved_required_slot() {
        let store = Arc::new(MemoryStore::default());
        let s = scheduler(store.clone());
        let task = Task::new("t1", "weather").with_tool("weather");
        let selection = Selection {
            tool_id: "weather".into(),
            skill_id: None,
            score: 0,
        };
        let slots: BTreeMap<_, _> = [("city".to_string(), Slot::unresolved("city"))].into();
        let perms = BTreeSet::new();
        let cancel = CancellationToken::new();
        let ctx = DispatchContext {
            permissions: &perms,
            confirmed: false,
            cancel: &cancel,
        };
        let err = s.dispatch(&task, &selection, &slots, 1, ctx).await.unwrap_err();
        assert!(matches!(err, PipelineError::SlotUnresolved { ref slots, .. } if slots == &vec!["city".to_string()]));
        assert!(store.is_empty());

        let slots: BTreeMap<_, _> = [slot("city", json!("Paris"))].into();
        let record = s.dispatch(&task, &selection, &slots, 1, ctx).await.unwrap();
        assert!(record.success);
        assert_eq!(record.result.unwrap()["temp"], 21);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_dispatch_surfaces_permission_denied() {
        let store = Arc::new(MemoryStore::default());
        let s = scheduler(store.clone());
        let task = Task::new("t1", "email").with_tool("send_email");
        let selection = Selection {
            tool_id: "send_email".into(),
            skill_id: Some("comms".into()),
            score: 4,
        };
        let slots: BTreeMap<_, _> = [slot("to", json!("a@x.com")), slot("body", json!("hi"))].into();
        let perms = BTreeSet::new();
        let cancel = CancellationToken::new();
        let ctx = DispatchContext {
            permissions: &perms,
            confirmed: true,
            cancel: &cancel,
        };
        let err = s.dispatch(&task, &selection, &slots, 1, ctx).await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Dispatch(DispatchError::PermissionDenied { .. })
        ));
        assert!(store.query(&Default::default()).unwrap().is_empty());
        assert_eq!(s.sandbox().usage().tool_count("send_email"), 0);
    }
}
