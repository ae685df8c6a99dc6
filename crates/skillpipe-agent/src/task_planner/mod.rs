//! Task Planner.
//!
//! Decomposition: the goal is split on sequencing words (`然后`, `then`, `;`
//! ...); one sub-goal yields one task. Each sub-goal gets a tool from the
//! planning rules, else from catalog keyword relevance, and a skill when one
//! matches. A later task depends on an earlier one when it refers back to it
//! ("它", "the result") or when its inputs name the earlier tool's declared
//! output fields. With an LLM configured, a JSON task array is asked for
//! first and anything invalid falls back to the deterministic split.

mod graph;

#[cfg(test)]
mod tests;

use std::collections::BTreeSet;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use skillpipe_core::catalog::{SkillId, ToolCatalog, ToolDefinition, ToolId};

use crate::error::PipelineError;
use crate::intent::contains_keyword;
use crate::llm::{
    complete_with_timeout, extract_json_array, strip_code_fences, ChatMessage, CompletionRequest,
    LlmService,
};
use crate::planning_rules::{best_hint, seed_rules, PlanningRule};
use crate::slots::parse_assignments;
use crate::types::{safe_truncate, ConversationState, Intent, IntentKind, Task, TaskId};

pub use graph::TaskGraph;

pub const DEFAULT_MAX_TASKS: usize = 8;

static SUBGOAL_SPLIT: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?i)[;；\n]|然后|接着|之后|随后|最后|并且|\band then\b|\bafter that\b|\bthen\b|\bfinally\b").ok()
});

static ASSIGNMENT_KEY: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"([A-Za-z_][A-Za-z0-9_]*)\s*[=:：]").ok());

/// Words that make a sub-goal refer to the previous step's result.
const BACK_REFERENCES: &[&str] = &[
    "它", "其", "结果", "上一步", "这个", "那个", "前面的", "it", "its", "the result", "that", "them",
    "the output",
];

const PLAN_PROMPT: &str = r#"Split the user's request into the smallest ordered list of tool tasks.

Available tools:
{{tools}}

Reply with a JSON array only. Each element:
{"id": "<short id>", "description": "<what this step does>", "tool": "<tool id>", "depends_on": ["<ids of earlier steps whose output it needs>"]}

A request that needs a single tool is a single element."#;

#[derive(Debug, Deserialize)]
struct LlmTask {
    #[serde(default)]
    id: Option<serde_json::Value>,
    description: String,
    #[serde(default)]
    tool: Option<String>,
    #[serde(default, alias = "dependsOn")]
    depends_on: Vec<serde_json::Value>,
}

pub struct TaskPlanner {
    catalog: Arc<dyn ToolCatalog>,
    rules: Vec<PlanningRule>,
    llm: Option<Arc<dyn LlmService>>,
    llm_timeout: Duration,
    llm_planning: bool,
    max_tasks: usize,
}

impl TaskPlanner {
    pub fn new(catalog: Arc<dyn ToolCatalog>) -> Self {
        Self {
            catalog,
            rules: seed_rules(),
            llm: None,
            llm_timeout: Duration::from_secs(15),
            llm_planning: true,
            max_tasks: DEFAULT_MAX_TASKS,
        }
    }

    #[must_use]
    pub fn with_rules(mut self, rules: Vec<PlanningRule>) -> Self {
        self.rules = rules;
        self
    }

    #[must_use]
    pub fn with_llm(mut self, llm: Arc<dyn LlmService>, timeout: Duration) -> Self {
        self.llm = Some(llm);
        self.llm_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_llm_planning(mut self, enabled: bool) -> Self {
        self.llm_planning = enabled;
        self
    }

    #[must_use]
    pub fn with_max_tasks(mut self, max: usize) -> Self {
        self.max_tasks = max.max(1);
        self
    }

    pub fn rules(&self) -> &[PlanningRule] {
        &self.rules
    }

    /// Goal text the intent asks to plan for.
    pub fn goal_for(
        &self,
        intent: &Intent,
        utterance: &str,
        state: &ConversationState,
    ) -> Result<String, PipelineError> {
        let goal = match intent.kind {
            IntentKind::NewTask => utterance.to_string(),
            IntentKind::ContinueExecution => state.active_goal.clone().ok_or_else(|| {
                PipelineError::PlanInfeasible("nothing to continue: no active goal".to_string())
            })?,
            IntentKind::ModifyRequirement => match state.active_goal.as_deref() {
                Some(goal) => apply_overrides(goal, utterance),
                None => utterance.to_string(),
            },
            IntentKind::Clarification | IntentKind::CancelTask => {
                return Err(PipelineError::PlanInfeasible(format!(
                    "{} does not produce a plan",
                    intent.kind
                )))
            }
        };
        if goal.trim().is_empty() {
            return Err(PipelineError::PlanInfeasible("empty request".to_string()));
        }
        Ok(goal)
    }

    pub async fn plan(
        &self,
        intent: &Intent,
        utterance: &str,
        state: &ConversationState,
        cancel: &CancellationToken,
    ) -> Result<TaskGraph, PipelineError> {
        let goal = self.goal_for(intent, utterance, state)?;
        if self.llm_planning {
            if let Some(llm) = self.llm.as_ref() {
                match self.plan_with_llm(llm.as_ref(), &goal, cancel).await {
                    Ok(graph) => return Ok(graph),
                    Err(reason) => {
                        tracing::warn!("LLM decomposition unusable ({}), using deterministic split", reason)
                    }
                }
            }
        }
        self.plan_deterministic(&goal)
    }

    /// Rule/keyword decomposition. Pure.
    pub fn plan_deterministic(&self, goal: &str) -> Result<TaskGraph, PipelineError> {
        let subgoals = split_subgoals(goal);
        if subgoals.is_empty() {
            return Err(PipelineError::PlanInfeasible("empty request".to_string()));
        }
        if subgoals.len() > self.max_tasks {
            return Err(PipelineError::PlanInfeasible(format!(
                "{} steps exceed the plan limit of {}",
                subgoals.len(),
                self.max_tasks
            )));
        }

        let mut tasks: Vec<Task> = Vec::with_capacity(subgoals.len());
        for (i, sub) in subgoals.iter().enumerate() {
            let (tool, skill) = self.choose(sub).ok_or_else(|| {
                PipelineError::PlanInfeasible(format!("no tool or skill matches '{}'", sub))
            })?;
            let mut task = Task::new(format!("t{}", i + 1), sub.clone());
            task.tool_candidate = tool;
            task.skill = skill;
            task.depends_on = self.infer_dependencies(&task, &tasks);
            tasks.push(task);
        }
        let graph = TaskGraph::from_tasks(tasks)?;
        tracing::debug!("Planned {} task(s) for '{}'", graph.len(), safe_truncate(goal, 80));
        Ok(graph)
    }

    /// Tool and skill for a sub-goal; `None` when neither can be found.
    fn choose(&self, text: &str) -> Option<(Option<ToolId>, Option<SkillId>)> {
        let tool = best_hint(&self.rules, text, self.catalog.as_ref())
            .and_then(|r| r.tool_hint.clone())
            .or_else(|| self.most_relevant(text, &BTreeSet::new()));
        let skill = match tool.as_deref() {
            Some(t) => {
                let owning = self.catalog.skills_for_tool(t);
                owning
                    .iter()
                    .find(|s| s.matches(text))
                    .or_else(|| owning.first())
                    .map(|s| s.id.clone())
            }
            None => self
                .catalog
                .skills()
                .into_iter()
                .find(|s| s.matches(text))
                .map(|s| s.id.clone()),
        };
        (tool.is_some() || skill.is_some()).then_some((tool, skill))
    }

    /// Highest keyword relevance above zero, ties broken by id.
    fn most_relevant(&self, text: &str, exclude: &BTreeSet<ToolId>) -> Option<ToolId> {
        let mut best: Option<(u32, &ToolDefinition)> = None;
        for tool in self.catalog.tools() {
            if exclude.contains(&tool.id) {
                continue;
            }
            let score = tool.relevance(text);
            let better = match best {
                None => score > 0,
                Some((s, b)) => score > s || (score == s && tool.id < b.id),
            };
            if better {
                best = Some((score, tool));
            }
        }
        best.map(|(_, t)| t.id.clone())
    }

    fn infer_dependencies(&self, task: &Task, earlier: &[Task]) -> BTreeSet<TaskId> {
        let mut deps = BTreeSet::new();
        let Some(prev) = earlier.last() else {
            return deps;
        };
        let lower = task.description.to_lowercase();
        if BACK_REFERENCES.iter().any(|w| contains_keyword(&lower, w)) {
            deps.insert(prev.id.clone());
        }

        let assigned = assigned_names(&task.description);
        let inputs: Vec<&str> = task
            .tool_candidate
            .as_deref()
            .and_then(|t| self.catalog.get_tool(t))
            .map(|t| {
                t.schema
                    .parameters
                    .iter()
                    .filter(|p| !assigned.contains(&p.name))
                    .flat_map(|p| std::iter::once(p.name.as_str()).chain(p.entity.as_deref()))
                    .collect()
            })
            .unwrap_or_default();

        for e in earlier {
            let Some(outputs) = e
                .tool_candidate
                .as_deref()
                .and_then(|t| self.catalog.get_tool(t))
                .map(|t| &t.schema.returns.fields)
            else {
                continue;
            };
            let linked = outputs.iter().any(|field| {
                inputs.contains(&field.as_str())
                    || (field.len() >= 3
                        && !assigned.contains(field)
                        && contains_keyword(&lower, &field.to_lowercase()))
            });
            if linked {
                deps.insert(e.id.clone());
            }
        }
        deps
    }

    async fn plan_with_llm(
        &self,
        llm: &dyn LlmService,
        goal: &str,
        cancel: &CancellationToken,
    ) -> Result<TaskGraph, String> {
        let tools = self
            .catalog
            .tools()
            .iter()
            .map(|t| format!("- {}: {}", t.id, t.description))
            .collect::<Vec<_>>()
            .join("\n");
        let request = CompletionRequest::new(vec![
            ChatMessage::system(&PLAN_PROMPT.replace("{{tools}}", &tools)),
            ChatMessage::user(goal),
        ])
        .max_tokens(1024);
        let raw = complete_with_timeout(llm, &request, self.llm_timeout, cancel)
            .await
            .map_err(|e| format!("{:#}", e))?;
        let json = extract_json_array(strip_code_fences(&raw)).ok_or("no JSON array in answer")?;
        let items: Vec<LlmTask> = serde_json::from_str(json).map_err(|e| e.to_string())?;
        if items.is_empty() {
            return Err("empty task list".to_string());
        }
        if items.len() > self.max_tasks {
            return Err(format!("{} tasks exceed the plan limit", items.len()));
        }

        let raw_id = |v: &serde_json::Value| match v {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        let ids: Vec<String> = items
            .iter()
            .enumerate()
            .map(|(i, item)| item.id.as_ref().map(raw_id).unwrap_or_else(|| (i + 1).to_string()))
            .collect();

        let mut tasks = Vec::with_capacity(items.len());
        for (i, item) in items.iter().enumerate() {
            let mut task = Task::new(format!("t{}", i + 1), item.description.trim());
            match item.tool.as_deref().filter(|t| !t.is_empty()) {
                Some(tool) if self.catalog.get_tool(tool).is_some() => {
                    task.tool_candidate = Some(tool.to_string());
                    task.skill = self.catalog.skills_for_tool(tool).first().map(|s| s.id.clone());
                }
                Some(tool) => return Err(format!("unknown tool '{}'", tool)),
                None => {
                    let (tool, skill) = self
                        .choose(&item.description)
                        .ok_or_else(|| format!("no tool for '{}'", item.description))?;
                    task.tool_candidate = tool;
                    task.skill = skill;
                }
            }
            for dep in &item.depends_on {
                let dep = raw_id(dep);
                let pos = ids
                    .iter()
                    .position(|id| *id == dep)
                    .ok_or_else(|| format!("unknown dependency '{}'", dep))?;
                task.depends_on.insert(format!("t{}", pos + 1));
            }
            tasks.push(task);
        }
        TaskGraph::from_tasks(tasks).map_err(|e| e.to_string())
    }

    /// Add a replacement for a failed task using the next best tool not yet
    /// tried for it. Returns the new task id, or `None` when no untried tool
    /// fits. Started and succeeded tasks are left as they are.
    pub fn replan(&self, graph: &mut TaskGraph, failed_id: &str) -> Result<Option<TaskId>, PipelineError> {
        let failed = graph
            .get(failed_id)
            .ok_or_else(|| PipelineError::UnknownTask(failed_id.to_string()))?
            .clone();
        let base = lineage_root(failed_id);
        let lineage: Vec<&Task> = graph
            .tasks()
            .filter(|t| lineage_root(&t.id) == base)
            .collect();
        let tried: BTreeSet<ToolId> = lineage.iter().filter_map(|t| t.tool_candidate.clone()).collect();

        let in_skill = failed
            .skill
            .as_deref()
            .map(|s| self.catalog.list_by_skill(s))
            .unwrap_or_default()
            .into_iter()
            .filter(|t| !tried.contains(t))
            .max_by(|a, b| {
                let score = |id: &str| self.catalog.get_tool(id).map_or(0, |t| t.relevance(&failed.description));
                score(a.as_str()).cmp(&score(b.as_str())).then(b.cmp(a))
            });
        let Some(tool) = self.most_relevant(&failed.description, &tried).or(in_skill) else {
            tracing::debug!(task = %failed_id, "No untried tool left to replan with");
            return Ok(None);
        };

        let new_id = format!("{}-r{}", base, lineage.len());
        // No skill: the replacement is pinned to its tool.
        let mut replacement = Task::new(new_id.clone(), failed.description.clone()).with_tool(tool.clone());
        replacement.depends_on = failed.depends_on.clone();
        graph.replace_task(failed_id, replacement)?;
        tracing::info!(task = %failed_id, replacement = %new_id, tool = %tool, "Re-planned failed task");
        Ok(Some(new_id))
    }
}

/// `t2-r1` → `t2`.
fn lineage_root(id: &str) -> &str {
    id.split_once("-r").map_or(id, |(root, _)| root)
}

/// Split a goal into trimmed, non-empty sub-goals.
pub fn split_subgoals(goal: &str) -> Vec<String> {
    let parts: Vec<&str> = match SUBGOAL_SPLIT.as_ref() {
        Some(re) => re.split(goal).collect(),
        None => vec![goal],
    };
    parts
        .into_iter()
        .map(|p| {
            let p = p.trim().trim_matches(|c: char| c == ',' || c == '，' || c == '、' || c.is_whitespace());
            p.strip_prefix("先").unwrap_or(p).trim().to_string()
        })
        .filter(|p| !p.is_empty())
        .collect()
}

fn assigned_names(text: &str) -> BTreeSet<String> {
    ASSIGNMENT_KEY
        .as_ref()
        .map(|re| re.captures_iter(text).map(|c| c[1].to_string()).collect())
        .unwrap_or_default()
}

/// Apply `name=value` fragments from a modification to the active goal:
/// existing assignments are rewritten, new ones appended. A modification
/// without assignments replaces the goal.
pub fn apply_overrides(goal: &str, modification: &str) -> String {
    let overrides = parse_assignments(modification);
    if overrides.is_empty() {
        return modification.trim().to_string();
    }
    let mut names: Vec<&String> = overrides.keys().collect();
    names.sort();
    let mut out = goal.to_string();
    for name in names {
        let value = &overrides[name];
        let rendered = if value.contains(char::is_whitespace) {
            format!("{}=\"{}\"", name, value)
        } else {
            format!("{}={}", name, value)
        };
        let pattern = format!(
            r#"\b{}\s*[=:：]\s*(?:"[^"]*"|'[^']*'|[^\s,，;；]+)"#,
            regex::escape(name)
        );
        match Regex::new(&pattern) {
            Ok(re) if re.is_match(&out) => {
                out = re.replacen(&out, 1, regex::NoExpand(&rendered)).into_owned();
            }
            _ => {
                out.push(' ');
                out.push_str(&rendered);
            }
        }
    }
    out
}
