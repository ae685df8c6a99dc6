//! Acyclic task graph with critical-path priorities.

use std::collections::{BTreeSet, HashMap, VecDeque};

use crate::error::PipelineError;
use crate::types::{Task, TaskId, TaskStatus};

/// Tasks in insertion order plus an id index. Always acyclic: every
/// constructor and mutator validates edges before touching the graph.
#[derive(Debug, Clone, Default)]
pub struct TaskGraph {
    tasks: Vec<Task>,
    index: HashMap<TaskId, usize>,
}

impl TaskGraph {
    /// Build and validate a graph. Rejects duplicate ids, edges to unknown
    /// tasks and cycles. Priorities are computed and root tasks promoted.
    pub fn from_tasks(tasks: Vec<Task>) -> Result<Self, PipelineError> {
        let mut index = HashMap::with_capacity(tasks.len());
        for (i, t) in tasks.iter().enumerate() {
            if index.insert(t.id.clone(), i).is_some() {
                return Err(PipelineError::DuplicateTask(t.id.clone()));
            }
        }
        for t in &tasks {
            if let Some(dep) = t.depends_on.iter().find(|d| !index.contains_key(*d)) {
                return Err(PipelineError::UnknownDependency {
                    task: t.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }
        let mut graph = Self { tasks, index };
        graph.topological_order()?;
        graph.compute_priorities();
        graph.promote_ready();
        Ok(graph)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.index.get(id).map(|&i| &self.tasks[i])
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Task> {
        self.index.get(id).map(|&i| &mut self.tasks[i])
    }

    fn task_mut(&mut self, id: &str) -> Result<&mut Task, PipelineError> {
        self.get_mut(id)
            .ok_or_else(|| PipelineError::UnknownTask(id.to_string()))
    }

    /// Tasks in insertion order.
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.iter()
    }

    pub fn ids(&self) -> Vec<TaskId> {
        self.tasks.iter().map(|t| t.id.clone()).collect()
    }

    /// Every task has reached a terminal status.
    pub fn is_complete(&self) -> bool {
        self.tasks.iter().all(|t| t.status.is_terminal())
    }

    /// Kahn's algorithm. On a cycle, returns the tasks that could not be
    /// ordered (the cycle and everything downstream of it).
    pub fn topological_order(&self) -> Result<Vec<TaskId>, PipelineError> {
        let mut indegree: Vec<usize> = self.tasks.iter().map(|t| t.depends_on.len()).collect();
        let mut queue: VecDeque<usize> = indegree
            .iter()
            .enumerate()
            .filter(|(_, d)| **d == 0)
            .map(|(i, _)| i)
            .collect();
        let dependents = self.dependents_index();
        let mut order = Vec::with_capacity(self.tasks.len());
        while let Some(i) = queue.pop_front() {
            order.push(self.tasks[i].id.clone());
            for &j in &dependents[i] {
                indegree[j] -= 1;
                if indegree[j] == 0 {
                    queue.push_back(j);
                }
            }
        }
        if order.len() < self.tasks.len() {
            let stuck = self
                .tasks
                .iter()
                .enumerate()
                .filter(|(i, _)| indegree[*i] > 0)
                .map(|(_, t)| t.id.clone())
                .collect();
            return Err(PipelineError::CyclicDependency(stuck));
        }
        Ok(order)
    }

    fn dependents_index(&self) -> Vec<Vec<usize>> {
        let mut out = vec![Vec::new(); self.tasks.len()];
        for (j, t) in self.tasks.iter().enumerate() {
            for dep in &t.depends_on {
                if let Some(&i) = self.index.get(dep) {
                    out[i].push(j);
                }
            }
        }
        out
    }

    /// Direct dependents of `id`, insertion order.
    pub fn dependents(&self, id: &str) -> Vec<TaskId> {
        self.tasks
            .iter()
            .filter(|t| t.depends_on.contains(id))
            .map(|t| t.id.clone())
            .collect()
    }

    fn transitive_dependents(&self, id: &str) -> Vec<TaskId> {
        let mut seen = BTreeSet::new();
        let mut out = Vec::new();
        let mut stack = vec![id.to_string()];
        while let Some(cur) = stack.pop() {
            for d in self.dependents(&cur) {
                if seen.insert(d.clone()) {
                    out.push(d.clone());
                    stack.push(d);
                }
            }
        }
        out
    }

    /// Priority = number of tasks on the longest chain starting here
    /// (a sink has priority 1).
    pub fn compute_priorities(&mut self) {
        let Ok(order) = self.topological_order() else {
            return;
        };
        let dependents = self.dependents_index();
        let mut priority = vec![1u32; self.tasks.len()];
        for id in order.iter().rev() {
            let i = self.index[id];
            let longest = dependents[i].iter().map(|&j| priority[j]).max().unwrap_or(0);
            priority[i] = longest + 1;
        }
        for (t, p) in self.tasks.iter_mut().zip(priority) {
            t.priority = p;
        }
    }

    /// Move pending tasks whose dependencies have all succeeded to ready.
    /// Returns the promoted ids.
    pub fn promote_ready(&mut self) -> Vec<TaskId> {
        let promotable: Vec<usize> = self
            .tasks
            .iter()
            .enumerate()
            .filter(|(_, t)| t.status == TaskStatus::Pending)
            .filter(|(_, t)| {
                t.depends_on.iter().all(|d| {
                    self.get(d).is_some_and(|dt| dt.status == TaskStatus::Succeeded)
                })
            })
            .map(|(i, _)| i)
            .collect();
        let mut promoted = Vec::with_capacity(promotable.len());
        for i in promotable {
            let t = &mut self.tasks[i];
            if t.transition(TaskStatus::Ready).is_ok() {
                promoted.push(t.id.clone());
            }
        }
        promoted
    }

    /// Ready tasks, longest remaining chain first, then insertion order.
    pub fn ready_tasks(&self) -> Vec<TaskId> {
        let mut ready: Vec<(usize, &Task)> = self
            .tasks
            .iter()
            .enumerate()
            .filter(|(_, t)| t.status == TaskStatus::Ready)
            .collect();
        ready.sort_by(|(ia, a), (ib, b)| b.priority.cmp(&a.priority).then(ia.cmp(ib)));
        ready.into_iter().map(|(_, t)| t.id.clone()).collect()
    }

    /// Mark every non-terminal transitive dependent of `id` skipped.
    /// Sibling branches are untouched. Returns the newly skipped ids.
    pub fn propagate_failure(&mut self, id: &str) -> Vec<TaskId> {
        let mut skipped = Vec::new();
        for dep_id in self.transitive_dependents(id) {
            if let Some(t) = self.get_mut(&dep_id) {
                if !t.status.is_terminal() && t.transition(TaskStatus::Skipped).is_ok() {
                    if t.error.is_none() {
                        t.error = Some(format!("upstream task '{}' did not succeed", id));
                    }
                    skipped.push(dep_id);
                }
            }
        }
        skipped
    }

    /// Mark every non-terminal task skipped (turn cancelled or aborted).
    pub fn skip_remaining(&mut self, reason: &str) -> Vec<TaskId> {
        let mut skipped = Vec::new();
        for t in &mut self.tasks {
            if !t.status.is_terminal() && t.transition(TaskStatus::Skipped).is_ok() {
                t.error.get_or_insert_with(|| reason.to_string());
                skipped.push(t.id.clone());
            }
        }
        skipped
    }

    /// Re-open a succeeded task so it runs again. Dependents that were
    /// already ready go back to pending; succeeded dependents are left
    /// alone unless marked stale themselves.
    pub fn mark_stale(&mut self, id: &str) -> Result<(), PipelineError> {
        self.task_mut(id)?.reopen()?;
        for dep_id in self.transitive_dependents(id) {
            if let Some(t) = self.get_mut(&dep_id) {
                if t.status == TaskStatus::Ready {
                    t.transition(TaskStatus::Pending)?;
                }
            }
        }
        self.promote_ready();
        Ok(())
    }

    /// Add a task whose dependencies already exist. A new task has no
    /// dependents, so it cannot close a cycle.
    pub fn add_task(&mut self, task: Task) -> Result<(), PipelineError> {
        if self.index.contains_key(&task.id) {
            return Err(PipelineError::DuplicateTask(task.id));
        }
        if let Some(dep) = task.depends_on.iter().find(|d| !self.index.contains_key(*d)) {
            return Err(PipelineError::UnknownDependency {
                task: task.id.clone(),
                dependency: dep.clone(),
            });
        }
        self.index.insert(task.id.clone(), self.tasks.len());
        self.tasks.push(task);
        self.compute_priorities();
        self.promote_ready();
        Ok(())
    }

    /// Add `replacement` for the failed task `failed_id` and point every
    /// not-yet-started dependent at it. Tasks that already ran are never
    /// rewired.
    pub fn replace_task(&mut self, failed_id: &str, replacement: Task) -> Result<(), PipelineError> {
        let failed = self
            .get(failed_id)
            .ok_or_else(|| PipelineError::UnknownTask(failed_id.to_string()))?;
        if failed.status != TaskStatus::Failed {
            return Err(PipelineError::InvalidTransition {
                task: failed_id.to_string(),
                from: failed.status,
                to: TaskStatus::Failed,
            });
        }
        let new_id = replacement.id.clone();
        self.add_task(replacement)?;
        for t in &mut self.tasks {
            let not_started = matches!(t.status, TaskStatus::Pending | TaskStatus::Ready);
            if not_started && t.depends_on.remove(failed_id) {
                t.depends_on.insert(new_id.clone());
                if t.status == TaskStatus::Ready {
                    t.transition(TaskStatus::Pending)?;
                }
            }
        }
        self.task_mut(failed_id)?.replaced_by = Some(new_id);
        self.compute_priorities();
        self.promote_ready();
        Ok(())
    }
}
