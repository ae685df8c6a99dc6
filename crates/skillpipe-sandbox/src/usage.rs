//! Tool and skill usage counters.
//!
//! One lock guards both maps, so an increment of a tool and its skill is a
//! single atomic step and concurrent dispatches never lose updates.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use serde::Serialize;

#[derive(Default)]
struct Counts {
    tools: HashMap<String, u64>,
    skills: HashMap<String, u64>,
}

#[derive(Default)]
pub struct UsageCounters {
    inner: Mutex<Counts>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UsageSnapshot {
    pub tools: BTreeMap<String, u64>,
    pub skills: BTreeMap<String, u64>,
}

impl UsageCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one successful dispatch of `tool`, attributed to `skill` if any.
    pub fn record_success(&self, tool: &str, skill: Option<&str>) {
        let Ok(mut counts) = self.inner.lock() else {
            tracing::warn!("usage counters lock poisoned; dropping increment for {}", tool);
            return;
        };
        *counts.tools.entry(tool.to_string()).or_insert(0) += 1;
        if let Some(skill) = skill {
            *counts.skills.entry(skill.to_string()).or_insert(0) += 1;
        }
    }

    pub fn tool_count(&self, tool: &str) -> u64 {
        self.inner
            .lock()
            .ok()
            .and_then(|c| c.tools.get(tool).copied())
            .unwrap_or(0)
    }

    pub fn skill_count(&self, skill: &str) -> u64 {
        self.inner
            .lock()
            .ok()
            .and_then(|c| c.skills.get(skill).copied())
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> UsageSnapshot {
        match self.inner.lock() {
            Ok(c) => UsageSnapshot {
                tools: c.tools.iter().map(|(k, v)| (k.clone(), *v)).collect(),
                skills: c.skills.iter().map(|(k, v)| (k.clone(), *v)).collect(),
            },
            Err(_) => UsageSnapshot::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_concurrent_increments_are_not_lost() {
        let counters = Arc::new(UsageCounters::new());
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let c = counters.clone();
                std::thread::spawn(move || {
                    for _ in 0..250 {
                        c.record_success("echo", Some("basic"));
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(counters.tool_count("echo"), 2000);
        assert_eq!(counters.skill_count("basic"), 2000);
        assert_eq!(counters.snapshot().tools.len(), 1);
    }

    #[test]
    fn test_skill_is_optional() {
        let counters = UsageCounters::new();
        counters.record_success("echo", None);
        assert_eq!(counters.tool_count("echo"), 1);
        assert!(counters.snapshot().skills.is_empty());
    }
}
