//! Planning rules: keyword → tool hints used while decomposing a request.
//!
//! Compiled-in seed rules are always present. A rules file (JSON array or
//! YAML list) is merged on top:
//! - same id as a mutable rule → overrides it
//! - same id as an immutable rule → skipped
//! - new id → appended

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use skillpipe_core::catalog::ToolCatalog;

use crate::intent::contains_keyword;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanningRule {
    pub id: String,
    #[serde(default = "default_priority")]
    pub priority: u32,
    #[serde(default)]
    pub keywords: Vec<String>,
    /// When non-empty, at least one of these must also appear.
    #[serde(default)]
    pub context_keywords: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_hint: Option<String>,
    #[serde(default)]
    pub instruction: String,
    #[serde(default = "default_mutable")]
    pub mutable: bool,
}

fn default_priority() -> u32 {
    50
}

fn default_mutable() -> bool {
    true
}

impl PlanningRule {
    pub fn matches(&self, text: &str) -> bool {
        let lower = text.to_lowercase();
        let hit = |k: &String| contains_keyword(&lower, &k.to_lowercase());
        self.keywords.iter().any(hit)
            && (self.context_keywords.is_empty() || self.context_keywords.iter().any(hit))
    }
}

fn seed_rule(id: &str, keywords: &[&str], tool: &str, instruction: &str) -> PlanningRule {
    PlanningRule {
        id: id.to_string(),
        priority: 60,
        keywords: keywords.iter().map(|s| s.to_string()).collect(),
        context_keywords: Vec::new(),
        tool_hint: Some(tool.to_string()),
        instruction: instruction.to_string(),
        mutable: true,
    }
}

/// Compiled-in rules for the builtin tools.
pub fn seed_rules() -> Vec<PlanningRule> {
    vec![
        seed_rule(
            "read-file",
            &["读取", "查看文件", "打开文件", "read", "show file"],
            "read_file",
            "Reading file contents: read_file.",
        ),
        seed_rule(
            "write-file",
            &["写入", "保存到", "写到", "write", "save to"],
            "write_file",
            "Writing output to a file: write_file.",
        ),
        seed_rule(
            "echo",
            &["回显", "复述", "echo", "repeat back"],
            "echo",
            "Repeating text back: echo.",
        ),
    ]
}

/// Parse a rules file body. JSON is tried first, then YAML.
pub fn parse_rules(content: &str) -> Result<Vec<PlanningRule>> {
    if let Ok(rules) = serde_json::from_str::<Vec<PlanningRule>>(content) {
        return Ok(rules);
    }
    serde_yaml::from_str::<Vec<PlanningRule>>(content).context("Invalid planning rules (expected a JSON array or YAML list)")
}

/// Seed rules, with `path` merged on top when given.
pub fn load_rules(path: Option<&Path>) -> Result<Vec<PlanningRule>> {
    let mut rules = seed_rules();
    if let Some(path) = path {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read planning rules {}", path.display()))?;
        let extra = parse_rules(&content)?;
        let count = extra.len();
        merge_rules(&mut rules, extra);
        tracing::debug!("Merged {} planning rules from {}", count, path.display());
    }
    Ok(rules)
}

pub fn merge_rules(base: &mut Vec<PlanningRule>, extra: Vec<PlanningRule>) {
    for rule in extra {
        if let Some(pos) = base.iter().position(|r| r.id == rule.id) {
            if base[pos].mutable {
                base[pos] = rule;
            }
        } else {
            base.push(rule);
        }
    }
}

/// Highest-priority matching rule whose hinted tool is in the catalog.
/// Ties go to the rule listed first.
pub fn best_hint<'a>(
    rules: &'a [PlanningRule],
    text: &str,
    catalog: &dyn ToolCatalog,
) -> Option<&'a PlanningRule> {
    let mut best: Option<&PlanningRule> = None;
    for rule in rules {
        let usable = rule
            .tool_hint
            .as_deref()
            .is_some_and(|t| catalog.get_tool(t).is_some());
        if usable && rule.matches(text) && best.map_or(true, |b| rule.priority > b.priority) {
            best = Some(rule);
        }
    }
    best
}
