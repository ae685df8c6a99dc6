//! `skillpipe stats`: classifier rule counts plus usage rebuilt from the
//! execution log.

use anyhow::Result;
use serde_json::json;

use skillpipe_agent::intent::IntentClassifier;
use skillpipe_core::catalog::ToolCatalog;
use skillpipe_sandbox::UsageCounters;
use skillpipe_telemetry::{RecordFilter, RecordKind, TelemetryRecord, TelemetryStore};

use crate::cli::SourceArgs;

use super::{load_intent_rules, open_telemetry, optional_catalog};

pub fn cmd_stats(sources: &SourceArgs, json: bool) -> Result<()> {
    let classifier = IntentClassifier::new(load_intent_rules(sources.intent_rules.as_deref())?);
    let stats = classifier.stats();

    let catalog = optional_catalog(sources.catalog.as_deref())?;
    let store = open_telemetry();
    let records = store.query(&RecordFilter::kind(RecordKind::Execution))?;
    let usage = usage_from_log(&records, catalog.as_deref().map(|c| c as &dyn ToolCatalog));
    let snapshot = usage.snapshot();

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({ "classifier": stats, "usage": snapshot }))?
        );
        return Ok(());
    }
    println!(
        "classifier: {} exact phrases, {} keywords, {} patterns",
        stats.rules_count, stats.keywords_count, stats.patterns_count
    );
    println!("tool usage:");
    for (tool, n) in &snapshot.tools {
        println!("  {:<20} {}", tool, n);
    }
    if !snapshot.skills.is_empty() {
        println!("skill usage:");
        for (skill, n) in &snapshot.skills {
            println!("  {:<20} {}", skill, n);
        }
    }
    Ok(())
}

/// Rebuild usage counters from successful executions. Records written
/// before `skill_id` was logged fall back to the tool's first owning skill.
fn usage_from_log(records: &[TelemetryRecord], catalog: Option<&dyn ToolCatalog>) -> UsageCounters {
    let usage = UsageCounters::new();
    for record in records {
        let TelemetryRecord::Execution(exec) = record else {
            continue;
        };
        if !exec.success {
            continue;
        }
        let skill = exec.skill_id.clone().or_else(|| {
            catalog.and_then(|c| c.skills_for_tool(&exec.tool_id).first().map(|s| s.id.clone()))
        });
        usage.record_success(&exec.tool_id, skill.as_deref());
    }
    usage
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use skillpipe_core::catalog::StaticCatalog;
    use skillpipe_core::records::ToolExecutionRecord;

    const CATALOG: &str = r#"
tools:
  - id: read_file
skills:
  - id: files
    tools: [read_file]
  - id: research
    tools: [read_file]
"#;

    fn exec(skill: Option<&str>, success: bool) -> TelemetryRecord {
        TelemetryRecord::Execution(ToolExecutionRecord {
            task_id: "t1".to_string(),
            tool_id: "read_file".to_string(),
            skill_id: skill.map(str::to_string),
            params: json!({}),
            result: None,
            success,
            duration_ms: 1,
            error: None,
            attempt: 1,
            recorded_at: Utc::now(),
        })
    }

    #[test]
    fn test_usage_credits_logged_skill() {
        let catalog = StaticCatalog::from_yaml_str(CATALOG).unwrap();
        let records = vec![
            exec(Some("research"), true),
            exec(Some("research"), true),
            exec(Some("research"), false),
            exec(None, true),
        ];
        let usage = usage_from_log(&records, Some(&catalog as &dyn ToolCatalog));

        assert_eq!(usage.tool_count("read_file"), 3);
        assert_eq!(usage.skill_count("research"), 2);
        // only the record without a logged skill falls back to the first owner
        assert_eq!(usage.skill_count("files"), 1);
    }
}
