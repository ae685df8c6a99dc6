//! Records shared by the pipeline stages and the telemetry stores.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Where a slot value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotSource {
    User,
    Inferred,
    Default,
    Unresolved,
}

impl SlotSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlotSource::User => "user",
            SlotSource::Inferred => "inferred",
            SlotSource::Default => "default",
            SlotSource::Unresolved => "unresolved",
        }
    }
}

impl fmt::Display for SlotSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One slot resolution, appended to slot history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotHistoryEntry {
    pub conversation_id: String,
    pub task_id: String,
    pub slot: String,
    pub value: Value,
    pub source: SlotSource,
    pub confidence: f32,
    pub recorded_at: DateTime<Utc>,
}

/// Outcome of one tool dispatch attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolExecutionRecord {
    pub task_id: String,
    pub tool_id: String,
    /// Skill the dispatch was credited to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skill_id: Option<String>,
    pub params: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    pub success: bool,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default = "default_attempt")]
    pub attempt: u32,
    pub recorded_at: DateTime<Utc>,
}

fn default_attempt() -> u32 {
    1
}

/// Pipeline stage a performance metric belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Classify,
    FillSlots,
    Plan,
    Execute,
    Validate,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Classify,
        Stage::FillSlots,
        Stage::Plan,
        Stage::Execute,
        Stage::Validate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Classify => "classify",
            Stage::FillSlots => "fill_slots",
            Stage::Plan => "plan",
            Stage::Execute => "execute",
            Stage::Validate => "validate",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_str() == raw.trim())
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetric {
    pub stage: Stage,
    pub duration_ms: u64,
    #[serde(default)]
    pub metadata: Value,
    pub recorded_at: DateTime<Utc>,
}

impl PerformanceMetric {
    pub fn new(stage: Stage, duration_ms: u64, metadata: Value) -> Self {
        Self {
            stage,
            duration_ms,
            metadata,
            recorded_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_parse_round_trips_names() {
        for stage in Stage::ALL {
            assert_eq!(Stage::parse(stage.as_str()), Some(stage));
        }
        assert_eq!(Stage::parse("bogus"), None);
    }

    #[test]
    fn test_execution_record_attempt_defaults_to_one() {
        let json = r#"{"task_id":"t1","tool_id":"echo","params":{},"success":true,
            "duration_ms":3,"recorded_at":"2026-01-01T00:00:00Z"}"#;
        let rec: ToolExecutionRecord = serde_json::from_str(json).unwrap();
        assert_eq!(rec.attempt, 1);
        assert!(rec.result.is_none());
    }
}
