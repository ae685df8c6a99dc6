//! skillpipe-agent: the per-turn pipeline.
//!
//! utterance → [`intent::IntentClassifier`] → [`task_planner::TaskPlanner`] →
//! ([`slots::SlotFiller`] + [`scheduler::SkillScheduler`] per task) →
//! [`quality_gate::QualityGate`], driven by [`pipeline::Pipeline`].

pub mod error;
pub mod intent;
pub mod llm;
pub mod pipeline;
pub mod planning_rules;
pub mod quality_gate;
pub mod scheduler;
pub mod slots;
pub mod task_planner;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;

pub use error::PipelineError;
pub use pipeline::{Pipeline, PipelineBuilder, TurnOutcome, TurnReport, TurnRequest};
