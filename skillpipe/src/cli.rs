use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// skillpipe - classify, plan and run one conversation turn against a tool catalog
#[derive(Parser, Debug)]
#[command(name = "skillpipe")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// Options shared by commands that load a catalog and rule files.
#[derive(clap::Args, Debug, Clone)]
pub struct SourceArgs {
    /// Tool/skill catalog YAML (default: SKILLPIPE_CATALOG)
    #[arg(long, value_name = "FILE")]
    pub catalog: Option<PathBuf>,

    /// Extra intent rules YAML, merged after the builtin rules
    #[arg(long, value_name = "FILE")]
    pub intent_rules: Option<PathBuf>,

    /// Extra planning rules (JSON or YAML list), merged over the seed rules
    #[arg(long, value_name = "FILE")]
    pub planning_rules: Option<PathBuf>,
}

/// Conversation context for a single turn.
#[derive(clap::Args, Debug, Clone)]
pub struct TurnArgs {
    /// The user utterance
    #[arg(value_name = "UTTERANCE")]
    pub utterance: String,

    /// Conversation id (default: a fresh uuid)
    #[arg(long)]
    pub conversation: Option<String>,

    /// Active goal carried over from an earlier turn
    #[arg(long, value_name = "GOAL")]
    pub goal: Option<String>,

    /// Explicit slot value, NAME=VALUE (repeatable)
    #[arg(long = "set", value_name = "NAME=VALUE")]
    pub values: Vec<String>,

    /// Known entity from earlier turns, TYPE=VALUE (repeatable)
    #[arg(long = "entity", value_name = "TYPE=VALUE")]
    pub entities: Vec<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Classify an utterance into an intent
    Classify {
        #[arg(value_name = "UTTERANCE")]
        utterance: String,

        /// Extra intent rules YAML
        #[arg(long, value_name = "FILE")]
        intent_rules: Option<PathBuf>,

        /// Deterministic rules only; never call the LLM
        #[arg(long, default_value = "false")]
        no_llm: bool,

        /// Output as JSON
        #[arg(long, default_value = "false")]
        json: bool,
    },

    /// Decompose an utterance into a task graph without running it
    Plan {
        #[command(flatten)]
        turn: TurnArgs,

        #[command(flatten)]
        sources: SourceArgs,

        /// Output as JSON
        #[arg(long, default_value = "false")]
        json: bool,
    },

    /// Run one full turn: classify, plan, fill slots, dispatch, validate
    Run {
        #[command(flatten)]
        turn: TurnArgs,

        #[command(flatten)]
        sources: SourceArgs,

        /// Grant a permission to the caller (repeatable), e.g. fs.read
        #[arg(long = "allow", value_name = "PERMISSION")]
        permissions: Vec<String>,

        /// Confirm risk-gated tools up front
        #[arg(long, short = 'y', default_value = "false")]
        yes: bool,

        /// Output the full turn report as JSON
        #[arg(long, default_value = "false")]
        json: bool,
    },

    /// Aggregate recorded stage metrics
    Metrics {
        /// Only this stage (classify, fill_slots, plan, execute, validate)
        #[arg(long)]
        stage: Option<String>,

        /// Only records from the last N hours
        #[arg(long, value_name = "HOURS")]
        since_hours: Option<i64>,

        /// Output as JSON
        #[arg(long, default_value = "false")]
        json: bool,
    },

    /// List catalog tools and skills
    Catalog {
        /// Tool/skill catalog YAML (default: SKILLPIPE_CATALOG)
        #[arg(long, value_name = "FILE")]
        catalog: Option<PathBuf>,

        /// Output as JSON
        #[arg(long, default_value = "false")]
        json: bool,
    },

    /// Show classifier rule counts and tool/skill usage from recorded executions
    Stats {
        #[command(flatten)]
        sources: SourceArgs,

        /// Output as JSON
        #[arg(long, default_value = "false")]
        json: bool,
    },
}
