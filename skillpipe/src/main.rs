mod builtin;
mod cli;
mod commands;

use anyhow::Result;
use clap::Parser;

use cli::{Cli, Commands};
use skillpipe_core::observability::{self, TracingMode};

fn main() -> Result<()> {
    observability::init_tracing(TracingMode::Interactive);
    let cli = Cli::parse();

    match cli.command {
        Commands::Classify {
            utterance,
            intent_rules,
            no_llm,
            json,
        } => commands::classify::cmd_classify(&utterance, intent_rules.as_deref(), no_llm, json)?,
        Commands::Plan { turn, sources, json } => commands::plan::cmd_plan(&turn, &sources, json)?,
        Commands::Run {
            turn,
            sources,
            permissions,
            yes,
            json,
        } => commands::run::cmd_run(&turn, &sources, &permissions, yes, json)?,
        Commands::Metrics {
            stage,
            since_hours,
            json,
        } => commands::metrics::cmd_metrics(stage.as_deref(), since_hours, json)?,
        Commands::Catalog { catalog, json } => commands::catalog::cmd_catalog(catalog.as_deref(), json)?,
        Commands::Stats { sources, json } => commands::stats::cmd_stats(&sources, json)?,
    }
    Ok(())
}
