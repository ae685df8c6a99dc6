//! `skillpipe plan`: classify and decompose, print the task graph.

use anyhow::Result;

use skillpipe_sandbox::CancellationToken;

use crate::cli::{SourceArgs, TurnArgs};

use super::{build_pipeline, conversation, runtime};

pub fn cmd_plan(turn: &TurnArgs, sources: &SourceArgs, json: bool) -> Result<()> {
    let pipeline = build_pipeline(sources)?;
    let state = conversation(turn)?;
    let cancel = CancellationToken::new();

    let rt = runtime()?;
    let intent = rt.block_on(pipeline.classifier().classify(&state.utterance, &state, &cancel));
    let graph = rt.block_on(pipeline.planner().plan(&intent, &state.utterance, &state, &cancel))?;
    let order = graph.topological_order()?;

    if json {
        let tasks: Vec<_> = order.iter().filter_map(|id| graph.get(id)).collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({ "intent": intent, "tasks": tasks }))?
        );
        return Ok(());
    }

    println!("intent: {} ({:?}, {:.2})", intent.kind, intent.method, intent.confidence);
    for id in &order {
        let Some(task) = graph.get(id) else {
            continue;
        };
        let deps = if task.depends_on.is_empty() {
            String::new()
        } else {
            format!("  ← {}", task.depends_on.iter().cloned().collect::<Vec<_>>().join(", "))
        };
        println!(
            "  [{}] p{} {} → {}{}",
            task.id,
            task.priority,
            task.description,
            task.tool_candidate.as_deref().unwrap_or("?"),
            deps
        );
    }
    Ok(())
}
