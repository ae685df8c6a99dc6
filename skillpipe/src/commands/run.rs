//! `skillpipe run`: one full turn through the pipeline.

use anyhow::Result;

use skillpipe_agent::types::TaskStatus;
use skillpipe_agent::{TurnOutcome, TurnReport, TurnRequest};
use skillpipe_sandbox::CancellationToken;

use crate::cli::{SourceArgs, TurnArgs};

use super::{build_pipeline, conversation, runtime};

pub fn cmd_run(
    turn: &TurnArgs,
    sources: &SourceArgs,
    permissions: &[String],
    confirmed: bool,
    json: bool,
) -> Result<()> {
    let pipeline = build_pipeline(sources)?;
    let cancel = CancellationToken::new();
    let request = TurnRequest::new(conversation(turn)?)
        .with_permissions(permissions.iter().map(String::as_str))
        .confirmed(confirmed)
        .with_cancel(cancel.clone());

    let report = runtime()?.block_on(async {
        let on_interrupt = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("\n⏹ Cancelling turn...");
                on_interrupt.cancel();
            }
        });
        pipeline.run_turn(request).await
    });

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    if report.outcome == TurnOutcome::PlanFailed {
        anyhow::bail!(
            "No plan: {}",
            report.error.as_deref().unwrap_or("request could not be decomposed")
        );
    }
    Ok(())
}

fn print_report(report: &TurnReport) {
    println!(
        "intent: {} ({:?}, {:.2})",
        report.intent.kind, report.intent.method, report.intent.confidence
    );
    if let Some(goal) = &report.goal {
        println!("goal:   {}", goal);
    }
    for task in &report.tasks {
        let mark = match task.status {
            TaskStatus::Succeeded => "✓",
            TaskStatus::Failed => "✗",
            TaskStatus::Skipped => "⏭",
            _ => "…",
        };
        println!(
            "  {} [{}] {} ({})",
            mark,
            task.id,
            task.description,
            task.tool.as_deref().unwrap_or("-")
        );
        if let Some(result) = &task.result {
            println!("      → {}", result);
        }
        if let Some(err) = &task.error {
            println!("      ! {}", err);
        }
        if let Some(next) = &task.replaced_by {
            println!("      ↪ replaced by {}", next);
        }
    }
    for (task, slots) in &report.pending_slots {
        println!("  ? {} needs: {}", task, slots.join(", "));
    }
    println!("outcome: {} in {}ms", report.outcome, report.duration_ms);
}
