//! `skillpipe classify`: intent only, no planning.

use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::Result;

use skillpipe_agent::intent::IntentClassifier;
use skillpipe_agent::types::ConversationState;
use skillpipe_core::config::PipelineConfig;
use skillpipe_sandbox::CancellationToken;

use super::{llm_from_env, load_intent_rules, runtime};

pub fn cmd_classify(utterance: &str, intent_rules: Option<&Path>, no_llm: bool, json: bool) -> Result<()> {
    let mut classifier = IntentClassifier::new(load_intent_rules(intent_rules)?);
    if !no_llm {
        if let Some(llm) = llm_from_env() {
            let timeout = Duration::from_secs(PipelineConfig::from_env().llm_timeout_secs.max(1));
            classifier = classifier.with_llm(llm, timeout);
        }
    }

    let state = ConversationState::new("cli", utterance);
    let started = Instant::now();
    let intent = runtime()?.block_on(classifier.classify(utterance, &state, &CancellationToken::new()));
    let elapsed = started.elapsed();

    if json {
        println!("{}", serde_json::to_string_pretty(&intent)?);
    } else {
        println!("intent:     {}", intent.kind);
        println!("confidence: {:.2}", intent.confidence);
        println!("method:     {:?}", intent.method);
        println!("reason:     {}", intent.reason);
        println!("took:       {:.1}ms", elapsed.as_secs_f64() * 1000.0);
    }
    Ok(())
}
