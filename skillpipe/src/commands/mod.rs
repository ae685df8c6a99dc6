//! Subcommand implementations and the wiring they share.

pub mod catalog;
pub mod classify;
pub mod metrics;
pub mod plan;
pub mod run;
pub mod stats;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::{Map, Value};

use skillpipe_agent::intent::IntentRules;
use skillpipe_agent::llm::{LlmClient, LlmService};
use skillpipe_agent::planning_rules::load_rules;
use skillpipe_agent::types::ConversationState;
use skillpipe_agent::Pipeline;
use skillpipe_core::catalog::StaticCatalog;
use skillpipe_core::config::{PathsConfig, PipelineConfig, TelemetryConfig};
use skillpipe_telemetry::{open_store, TelemetryStore};

use crate::builtin;
use crate::cli::{SourceArgs, TurnArgs};

pub(crate) fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Runtime::new().context("Failed to create tokio runtime")
}

/// Catalog from `path`, falling back to `SKILLPIPE_CATALOG`.
pub(crate) fn load_catalog(path: Option<&Path>) -> Result<Arc<StaticCatalog>> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => PathsConfig::from_env()
            .catalog
            .context("No catalog given: pass --catalog or set SKILLPIPE_CATALOG")?,
    };
    let catalog = StaticCatalog::load(&path)
        .with_context(|| format!("Failed to load catalog: {}", path.display()))?;
    Ok(Arc::new(catalog))
}

/// Like [`load_catalog`], but `None` when no catalog is configured at all.
pub(crate) fn optional_catalog(path: Option<&Path>) -> Result<Option<Arc<StaticCatalog>>> {
    if path.is_none() && PathsConfig::from_env().catalog.is_none() {
        return Ok(None);
    }
    load_catalog(path).map(Some)
}

pub(crate) fn load_intent_rules(path: Option<&Path>) -> Result<IntentRules> {
    match path {
        Some(p) => IntentRules::load(p),
        None => Ok(IntentRules::builtin()),
    }
}

pub(crate) fn llm_from_env() -> Option<Arc<dyn LlmService>> {
    let client = LlmClient::from_env()?;
    tracing::debug!("LLM fallback enabled (model {})", client.model());
    Some(Arc::new(client))
}

pub(crate) fn open_telemetry() -> Arc<dyn TelemetryStore> {
    open_store(&TelemetryConfig::from_env())
}

/// Pipeline over the builtin handlers, configured from env and `sources`.
pub(crate) fn build_pipeline(sources: &SourceArgs) -> Result<Pipeline> {
    let catalog = load_catalog(sources.catalog.as_deref())?;
    let handlers = builtin::registry();
    let unbound = handlers.unbound_tools(catalog.as_ref());
    if !unbound.is_empty() {
        eprintln!("⚠ No builtin handler for: {}", unbound.join(", "));
    }

    let mut builder = Pipeline::builder(catalog, handlers)
        .config(PipelineConfig::from_env())
        .store(open_telemetry())
        .intent_rules(load_intent_rules(sources.intent_rules.as_deref())?)
        .planning_rules(load_rules(sources.planning_rules.as_deref())?)
        .workspace(PathsConfig::from_env().workspace);
    if let Some(llm) = llm_from_env() {
        builder = builder.llm(llm);
    }
    Ok(builder.build())
}

/// `NAME=VALUE` pairs. Values that parse as JSON keep their type.
pub(crate) fn parse_pairs(pairs: &[String]) -> Result<Map<String, Value>> {
    let mut map = Map::new();
    for pair in pairs {
        let (name, raw) = pair
            .split_once('=')
            .with_context(|| format!("Expected NAME=VALUE, got '{}'", pair))?;
        let name = name.trim();
        if name.is_empty() {
            anyhow::bail!("Empty name in '{}'", pair);
        }
        let value = serde_json::from_str(raw.trim()).unwrap_or_else(|_| Value::String(raw.trim().to_string()));
        map.insert(name.to_string(), value);
    }
    Ok(map)
}

pub(crate) fn conversation(turn: &TurnArgs) -> Result<ConversationState> {
    let id = turn
        .conversation
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let mut state = ConversationState::new(id, turn.utterance.clone());
    state.explicit_values = parse_pairs(&turn.values)?;
    state.entities = parse_pairs(&turn.entities)?.into_iter().collect();
    state.active_goal = turn.goal.clone();
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_pairs_keeps_json_types() {
        let pairs = vec![
            "days=3".to_string(),
            "city=Paris".to_string(),
            "flags=[1,2]".to_string(),
            "note = hello world ".to_string(),
        ];
        let map = parse_pairs(&pairs).unwrap();
        assert_eq!(map["days"], json!(3));
        assert_eq!(map["city"], json!("Paris"));
        assert_eq!(map["flags"], json!([1, 2]));
        assert_eq!(map["note"], json!("hello world"));

        assert!(parse_pairs(&["nonsense".to_string()]).is_err());
        assert!(parse_pairs(&["=3".to_string()]).is_err());
    }

    #[test]
    fn test_conversation_from_args() {
        let turn = TurnArgs {
            utterance: "weather".into(),
            conversation: Some("c-1".into()),
            goal: Some("weather city=Oslo".into()),
            values: vec!["units=imperial".into()],
            entities: vec!["city=Paris".into()],
        };
        let state = conversation(&turn).unwrap();
        assert_eq!(state.conversation_id, "c-1");
        assert_eq!(state.explicit_values["units"], json!("imperial"));
        assert_eq!(state.entities["city"], json!("Paris"));
        assert_eq!(state.active_goal.as_deref(), Some("weather city=Oslo"));
    }
}
