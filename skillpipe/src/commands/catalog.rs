//! `skillpipe catalog`: what the pipeline can dispatch to.

use std::path::Path;

use anyhow::Result;
use serde_json::json;

use skillpipe_core::catalog::ToolCatalog;

use super::load_catalog;

pub fn cmd_catalog(path: Option<&Path>, json: bool) -> Result<()> {
    let catalog = load_catalog(path)?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({
                "tools": catalog.tools(),
                "skills": catalog.skills(),
            }))?
        );
        return Ok(());
    }

    println!("Tools ({}):", catalog.tools().len());
    for tool in catalog.tools() {
        let params: Vec<String> = tool
            .schema
            .parameters
            .iter()
            .map(|p| if p.required { format!("{}*", p.name) } else { p.name.clone() })
            .collect();
        println!(
            "  {:<20} [{}] risk={} {}",
            tool.id,
            params.join(", "),
            tool.risk_level,
            tool.description
        );
    }
    println!("Skills ({}):", catalog.skills().len());
    for skill in catalog.skills() {
        let tools: Vec<&str> = skill.tools.iter().map(String::as_str).collect();
        println!("  {:<20} {}", skill.id, tools.join(", "));
    }
    Ok(())
}
