//! Generic handlers the CLI registers out of the box. Catalog tools bind to
//! them through `handler: echo | read_file | write_file`.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::{json, Value};

use skillpipe_agent::types::safe_truncate;
use skillpipe_core::path_validation::resolve_under_root;
use skillpipe_sandbox::{from_fn, HandlerRegistry, ToolContext, ToolHandler};

/// Larger files are truncated on read.
const MAX_READ_BYTES: usize = 256 * 1024;

pub fn registry() -> HandlerRegistry {
    HandlerRegistry::builder()
        .register("echo", echo())
        .register("read_file", read_file())
        .register("write_file", write_file())
        .build()
}

fn str_param<'a>(params: &'a Value, name: &str) -> Result<&'a str> {
    params
        .get(name)
        .and_then(Value::as_str)
        .with_context(|| format!("missing string parameter '{}'", name))
}

fn echo() -> Arc<dyn ToolHandler> {
    from_fn(|params: Value, _ctx| async move {
        let text = match params.get("text") {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => params.to_string(),
        };
        Ok(json!({ "text": text }))
    })
}

fn read_file() -> Arc<dyn ToolHandler> {
    from_fn(|params: Value, ctx: ToolContext| async move {
        let rel = str_param(&params, "path")?;
        let path = resolve_under_root(&ctx.workspace, rel)?;
        let bytes = tokio::fs::read(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let (content, truncated) = decode_prefix(&bytes, MAX_READ_BYTES);
        Ok(json!({
            "path": rel,
            "content": content,
            "truncated": truncated,
        }))
    })
}

/// Decode as UTF-8 (lossy) and cut to at most `max` bytes on a char boundary.
fn decode_prefix(bytes: &[u8], max: usize) -> (String, bool) {
    // a char split at the window edge decodes to U+FFFD beyond `max`
    let window = &bytes[..bytes.len().min(max.saturating_add(4))];
    let decoded = String::from_utf8_lossy(window);
    let content = safe_truncate(&decoded, max);
    let truncated = bytes.len() > max || content.len() < decoded.len();
    (content.to_string(), truncated)
}

fn write_file() -> Arc<dyn ToolHandler> {
    from_fn(|params: Value, ctx: ToolContext| async move {
        let rel = str_param(&params, "path")?;
        let content = str_param(&params, "content")?;
        let path = resolve_under_root(&ctx.workspace, rel)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        tokio::fs::write(&path, content)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        tracing::debug!(task = %ctx.task_id, "wrote {} bytes to {}", content.len(), path.display());
        Ok(json!({ "path": rel, "bytes": content.len() }))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use skillpipe_sandbox::CancellationToken;

    fn ctx(workspace: &std::path::Path) -> ToolContext {
        ToolContext {
            task_id: "t1".into(),
            tool_id: "tool".into(),
            attempt: 1,
            workspace: workspace.to_path_buf(),
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_write_then_read_inside_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry();
        let c = ctx(dir.path());

        let written = reg
            .get("write_file")
            .unwrap()
            .execute(&json!({"path": "notes/a.txt", "content": "hello"}), &c)
            .await
            .unwrap();
        assert_eq!(written["bytes"], 5);

        let read = reg
            .get("read_file")
            .unwrap()
            .execute(&json!({"path": "notes/a.txt"}), &c)
            .await
            .unwrap();
        assert_eq!(read["content"], "hello");
        assert_eq!(read["truncated"], false);
    }

    #[test]
    fn test_truncation_keeps_whole_chars() {
        let text = "天气很好";
        let (content, truncated) = decode_prefix(text.as_bytes(), 7);
        assert_eq!(content, "天气");
        assert!(truncated);
        assert!(!content.contains('\u{FFFD}'));

        let (content, truncated) = decode_prefix(text.as_bytes(), 64);
        assert_eq!(content, text);
        assert!(!truncated);
    }

    #[tokio::test]
    async fn test_paths_outside_workspace_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry();
        let c = ctx(dir.path());

        let err = reg
            .get("write_file")
            .unwrap()
            .execute(&json!({"path": "../escape.txt", "content": "x"}), &c)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("escapes"), "{err}");
        assert!(reg
            .get("read_file")
            .unwrap()
            .execute(&json!({}), &c)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_echo() {
        let dir = tempfile::tempdir().unwrap();
        let out = registry()
            .get("echo")
            .unwrap()
            .execute(&json!({"text": "hi"}), &ctx(dir.path()))
            .await
            .unwrap();
        assert_eq!(out, json!({"text": "hi"}));
    }
}
