//! Tool handler interface.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// Per-invocation context handed to a handler.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub task_id: String,
    pub tool_id: String,
    pub attempt: u32,
    /// Root for any filesystem access the handler performs.
    pub workspace: PathBuf,
    /// Cancelled when the owning conversation is aborted.
    pub cancel: CancellationToken,
}

/// A tool implementation. Errors and `{"success": false, "error": ..}`
/// results are both treated as tool-reported failures.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn execute(&self, params: &Value, ctx: &ToolContext) -> anyhow::Result<Value>;
}

type BoxFuture = Pin<Box<dyn Future<Output = anyhow::Result<Value>> + Send>>;

struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F> ToolHandler for FnHandler<F>
where
    F: Fn(Value, ToolContext) -> BoxFuture + Send + Sync,
{
    async fn execute(&self, params: &Value, ctx: &ToolContext) -> anyhow::Result<Value> {
        (self.f)(params.clone(), ctx.clone()).await
    }
}

/// Wrap an async closure as a handler.
///
/// ```ignore
/// let echo = from_fn(|params, _ctx| async move { Ok(params) });
/// ```
pub fn from_fn<F, Fut>(f: F) -> Arc<dyn ToolHandler>
where
    F: Fn(Value, ToolContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Arc::new(FnHandler {
        f: move |params: Value, ctx: ToolContext| -> BoxFuture { Box::pin(f(params, ctx)) },
    })
}
