//! skillpipe-sandbox: the only place tool handlers run.
//!
//! - [`handler`]: uniform `execute(params, context)` handler interface
//! - [`registry`]: static handler registry keyed by handler name
//! - [`policy`]: permission and risk-confirmation checks
//! - [`usage`]: tool/skill usage counters
//! - [`runner`]: [`Sandbox::dispatch`], timeout + error capture + execution log

pub mod error;
pub mod handler;
pub mod policy;
pub mod registry;
pub mod runner;
pub mod usage;

pub use error::DispatchError;
pub use handler::{from_fn, ToolContext, ToolHandler};
pub use policy::RiskPolicy;
pub use registry::{HandlerRegistry, HandlerRegistryBuilder};
pub use runner::{DispatchRequest, Sandbox};
pub use tokio_util::sync::CancellationToken;
pub use usage::{UsageCounters, UsageSnapshot};
