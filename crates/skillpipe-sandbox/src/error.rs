use std::collections::BTreeSet;

use skillpipe_core::catalog::{Permission, RiskLevel};
use thiserror::Error;

/// Dispatch rejected before the handler ran (or abandoned by cancellation).
///
/// Tool failures are not errors: they come back as a record with
/// `success: false`.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Permission denied for tool '{tool}': missing {}", format_permissions(.missing))]
    PermissionDenied {
        tool: String,
        missing: BTreeSet<Permission>,
    },

    #[error("Tool '{tool}' is {risk} risk and requires explicit confirmation")]
    ConfirmationRequired { tool: String, risk: RiskLevel },

    #[error("Unknown tool '{0}'")]
    UnknownTool(String),

    #[error("No handler registered for '{handler}' (tool '{tool}')")]
    MissingHandler { tool: String, handler: String },

    #[error("Dispatch of '{tool}' cancelled after {duration_ms}ms")]
    Cancelled { tool: String, duration_ms: u64 },
}

impl DispatchError {
    /// Rejections happen before any side effect.
    pub fn is_rejection(&self) -> bool {
        !matches!(self, DispatchError::Cancelled { .. })
    }
}

fn format_permissions(perms: &BTreeSet<Permission>) -> String {
    perms
        .iter()
        .map(|p| p.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}
