//! Permission and risk gating, checked before any side effect.
//!
//! SKILLPIPE_CONFIRM_RISK: comma-separated risk levels that need explicit
//! confirmation, e.g. "high" (default) or "medium,high". High risk is
//! always included.

use std::collections::BTreeSet;

use skillpipe_core::catalog::{Permission, RiskLevel, ToolDefinition};

use crate::error::DispatchError;

/// `caller ⊇ tool.required_permissions`, else `PermissionDenied` listing the shortfall.
pub fn check_permissions(
    tool: &ToolDefinition,
    caller: &BTreeSet<Permission>,
) -> Result<(), DispatchError> {
    let missing: BTreeSet<Permission> = tool
        .required_permissions
        .difference(caller)
        .cloned()
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(DispatchError::PermissionDenied {
            tool: tool.id.clone(),
            missing,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RiskPolicy {
    confirm: BTreeSet<RiskLevel>,
}

impl Default for RiskPolicy {
    fn default() -> Self {
        Self {
            confirm: BTreeSet::from([RiskLevel::High]),
        }
    }
}

impl RiskPolicy {
    pub fn parse(raw: &str) -> Self {
        let mut confirm = BTreeSet::from([RiskLevel::High]);
        for part in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            match RiskLevel::parse(part) {
                Some(level) => {
                    confirm.insert(level);
                }
                None => tracing::warn!("Ignoring unknown risk level '{}' in confirm list", part),
            }
        }
        Self { confirm }
    }

    pub fn requires_confirmation(&self, risk: RiskLevel) -> bool {
        self.confirm.contains(&risk)
    }

    pub fn check(&self, tool: &ToolDefinition, confirmed: bool) -> Result<(), DispatchError> {
        if self.requires_confirmation(tool.risk_level) && !confirmed {
            return Err(DispatchError::ConfirmationRequired {
                tool: tool.id.clone(),
                risk: tool.risk_level,
            });
        }
        Ok(())
    }
}
