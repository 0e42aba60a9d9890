use serde::{Deserialize, Serialize};

/// How the reconciler reacts to observed drift.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriftPolicy {
    /// Automatically revert the runtime to the desired state.
    #[default]
    Revert,
    /// Flag drift and wait for an operator acknowledgement.
    Flag,
}

impl DriftPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            DriftPolicy::Revert => "revert",
            DriftPolicy::Flag => "flag",
        }
    }
}

/// Governs reconciliation behavior for the whole agent.
///
/// Per-stack work is serial: the compose CLI is the bottleneck, and serial
/// execution rules out races on container labels.
#[derive(Debug, Clone, Copy)]
pub struct ReconciliationPolicy {
    /// Whether reconciliation runs at all.
    pub enabled: bool,
    /// Whether stacks absent from the desired state are torn down.
    pub remove_enabled: bool,
    pub drift_policy: DriftPolicy,
}

impl Default for ReconciliationPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            remove_enabled: false,
            drift_policy: DriftPolicy::Revert,
        }
    }
}
