//! Threshold routing: every candidate becomes auto-execute, suggest, or drop.

use serde::{Deserialize, Serialize};

use super::config::AutomationConfig;
use super::types::{clamp_confidence, CandidateAction, ExecutionMode, TriggerType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    NotAllowed,
    EmergencyStop,
    AutomationDisabled,
    BelowThreshold,
}

impl DropReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DropReason::NotAllowed => "action type not allowed",
            DropReason::EmergencyStop => "emergency stop active",
            DropReason::AutomationDisabled => "automation disabled",
            DropReason::BelowThreshold => "below suggest threshold",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "disposition", content = "reason", rename_all = "snake_case")]
pub enum Disposition {
    AutoExecute,
    Suggest,
    Drop(DropReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RouteDecision {
    pub disposition: Disposition,
    pub mode: ExecutionMode,
    pub confidence: f64,
}

pub struct DecisionRouter;

impl DecisionRouter {
    /// Classify `candidate` at `confidence` (already adjusted, if learning is
    /// applied) against the current config.
    ///
    /// Manual triggers skip the thresholds and the enabled/emergency gates but
    /// still respect the allowlist and dry-run.
    pub fn route(
        config: &AutomationConfig,
        candidate: &CandidateAction,
        confidence: f64,
    ) -> RouteDecision {
        let confidence = clamp_confidence(confidence);
        let manual = candidate.trigger_type == TriggerType::Manual;
        let decide = |disposition, mode| RouteDecision {
            disposition,
            mode,
            confidence,
        };
        let dropped_mode = if manual {
            ExecutionMode::Manual
        } else {
            ExecutionMode::Suggested
        };

        if !config.allows(candidate.action_type) {
            return decide(Disposition::Drop(DropReason::NotAllowed), dropped_mode);
        }

        if manual {
            if config.dry_run {
                return decide(Disposition::Suggest, ExecutionMode::Suggested);
            }
            return decide(Disposition::AutoExecute, ExecutionMode::Manual);
        }

        if config.emergency_stop {
            return decide(Disposition::Drop(DropReason::EmergencyStop), dropped_mode);
        }
        if !config.enabled {
            return decide(
                Disposition::Drop(DropReason::AutomationDisabled),
                dropped_mode,
            );
        }

        if confidence < config.effective_suggest_threshold() {
            return decide(Disposition::Drop(DropReason::BelowThreshold), dropped_mode);
        }

        let needs_operator = candidate.requires_approval
            || config
                .require_confirmation_for
                .contains(&candidate.action_type);
        let auto = config.auto_execute_enabled
            && confidence >= config.auto_execute_threshold
            && !needs_operator
            && !config.dry_run;

        if auto {
            decide(Disposition::AutoExecute, ExecutionMode::Auto)
        } else {
            decide(Disposition::Suggest, ExecutionMode::Suggested)
        }
    }
}
