use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::types::ActionType;

pub const DEFAULT_AUTO_EXECUTE_THRESHOLD: f64 = 0.85;
pub const DEFAULT_SUGGEST_THRESHOLD: f64 = 0.60;
/// Upper bound for `cooldown_seconds`: one day.
pub const MAX_COOLDOWN_SECONDS: u64 = 24 * 60 * 60;
/// Upper bound for `suggestion_ttl_secs`: one day.
pub const MAX_SUGGESTION_TTL_SECS: u64 = 24 * 60 * 60;

/// Operator-tunable routing state. Persisted in the datastore and re-read on
/// every decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutomationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub auto_execute_enabled: bool,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub emergency_stop: bool,
    #[serde(default = "default_auto_execute_threshold")]
    pub auto_execute_threshold: f64,
    #[serde(default = "default_suggest_threshold")]
    pub suggest_threshold: f64,
    #[serde(default = "default_allowed_action_types")]
    pub allowed_action_types: BTreeSet<ActionType>,
    #[serde(default)]
    pub require_confirmation_for: BTreeSet<ActionType>,
    #[serde(default = "default_max_actions_per_minute")]
    pub max_actions_per_minute: u32,
    #[serde(default = "default_cooldown_seconds")]
    pub cooldown_seconds: u64,
    /// Pending suggestions older than this settle as skipped. `None` keeps them forever.
    #[serde(default)]
    pub suggestion_ttl_secs: Option<u64>,
    /// Feed learned confidence adjustments into routing.
    #[serde(default)]
    pub apply_learned_confidence: bool,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_true() -> bool {
    true
}

fn default_auto_execute_threshold() -> f64 {
    DEFAULT_AUTO_EXECUTE_THRESHOLD
}

fn default_suggest_threshold() -> f64 {
    DEFAULT_SUGGEST_THRESHOLD
}

fn default_allowed_action_types() -> BTreeSet<ActionType> {
    ActionType::ALL.iter().copied().collect()
}

fn default_max_actions_per_minute() -> u32 {
    10
}

fn default_cooldown_seconds() -> u64 {
    5
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_execute_enabled: false,
            dry_run: false,
            emergency_stop: false,
            auto_execute_threshold: default_auto_execute_threshold(),
            suggest_threshold: default_suggest_threshold(),
            allowed_action_types: default_allowed_action_types(),
            require_confirmation_for: BTreeSet::new(),
            max_actions_per_minute: default_max_actions_per_minute(),
            cooldown_seconds: default_cooldown_seconds(),
            suggestion_ttl_secs: None,
            apply_learned_confidence: false,
            updated_at: Utc::now(),
        }
    }
}

impl AutomationConfig {
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("auto_execute_threshold", self.auto_execute_threshold),
            ("suggest_threshold", self.suggest_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                bail!("{} must be within [0, 1], got {}", name, value);
            }
        }
        if self.suggest_threshold > self.auto_execute_threshold {
            bail!(
                "suggest_threshold ({}) must not exceed auto_execute_threshold ({})",
                self.suggest_threshold,
                self.auto_execute_threshold
            );
        }
        if self.max_actions_per_minute == 0 {
            bail!("max_actions_per_minute must be at least 1");
        }
        if self.cooldown_seconds > MAX_COOLDOWN_SECONDS {
            bail!(
                "cooldown_seconds must be at most {}, got {}",
                MAX_COOLDOWN_SECONDS,
                self.cooldown_seconds
            );
        }
        if let Some(ttl) = self.suggestion_ttl_secs {
            if ttl > MAX_SUGGESTION_TTL_SECS {
                bail!(
                    "suggestion_ttl_secs must be at most {}, got {}",
                    MAX_SUGGESTION_TTL_SECS,
                    ttl
                );
            }
        }
        Ok(())
    }

    pub fn allows(&self, action: ActionType) -> bool {
        self.allowed_action_types.contains(&action)
    }

    /// Effective suggest threshold. A stored config that slipped past
    /// validation with an inverted band gets an empty suggest band.
    pub fn effective_suggest_threshold(&self) -> f64 {
        self.suggest_threshold.min(self.auto_execute_threshold)
    }

    /// Apply a partial update, returning the validated result without
    /// touching `self` if validation fails.
    pub fn patched(&self, patch: &AutomationConfigPatch, now: DateTime<Utc>) -> Result<Self> {
        let mut next = self.clone();
        if let Some(value) = patch.enabled {
            next.enabled = value;
        }
        if let Some(value) = patch.auto_execute_enabled {
            next.auto_execute_enabled = value;
        }
        if let Some(value) = patch.dry_run {
            next.dry_run = value;
        }
        if let Some(value) = patch.emergency_stop {
            next.emergency_stop = value;
        }
        if let Some(value) = patch.auto_execute_threshold {
            next.auto_execute_threshold = value;
        }
        if let Some(value) = patch.suggest_threshold {
            next.suggest_threshold = value;
        }
        if let Some(value) = &patch.allowed_action_types {
            next.allowed_action_types = value.clone();
        }
        if let Some(value) = &patch.require_confirmation_for {
            next.require_confirmation_for = value.clone();
        }
        if let Some(value) = patch.max_actions_per_minute {
            next.max_actions_per_minute = value;
        }
        if let Some(value) = patch.cooldown_seconds {
            next.cooldown_seconds = value;
        }
        if let Some(value) = patch.suggestion_ttl_secs {
            next.suggestion_ttl_secs = if value == 0 { None } else { Some(value) };
        }
        if let Some(value) = patch.apply_learned_confidence {
            next.apply_learned_confidence = value;
        }
        next.validate()?;
        next.updated_at = now;
        Ok(next)
    }
}

/// Partial operator edit. `suggestion_ttl_secs = 0` clears the TTL.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AutomationConfigPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_execute_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dry_run: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emergency_stop: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_execute_threshold: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggest_threshold: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_action_types: Option<BTreeSet<ActionType>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub require_confirmation_for: Option<BTreeSet<ActionType>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_actions_per_minute: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooldown_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion_ttl_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apply_learned_confidence: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid_and_allows_everything() {
        let config = AutomationConfig::default();
        config.validate().unwrap();
        assert!(ActionType::ALL.iter().all(|action| config.allows(*action)));
        assert!(!config.auto_execute_enabled);
    }

    #[test]
    fn inverted_thresholds_are_rejected_at_write_time() {
        let config = AutomationConfig::default();
        let patch = AutomationConfigPatch {
            suggest_threshold: Some(0.9),
            auto_execute_threshold: Some(0.8),
            ..Default::default()
        };
        let err = config.patched(&patch, Utc::now()).unwrap_err();
        assert!(err.to_string().contains("must not exceed"));
    }

    #[test]
    fn out_of_range_threshold_is_rejected() {
        let config = AutomationConfig::default();
        let patch = AutomationConfigPatch {
            auto_execute_threshold: Some(1.2),
            ..Default::default()
        };
        assert!(config.patched(&patch, Utc::now()).is_err());
    }

    #[test]
    fn oversized_ttl_and_cooldown_are_rejected() {
        let config = AutomationConfig::default();
        let patch = AutomationConfigPatch {
            suggestion_ttl_secs: Some(100_000_000_000_000_000),
            ..Default::default()
        };
        let err = config.patched(&patch, Utc::now()).unwrap_err();
        assert!(err.to_string().contains("suggestion_ttl_secs"));

        let patch = AutomationConfigPatch {
            cooldown_seconds: Some(u64::MAX),
            ..Default::default()
        };
        let err = config.patched(&patch, Utc::now()).unwrap_err();
        assert!(err.to_string().contains("cooldown_seconds"));

        let patch = AutomationConfigPatch {
            suggestion_ttl_secs: Some(MAX_SUGGESTION_TTL_SECS),
            cooldown_seconds: Some(MAX_COOLDOWN_SECONDS),
            ..Default::default()
        };
        let next = config.patched(&patch, Utc::now()).unwrap();
        assert_eq!(next.suggestion_ttl_secs, Some(MAX_SUGGESTION_TTL_SECS));
    }

    #[test]
    fn patch_updates_only_given_fields() {
        let config = AutomationConfig::default();
        let patch = AutomationConfigPatch {
            auto_execute_enabled: Some(true),
            suggest_threshold: Some(0.5),
            suggestion_ttl_secs: Some(120),
            ..Default::default()
        };
        let next = config.patched(&patch, Utc::now()).unwrap();
        assert!(next.auto_execute_enabled);
        assert_eq!(next.suggest_threshold, 0.5);
        assert_eq!(next.auto_execute_threshold, DEFAULT_AUTO_EXECUTE_THRESHOLD);
        assert_eq!(next.suggestion_ttl_secs, Some(120));

        let cleared = next
            .patched(
                &AutomationConfigPatch {
                    suggestion_ttl_secs: Some(0),
                    ..Default::default()
                },
                Utc::now(),
            )
            .unwrap();
        assert_eq!(cleared.suggestion_ttl_secs, None);
    }

    #[test]
    fn inverted_stored_config_collapses_suggest_band() {
        let config = AutomationConfig {
            auto_execute_threshold: 0.7,
            suggest_threshold: 0.9,
            ..Default::default()
        };
        assert_eq!(config.effective_suggest_threshold(), 0.7);
    }
}
