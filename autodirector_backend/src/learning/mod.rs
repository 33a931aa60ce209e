//! Learning from operator feedback.
//!
//! The engine works on a snapshot of automation events (replaced wholesale by
//! [`LearningEngine::ingest_events`]) and answers three questions: how is the
//! director doing ([`LearningMetrics`]), how much should a candidate's
//! confidence move given past verdicts for its action type
//! ([`ConfidenceAdjustment`]), and which thresholds should the operator
//! retune ([`OptimizationRecommendation`]).

pub mod metrics;
pub mod recommendations;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::automation::config::AutomationConfig;
use crate::automation::types::{ActionType, AutomationEvent, OperatorAction, TriggerType};

pub use metrics::{ActionTypeMetrics, LearningMetrics, TriggerTypeMetrics};
pub use recommendations::{
    OptimizationRecommendation, RecommendationKind, RecommendationPriority,
};

pub const DEFAULT_LEARNING_RATE: f64 = 0.1;
pub const MIN_EVENTS_FOR_LEARNING: usize = 10;
pub const DEFAULT_HISTORY_LIMIT: usize = 1000;
pub const INSUFFICIENT_DATA_REASON: &str = "insufficient data for learning";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceAdjustment {
    pub action_type: ActionType,
    pub trigger_type: TriggerType,
    pub original_confidence: f64,
    pub adjusted_confidence: f64,
    pub reason: String,
    pub adjustment: f64,
}

pub struct LearningEngine {
    events: Vec<AutomationEvent>,
    adjustment_history: VecDeque<ConfidenceAdjustment>,
    history_limit: usize,
    learning_rate: f64,
}

impl Default for LearningEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl LearningEngine {
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
            adjustment_history: VecDeque::new(),
            history_limit: DEFAULT_HISTORY_LIMIT,
            learning_rate: DEFAULT_LEARNING_RATE,
        }
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit.max(1);
        self
    }

    pub fn ingest_events(&mut self, events: Vec<AutomationEvent>) {
        tracing::debug!("Learning engine ingested {} events", events.len());
        self.events = events;
    }

    pub fn events(&self) -> &[AutomationEvent] {
        &self.events
    }

    pub fn calculate_metrics(&self, now: DateTime<Utc>) -> LearningMetrics {
        LearningMetrics::compute(&self.events, now)
    }

    /// Nudge `original_confidence` using past operator verdicts for
    /// `action_type`. Every call lands in the adjustment history.
    pub fn adjust_confidence(
        &mut self,
        action_type: ActionType,
        original_confidence: f64,
        trigger_type: TriggerType,
    ) -> ConfidenceAdjustment {
        let verdicts: Vec<&AutomationEvent> = self
            .events
            .iter()
            .filter(|e| e.action_type == action_type && e.operator_action.is_some())
            .collect();

        let result = if verdicts.len() < MIN_EVENTS_FOR_LEARNING {
            ConfidenceAdjustment {
                action_type,
                trigger_type,
                original_confidence,
                adjusted_confidence: original_confidence,
                reason: INSUFFICIENT_DATA_REASON.to_string(),
                adjustment: 0.0,
            }
        } else {
            let approved: Vec<f64> = verdicts
                .iter()
                .filter(|e| e.operator_action == Some(OperatorAction::Approved))
                .map(|e| e.confidence)
                .collect();
            let rejected: Vec<f64> = verdicts
                .iter()
                .filter(|e| e.operator_action == Some(OperatorAction::Rejected))
                .map(|e| e.confidence)
                .collect();
            let approval_rate = approved.len() as f64 / (approved.len() + rejected.len()) as f64;
            let avg = |values: &[f64]| {
                if values.is_empty() {
                    0.0
                } else {
                    values.iter().sum::<f64>() / values.len() as f64
                }
            };
            let avg_approved = avg(&approved);
            let avg_rejected = avg(&rejected);

            let (adjustment, reason) = if approval_rate > 0.8 {
                (
                    self.learning_rate * 0.15,
                    format!(
                        "High approval rate ({}%) for {}",
                        (approval_rate * 100.0).round(),
                        action_type
                    ),
                )
            } else if approval_rate < 0.4 {
                (
                    -self.learning_rate * 0.15,
                    format!(
                        "High rejection rate ({}%) for {}",
                        ((1.0 - approval_rate) * 100.0).round(),
                        action_type
                    ),
                )
            } else if original_confidence < avg_approved {
                (
                    self.learning_rate * 0.05,
                    "Confidence similar to approved suggestions".to_string(),
                )
            } else if original_confidence > avg_rejected && rejected.len() > 5 {
                (
                    -self.learning_rate * 0.05,
                    "Confidence similar to rejected suggestions".to_string(),
                )
            } else {
                (0.0, "No adjustment needed".to_string())
            };

            ConfidenceAdjustment {
                action_type,
                trigger_type,
                original_confidence,
                adjusted_confidence: (original_confidence + adjustment).clamp(0.0, 1.0),
                reason,
                adjustment,
            }
        };

        self.adjustment_history.push_back(result.clone());
        while self.adjustment_history.len() > self.history_limit {
            self.adjustment_history.pop_front();
        }
        result
    }

    pub fn generate_recommendations(
        &self,
        config: &AutomationConfig,
        now: DateTime<Utc>,
    ) -> Vec<OptimizationRecommendation> {
        recommendations::generate(&self.calculate_metrics(now), config)
    }

    pub fn export_metrics_csv(&self, now: DateTime<Utc>) -> String {
        self.calculate_metrics(now).to_csv()
    }

    pub fn export_events_json(&self) -> Result<String> {
        serde_json::to_string_pretty(&self.events).context("failed to serialize automation events")
    }

    pub fn adjustment_history(&self) -> Vec<ConfidenceAdjustment> {
        self.adjustment_history.iter().cloned().collect()
    }

    pub fn set_learning_rate(&mut self, rate: f64) {
        self.learning_rate = if rate.is_nan() { 0.0 } else { rate.clamp(0.0, 1.0) };
    }

    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }
}
