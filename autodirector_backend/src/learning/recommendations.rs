use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::cmp::Ordering;

use super::metrics::LearningMetrics;
use crate::automation::config::AutomationConfig;

pub const AUTO_THRESHOLD_FLOOR: f64 = 0.75;
pub const SUGGEST_THRESHOLD_CEILING: f64 = 0.75;
pub const THRESHOLD_STEP: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationKind {
    ThresholdIncrease,
    ThresholdDecrease,
    EnableAuto,
    DisableAuto,
    ActionFilter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationPriority {
    Low,
    Medium,
    High,
}

/// A tuning suggestion. Derived on demand, never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationRecommendation {
    pub kind: RecommendationKind,
    pub priority: RecommendationPriority,
    pub title: String,
    pub description: String,
    pub current_value: Value,
    pub suggested_value: Value,
    pub impact: String,
    pub confidence: f64,
}

fn percent(rate: f64) -> i64 {
    (rate * 100.0).round() as i64
}

/// Each rule is independent; the result is ordered by priority, then by the
/// recommendation's own confidence.
pub fn generate(metrics: &LearningMetrics, config: &AutomationConfig) -> Vec<OptimizationRecommendation> {
    let mut recommendations = Vec::new();
    let total = metrics.total_events;

    if metrics.approval_rate > 0.9 && total > 50 && config.auto_execute_threshold > AUTO_THRESHOLD_FLOOR {
        recommendations.push(OptimizationRecommendation {
            kind: RecommendationKind::ThresholdDecrease,
            priority: RecommendationPriority::High,
            title: "Lower Auto-Execute Threshold".to_string(),
            description: format!(
                "You're approving {}% of suggestions. Consider lowering the auto-execute threshold to reduce manual approvals.",
                percent(metrics.approval_rate)
            ),
            current_value: json!(config.auto_execute_threshold),
            suggested_value: json!(AUTO_THRESHOLD_FLOOR.max(config.auto_execute_threshold - THRESHOLD_STEP)),
            impact: format!(
                "Could auto-execute {}% more actions",
                percent(metrics.approval_rate - 0.9)
            ),
            confidence: 0.85,
        });
    }

    if metrics.rejection_rate > 0.4 && total > 30 {
        recommendations.push(OptimizationRecommendation {
            kind: RecommendationKind::ThresholdIncrease,
            priority: RecommendationPriority::High,
            title: "Increase Approval Threshold".to_string(),
            description: format!(
                "You're rejecting {}% of suggestions. Consider raising the threshold to reduce low-quality suggestions.",
                percent(metrics.rejection_rate)
            ),
            current_value: json!(config.suggest_threshold),
            suggested_value: json!(SUGGEST_THRESHOLD_CEILING.min(config.suggest_threshold + THRESHOLD_STEP)),
            impact: format!(
                "Could reduce approval requests by {}%",
                percent(metrics.rejection_rate)
            ),
            confidence: 0.80,
        });
    }

    if !config.auto_execute_enabled && metrics.approval_rate > 0.85 && total > 40 {
        recommendations.push(OptimizationRecommendation {
            kind: RecommendationKind::EnableAuto,
            priority: RecommendationPriority::Medium,
            title: "Enable Auto-Execution".to_string(),
            description: format!(
                "High approval rate ({}%) suggests the system is making good decisions. Consider enabling auto-execution.",
                percent(metrics.approval_rate)
            ),
            current_value: json!(false),
            suggested_value: json!(true),
            impact: format!(
                "Could automate {}% of suggestions",
                percent(metrics.approval_rate)
            ),
            confidence: 0.75,
        });
    }

    if config.auto_execute_enabled && metrics.failure_rate > 0.15 && total > 20 {
        recommendations.push(OptimizationRecommendation {
            kind: RecommendationKind::DisableAuto,
            priority: RecommendationPriority::High,
            title: "Disable Auto-Execution".to_string(),
            description: format!(
                "High failure rate ({}%) detected. Consider disabling auto-execution until issues are resolved.",
                percent(metrics.failure_rate)
            ),
            current_value: json!(true),
            suggested_value: json!(false),
            impact: "Prevent automatic failures, require manual approval".to_string(),
            confidence: 0.90,
        });
    }

    for (action_type, action) in &metrics.performance_by_action_type {
        if action.total > 10 && action.success_rate < 0.3 {
            recommendations.push(OptimizationRecommendation {
                kind: RecommendationKind::ActionFilter,
                priority: RecommendationPriority::Medium,
                title: format!("Filter {} Actions", action_type),
                description: format!(
                    "Low success rate ({}%) for {}. Consider disabling or adjusting this action type.",
                    percent(action.success_rate),
                    action_type
                ),
                current_value: json!("enabled"),
                suggested_value: json!("disabled"),
                impact: format!("Reduce failed actions by {}", action.failed),
                confidence: 0.70,
            });
        }
    }

    recommendations.sort_by(|a, b| {
        b.priority.cmp(&a.priority).then_with(|| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(Ordering::Equal)
        })
    });
    recommendations
}
