use chrono::{DateTime, Datelike, Duration as ChronoDuration, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;

use crate::automation::types::{
    ActionType, AutomationEvent, ExecutionMode, OperatorAction, Outcome, TriggerType,
};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionTypeMetrics {
    pub total: usize,
    pub executed: usize,
    pub approved: usize,
    pub rejected: usize,
    pub failed: usize,
    pub avg_confidence: f64,
    pub success_rate: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TriggerTypeMetrics {
    pub total: usize,
    pub executed: usize,
    pub avg_confidence: f64,
    pub success_rate: f64,
}

/// Descriptive statistics over an event snapshot. Every rate is a fraction of
/// the total and is zero for an empty snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningMetrics {
    pub total_events: usize,
    pub approval_rate: f64,
    pub rejection_rate: f64,
    pub auto_execution_rate: f64,
    pub success_rate: f64,
    pub failure_rate: f64,
    pub avg_confidence_approved: f64,
    pub avg_confidence_rejected: f64,
    pub avg_execution_time_ms: f64,
    pub events_today: usize,
    pub events_this_week: usize,
    pub events_this_month: usize,
    pub performance_by_action_type: BTreeMap<ActionType, ActionTypeMetrics>,
    pub performance_by_trigger_type: BTreeMap<TriggerType, TriggerTypeMetrics>,
    /// Index = UTC hour.
    pub hourly_distribution: Vec<usize>,
    /// Index 0 = Sunday.
    pub daily_distribution: Vec<usize>,
}

fn ratio(part: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64
    }
}

fn mean<I: Iterator<Item = f64>>(values: I) -> f64 {
    let (sum, count) = values.fold((0.0, 0usize), |(sum, count), value| (sum + value, count + 1));
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

impl LearningMetrics {
    pub fn compute(events: &[AutomationEvent], now: DateTime<Utc>) -> Self {
        let total = events.len();
        let approved = || {
            events
                .iter()
                .filter(|e| e.operator_action == Some(OperatorAction::Approved))
        };
        let rejected = || {
            events
                .iter()
                .filter(|e| e.operator_action == Some(OperatorAction::Rejected))
        };
        let count_outcome =
            |outcome: Outcome| events.iter().filter(|e| e.outcome == outcome).count();

        let today_start = Utc
            .with_ymd_and_hms(now.year(), now.month(), now.day(), 0, 0, 0)
            .single()
            .unwrap_or(now);
        let week_start = now - ChronoDuration::days(7);
        let month_start = Utc
            .with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
            .single()
            .unwrap_or(now);
        let since = |start: DateTime<Utc>| events.iter().filter(|e| e.created_at >= start).count();

        let auto_executed = events
            .iter()
            .filter(|e| e.execution_mode == ExecutionMode::Auto && e.outcome == Outcome::Executed)
            .count();

        let mut hourly_distribution = vec![0; 24];
        let mut daily_distribution = vec![0; 7];
        for event in events {
            hourly_distribution[event.created_at.hour() as usize] += 1;
            daily_distribution[event.created_at.weekday().num_days_from_sunday() as usize] += 1;
        }

        Self {
            total_events: total,
            approval_rate: ratio(approved().count(), total),
            rejection_rate: ratio(rejected().count(), total),
            auto_execution_rate: ratio(auto_executed, total),
            success_rate: ratio(count_outcome(Outcome::Executed), total),
            failure_rate: ratio(count_outcome(Outcome::Failed), total),
            avg_confidence_approved: mean(approved().map(|e| e.confidence)),
            avg_confidence_rejected: mean(rejected().map(|e| e.confidence)),
            avg_execution_time_ms: mean(
                events
                    .iter()
                    .filter_map(|e| e.execution_time_ms)
                    .map(|ms| ms as f64),
            ),
            events_today: since(today_start),
            events_this_week: since(week_start),
            events_this_month: since(month_start),
            performance_by_action_type: by_action_type(events),
            performance_by_trigger_type: by_trigger_type(events),
            hourly_distribution,
            daily_distribution,
        }
    }

    /// Summary table followed by the per-action breakdown.
    pub fn to_csv(&self) -> String {
        let pct = |value: f64| format!("{:.2}%", value * 100.0);
        let mut csv = String::from("Metric,Value\n");
        let rows = [
            ("Total Events", self.total_events.to_string()),
            ("Approval Rate", pct(self.approval_rate)),
            ("Rejection Rate", pct(self.rejection_rate)),
            ("Auto-Execution Rate", pct(self.auto_execution_rate)),
            ("Success Rate", pct(self.success_rate)),
            ("Failure Rate", pct(self.failure_rate)),
            ("Avg Confidence (Approved)", pct(self.avg_confidence_approved)),
            ("Avg Confidence (Rejected)", pct(self.avg_confidence_rejected)),
            (
                "Avg Execution Time",
                format!("{:.2}ms", self.avg_execution_time_ms),
            ),
            ("Events Today", self.events_today.to_string()),
            ("Events This Week", self.events_this_week.to_string()),
            ("Events This Month", self.events_this_month.to_string()),
        ];
        for (name, value) in rows {
            let _ = writeln!(csv, "{},{}", name, value);
        }

        csv.push_str(
            "\nAction Type,Total,Executed,Approved,Rejected,Failed,Avg Confidence,Success Rate\n",
        );
        for (action_type, data) in &self.performance_by_action_type {
            let _ = writeln!(
                csv,
                "{},{},{},{},{},{},{},{}",
                action_type,
                data.total,
                data.executed,
                data.approved,
                data.rejected,
                data.failed,
                pct(data.avg_confidence),
                pct(data.success_rate)
            );
        }
        csv
    }
}

fn by_action_type(events: &[AutomationEvent]) -> BTreeMap<ActionType, ActionTypeMetrics> {
    let mut grouped: BTreeMap<ActionType, Vec<&AutomationEvent>> = BTreeMap::new();
    for event in events {
        grouped.entry(event.action_type).or_default().push(event);
    }

    grouped
        .into_iter()
        .map(|(action_type, group)| {
            let total = group.len();
            let executed = group.iter().filter(|e| e.outcome == Outcome::Executed).count();
            let metrics = ActionTypeMetrics {
                total,
                executed,
                approved: group
                    .iter()
                    .filter(|e| e.operator_action == Some(OperatorAction::Approved))
                    .count(),
                rejected: group
                    .iter()
                    .filter(|e| e.operator_action == Some(OperatorAction::Rejected))
                    .count(),
                failed: group.iter().filter(|e| e.outcome == Outcome::Failed).count(),
                avg_confidence: mean(group.iter().map(|e| e.confidence)),
                success_rate: ratio(executed, total),
            };
            (action_type, metrics)
        })
        .collect()
}

fn by_trigger_type(events: &[AutomationEvent]) -> BTreeMap<TriggerType, TriggerTypeMetrics> {
    let mut grouped: BTreeMap<TriggerType, Vec<&AutomationEvent>> = BTreeMap::new();
    for event in events {
        grouped.entry(event.trigger_type).or_default().push(event);
    }

    grouped
        .into_iter()
        .map(|(trigger_type, group)| {
            let total = group.len();
            let executed = group.iter().filter(|e| e.outcome == Outcome::Executed).count();
            let metrics = TriggerTypeMetrics {
                total,
                executed,
                avg_confidence: mean(group.iter().map(|e| e.confidence)),
                success_rate: ratio(executed, total),
            };
            (trigger_type, metrics)
        })
        .collect()
}
