//! Trigger rules and the evaluator that turns raw show signals into
//! confidence-scored candidate actions.

use anyhow::{bail, Result};
use chrono::{DateTime, Datelike, FixedOffset, NaiveTime, Offset, Timelike, Utc};
use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::sync::OnceLock;

use super::types::{
    clamp_confidence, clamp_priority, ActionType, CandidateAction, Priority, TriggerType,
    PRIORITY_EMERGENCY, PRIORITY_NORMAL,
};
use crate::datastore::ChangeKind;

pub const DEFAULT_CONTEXT_CONFIDENCE: f64 = 0.7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeywordMatch {
    #[default]
    Any,
    All,
    Exact,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerReference {
    ShowStart,
    SegmentStart,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TriggerCondition {
    Keyword {
        keywords: Vec<String>,
        #[serde(default)]
        match_type: KeywordMatch,
        #[serde(default)]
        case_sensitive: bool,
    },
    Timer {
        reference: TimerReference,
        offset_seconds: u64,
    },
    Context {
        #[serde(default)]
        sentiment: Option<String>,
        #[serde(default)]
        topic: Option<String>,
        #[serde(default)]
        engagement: Option<String>,
        #[serde(default)]
        confidence_min: Option<f64>,
    },
    Event {
        event_source: String,
        #[serde(default = "wildcard")]
        event_type: String,
        #[serde(default)]
        filters: Map<String, Value>,
    },
    QuestionMark,
    Pause {
        min_silence_seconds: u64,
    },
}

fn wildcard() -> String {
    "*".to_string()
}

impl TriggerCondition {
    pub fn trigger_type(&self) -> TriggerType {
        match self {
            TriggerCondition::Keyword { .. } => TriggerType::Keyword,
            TriggerCondition::Timer { .. } => TriggerType::TimeBased,
            TriggerCondition::Context {
                sentiment: Some(_), ..
            } => TriggerType::Sentiment,
            TriggerCondition::Context { .. } => TriggerType::Context,
            TriggerCondition::Event { .. } => TriggerType::Event,
            TriggerCondition::QuestionMark => TriggerType::QuestionMark,
            TriggerCondition::Pause { .. } => TriggerType::Pause,
        }
    }
}

/// Operator-authored rule. Read by the evaluator, mutated only through
/// explicit edits (and the per-show execution counter).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerRule {
    /// Assigned on create when left empty.
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_rule_priority")]
    pub priority: Priority,
    pub condition: TriggerCondition,
    #[serde(default)]
    pub confidence_boost: f64,
    pub action_type: ActionType,
    #[serde(default)]
    pub action_params: Value,
    #[serde(default)]
    pub require_operator_approval: bool,
    #[serde(default)]
    pub max_executions_per_show: Option<u32>,
    #[serde(default)]
    pub current_execution_count: u32,
    /// 0 = Sunday. Empty means every day.
    #[serde(default)]
    pub active_days: Vec<u8>,
    #[serde(default)]
    pub active_time_start: Option<NaiveTime>,
    #[serde(default)]
    pub active_time_end: Option<NaiveTime>,
    #[serde(default)]
    pub show_id: Option<String>,
    #[serde(default)]
    pub preset_id: Option<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_true() -> bool {
    true
}

fn default_rule_priority() -> Priority {
    PRIORITY_NORMAL
}

impl TriggerRule {
    pub fn new(name: impl Into<String>, condition: TriggerCondition, action_type: ActionType) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            description: None,
            enabled: true,
            priority: PRIORITY_NORMAL,
            condition,
            confidence_boost: 0.0,
            action_type,
            action_params: Value::Object(Map::new()),
            require_operator_approval: false,
            max_executions_per_show: None,
            current_execution_count: 0,
            active_days: Vec::new(),
            active_time_start: None,
            active_time_end: None,
            show_id: None,
            preset_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn trigger_type(&self) -> TriggerType {
        self.condition.trigger_type()
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            bail!("rule name cannot be empty");
        }
        if !(0.0..=1.0).contains(&self.confidence_boost) {
            bail!(
                "confidence_boost must be within [0, 1], got {}",
                self.confidence_boost
            );
        }
        if let Some(day) = self.active_days.iter().find(|day| **day > 6) {
            bail!("active_days entries must be 0-6, got {}", day);
        }
        match &self.condition {
            TriggerCondition::Keyword { keywords, .. }
                if keywords.iter().all(|keyword| keyword.trim().is_empty()) =>
            {
                bail!("keyword rule needs at least one keyword");
            }
            TriggerCondition::Event { event_source, .. } if event_source.trim().is_empty() => {
                bail!("event rule needs an event_source table");
            }
            TriggerCondition::Context {
                confidence_min: Some(value),
                ..
            } if !(0.0..=1.0).contains(value) => {
                bail!("confidence_min must be within [0, 1], got {}", value);
            }
            _ => {}
        }
        Ok(())
    }
}

/// Which show/preset the director is currently running. Rules scoped to a
/// different show or preset stay quiet.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleScope {
    #[serde(default)]
    pub show_id: Option<String>,
    #[serde(default)]
    pub preset_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversationContext {
    #[serde(default)]
    pub sentiment: Option<String>,
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub engagement: Option<String>,
}

/// The slice of show time covered by one tick. A timer fires when its offset
/// falls in `(previous, now]` relative to its reference point.
#[derive(Debug, Clone, Copy)]
pub struct TimerWindow {
    pub show_start: Option<DateTime<Utc>>,
    pub segment_start: Option<DateTime<Utc>>,
    pub previous: DateTime<Utc>,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct TriggerEvaluator {
    utc_offset: FixedOffset,
}

impl Default for TriggerEvaluator {
    fn default() -> Self {
        Self::new(Utc.fix())
    }
}

impl TriggerEvaluator {
    /// `utc_offset` is the studio's local offset, used for active days and
    /// active time windows.
    pub fn new(utc_offset: FixedOffset) -> Self {
        Self { utc_offset }
    }

    pub fn from_offset_minutes(minutes: i32) -> Self {
        let offset = FixedOffset::east_opt(minutes.saturating_mul(60)).unwrap_or_else(|| Utc.fix());
        Self::new(offset)
    }

    pub fn is_rule_active(&self, rule: &TriggerRule, now: DateTime<Utc>, scope: &RuleScope) -> bool {
        if !rule.enabled {
            return false;
        }

        if let Some(show_id) = rule.show_id.as_deref() {
            if scope.show_id.as_deref() != Some(show_id) {
                return false;
            }
        }
        if let Some(preset_id) = rule.preset_id.as_deref() {
            if scope.preset_id.as_deref() != Some(preset_id) {
                return false;
            }
        }

        let local = now.with_timezone(&self.utc_offset);
        if !rule.active_days.is_empty() {
            let today = local.weekday().num_days_from_sunday() as u8;
            if !rule.active_days.contains(&today) {
                return false;
            }
        }

        if let (Some(start), Some(end)) = (rule.active_time_start, rule.active_time_end) {
            let current = NaiveTime::from_hms_opt(local.hour(), local.minute(), local.second())
                .unwrap_or(NaiveTime::MIN);
            let inside = if start <= end {
                current >= start && current <= end
            } else {
                // Window crosses midnight.
                current >= start || current <= end
            };
            if !inside {
                return false;
            }
        }

        if let Some(max) = rule.max_executions_per_show {
            if rule.current_execution_count >= max {
                return false;
            }
        }

        true
    }

    /// Keyword and question-mark rules. Base confidence is the transcription
    /// confidence; the rule's boost is added on top.
    pub fn evaluate_transcript(
        &self,
        rule: &TriggerRule,
        transcript: &str,
        transcript_confidence: f64,
    ) -> Option<CandidateAction> {
        match &rule.condition {
            TriggerCondition::Keyword {
                keywords,
                match_type,
                case_sensitive,
            } => {
                let matched = match_keywords(transcript, keywords, *match_type, *case_sensitive)?;
                Some(candidate_from_rule(
                    rule,
                    transcript_confidence,
                    json!({
                        "transcript": transcript,
                        "matched_keywords": matched,
                    }),
                    "transcript",
                ))
            }
            TriggerCondition::QuestionMark => {
                if !transcript.trim_end().ends_with('?') {
                    return None;
                }
                Some(candidate_from_rule(
                    rule,
                    transcript_confidence,
                    json!({ "transcript": transcript }),
                    "transcript",
                ))
            }
            _ => None,
        }
    }

    pub fn evaluate_context(
        &self,
        rule: &TriggerRule,
        context: &ConversationContext,
    ) -> Option<CandidateAction> {
        let TriggerCondition::Context {
            sentiment,
            topic,
            engagement,
            confidence_min,
        } = &rule.condition
        else {
            return None;
        };

        for (wanted, actual) in [
            (sentiment, &context.sentiment),
            (topic, &context.topic),
            (engagement, &context.engagement),
        ] {
            if wanted.is_some() && wanted != actual {
                return None;
            }
        }

        let base = confidence_min.unwrap_or(DEFAULT_CONTEXT_CONFIDENCE);
        Some(candidate_from_rule(
            rule,
            base,
            serde_json::to_value(context).unwrap_or(Value::Null),
            "context_analysis",
        ))
    }

    /// Row changes on a watched table. Filters are exact equality on row fields.
    pub fn evaluate_event(
        &self,
        rule: &TriggerRule,
        table: &str,
        kind: ChangeKind,
        row: &Value,
    ) -> Option<CandidateAction> {
        let TriggerCondition::Event {
            event_source,
            event_type,
            filters,
        } = &rule.condition
        else {
            return None;
        };

        if event_source != table {
            return None;
        }
        if event_type != "*" && event_type != kind.as_str() {
            return None;
        }
        if filters.iter().any(|(key, value)| row.get(key) != Some(value)) {
            return None;
        }

        Some(candidate_from_rule(
            rule,
            1.0,
            json!({
                "event_source": table,
                "event_type": kind.as_str(),
                "event_data": row,
            }),
            table,
        ))
    }

    pub fn evaluate_timer(&self, rule: &TriggerRule, window: &TimerWindow) -> Option<CandidateAction> {
        let TriggerCondition::Timer {
            reference,
            offset_seconds,
        } = &rule.condition
        else {
            return None;
        };

        let reference_time = match reference {
            TimerReference::ShowStart => window.show_start?,
            TimerReference::SegmentStart => window.segment_start?,
        };

        let target_ms = i64::try_from(*offset_seconds)
            .unwrap_or(i64::MAX)
            .saturating_mul(1000);
        let previous_ms = (window.previous - reference_time).num_milliseconds();
        let elapsed_ms = (window.now - reference_time).num_milliseconds();
        // The first window after the reference instant includes the instant itself.
        let after_previous = previous_ms < target_ms || (previous_ms == 0 && target_ms == 0);
        if !(after_previous && target_ms <= elapsed_ms && previous_ms < elapsed_ms) {
            return None;
        }

        Some(candidate_from_rule(
            rule,
            1.0,
            json!({
                "reference": reference,
                "elapsed_seconds": elapsed_ms / 1000,
                "target_seconds": offset_seconds,
            }),
            "timer",
        ))
    }

    pub fn evaluate_pause(&self, rule: &TriggerRule, silence_seconds: u64) -> Option<CandidateAction> {
        let TriggerCondition::Pause {
            min_silence_seconds,
        } = &rule.condition
        else {
            return None;
        };
        if silence_seconds < *min_silence_seconds {
            return None;
        }
        Some(candidate_from_rule(
            rule,
            1.0,
            json!({
                "silence_seconds": silence_seconds,
                "min_silence_seconds": min_silence_seconds,
            }),
            "transcript",
        ))
    }

    /// Operator command. Full trust unless the caller says otherwise.
    pub fn manual(
        &self,
        action_type: ActionType,
        params: Value,
        context: Value,
        confidence: Option<f64>,
    ) -> CandidateAction {
        CandidateAction {
            action_type,
            trigger_type: TriggerType::Manual,
            params,
            trigger_data: context,
            confidence: clamp_confidence(confidence.unwrap_or(1.0)),
            priority: PRIORITY_EMERGENCY,
            requires_approval: false,
            rule_id: None,
            source: "operator".to_string(),
        }
    }
}

fn candidate_from_rule(rule: &TriggerRule, base: f64, trigger_data: Value, source: &str) -> CandidateAction {
    CandidateAction {
        action_type: rule.action_type,
        trigger_type: rule.trigger_type(),
        params: rule.action_params.clone(),
        trigger_data,
        confidence: clamp_confidence(base + rule.confidence_boost),
        priority: clamp_priority(rule.priority),
        requires_approval: rule.require_operator_approval,
        rule_id: Some(rule.id.clone()),
        source: source.to_string(),
    }
}

/// Returns the matched keywords, or `None` when the rule does not fire.
fn match_keywords(
    transcript: &str,
    keywords: &[String],
    match_type: KeywordMatch,
    case_sensitive: bool,
) -> Option<Vec<String>> {
    let normalize = |value: &str| {
        if case_sensitive {
            value.to_string()
        } else {
            value.to_lowercase()
        }
    };
    let text = normalize(transcript);
    let wanted: Vec<String> = keywords
        .iter()
        .map(|keyword| normalize(keyword.trim()))
        .filter(|keyword| !keyword.is_empty())
        .collect();
    if wanted.is_empty() {
        return None;
    }

    let matched: Vec<String> = match match_type {
        KeywordMatch::Exact => wanted
            .iter()
            .filter(|keyword| text.trim() == keyword.as_str())
            .cloned()
            .collect(),
        KeywordMatch::Any | KeywordMatch::All => wanted
            .iter()
            .filter(|keyword| text.contains(keyword.as_str()))
            .cloned()
            .collect(),
    };

    let fired = match match_type {
        KeywordMatch::All => matched.len() == wanted.len(),
        KeywordMatch::Any | KeywordMatch::Exact => !matched.is_empty(),
    };
    fired.then_some(matched)
}

const STOP_WORDS: &[&str] = &["the", "a", "an", "and", "or", "but", "in", "on", "at", "to", "for"];

fn punctuation() -> Option<&'static Regex> {
    static PUNCTUATION: OnceLock<Option<Regex>> = OnceLock::new();
    PUNCTUATION
        .get_or_init(|| Regex::new(r"[^\w\s]").ok())
        .as_ref()
}

/// Candidate keywords for rule authoring: lowercase words longer than three
/// characters, punctuation stripped, stop words and duplicates dropped.
pub fn extract_potential_keywords(text: &str) -> Vec<String> {
    let lowered = text.to_lowercase();
    let stripped = match punctuation() {
        Some(re) => re.replace_all(&lowered, "").into_owned(),
        None => lowered
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || c.is_whitespace())
            .collect(),
    };

    let mut seen = HashSet::new();
    stripped
        .split_whitespace()
        .filter(|word| word.chars().count() > 3 && !STOP_WORDS.contains(word))
        .filter(|word| seen.insert(word.to_string()))
        .map(str::to_string)
        .collect()
}
