use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 0 = emergency/manual override, 5 = background.
pub type Priority = u8;

pub const PRIORITY_EMERGENCY: Priority = 0;
pub const PRIORITY_CRITICAL: Priority = 1;
pub const PRIORITY_HIGH: Priority = 2;
pub const PRIORITY_NORMAL: Priority = 3;
pub const PRIORITY_LOW: Priority = 4;
pub const PRIORITY_BACKGROUND: Priority = 5;

pub fn clamp_priority(priority: Priority) -> Priority {
    priority.min(PRIORITY_BACKGROUND)
}

pub fn clamp_confidence(confidence: f64) -> f64 {
    if confidence.is_nan() {
        return 0.0;
    }
    confidence.clamp(0.0, 1.0)
}

/// Every action the director knows how to route. Closed so a typo in a rule
/// or allowlist fails at parse time instead of silently never matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ActionType {
    #[serde(rename = "betabot.mood")]
    BetabotMood,
    #[serde(rename = "betabot.movement")]
    BetabotMovement,
    #[serde(rename = "betabot.speaking")]
    BetabotSpeaking,
    #[serde(rename = "obs.scene")]
    ObsScene,
    #[serde(rename = "obs.source.show")]
    ObsSourceShow,
    #[serde(rename = "obs.source.hide")]
    ObsSourceHide,
    #[serde(rename = "obs.transition")]
    ObsTransition,
    #[serde(rename = "graphic.show")]
    GraphicShow,
    #[serde(rename = "graphic.hide")]
    GraphicHide,
    #[serde(rename = "question.indicate")]
    QuestionIndicate,
    #[serde(rename = "soundboard.play")]
    SoundboardPlay,
    #[serde(rename = "segment.switch")]
    SegmentSwitch,
    #[serde(rename = "lower_third.show")]
    LowerThirdShow,
    #[serde(rename = "lower_third.hide")]
    LowerThirdHide,
}

impl ActionType {
    pub const ALL: [ActionType; 14] = [
        ActionType::BetabotMood,
        ActionType::BetabotMovement,
        ActionType::BetabotSpeaking,
        ActionType::ObsScene,
        ActionType::ObsSourceShow,
        ActionType::ObsSourceHide,
        ActionType::ObsTransition,
        ActionType::GraphicShow,
        ActionType::GraphicHide,
        ActionType::QuestionIndicate,
        ActionType::SoundboardPlay,
        ActionType::SegmentSwitch,
        ActionType::LowerThirdShow,
        ActionType::LowerThirdHide,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ActionType::BetabotMood => "betabot.mood",
            ActionType::BetabotMovement => "betabot.movement",
            ActionType::BetabotSpeaking => "betabot.speaking",
            ActionType::ObsScene => "obs.scene",
            ActionType::ObsSourceShow => "obs.source.show",
            ActionType::ObsSourceHide => "obs.source.hide",
            ActionType::ObsTransition => "obs.transition",
            ActionType::GraphicShow => "graphic.show",
            ActionType::GraphicHide => "graphic.hide",
            ActionType::QuestionIndicate => "question.indicate",
            ActionType::SoundboardPlay => "soundboard.play",
            ActionType::SegmentSwitch => "segment.switch",
            ActionType::LowerThirdShow => "lower_third.show",
            ActionType::LowerThirdHide => "lower_third.hide",
        }
    }

    /// Actions whose mutation belongs to the mood arbiter, not the executor.
    pub fn is_mood_action(self) -> bool {
        matches!(self, ActionType::BetabotMood | ActionType::BetabotMovement)
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionType {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        let normalized = raw.trim().to_ascii_lowercase();
        match ActionType::ALL
            .iter()
            .find(|action| action.as_str() == normalized)
        {
            Some(action) => Ok(*action),
            None => bail!("unknown action type '{}'", raw.trim()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Keyword,
    Sentiment,
    Pause,
    QuestionMark,
    #[serde(alias = "timer")]
    TimeBased,
    Manual,
    Event,
    Context,
}

impl TriggerType {
    pub fn as_db_str(self) -> &'static str {
        match self {
            TriggerType::Keyword => "keyword",
            TriggerType::Sentiment => "sentiment",
            TriggerType::Pause => "pause",
            TriggerType::QuestionMark => "question_mark",
            TriggerType::TimeBased => "time_based",
            TriggerType::Manual => "manual",
            TriggerType::Event => "event",
            TriggerType::Context => "context",
        }
    }

    pub fn from_db(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "sentiment" => TriggerType::Sentiment,
            "pause" => TriggerType::Pause,
            "question_mark" => TriggerType::QuestionMark,
            "time_based" | "timer" => TriggerType::TimeBased,
            "manual" => TriggerType::Manual,
            "event" => TriggerType::Event,
            "context" => TriggerType::Context,
            _ => TriggerType::Keyword,
        }
    }
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_db_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Auto,
    Suggested,
    Manual,
}

impl ExecutionMode {
    pub fn as_db_str(self) -> &'static str {
        match self {
            ExecutionMode::Auto => "auto",
            ExecutionMode::Suggested => "suggested",
            ExecutionMode::Manual => "manual",
        }
    }

    pub fn from_db(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "auto" => ExecutionMode::Auto,
            "manual" => ExecutionMode::Manual,
            _ => ExecutionMode::Suggested,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Pending,
    Executed,
    Failed,
    Skipped,
}

impl Outcome {
    pub fn as_db_str(self) -> &'static str {
        match self {
            Outcome::Pending => "pending",
            Outcome::Executed => "executed",
            Outcome::Failed => "failed",
            Outcome::Skipped => "skipped",
        }
    }

    pub fn from_db(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "executed" => Outcome::Executed,
            "failed" => Outcome::Failed,
            "skipped" => Outcome::Skipped,
            _ => Outcome::Pending,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Outcome::Pending)
    }

    /// Outcomes only move forward: pending may settle once, terminal never changes.
    pub fn can_transition_to(self, next: Outcome) -> bool {
        self == Outcome::Pending && next.is_terminal()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatorAction {
    Approved,
    Rejected,
}

impl OperatorAction {
    pub fn as_db_str(self) -> &'static str {
        match self {
            OperatorAction::Approved => "approved",
            OperatorAction::Rejected => "rejected",
        }
    }

    pub fn from_db(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "approved" => Some(OperatorAction::Approved),
            "rejected" => Some(OperatorAction::Rejected),
            _ => None,
        }
    }
}

/// One routing decision and its eventual outcome. Append-only: the only
/// mutation allowed after insert is a single [`EventResolution`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationEvent {
    pub id: String,
    pub decision_id: String,
    pub created_at: DateTime<Utc>,
    pub trigger_type: TriggerType,
    #[serde(default)]
    pub trigger_data: serde_json::Value,
    pub confidence: f64,
    pub action_type: ActionType,
    #[serde(default)]
    pub action_data: serde_json::Value,
    pub execution_mode: ExecutionMode,
    pub outcome: Outcome,
    #[serde(default)]
    pub operator_action: Option<OperatorAction>,
    #[serde(default)]
    pub execution_time_ms: Option<u64>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub show_segment: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl AutomationEvent {
    pub fn apply_resolution(&mut self, resolution: &EventResolution) -> Result<()> {
        if !self.outcome.can_transition_to(resolution.outcome) {
            bail!(
                "event {} cannot move from {} to {}",
                self.id,
                self.outcome.as_db_str(),
                resolution.outcome.as_db_str()
            );
        }
        self.outcome = resolution.outcome;
        if resolution.operator_action.is_some() {
            self.operator_action = resolution.operator_action;
        }
        if resolution.execution_time_ms.is_some() {
            self.execution_time_ms = resolution.execution_time_ms;
        }
        if resolution.error_message.is_some() {
            self.error_message = resolution.error_message.clone();
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventResolution {
    pub outcome: Outcome,
    #[serde(default)]
    pub operator_action: Option<OperatorAction>,
    #[serde(default)]
    pub execution_time_ms: Option<u64>,
    #[serde(default)]
    pub error_message: Option<String>,
}

/// A confidence-scored proposal produced by the trigger evaluator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateAction {
    pub action_type: ActionType,
    pub trigger_type: TriggerType,
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default)]
    pub trigger_data: serde_json::Value,
    pub confidence: f64,
    pub priority: Priority,
    #[serde(default)]
    pub requires_approval: bool,
    #[serde(default)]
    pub rule_id: Option<String>,
    pub source: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResult {
    pub success: bool,
    pub action_type: ActionType,
    pub execution_time_ms: u64,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}
