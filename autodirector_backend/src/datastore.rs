//! Persistence seams the decision engine depends on.
//!
//! The engine never talks to a concrete backend. It needs four capabilities,
//! each its own trait so collaborators (and test doubles) only implement what
//! they use:
//!
//! - [`MoodStore`]: single-row mood state plus the append-only mood log
//! - [`EventLog`]: append-only automation events with one forward update
//! - [`AutomationStore`]: routing config and trigger rules
//! - [`ChangeFeed`]: per-table change notifications (at-least-once)
//!
//! [`crate::database::AutomationDatabase`] implements all of them on SQLite.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::automation::config::AutomationConfig;
use crate::automation::trigger::TriggerRule;
use crate::automation::types::{ActionType, AutomationEvent, EventResolution, Outcome};
use crate::mood::{MoodLogEntry, MoodRecord};

pub const LIVE_TRANSCRIPTS_TABLE: &str = "live_transcripts";
pub const AUTOMATION_EVENTS_TABLE: &str = "automation_events";
pub const TRIGGER_RULES_TABLE: &str = "trigger_rules";

#[async_trait]
pub trait MoodStore: Send + Sync {
    async fn load_mood(&self) -> Result<Option<MoodRecord>>;
    async fn save_mood(&self, record: &MoodRecord) -> Result<()>;
    async fn append_mood_log(&self, entry: &MoodLogEntry) -> Result<()>;
    /// Newest first.
    async fn recent_mood_log(&self, limit: usize) -> Result<Vec<MoodLogEntry>>;
}

#[async_trait]
pub trait EventLog: Send + Sync {
    async fn insert_event(&self, event: &AutomationEvent) -> Result<()>;
    async fn get_event(&self, id: &str) -> Result<Option<AutomationEvent>>;
    /// Settles a pending event. Returns `false` when the event is missing or
    /// already terminal; terminal outcomes are never overwritten.
    async fn resolve_event(&self, id: &str, resolution: &EventResolution) -> Result<bool>;
    /// Newest first.
    async fn query_events(&self, query: &EventQuery) -> Result<Vec<AutomationEvent>>;
}

#[async_trait]
pub trait AutomationStore: Send + Sync {
    async fn load_automation_config(&self) -> Result<Option<AutomationConfig>>;
    async fn save_automation_config(&self, config: &AutomationConfig) -> Result<()>;
    async fn list_trigger_rules(&self, enabled_only: bool) -> Result<Vec<TriggerRule>>;
    async fn get_trigger_rule(&self, id: &str) -> Result<Option<TriggerRule>>;
    async fn save_trigger_rule(&self, rule: &TriggerRule) -> Result<()>;
    async fn delete_trigger_rule(&self, id: &str) -> Result<bool>;
    async fn increment_rule_execution(&self, id: &str) -> Result<()>;
    async fn reset_rule_execution_counts(&self) -> Result<()>;
}

pub trait ChangeFeed: Send + Sync {
    fn subscribe(&self, table: &str) -> flume::Receiver<ChangeEvent>;
}

pub trait Datastore: MoodStore + EventLog + AutomationStore + ChangeFeed {}

impl<T> Datastore for T where T: MoodStore + EventLog + AutomationStore + ChangeFeed + ?Sized {}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventQuery {
    #[serde(default)]
    pub action_type: Option<ActionType>,
    #[serde(default)]
    pub outcome: Option<Outcome>,
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,
    #[serde(default)]
    pub until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl EventQuery {
    pub fn recent(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Default::default()
        }
    }

    pub fn for_action(action_type: ActionType) -> Self {
        Self {
            action_type: Some(action_type),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeKind::Insert => "insert",
            ChangeKind::Update => "update",
            ChangeKind::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub table: String,
    pub kind: ChangeKind,
    pub row: serde_json::Value,
    pub emitted_at: DateTime<Utc>,
}

/// A row of operator speech pushed by the transcription pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptLine {
    pub id: String,
    pub text: String,
    pub confidence: f64,
    #[serde(default)]
    pub speaker: Option<String>,
    pub created_at: DateTime<Utc>,
}
