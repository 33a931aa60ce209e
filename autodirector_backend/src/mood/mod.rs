//! BetaBot mood arbitration.
//!
//! One authority decides what BetaBot looks like on screen. Requests come from
//! the director panel, the conversation loop and the ambient context analyzer;
//! the priority order is:
//!
//! 1. manual override (time-boxed, lazily expired)
//! 2. active conversation (blocks context suggestions)
//! 3. context
//! 4. default
//!
//! All reads and writes go through one async mutex, so requests settle in
//! arrival order and the override/conversation checks are atomic with the
//! write that follows them. In-memory state only changes after the datastore
//! write succeeds.

use anyhow::{bail, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::clock::Clock;
use crate::datastore::MoodStore;

pub const DEFAULT_OVERRIDE_MINUTES: f64 = 5.0;
/// Longest manual override accepted: one day.
pub const MAX_OVERRIDE_MINUTES: f64 = 24.0 * 60.0;
pub const MOOD_STATS_WINDOW: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mood {
    Neutral,
    Bored,
    Amused,
    Spicy,
    Excited,
    Thoughtful,
}

impl Mood {
    pub fn as_db_str(self) -> &'static str {
        match self {
            Mood::Neutral => "neutral",
            Mood::Bored => "bored",
            Mood::Amused => "amused",
            Mood::Spicy => "spicy",
            Mood::Excited => "excited",
            Mood::Thoughtful => "thoughtful",
        }
    }

    pub fn from_db(raw: &str) -> Self {
        raw.parse().unwrap_or(Mood::Neutral)
    }
}

impl FromStr for Mood {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "neutral" => Ok(Mood::Neutral),
            "bored" => Ok(Mood::Bored),
            "amused" => Ok(Mood::Amused),
            "spicy" => Ok(Mood::Spicy),
            "excited" => Ok(Mood::Excited),
            "thoughtful" => Ok(Mood::Thoughtful),
            other => bail!("unknown mood '{}'", other),
        }
    }
}

impl fmt::Display for Mood {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_db_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Movement {
    Home,
    RunLeft,
    RunRight,
    Bounce,
    Hide,
}

impl Movement {
    pub fn as_db_str(self) -> &'static str {
        match self {
            Movement::Home => "home",
            Movement::RunLeft => "run_left",
            Movement::RunRight => "run_right",
            Movement::Bounce => "bounce",
            Movement::Hide => "hide",
        }
    }

    pub fn from_db(raw: &str) -> Self {
        raw.parse().unwrap_or(Movement::Home)
    }
}

impl FromStr for Movement {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "home" => Ok(Movement::Home),
            "run_left" => Ok(Movement::RunLeft),
            "run_right" => Ok(Movement::RunRight),
            "bounce" => Ok(Movement::Bounce),
            "hide" => Ok(Movement::Hide),
            other => bail!("unknown movement '{}'", other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MoodSource {
    Manual,
    Conversation,
    Context,
    Default,
}

impl MoodSource {
    pub fn as_db_str(self) -> &'static str {
        match self {
            MoodSource::Manual => "manual",
            MoodSource::Conversation => "conversation",
            MoodSource::Context => "context",
            MoodSource::Default => "default",
        }
    }

    pub fn from_db(raw: &str) -> Self {
        raw.parse().unwrap_or(MoodSource::Default)
    }
}

impl FromStr for MoodSource {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "manual" => Ok(MoodSource::Manual),
            "conversation" => Ok(MoodSource::Conversation),
            "context" => Ok(MoodSource::Context),
            "default" => Ok(MoodSource::Default),
            other => bail!("unknown mood source '{}'", other),
        }
    }
}

/// The persisted mood row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoodRecord {
    pub id: String,
    pub mood: Mood,
    pub movement: Movement,
    pub source: MoodSource,
    pub updated_at: DateTime<Utc>,
}

impl MoodRecord {
    pub fn initial(now: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            mood: Mood::Neutral,
            movement: Movement::Home,
            source: MoodSource::Default,
            updated_at: now,
        }
    }
}

/// Point-in-time view of the arbiter, for the dashboard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoodSnapshot {
    pub mood: Mood,
    pub movement: Movement,
    pub source: MoodSource,
    pub updated_at: DateTime<Utc>,
    pub conversation_active: bool,
    pub manual_override_until: Option<DateTime<Utc>>,
    pub manual_override_remaining_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    ManualOverride,
    ConversationActive,
}

impl BlockReason {
    pub fn as_str(self) -> &'static str {
        match self {
            BlockReason::ManualOverride => "manual_override",
            BlockReason::ConversationActive => "conversation_active",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MoodChangeResult {
    Applied,
    Blocked {
        reason: BlockReason,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        blocked_until: Option<DateTime<Utc>>,
    },
    Error {
        reason: String,
    },
}

impl MoodChangeResult {
    pub fn is_applied(&self) -> bool {
        matches!(self, MoodChangeResult::Applied)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MoodLogKind {
    Applied,
    Blocked,
    Failed,
}

impl MoodLogKind {
    pub fn as_db_str(self) -> &'static str {
        match self {
            MoodLogKind::Applied => "applied",
            MoodLogKind::Blocked => "blocked",
            MoodLogKind::Failed => "failed",
        }
    }

    pub fn from_db(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "blocked" => MoodLogKind::Blocked,
            "failed" => MoodLogKind::Failed,
            _ => MoodLogKind::Applied,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoodLogEntry {
    pub id: String,
    pub kind: MoodLogKind,
    pub attempted_mood: Mood,
    pub attempted_source: MoodSource,
    pub current_mood: Mood,
    pub reason: String,
    #[serde(default)]
    pub blocked_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MoodStats {
    pub total_changes: usize,
    pub blocked_attempts: usize,
    pub mood_distribution: BTreeMap<Mood, usize>,
    pub source_distribution: BTreeMap<MoodSource, usize>,
}

impl MoodStats {
    pub fn from_entries(entries: &[MoodLogEntry]) -> Self {
        let mut stats = MoodStats::default();
        for entry in entries {
            match entry.kind {
                MoodLogKind::Applied => {
                    stats.total_changes += 1;
                    *stats
                        .mood_distribution
                        .entry(entry.attempted_mood)
                        .or_insert(0) += 1;
                    *stats
                        .source_distribution
                        .entry(entry.attempted_source)
                        .or_insert(0) += 1;
                }
                MoodLogKind::Blocked => stats.blocked_attempts += 1,
                MoodLogKind::Failed => {}
            }
        }
        stats
    }
}

#[derive(Debug, Default)]
struct ArbiterState {
    record: Option<MoodRecord>,
    manual_override_until: Option<DateTime<Utc>>,
    conversation_active: bool,
}

pub struct MoodArbiter {
    store: Arc<dyn MoodStore>,
    clock: Arc<dyn Clock>,
    state: Mutex<ArbiterState>,
    default_override_minutes: f64,
    stats_window: usize,
}

impl MoodArbiter {
    pub fn new(store: Arc<dyn MoodStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            state: Mutex::new(ArbiterState::default()),
            default_override_minutes: DEFAULT_OVERRIDE_MINUTES,
            stats_window: MOOD_STATS_WINDOW,
        }
    }

    pub fn with_default_override_minutes(mut self, minutes: f64) -> Self {
        if minutes.is_finite() && minutes > 0.0 {
            self.default_override_minutes = minutes.min(MAX_OVERRIDE_MINUTES);
        }
        self
    }

    pub fn with_stats_window(mut self, window: usize) -> Self {
        self.stats_window = window.max(1);
        self
    }

    /// Load the mood row, creating the neutral default on first run.
    pub async fn initialize(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        self.ensure_initialized(&mut state).await.map(|_| ())
    }

    async fn ensure_initialized<'a>(&self, state: &'a mut ArbiterState) -> Result<&'a MoodRecord> {
        if state.record.is_none() {
            let record = match self.store.load_mood().await? {
                Some(record) => {
                    tracing::info!(
                        "BetaBot mood loaded: {} (source: {})",
                        record.mood,
                        record.source.as_db_str()
                    );
                    record
                }
                None => {
                    tracing::warn!("No mood state found, creating default");
                    let record = MoodRecord::initial(self.clock.now());
                    self.store.save_mood(&record).await?;
                    record
                }
            };
            state.record = Some(record);
        }
        match state.record.as_ref() {
            Some(record) => Ok(record),
            None => bail!("mood state unavailable"),
        }
    }

    /// Request a mood change. `duration_minutes` only matters for manual
    /// requests and defaults to five minutes.
    pub async fn set_mood(
        &self,
        mood: Mood,
        source: MoodSource,
        duration_minutes: Option<f64>,
    ) -> MoodChangeResult {
        let mut state = self.state.lock().await;
        let current = match self.ensure_initialized(&mut state).await {
            Ok(record) => record.clone(),
            Err(error) => {
                tracing::error!("Mood state initialization failed: {:#}", error);
                return MoodChangeResult::Error {
                    reason: error.to_string(),
                };
            }
        };
        let now = self.clock.now();

        tracing::info!("Mood change request: {} (source: {})", mood, source.as_db_str());

        if source != MoodSource::Manual {
            if let Some(until) = state.manual_override_until.filter(|until| now < *until) {
                tracing::warn!(
                    "Manual override active until {}; blocking {} mood change to {}",
                    until,
                    source.as_db_str(),
                    mood
                );
                self.log_attempt(
                    MoodLogKind::Blocked,
                    mood,
                    source,
                    current.mood,
                    BlockReason::ManualOverride.as_str(),
                    Some(until),
                )
                .await;
                return MoodChangeResult::Blocked {
                    reason: BlockReason::ManualOverride,
                    blocked_until: Some(until),
                };
            }
        }

        if source == MoodSource::Context && state.conversation_active {
            tracing::info!("BetaBot in active conversation; blocking context mood {}", mood);
            self.log_attempt(
                MoodLogKind::Blocked,
                mood,
                source,
                current.mood,
                BlockReason::ConversationActive.as_str(),
                None,
            )
            .await;
            return MoodChangeResult::Blocked {
                reason: BlockReason::ConversationActive,
                blocked_until: None,
            };
        }

        let override_until = if source == MoodSource::Manual {
            match self.override_deadline(now, duration_minutes) {
                Ok(until) => Some(until),
                Err(reason) => {
                    tracing::warn!("Rejected manual mood change to {}: {}", mood, reason);
                    self.log_attempt(MoodLogKind::Failed, mood, source, current.mood, &reason, None)
                        .await;
                    return MoodChangeResult::Error { reason };
                }
            }
        } else {
            None
        };

        let next = MoodRecord {
            mood,
            source,
            updated_at: now,
            ..current.clone()
        };
        if let Err(error) = self.store.save_mood(&next).await {
            tracing::error!("Failed to update mood: {:#}", error);
            self.log_attempt(
                MoodLogKind::Failed,
                mood,
                source,
                current.mood,
                &error.to_string(),
                None,
            )
            .await;
            return MoodChangeResult::Error {
                reason: error.to_string(),
            };
        }

        if let Some(until) = override_until {
            tracing::info!("Manual override set until {}", until);
            state.manual_override_until = Some(until);
        }
        state.record = Some(next);

        tracing::info!("BetaBot mood updated: {} (source: {})", mood, source.as_db_str());
        self.log_attempt(MoodLogKind::Applied, mood, source, mood, "success", None)
            .await;
        MoodChangeResult::Applied
    }

    /// End of a manual override window starting at `now`. Durations must be
    /// positive, finite and at most [`MAX_OVERRIDE_MINUTES`].
    fn override_deadline(
        &self,
        now: DateTime<Utc>,
        duration_minutes: Option<f64>,
    ) -> std::result::Result<DateTime<Utc>, String> {
        let minutes = duration_minutes.unwrap_or(self.default_override_minutes);
        if !minutes.is_finite() || minutes <= 0.0 || minutes > MAX_OVERRIDE_MINUTES {
            return Err(format!(
                "override duration must be between 0 and {} minutes, got {}",
                MAX_OVERRIDE_MINUTES, minutes
            ));
        }
        ChronoDuration::try_milliseconds((minutes * 60_000.0).round() as i64)
            .and_then(|window| now.checked_add_signed(window))
            .ok_or_else(|| format!("override duration of {} minutes is out of range", minutes))
    }

    /// Movement is cosmetic and never contested.
    pub async fn set_movement(&self, movement: Movement, source: MoodSource) -> MoodChangeResult {
        let mut state = self.state.lock().await;
        let current = match self.ensure_initialized(&mut state).await {
            Ok(record) => record.clone(),
            Err(error) => {
                return MoodChangeResult::Error {
                    reason: error.to_string(),
                }
            }
        };

        tracing::info!(
            "Movement change request: {} (source: {})",
            movement.as_db_str(),
            source.as_db_str()
        );

        let next = MoodRecord {
            movement,
            updated_at: self.clock.now(),
            ..current
        };
        if let Err(error) = self.store.save_mood(&next).await {
            tracing::error!("Failed to update movement: {:#}", error);
            return MoodChangeResult::Error {
                reason: error.to_string(),
            };
        }
        state.record = Some(next);
        MoodChangeResult::Applied
    }

    pub async fn set_conversation_active(&self, active: bool) {
        self.state.lock().await.conversation_active = active;
        tracing::info!(
            "BetaBot conversation {}",
            if active { "started" } else { "ended" }
        );
    }

    pub async fn clear_manual_override(&self) {
        let mut state = self.state.lock().await;
        if state.manual_override_until.take().is_some() {
            tracing::info!("Manual override cleared early");
        }
    }

    pub async fn is_manual_override_active(&self) -> bool {
        let state = self.state.lock().await;
        let now = self.clock.now();
        state
            .manual_override_until
            .is_some_and(|until| now < until)
    }

    /// Whole seconds left on the override, rounded up.
    pub async fn manual_override_time_remaining(&self) -> u64 {
        let state = self.state.lock().await;
        remaining_secs(state.manual_override_until, self.clock.now())
    }

    pub async fn snapshot(&self) -> Result<MoodSnapshot> {
        let mut state = self.state.lock().await;
        let record = self.ensure_initialized(&mut state).await?.clone();
        let now = self.clock.now();
        Ok(MoodSnapshot {
            mood: record.mood,
            movement: record.movement,
            source: record.source,
            updated_at: record.updated_at,
            conversation_active: state.conversation_active,
            manual_override_until: state.manual_override_until.filter(|until| now < *until),
            manual_override_remaining_secs: remaining_secs(state.manual_override_until, now),
        })
    }

    pub async fn mood_stats(&self) -> Result<MoodStats> {
        let entries = self.store.recent_mood_log(self.stats_window).await?;
        Ok(MoodStats::from_entries(&entries))
    }

    async fn log_attempt(
        &self,
        kind: MoodLogKind,
        attempted_mood: Mood,
        attempted_source: MoodSource,
        current_mood: Mood,
        reason: &str,
        blocked_until: Option<DateTime<Utc>>,
    ) {
        let entry = MoodLogEntry {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            attempted_mood,
            attempted_source,
            current_mood,
            reason: reason.to_string(),
            blocked_until,
            created_at: self.clock.now(),
        };
        if let Err(error) = self.store.append_mood_log(&entry).await {
            tracing::warn!("Failed to log mood event: {:#}", error);
        }
    }
}

fn remaining_secs(until: Option<DateTime<Utc>>, now: DateTime<Utc>) -> u64 {
    match until {
        Some(until) if now < until => {
            let millis = (until - now).num_milliseconds().max(0) as u64;
            millis.div_ceil(1000)
        }
        _ => 0,
    }
}
