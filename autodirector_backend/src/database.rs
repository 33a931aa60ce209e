use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, params_from_iter, Connection, Row};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use crate::automation::config::AutomationConfig;
use crate::automation::trigger::TriggerRule;
use crate::automation::types::{
    ActionType, AutomationEvent, EventResolution, ExecutionMode, OperatorAction, Outcome,
    TriggerType,
};
use crate::datastore::{
    AutomationStore, ChangeEvent, ChangeFeed, ChangeKind, EventLog, EventQuery, MoodStore,
    TranscriptLine, AUTOMATION_EVENTS_TABLE, LIVE_TRANSCRIPTS_TABLE, TRIGGER_RULES_TABLE,
};
use crate::mood::{Mood, MoodLogEntry, MoodLogKind, MoodRecord, MoodSource, Movement};

const EVENT_COLUMNS: &str = "id, decision_id, created_at, trigger_type, trigger_data, confidence,
     action_type, action_data, execution_mode, outcome, operator_action, execution_time_ms,
     error_message, show_segment, metadata";

/// SQLite-backed datastore: mood state, automation event log, routing config,
/// trigger rules and live transcripts, plus in-process change notifications.
pub struct AutomationDatabase {
    conn: Mutex<Connection>,
    subscribers: Mutex<HashMap<String, Vec<flume::Sender<ChangeEvent>>>>,
}

fn ts(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conversion_error(
    column: usize,
    error: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(error))
}

fn parse_ts(column: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    raw.parse::<DateTime<Utc>>()
        .map_err(|e| conversion_error(column, e))
}

fn parse_json(column: usize, raw: Option<String>) -> rusqlite::Result<Value> {
    match raw {
        Some(raw) if !raw.trim().is_empty() => {
            serde_json::from_str(&raw).map_err(|e| conversion_error(column, e))
        }
        _ => Ok(Value::Null),
    }
}

fn parse_action_type(column: usize, raw: &str) -> rusqlite::Result<ActionType> {
    raw.parse::<ActionType>()
        .map_err(|e| conversion_error(column, std::io::Error::other(e.to_string())))
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<AutomationEvent> {
    Ok(AutomationEvent {
        id: row.get(0)?,
        decision_id: row.get(1)?,
        created_at: parse_ts(2, &row.get::<_, String>(2)?)?,
        trigger_type: TriggerType::from_db(&row.get::<_, String>(3)?),
        trigger_data: parse_json(4, row.get(4)?)?,
        confidence: row.get(5)?,
        action_type: parse_action_type(6, &row.get::<_, String>(6)?)?,
        action_data: parse_json(7, row.get(7)?)?,
        execution_mode: ExecutionMode::from_db(&row.get::<_, String>(8)?),
        outcome: Outcome::from_db(&row.get::<_, String>(9)?),
        operator_action: row
            .get::<_, Option<String>>(10)?
            .as_deref()
            .and_then(OperatorAction::from_db),
        execution_time_ms: row.get::<_, Option<i64>>(11)?.map(|ms| ms.max(0) as u64),
        error_message: row.get(12)?,
        show_segment: row.get(13)?,
        metadata: parse_json(14, row.get(14)?)?,
    })
}

fn rule_from_row(row: &Row<'_>) -> rusqlite::Result<TriggerRule> {
    let raw: String = row.get(0)?;
    let mut rule: TriggerRule = serde_json::from_str(&raw).map_err(|e| conversion_error(0, e))?;
    rule.current_execution_count = row.get::<_, i64>(1)?.max(0) as u32;
    Ok(rule)
}

impl AutomationDatabase {
    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Database lock poisoned: {}", e))
    }

    /// Create or open the database
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database {}", path.display()))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let db = Self {
            conn: Mutex::new(conn),
            subscribers: Mutex::new(HashMap::new()),
        };
        db.ensure_schema()?;
        Ok(db)
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS mood_state (
                id TEXT PRIMARY KEY,
                mood TEXT NOT NULL,
                movement TEXT NOT NULL,
                source TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS mood_log (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                attempted_mood TEXT NOT NULL,
                attempted_source TEXT NOT NULL,
                current_mood TEXT NOT NULL,
                reason TEXT NOT NULL,
                blocked_until TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_mood_log_created_at ON mood_log(created_at DESC);

            CREATE TABLE IF NOT EXISTS automation_events (
                id TEXT PRIMARY KEY,
                decision_id TEXT NOT NULL,
                created_at TEXT NOT NULL,
                trigger_type TEXT NOT NULL,
                trigger_data TEXT,
                confidence REAL NOT NULL,
                action_type TEXT NOT NULL,
                action_data TEXT,
                execution_mode TEXT NOT NULL,
                outcome TEXT NOT NULL,
                operator_action TEXT,
                execution_time_ms INTEGER,
                error_message TEXT,
                show_segment TEXT,
                metadata TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_automation_events_created_at ON automation_events(created_at DESC);
            CREATE INDEX IF NOT EXISTS idx_automation_events_action_type ON automation_events(action_type, created_at DESC);

            CREATE TABLE IF NOT EXISTS automation_config (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                config_json TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS trigger_rules (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                enabled INTEGER NOT NULL,
                trigger_type TEXT NOT NULL,
                rule_json TEXT NOT NULL,
                current_execution_count INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS live_transcripts (
                id TEXT PRIMARY KEY,
                text TEXT NOT NULL,
                confidence REAL NOT NULL,
                speaker TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_live_transcripts_created_at ON live_transcripts(created_at DESC);
            "#,
        )?;
        Ok(())
    }

    /// Push a row change to every live subscriber of `table`. Closed
    /// receivers are pruned.
    pub fn publish_change(&self, table: &str, kind: ChangeKind, row: Value) {
        let Ok(mut subscribers) = self.subscribers.lock() else {
            tracing::warn!("Change feed lock poisoned; dropping {} notification", table);
            return;
        };
        let Some(senders) = subscribers.get_mut(table) else {
            return;
        };
        let event = ChangeEvent {
            table: table.to_string(),
            kind,
            row,
            emitted_at: Utc::now(),
        };
        senders.retain(|sender| sender.send(event.clone()).is_ok());
    }

    fn publish_serialized<T: serde::Serialize>(&self, table: &str, kind: ChangeKind, row: &T) {
        match serde_json::to_value(row) {
            Ok(value) => self.publish_change(table, kind, value),
            Err(error) => tracing::warn!("Failed to serialize {} change: {}", table, error),
        }
    }

    // ---- mood ----

    pub fn get_mood(&self) -> Result<Option<MoodRecord>> {
        let conn = self.lock_conn()?;
        let result = conn.query_row(
            "SELECT id, mood, movement, source, updated_at
             FROM mood_state ORDER BY updated_at DESC LIMIT 1",
            [],
            |row| {
                Ok(MoodRecord {
                    id: row.get(0)?,
                    mood: Mood::from_db(&row.get::<_, String>(1)?),
                    movement: Movement::from_db(&row.get::<_, String>(2)?),
                    source: MoodSource::from_db(&row.get::<_, String>(3)?),
                    updated_at: parse_ts(4, &row.get::<_, String>(4)?)?,
                })
            },
        );
        match result {
            Ok(record) => Ok(Some(record)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn put_mood(&self, record: &MoodRecord) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO mood_state (id, mood, movement, source, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.id,
                record.mood.as_db_str(),
                record.movement.as_db_str(),
                record.source.as_db_str(),
                ts(record.updated_at),
            ],
        )?;
        Ok(())
    }

    pub fn add_mood_log(&self, entry: &MoodLogEntry) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO mood_log (id, kind, attempted_mood, attempted_source, current_mood, reason, blocked_until, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                entry.id,
                entry.kind.as_db_str(),
                entry.attempted_mood.as_db_str(),
                entry.attempted_source.as_db_str(),
                entry.current_mood.as_db_str(),
                entry.reason,
                entry.blocked_until.map(ts),
                ts(entry.created_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_mood_log(&self, limit: usize) -> Result<Vec<MoodLogEntry>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, kind, attempted_mood, attempted_source, current_mood, reason, blocked_until, created_at
             FROM mood_log ORDER BY created_at DESC, rowid DESC LIMIT ?1",
        )?;
        let entries = stmt
            .query_map([limit.max(1) as i64], |row| {
                let blocked_until = match row.get::<_, Option<String>>(6)? {
                    Some(raw) => Some(parse_ts(6, &raw)?),
                    None => None,
                };
                Ok(MoodLogEntry {
                    id: row.get(0)?,
                    kind: MoodLogKind::from_db(&row.get::<_, String>(1)?),
                    attempted_mood: Mood::from_db(&row.get::<_, String>(2)?),
                    attempted_source: MoodSource::from_db(&row.get::<_, String>(3)?),
                    current_mood: Mood::from_db(&row.get::<_, String>(4)?),
                    reason: row.get(5)?,
                    blocked_until,
                    created_at: parse_ts(7, &row.get::<_, String>(7)?)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    // ---- automation events ----

    pub fn add_event(&self, event: &AutomationEvent) -> Result<()> {
        {
            let conn = self.lock_conn()?;
            conn.execute(
                &format!(
                    "INSERT INTO automation_events ({})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                    EVENT_COLUMNS
                ),
                params![
                    event.id,
                    event.decision_id,
                    ts(event.created_at),
                    event.trigger_type.as_db_str(),
                    event.trigger_data.to_string(),
                    event.confidence,
                    event.action_type.as_str(),
                    event.action_data.to_string(),
                    event.execution_mode.as_db_str(),
                    event.outcome.as_db_str(),
                    event.operator_action.map(OperatorAction::as_db_str),
                    event.execution_time_ms.map(|ms| ms as i64),
                    event.error_message,
                    event.show_segment,
                    event.metadata.to_string(),
                ],
            )?;
        }
        self.publish_serialized(AUTOMATION_EVENTS_TABLE, ChangeKind::Insert, event);
        Ok(())
    }

    pub fn find_event(&self, id: &str) -> Result<Option<AutomationEvent>> {
        let conn = self.lock_conn()?;
        let result = conn.query_row(
            &format!("SELECT {} FROM automation_events WHERE id = ?1", EVENT_COLUMNS),
            [id],
            event_from_row,
        );
        match result {
            Ok(event) => Ok(Some(event)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Apply a resolution to a pending event. The read and the write happen
    /// under one connection lock.
    pub fn settle_event(&self, id: &str, resolution: &EventResolution) -> Result<Option<AutomationEvent>> {
        let settled = {
            let conn = self.lock_conn()?;
            let current = conn.query_row(
                &format!("SELECT {} FROM automation_events WHERE id = ?1", EVENT_COLUMNS),
                [id],
                event_from_row,
            );
            let mut event = match current {
                Ok(event) => event,
                Err(rusqlite::Error::QueryReturnedNoRows) => return Ok(None),
                Err(e) => return Err(e.into()),
            };
            if event.apply_resolution(resolution).is_err() {
                return Ok(None);
            }
            conn.execute(
                "UPDATE automation_events
                 SET outcome = ?2, operator_action = ?3, execution_time_ms = ?4, error_message = ?5
                 WHERE id = ?1 AND outcome = 'pending'",
                params![
                    event.id,
                    event.outcome.as_db_str(),
                    event.operator_action.map(OperatorAction::as_db_str),
                    event.execution_time_ms.map(|ms| ms as i64),
                    event.error_message,
                ],
            )?;
            event
        };
        self.publish_serialized(AUTOMATION_EVENTS_TABLE, ChangeKind::Update, &settled);
        Ok(Some(settled))
    }

    pub fn list_events(&self, query: &EventQuery) -> Result<Vec<AutomationEvent>> {
        let mut clauses = Vec::new();
        let mut values: Vec<String> = Vec::new();
        if let Some(action_type) = query.action_type {
            values.push(action_type.as_str().to_string());
            clauses.push(format!("action_type = ?{}", values.len()));
        }
        if let Some(outcome) = query.outcome {
            values.push(outcome.as_db_str().to_string());
            clauses.push(format!("outcome = ?{}", values.len()));
        }
        if let Some(since) = query.since {
            values.push(ts(since));
            clauses.push(format!("created_at >= ?{}", values.len()));
        }
        if let Some(until) = query.until {
            values.push(ts(until));
            clauses.push(format!("created_at < ?{}", values.len()));
        }

        let mut sql = format!("SELECT {} FROM automation_events", EVENT_COLUMNS);
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY created_at DESC, rowid DESC");
        if let Some(limit) = query.limit {
            sql.push_str(&format!(" LIMIT {}", limit.max(1)));
        }

        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let events = stmt
            .query_map(params_from_iter(values.iter()), event_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(events)
    }

    // ---- routing config ----

    pub fn get_automation_config(&self) -> Result<Option<AutomationConfig>> {
        let conn = self.lock_conn()?;
        let result = conn.query_row(
            "SELECT config_json FROM automation_config WHERE id = 1",
            [],
            |row| row.get::<_, String>(0),
        );
        match result {
            Ok(raw) => {
                let config = serde_json::from_str(&raw)
                    .context("stored automation config is not valid JSON")?;
                Ok(Some(config))
            }
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn put_automation_config(&self, config: &AutomationConfig) -> Result<()> {
        let raw = serde_json::to_string(config)?;
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO automation_config (id, config_json, updated_at) VALUES (1, ?1, ?2)",
            params![raw, ts(config.updated_at)],
        )?;
        Ok(())
    }

    // ---- trigger rules ----

    pub fn get_trigger_rules(&self, enabled_only: bool) -> Result<Vec<TriggerRule>> {
        let conn = self.lock_conn()?;
        let sql = if enabled_only {
            "SELECT rule_json, current_execution_count FROM trigger_rules WHERE enabled = 1 ORDER BY created_at ASC"
        } else {
            "SELECT rule_json, current_execution_count FROM trigger_rules ORDER BY created_at ASC"
        };
        let mut stmt = conn.prepare(sql)?;
        let rules = stmt
            .query_map([], rule_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rules)
    }

    pub fn find_trigger_rule(&self, id: &str) -> Result<Option<TriggerRule>> {
        let conn = self.lock_conn()?;
        let result = conn.query_row(
            "SELECT rule_json, current_execution_count FROM trigger_rules WHERE id = ?1",
            [id],
            rule_from_row,
        );
        match result {
            Ok(rule) => Ok(Some(rule)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn upsert_trigger_rule(&self, rule: &TriggerRule) -> Result<()> {
        let raw = serde_json::to_string(rule)?;
        let existed = {
            let conn = self.lock_conn()?;
            let existed = conn
                .query_row("SELECT 1 FROM trigger_rules WHERE id = ?1", [&rule.id], |_| Ok(()))
                .is_ok();
            conn.execute(
                "INSERT INTO trigger_rules (id, name, enabled, trigger_type, rule_json, current_execution_count, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    enabled = excluded.enabled,
                    trigger_type = excluded.trigger_type,
                    rule_json = excluded.rule_json,
                    current_execution_count = excluded.current_execution_count,
                    updated_at = excluded.updated_at",
                params![
                    rule.id,
                    rule.name,
                    rule.enabled,
                    rule.trigger_type().as_db_str(),
                    raw,
                    rule.current_execution_count as i64,
                    ts(rule.created_at),
                    ts(rule.updated_at),
                ],
            )?;
            existed
        };
        let kind = if existed {
            ChangeKind::Update
        } else {
            ChangeKind::Insert
        };
        self.publish_serialized(TRIGGER_RULES_TABLE, kind, rule);
        Ok(())
    }

    pub fn remove_trigger_rule(&self, id: &str) -> Result<bool> {
        let removed = {
            let conn = self.lock_conn()?;
            conn.execute("DELETE FROM trigger_rules WHERE id = ?1", [id])? > 0
        };
        if removed {
            self.publish_change(
                TRIGGER_RULES_TABLE,
                ChangeKind::Delete,
                serde_json::json!({ "id": id }),
            );
        }
        Ok(removed)
    }

    pub fn bump_rule_execution(&self, id: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "UPDATE trigger_rules SET current_execution_count = current_execution_count + 1 WHERE id = ?1",
            [id],
        )?;
        Ok(())
    }

    pub fn clear_rule_executions(&self) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute("UPDATE trigger_rules SET current_execution_count = 0", [])?;
        Ok(())
    }

    // ---- live transcripts ----

    pub fn insert_transcript(
        &self,
        text: &str,
        confidence: f64,
        speaker: Option<&str>,
    ) -> Result<TranscriptLine> {
        let line = TranscriptLine {
            id: uuid::Uuid::new_v4().to_string(),
            text: text.to_string(),
            confidence,
            speaker: speaker.map(str::to_string),
            created_at: Utc::now(),
        };
        {
            let conn = self.lock_conn()?;
            conn.execute(
                "INSERT INTO live_transcripts (id, text, confidence, speaker, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    line.id,
                    line.text,
                    line.confidence,
                    line.speaker,
                    ts(line.created_at)
                ],
            )?;
        }
        self.publish_serialized(LIVE_TRANSCRIPTS_TABLE, ChangeKind::Insert, &line);
        Ok(line)
    }

    pub fn recent_transcripts(&self, limit: usize) -> Result<Vec<TranscriptLine>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, text, confidence, speaker, created_at
             FROM live_transcripts ORDER BY created_at DESC, rowid DESC LIMIT ?1",
        )?;
        let lines = stmt
            .query_map([limit.max(1) as i64], |row| {
                Ok(TranscriptLine {
                    id: row.get(0)?,
                    text: row.get(1)?,
                    confidence: row.get(2)?,
                    speaker: row.get(3)?,
                    created_at: parse_ts(4, &row.get::<_, String>(4)?)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(lines)
    }
}

#[async_trait]
impl MoodStore for AutomationDatabase {
    async fn load_mood(&self) -> Result<Option<MoodRecord>> {
        self.get_mood()
    }

    async fn save_mood(&self, record: &MoodRecord) -> Result<()> {
        self.put_mood(record)
    }

    async fn append_mood_log(&self, entry: &MoodLogEntry) -> Result<()> {
        self.add_mood_log(entry)
    }

    async fn recent_mood_log(&self, limit: usize) -> Result<Vec<MoodLogEntry>> {
        self.get_mood_log(limit)
    }
}

#[async_trait]
impl EventLog for AutomationDatabase {
    async fn insert_event(&self, event: &AutomationEvent) -> Result<()> {
        self.add_event(event)
    }

    async fn get_event(&self, id: &str) -> Result<Option<AutomationEvent>> {
        self.find_event(id)
    }

    async fn resolve_event(&self, id: &str, resolution: &EventResolution) -> Result<bool> {
        Ok(self.settle_event(id, resolution)?.is_some())
    }

    async fn query_events(&self, query: &EventQuery) -> Result<Vec<AutomationEvent>> {
        self.list_events(query)
    }
}

#[async_trait]
impl AutomationStore for AutomationDatabase {
    async fn load_automation_config(&self) -> Result<Option<AutomationConfig>> {
        self.get_automation_config()
    }

    async fn save_automation_config(&self, config: &AutomationConfig) -> Result<()> {
        self.put_automation_config(config)
    }

    async fn list_trigger_rules(&self, enabled_only: bool) -> Result<Vec<TriggerRule>> {
        self.get_trigger_rules(enabled_only)
    }

    async fn get_trigger_rule(&self, id: &str) -> Result<Option<TriggerRule>> {
        self.find_trigger_rule(id)
    }

    async fn save_trigger_rule(&self, rule: &TriggerRule) -> Result<()> {
        self.upsert_trigger_rule(rule)
    }

    async fn delete_trigger_rule(&self, id: &str) -> Result<bool> {
        self.remove_trigger_rule(id)
    }

    async fn increment_rule_execution(&self, id: &str) -> Result<()> {
        self.bump_rule_execution(id)
    }

    async fn reset_rule_execution_counts(&self) -> Result<()> {
        self.clear_rule_executions()
    }
}

impl ChangeFeed for AutomationDatabase {
    fn subscribe(&self, table: &str) -> flume::Receiver<ChangeEvent> {
        let (tx, rx) = flume::unbounded();
        match self.subscribers.lock() {
            Ok(mut subscribers) => subscribers.entry(table.to_string()).or_default().push(tx),
            Err(e) => tracing::warn!("Change feed lock poisoned; {} subscription is inert: {}", table, e),
        }
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automation::trigger::TriggerCondition;
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 19, minute, 0).unwrap()
    }

    fn event(action_type: ActionType, outcome: Outcome, created_at: DateTime<Utc>) -> AutomationEvent {
        AutomationEvent {
            id: uuid::Uuid::new_v4().to_string(),
            decision_id: uuid::Uuid::new_v4().to_string(),
            created_at,
            trigger_type: TriggerType::Keyword,
            trigger_data: json!({ "transcript": "roll the clip" }),
            confidence: 0.72,
            action_type,
            action_data: json!({ "graphic": "clip" }),
            execution_mode: ExecutionMode::Suggested,
            outcome,
            operator_action: None,
            execution_time_ms: None,
            error_message: None,
            show_segment: Some("intro".to_string()),
            metadata: json!({ "priority": 3 }),
        }
    }

    #[test]
    fn mood_state_is_a_single_overwritten_row() {
        let db = AutomationDatabase::open_in_memory().unwrap();
        assert!(db.get_mood().unwrap().is_none());

        let mut record = MoodRecord::initial(at(0));
        db.put_mood(&record).unwrap();
        record.mood = Mood::Spicy;
        record.source = MoodSource::Manual;
        record.updated_at = at(1);
        db.put_mood(&record).unwrap();

        let stored = db.get_mood().unwrap().unwrap();
        assert_eq!(stored, record);
        let count: i64 = db
            .lock_conn()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM mood_state", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn mood_log_reads_newest_first() {
        let db = AutomationDatabase::open_in_memory().unwrap();
        for (minute, kind) in [(0, MoodLogKind::Applied), (1, MoodLogKind::Blocked)] {
            db.add_mood_log(&MoodLogEntry {
                id: uuid::Uuid::new_v4().to_string(),
                kind,
                attempted_mood: Mood::Amused,
                attempted_source: MoodSource::Context,
                current_mood: Mood::Neutral,
                reason: "test".to_string(),
                blocked_until: (kind == MoodLogKind::Blocked).then(|| at(5)),
                created_at: at(minute),
            })
            .unwrap();
        }
        let entries = db.get_mood_log(10).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].kind, MoodLogKind::Blocked);
        assert_eq!(entries[0].blocked_until, Some(at(5)));
        assert_eq!(db.get_mood_log(1).unwrap().len(), 1);
    }

    #[test]
    fn events_filter_by_action_outcome_and_time() {
        let db = AutomationDatabase::open_in_memory().unwrap();
        db.add_event(&event(ActionType::GraphicShow, Outcome::Executed, at(0))).unwrap();
        db.add_event(&event(ActionType::GraphicShow, Outcome::Pending, at(10))).unwrap();
        db.add_event(&event(ActionType::SoundboardPlay, Outcome::Executed, at(20))).unwrap();

        let all = db.list_events(&EventQuery::default()).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].action_type, ActionType::SoundboardPlay);

        let graphics = db.list_events(&EventQuery::for_action(ActionType::GraphicShow)).unwrap();
        assert_eq!(graphics.len(), 2);
        assert_eq!(graphics[0].show_segment.as_deref(), Some("intro"));
        assert_eq!(graphics[0].trigger_data["transcript"], "roll the clip");

        let window = db
            .list_events(&EventQuery {
                since: Some(at(5)),
                until: Some(at(15)),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(window.len(), 1);
        assert_eq!(window[0].outcome, Outcome::Pending);

        let pending = db
            .list_events(&EventQuery {
                outcome: Some(Outcome::Pending),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(pending.len(), 1);

        assert_eq!(db.list_events(&EventQuery::recent(2)).unwrap().len(), 2);
    }

    #[test]
    fn events_settle_exactly_once() {
        let db = AutomationDatabase::open_in_memory().unwrap();
        let pending = event(ActionType::GraphicShow, Outcome::Pending, at(0));
        db.add_event(&pending).unwrap();

        let settled = db
            .settle_event(
                &pending.id,
                &EventResolution {
                    outcome: Outcome::Executed,
                    operator_action: Some(OperatorAction::Approved),
                    execution_time_ms: Some(35),
                    error_message: None,
                },
            )
            .unwrap()
            .unwrap();
        assert_eq!(settled.outcome, Outcome::Executed);

        let again = db
            .settle_event(
                &pending.id,
                &EventResolution {
                    outcome: Outcome::Failed,
                    operator_action: None,
                    execution_time_ms: None,
                    error_message: Some("late".to_string()),
                },
            )
            .unwrap();
        assert!(again.is_none());

        let stored = db.find_event(&pending.id).unwrap().unwrap();
        assert_eq!(stored.outcome, Outcome::Executed);
        assert_eq!(stored.operator_action, Some(OperatorAction::Approved));
        assert_eq!(stored.execution_time_ms, Some(35));
        assert!(stored.error_message.is_none());

        assert!(db
            .settle_event(
                "missing",
                &EventResolution {
                    outcome: Outcome::Skipped,
                    operator_action: None,
                    execution_time_ms: None,
                    error_message: None,
                }
            )
            .unwrap()
            .is_none());
    }

    #[test]
    fn automation_config_round_trips() {
        let db = AutomationDatabase::open_in_memory().unwrap();
        assert!(db.get_automation_config().unwrap().is_none());

        let config = AutomationConfig {
            auto_execute_enabled: true,
            suggestion_ttl_secs: Some(90),
            ..Default::default()
        };
        db.put_automation_config(&config).unwrap();
        assert_eq!(db.get_automation_config().unwrap().unwrap(), config);
    }

    #[test]
    fn trigger_rules_crud_and_execution_counts() {
        let db = AutomationDatabase::open_in_memory().unwrap();
        let mut rule = TriggerRule::new(
            "breaking",
            TriggerCondition::Keyword {
                keywords: vec!["breaking".to_string()],
                match_type: Default::default(),
                case_sensitive: false,
            },
            ActionType::GraphicShow,
        );
        db.upsert_trigger_rule(&rule).unwrap();

        let mut disabled = TriggerRule::new("off", TriggerCondition::QuestionMark, ActionType::QuestionIndicate);
        disabled.enabled = false;
        db.upsert_trigger_rule(&disabled).unwrap();

        assert_eq!(db.get_trigger_rules(false).unwrap().len(), 2);
        assert_eq!(db.get_trigger_rules(true).unwrap().len(), 1);

        db.bump_rule_execution(&rule.id).unwrap();
        db.bump_rule_execution(&rule.id).unwrap();
        assert_eq!(
            db.find_trigger_rule(&rule.id).unwrap().unwrap().current_execution_count,
            2
        );
        db.clear_rule_executions().unwrap();
        assert_eq!(
            db.find_trigger_rule(&rule.id).unwrap().unwrap().current_execution_count,
            0
        );

        rule.name = "breaking news".to_string();
        db.upsert_trigger_rule(&rule).unwrap();
        assert_eq!(db.find_trigger_rule(&rule.id).unwrap().unwrap().name, "breaking news");

        assert!(db.remove_trigger_rule(&disabled.id).unwrap());
        assert!(!db.remove_trigger_rule(&disabled.id).unwrap());
    }

    #[test]
    fn change_feed_delivers_inserts_to_subscribers() {
        let db = AutomationDatabase::open_in_memory().unwrap();
        let transcripts = db.subscribe(LIVE_TRANSCRIPTS_TABLE);
        let events = db.subscribe(AUTOMATION_EVENTS_TABLE);

        let line = db.insert_transcript("hello chat", 0.93, Some("host")).unwrap();
        let change = transcripts.try_recv().unwrap();
        assert_eq!(change.kind, ChangeKind::Insert);
        assert_eq!(change.row["id"], line.id.as_str());
        assert_eq!(change.row["text"], "hello chat");
        assert!(events.try_recv().is_err());

        db.add_event(&event(ActionType::GraphicShow, Outcome::Pending, at(0))).unwrap();
        assert_eq!(events.try_recv().unwrap().table, AUTOMATION_EVENTS_TABLE);

        assert_eq!(db.recent_transcripts(5).unwrap()[0].speaker.as_deref(), Some("host"));
    }

    #[test]
    fn closed_subscribers_are_pruned() {
        let db = AutomationDatabase::open_in_memory().unwrap();
        drop(db.subscribe("show_questions"));
        let live = db.subscribe("show_questions");

        db.publish_change("show_questions", ChangeKind::Insert, json!({ "id": 1 }));
        assert_eq!(live.try_recv().unwrap().row["id"], 1);
        assert_eq!(db.subscribers.lock().unwrap()["show_questions"].len(), 1);
    }

    #[test]
    fn on_disk_database_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("autodirector.db");
        {
            let db = AutomationDatabase::open(&path).unwrap();
            db.add_event(&event(
                ActionType::LowerThirdShow,
                Outcome::Executed,
                Utc::now() - Duration::minutes(1),
            ))
            .unwrap();
        }
        let reopened = AutomationDatabase::open(&path).unwrap();
        let events = reopened.list_events(&EventQuery::recent(10)).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action_type, ActionType::LowerThirdShow);
    }
}
