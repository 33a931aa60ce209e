//! The automation engine wires the pieces together:
//!
//! signal -> [`TriggerEvaluator`] -> [`PriorityQueue`] -> (learned confidence)
//! -> [`DecisionRouter`] -> [`MoodArbiter`] / [`ActionExecutor`] -> event log.
//!
//! Every routed candidate leaves exactly one [`AutomationEvent`] behind, which
//! is what the learning engine later reads back.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use flume::{Receiver, Sender};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex as AsyncMutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::sleep;

use super::config::{AutomationConfig, AutomationConfigPatch};
use super::executor::ActionExecutor;
use super::queue::{PriorityQueue, QueueStats, QueuedDecision, RATE_WINDOW_SECS};
use super::router::{DecisionRouter, Disposition, DropReason};
use super::trigger::{ConversationContext, RuleScope, TimerWindow, TriggerEvaluator, TriggerRule};
use super::types::{
    ActionType, AutomationEvent, CandidateAction, EventResolution, ExecutionMode, OperatorAction,
    Outcome, TriggerType,
};
use crate::clock::Clock;
use crate::datastore::{
    ChangeKind, Datastore, EventQuery, TranscriptLine, AUTOMATION_EVENTS_TABLE,
};
use crate::learning::{
    ConfidenceAdjustment, LearningEngine, LearningMetrics, OptimizationRecommendation,
};
use crate::mood::{Mood, MoodArbiter, MoodChangeResult, MoodSnapshot, MoodSource, Movement};

pub const DEFAULT_LEARNING_REFRESH_LIMIT: usize = 1000;
pub const SUGGESTION_EXPIRED: &str = "suggestion expired";
const RATE_LIMIT_EXCEEDED: &str = "Rate limit exceeded";

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EngineEvent {
    EventRecorded(AutomationEvent),
    EventResolved(AutomationEvent),
    MoodChanged(MoodSnapshot),
    ConfigChanged(AutomationConfig),
    EmergencyStop { active: bool },
    ShowStarted {
        started_at: DateTime<Utc>,
        scope: RuleScope,
    },
    SegmentStarted {
        started_at: DateTime<Utc>,
        segment: Option<String>,
    },
    Error(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineState {
    pub running: bool,
    pub config: AutomationConfig,
    pub queue_size: usize,
    pub queue_stats: QueueStats,
    pub show_started_at: Option<DateTime<Utc>>,
    pub segment_started_at: Option<DateTime<Utc>>,
    pub current_segment: Option<String>,
    pub scope: RuleScope,
    pub mood: Option<MoodSnapshot>,
}

#[derive(Debug, Default)]
struct ShowState {
    show_started_at: Option<DateTime<Utc>>,
    segment_started_at: Option<DateTime<Utc>>,
    segment: Option<String>,
    scope: RuleScope,
    last_tick: Option<DateTime<Utc>>,
    last_transcript_at: Option<DateTime<Utc>>,
    /// Pause rules that already fired during the current silence gap.
    fired_pause_rules: HashSet<String>,
}

pub struct AutomationEngine {
    store: Arc<dyn Datastore>,
    mood: Arc<MoodArbiter>,
    executor: Arc<dyn ActionExecutor>,
    clock: Arc<dyn Clock>,
    evaluator: TriggerEvaluator,
    config: RwLock<AutomationConfig>,
    learning: RwLock<LearningEngine>,
    queue: Mutex<PriorityQueue>,
    show: RwLock<ShowState>,
    /// Serializes decision processing so signals resolve in arrival order.
    pipeline: AsyncMutex<()>,
    pipeline_tx: Sender<()>,
    pipeline_rx: Receiver<()>,
    running: AtomicBool,
    event_tx: Sender<EngineEvent>,
    learning_refresh_limit: usize,
}

impl AutomationEngine {
    pub fn new(
        store: Arc<dyn Datastore>,
        mood: Arc<MoodArbiter>,
        executor: Arc<dyn ActionExecutor>,
        clock: Arc<dyn Clock>,
        event_tx: Sender<EngineEvent>,
    ) -> Self {
        let (pipeline_tx, pipeline_rx) = flume::unbounded();
        Self {
            store,
            mood,
            executor,
            queue: Mutex::new(PriorityQueue::new(clock.clone())),
            clock,
            evaluator: TriggerEvaluator::default(),
            config: RwLock::new(AutomationConfig::default()),
            learning: RwLock::new(LearningEngine::new()),
            show: RwLock::new(ShowState::default()),
            pipeline: AsyncMutex::new(()),
            pipeline_tx,
            pipeline_rx,
            running: AtomicBool::new(false),
            event_tx,
            learning_refresh_limit: DEFAULT_LEARNING_REFRESH_LIMIT,
        }
    }

    pub fn with_evaluator(mut self, evaluator: TriggerEvaluator) -> Self {
        self.evaluator = evaluator;
        self
    }

    pub fn with_learning(mut self, learning: LearningEngine) -> Self {
        self.learning = RwLock::new(learning);
        self
    }

    pub fn with_learning_refresh_limit(mut self, limit: usize) -> Self {
        self.learning_refresh_limit = limit.max(1);
        self
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.event_tx.send(event);
    }

    fn lock_queue(&self) -> Result<MutexGuard<'_, PriorityQueue>> {
        self.queue
            .lock()
            .map_err(|e| anyhow::anyhow!("Decision queue lock poisoned: {}", e))
    }

    /// Load mood state and routing config, then start accepting signals.
    pub async fn initialize(&self) -> Result<()> {
        self.mood
            .initialize()
            .await
            .context("failed to initialize mood state")?;

        let config = match self
            .store
            .load_automation_config()
            .await
            .context("failed to load automation config")?
        {
            Some(config) => config,
            None => {
                tracing::warn!("No automation config found, creating default");
                let config = AutomationConfig::default();
                self.store.save_automation_config(&config).await?;
                config
            }
        };
        if let Err(e) = config.validate() {
            tracing::warn!("Stored automation config is inconsistent: {}", e);
        }
        *self.config.write().await = config;

        if let Err(e) = self.refresh_learning().await {
            tracing::warn!("Failed to load learning history: {:#}", e);
        }

        self.running.store(true, Ordering::SeqCst);
        tracing::info!("Automation engine initialized");
        Ok(())
    }

    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        tracing::info!("Automation engine stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn mood(&self) -> &Arc<MoodArbiter> {
        &self.mood
    }

    pub async fn config(&self) -> AutomationConfig {
        self.config.read().await.clone()
    }

    /// Rule-driven signals are ignored while stopped, disabled or
    /// emergency-stopped. Manual triggers are not gated here.
    async fn accepting_triggers(&self) -> bool {
        if !self.is_running() {
            return false;
        }
        let config = self.config.read().await;
        config.enabled && !config.emergency_stop
    }

    async fn active_rules(&self) -> Result<Vec<TriggerRule>> {
        let now = self.clock.now();
        let scope = self.show.read().await.scope.clone();
        let rules = self.store.list_trigger_rules(true).await?;
        Ok(rules
            .into_iter()
            .filter(|rule| self.evaluator.is_rule_active(rule, now, &scope))
            .collect())
    }

    async fn enqueue_all(&self, candidates: Vec<CandidateAction>) -> Result<Vec<String>> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        let segment = self.show.read().await.segment.clone();
        let mut queue = self.lock_queue()?;
        Ok(candidates
            .into_iter()
            .map(|candidate| {
                tracing::debug!(
                    "Queued {} (trigger: {}, confidence: {:.2})",
                    candidate.action_type,
                    candidate.trigger_type,
                    candidate.confidence
                );
                queue.enqueue(candidate, segment.clone())
            })
            .collect())
    }

    // ---- signal entry points ----

    /// Operator command. Returns the decision id immediately; the decision
    /// resolves asynchronously on the pipeline.
    pub async fn manual_trigger(
        &self,
        action_type: ActionType,
        params: Value,
        context: Value,
    ) -> Result<String> {
        let candidate = self.evaluator.manual(action_type, params, context, None);
        let mut ids = self.enqueue_all(vec![candidate]).await?;
        let id = ids.pop().unwrap_or_default();
        tracing::info!("Manual trigger queued: {} ({})", action_type, id);
        let _ = self.pipeline_tx.send(());
        Ok(id)
    }

    /// Evaluate keyword and question-mark rules against one transcript line.
    pub async fn process_transcript(
        &self,
        text: &str,
        confidence: f64,
        spoken_at: Option<DateTime<Utc>>,
    ) -> Result<Vec<String>> {
        {
            let mut show = self.show.write().await;
            show.last_transcript_at = Some(spoken_at.unwrap_or_else(|| self.clock.now()));
            show.fired_pause_rules.clear();
        }
        if !self.accepting_triggers().await {
            return Ok(Vec::new());
        }

        let candidates = self
            .active_rules()
            .await?
            .iter()
            .filter_map(|rule| self.evaluator.evaluate_transcript(rule, text, confidence))
            .collect();
        let ids = self.enqueue_all(candidates).await?;
        if !ids.is_empty() {
            self.process_pending().await?;
        }
        Ok(ids)
    }

    pub async fn process_context(&self, context: &ConversationContext) -> Result<Vec<String>> {
        if !self.accepting_triggers().await {
            return Ok(Vec::new());
        }
        let candidates = self
            .active_rules()
            .await?
            .iter()
            .filter_map(|rule| self.evaluator.evaluate_context(rule, context))
            .collect();
        let ids = self.enqueue_all(candidates).await?;
        if !ids.is_empty() {
            self.process_pending().await?;
        }
        Ok(ids)
    }

    pub async fn process_table_event(
        &self,
        table: &str,
        kind: ChangeKind,
        row: &Value,
    ) -> Result<Vec<String>> {
        // The engine writes this table itself.
        if table == AUTOMATION_EVENTS_TABLE {
            return Ok(Vec::new());
        }
        if !self.accepting_triggers().await {
            return Ok(Vec::new());
        }
        let candidates = self
            .active_rules()
            .await?
            .iter()
            .filter_map(|rule| self.evaluator.evaluate_event(rule, table, kind, row))
            .collect();
        let ids = self.enqueue_all(candidates).await?;
        if !ids.is_empty() {
            self.process_pending().await?;
        }
        Ok(ids)
    }

    /// Periodic housekeeping: timer and pause rules, suggestion expiry,
    /// cooldown history cleanup.
    pub async fn tick(&self) -> Result<Vec<String>> {
        let now = self.clock.now();
        let (window, silence_seconds, already_fired) = {
            let mut show = self.show.write().await;
            let previous = show.last_tick.replace(now);
            let window = previous.map(|previous| TimerWindow {
                show_start: show.show_started_at,
                segment_start: show.segment_started_at,
                previous,
                now,
            });
            let silence = show
                .last_transcript_at
                .map(|at| (now - at).num_seconds().max(0) as u64);
            (window, silence, show.fired_pause_rules.clone())
        };

        self.expire_suggestions(now).await?;
        self.lock_queue()?.cleanup_history();

        if !self.accepting_triggers().await {
            return Ok(Vec::new());
        }

        let rules = self.active_rules().await?;
        let mut candidates = Vec::new();
        let mut fired_pauses = Vec::new();
        for rule in &rules {
            if let Some(window) = &window {
                if let Some(candidate) = self.evaluator.evaluate_timer(rule, window) {
                    candidates.push(candidate);
                    continue;
                }
            }
            if let Some(silence) = silence_seconds {
                if already_fired.contains(&rule.id) {
                    continue;
                }
                if let Some(candidate) = self.evaluator.evaluate_pause(rule, silence) {
                    fired_pauses.push(rule.id.clone());
                    candidates.push(candidate);
                }
            }
        }
        if !fired_pauses.is_empty() {
            self.show.write().await.fired_pause_rules.extend(fired_pauses);
        }

        let ids = self.enqueue_all(candidates).await?;
        if !ids.is_empty() {
            self.process_pending().await?;
        }
        Ok(ids)
    }

    async fn expire_suggestions(&self, now: DateTime<Utc>) -> Result<()> {
        let _guard = self.pipeline.lock().await;
        let Some(ttl) = self.config.read().await.suggestion_ttl_secs else {
            return Ok(());
        };
        let Some(cutoff) = expiry_cutoff(now, ttl) else {
            tracing::warn!("Suggestion TTL of {}s is out of range; skipping expiry", ttl);
            return Ok(());
        };
        let stale = self
            .store
            .query_events(&EventQuery {
                outcome: Some(Outcome::Pending),
                until: Some(cutoff),
                ..Default::default()
            })
            .await?;
        for event in stale {
            if self.settle(event, &expired_resolution()).await?.is_some() {
                tracing::info!("Expired stale suggestion");
            }
        }
        Ok(())
    }

    // ---- pipeline ----

    /// Drain the queue in priority order. Returns the events recorded.
    pub async fn process_pending(&self) -> Result<Vec<AutomationEvent>> {
        let _guard = self.pipeline.lock().await;
        let mut processed = Vec::new();
        loop {
            let next = self.lock_queue()?.dequeue();
            let Some(decision) = next else {
                break;
            };
            match self.process_decision(decision).await {
                Ok(event) => processed.push(event),
                Err(e) => {
                    tracing::error!("Decision processing failed: {:#}", e);
                    self.emit(EngineEvent::Error(format!("{:#}", e)));
                }
            }
        }
        Ok(processed)
    }

    async fn process_decision(&self, decision: QueuedDecision) -> Result<AutomationEvent> {
        let config = self.config.read().await.clone();
        let candidate = &decision.candidate;
        let manual = candidate.trigger_type == TriggerType::Manual;
        let gate_mode = if manual {
            ExecutionMode::Manual
        } else {
            ExecutionMode::Suggested
        };

        if !config.allows(candidate.action_type) {
            tracing::info!("Action not allowed: {}", candidate.action_type);
            return self
                .record_skipped(&decision, candidate.confidence, gate_mode, DropReason::NotAllowed.as_str())
                .await;
        }

        let (recent, cooldown_remaining) = {
            let queue = self.lock_queue()?;
            (
                queue.recent_execution_count(RATE_WINDOW_SECS),
                queue.cooldown_remaining(candidate.action_type, config.cooldown_seconds),
            )
        };
        if recent >= config.max_actions_per_minute as usize {
            tracing::warn!("Rate limit exceeded ({} actions in the last minute)", recent);
            return self
                .record_skipped(&decision, candidate.confidence, gate_mode, RATE_LIMIT_EXCEEDED)
                .await;
        }
        if cooldown_remaining > 0 {
            tracing::info!(
                "Action on cooldown: {} ({}s remaining)",
                candidate.action_type,
                cooldown_remaining
            );
            let reason = format!("Cooldown: {}s remaining", cooldown_remaining);
            return self
                .record_skipped(&decision, candidate.confidence, gate_mode, &reason)
                .await;
        }

        let confidence = if config.apply_learned_confidence && !manual {
            let adjustment = self.learning.write().await.adjust_confidence(
                candidate.action_type,
                candidate.confidence,
                candidate.trigger_type,
            );
            if adjustment.adjustment != 0.0 {
                tracing::debug!(
                    "Learned confidence for {}: {:.3} -> {:.3} ({})",
                    candidate.action_type,
                    adjustment.original_confidence,
                    adjustment.adjusted_confidence,
                    adjustment.reason
                );
            }
            adjustment.adjusted_confidence
        } else {
            candidate.confidence
        };

        let route = DecisionRouter::route(&config, candidate, confidence);
        match route.disposition {
            Disposition::Drop(reason) => {
                tracing::debug!("Dropped {}: {}", candidate.action_type, reason.as_str());
                self.record_skipped(&decision, route.confidence, route.mode, reason.as_str())
                    .await
            }
            Disposition::Suggest => {
                let event = self.new_event(&decision, route.confidence, route.mode, Outcome::Pending, None);
                self.record(&event).await?;
                tracing::info!("Suggestion created: {} ({})", event.action_type, event.id);
                Ok(event)
            }
            Disposition::AutoExecute => {
                let event = self.new_event(&decision, route.confidence, route.mode, Outcome::Pending, None);
                self.record(&event).await?;
                let (resolution, success) = self
                    .execute_action(
                        candidate.action_type,
                        &candidate.params,
                        candidate.trigger_type,
                        None,
                    )
                    .await;
                if success {
                    self.after_execution(candidate.action_type, candidate.rule_id.as_deref())
                        .await?;
                }
                let settled = self.settle(event.clone(), &resolution).await?;
                Ok(settled.unwrap_or(event))
            }
        }
    }

    fn new_event(
        &self,
        decision: &QueuedDecision,
        confidence: f64,
        mode: ExecutionMode,
        outcome: Outcome,
        error_message: Option<String>,
    ) -> AutomationEvent {
        let candidate = &decision.candidate;
        AutomationEvent {
            id: uuid::Uuid::new_v4().to_string(),
            decision_id: decision.id.clone(),
            created_at: self.clock.now(),
            trigger_type: candidate.trigger_type,
            trigger_data: candidate.trigger_data.clone(),
            confidence,
            action_type: candidate.action_type,
            action_data: candidate.params.clone(),
            execution_mode: mode,
            outcome,
            operator_action: None,
            execution_time_ms: None,
            error_message,
            show_segment: decision.show_segment.clone(),
            metadata: json!({
                "priority": decision.priority,
                "source": candidate.source,
                "rule_id": candidate.rule_id,
                "base_confidence": candidate.confidence,
            }),
        }
    }

    async fn record(&self, event: &AutomationEvent) -> Result<()> {
        self.store
            .insert_event(event)
            .await
            .with_context(|| format!("failed to record {} event", event.action_type))?;
        self.emit(EngineEvent::EventRecorded(event.clone()));
        Ok(())
    }

    async fn record_skipped(
        &self,
        decision: &QueuedDecision,
        confidence: f64,
        mode: ExecutionMode,
        reason: &str,
    ) -> Result<AutomationEvent> {
        let event = self.new_event(
            decision,
            confidence,
            mode,
            Outcome::Skipped,
            Some(reason.to_string()),
        );
        self.record(&event).await?;
        Ok(event)
    }

    /// Settle a pending event once. `None` when it was already terminal.
    async fn settle(
        &self,
        mut event: AutomationEvent,
        resolution: &EventResolution,
    ) -> Result<Option<AutomationEvent>> {
        if !self.store.resolve_event(&event.id, resolution).await? {
            return Ok(None);
        }
        event.apply_resolution(resolution)?;
        self.emit(EngineEvent::EventResolved(event.clone()));
        Ok(Some(event))
    }

    async fn after_execution(&self, action_type: ActionType, rule_id: Option<&str>) -> Result<()> {
        self.lock_queue()?.record_execution(action_type);
        if let Some(rule_id) = rule_id {
            self.store.increment_rule_execution(rule_id).await?;
        }
        Ok(())
    }

    /// Run one action. Mood actions go through the arbiter, whose verdict
    /// wins; everything else goes to the executor. No retries.
    async fn execute_action(
        &self,
        action_type: ActionType,
        params: &Value,
        trigger_type: TriggerType,
        operator_action: Option<OperatorAction>,
    ) -> (EventResolution, bool) {
        if !action_type.is_mood_action() {
            let result = self.executor.execute(action_type, params).await;
            if result.success {
                tracing::info!("Executed {} in {}ms", action_type, result.execution_time_ms);
            } else {
                tracing::warn!(
                    "Execution failed for {}: {}",
                    action_type,
                    result.error.as_deref().unwrap_or("unknown error")
                );
            }
            let outcome = if result.success {
                Outcome::Executed
            } else {
                Outcome::Failed
            };
            return (
                EventResolution {
                    outcome,
                    operator_action,
                    execution_time_ms: Some(result.execution_time_ms),
                    error_message: result.error,
                },
                result.success,
            );
        }

        let started = Instant::now();
        let verdict = match self.apply_mood_action(action_type, params, trigger_type).await {
            Ok(verdict) => verdict,
            Err(e) => MoodChangeResult::Error {
                reason: format!("{:#}", e),
            },
        };
        let execution_time_ms = Some(started.elapsed().as_millis() as u64);

        let (outcome, error_message) = match &verdict {
            MoodChangeResult::Applied => (Outcome::Executed, None),
            MoodChangeResult::Blocked { reason, .. } => (
                Outcome::Skipped,
                Some(format!("Mood change blocked: {}", reason.as_str())),
            ),
            MoodChangeResult::Error { reason } => (Outcome::Failed, Some(reason.clone())),
        };
        (
            EventResolution {
                outcome,
                operator_action,
                execution_time_ms,
                error_message,
            },
            verdict.is_applied(),
        )
    }

    async fn apply_mood_action(
        &self,
        action_type: ActionType,
        params: &Value,
        trigger_type: TriggerType,
    ) -> Result<MoodChangeResult> {
        let source = match params.get("source").and_then(Value::as_str) {
            Some(raw) => raw.parse::<MoodSource>()?,
            None => mood_source_for(trigger_type),
        };

        let verdict = if action_type == ActionType::BetabotMovement {
            let raw = params
                .get("movement")
                .and_then(Value::as_str)
                .context("movement action needs a 'movement' param")?;
            self.mood.set_movement(raw.parse::<Movement>()?, source).await
        } else {
            let raw = params
                .get("mood")
                .and_then(Value::as_str)
                .context("mood action needs a 'mood' param")?;
            let duration = params.get("duration_minutes").and_then(Value::as_f64);
            self.mood.set_mood(raw.parse::<Mood>()?, source, duration).await
        };

        if verdict.is_applied() {
            self.emit_mood_snapshot().await;
        }
        Ok(verdict)
    }

    async fn emit_mood_snapshot(&self) {
        match self.mood.snapshot().await {
            Ok(snapshot) => self.emit(EngineEvent::MoodChanged(snapshot)),
            Err(e) => tracing::warn!("Failed to read mood snapshot: {:#}", e),
        }
    }

    // ---- operator feedback ----

    /// Execute a pending suggestion. `None` when it is missing or already
    /// resolved.
    pub async fn approve_suggestion(&self, event_id: &str) -> Result<Option<AutomationEvent>> {
        let _guard = self.pipeline.lock().await;
        let Some(event) = self.pending_event(event_id).await? else {
            return Ok(None);
        };
        let ttl = self.config.read().await.suggestion_ttl_secs;
        let expired = ttl
            .and_then(|ttl| expiry_cutoff(self.clock.now(), ttl))
            .is_some_and(|cutoff| event.created_at < cutoff);
        if expired {
            tracing::warn!("Suggestion {} expired before approval", event_id);
            self.settle(event, &expired_resolution()).await?;
            return Ok(None);
        }

        let (resolution, success) = self
            .execute_action(
                event.action_type,
                &event.action_data,
                event.trigger_type,
                Some(OperatorAction::Approved),
            )
            .await;
        if success {
            let rule_id = event
                .metadata
                .get("rule_id")
                .and_then(Value::as_str)
                .map(str::to_string);
            self.after_execution(event.action_type, rule_id.as_deref())
                .await?;
        }
        let settled = self.settle(event, &resolution).await?;
        if settled.is_some() {
            tracing::info!("Suggestion approved: {}", event_id);
            self.refresh_learning_quietly().await;
        }
        Ok(settled)
    }

    pub async fn reject_suggestion(&self, event_id: &str) -> Result<Option<AutomationEvent>> {
        let _guard = self.pipeline.lock().await;
        let Some(event) = self.pending_event(event_id).await? else {
            return Ok(None);
        };
        let resolution = EventResolution {
            outcome: Outcome::Skipped,
            operator_action: Some(OperatorAction::Rejected),
            execution_time_ms: None,
            error_message: None,
        };
        let settled = self.settle(event, &resolution).await?;
        if settled.is_some() {
            tracing::info!("Suggestion rejected: {}", event_id);
            self.refresh_learning_quietly().await;
        }
        Ok(settled)
    }

    async fn pending_event(&self, event_id: &str) -> Result<Option<AutomationEvent>> {
        match self.store.get_event(event_id).await? {
            Some(event) if event.outcome == Outcome::Pending => Ok(Some(event)),
            _ => {
                tracing::warn!("Suggestion not found or already processed: {}", event_id);
                Ok(None)
            }
        }
    }

    // ---- configuration and show control ----

    pub async fn update_config(&self, patch: &AutomationConfigPatch) -> Result<AutomationConfig> {
        let mut config = self.config.write().await;
        let next = config.patched(patch, self.clock.now())?;
        self.store
            .save_automation_config(&next)
            .await
            .context("failed to save automation config")?;
        *config = next.clone();
        drop(config);

        tracing::info!("Automation config updated");
        self.emit(EngineEvent::ConfigChanged(next.clone()));
        Ok(next)
    }

    /// Stop all rule-driven automation and drop everything queued.
    pub async fn emergency_stop(&self) -> Result<AutomationConfig> {
        let config = self
            .update_config(&AutomationConfigPatch {
                emergency_stop: Some(true),
                ..Default::default()
            })
            .await?;
        self.lock_queue()?.clear();
        tracing::warn!("EMERGENCY STOP activated");
        self.emit(EngineEvent::EmergencyStop { active: true });
        Ok(config)
    }

    pub async fn resume(&self) -> Result<AutomationConfig> {
        let config = self
            .update_config(&AutomationConfigPatch {
                emergency_stop: Some(false),
                ..Default::default()
            })
            .await?;
        tracing::info!("Resumed from emergency stop");
        self.emit(EngineEvent::EmergencyStop { active: false });
        Ok(config)
    }

    /// Mark the show as started: timers count from now and per-show rule
    /// execution counts reset.
    pub async fn start_show(&self, scope: RuleScope) -> Result<()> {
        self.store
            .reset_rule_execution_counts()
            .await
            .context("failed to reset rule execution counts")?;
        let now = self.clock.now();
        {
            let mut show = self.show.write().await;
            show.show_started_at = Some(now);
            show.segment_started_at = Some(now);
            show.segment = None;
            show.scope = scope.clone();
            show.last_tick = Some(now);
            show.fired_pause_rules.clear();
        }
        tracing::info!("Show started at {}", now);
        self.emit(EngineEvent::ShowStarted {
            started_at: now,
            scope,
        });
        Ok(())
    }

    pub async fn start_segment(&self, segment: Option<String>) {
        let now = self.clock.now();
        {
            let mut show = self.show.write().await;
            show.segment_started_at = Some(now);
            show.segment = segment.clone();
        }
        tracing::info!("Segment started: {}", segment.as_deref().unwrap_or("(unnamed)"));
        self.emit(EngineEvent::SegmentStarted {
            started_at: now,
            segment,
        });
    }

    pub async fn set_scope(&self, scope: RuleScope) {
        self.show.write().await.scope = scope;
    }

    // ---- mood passthroughs that announce changes ----

    pub async fn set_mood(
        &self,
        mood: Mood,
        source: MoodSource,
        duration_minutes: Option<f64>,
    ) -> MoodChangeResult {
        let verdict = self.mood.set_mood(mood, source, duration_minutes).await;
        if verdict.is_applied() {
            self.emit_mood_snapshot().await;
        }
        verdict
    }

    pub async fn set_movement(&self, movement: Movement, source: MoodSource) -> MoodChangeResult {
        let verdict = self.mood.set_movement(movement, source).await;
        if verdict.is_applied() {
            self.emit_mood_snapshot().await;
        }
        verdict
    }

    // ---- queries ----

    pub async fn recent_events(&self, query: &EventQuery) -> Result<Vec<AutomationEvent>> {
        self.store.query_events(query).await
    }

    pub fn queued(&self) -> Result<Vec<QueuedDecision>> {
        Ok(self.lock_queue()?.snapshot())
    }

    pub async fn state(&self) -> Result<EngineState> {
        let config = self.config.read().await.clone();
        let (queue_size, queue_stats) = {
            let queue = self.lock_queue()?;
            (queue.len(), queue.stats())
        };
        let (show_started_at, segment_started_at, current_segment, scope) = {
            let show = self.show.read().await;
            (
                show.show_started_at,
                show.segment_started_at,
                show.segment.clone(),
                show.scope.clone(),
            )
        };
        let mood = match self.mood.snapshot().await {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                tracing::warn!("Mood snapshot unavailable: {:#}", e);
                None
            }
        };
        Ok(EngineState {
            running: self.is_running(),
            config,
            queue_size,
            queue_stats,
            show_started_at,
            segment_started_at,
            current_segment,
            scope,
            mood,
        })
    }

    // ---- learning ----

    /// Reload the learning snapshot from the most recent events.
    pub async fn refresh_learning(&self) -> Result<usize> {
        let events = self
            .store
            .query_events(&EventQuery::recent(self.learning_refresh_limit))
            .await?;
        let count = events.len();
        self.learning.write().await.ingest_events(events);
        Ok(count)
    }

    async fn refresh_learning_quietly(&self) {
        if let Err(e) = self.refresh_learning().await {
            tracing::warn!("Failed to refresh learning snapshot: {:#}", e);
        }
    }

    pub async fn metrics(&self) -> LearningMetrics {
        self.learning.read().await.calculate_metrics(self.clock.now())
    }

    pub async fn recommendations(&self) -> Vec<OptimizationRecommendation> {
        let config = self.config.read().await.clone();
        self.learning
            .read()
            .await
            .generate_recommendations(&config, self.clock.now())
    }

    pub async fn adjust_confidence(
        &self,
        action_type: ActionType,
        confidence: f64,
        trigger_type: TriggerType,
    ) -> ConfidenceAdjustment {
        self.learning
            .write()
            .await
            .adjust_confidence(action_type, confidence, trigger_type)
    }

    pub async fn adjustment_history(&self) -> Vec<ConfidenceAdjustment> {
        self.learning.read().await.adjustment_history()
    }

    pub async fn learning_rate(&self) -> f64 {
        self.learning.read().await.learning_rate()
    }

    pub async fn set_learning_rate(&self, rate: f64) -> f64 {
        let mut learning = self.learning.write().await;
        learning.set_learning_rate(rate);
        learning.learning_rate()
    }

    pub async fn export_metrics_csv(&self) -> String {
        self.learning.read().await.export_metrics_csv(self.clock.now())
    }

    pub async fn export_events_json(&self) -> Result<String> {
        self.learning.read().await.export_events_json()
    }

    // ---- background tasks ----

    /// Resolve manual triggers as they arrive.
    pub fn spawn_pipeline(self: &Arc<Self>) -> JoinHandle<()> {
        let engine = self.clone();
        let signals = self.pipeline_rx.clone();
        tokio::spawn(async move {
            while signals.recv_async().await.is_ok() {
                if let Err(e) = engine.process_pending().await {
                    tracing::error!("Pipeline error: {:#}", e);
                }
            }
        })
    }

    pub fn spawn_tick_loop(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            tracing::info!("Automation tick loop starting ({}ms)", interval.as_millis());
            while engine.is_running() {
                sleep(interval).await;
                if let Err(e) = engine.tick().await {
                    tracing::error!("Automation tick error: {:#}", e);
                    engine.emit(EngineEvent::Error(format!("{:#}", e)));
                }
            }
        })
    }

    /// Feed transcript rows from the change feed into the evaluator.
    pub fn spawn_transcript_listener(self: &Arc<Self>, table: &str) -> JoinHandle<()> {
        let engine = self.clone();
        let changes = self.store.subscribe(table);
        let table = table.to_string();
        tokio::spawn(async move {
            tracing::info!("Listening for transcripts on '{}'", table);
            while let Ok(change) = changes.recv_async().await {
                if change.kind != ChangeKind::Insert {
                    continue;
                }
                let line: TranscriptLine = match serde_json::from_value(change.row) {
                    Ok(line) => line,
                    Err(e) => {
                        tracing::warn!("Ignoring malformed transcript row: {}", e);
                        continue;
                    }
                };
                if let Err(e) = engine
                    .process_transcript(&line.text, line.confidence, Some(line.created_at))
                    .await
                {
                    tracing::error!("Transcript processing failed: {:#}", e);
                }
            }
        })
    }

    /// Feed row changes of `table` into event-trigger rules.
    pub fn spawn_table_listener(self: &Arc<Self>, table: &str) -> JoinHandle<()> {
        let engine = self.clone();
        let changes = self.store.subscribe(table);
        let table = table.to_string();
        tokio::spawn(async move {
            tracing::info!("Listening for row changes on '{}'", table);
            while let Ok(change) = changes.recv_async().await {
                if let Err(e) = engine
                    .process_table_event(&change.table, change.kind, &change.row)
                    .await
                {
                    tracing::error!("Table event processing failed: {:#}", e);
                }
            }
        })
    }
}

/// Who is asking, from the arbiter's point of view.
fn mood_source_for(trigger_type: TriggerType) -> MoodSource {
    match trigger_type {
        TriggerType::Manual => MoodSource::Manual,
        TriggerType::Keyword | TriggerType::QuestionMark | TriggerType::Pause => {
            MoodSource::Conversation
        }
        _ => MoodSource::Context,
    }
}

/// Suggestions created before this instant are stale.
fn expiry_cutoff(now: DateTime<Utc>, ttl_secs: u64) -> Option<DateTime<Utc>> {
    i64::try_from(ttl_secs)
        .ok()
        .and_then(ChronoDuration::try_seconds)
        .and_then(|ttl| now.checked_sub_signed(ttl))
}

fn expired_resolution() -> EventResolution {
    EventResolution {
        outcome: Outcome::Skipped,
        operator_action: None,
        execution_time_ms: None,
        error_message: Some(SUGGESTION_EXPIRED.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automation::trigger::{KeywordMatch, TimerReference, TriggerCondition};
    use crate::automation::types::ActionResult;
    use crate::clock::ManualClock;
    use crate::database::AutomationDatabase;
    use async_trait::async_trait;
    use chrono::TimeZone;

    #[derive(Default)]
    struct RecordingExecutor {
        calls: Mutex<Vec<(ActionType, Value)>>,
        fail: bool,
        delay: Option<std::time::Duration>,
    }

    impl RecordingExecutor {
        fn failing() -> Self {
            Self {
                fail: true,
                ..Default::default()
            }
        }

        fn slow(delay: std::time::Duration) -> Self {
            Self {
                delay: Some(delay),
                ..Default::default()
            }
        }

        fn calls(&self) -> Vec<(ActionType, Value)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ActionExecutor for RecordingExecutor {
        async fn execute(&self, action_type: ActionType, params: &Value) -> ActionResult {
            self.calls.lock().unwrap().push((action_type, params.clone()));
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            ActionResult {
                success: !self.fail,
                action_type,
                execution_time_ms: 12,
                error: self.fail.then(|| "bridge offline".to_string()),
                metadata: Value::Null,
            }
        }
    }

    struct Harness {
        engine: Arc<AutomationEngine>,
        db: Arc<AutomationDatabase>,
        clock: Arc<ManualClock>,
        executor: Arc<RecordingExecutor>,
        events: Receiver<EngineEvent>,
    }

    fn start_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 19, 0, 0).unwrap()
    }

    async fn harness_with(config: AutomationConfig, executor: RecordingExecutor) -> Harness {
        let db = Arc::new(AutomationDatabase::open_in_memory().unwrap());
        db.put_automation_config(&config).unwrap();
        let clock = Arc::new(ManualClock::new(start_time()));
        let executor = Arc::new(executor);
        let mood = Arc::new(MoodArbiter::new(db.clone(), clock.clone()));
        let (event_tx, events) = flume::unbounded();
        let engine = Arc::new(AutomationEngine::new(
            db.clone(),
            mood,
            executor.clone(),
            clock.clone(),
            event_tx,
        ));
        engine.initialize().await.unwrap();
        Harness {
            engine,
            db,
            clock,
            executor,
            events,
        }
    }

    async fn harness(config: AutomationConfig) -> Harness {
        harness_with(config, RecordingExecutor::default()).await
    }

    fn auto_config() -> AutomationConfig {
        AutomationConfig {
            auto_execute_enabled: true,
            cooldown_seconds: 0,
            ..Default::default()
        }
    }

    fn keyword_rule(keyword: &str, action_type: ActionType) -> TriggerRule {
        TriggerRule::new(
            keyword,
            TriggerCondition::Keyword {
                keywords: vec![keyword.to_string()],
                match_type: KeywordMatch::Any,
                case_sensitive: false,
            },
            action_type,
        )
    }

    #[tokio::test]
    async fn manual_trigger_resolves_on_the_pipeline() {
        let h = harness(AutomationConfig::default()).await;
        let id = h
            .engine
            .manual_trigger(
                ActionType::GraphicShow,
                json!({ "graphic": "poll" }),
                json!({ "operator": "desk" }),
            )
            .await
            .unwrap();
        assert!(!id.is_empty());

        let processed = h.engine.process_pending().await.unwrap();
        assert_eq!(processed.len(), 1);
        let event = &processed[0];
        assert_eq!(event.decision_id, id);
        assert_eq!(event.execution_mode, ExecutionMode::Manual);
        assert_eq!(event.outcome, Outcome::Executed);
        assert_eq!(event.execution_time_ms, Some(12));
        assert_eq!(event.metadata["source"], "operator");

        let stored = h.db.find_event(&event.id).unwrap().unwrap();
        assert_eq!(stored.outcome, Outcome::Executed);
        assert_eq!(h.executor.calls()[0].1["graphic"], "poll");

        let mut kinds = Vec::new();
        while let Ok(event) = h.events.try_recv() {
            kinds.push(match event {
                EngineEvent::EventRecorded(_) => "recorded",
                EngineEvent::EventResolved(_) => "resolved",
                _ => "other",
            });
        }
        assert_eq!(kinds, vec!["recorded", "resolved"]);
    }

    #[tokio::test]
    async fn transcript_confidence_selects_the_route() {
        let h = harness(auto_config()).await;
        h.db.upsert_trigger_rule(&keyword_rule("breaking", ActionType::GraphicShow))
            .unwrap();

        h.engine.process_transcript("breaking news", 0.9, None).await.unwrap();
        h.engine.process_transcript("breaking again", 0.7, None).await.unwrap();
        h.engine.process_transcript("breaking quietly", 0.3, None).await.unwrap();

        let events = h.engine.recent_events(&EventQuery::default()).await.unwrap();
        assert_eq!(events.len(), 3);
        let by_confidence = |c: f64| {
            events
                .iter()
                .find(|e| (e.confidence - c).abs() < 1e-9)
                .unwrap()
                .clone()
        };
        let auto = by_confidence(0.9);
        assert_eq!(auto.execution_mode, ExecutionMode::Auto);
        assert_eq!(auto.outcome, Outcome::Executed);

        let suggested = by_confidence(0.7);
        assert_eq!(suggested.execution_mode, ExecutionMode::Suggested);
        assert_eq!(suggested.outcome, Outcome::Pending);

        let dropped = by_confidence(0.3);
        assert_eq!(dropped.outcome, Outcome::Skipped);
        assert_eq!(
            dropped.error_message.as_deref(),
            Some(DropReason::BelowThreshold.as_str())
        );
        assert_eq!(h.executor.calls().len(), 1);
    }

    #[tokio::test]
    async fn approval_executes_and_rejection_skips() {
        let h = harness(AutomationConfig::default()).await;
        h.db.upsert_trigger_rule(&keyword_rule("clip", ActionType::GraphicShow))
            .unwrap();
        h.db.upsert_trigger_rule(&keyword_rule("horn", ActionType::SoundboardPlay))
            .unwrap();
        h.engine.process_transcript("roll the clip", 0.95, None).await.unwrap();
        h.engine.process_transcript("air horn please", 0.95, None).await.unwrap();

        let pending = h
            .engine
            .recent_events(&EventQuery {
                outcome: Some(Outcome::Pending),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(pending.len(), 2);
        let clip = pending
            .iter()
            .find(|e| e.action_type == ActionType::GraphicShow)
            .unwrap();
        let horn = pending
            .iter()
            .find(|e| e.action_type == ActionType::SoundboardPlay)
            .unwrap();

        let approved = h.engine.approve_suggestion(&clip.id).await.unwrap().unwrap();
        assert_eq!(approved.outcome, Outcome::Executed);
        assert_eq!(approved.operator_action, Some(OperatorAction::Approved));
        assert!(h.engine.approve_suggestion(&clip.id).await.unwrap().is_none());

        let rejected = h.engine.reject_suggestion(&horn.id).await.unwrap().unwrap();
        assert_eq!(rejected.outcome, Outcome::Skipped);
        assert_eq!(rejected.operator_action, Some(OperatorAction::Rejected));
        assert!(h.engine.approve_suggestion(&horn.id).await.unwrap().is_none());

        assert_eq!(h.executor.calls().len(), 1);
        assert_eq!(h.engine.metrics().await.total_events, 2);
    }

    #[tokio::test]
    async fn cooldown_and_rate_limit_skip_with_reason() {
        let h = harness(AutomationConfig {
            cooldown_seconds: 5,
            max_actions_per_minute: 2,
            ..Default::default()
        })
        .await;

        h.engine
            .manual_trigger(ActionType::GraphicShow, json!({}), json!({}))
            .await
            .unwrap();
        h.engine
            .manual_trigger(ActionType::GraphicShow, json!({}), json!({}))
            .await
            .unwrap();
        let processed = h.engine.process_pending().await.unwrap();
        assert_eq!(processed[0].outcome, Outcome::Executed);
        assert_eq!(processed[1].outcome, Outcome::Skipped);
        assert_eq!(
            processed[1].error_message.as_deref(),
            Some("Cooldown: 5s remaining")
        );

        h.clock.advance_secs(5);
        h.engine
            .manual_trigger(ActionType::GraphicShow, json!({}), json!({}))
            .await
            .unwrap();
        h.engine
            .manual_trigger(ActionType::SoundboardPlay, json!({}), json!({}))
            .await
            .unwrap();
        let processed = h.engine.process_pending().await.unwrap();
        assert_eq!(processed[0].outcome, Outcome::Executed);
        assert_eq!(processed[1].outcome, Outcome::Skipped);
        assert_eq!(processed[1].error_message.as_deref(), Some(RATE_LIMIT_EXCEEDED));
    }

    #[tokio::test]
    async fn executor_failure_is_recorded_without_retry() {
        let h = harness_with(AutomationConfig::default(), RecordingExecutor::failing()).await;
        h.engine
            .manual_trigger(ActionType::ObsScene, json!({ "scene": "Wide" }), json!({}))
            .await
            .unwrap();
        let processed = h.engine.process_pending().await.unwrap();
        assert_eq!(processed[0].outcome, Outcome::Failed);
        assert_eq!(processed[0].error_message.as_deref(), Some("bridge offline"));
        assert_eq!(processed[0].execution_time_ms, Some(12));
        assert_eq!(h.executor.calls().len(), 1);

        // Failed executions do not start a cooldown.
        h.engine
            .manual_trigger(ActionType::ObsScene, json!({ "scene": "Wide" }), json!({}))
            .await
            .unwrap();
        let processed = h.engine.process_pending().await.unwrap();
        assert_eq!(processed[0].outcome, Outcome::Failed);
    }

    #[tokio::test]
    async fn emergency_stop_silences_rules_but_not_the_operator() {
        let h = harness(auto_config()).await;
        h.db.upsert_trigger_rule(&keyword_rule("breaking", ActionType::GraphicShow))
            .unwrap();

        h.engine
            .manual_trigger(ActionType::SoundboardPlay, json!({}), json!({}))
            .await
            .unwrap();
        let config = h.engine.emergency_stop().await.unwrap();
        assert!(config.emergency_stop);
        assert!(h.engine.queued().unwrap().is_empty());

        let ids = h
            .engine
            .process_transcript("breaking news", 0.99, None)
            .await
            .unwrap();
        assert!(ids.is_empty());

        h.engine
            .manual_trigger(ActionType::LowerThirdShow, json!({}), json!({}))
            .await
            .unwrap();
        let processed = h.engine.process_pending().await.unwrap();
        assert_eq!(processed.len(), 1);
        assert_eq!(processed[0].action_type, ActionType::LowerThirdShow);
        assert_eq!(processed[0].outcome, Outcome::Executed);

        h.engine.resume().await.unwrap();
        assert_eq!(
            h.engine.process_transcript("breaking news", 0.99, None).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn mood_actions_defer_to_the_arbiter() {
        let h = harness(auto_config()).await;
        h.db.upsert_trigger_rule(&{
            let mut rule = keyword_rule("hilarious", ActionType::BetabotMood);
            rule.action_params = json!({ "mood": "amused" });
            rule
        })
        .unwrap();

        h.engine
            .manual_trigger(
                ActionType::BetabotMood,
                json!({ "mood": "spicy", "duration_minutes": 2 }),
                json!({}),
            )
            .await
            .unwrap();
        let processed = h.engine.process_pending().await.unwrap();
        assert_eq!(processed[0].outcome, Outcome::Executed);

        let state = h.engine.state().await.unwrap();
        let mood = state.mood.unwrap();
        assert_eq!(mood.mood, Mood::Spicy);
        assert_eq!(mood.source, MoodSource::Manual);

        h.engine
            .process_transcript("that was hilarious", 0.95, None)
            .await
            .unwrap();
        let latest = h.engine.recent_events(&EventQuery::recent(1)).await.unwrap();
        assert_eq!(latest[0].outcome, Outcome::Skipped);
        assert!(latest[0]
            .error_message
            .as_deref()
            .unwrap()
            .contains("manual_override"));

        // Override over: the conversation source wins now.
        h.clock.advance_secs(121);
        h.engine
            .process_transcript("still hilarious", 0.95, None)
            .await
            .unwrap();
        assert_eq!(h.engine.mood().snapshot().await.unwrap().mood, Mood::Amused);
        assert!(h.executor.calls().is_empty());
    }

    #[tokio::test]
    async fn invalid_mood_params_fail_the_event() {
        let h = harness(AutomationConfig::default()).await;
        h.engine
            .manual_trigger(ActionType::BetabotMood, json!({ "mood": "furious" }), json!({}))
            .await
            .unwrap();
        let processed = h.engine.process_pending().await.unwrap();
        assert_eq!(processed[0].outcome, Outcome::Failed);
        assert!(processed[0].error_message.is_some());
    }

    #[tokio::test]
    async fn dry_run_turns_auto_into_suggestions() {
        let h = harness(AutomationConfig {
            dry_run: true,
            ..auto_config()
        })
        .await;
        h.db.upsert_trigger_rule(&keyword_rule("breaking", ActionType::GraphicShow))
            .unwrap();
        h.engine.process_transcript("breaking news", 0.99, None).await.unwrap();
        h.engine
            .manual_trigger(ActionType::SoundboardPlay, json!({}), json!({}))
            .await
            .unwrap();
        h.engine.process_pending().await.unwrap();

        let events = h.engine.recent_events(&EventQuery::default()).await.unwrap();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.outcome == Outcome::Pending));
        assert!(h.executor.calls().is_empty());
    }

    #[tokio::test]
    async fn timers_fire_once_when_crossed() {
        let h = harness(auto_config()).await;
        h.db.upsert_trigger_rule(&TriggerRule::new(
            "five minutes in",
            TriggerCondition::Timer {
                reference: TimerReference::ShowStart,
                offset_seconds: 300,
            },
            ActionType::LowerThirdShow,
        ))
        .unwrap();

        assert!(h.engine.tick().await.unwrap().is_empty());
        h.engine.start_show(RuleScope::default()).await.unwrap();
        h.clock.advance_secs(299);
        assert!(h.engine.tick().await.unwrap().is_empty());
        h.clock.advance_secs(2);
        assert_eq!(h.engine.tick().await.unwrap().len(), 1);
        h.clock.advance_secs(10);
        assert!(h.engine.tick().await.unwrap().is_empty());

        let events = h.engine.recent_events(&EventQuery::default()).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].trigger_type, TriggerType::TimeBased);
        assert_eq!(events[0].outcome, Outcome::Executed);
    }

    #[tokio::test]
    async fn zero_offset_timer_fires_on_first_tick_of_the_show() {
        let h = harness(auto_config()).await;
        h.db.upsert_trigger_rule(&TriggerRule::new(
            "opening scene",
            TriggerCondition::Timer {
                reference: TimerReference::ShowStart,
                offset_seconds: 0,
            },
            ActionType::ObsScene,
        ))
        .unwrap();

        h.engine.start_show(RuleScope::default()).await.unwrap();
        h.clock.advance_secs(1);
        assert_eq!(h.engine.tick().await.unwrap().len(), 1);
        h.clock.advance_secs(1);
        assert!(h.engine.tick().await.unwrap().is_empty());
        assert_eq!(h.executor.calls().len(), 1);
    }

    #[tokio::test]
    async fn pause_fires_once_per_silence_gap() {
        let h = harness(AutomationConfig::default()).await;
        h.db.upsert_trigger_rule(&TriggerRule::new(
            "dead air",
            TriggerCondition::Pause {
                min_silence_seconds: 8,
            },
            ActionType::BetabotSpeaking,
        ))
        .unwrap();

        h.engine.process_transcript("and that's the news", 0.9, None).await.unwrap();
        h.clock.advance_secs(5);
        assert!(h.engine.tick().await.unwrap().is_empty());
        h.clock.advance_secs(5);
        assert_eq!(h.engine.tick().await.unwrap().len(), 1);
        h.clock.advance_secs(5);
        assert!(h.engine.tick().await.unwrap().is_empty());

        h.engine.process_transcript("back again", 0.9, None).await.unwrap();
        h.clock.advance_secs(9);
        assert_eq!(h.engine.tick().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stale_suggestions_expire_when_ttl_is_set() {
        let h = harness(AutomationConfig {
            suggestion_ttl_secs: Some(60),
            ..Default::default()
        })
        .await;
        h.db.upsert_trigger_rule(&keyword_rule("clip", ActionType::GraphicShow))
            .unwrap();
        h.engine.process_transcript("roll the clip", 0.9, None).await.unwrap();

        h.clock.advance_secs(30);
        h.engine.tick().await.unwrap();
        let events = h.engine.recent_events(&EventQuery::default()).await.unwrap();
        assert_eq!(events[0].outcome, Outcome::Pending);

        h.clock.advance_secs(31);
        h.engine.tick().await.unwrap();
        let events = h.engine.recent_events(&EventQuery::default()).await.unwrap();
        assert_eq!(events[0].outcome, Outcome::Skipped);
        assert_eq!(events[0].error_message.as_deref(), Some(SUGGESTION_EXPIRED));
    }

    #[tokio::test]
    async fn approving_an_expired_suggestion_does_not_execute() {
        let h = harness(AutomationConfig {
            suggestion_ttl_secs: Some(60),
            ..Default::default()
        })
        .await;
        h.db.upsert_trigger_rule(&keyword_rule("clip", ActionType::GraphicShow))
            .unwrap();
        h.engine.process_transcript("roll the clip", 0.9, None).await.unwrap();
        let events = h.engine.recent_events(&EventQuery::default()).await.unwrap();
        let id = events[0].id.clone();

        h.clock.advance_secs(61);
        assert!(h.engine.approve_suggestion(&id).await.unwrap().is_none());
        assert!(h.executor.calls().is_empty());

        let stored = h.db.find_event(&id).unwrap().unwrap();
        assert_eq!(stored.outcome, Outcome::Skipped);
        assert_eq!(stored.operator_action, None);
        assert_eq!(stored.error_message.as_deref(), Some(SUGGESTION_EXPIRED));
    }

    #[tokio::test]
    async fn expiry_waits_for_an_in_flight_approval() {
        let h = harness_with(
            AutomationConfig {
                suggestion_ttl_secs: Some(60),
                ..Default::default()
            },
            RecordingExecutor::slow(std::time::Duration::from_millis(50)),
        )
        .await;
        h.db.upsert_trigger_rule(&keyword_rule("clip", ActionType::GraphicShow))
            .unwrap();
        h.engine.process_transcript("roll the clip", 0.9, None).await.unwrap();
        let events = h.engine.recent_events(&EventQuery::default()).await.unwrap();
        let id = events[0].id.clone();

        h.clock.advance_secs(59);
        let approval = tokio::spawn({
            let engine = h.engine.clone();
            let id = id.clone();
            async move { engine.approve_suggestion(&id).await }
        });
        // Let the approval reach the executor before the TTL passes.
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        h.clock.advance_secs(2);
        h.engine.tick().await.unwrap();

        let approved = approval.await.unwrap().unwrap().unwrap();
        assert_eq!(approved.outcome, Outcome::Executed);
        assert_eq!(approved.operator_action, Some(OperatorAction::Approved));
        assert_eq!(h.executor.calls().len(), 1);
        let stored = h.db.find_event(&id).unwrap().unwrap();
        assert_eq!(stored.outcome, Outcome::Executed);
    }

    #[tokio::test]
    async fn oversized_ttl_is_rejected_and_tick_keeps_running() {
        let h = harness(AutomationConfig::default()).await;
        let err = h
            .engine
            .update_config(&AutomationConfigPatch {
                suggestion_ttl_secs: Some(100_000_000_000_000_000),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("suggestion_ttl_secs"));
        assert_eq!(h.engine.config().await.suggestion_ttl_secs, None);
        assert!(h.engine.tick().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn out_of_range_ttl_skips_expiry_without_panicking() {
        let h = harness(AutomationConfig {
            suggestion_ttl_secs: Some(u64::MAX),
            ..Default::default()
        })
        .await;
        h.db.upsert_trigger_rule(&keyword_rule("clip", ActionType::GraphicShow))
            .unwrap();
        h.engine.process_transcript("roll the clip", 0.9, None).await.unwrap();
        h.clock.advance_secs(3600);
        h.engine.tick().await.unwrap();
        let events = h.engine.recent_events(&EventQuery::default()).await.unwrap();
        assert_eq!(events[0].outcome, Outcome::Pending);
    }

    #[tokio::test]
    async fn execution_cap_resets_with_a_new_show() {
        let h = harness(auto_config()).await;
        let mut rule = keyword_rule("giveaway", ActionType::GraphicShow);
        rule.max_executions_per_show = Some(1);
        h.db.upsert_trigger_rule(&rule).unwrap();

        assert_eq!(h.engine.process_transcript("giveaway", 0.95, None).await.unwrap().len(), 1);
        assert!(h.engine.process_transcript("giveaway", 0.95, None).await.unwrap().is_empty());

        h.engine.start_show(RuleScope::default()).await.unwrap();
        assert_eq!(h.engine.process_transcript("giveaway", 0.95, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn scoped_rules_follow_the_active_show() {
        let h = harness(auto_config()).await;
        let mut rule = keyword_rule("intro", ActionType::LowerThirdShow);
        rule.show_id = Some("late-night".to_string());
        h.db.upsert_trigger_rule(&rule).unwrap();

        assert!(h.engine.process_transcript("intro", 0.95, None).await.unwrap().is_empty());
        h.engine
            .start_show(RuleScope {
                show_id: Some("late-night".to_string()),
                preset_id: None,
            })
            .await
            .unwrap();
        assert_eq!(h.engine.process_transcript("intro", 0.95, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn table_events_and_context_trigger_rules() {
        let h = harness(auto_config()).await;
        h.db.upsert_trigger_rule(&TriggerRule::new(
            "new question",
            TriggerCondition::Event {
                event_source: "show_questions".to_string(),
                event_type: "insert".to_string(),
                filters: Default::default(),
            },
            ActionType::QuestionIndicate,
        ))
        .unwrap();
        h.db.upsert_trigger_rule(&TriggerRule::new(
            "hype",
            TriggerCondition::Context {
                sentiment: Some("positive".to_string()),
                topic: None,
                engagement: None,
                confidence_min: Some(0.9),
            },
            ActionType::SoundboardPlay,
        ))
        .unwrap();

        let ids = h
            .engine
            .process_table_event("show_questions", ChangeKind::Insert, &json!({ "id": "q1" }))
            .await
            .unwrap();
        assert_eq!(ids.len(), 1);
        assert!(h
            .engine
            .process_table_event(AUTOMATION_EVENTS_TABLE, ChangeKind::Insert, &json!({}))
            .await
            .unwrap()
            .is_empty());

        let ids = h
            .engine
            .process_context(&ConversationContext {
                sentiment: Some("positive".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(ids.len(), 1);
        assert_eq!(h.executor.calls().len(), 2);
    }

    #[tokio::test]
    async fn learned_confidence_can_promote_to_auto() {
        let h = harness(AutomationConfig {
            apply_learned_confidence: true,
            ..auto_config()
        })
        .await;
        for minute in 0..10 {
            let created_at = start_time() - ChronoDuration::minutes(60 - minute);
            h.db.add_event(&AutomationEvent {
                id: uuid::Uuid::new_v4().to_string(),
                decision_id: uuid::Uuid::new_v4().to_string(),
                created_at,
                trigger_type: TriggerType::Keyword,
                trigger_data: Value::Null,
                confidence: 0.8,
                action_type: ActionType::GraphicShow,
                action_data: Value::Null,
                execution_mode: ExecutionMode::Suggested,
                outcome: Outcome::Executed,
                operator_action: Some(OperatorAction::Approved),
                execution_time_ms: Some(10),
                error_message: None,
                show_segment: None,
                metadata: Value::Null,
            })
            .unwrap();
        }
        assert_eq!(h.engine.refresh_learning().await.unwrap(), 10);
        h.db.upsert_trigger_rule(&keyword_rule("clip", ActionType::GraphicShow))
            .unwrap();

        h.engine.process_transcript("roll the clip", 0.84, None).await.unwrap();
        let latest = h.engine.recent_events(&EventQuery::recent(1)).await.unwrap();
        assert_eq!(latest[0].execution_mode, ExecutionMode::Auto);
        assert!((latest[0].confidence - 0.855).abs() < 1e-9);
        assert_eq!(h.engine.adjustment_history().await.len(), 1);
    }

    #[tokio::test]
    async fn invalid_config_patch_is_rejected() {
        let h = harness(AutomationConfig::default()).await;
        let result = h
            .engine
            .update_config(&AutomationConfigPatch {
                suggest_threshold: Some(0.95),
                ..Default::default()
            })
            .await;
        assert!(result.is_err());
        assert_eq!(h.engine.config().await.suggest_threshold, 0.60);

        let updated = h
            .engine
            .update_config(&AutomationConfigPatch {
                auto_execute_enabled: Some(true),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(updated.auto_execute_enabled);
        assert!(h.db.get_automation_config().unwrap().unwrap().auto_execute_enabled);
    }

    #[tokio::test]
    async fn transcript_listener_reacts_to_the_change_feed() {
        let h = harness(auto_config()).await;
        h.db.upsert_trigger_rule(&keyword_rule("breaking", ActionType::GraphicShow))
            .unwrap();
        let _listener = h
            .engine
            .spawn_transcript_listener(crate::datastore::LIVE_TRANSCRIPTS_TABLE);
        while h.events.try_recv().is_ok() {}

        h.db.insert_transcript("breaking news tonight", 0.95, None).unwrap();

        let resolved = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(EngineEvent::EventResolved(event)) = h.events.recv_async().await {
                    return event;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(resolved.action_type, ActionType::GraphicShow);
        assert_eq!(resolved.outcome, Outcome::Executed);
    }
}
