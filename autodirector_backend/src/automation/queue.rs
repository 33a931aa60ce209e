use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use super::types::{clamp_priority, ActionType, CandidateAction, Priority, PRIORITY_BACKGROUND};
use crate::clock::Clock;

pub const RATE_WINDOW_SECS: i64 = 60;
pub const HISTORY_RETENTION_SECS: i64 = 5 * 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedDecision {
    pub id: String,
    pub candidate: CandidateAction,
    pub priority: Priority,
    pub queued_at: DateTime<Utc>,
    #[serde(default)]
    pub show_segment: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    pub total: usize,
    pub by_priority: BTreeMap<Priority, usize>,
    pub oldest_queued_at: Option<DateTime<Utc>>,
    pub newest_queued_at: Option<DateTime<Utc>>,
}

/// Pending decisions in priority order (0 first, FIFO within a priority),
/// plus the execution history used for cooldowns and rate limiting.
pub struct PriorityQueue {
    clock: Arc<dyn Clock>,
    items: VecDeque<QueuedDecision>,
    last_execution: HashMap<ActionType, DateTime<Utc>>,
    executions: VecDeque<DateTime<Utc>>,
}

impl PriorityQueue {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            items: VecDeque::new(),
            last_execution: HashMap::new(),
            executions: VecDeque::new(),
        }
    }

    pub fn enqueue(&mut self, candidate: CandidateAction, show_segment: Option<String>) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        let priority = clamp_priority(candidate.priority);
        let decision = QueuedDecision {
            id: id.clone(),
            candidate,
            priority,
            queued_at: self.clock.now(),
            show_segment,
        };

        match self.items.iter().position(|item| item.priority > priority) {
            Some(index) => self.items.insert(index, decision),
            None => self.items.push_back(decision),
        }
        id
    }

    pub fn peek(&self) -> Option<&QueuedDecision> {
        self.items.front()
    }

    pub fn dequeue(&mut self) -> Option<QueuedDecision> {
        self.items.pop_front()
    }

    pub fn remove(&mut self, id: &str) -> bool {
        match self.items.iter().position(|item| item.id == id) {
            Some(index) => {
                self.items.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn snapshot(&self) -> Vec<QueuedDecision> {
        self.items.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn is_on_cooldown(&self, action: ActionType, cooldown_seconds: u64) -> bool {
        self.cooldown_remaining(action, cooldown_seconds) > 0
    }

    /// Whole seconds until `action` may run again, rounded up.
    pub fn cooldown_remaining(&self, action: ActionType, cooldown_seconds: u64) -> u64 {
        let Some(last) = self.last_execution.get(&action) else {
            return 0;
        };
        let cooldown_ms = i64::try_from(cooldown_seconds)
            .unwrap_or(i64::MAX)
            .saturating_mul(1000);
        let since_ms = (self.clock.now() - *last).num_milliseconds();
        let remaining_ms = cooldown_ms.saturating_sub(since_ms).max(0) as u64;
        remaining_ms.div_ceil(1000)
    }

    pub fn record_execution(&mut self, action: ActionType) {
        let now = self.clock.now();
        self.last_execution.insert(action, now);
        self.executions.push_back(now);
    }

    pub fn recent_execution_count(&self, window_secs: i64) -> usize {
        let cutoff = self.clock.now() - ChronoDuration::seconds(window_secs);
        self.executions.iter().filter(|at| **at > cutoff).count()
    }

    /// Forget executions older than five minutes.
    pub fn cleanup_history(&mut self) {
        let cutoff = self.clock.now() - ChronoDuration::seconds(HISTORY_RETENTION_SECS);
        self.last_execution.retain(|_, at| *at >= cutoff);
        while self.executions.front().is_some_and(|at| *at < cutoff) {
            self.executions.pop_front();
        }
    }

    pub fn stats(&self) -> QueueStats {
        let mut by_priority: BTreeMap<Priority, usize> =
            (0..=PRIORITY_BACKGROUND).map(|priority| (priority, 0)).collect();
        for item in &self.items {
            *by_priority.entry(item.priority).or_insert(0) += 1;
        }
        QueueStats {
            total: self.items.len(),
            by_priority,
            oldest_queued_at: self.items.iter().map(|item| item.queued_at).min(),
            newest_queued_at: self.items.iter().map(|item| item.queued_at).max(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automation::types::TriggerType;
    use crate::clock::ManualClock;
    use chrono::TimeZone;

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 6, 1, 19, 0, 0).unwrap(),
        ))
    }

    fn candidate(action_type: ActionType, priority: Priority) -> CandidateAction {
        CandidateAction {
            action_type,
            trigger_type: TriggerType::Keyword,
            params: serde_json::json!({}),
            trigger_data: serde_json::json!({}),
            confidence: 0.9,
            priority,
            requires_approval: false,
            rule_id: None,
            source: "test".to_string(),
        }
    }

    #[test]
    fn dequeues_by_priority_then_arrival() {
        let clock = clock();
        let mut queue = PriorityQueue::new(clock.clone());
        queue.enqueue(candidate(ActionType::GraphicShow, 3), None);
        clock.advance_secs(1);
        queue.enqueue(candidate(ActionType::SoundboardPlay, 1), None);
        clock.advance_secs(1);
        queue.enqueue(candidate(ActionType::GraphicHide, 3), None);
        clock.advance_secs(1);
        queue.enqueue(candidate(ActionType::ObsScene, 0), None);

        let order: Vec<ActionType> = std::iter::from_fn(|| queue.dequeue())
            .map(|item| item.candidate.action_type)
            .collect();
        assert_eq!(
            order,
            vec![
                ActionType::ObsScene,
                ActionType::SoundboardPlay,
                ActionType::GraphicShow,
                ActionType::GraphicHide,
            ]
        );
        assert!(queue.is_empty());
    }

    #[test]
    fn out_of_range_priority_is_clamped() {
        let mut queue = PriorityQueue::new(clock());
        queue.enqueue(candidate(ActionType::GraphicShow, 9), None);
        assert_eq!(queue.peek().unwrap().priority, PRIORITY_BACKGROUND);
    }

    #[test]
    fn remove_and_clear() {
        let mut queue = PriorityQueue::new(clock());
        let first = queue.enqueue(candidate(ActionType::GraphicShow, 2), None);
        queue.enqueue(candidate(ActionType::GraphicHide, 2), None);
        assert!(queue.remove(&first));
        assert!(!queue.remove(&first));
        assert_eq!(queue.len(), 1);
        queue.clear();
        assert!(queue.peek().is_none());
    }

    #[test]
    fn cooldown_counts_down_in_whole_seconds() {
        let clock = clock();
        let mut queue = PriorityQueue::new(clock.clone());
        assert!(!queue.is_on_cooldown(ActionType::SoundboardPlay, 5));

        queue.record_execution(ActionType::SoundboardPlay);
        assert!(queue.is_on_cooldown(ActionType::SoundboardPlay, 5));
        assert_eq!(queue.cooldown_remaining(ActionType::SoundboardPlay, 5), 5);

        clock.advance(ChronoDuration::milliseconds(3500));
        assert_eq!(queue.cooldown_remaining(ActionType::SoundboardPlay, 5), 2);
        assert!(!queue.is_on_cooldown(ActionType::GraphicShow, 5));

        clock.advance_secs(2);
        assert!(!queue.is_on_cooldown(ActionType::SoundboardPlay, 5));
    }

    #[test]
    fn rate_window_counts_every_execution() {
        let clock = clock();
        let mut queue = PriorityQueue::new(clock.clone());
        queue.record_execution(ActionType::GraphicShow);
        queue.record_execution(ActionType::GraphicShow);
        clock.advance_secs(30);
        queue.record_execution(ActionType::SoundboardPlay);
        assert_eq!(queue.recent_execution_count(RATE_WINDOW_SECS), 3);

        clock.advance_secs(31);
        assert_eq!(queue.recent_execution_count(RATE_WINDOW_SECS), 1);
    }

    #[test]
    fn cleanup_drops_old_history() {
        let clock = clock();
        let mut queue = PriorityQueue::new(clock.clone());
        queue.record_execution(ActionType::GraphicShow);
        clock.advance_secs(HISTORY_RETENTION_SECS + 1);
        queue.record_execution(ActionType::SoundboardPlay);
        queue.cleanup_history();

        assert_eq!(queue.executions.len(), 1);
        assert!(!queue.last_execution.contains_key(&ActionType::GraphicShow));
        assert!(queue.last_execution.contains_key(&ActionType::SoundboardPlay));
    }

    #[test]
    fn stats_group_by_priority() {
        let clock = clock();
        let mut queue = PriorityQueue::new(clock.clone());
        queue.enqueue(candidate(ActionType::GraphicShow, 3), None);
        clock.advance_secs(10);
        queue.enqueue(candidate(ActionType::GraphicHide, 3), None);
        queue.enqueue(candidate(ActionType::ObsScene, 0), None);

        let stats = queue.stats();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.by_priority[&3], 2);
        assert_eq!(stats.by_priority[&0], 1);
        assert_eq!(stats.by_priority[&5], 0);
        assert!(stats.oldest_queued_at.unwrap() < stats.newest_queued_at.unwrap());
    }
}
