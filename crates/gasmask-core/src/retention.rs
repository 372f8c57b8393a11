//! Retention buffer.
//!
//! Keeps the latest reading for live display and promotes a sparse subset of
//! readings into a bounded history used by trend charts and the calendar.
//!
//! Promotion is two-staged:
//! - every admitted reading is scheduled for promotion a fixed delay after it
//!   was admitted (10 minutes by default);
//! - when it comes due it is promoted only if the minimum interval since the
//!   last promotion has passed (2 minutes by default). Otherwise it is
//!   deferred once by a short delay (1 minute) and then promoted or abandoned.
//!
//! The history is bounded (30 entries by default) and evicts oldest first.
//!
//! [`RetentionBuffer`] is a plain data structure fed explicit [`Instant`]s, so
//! its scheduling is fully deterministic. [`RetentionService`] wraps it in a
//! shared handle with a tokio task that fires promotions on time.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};
use utoipa::ToSchema;

use crate::types::{HistoryEntry, Reading};

/// Capacity of the promotion outcome channel.
const OUTCOME_CAPACITY: usize = 64;

/// Retention timing and bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(default)]
pub struct RetentionConfig {
    /// Delay between admitting a reading and its promotion attempt.
    pub promotion_delay_secs: u64,
    /// Minimum time between two promotions.
    pub min_interval_secs: u64,
    /// Delay before the single retry of a throttled promotion.
    pub retry_delay_secs: u64,
    /// Maximum number of history entries.
    pub capacity: usize,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            promotion_delay_secs: 600,
            min_interval_secs: 120,
            retry_delay_secs: 60,
            capacity: 30,
        }
    }
}

impl RetentionConfig {
    /// Delay before the first promotion attempt.
    #[must_use]
    pub const fn promotion_delay(&self) -> Duration {
        Duration::from_secs(self.promotion_delay_secs)
    }

    /// Minimum interval between promotions.
    #[must_use]
    pub const fn min_interval(&self) -> Duration {
        Duration::from_secs(self.min_interval_secs)
    }

    /// Delay before the retry of a throttled promotion.
    #[must_use]
    pub const fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }
}

/// Why a scheduled promotion was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbandonReason {
    /// Still inside the minimum interval after its one retry.
    Throttled,
    /// A newer reading was promoted first.
    OutOfOrder,
}

/// What happened to a scheduled promotion when it came due.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromotionOutcome {
    /// The reading entered the history.
    Promoted {
        /// Admission sequence number.
        seq: u64,
        /// History position it was given.
        position: u64,
    },
    /// Throttled; retried once at `retry_at`.
    Deferred {
        /// Admission sequence number.
        seq: u64,
        /// When the retry is due.
        retry_at: Instant,
    },
    /// Dropped for good.
    Abandoned {
        /// Admission sequence number.
        seq: u64,
        /// Why it was dropped.
        reason: AbandonReason,
    },
}

/// Persistable copy of the history.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct HistorySnapshot {
    /// Entries, most recent first.
    pub entries: Vec<HistoryEntry>,
    /// Position the next promoted entry receives.
    pub next_position: u64,
}

#[derive(Debug)]
struct Pending {
    reading: Reading,
    retried: bool,
}

/// Latest reading plus the bounded, rate-limited history.
#[derive(Debug)]
pub struct RetentionBuffer {
    config: RetentionConfig,
    current: Option<Reading>,
    /// Most recent first.
    history: VecDeque<HistoryEntry>,
    /// Scheduled promotions keyed by due time, then admission order.
    queue: BTreeMap<(Instant, u64), Pending>,
    next_seq: u64,
    next_position: u64,
    last_promotion: Option<Instant>,
}

impl RetentionBuffer {
    /// Creates an empty buffer.
    #[must_use]
    pub fn new(config: RetentionConfig) -> Self {
        Self {
            config,
            current: None,
            history: VecDeque::with_capacity(config.capacity),
            queue: BTreeMap::new(),
            next_seq: 0,
            next_position: 0,
            last_promotion: None,
        }
    }

    /// Settings the buffer runs with.
    #[must_use]
    pub const fn config(&self) -> &RetentionConfig {
        &self.config
    }

    /// Makes `reading` current and schedules its promotion.
    ///
    /// Returns the admission sequence number.
    pub fn admit(&mut self, reading: Reading, now: Instant) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.current = Some(reading.clone());
        self.queue.insert(
            (now + self.config.promotion_delay(), seq),
            Pending {
                reading,
                retried: false,
            },
        );
        seq
    }

    /// The latest admitted reading.
    #[must_use]
    pub const fn current(&self) -> Option<&Reading> {
        self.current.as_ref()
    }

    /// History entries, most recent first.
    pub fn history(&self) -> impl ExactSizeIterator<Item = &HistoryEntry> {
        self.history.iter()
    }

    /// Number of scheduled promotions.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// When the earliest scheduled promotion is due.
    #[must_use]
    pub fn next_due(&self) -> Option<Instant> {
        self.queue.keys().next().map(|(due, _)| *due)
    }

    /// Runs every promotion due at or before `now`.
    ///
    /// Each promotion is judged at its own due time, so the result does not
    /// depend on how often this is called.
    pub fn poll(&mut self, now: Instant) -> Vec<PromotionOutcome> {
        let mut outcomes = Vec::new();
        while let Some(entry) = self.queue.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let ((due, seq), pending) = entry.remove_entry();
            outcomes.push(self.evaluate(due, seq, pending));
        }
        outcomes
    }

    fn evaluate(&mut self, due: Instant, seq: u64, pending: Pending) -> PromotionOutcome {
        let newest = self.history.front().map(|entry| entry.reading.timestamp);
        if newest.is_some_and(|newest| pending.reading.timestamp < newest) {
            return PromotionOutcome::Abandoned {
                seq,
                reason: AbandonReason::OutOfOrder,
            };
        }

        let throttled = self
            .last_promotion
            .is_some_and(|last| due.saturating_duration_since(last) < self.config.min_interval());

        if !throttled {
            let position = self.promote(pending.reading, due);
            return PromotionOutcome::Promoted { seq, position };
        }

        if pending.retried {
            return PromotionOutcome::Abandoned {
                seq,
                reason: AbandonReason::Throttled,
            };
        }

        let retry_at = due + self.config.retry_delay();
        self.queue.insert(
            (retry_at, seq),
            Pending {
                reading: pending.reading,
                retried: true,
            },
        );
        PromotionOutcome::Deferred { seq, retry_at }
    }

    fn promote(&mut self, reading: Reading, at: Instant) -> u64 {
        let position = self.next_position;
        self.next_position += 1;
        self.history.push_front(HistoryEntry { position, reading });
        self.history.truncate(self.config.capacity);
        self.last_promotion = Some(at);
        position
    }

    /// Forgets the current reading, the history and every scheduled promotion.
    pub fn clear(&mut self) {
        self.current = None;
        self.history.clear();
        self.queue.clear();
        self.last_promotion = None;
    }

    /// Copies the history out for persistence.
    #[must_use]
    pub fn snapshot(&self) -> HistorySnapshot {
        HistorySnapshot {
            entries: self.history.iter().cloned().collect(),
            next_position: self.next_position,
        }
    }

    /// Replaces the history with a saved one.
    ///
    /// Entries beyond the capacity are dropped, oldest first. Scheduled
    /// promotions are kept.
    pub fn restore(&mut self, snapshot: HistorySnapshot) {
        let mut entries = snapshot.entries;
        entries.sort_by(|a, b| b.position.cmp(&a.position));
        entries.truncate(self.config.capacity);
        let after_last = entries.first().map_or(0, |entry| entry.position + 1);
        self.next_position = snapshot.next_position.max(after_last);
        self.history = entries.into();
    }
}

// ============================================================================
// Service
// ============================================================================

struct ServiceInner {
    buffer: Mutex<RetentionBuffer>,
    wake: Notify,
    stop: watch::Sender<bool>,
    outcomes: broadcast::Sender<PromotionOutcome>,
}

/// Shared retention buffer with its own promotion timer.
#[derive(Clone)]
pub struct RetentionService {
    inner: Arc<ServiceInner>,
}

impl RetentionService {
    /// Creates the service. Call [`spawn`](Self::spawn) to start promotions.
    #[must_use]
    pub fn new(config: RetentionConfig) -> Self {
        let (outcomes, _) = broadcast::channel(OUTCOME_CAPACITY);
        Self {
            inner: Arc::new(ServiceInner {
                buffer: Mutex::new(RetentionBuffer::new(config)),
                wake: Notify::new(),
                stop: watch::Sender::new(false),
                outcomes,
            }),
        }
    }

    fn buffer(&self) -> MutexGuard<'_, RetentionBuffer> {
        self.inner.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admits a reading now.
    pub fn admit(&self, reading: Reading) -> u64 {
        let seq = self.buffer().admit(reading, Instant::now());
        self.inner.wake.notify_one();
        seq
    }

    /// The latest admitted reading.
    #[must_use]
    pub fn current(&self) -> Option<Reading> {
        self.buffer().current().cloned()
    }

    /// History entries, most recent first.
    #[must_use]
    pub fn history(&self) -> Vec<HistoryEntry> {
        self.buffer().history().cloned().collect()
    }

    /// Number of scheduled promotions.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.buffer().pending()
    }

    /// Copies the history out for persistence.
    #[must_use]
    pub fn snapshot(&self) -> HistorySnapshot {
        self.buffer().snapshot()
    }

    /// Replaces the history with a saved one.
    pub fn restore(&self, snapshot: HistorySnapshot) {
        self.buffer().restore(snapshot);
    }

    /// Forgets everything, including scheduled promotions.
    pub fn clear(&self) {
        self.buffer().clear();
        self.inner.wake.notify_one();
    }

    /// Receiver for promotion outcomes.
    #[must_use]
    pub fn outcomes(&self) -> broadcast::Receiver<PromotionOutcome> {
        self.inner.outcomes.subscribe()
    }

    /// Starts the promotion timer task.
    #[must_use]
    pub fn spawn(&self) -> JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move { service.run().await })
    }

    /// Stops the timer task. Scheduled promotions are discarded with it.
    pub fn stop(&self) {
        self.inner.stop.send_replace(true);
    }

    async fn run(self) {
        let mut stop = self.inner.stop.subscribe();
        debug!("Retention timer started");

        loop {
            let next_due = self.buffer().next_due();
            let stopped = async {
                let _ = stop.wait_for(|stopped| *stopped).await;
            };

            match next_due {
                Some(due) => {
                    tokio::select! {
                        () = tokio::time::sleep_until(due) => {}
                        () = self.inner.wake.notified() => continue,
                        () = stopped => break,
                    }
                }
                None => {
                    tokio::select! {
                        () = self.inner.wake.notified() => continue,
                        () = stopped => break,
                    }
                }
            }

            let outcomes = self.buffer().poll(Instant::now());
            for outcome in outcomes {
                match outcome {
                    PromotionOutcome::Promoted { seq, position } => {
                        info!(seq, position, "Reading promoted to history");
                    }
                    PromotionOutcome::Deferred { seq, .. } => {
                        debug!(seq, "Promotion throttled, retrying once");
                    }
                    PromotionOutcome::Abandoned { seq, reason } => {
                        debug!(seq, ?reason, "Promotion abandoned");
                    }
                }
                let _ = self.inner.outcomes.send(outcome);
            }
        }

        debug!("Retention timer stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thresholds::AlertLevel;
    use crate::types::GasLevels;

    const MINUTE: Duration = Duration::from_secs(60);

    fn reading(timestamp: i64) -> Reading {
        Reading {
            device_id: "dev".to_string(),
            timestamp,
            levels: GasLevels::from_array([1.0, 2.0, 3.0, 4.0]),
            alert_level: AlertLevel::Normal,
        }
    }

    fn timestamps(buffer: &RetentionBuffer) -> Vec<i64> {
        buffer.history().map(|entry| entry.reading.timestamp).collect()
    }

    #[test]
    fn test_admit_updates_current_but_not_history() {
        let t0 = Instant::now();
        let mut buffer = RetentionBuffer::new(RetentionConfig::default());

        buffer.admit(reading(1), t0);
        buffer.admit(reading(2), t0 + Duration::from_secs(1));

        assert_eq!(buffer.current().map(|r| r.timestamp), Some(2));
        assert_eq!(buffer.history().len(), 0);
        assert_eq!(buffer.pending(), 2);
        assert_eq!(buffer.next_due(), Some(t0 + 10 * MINUTE));
    }

    #[test]
    fn test_promotion_waits_for_delay() {
        let t0 = Instant::now();
        let mut buffer = RetentionBuffer::new(RetentionConfig::default());
        buffer.admit(reading(1), t0);

        assert!(buffer.poll(t0 + 10 * MINUTE - Duration::from_millis(1)).is_empty());
        assert_eq!(
            buffer.poll(t0 + 10 * MINUTE),
            vec![PromotionOutcome::Promoted { seq: 0, position: 0 }]
        );
        assert_eq!(timestamps(&buffer), vec![1]);
    }

    #[test]
    fn test_throttled_promotion_is_retried_once() {
        let t0 = Instant::now();
        let mut buffer = RetentionBuffer::new(RetentionConfig::default());

        buffer.admit(reading(1), t0);
        buffer.admit(reading(2), t0 + MINUTE);
        buffer.admit(reading(3), t0 + MINUTE + Duration::from_secs(30));

        let outcomes = buffer.poll(t0 + 30 * MINUTE);

        assert_eq!(
            outcomes,
            vec![
                PromotionOutcome::Promoted { seq: 0, position: 0 },
                PromotionOutcome::Deferred {
                    seq: 1,
                    retry_at: t0 + 12 * MINUTE,
                },
                PromotionOutcome::Deferred {
                    seq: 2,
                    retry_at: t0 + 12 * MINUTE + Duration::from_secs(30),
                },
                PromotionOutcome::Promoted { seq: 1, position: 1 },
                PromotionOutcome::Abandoned {
                    seq: 2,
                    reason: AbandonReason::Throttled,
                },
            ]
        );
        // Readings 2 and 3 arrived 30 s apart; only one made it.
        assert_eq!(timestamps(&buffer), vec![2, 1]);
        assert_eq!(buffer.pending(), 0);
    }

    #[test]
    fn test_result_does_not_depend_on_poll_cadence() {
        let t0 = Instant::now();
        let mut stepped = RetentionBuffer::new(RetentionConfig::default());
        let mut batched = RetentionBuffer::new(RetentionConfig::default());
        for (i, offset) in [0_u64, 20, 50, 200, 210, 400].into_iter().enumerate() {
            let ts = i64::try_from(i).unwrap();
            stepped.admit(reading(ts), t0 + Duration::from_secs(offset));
            batched.admit(reading(ts), t0 + Duration::from_secs(offset));
        }

        let mut now = t0;
        while now < t0 + 60 * MINUTE {
            now += Duration::from_secs(7);
            stepped.poll(now);
        }
        batched.poll(t0 + 60 * MINUTE);

        assert_eq!(timestamps(&stepped), timestamps(&batched));
    }

    #[test]
    fn test_history_is_bounded_and_most_recent_first() {
        let t0 = Instant::now();
        let mut buffer = RetentionBuffer::new(RetentionConfig::default());
        for i in 0..40_i64 {
            let offset = Duration::from_secs(180 * u64::try_from(i).unwrap());
            buffer.admit(reading(i), t0 + offset);
        }

        buffer.poll(t0 + 24 * 60 * MINUTE);

        let history: Vec<&HistoryEntry> = buffer.history().collect();
        assert_eq!(history.len(), 30);
        assert_eq!(history[0].reading.timestamp, 39);
        assert_eq!(history[29].reading.timestamp, 10);
        assert!(history.windows(2).all(|w| w[0].position > w[1].position));
    }

    #[test]
    fn test_equal_timestamps_are_kept_apart() {
        let t0 = Instant::now();
        let mut buffer = RetentionBuffer::new(RetentionConfig::default());
        buffer.admit(reading(5), t0);
        buffer.admit(reading(5), t0 + 3 * MINUTE);

        buffer.poll(t0 + 20 * MINUTE);

        assert_eq!(timestamps(&buffer), vec![5, 5]);
    }

    #[test]
    fn test_never_promotes_out_of_order() {
        let t0 = Instant::now();
        let mut buffer = RetentionBuffer::new(RetentionConfig::default());
        // Seeds last_promotion at t0 + 10 min.
        buffer.admit(reading(100), t0);
        buffer.poll(t0 + 10 * MINUTE);

        // Due at 11:00, throttled, retry at 12:00.
        buffer.admit(reading(200), t0 + MINUTE);
        buffer.poll(t0 + 11 * MINUTE);
        // Restore a history whose newest entry is newer than reading 200.
        let mut snapshot = buffer.snapshot();
        snapshot.entries.insert(
            0,
            HistoryEntry {
                position: 1,
                reading: reading(300),
            },
        );
        buffer.restore(snapshot);

        let outcomes = buffer.poll(t0 + 13 * MINUTE);
        assert_eq!(
            outcomes,
            vec![PromotionOutcome::Abandoned {
                seq: 1,
                reason: AbandonReason::OutOfOrder,
            }]
        );
        assert_eq!(timestamps(&buffer), vec![300, 100]);
    }

    #[test]
    fn test_snapshot_restore_keeps_positions_increasing() {
        let t0 = Instant::now();
        let config = RetentionConfig {
            capacity: 2,
            ..RetentionConfig::default()
        };
        let mut buffer = RetentionBuffer::new(config);
        let snapshot = HistorySnapshot {
            entries: (0..5)
                .map(|i| HistoryEntry {
                    position: i,
                    reading: reading(i64::try_from(i).unwrap()),
                })
                .collect(),
            next_position: 0,
        };

        buffer.restore(snapshot);
        assert_eq!(timestamps(&buffer), vec![4, 3]);

        buffer.admit(reading(10), t0);
        assert_eq!(
            buffer.poll(t0 + 10 * MINUTE),
            vec![PromotionOutcome::Promoted { seq: 0, position: 5 }]
        );
        assert_eq!(buffer.snapshot().next_position, 6);
    }

    #[test]
    fn test_clear_drops_everything() {
        let t0 = Instant::now();
        let mut buffer = RetentionBuffer::new(RetentionConfig::default());
        buffer.admit(reading(1), t0);
        buffer.poll(t0 + 10 * MINUTE);
        buffer.admit(reading(2), t0 + 20 * MINUTE);

        buffer.clear();

        assert!(buffer.current().is_none());
        assert_eq!(buffer.history().len(), 0);
        assert_eq!(buffer.next_due(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_service_promotes_on_timer() {
        let service = RetentionService::new(RetentionConfig::default());
        let timer = service.spawn();
        let mut outcomes = service.outcomes();

        service.admit(reading(1));
        assert_eq!(service.current().map(|r| r.timestamp), Some(1));

        tokio::time::sleep(9 * MINUTE).await;
        assert!(service.history().is_empty());

        tokio::time::sleep(MINUTE + Duration::from_secs(1)).await;
        assert_eq!(service.history().len(), 1);
        assert_eq!(
            outcomes.recv().await.unwrap(),
            PromotionOutcome::Promoted { seq: 0, position: 0 }
        );

        service.stop();
        timer.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_service_burst_is_throttled() {
        let service = RetentionService::new(RetentionConfig::default());
        let timer = service.spawn();

        for i in 0..20 {
            service.admit(reading(i));
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
        tokio::time::sleep(30 * MINUTE).await;

        // 20 readings within 100 s: the first promotes, the ones that come
        // due after its retry window are throttled away.
        let history = service.history();
        assert!(!history.is_empty());
        assert!(history.len() < 20);
        assert_eq!(service.pending(), 0);

        service.stop();
        timer.await.unwrap();
    }
}
