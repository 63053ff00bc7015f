//! Coalesces increments into periodic delta writes.
//!
//! The dispatcher is a plain state machine. It decides *what* to send and *when* it may send,
//! and [`crate::sync::CounterSync`] performs the actual write. Two states:
//!
//! - **Idle**: nothing in flight. Enqueued amounts accumulate until a flush tick takes them.
//! - **Flushing**: exactly one write is in flight carrying a snapshot of the batch. Amounts enqueued
//!   meanwhile accumulate separately for the next write and never touch the in-flight snapshot.
//!
//! A failed write merges its snapshot back into the accumulating batch and arms an exponential backoff.

use std::time::Duration;

use tokio::time::Instant;

use crate::remote::SyncError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BackoffPolicy {
    #[serde(with = "crate::duration_ms")]
    pub base: Duration,
    #[serde(with = "crate::duration_ms")]
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            max: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    /// Delay before retrying after `attempt` consecutive failures (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max)
            .min(self.max)
    }
}

/// Taps not yet acknowledged by the backend.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PendingBatch {
    /// Waiting for the next flush. While a write is in flight this is the next batch.
    pub accumulated_increment: u64,
    /// The snapshot carried by the write currently in flight.
    pub in_flight: Option<u64>,
}

impl PendingBatch {
    pub fn total(&self) -> u64 {
        self.accumulated_increment
            .saturating_add(self.in_flight.unwrap_or(0))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchState {
    Idle,
    Flushing,
}

/// What the UI shows about syncing. Never blocks tapping.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SyncStatus {
    Synced,
    Pending,
    Retrying { attempts: u32 },
    /// Retries keep going in the background, but it's been failing long enough to tell the user.
    Issue { attempts: u32, message: String },
    /// The backend refused the write. Automatic retries are paused until [`BatchDispatcher::retry_now`].
    Rejected { message: String },
}

#[derive(Clone, Debug)]
pub struct BatchDispatcher {
    batch: PendingBatch,
    backoff: BackoffPolicy,
    max_retries_before_issue: u32,
    consecutive_failures: u32,
    retry_at: Option<Instant>,
    last_error: Option<SyncError>,
    parked: bool,
}

impl BatchDispatcher {
    pub fn new(backoff: BackoffPolicy, max_retries_before_issue: u32) -> Self {
        Self {
            batch: PendingBatch::default(),
            backoff,
            max_retries_before_issue: max_retries_before_issue.max(1),
            consecutive_failures: 0,
            retry_at: None,
            last_error: None,
            parked: false,
        }
    }

    pub fn state(&self) -> DispatchState {
        if self.batch.in_flight.is_some() {
            DispatchState::Flushing
        } else {
            DispatchState::Idle
        }
    }

    pub fn batch(&self) -> PendingBatch {
        self.batch
    }

    /// Amount accepted locally that the backend has not acknowledged yet.
    pub fn pending_total(&self) -> u64 {
        self.batch.total()
    }

    pub fn enqueue(&mut self, amount: u64) {
        self.batch.accumulated_increment = self.batch.accumulated_increment.saturating_add(amount);
    }

    /// Called on every flush tick. Returns the amount to write, if a write should start now.
    pub fn begin_flush(&mut self, now: Instant) -> Option<u64> {
        if self.batch.in_flight.is_some() || self.parked {
            return None;
        }
        if self.retry_at.is_some_and(|retry_at| now < retry_at) {
            return None;
        }
        self.take_batch()
    }

    /// The in-flight write landed. If more accumulated meanwhile, that amount is already in flight
    /// when this returns and must be written next.
    pub fn complete_success(&mut self) -> Option<u64> {
        if self.batch.in_flight.take().is_none() {
            log::warn!("Write acknowledged while no write was in flight");
        }
        if self.consecutive_failures >= self.max_retries_before_issue {
            log::info!(
                "Sync recovered after {} failed attempts",
                self.consecutive_failures
            );
        }
        self.consecutive_failures = 0;
        self.retry_at = None;
        self.last_error = None;
        self.take_batch()
    }

    /// The in-flight write failed. The amount goes back into the batch.
    /// Returns the backoff before the next attempt, or `None` if retries are paused.
    pub fn complete_failure(&mut self, error: SyncError, now: Instant) -> Option<Duration> {
        let failed = self.batch.in_flight.take().unwrap_or(0);
        self.batch.accumulated_increment = self.batch.accumulated_increment.saturating_add(failed);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);

        let delay = if error.is_transient() {
            let delay = self.backoff.delay_for(self.consecutive_failures);
            self.retry_at = Some(now + delay);
            if self.consecutive_failures == self.max_retries_before_issue {
                log::warn!(
                    "Sync has failed {} times in a row, still retrying: {error}",
                    self.consecutive_failures
                );
            }
            Some(delay)
        } else {
            log::error!("Backend rejected a write of {failed}, pausing retries: {error}");
            self.parked = true;
            self.retry_at = None;
            None
        };
        self.last_error = Some(error);
        delay
    }

    /// Drop any backoff or rejection pause so the next tick attempts a write.
    pub fn retry_now(&mut self) {
        self.parked = false;
        self.retry_at = None;
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn status(&self) -> SyncStatus {
        let message = || {
            self.last_error
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_default()
        };

        if self.parked {
            SyncStatus::Rejected { message: message() }
        } else if self.consecutive_failures >= self.max_retries_before_issue {
            SyncStatus::Issue {
                attempts: self.consecutive_failures,
                message: message(),
            }
        } else if self.consecutive_failures > 0 {
            SyncStatus::Retrying {
                attempts: self.consecutive_failures,
            }
        } else if self.pending_total() > 0 {
            SyncStatus::Pending
        } else {
            SyncStatus::Synced
        }
    }

    fn take_batch(&mut self) -> Option<u64> {
        if self.batch.accumulated_increment == 0 {
            return None;
        }
        let snapshot = std::mem::take(&mut self.batch.accumulated_increment);
        self.batch.in_flight = Some(snapshot);
        Some(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dispatcher() -> BatchDispatcher {
        BatchDispatcher::new(BackoffPolicy::default(), 3)
    }

    fn transient() -> SyncError {
        SyncError::Transient("connection reset".into())
    }

    #[test]
    fn enqueue_while_idle_waits_for_the_tick() {
        let mut dispatcher = dispatcher();
        dispatcher.enqueue(2);
        dispatcher.enqueue(3);

        assert_eq!(dispatcher.state(), DispatchState::Idle);
        assert_eq!(dispatcher.batch().accumulated_increment, 5);
        assert_eq!(dispatcher.status(), SyncStatus::Pending);

        assert_eq!(dispatcher.begin_flush(Instant::now()), Some(5));
        assert_eq!(dispatcher.state(), DispatchState::Flushing);
        assert_eq!(dispatcher.batch().accumulated_increment, 0);
    }

    #[test]
    fn empty_batch_does_not_flush() {
        let mut dispatcher = dispatcher();
        assert_eq!(dispatcher.begin_flush(Instant::now()), None);
        assert_eq!(dispatcher.status(), SyncStatus::Synced);
    }

    #[test]
    fn taps_during_flight_go_to_the_next_batch() {
        let mut dispatcher = dispatcher();
        dispatcher.enqueue(4);
        assert_eq!(dispatcher.begin_flush(Instant::now()), Some(4));

        dispatcher.enqueue(1);
        dispatcher.enqueue(2);
        assert_eq!(
            dispatcher.batch(),
            PendingBatch {
                accumulated_increment: 3,
                in_flight: Some(4),
            }
        );
        // A second tick while flushing must not start another write.
        assert_eq!(dispatcher.begin_flush(Instant::now()), None);

        // Success drains the next batch straight away.
        assert_eq!(dispatcher.complete_success(), Some(3));
        assert_eq!(dispatcher.complete_success(), None);
        assert_eq!(dispatcher.state(), DispatchState::Idle);
        assert_eq!(dispatcher.pending_total(), 0);
    }

    #[test]
    fn failed_amount_is_merged_into_the_growing_batch() {
        let mut dispatcher = dispatcher();
        let now = Instant::now();
        dispatcher.enqueue(5);
        dispatcher.begin_flush(now);
        dispatcher.enqueue(2);

        let delay = dispatcher.complete_failure(transient(), now);

        assert_eq!(delay, Some(Duration::from_millis(500)));
        assert_eq!(dispatcher.state(), DispatchState::Idle);
        assert_eq!(dispatcher.batch().accumulated_increment, 7);
        assert_eq!(dispatcher.status(), SyncStatus::Retrying { attempts: 1 });

        // Still backing off.
        assert_eq!(
            dispatcher.begin_flush(now + Duration::from_millis(499)),
            None
        );
        assert_eq!(
            dispatcher.begin_flush(now + Duration::from_millis(500)),
            Some(7)
        );
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let policy = BackoffPolicy {
            base: Duration::from_millis(500),
            max: Duration::from_secs(3),
        };
        let delays: Vec<_> = (1..=5).map(|attempt| policy.delay_for(attempt)).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(500),
                Duration::from_millis(1000),
                Duration::from_millis(2000),
                Duration::from_secs(3),
                Duration::from_secs(3),
            ]
        );
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(3));
    }

    #[test]
    fn repeated_failures_surface_an_issue_but_keep_retrying() {
        let mut dispatcher = dispatcher();
        let mut now = Instant::now();
        dispatcher.enqueue(1);

        for _ in 0..3 {
            let amount = dispatcher.begin_flush(now).expect("should retry");
            assert_eq!(amount, 1);
            let delay = dispatcher.complete_failure(transient(), now).unwrap();
            now += delay;
        }

        assert!(matches!(
            dispatcher.status(),
            SyncStatus::Issue { attempts: 3, .. }
        ));
        assert_eq!(dispatcher.begin_flush(now), Some(1));
        assert_eq!(dispatcher.complete_success(), None);
        assert_eq!(dispatcher.status(), SyncStatus::Synced);
    }

    #[test]
    fn rejection_pauses_until_retry_now() {
        let mut dispatcher = dispatcher();
        let now = Instant::now();
        dispatcher.enqueue(9);
        dispatcher.begin_flush(now);

        let delay = dispatcher.complete_failure(SyncError::Rejected("unknown counter".into()), now);

        assert_eq!(delay, None);
        assert_eq!(
            dispatcher.status(),
            SyncStatus::Rejected {
                message: "backend rejected request: unknown counter".into()
            }
        );
        assert_eq!(
            dispatcher.begin_flush(now + Duration::from_secs(60)),
            None
        );
        assert_eq!(dispatcher.pending_total(), 9);

        dispatcher.retry_now();
        assert_eq!(dispatcher.begin_flush(now), Some(9));
    }
}
