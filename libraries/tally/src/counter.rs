use chrono::{DateTime, Utc};

/// What this client believes about the shared counter.
///
/// `last_known_remote_value` is the highest value the backend has ever reported, and
/// `local_value >= last_known_remote_value` always holds. `last_synced_at` is the latest observation time seen.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CounterSnapshot {
    pub local_value: u64,
    pub last_known_remote_value: u64,
    pub last_synced_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The remote value was ahead of us and the display moved forward.
    Advanced,
    /// The remote value matched the display.
    Unchanged,
    /// The remote value did not include everything we applied locally. Ignored.
    Stale,
}

/// The locally-believed value of one shared counter.
///
/// Every mutation here is pure local state. The network lives in [`crate::sync::CounterSync`].
#[derive(Clone, Debug, Default)]
pub struct OptimisticCounter {
    snapshot: CounterSnapshot,
    stale: bool,
}

impl OptimisticCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed from the first remote read.
    pub fn initialized(&mut self, remote_value: u64, observed_at: DateTime<Utc>) {
        self.snapshot.local_value = self.snapshot.local_value.max(remote_value);
        self.snapshot.last_known_remote_value = remote_value;
        self.snapshot.last_synced_at = Some(observed_at);
        self.stale = false;
    }

    /// The first remote read failed. Keep counting from whatever we have and flag the value as stale.
    pub fn initialization_failed(&mut self) {
        self.stale = true;
    }

    /// Infallible. Returns the new display value.
    pub fn apply_local_increment(&mut self, amount: u64) -> u64 {
        self.snapshot.local_value = self.snapshot.local_value.saturating_add(amount);
        self.snapshot.local_value
    }

    /// Merge a remote value. The display only ever moves forward: `local_value = max(local_value, remote_value)`,
    /// however late `observed_at` is. Observation time only decides whether `last_synced_at` moves.
    pub fn reconcile(&mut self, remote_value: u64, observed_at: DateTime<Utc>) -> ReconcileOutcome {
        self.stale = false;
        if self
            .snapshot
            .last_synced_at
            .is_none_or(|last_synced_at| observed_at > last_synced_at)
        {
            self.snapshot.last_synced_at = Some(observed_at);
        }
        self.snapshot.last_known_remote_value =
            self.snapshot.last_known_remote_value.max(remote_value);

        use std::cmp::Ordering;
        match remote_value.cmp(&self.snapshot.local_value) {
            Ordering::Greater => {
                self.snapshot.local_value = remote_value;
                ReconcileOutcome::Advanced
            }
            Ordering::Equal => ReconcileOutcome::Unchanged,
            Ordering::Less => ReconcileOutcome::Stale,
        }
    }

    pub fn display_value(&self) -> u64 {
        self.snapshot.local_value
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        self.snapshot
    }

    /// True until some remote value has been merged, if the initial read failed.
    pub fn is_stale(&self) -> bool {
        self.stale
    }
}
