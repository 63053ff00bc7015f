//! The contract between the sync engine and whatever actually stores the counter.

use std::fmt;

use futures::stream::LocalBoxStream;

/// Identifies one counter row in the backend.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct CounterId(String);

impl CounterId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CounterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CounterId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for CounterId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    /// Worth retrying: timeouts, dropped connections, 5xx, rate limiting.
    #[error("transient network error: {0}")]
    Transient(String),

    /// Retrying the same request will not help (unknown counter id, bad credentials, ...).
    #[error("backend rejected request: {0}")]
    Rejected(String),
}

impl SyncError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Transient(_))
    }
}

/// A store that can add to a counter atomically.
///
/// Implementations only ever see deltas. They never receive a value computed from an earlier read,
/// which keeps concurrent writers and reordered retries safe.
#[allow(async_fn_in_trait)]
pub trait CounterBackend {
    /// Point-in-time read of the counter.
    async fn read_counter(&self, id: &CounterId) -> Result<u64, SyncError>;

    /// Add `delta` to the counter, returning the total right after the add.
    async fn write_increment_delta(&self, id: &CounterId, delta: u64) -> Result<u64, SyncError>;

    /// Authoritative values as the backend pushes them. The stream ends when the backend goes away.
    fn subscribe_to_changes(&self, id: &CounterId) -> LocalBoxStream<'static, u64>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Versioned {
    pub value: u64,
    pub version: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConditionalWrite {
    Written,
    /// Somebody else wrote since the version we read.
    Conflict,
}

/// A store that only offers read-modify-write with a version check.
#[allow(async_fn_in_trait)]
pub trait ConditionalBackend {
    async fn read_versioned(&self, id: &CounterId) -> Result<Versioned, SyncError>;

    async fn write_if_version(
        &self,
        id: &CounterId,
        expected_version: u64,
        value: u64,
    ) -> Result<ConditionalWrite, SyncError>;

    fn subscribe_to_changes(&self, id: &CounterId) -> LocalBoxStream<'static, u64>;
}

/// Turns a [`ConditionalBackend`] into a [`CounterBackend`] by retrying the read-modify-write
/// until no concurrent writer got in between.
#[derive(Clone, Debug)]
pub struct CasDeltaWriter<B> {
    inner: B,
    max_attempts: u32,
}

impl<B> CasDeltaWriter<B> {
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 8;

    pub fn new(inner: B) -> Self {
        Self {
            inner,
            max_attempts: Self::DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn inner(&self) -> &B {
        &self.inner
    }
}

impl<B: ConditionalBackend> CounterBackend for CasDeltaWriter<B> {
    async fn read_counter(&self, id: &CounterId) -> Result<u64, SyncError> {
        Ok(self.inner.read_versioned(id).await?.value)
    }

    async fn write_increment_delta(&self, id: &CounterId, delta: u64) -> Result<u64, SyncError> {
        for attempt in 1..=self.max_attempts {
            let current = self.inner.read_versioned(id).await?;
            let value = current.value.saturating_add(delta);
            match self
                .inner
                .write_if_version(id, current.version, value)
                .await?
            {
                ConditionalWrite::Written => return Ok(value),
                ConditionalWrite::Conflict => {
                    log::debug!(
                        "Conflicting write on counter {id} (attempt {attempt}/{}), re-reading",
                        self.max_attempts
                    );
                }
            }
        }

        // Nothing was written, so the whole delta can safely be retried later.
        Err(SyncError::Transient(format!(
            "gave up on counter {id} after {} conflicting writes",
            self.max_attempts
        )))
    }

    fn subscribe_to_changes(&self, id: &CounterId) -> LocalBoxStream<'static, u64> {
        self.inner.subscribe_to_changes(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;

    #[tokio::test]
    async fn cas_writer_retries_through_conflicts() {
        let id = CounterId::new("global");
        let backend = MemoryBackend::new().with_counter(id.clone(), 10);
        backend.inject_conflicts(2);

        let writer = CasDeltaWriter::new(backend.clone());
        let total = writer.write_increment_delta(&id, 5).await.unwrap();

        assert_eq!(total, 15);
        assert_eq!(backend.value(&id), 15);
    }

    #[tokio::test]
    async fn cas_writer_gives_up_without_writing() {
        let id = CounterId::new("global");
        let backend = MemoryBackend::new().with_counter(id.clone(), 10);
        backend.inject_conflicts(3);

        let writer = CasDeltaWriter::new(backend.clone()).with_max_attempts(3);
        let err = writer.write_increment_delta(&id, 5).await.unwrap_err();

        assert!(err.is_transient(), "{err:?}");
        assert_eq!(backend.value(&id), 10);
    }

    #[test]
    fn counter_ids_serialize_as_plain_strings() {
        let id = CounterId::new("550e8400-e29b-41d4-a716-446655440000");
        assert_eq!(
            serde_json::to_string(&id).unwrap(),
            r#""550e8400-e29b-41d4-a716-446655440000""#
        );
    }
}
