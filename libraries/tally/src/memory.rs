//! An in-process backend. Clones share the same counters, so several clients can be pointed at one instance.
//!
//! Besides being a working backend, it can script failures and latency and records what was written,
//! which is what the tests and the simulator use it for.

use std::{
    cell::RefCell,
    collections::{BTreeMap, VecDeque},
    rc::Rc,
    time::Duration,
};

use futures::{StreamExt, channel::mpsc, stream::LocalBoxStream};

use crate::remote::{
    ConditionalBackend, ConditionalWrite, CounterBackend, CounterId, SyncError, Versioned,
};

#[derive(Clone, Default)]
pub struct MemoryBackend {
    inner: Rc<RefCell<Inner>>,
}

#[derive(Default)]
struct Inner {
    counters: BTreeMap<CounterId, Versioned>,
    subscribers: Vec<(CounterId, mpsc::UnboundedSender<u64>)>,
    write_failures: VecDeque<SyncError>,
    read_failures: VecDeque<SyncError>,
    conflicts: usize,
    write_latency: Duration,
    read_latency: Duration,
    in_flight: usize,
    max_in_flight: usize,
    write_attempts: usize,
    applied_deltas: Vec<u64>,
}

impl Inner {
    fn set(&mut self, id: &CounterId, value: u64) {
        let entry = self.counters.entry(id.clone()).or_insert(Versioned {
            value: 0,
            version: 0,
        });
        entry.value = value;
        entry.version += 1;

        self.subscribers.retain(|(subscribed, sender)| {
            if subscribed != id {
                return !sender.is_closed();
            }
            sender.unbounded_send(value).is_ok()
        });
    }
}

/// Tracks one outstanding write; decrements the in-flight count even if the write future is dropped.
struct InFlightGuard {
    inner: Rc<RefCell<Inner>>,
}

impl InFlightGuard {
    fn enter(inner: &Rc<RefCell<Inner>>) -> Self {
        {
            let mut inner = inner.borrow_mut();
            inner.in_flight += 1;
            inner.max_in_flight = inner.max_in_flight.max(inner.in_flight);
            inner.write_attempts += 1;
        }
        Self {
            inner: Rc::clone(inner),
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.inner.borrow_mut().in_flight -= 1;
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_counter(self, id: impl Into<CounterId>, value: u64) -> Self {
        self.set(&id.into(), value);
        self
    }

    /// Overwrite a counter as if some other party did it. Subscribers are notified.
    pub fn set(&self, id: &CounterId, value: u64) {
        self.inner.borrow_mut().set(id, value);
    }

    /// Add to a counter as if another client's write landed. Subscribers are notified.
    pub fn external_increment(&self, id: &CounterId, delta: u64) -> u64 {
        let mut inner = self.inner.borrow_mut();
        let value = inner
            .counters
            .get(id)
            .map(|counter| counter.value)
            .unwrap_or(0)
            .saturating_add(delta);
        inner.set(id, value);
        value
    }

    pub fn value(&self, id: &CounterId) -> u64 {
        self.inner
            .borrow()
            .counters
            .get(id)
            .map(|counter| counter.value)
            .unwrap_or(0)
    }

    pub fn fail_next_writes(&self, count: usize, error: SyncError) {
        let mut inner = self.inner.borrow_mut();
        inner
            .write_failures
            .extend(std::iter::repeat_n(error, count));
    }

    pub fn fail_next_reads(&self, count: usize, error: SyncError) {
        let mut inner = self.inner.borrow_mut();
        inner.read_failures.extend(std::iter::repeat_n(error, count));
    }

    /// The next `count` conditional writes report a conflict.
    pub fn inject_conflicts(&self, count: usize) {
        self.inner.borrow_mut().conflicts += count;
    }

    pub fn set_write_latency(&self, latency: Duration) {
        self.inner.borrow_mut().write_latency = latency;
    }

    pub fn set_read_latency(&self, latency: Duration) {
        self.inner.borrow_mut().read_latency = latency;
    }

    pub fn in_flight(&self) -> usize {
        self.inner.borrow().in_flight
    }

    /// The most writes that were ever outstanding at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.inner.borrow().max_in_flight
    }

    pub fn write_attempts(&self) -> usize {
        self.inner.borrow().write_attempts
    }

    /// Every delta that was successfully added, in the order it landed.
    pub fn applied_deltas(&self) -> Vec<u64> {
        self.inner.borrow().applied_deltas.clone()
    }

    async fn delay(latency: Duration) {
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    fn take_read_failure(&self) -> Option<SyncError> {
        self.inner.borrow_mut().read_failures.pop_front()
    }

    fn subscribe(&self, id: &CounterId) -> LocalBoxStream<'static, u64> {
        let (sender, receiver) = mpsc::unbounded();
        self.inner
            .borrow_mut()
            .subscribers
            .push((id.clone(), sender));
        receiver.boxed_local()
    }
}

impl CounterBackend for MemoryBackend {
    async fn read_counter(&self, id: &CounterId) -> Result<u64, SyncError> {
        let latency = self.inner.borrow().read_latency;
        Self::delay(latency).await;
        if let Some(error) = self.take_read_failure() {
            return Err(error);
        }
        Ok(self.value(id))
    }

    async fn write_increment_delta(&self, id: &CounterId, delta: u64) -> Result<u64, SyncError> {
        let _guard = InFlightGuard::enter(&self.inner);
        let latency = self.inner.borrow().write_latency;
        Self::delay(latency).await;

        let mut inner = self.inner.borrow_mut();
        if let Some(error) = inner.write_failures.pop_front() {
            return Err(error);
        }
        let value = inner
            .counters
            .get(id)
            .map(|counter| counter.value)
            .unwrap_or(0)
            .saturating_add(delta);
        inner.set(id, value);
        inner.applied_deltas.push(delta);
        Ok(value)
    }

    fn subscribe_to_changes(&self, id: &CounterId) -> LocalBoxStream<'static, u64> {
        self.subscribe(id)
    }
}

impl ConditionalBackend for MemoryBackend {
    async fn read_versioned(&self, id: &CounterId) -> Result<Versioned, SyncError> {
        let latency = self.inner.borrow().read_latency;
        Self::delay(latency).await;
        if let Some(error) = self.take_read_failure() {
            return Err(error);
        }
        Ok(self
            .inner
            .borrow()
            .counters
            .get(id)
            .copied()
            .unwrap_or(Versioned {
                value: 0,
                version: 0,
            }))
    }

    async fn write_if_version(
        &self,
        id: &CounterId,
        expected_version: u64,
        value: u64,
    ) -> Result<ConditionalWrite, SyncError> {
        let _guard = InFlightGuard::enter(&self.inner);
        let latency = self.inner.borrow().write_latency;
        Self::delay(latency).await;

        let mut inner = self.inner.borrow_mut();
        if let Some(error) = inner.write_failures.pop_front() {
            return Err(error);
        }
        if inner.conflicts > 0 {
            inner.conflicts -= 1;
            return Ok(ConditionalWrite::Conflict);
        }

        let current = inner.counters.get(id).copied().unwrap_or(Versioned {
            value: 0,
            version: 0,
        });
        if current.version != expected_version {
            return Ok(ConditionalWrite::Conflict);
        }
        inner.applied_deltas.push(value.saturating_sub(current.value));
        inner.set(id, value);
        Ok(ConditionalWrite::Written)
    }

    fn subscribe_to_changes(&self, id: &CounterId) -> LocalBoxStream<'static, u64> {
        self.subscribe(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn clones_share_counters_and_notify_subscribers() {
        let id = CounterId::new("global");
        let backend = MemoryBackend::new().with_counter(id.clone(), 100);
        let other_client = backend.clone();

        let mut changes = CounterBackend::subscribe_to_changes(&backend, &id);
        let total = other_client.write_increment_delta(&id, 7).await.unwrap();

        assert_eq!(total, 107);
        assert_eq!(changes.next().await, Some(107));
        assert_eq!(backend.read_counter(&id).await.unwrap(), 107);
        assert_eq!(backend.applied_deltas(), vec![7]);
    }

    #[tokio::test]
    async fn scripted_failures_are_consumed_in_order() {
        let id = CounterId::new("global");
        let backend = MemoryBackend::new();
        backend.fail_next_writes(1, SyncError::Transient("timeout".into()));

        assert!(backend.write_increment_delta(&id, 1).await.is_err());
        assert_eq!(backend.write_increment_delta(&id, 1).await, Ok(1));
        assert_eq!(backend.write_attempts(), 2);
        assert_eq!(backend.in_flight(), 0);
    }

    #[tokio::test]
    async fn stale_version_is_a_conflict() {
        let id = CounterId::new("global");
        let backend = MemoryBackend::new().with_counter(id.clone(), 5);
        let read = backend.read_versioned(&id).await.unwrap();
        backend.external_increment(&id, 1);

        let outcome = backend
            .write_if_version(&id, read.version, read.value + 1)
            .await
            .unwrap();
        assert_eq!(outcome, ConditionalWrite::Conflict);
        assert_eq!(backend.value(&id), 6);
    }
}
