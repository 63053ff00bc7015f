//! Drives one [`OptimisticCounter`] and its [`BatchDispatcher`] against a backend.
//!
//! Everything runs on one thread: background work is spawned with [`tokio::task::spawn_local`],
//! so [`CounterSync::start`] must be called from inside a [`tokio::task::LocalSet`].
//! We never hold a `RefCell` borrow across an `.await`, which rules out "already borrowed" panics.

use std::{
    cell::{Cell, RefCell},
    rc::Rc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::{
    sync::Notify,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};

use crate::{
    batch::{BackoffPolicy, BatchDispatcher, DispatchState, SyncStatus},
    counter::{CounterSnapshot, OptimisticCounter, ReconcileOutcome},
    remote::{CounterBackend, CounterId},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// How often pending increments are written.
    #[serde(with = "crate::duration_ms")]
    pub flush_interval: Duration,
    /// How often the counter is re-read, on top of pushed changes.
    #[serde(with = "crate::duration_ms")]
    pub poll_interval: Duration,
    pub backoff: BackoffPolicy,
    /// Consecutive failures before [`SyncStatus::Issue`] is reported.
    pub max_retries_before_issue: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_millis(200),
            poll_interval: Duration::from_secs(10),
            backoff: BackoffPolicy::default(),
            max_retries_before_issue: 5,
        }
    }
}

struct SyncState {
    counter: OptimisticCounter,
    dispatcher: BatchDispatcher,
}

struct Shared<B> {
    id: CounterId,
    backend: B,
    config: SyncConfig,
    state: RefCell<SyncState>,
    torn_down: Cell<bool>,
    shutdown: Notify,
}

pub struct CounterSync<B: CounterBackend + 'static> {
    shared: Rc<Shared<B>>,
    // The flush loop is never aborted so an in-flight write can finish; it exits on `shutdown`.
    flush_task: RefCell<Option<JoinHandle<()>>>,
    read_tasks: RefCell<Vec<JoinHandle<()>>>,
}

impl<B: CounterBackend + 'static> CounterSync<B> {
    pub fn new(id: CounterId, backend: B, config: SyncConfig) -> Self {
        let dispatcher = BatchDispatcher::new(config.backoff, config.max_retries_before_issue);
        Self {
            shared: Rc::new(Shared {
                id,
                backend,
                config,
                state: RefCell::new(SyncState {
                    counter: OptimisticCounter::new(),
                    dispatcher,
                }),
                torn_down: Cell::new(false),
                shutdown: Notify::new(),
            }),
            flush_task: RefCell::new(None),
            read_tasks: RefCell::new(Vec::new()),
        }
    }

    /// One remote read to seed the counter. Fails soft: on error the counter starts at zero,
    /// is flagged stale, and tapping keeps working.
    pub async fn initialize(&self) -> CounterSnapshot {
        let shared = &self.shared;
        let observed_at = Utc::now();
        let result = shared.backend.read_counter(&shared.id).await;

        let mut state = shared.state.borrow_mut();
        match result {
            Ok(value) => {
                log::info!("Counter {} initialized at {value}", shared.id);
                state.counter.initialized(value, observed_at);
            }
            Err(e) => {
                log::warn!(
                    "Couldn't read counter {}, starting from local state: {e}",
                    shared.id
                );
                state.counter.initialization_failed();
            }
        }
        state.counter.snapshot()
    }

    /// Applies `amount` locally and queues it for the backend. Never touches the network.
    pub fn apply_local_increment(&self, amount: u64) -> u64 {
        let mut state = self.shared.state.borrow_mut();
        if amount == 0 {
            return state.counter.display_value();
        }
        state.dispatcher.enqueue(amount);
        state.counter.apply_local_increment(amount)
    }

    pub fn reconcile(&self, remote_value: u64, observed_at: DateTime<Utc>) -> ReconcileOutcome {
        self.shared.reconcile(remote_value, observed_at)
    }

    pub fn id(&self) -> &CounterId {
        &self.shared.id
    }

    pub fn display_value(&self) -> u64 {
        self.shared.state.borrow().counter.display_value()
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        self.shared.state.borrow().counter.snapshot()
    }

    pub fn is_stale(&self) -> bool {
        self.shared.state.borrow().counter.is_stale()
    }

    pub fn status(&self) -> SyncStatus {
        self.shared.state.borrow().dispatcher.status()
    }

    pub fn dispatch_state(&self) -> DispatchState {
        self.shared.state.borrow().dispatcher.state()
    }

    /// Accepted locally but not yet acknowledged by the backend.
    pub fn pending(&self) -> u64 {
        self.shared.state.borrow().dispatcher.pending_total()
    }

    /// Clear backoff and any rejection pause; the next tick writes whatever is pending.
    pub fn retry_now(&self) {
        self.shared.state.borrow_mut().dispatcher.retry_now();
    }

    /// Run one dispatch cycle right away instead of waiting for the next tick.
    /// Does nothing if a write is already in flight.
    pub async fn flush_now(&self) {
        if self.shared.torn_down.get() {
            return;
        }
        Rc::clone(&self.shared).flush_cycle(Instant::now()).await;
    }

    pub fn is_running(&self) -> bool {
        self.flush_task.borrow().is_some() && !self.shared.torn_down.get()
    }

    /// Set once [`CounterSync::stop`] has run. A stopped sync never starts again.
    pub fn is_torn_down(&self) -> bool {
        self.shared.torn_down.get()
    }

    /// Spawn the flush ticker, the poll loop and the change subscription.
    pub fn start(&self) {
        if self.shared.torn_down.get() {
            log::warn!("Counter {} was stopped and can't be restarted", self.shared.id);
            return;
        }
        if self.flush_task.borrow().is_some() {
            return;
        }

        log::info!("Starting sync for counter {}", self.shared.id);
        *self.flush_task.borrow_mut() = Some(tokio::task::spawn_local(
            Rc::clone(&self.shared).run_flush_loop(),
        ));

        let mut read_tasks = self.read_tasks.borrow_mut();
        read_tasks.push(tokio::task::spawn_local(
            Rc::clone(&self.shared).run_poll_loop(),
        ));
        read_tasks.push(tokio::task::spawn_local(
            Rc::clone(&self.shared).run_subscription(),
        ));
    }

    /// Cancel all timers. A write already in flight completes, but its result is discarded.
    pub fn stop(&self) {
        if self.shared.torn_down.replace(true) {
            return;
        }
        self.shared.shutdown.notify_waiters();
        for task in self.read_tasks.borrow_mut().drain(..) {
            task.abort();
        }
        // Detach: it exits by itself once any in-flight write returns.
        if self.flush_task.borrow_mut().take().is_some() {
            log::info!(
                "Stopped sync for counter {} with {} pending",
                self.shared.id,
                self.pending()
            );
        }
    }
}

impl<B: CounterBackend + 'static> Drop for CounterSync<B> {
    fn drop(&mut self) {
        self.stop();
    }
}

impl<B: CounterBackend + 'static> Shared<B> {
    fn reconcile(&self, remote_value: u64, observed_at: DateTime<Utc>) -> ReconcileOutcome {
        let outcome = self
            .state
            .borrow_mut()
            .counter
            .reconcile(remote_value, observed_at);
        if outcome == ReconcileOutcome::Stale {
            log::debug!(
                "Ignoring stale remote value {remote_value} for counter {}",
                self.id
            );
        }
        outcome
    }

    /// Start a write if the dispatcher allows one, then keep draining until nothing is left
    /// or a write fails.
    async fn flush_cycle(self: Rc<Self>, now: Instant) {
        let Some(mut amount) = self.state.borrow_mut().dispatcher.begin_flush(now) else {
            return;
        };

        loop {
            log::debug!("Writing +{amount} to counter {}", self.id);
            let result = self.backend.write_increment_delta(&self.id, amount).await;

            if self.torn_down.get() {
                log::debug!(
                    "Discarding result of write +{amount} to counter {}: torn down",
                    self.id
                );
                return;
            }

            let next = {
                let mut state = self.state.borrow_mut();
                match result {
                    Ok(total) => {
                        state.counter.reconcile(total, Utc::now());
                        state.dispatcher.complete_success()
                    }
                    Err(e) => {
                        // Rejections are logged by the dispatcher.
                        if e.is_transient() {
                            log::warn!("Write +{amount} to counter {} failed: {e}", self.id);
                        }
                        if let Some(delay) = state.dispatcher.complete_failure(e, Instant::now()) {
                            log::debug!("Retrying counter {} in {delay:?}", self.id);
                        }
                        None
                    }
                }
            };

            match next {
                Some(next) => amount = next,
                None => return,
            }
        }
    }

    async fn run_flush_loop(self: Rc<Self>) {
        let mut ticker = tokio::time::interval(self.config.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.shutdown.notified() => break,
            }
            if self.torn_down.get() {
                break;
            }
            Rc::clone(&self).flush_cycle(Instant::now()).await;
        }
        log::debug!("Flush loop for counter {} exited", self.id);
    }

    async fn run_poll_loop(self: Rc<Self>) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately and `initialize` already did that read.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            // Stamp with the time the read was issued, not when the response arrived.
            let observed_at = Utc::now();
            match self.backend.read_counter(&self.id).await {
                Ok(value) if !self.torn_down.get() => {
                    self.reconcile(value, observed_at);
                }
                Ok(_) => break,
                Err(e) => log::debug!("Polling counter {} failed: {e}", self.id),
            }
        }
    }

    async fn run_subscription(self: Rc<Self>) {
        let mut changes = self.backend.subscribe_to_changes(&self.id);
        while let Some(value) = changes.next().await {
            if self.torn_down.get() {
                break;
            }
            self.reconcile(value, Utc::now());
        }
        log::debug!("Change subscription for counter {} ended", self.id);
    }
}
