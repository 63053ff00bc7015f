use std::{
    cell::{Cell, RefCell},
    rc::Rc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use rand::Rng;
use tally::{CounterBackend, CounterSnapshot, CounterSync, SyncStatus};
use tokio::time::Instant;

use crate::{
    cadence::{CadenceState, ClickCadenceTracker},
    combo::{ComboAccumulator, ComboState},
    config::EngineConfig,
    multiplier::{LuckRoll, MultiplierResolver, MultiplierSource},
    timer::Countdown,
};

/// One tap, as seen by the cosmetic trackers. Never persisted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TapEvent {
    pub timestamp: Instant,
    pub local_sequence_number: u64,
}

/// Everything the UI needs to react to a tap.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TapOutcome {
    pub event: TapEvent,
    /// Base amount times the multiplier in effect when the tap happened.
    pub amount: u64,
    pub display_value: u64,
    pub cadence: CadenceState,
    pub combo: ComboState,
    /// Tapping fast enough to earn the bonus effect.
    pub fast_tap: bool,
}

struct LocalState {
    cadence: ClickCadenceTracker,
    combo: ComboAccumulator,
    multipliers: MultiplierResolver,
}

/// The one object the UI talks to. Construct once per session, [`TapEngine::initialize`], then
/// [`TapEngine::start`] from inside a [`tokio::task::LocalSet`].
///
/// Tapping never waits on the network: [`TapEngine::tap`] updates local state and returns immediately,
/// and the counters sync in the background.
pub struct TapEngine<B: CounterBackend + 'static> {
    global: CounterSync<B>,
    personal: Option<CounterSync<B>>,
    local: Rc<RefCell<LocalState>>,
    combo_timer: RefCell<Countdown>,
    running: Cell<bool>,
    next_sequence_number: Cell<u64>,
}

impl<B: CounterBackend + Clone + 'static> TapEngine<B> {
    pub fn new(backend: B, config: EngineConfig) -> Self {
        let EngineConfig {
            global_counter_id,
            personal_counter_id,
            sync,
            cadence,
            combo_timeout,
            luck,
        } = config;

        let personal =
            personal_counter_id.map(|id| CounterSync::new(id, backend.clone(), sync));
        Self {
            global: CounterSync::new(global_counter_id, backend, sync),
            personal,
            local: Rc::new(RefCell::new(LocalState {
                cadence: ClickCadenceTracker::new(cadence),
                combo: ComboAccumulator::new(combo_timeout),
                multipliers: MultiplierResolver::new(luck, Utc::now()),
            })),
            combo_timer: RefCell::new(Countdown::new()),
            running: Cell::new(false),
            next_sequence_number: Cell::new(0),
        }
    }
}

impl<B: CounterBackend + 'static> TapEngine<B> {
    /// Reads the counters once. Never fails: if the backend can't be reached the engine counts
    /// from zero and [`TapEngine::is_stale`] reports it.
    pub async fn initialize(&self) -> CounterSnapshot {
        match &self.personal {
            Some(personal) => {
                let (global, _) = futures::join!(self.global.initialize(), personal.initialize());
                global
            }
            None => self.global.initialize().await,
        }
    }

    pub fn tap(&self) -> TapOutcome {
        self.tap_by(1)
    }

    pub fn tap_by(&self, base_amount: u64) -> TapOutcome {
        self.tap_at(base_amount, Instant::now(), Utc::now())
    }

    /// Like [`TapEngine::tap_by`] with explicit clocks: `now` for cadence and combo, `wall_clock` for
    /// multiplier expiry.
    pub fn tap_at(
        &self,
        base_amount: u64,
        now: Instant,
        wall_clock: DateTime<Utc>,
    ) -> TapOutcome {
        let sequence_number = self.next_sequence_number.get();
        self.next_sequence_number.set(sequence_number.wrapping_add(1));
        let event = TapEvent {
            timestamp: now,
            local_sequence_number: sequence_number,
        };

        let (cadence, combo, multiplier, combo_deadline) = {
            let mut local = self.local.borrow_mut();
            local.cadence.record(event.timestamp);
            let combo_deadline = local.combo.record(event.timestamp);
            (
                local.cadence.classify(event.timestamp),
                local.combo.state(),
                local.multipliers.current_multiplier(wall_clock),
                combo_deadline,
            )
        };
        if self.running.get() {
            self.arm_combo_timer(combo_deadline);
        }

        let amount = base_amount.saturating_mul(multiplier);
        let display_value = self.global.apply_local_increment(amount);
        if let Some(personal) = &self.personal {
            personal.apply_local_increment(amount);
        }

        TapOutcome {
            event,
            amount,
            display_value,
            cadence,
            combo,
            fast_tap: cadence == CadenceState::Fast,
        }
    }

    pub fn current_display_value(&self) -> u64 {
        self.global.display_value()
    }

    pub fn personal_display_value(&self) -> Option<u64> {
        self.personal.as_ref().map(CounterSync::display_value)
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        self.global.snapshot()
    }

    pub fn current_multiplier(&self) -> u64 {
        self.multiplier_at(Utc::now())
    }

    pub fn multiplier_at(&self, wall_clock: DateTime<Utc>) -> u64 {
        self.local
            .borrow()
            .multipliers
            .current_multiplier(wall_clock)
    }

    pub fn multiplier_sources(&self) -> Vec<MultiplierSource> {
        self.local.borrow().multipliers.sources().to_vec()
    }

    pub fn cadence_state(&self) -> CadenceState {
        self.cadence_at(Instant::now())
    }

    pub fn cadence_at(&self, now: Instant) -> CadenceState {
        self.local.borrow().cadence.classify(now)
    }

    pub fn clicks_per_second(&self) -> usize {
        self.local
            .borrow()
            .cadence
            .clicks_per_second(Instant::now())
    }

    pub fn combo_state(&self) -> ComboState {
        self.combo_at(Instant::now())
    }

    pub fn combo_at(&self, now: Instant) -> ComboState {
        self.local.borrow().combo.state_at(now)
    }

    pub fn reset_combo(&self) {
        self.combo_timer.borrow_mut().cancel();
        self.local.borrow_mut().combo.reset();
    }

    pub fn join_party(&self, room_id: impl Into<String>, multiplier: u32) {
        self.local
            .borrow_mut()
            .multipliers
            .join_party(room_id, multiplier, Utc::now());
    }

    pub fn leave_party(&self) -> Option<String> {
        self.local.borrow_mut().multipliers.leave_party()
    }

    /// Hand out a luck bonus directly, replacing any current one.
    pub fn grant_luck(&self, multiplier: u32, expires_at: DateTime<Utc>) {
        self.local
            .borrow_mut()
            .multipliers
            .grant_luck(multiplier, expires_at, Utc::now());
    }

    /// Roll for a luck bonus if one is due.
    pub fn check_for_luck_roll(&self) -> Option<LuckRoll> {
        self.roll_luck_at(Utc::now(), &mut rand::rng())
    }

    pub fn roll_luck_at(&self, wall_clock: DateTime<Utc>, rng: &mut impl Rng) -> Option<LuckRoll> {
        self.local
            .borrow_mut()
            .multipliers
            .roll_luck(wall_clock, rng)
    }

    pub fn time_to_next_roll(&self) -> Duration {
        self.local
            .borrow()
            .multipliers
            .time_to_next_roll(Utc::now())
    }

    pub fn luck_time_remaining(&self) -> Duration {
        self.local
            .borrow()
            .multipliers
            .luck_time_remaining(Utc::now())
    }

    pub fn sync_status(&self) -> SyncStatus {
        self.global.status()
    }

    pub fn personal_sync_status(&self) -> Option<SyncStatus> {
        self.personal.as_ref().map(CounterSync::status)
    }

    /// The first read failed and nothing has come in from the backend since.
    pub fn is_stale(&self) -> bool {
        self.global.is_stale()
    }

    pub fn is_running(&self) -> bool {
        self.running.get()
    }

    /// Start background sync and the combo countdown. An engine that was stopped stays stopped.
    pub fn start(&self) {
        if self.global.is_torn_down() {
            log::warn!("Tap engine was stopped and can't be restarted");
            return;
        }
        if self.running.replace(true) {
            return;
        }
        log::info!("Starting tap engine");
        self.global.start();
        if let Some(personal) = &self.personal {
            personal.start();
        }
        // A streak from before `start` still needs its countdown.
        let deadline = self.local.borrow().combo.deadline();
        if let Some(deadline) = deadline {
            self.arm_combo_timer(deadline);
        }
    }

    /// Cancels every timer for good. Writes already in flight finish, but their results are ignored.
    pub fn stop(&self) {
        if !self.running.replace(false) {
            return;
        }
        log::info!(
            "Stopping tap engine at {} with {} taps not yet synced",
            self.current_display_value(),
            self.global.pending()
        );
        self.combo_timer.borrow_mut().cancel();
        self.global.stop();
        if let Some(personal) = &self.personal {
            personal.stop();
        }
    }

    /// Write whatever is pending now rather than on the next tick.
    pub async fn flush_now(&self) {
        match &self.personal {
            Some(personal) => {
                futures::join!(self.global.flush_now(), personal.flush_now());
            }
            None => self.global.flush_now().await,
        }
    }

    pub fn retry_now(&self) {
        self.global.retry_now();
        if let Some(personal) = &self.personal {
            personal.retry_now();
        }
    }

    fn arm_combo_timer(&self, deadline: Instant) {
        let local = Rc::downgrade(&self.local);
        self.combo_timer.borrow_mut().arm(deadline, move || {
            if let Some(local) = local.upgrade() {
                local.borrow_mut().combo.expire(Instant::now());
            }
        });
    }
}

impl<B: CounterBackend + 'static> Drop for TapEngine<B> {
    fn drop(&mut self) {
        self.stop();
    }
}
