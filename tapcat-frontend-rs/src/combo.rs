//! Tap streaks. A streak keeps going as long as each tap lands within `timeout` of the previous one.
//!
//! [`ComboAccumulator`] itself holds no timer: [`ComboAccumulator::record`] returns the deadline and
//! whoever owns it arms a [`crate::timer::Countdown`] that calls [`ComboAccumulator::expire`].

use std::time::Duration;

use tokio::time::Instant;

pub const DEFAULT_COMBO_TIMEOUT: Duration = Duration::from_millis(2000);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ComboState {
    pub count: u64,
    pub active: bool,
    /// Best streak this session. Survives timeouts and resets.
    pub max: u64,
}

#[derive(Clone, Debug)]
pub struct ComboAccumulator {
    timeout: Duration,
    state: ComboState,
    deadline: Option<Instant>,
}

impl Default for ComboAccumulator {
    fn default() -> Self {
        Self::new(DEFAULT_COMBO_TIMEOUT)
    }
}

impl ComboAccumulator {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            state: ComboState::default(),
            deadline: None,
        }
    }

    /// Extend the streak. Returns when it runs out unless tapped again.
    pub fn record(&mut self, now: Instant) -> Instant {
        self.expire(now);
        self.state.count = self.state.count.saturating_add(1);
        self.state.active = true;
        self.state.max = self.state.max.max(self.state.count);
        let deadline = now + self.timeout;
        self.deadline = Some(deadline);
        deadline
    }

    /// Ends the streak if its deadline has passed. Returns whether it did.
    pub fn expire(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                log::debug!("Combo of {} ran out", self.state.count);
                self.clear();
                true
            }
            _ => false,
        }
    }

    pub fn reset(&mut self) {
        self.clear();
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// The state as last updated by `record`/`expire`/`reset`.
    pub fn state(&self) -> ComboState {
        self.state
    }

    /// The state as it is at `now`, whether or not the countdown has fired yet.
    pub fn state_at(&self, now: Instant) -> ComboState {
        match self.deadline {
            Some(deadline) if now >= deadline => ComboState {
                count: 0,
                active: false,
                max: self.state.max,
            },
            _ => self.state,
        }
    }

    fn clear(&mut self) {
        self.state.count = 0;
        self.state.active = false;
        self.deadline = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(millis: u64) -> Duration {
        Duration::from_millis(millis)
    }

    #[test]
    fn streak_survives_a_1999ms_pause() {
        let start = Instant::now();
        let mut combo = ComboAccumulator::default();
        combo.record(start);

        assert!(!combo.expire(start + ms(1999)));
        assert_eq!(combo.state().count, 1);

        combo.record(start + ms(1999));
        assert_eq!(combo.state().count, 2);
        assert!(combo.state().active);
    }

    #[test]
    fn streak_resets_after_a_2001ms_pause() {
        let start = Instant::now();
        let mut combo = ComboAccumulator::default();
        combo.record(start);

        assert!(combo.expire(start + ms(2001)));
        assert_eq!(
            combo.state(),
            ComboState {
                count: 0,
                active: false,
                max: 1
            }
        );
    }

    #[test]
    fn late_tap_starts_a_new_streak() {
        let start = Instant::now();
        let mut combo = ComboAccumulator::default();
        for i in 0..4 {
            combo.record(start + ms(i * 500));
        }
        assert_eq!(combo.state().count, 4);

        // Nobody called `expire`, but the tap still notices the streak is over.
        combo.record(start + ms(10_000));
        assert_eq!(combo.state().count, 1);
        assert_eq!(combo.state().max, 4);
    }

    #[test]
    fn deadline_moves_with_every_tap() {
        let start = Instant::now();
        let mut combo = ComboAccumulator::default();
        assert_eq!(combo.record(start), start + ms(2000));
        assert_eq!(combo.record(start + ms(300)), start + ms(2300));
        assert_eq!(combo.deadline(), Some(start + ms(2300)));

        // The first deadline has passed but the streak is still alive.
        assert!(!combo.expire(start + ms(2100)));
        assert_eq!(combo.state_at(start + ms(2100)).count, 2);
        assert_eq!(combo.state_at(start + ms(2300)).count, 0);
    }

    #[test]
    fn reset_keeps_the_best_streak() {
        let start = Instant::now();
        let mut combo = ComboAccumulator::default();
        combo.record(start);
        combo.record(start + ms(10));
        combo.reset();

        assert_eq!(combo.state().count, 0);
        assert!(!combo.state().active);
        assert_eq!(combo.state().max, 2);
        assert_eq!(combo.deadline(), None);
    }
}
