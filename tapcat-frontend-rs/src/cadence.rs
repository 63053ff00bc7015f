use std::{collections::VecDeque, time::Duration};

use tokio::time::Instant;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CadenceState {
    /// Nothing has been tapped yet.
    Idle,
    /// Tapped before, but not for a while.
    Slow,
    Normal,
    Fast,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct CadenceConfig {
    #[serde(with = "tally::duration_ms")]
    pub window: Duration,
    /// More taps than this inside `window` is [`CadenceState::Fast`].
    pub fast_threshold: usize,
    #[serde(with = "tally::duration_ms")]
    pub slow_after: Duration,
}

impl Default for CadenceConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_millis(1000),
            fast_threshold: 7,
            slow_after: Duration::from_millis(5000),
        }
    }
}

/// Classifies how fast the user is tapping. Purely cosmetic, never affects what gets counted.
#[derive(Clone, Debug)]
pub struct ClickCadenceTracker {
    config: CadenceConfig,
    recent: VecDeque<Instant>,
    last_tap: Option<Instant>,
}

impl Default for ClickCadenceTracker {
    fn default() -> Self {
        Self::new(CadenceConfig::default())
    }
}

impl ClickCadenceTracker {
    pub fn new(config: CadenceConfig) -> Self {
        Self {
            config,
            recent: VecDeque::new(),
            last_tap: None,
        }
    }

    pub fn record(&mut self, now: Instant) {
        self.prune(now);
        self.recent.push_back(now);
        self.last_tap = Some(now);
    }

    pub fn classify(&self, now: Instant) -> CadenceState {
        let Some(last_tap) = self.last_tap else {
            return CadenceState::Idle;
        };
        if now.saturating_duration_since(last_tap) >= self.config.slow_after {
            return CadenceState::Slow;
        }
        if self.clicks_per_second(now) > self.config.fast_threshold {
            CadenceState::Fast
        } else {
            CadenceState::Normal
        }
    }

    /// Taps inside the trailing window ending at `now`.
    pub fn clicks_per_second(&self, now: Instant) -> usize {
        self.recent
            .iter()
            .rev()
            .take_while(|&&tap| self.in_window(tap, now))
            .count()
    }

    pub fn reset(&mut self) {
        self.recent.clear();
        self.last_tap = None;
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&oldest) = self.recent.front() {
            if self.in_window(oldest, now) {
                break;
            }
            self.recent.pop_front();
        }
    }

    fn in_window(&self, tap: Instant, now: Instant) -> bool {
        now.saturating_duration_since(tap) < self.config.window
    }
}
