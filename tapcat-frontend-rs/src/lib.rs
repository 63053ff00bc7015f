//! The client side of tapcat, a global tap counter.
//!
//! [`TapEngine`] is what the UI holds. A tap goes through:
//! 1. [`cadence::ClickCadenceTracker`] and [`combo::ComboAccumulator`], which only drive cosmetics
//! 2. [`multiplier::MultiplierResolver`], which decides what the tap is worth
//! 3. the optimistic counters from [`tally`], which show the new value immediately and sync it later
//!
//! Nothing here blocks on the network. Call [`TapEngine::start`] from inside a
//! [`tokio::task::LocalSet`] so the background sync and combo countdown have somewhere to run.

pub mod cadence;
pub mod combo;
pub mod config;
pub mod engine;
pub mod multiplier;
pub mod timer;

use std::sync::LazyLock;

pub use cadence::{CadenceConfig, CadenceState, ClickCadenceTracker};
pub use combo::{ComboAccumulator, ComboState};
pub use config::{ConfigError, EngineConfig};
pub use engine::{TapEngine, TapEvent, TapOutcome};
pub use multiplier::{LuckConfig, LuckRoll, MultiplierResolver, MultiplierSource};
pub use tally::{CounterId, MemoryBackend, SyncStatus};

// putting this inside LOGGER prevents us from accidentally initializing the logger more than once
static LOGGER: LazyLock<()> = LazyLock::new(|| {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .try_init();
    log::info!("Logging initialized");
});

/// Set up `env_logger` (respecting `RUST_LOG`, defaulting to `info`). Safe to call more than once.
pub fn init_logging() {
    LazyLock::force(&LOGGER);
}
