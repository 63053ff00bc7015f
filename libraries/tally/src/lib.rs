//! This is a library for keeping a shared, ever-growing counter in sync across many clients.
//! It was created for a global tap counter, so it doesn't include much that was not needed for that project.
//!
//! Syncing strategy:
//! 1. Each client keeps an optimistic local value. Local increments are applied immediately and never rolled back.
//! 2. Increments are not written one by one. They accumulate in a pending batch that a fixed-interval ticker flushes.
//! 3. Writes are always deltas ("+N"), never absolute values, so two clients (or two retries) can land in any order.
//! 4. Remote values arrive from periodic polls, pushed change notifications, and write acknowledgements. They are
//!    merged with `max`, so a slow read racing behind a fast local increment never makes the display go backwards.
//!
//! Sounds simple, but there are a few tricky parts that this library handles:
//! - at most one write is in flight at a time, and taps that arrive during it go to the next batch
//! - a failed write is merged back into the pending batch and retried with exponential backoff
//! - teardown cancels the timers, lets an in-flight write finish and discards its result

pub mod batch;
pub mod counter;
pub mod duration_ms;
pub mod memory;
pub mod remote;
pub mod sync;

#[cfg(feature = "supabase")]
pub mod supabase;

pub use batch::{BackoffPolicy, BatchDispatcher, DispatchState, PendingBatch, SyncStatus};
pub use counter::{CounterSnapshot, OptimisticCounter, ReconcileOutcome};
pub use memory::MemoryBackend;
pub use remote::{CasDeltaWriter, ConditionalBackend, CounterBackend, CounterId, SyncError};
pub use sync::{CounterSync, SyncConfig};
