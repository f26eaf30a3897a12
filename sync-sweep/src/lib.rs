//! Expiration sweep for stale listing requests.

pub mod memory;
pub mod scheduler;
pub mod store;
pub mod sweep;

pub use memory::MemoryRequestStore;
pub use store::{
    ExpiryBatch, ExpiryCandidate, ExpiryOutcome, NewNotification, PgRequestStore, RequestStore, StoreError,
};
pub use sweep::{SweepError, SweepReport, Sweeper};
