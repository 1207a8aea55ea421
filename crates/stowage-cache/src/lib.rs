//! Stowage Cache - tiered content cache
//!
//! An ARC policy decides which keys are resident. Resident values are kept
//! on disk and the most recently hit subset in memory. The replication
//! engine submits WAL transfers until every cached key has enough backend
//! copies.

pub mod arc;
pub mod replication;
pub mod tiered;
pub mod warm;

pub use arc::{Admission, ArcInfo, ArcPolicy, Eviction, ListLocation};
pub use replication::{OperationQueue, ReplicationEngine};
pub use tiered::{CacheEntrySnapshot, CacheStats, Tier, TieredCache};
pub use warm::{Generation, WarmStore};
