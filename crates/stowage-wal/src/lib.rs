//! Stowage WAL - durable log of storage operations
//!
//! Operations are appended to one active partition per backend and every
//! later status change appends a fresh snapshot. On open the partitions are
//! replayed in order to rebuild the latest state of each operation.

pub mod iter;
pub mod partition;
pub mod record;
pub mod store;

pub use iter::{ListCursor, ListFilter, OperationIter};
pub use partition::{PartitionId, PartitionInfo, PartitionState};
pub use record::{WalRecord, WAL_MAGIC};
pub use store::{
    BackendWalStats, CompactionReport, GcReport, StatusUpdate, WalHandle, WalStats, WalStore,
};

use std::path::Path;
use stowage_common::config::WalConfig;
use stowage_common::{Result, SharedClock};

/// Open the WAL at `storage_path`, recovering any existing partitions
pub fn init(
    storage_path: impl AsRef<Path>,
    config: WalConfig,
    clock: SharedClock,
) -> Result<WalHandle> {
    WalStore::open(storage_path, config, clock)
}

/// Flush and fsync every active partition and reject further writes
pub fn shutdown(handle: WalHandle) -> Result<()> {
    handle.shutdown()
}
