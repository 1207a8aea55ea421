//! Restartable listing of WAL operations

use crate::store::WalStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stowage_common::{BackendId, Operation, OperationId, OperationStatus};

/// Selects operations for [`WalStore::list`]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListFilter {
    pub status: Option<OperationStatus>,
    pub backend_id: Option<BackendId>,
    /// Only operations created at or after this instant
    pub since: Option<DateTime<Utc>>,
}

impl ListFilter {
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_status(mut self, status: OperationStatus) -> Self {
        self.status = Some(status);
        self
    }

    #[must_use]
    pub fn with_backend(mut self, backend: BackendId) -> Self {
        self.backend_id = Some(backend);
        self
    }

    #[must_use]
    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn matches(&self, op: &Operation) -> bool {
        self.status.is_none_or(|s| op.status == s)
            && self.backend_id.as_ref().is_none_or(|b| op.backend_id == *b)
            && self.since.is_none_or(|t| op.created_at >= t)
    }
}

/// Position in a listing; resumes strictly after the last yielded item
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ListCursor {
    pub created_at: DateTime<Utc>,
    pub id: OperationId,
}

/// Lazy iterator over a snapshot of matching operation IDs
///
/// Each operation is read from the index when yielded. Operations that no
/// longer match the filter (or were compacted away) are skipped.
pub struct OperationIter<'a> {
    store: &'a WalStore,
    filter: ListFilter,
    keys: std::vec::IntoIter<ListCursor>,
    cursor: Option<ListCursor>,
}

impl<'a> OperationIter<'a> {
    pub(crate) fn new(store: &'a WalStore, filter: ListFilter, keys: Vec<ListCursor>) -> Self {
        Self {
            store,
            filter,
            keys: keys.into_iter(),
            cursor: None,
        }
    }

    /// Position after the last yielded operation
    pub const fn cursor(&self) -> Option<ListCursor> {
        self.cursor
    }

    /// IDs left in the snapshot
    pub fn remaining(&self) -> usize {
        self.keys.len()
    }
}

impl Iterator for OperationIter<'_> {
    type Item = Operation;

    fn next(&mut self) -> Option<Self::Item> {
        for key in self.keys.by_ref() {
            let Ok(op) = self.store.get(key.id) else {
                continue;
            };
            if self.filter.matches(&op) {
                self.cursor = Some(key);
                return Some(op);
            }
        }
        None
    }
}
