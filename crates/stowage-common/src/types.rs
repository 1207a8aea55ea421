//! Core type definitions for Stowage
//!
//! This module defines the identifiers and the durable `Operation` record
//! shared by the WAL, the processor and the cache.

use chrono::{DateTime, Utc};
use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Unique identifier for an operation (UUIDv7, time ordered)
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, From, Into)]
pub struct OperationId(Uuid);

impl OperationId {
    /// Generate a new time-ordered operation ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Create from existing UUID
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the underlying UUID
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OperationId({})", self.0)
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for OperationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Identifier of a processor worker (lease owner)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[display("worker-{_0}")]
pub struct WorkerId(pub u32);

/// Identifier of a storage backend
///
/// Backend IDs double as WAL directory names, so they are restricted to
/// lowercase ASCII letters, digits, `-` and `_`.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display)]
#[display("{_0}")]
pub struct BackendId(String);

impl BackendId {
    /// Create a validated backend ID
    pub fn new(id: impl Into<String>) -> Result<Self, BackendIdError> {
        let id = id.into();
        if id.is_empty() {
            return Err(BackendIdError::Empty);
        }
        if id.len() > 64 {
            return Err(BackendIdError::TooLong);
        }
        if let Some(c) = id
            .chars()
            .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-' || *c == '_'))
        {
            return Err(BackendIdError::InvalidChar(c));
        }
        Ok(Self(id))
    }

    /// Create without validation (internal use only)
    #[must_use]
    pub fn new_unchecked(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the backend ID as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BackendId({:?})", self.0)
    }
}

impl FromStr for BackendId {
    type Err = BackendIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Errors that can occur when creating a backend ID
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendIdError {
    #[error("backend id must not be empty")]
    Empty,
    #[error("backend id must be at most 64 characters")]
    TooLong,
    #[error("invalid character in backend id: {0:?}")]
    InvalidChar(char),
}

/// Content identifier (CID or object key)
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display, From)]
#[display("{_0}")]
pub struct ContentKey(String);

impl ContentKey {
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentKey({:?})", self.0)
    }
}

impl From<&str> for ContentKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Opaque handle to an operation's input (never the raw bytes)
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display, From)]
#[display("{_0}")]
pub struct PayloadRef(String);

impl PayloadRef {
    #[must_use]
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Requested action, with a typed payload per variant
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationKind {
    /// Store new content on the target backend
    Add { content: ContentKey, size_bytes: u64 },
    /// Retrieve content through the log (e.g. archival retrieval deals)
    Get { content: ContentKey },
    /// Pin content on the target backend
    Pin { content: ContentKey },
    /// Release a pin on the target backend
    Unpin { content: ContentKey },
    /// Copy content from `source` to the target backend
    Transfer { content: ContentKey, source: BackendId },
    /// Move content from `source` to the target backend
    Migrate {
        content: ContentKey,
        source: BackendId,
        remove_source: bool,
    },
}

impl OperationKind {
    /// Short lowercase name used in logs and metrics
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Add { .. } => "add",
            Self::Get { .. } => "get",
            Self::Pin { .. } => "pin",
            Self::Unpin { .. } => "unpin",
            Self::Transfer { .. } => "transfer",
            Self::Migrate { .. } => "migrate",
        }
    }

    /// Content the operation acts on
    #[must_use]
    pub const fn content(&self) -> &ContentKey {
        match self {
            Self::Add { content, .. }
            | Self::Get { content }
            | Self::Pin { content }
            | Self::Unpin { content }
            | Self::Transfer { content, .. }
            | Self::Migrate { content, .. } => content,
        }
    }

    /// Whether a successful execution leaves a durable copy on the target
    #[must_use]
    pub const fn creates_replica(&self) -> bool {
        matches!(
            self,
            Self::Add { .. } | Self::Pin { .. } | Self::Transfer { .. } | Self::Migrate { .. }
        )
    }
}

/// Operation status
///
/// Legal edges:
///
/// ```text
/// Pending ──> Processing ──> Completed
///                 │  ^
///                 v  │
///              Retrying ──> Failed
///                 ^
/// Processing ─────┴────────> Failed
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Retrying,
}

impl OperationStatus {
    pub const ALL: [Self; 5] = [
        Self::Pending,
        Self::Processing,
        Self::Completed,
        Self::Failed,
        Self::Retrying,
    ];

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Retrying => "retrying",
        }
    }

    /// Completed and Failed never change again
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether `self -> next` is an edge of the state machine
    #[must_use]
    pub const fn can_transition_to(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Processing)
                | (Self::Processing, Self::Completed | Self::Retrying | Self::Failed)
                | (Self::Retrying, Self::Processing | Self::Failed)
        )
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown operation status: {s}"))
    }
}

/// Error classification reported by backends
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorClass {
    /// Network, timeout, rate limit: retried with backoff
    Transient,
    /// Invalid input, missing content: fails immediately
    Permanent,
    /// Ownership lost (lease expired) while processing
    LeaseExpired,
}

impl ErrorClass {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Permanent => "permanent",
            Self::LeaseExpired => "lease_expired",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recorded failure of one attempt
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationError {
    pub class: ErrorClass,
    pub message: String,
    /// Attempt number the error belongs to (1-based)
    pub attempt: u32,
    pub at: DateTime<Utc>,
}

impl OperationError {
    pub fn new(class: ErrorClass, message: impl Into<String>, attempt: u32, at: DateTime<Utc>) -> Self {
        Self {
            class,
            message: message.into(),
            attempt,
            at,
        }
    }
}

/// Worker ownership of a `Processing` operation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub worker: WorkerId,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Durable record of one requested action
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub id: OperationId,
    pub kind: OperationKind,
    pub backend_id: BackendId,
    pub payload_ref: PayloadRef,
    pub status: OperationStatus,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Last recorded error (Failed / Retrying only)
    pub error: Option<OperationError>,
    /// Every error recorded over the operation's life
    pub error_history: Vec<OperationError>,
    pub correlation_id: Uuid,
    /// Present only while Processing
    pub lease: Option<Lease>,
    /// Caller's cutoff for backend calls; no retry is scheduled past it
    pub deadline: Option<DateTime<Utc>>,
}

impl Operation {
    /// Create a new pending operation
    #[must_use]
    pub fn new(
        kind: OperationKind,
        backend_id: BackendId,
        payload_ref: PayloadRef,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: OperationId::new(),
            kind,
            backend_id,
            payload_ref,
            status: OperationStatus::Pending,
            attempt_count: 0,
            max_attempts,
            created_at: now,
            updated_at: now,
            next_retry_at: None,
            error: None,
            error_history: Vec::new(),
            correlation_id: Uuid::new_v4(),
            lease: None,
            deadline: None,
        }
    }

    /// Set an explicit correlation ID (e.g. inherited from a parent request)
    #[must_use]
    pub const fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    #[must_use]
    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Time left until the deadline at `now`, zero once it has passed
    #[must_use]
    pub fn time_to_deadline(&self, now: DateTime<Utc>) -> Option<std::time::Duration> {
        self.deadline
            .map(|deadline| (deadline - now).to_std().unwrap_or(std::time::Duration::ZERO))
    }
}
