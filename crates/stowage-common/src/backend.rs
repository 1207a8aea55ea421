//! Backend capability interface
//!
//! Each concrete storage backend (content-addressed store, object store,
//! archival network, cluster store) implements [`BackendAdapter`]. Adapters
//! are registered once at startup in a [`BackendRegistry`] and looked up by
//! [`BackendId`] afterwards.

use crate::error::{Error, Result};
use crate::types::{BackendId, ContentKey, ErrorClass, Operation};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Result of a successful backend call
#[derive(Debug, Clone, Default)]
pub struct BackendOutcome {
    /// Cacheable output produced by the call
    pub content: Option<(ContentKey, Bytes)>,
    /// The backend now durably holds the operation's content
    pub stored: bool,
}

impl BackendOutcome {
    /// Outcome with nothing to cache
    #[must_use]
    pub fn done() -> Self {
        Self::default()
    }

    /// Outcome that recorded a durable copy
    #[must_use]
    pub fn stored() -> Self {
        Self {
            content: None,
            stored: true,
        }
    }

    #[must_use]
    pub fn with_content(mut self, key: ContentKey, data: Bytes) -> Self {
        self.content = Some((key, data));
        self
    }
}

/// Failed backend call
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{class} backend error: {message}")]
pub struct BackendError {
    pub class: ErrorClass,
    pub message: String,
}

impl BackendError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Permanent,
            message: message.into(),
        }
    }

    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self.class, ErrorClass::Transient)
    }
}

impl From<BackendError> for Error {
    fn from(err: BackendError) -> Self {
        match err.class {
            ErrorClass::Permanent => Self::BackendPermanent(err.message),
            ErrorClass::Transient | ErrorClass::LeaseExpired => Self::BackendTransient(err.message),
        }
    }
}

/// Outcome of a health probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthSignal {
    Healthy { latency: Duration },
    Unhealthy { reason: String },
}

impl HealthSignal {
    #[must_use]
    pub const fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy { .. })
    }
}

/// Capability every storage backend exposes to the WAL processor
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    /// Backend this adapter talks to
    fn id(&self) -> &BackendId;

    /// Execute a logged operation
    async fn execute(&self, op: &Operation) -> std::result::Result<BackendOutcome, BackendError>;

    /// Cheap liveness check
    async fn probe(&self) -> HealthSignal;

    /// Read content directly (read path, not logged)
    async fn fetch(&self, key: &ContentKey) -> std::result::Result<Option<Bytes>, BackendError>;
}

/// Registry of backend adapters, resolved once at startup
#[derive(Clone, Default)]
pub struct BackendRegistry {
    adapters: BTreeMap<BackendId, Arc<dyn BackendAdapter>>,
}

impl BackendRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter; a backend may only be registered once
    pub fn register(&mut self, adapter: Arc<dyn BackendAdapter>) -> Result<()> {
        let id = adapter.id().clone();
        if self.adapters.contains_key(&id) {
            return Err(Error::Configuration(format!(
                "backend {id} registered twice"
            )));
        }
        self.adapters.insert(id, adapter);
        Ok(())
    }

    /// Builder-style registration
    pub fn with(mut self, adapter: Arc<dyn BackendAdapter>) -> Result<Self> {
        self.register(adapter)?;
        Ok(self)
    }

    pub fn get(&self, id: &BackendId) -> Result<Arc<dyn BackendAdapter>> {
        self.adapters
            .get(id)
            .cloned()
            .ok_or_else(|| Error::UnknownBackend(id.clone()))
    }

    #[must_use]
    pub fn contains(&self, id: &BackendId) -> bool {
        self.adapters.contains_key(id)
    }

    /// Registered backend IDs in sorted order
    pub fn ids(&self) -> impl Iterator<Item = &BackendId> {
        self.adapters.keys()
    }

    pub fn adapters(&self) -> impl Iterator<Item = &Arc<dyn BackendAdapter>> {
        self.adapters.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("backends", &self.adapters.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullBackend(BackendId);

    #[async_trait]
    impl BackendAdapter for NullBackend {
        fn id(&self) -> &BackendId {
            &self.0
        }

        async fn execute(&self, _op: &Operation) -> std::result::Result<BackendOutcome, BackendError> {
            Ok(BackendOutcome::done())
        }

        async fn probe(&self) -> HealthSignal {
            HealthSignal::Healthy {
                latency: Duration::ZERO,
            }
        }

        async fn fetch(&self, _key: &ContentKey) -> std::result::Result<Option<Bytes>, BackendError> {
            Ok(None)
        }
    }

    #[test]
    fn test_registry_lookup() {
        let ipfs = BackendId::new("ipfs").unwrap();
        let registry = BackendRegistry::new()
            .with(Arc::new(NullBackend(ipfs.clone())))
            .unwrap();

        assert!(registry.get(&ipfs).is_ok());
        assert!(matches!(
            registry.get(&BackendId::new("s3").unwrap()),
            Err(Error::UnknownBackend(_))
        ));
    }

    #[tokio::test]
    async fn test_registry_dispatches_to_adapter() {
        let ipfs = BackendId::new("ipfs").unwrap();
        let registry = BackendRegistry::new()
            .with(Arc::new(NullBackend(ipfs.clone())))
            .unwrap();

        let adapter = registry.get(&ipfs).unwrap();
        assert_eq!(adapter.id(), &ipfs);
        assert!(matches!(adapter.probe().await, HealthSignal::Healthy { .. }));
        assert!(adapter.fetch(&ContentKey::new("bafy")).await.unwrap().is_none());
    }

    #[test]
    fn test_registry_rejects_duplicates() {
        let ipfs = BackendId::new("ipfs").unwrap();
        let mut registry = BackendRegistry::new();
        registry.register(Arc::new(NullBackend(ipfs.clone()))).unwrap();
        assert!(registry.register(Arc::new(NullBackend(ipfs))).is_err());
    }

    #[test]
    fn test_backend_error_conversion() {
        let err: Error = BackendError::permanent("no such cid").into();
        assert!(matches!(err, Error::BackendPermanent(_)));
        let err: Error = BackendError::transient("429").into();
        assert!(err.is_retryable());
    }
}
