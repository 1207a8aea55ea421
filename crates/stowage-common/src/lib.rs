//! Stowage Common - Shared types and utilities
//!
//! This crate provides the operation data model, error definitions,
//! configuration, the clock abstraction and the backend capability trait
//! used across all Stowage components.

pub mod backend;
pub mod clock;
pub mod config;
pub mod error;
pub mod types;

pub use backend::{BackendAdapter, BackendError, BackendOutcome, BackendRegistry, HealthSignal};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::Config;
pub use error::{Error, Result};
pub use types::*;
