//! Stowage Health - backend availability tracking
//!
//! Periodic probes and a per-backend circuit breaker. The WAL processor
//! consults [`HealthMonitor::is_available`] before claiming work and
//! reports every backend call outcome back.

pub mod monitor;

pub use monitor::{BackendHealthRecord, CircuitState, HealthMonitor, ProbeDecision};
