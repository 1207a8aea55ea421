//! Stowage Engine - WAL processing and submission
//!
//! The [`Processor`] drains the WAL: workers claim operations, call the
//! owning backend and record completion, retry or failure. The [`Engine`]
//! owns every component and is what callers submit work to.

pub mod backoff;
pub mod engine;
pub mod processor;
pub mod scheduler;

#[cfg(test)]
mod testing;

pub use backoff::Backoff;
pub use engine::Engine;
pub use processor::{Processor, ProcessorHandle};
pub use scheduler::{Scheduler, Ticket};
