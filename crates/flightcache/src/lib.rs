//! A deduplicating cache for asynchronous computations.
//!
//! Values are requested from a [`Coordinator`] by submitting a [`CacheKey`] together with a
//! producer future. Stored values are returned without running the producer, concurrent requests
//! for the same key run the producer only once, and every result is delivered to the single
//! [`CompletionStream`] of the coordinator.
//!
//! Values are stored either in memory or on disk, see the [`storage`] module.

#[macro_use]
pub mod metrics;

pub mod config;
pub mod coordinator;
pub mod key;
pub mod logging;
pub mod storage;
pub mod utils;

pub use config::Config;
pub use coordinator::{CompletionStream, Coordinator, CoordinatorOptions, Submission};
pub use key::CacheKey;
pub use storage::{Backend, BackendKind, CacheValue, DiskStorage, MemoryStorage, Storage};
