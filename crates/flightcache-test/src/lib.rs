//! Helpers for testing the coordinator and its storage backends.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory is held for the
//!    entire lifetime of the test. Disk storages create their directories below it, and the
//!    directory is removed as soon as the handle is dropped.
//!
//!  - Timing based tests should run with `#[tokio::test(start_paused = true)]`, so that the delays
//!    of a [`CountingProducer`] elapse instantly and in a deterministic order.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

pub use tempfile::TempDir;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `flightcache` crate and mutes all
///    other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("flightcache=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped. Use it as a guard to
/// automatically clean up after tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// An instrumented producer.
///
/// Every future created by [`produce`](Self::produce) counts itself once it starts running, and
/// sleeps for the configured delay before it yields its value. Clones share the
/// same counter.
#[derive(Clone, Debug, Default)]
pub struct CountingProducer {
    calls: Arc<AtomicUsize>,
    delay: Duration,
}

impl CountingProducer {
    /// Creates a producer that yields its values immediately.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a producer that yields its values after `delay`.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            calls: Default::default(),
            delay,
        }
    }

    /// Returns a future that yields `value`.
    ///
    /// The call is only counted once the future is first polled.
    pub fn produce<V>(&self, value: V) -> impl Future<Output = V> + Send + 'static
    where
        V: Send + 'static,
    {
        let calls = Arc::clone(&self.calls);
        let delay = self.delay;
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            value
        }
    }

    /// Returns how many produced futures have started running.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}
