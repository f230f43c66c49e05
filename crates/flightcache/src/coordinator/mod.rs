//! # Deduplicating task coordinator
//!
//! The [`Coordinator`] accepts `(key, producer)` submissions from any number of concurrent
//! callers, and makes sure that:
//!
//! - A value that is already in the [`Storage`] is published right away, and the producer is never
//!   polled.
//! - At most one producer runs at a time for any given key. A submission for a key that is
//!   already being computed is discarded, as the running computation will publish the value that
//!   satisfies it.
//! - Every hit and every finished computation is published exactly once to the single
//!   [`CompletionStream`] that was handed out when the coordinator was created.
//!
//! The decision whether a submission is a hit, a duplicate, or a new computation happens in one
//! critical section. The producer itself is awaited outside of it, so a slow producer never
//! blocks submissions for other keys.
//!
//! A coordinator is never reset in place. Flushing all cached values means closing the current
//! coordinator and creating a new one, with a new storage and a new stream, see
//! [`Coordinator::flushed`].

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, MutexGuard};
use sentry::{Hub, SentryFutureExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::key::CacheKey;
use crate::storage::{Backend, CacheValue, Storage};
use crate::utils::futures::CallOnDrop;

mod stream;

pub use stream::CompletionStream;
use stream::Publisher;


/// Options that tune the runtime behavior of a [`Coordinator`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CoordinatorOptions {
    /// The maximum number of producers that are polled at the same time.
    ///
    /// Additional computations wait for a slot after they were accepted, and still count as in
    /// flight while they wait. `None` means no limit.
    pub max_tasks: Option<usize>,
}

/// The outcome of [`Coordinator::submit`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Submission {
    /// A stored value was published, the producer was not polled.
    Hit,
    /// The producer ran, and its value was stored and published.
    Computed,
    /// The key was already being computed, the producer was not polled.
    Discarded,
    /// The coordinator was closed before this submission, the producer was not polled.
    Closed,
}

/// The state that is only ever accessed within the critical section.
struct State<V> {
    in_flight: HashSet<CacheKey>,
    /// `None` once the coordinator was closed, or the consumer went away.
    publisher: Option<Publisher<V>>,
}

impl<V> State<V> {
    fn publish(&mut self, key: CacheKey, value: V) {
        let delivered = match &self.publisher {
            Some(publisher) => publisher.publish(key, value),
            None => return,
        };
        if !delivered {
            tracing::trace!("Completion stream was dropped, discarding further completions");
            self.publisher = None;
        }
    }
}

struct Inner<V, S> {
    storage: S,
    state: Mutex<State<V>>,
    permits: Option<Semaphore>,
    options: CoordinatorOptions,
}

impl<V, S> Inner<V, S> {
    fn lock_state(&self) -> MutexGuard<'_, State<V>> {
        self.state.lock()
    }
}

/// Deduplicates and caches asynchronous computations, see the [module docs](self).
///
/// The coordinator is a cheap handle to shared state, and can be cloned freely. Its storage is
/// dropped together with the last handle. For a [`DiskStorage`](crate::storage::DiskStorage),
/// that removes the cache directory.
pub struct Coordinator<V, S> {
    inner: Arc<Inner<V, S>>,
}

impl<V, S> Clone for Coordinator<V, S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V, S: Storage<V>> fmt::Debug for Coordinator<V, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.lock_state();
        f.debug_struct("Coordinator")
            .field("storage", &self.inner.storage.name())
            .field("in_flight", &state.in_flight.len())
            .field("closed", &state.publisher.is_none())
            .field("options", &self.inner.options)
            .finish()
    }
}

impl<V, S> Coordinator<V, S>
where
    V: CacheValue,
    S: Storage<V>,
{
    /// Creates a new coordinator on top of `storage`.
    ///
    /// The returned [`CompletionStream`] is the only way to observe completions of this
    /// coordinator.
    pub fn new(storage: S, options: CoordinatorOptions) -> (Self, CompletionStream<V>) {
        let (publisher, stream) = stream::channel();
        let inner = Inner {
            storage,
            state: Mutex::new(State {
                in_flight: HashSet::new(),
                publisher: Some(publisher),
            }),
            permits: options.max_tasks.map(Semaphore::new),
            options,
        };
        tracing::debug!(?options, "Created coordinator");

        let coordinator = Self {
            inner: Arc::new(inner),
        };
        (coordinator, stream)
    }

    /// Returns the storage of this coordinator.
    pub fn storage(&self) -> &S {
        &self.inner.storage
    }

    /// Returns the options this coordinator was created with.
    pub fn options(&self) -> CoordinatorOptions {
        self.inner.options
    }

    /// Returns the number of keys that are currently being computed.
    pub fn in_flight(&self) -> usize {
        self.inner.lock_state().in_flight.len()
    }

    /// Returns `true` if the value for `key` is currently being computed.
    pub fn is_in_flight(&self, key: &CacheKey) -> bool {
        self.inner.lock_state().in_flight.contains(key)
    }

    /// Returns `true` if completions are no longer published.
    pub fn is_closed(&self) -> bool {
        self.inner.lock_state().publisher.is_none()
    }

    /// Requests the value for `key`.
    ///
    /// If a value for `key` is stored, it is published and `producer` is dropped without being
    /// polled. If `key` is already being computed, this returns immediately. Otherwise `producer`
    /// is awaited, and its value is stored and published.
    ///
    /// Dropping the returned future while `producer` is pending cancels the computation. Nothing
    /// is stored or published in that case, and `key` can be submitted again.
    pub async fn submit<F>(&self, key: CacheKey, producer: F) -> Submission
    where
        F: Future<Output = V>,
    {
        let storage_name = self.inner.storage.name();
        metric!(counter("coordinator.submit") += 1, "storage" => storage_name);

        let remove_in_flight = {
            let mut state = self.inner.lock_state();
            if state.publisher.is_none() {
                tracing::trace!(%key, "Submission to closed coordinator");
                return Submission::Closed;
            }

            if let Some(value) = self.inner.storage.get(&key) {
                tracing::trace!(%key, "Cache hit");
                metric!(counter("coordinator.hit") += 1, "storage" => storage_name);
                state.publish(key, value);
                return Submission::Hit;
            }

            if !state.in_flight.insert(key.clone()) {
                // The running computation publishes the value this submission asks for.
                tracing::trace!(%key, "Discarding duplicate submission");
                metric!(counter("coordinator.discarded") += 1, "storage" => storage_name);
                return Submission::Discarded;
            }
            metric!(
                gauge("coordinator.in_flight") = state.in_flight.len() as u64,
                "storage" => storage_name,
            );

            let inner = Arc::clone(&self.inner);
            let key = key.clone();
            CallOnDrop::new(move || {
                let mut state = inner.lock_state();
                state.in_flight.remove(&key);
                metric!(
                    gauge("coordinator.in_flight") = state.in_flight.len() as u64,
                    "storage" => storage_name,
                );
            })
        };

        let permit = match &self.inner.permits {
            Some(permits) => permits.acquire().await.ok(),
            None => None,
        };

        tracing::trace!(%key, "Computing");
        let start = Instant::now();
        let value = producer
            .bind_hub(Hub::new_from_top(Hub::current()))
            .await;
        metric!(
            timer("coordinator.computation.duration") = start.elapsed(),
            "storage" => storage_name,
        );
        metric!(counter("coordinator.computation") += 1, "storage" => storage_name);
        drop(permit);

        {
            let mut state = self.inner.lock_state();
            self.inner.storage.put(key.clone(), value.clone());
            state.publish(key, value);
        }
        // Evict from the in-flight set only after the value is stored, so that subsequent
        // submissions are guaranteed to hit.
        drop(remove_in_flight);

        Submission::Computed
    }

    /// Spawns [`submit`](Self::submit) as a new task on the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a tokio runtime.
    pub fn spawn<F>(&self, key: CacheKey, producer: F) -> JoinHandle<Submission>
    where
        F: Future<Output = V> + Send + 'static,
    {
        let coordinator = self.clone();
        tokio::spawn(async move { coordinator.submit(key, producer).await })
    }

    /// Stops publishing completions.
    ///
    /// The [`CompletionStream`] yields the completions that were published up to this point, and
    /// then ends. Computations that are still running finish and store their values, but do not
    /// publish them. Subsequent submissions are rejected with [`Submission::Closed`]. The storage
    /// stays readable, it is only dropped together with the last handle.
    pub fn close(&self) {
        if self.inner.lock_state().publisher.take().is_some() {
            tracing::debug!("Closed coordinator");
        }
    }

    /// Closes this coordinator, and creates a new one on top of `storage`.
    ///
    /// The new coordinator has the same options, and its own [`CompletionStream`].
    pub fn flushed_with<T>(&self, storage: T) -> (Coordinator<V, T>, CompletionStream<V>)
    where
        T: Storage<V>,
    {
        self.close();
        Coordinator::new(storage, self.inner.options)
    }
}

impl<V> Coordinator<V, Backend<V>>
where
    V: CacheValue + Serialize + DeserializeOwned,
{
    /// Creates a coordinator with the storage backend and options from `config`.
    pub fn from_config(config: &Config) -> (Self, CompletionStream<V>) {
        let storage = Backend::from_config(&config.cache);
        let options = CoordinatorOptions {
            max_tasks: config.cache.max_tasks,
        };
        Self::new(storage, options)
    }

    /// Closes this coordinator, and creates a new one with a new and empty storage.
    ///
    /// None of the values stored so far are visible to the new coordinator. The storage of this
    /// coordinator is dropped together with its last handle.
    pub fn flushed(&self) -> (Self, CompletionStream<V>) {
        tracing::debug!("Flushing coordinator");
        self.flushed_with(self.inner.storage.fresh())
    }
}
