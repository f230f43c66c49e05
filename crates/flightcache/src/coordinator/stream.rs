use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;

use crate::key::CacheKey;

/// Creates a connected pair of publisher and stream.
pub(super) fn channel<V>() -> (Publisher<V>, CompletionStream<V>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (Publisher { sender }, CompletionStream { receiver })
}

/// The producing end of a [`CompletionStream`], owned by the coordinator.
pub(super) struct Publisher<V> {
    sender: mpsc::UnboundedSender<(CacheKey, V)>,
}

impl<V> Publisher<V> {
    /// Pushes a completion to the consumer without blocking.
    ///
    /// Returns `false` when the consumer is gone.
    pub(super) fn publish(&self, key: CacheKey, value: V) -> bool {
        self.sender.send((key, value)).is_ok()
    }
}

/// The ordered sequence of completions of a [`Coordinator`](super::Coordinator).
///
/// Items are yielded in the order the coordinator published them, which is the order in which
/// computations finished rather than the order of submission. Completions are buffered until they
/// are read. The stream ends once the coordinator was closed or dropped, and all buffered
/// completions have been read.
#[derive(Debug)]
pub struct CompletionStream<V> {
    receiver: mpsc::UnboundedReceiver<(CacheKey, V)>,
}

impl<V> CompletionStream<V> {
    /// Waits for the next completion.
    ///
    /// Returns `None` once the stream has ended.
    pub async fn next_completion(&mut self) -> Option<(CacheKey, V)> {
        self.receiver.recv().await
    }

    /// Returns the next buffered completion, if there is one.
    pub fn try_next_completion(&mut self) -> Option<(CacheKey, V)> {
        self.receiver.try_recv().ok()
    }

    /// Returns the number of completions that are buffered and not yet read.
    pub fn pending(&self) -> usize {
        self.receiver.len()
    }
}

impl<V> Stream for CompletionStream<V> {
    type Item = (CacheKey, V);

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}
