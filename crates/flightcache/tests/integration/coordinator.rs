use std::collections::HashMap;
use std::time::Duration;

use flightcache::{BackendKind, CacheKey, Storage, Submission};
use futures::future::join_all;

use crate::{CountingProducer, Recipe, recipe, setup_coordinator};

const BACKENDS: [BackendKind; 2] = [BackendKind::Memory, BackendKind::Disk];

#[tokio::test(start_paused = true)]
async fn test_completions_arrive_in_completion_order() {
    for backend in BACKENDS {
        let (coordinator, mut stream, _cache_dir) = setup_coordinator(backend);

        let producers: Vec<_> = [("A", 300), ("B", 100), ("C", 200)]
            .into_iter()
            .map(|(name, delay)| {
                let producer = CountingProducer::with_delay(Duration::from_millis(delay));
                let handle = coordinator.spawn(CacheKey::new(name), producer.produce(recipe(name)));
                (producer, handle)
            })
            .collect();

        let mut order = Vec::new();
        while order.len() < 3 {
            let (key, value) = stream.next_completion().await.unwrap();
            assert_eq!(value, recipe(key.identifier()));
            order.push(key.identifier().to_owned());
        }
        assert_eq!(order, ["B", "C", "A"], "backend: {backend:?}");

        for (producer, handle) in producers {
            assert_eq!(handle.await.unwrap(), Submission::Computed);
            assert_eq!(producer.calls(), 1);
        }
        for name in ["A", "B", "C"] {
            let stored = coordinator.storage().get(&CacheKey::new(name));
            assert_eq!(stored, Some(recipe(name)), "backend: {backend:?}");
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_back_to_back_duplicates() {
    for backend in BACKENDS {
        let (coordinator, mut stream, _cache_dir) = setup_coordinator(backend);
        let producer = CountingProducer::with_delay(Duration::from_millis(100));
        let key = CacheKey::new("52772");

        let first = coordinator.spawn(key.clone(), producer.produce(recipe("teriyaki")));
        let second = coordinator.spawn(key.clone(), producer.produce(recipe("katsu")));

        assert_eq!(first.await.unwrap(), Submission::Computed);
        assert_eq!(second.await.unwrap(), Submission::Discarded);
        assert_eq!(producer.calls(), 1);

        assert_eq!(
            stream.try_next_completion(),
            Some((key.clone(), recipe("teriyaki")))
        );
        assert_eq!(stream.try_next_completion(), None);

        // once stored, the same key is a hit
        let result = coordinator
            .submit(key.clone(), producer.produce(recipe("katsu")))
            .await;
        assert_eq!(result, Submission::Hit);
        assert_eq!(producer.calls(), 1);
        assert_eq!(stream.try_next_completion(), Some((key, recipe("teriyaki"))));
    }
}

#[tokio::test]
async fn test_placeholders_are_cached() {
    for backend in BACKENDS {
        let (coordinator, mut stream, _cache_dir) = setup_coordinator(backend);
        let producer = CountingProducer::new();
        let key = CacheKey::new("404");

        coordinator
            .submit(key.clone(), producer.produce(Recipe::Unavailable))
            .await;
        let result = coordinator
            .submit(key.clone(), producer.produce(recipe("retry")))
            .await;

        assert_eq!(result, Submission::Hit);
        assert_eq!(producer.calls(), 1);
        assert_eq!(stream.try_next_completion(), Some((key.clone(), Recipe::Unavailable)));
        assert_eq!(stream.try_next_completion(), Some((key, Recipe::Unavailable)));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_submissions() {
    for backend in BACKENDS {
        let (coordinator, mut stream, _cache_dir) = setup_coordinator(backend);

        let producers: HashMap<_, _> = (0..10)
            .map(|i| {
                let producer = CountingProducer::with_delay(Duration::from_millis(20));
                (format!("recipe-{i}"), producer)
            })
            .collect();

        let handles = (0..5).flat_map(|_| {
            producers.iter().map(|(name, producer)| {
                coordinator.spawn(CacheKey::new(name.as_str()), producer.produce(recipe(name)))
            })
        });
        let results: Vec<_> = join_all(handles.collect::<Vec<_>>())
            .await
            .into_iter()
            .map(Result::unwrap)
            .collect();

        for producer in producers.values() {
            assert_eq!(producer.calls(), 1, "backend: {backend:?}");
        }
        let computed = results.iter().filter(|r| **r == Submission::Computed).count();
        let hits = results.iter().filter(|r| **r == Submission::Hit).count();
        assert_eq!(computed, 10);
        assert_eq!(coordinator.in_flight(), 0);

        // every computation and every hit is published exactly once
        assert_eq!(stream.pending(), computed + hits);
        let mut published = HashMap::<String, usize>::new();
        while let Some((key, value)) = stream.try_next_completion() {
            assert_eq!(value, recipe(key.identifier()));
            *published.entry(key.identifier().to_owned()).or_default() += 1;
        }
        assert_eq!(published.len(), 10);
    }
}

#[tokio::test]
async fn test_flush_isolates_epochs() {
    for backend in BACKENDS {
        let (coordinator, mut stream, _cache_dir) = setup_coordinator(backend);
        let producer = CountingProducer::new();
        let key = CacheKey::new("52772");

        coordinator
            .submit(key.clone(), producer.produce(recipe("before")))
            .await;

        let (flushed, mut flushed_stream) = coordinator.flushed();
        assert_eq!(flushed.storage().kind(), backend);
        assert_eq!(flushed.storage().get(&key), None);

        let result = flushed
            .submit(key.clone(), producer.produce(recipe("after")))
            .await;
        assert_eq!(result, Submission::Computed);
        assert_eq!(producer.calls(), 2);

        // the old stream drains and ends, the new one only sees the new epoch
        assert_eq!(
            stream.next_completion().await,
            Some((key.clone(), recipe("before")))
        );
        assert_eq!(stream.next_completion().await, None);
        assert_eq!(flushed_stream.try_next_completion(), Some((key, recipe("after"))));
    }
}
