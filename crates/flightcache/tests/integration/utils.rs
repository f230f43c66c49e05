use std::path::PathBuf;

use flightcache::config::CacheConfig;
use flightcache::storage::Backend;
use flightcache::{BackendKind, CacheValue, CompletionStream, Config, Coordinator};
use flightcache_test as test;
use serde::{Deserialize, Serialize};

pub use test::{CountingProducer, TempDir};

/// A cached recipe detail, or the placeholder for a failed fetch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Recipe {
    Loaded {
        name: String,
        ingredients: Vec<String>,
    },
    Unavailable,
}

impl CacheValue for Recipe {
    fn weight(&self) -> u32 {
        match self {
            Recipe::Loaded { ingredients, .. } => 1 + ingredients.len() as u32,
            Recipe::Unavailable => 1,
        }
    }
}

pub fn recipe(name: &str) -> Recipe {
    Recipe::Loaded {
        name: name.into(),
        ingredients: vec![format!("{name} sauce"), "rice".into()],
    }
}

pub type RecipeCoordinator = Coordinator<Recipe, Backend<Recipe>>;

/// Setup tests and create a coordinator with the given backend.
///
/// This function returns the coordinator, its stream, and a temporary cache directory. The
/// directory is cleaned up when the [`TempDir`] instance is dropped. Keep it as guard until the
/// test has finished.
pub fn setup_coordinator(
    backend: BackendKind,
) -> (RecipeCoordinator, CompletionStream<Recipe>, TempDir) {
    test::setup();

    let cache_dir = test::tempdir();
    let config = Config {
        cache: CacheConfig {
            backend,
            cache_dir: Some(cache_dir.path().to_owned()),
            ..Default::default()
        },
        ..Default::default()
    };
    let (coordinator, stream) = RecipeCoordinator::from_config(&config);

    (coordinator, stream, cache_dir)
}

/// Returns the directory of a disk backend.
#[track_caller]
pub fn disk_path(coordinator: &RecipeCoordinator) -> PathBuf {
    match coordinator.storage() {
        Backend::Disk(disk, _) => disk.path().to_owned(),
        Backend::Memory(_) => panic!("expected a disk backend"),
    }
}
