//! Startup snapshot of the songs and movies collections.
//!
//! Each collection is fetched once; afterwards the cache is read-only and is
//! never refreshed, so later changes in the store are not visible until the
//! process restarts.

use std::sync::{Arc, OnceLock};

use serde_json::Value;

use crate::store::DocumentStore;

/// A cached collection exactly as the store returned it: an object keyed by
/// record id, or an array when the ids are the indices `0..n`.
pub type CatalogData = Value;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Collection {
    Songs,
    Movies,
}

impl Collection {
    pub fn label(self) -> &'static str {
        match self {
            Self::Songs => "songs",
            Self::Movies => "movies",
        }
    }
}

pub struct CatalogCache {
    songs_path: String,
    movies_path: String,
    songs: OnceLock<Arc<CatalogData>>,
    movies: OnceLock<Arc<CatalogData>>,
}

impl CatalogCache {
    pub fn new(songs_path: impl Into<String>, movies_path: impl Into<String>) -> Self {
        Self {
            songs_path: songs_path.into(),
            movies_path: movies_path.into(),
            songs: OnceLock::new(),
            movies: OnceLock::new(),
        }
    }

    /// Fetches both collections concurrently. Failures and empty collections
    /// are logged and leave that collection unavailable.
    pub async fn populate(&self, store: &dyn DocumentStore) {
        let (songs, movies) = tokio::join!(
            store.get(&self.songs_path),
            store.get(&self.movies_path)
        );
        self.install(Collection::Songs, songs);
        self.install(Collection::Movies, movies);
    }

    fn install(&self, collection: Collection, fetched: anyhow::Result<Option<Value>>) {
        let (slot, path) = match collection {
            Collection::Songs => (&self.songs, &self.songs_path),
            Collection::Movies => (&self.movies, &self.movies_path),
        };

        match fetched {
            Ok(Some(data)) => match entry_count(&data) {
                Some(0) => {
                    tracing::warn!(
                        collection = collection.label(),
                        path = %path,
                        "no catalog data found"
                    );
                }
                Some(count) => {
                    if slot.set(Arc::new(data)).is_err() {
                        tracing::warn!(collection = collection.label(), "catalog already populated");
                        return;
                    }
                    tracing::info!(collection = collection.label(), count, "preloaded catalog");
                }
                None => {
                    tracing::warn!(
                        collection = collection.label(),
                        path = %path,
                        "catalog collection is not a mapping or list; ignoring"
                    );
                }
            },
            Ok(None) => {
                tracing::warn!(
                    collection = collection.label(),
                    path = %path,
                    "no catalog data found"
                );
            }
            Err(err) => {
                tracing::error!(
                    collection = collection.label(),
                    path = %path,
                    "failed to preload catalog: {err:#}"
                );
            }
        }
    }

    pub fn get(&self, collection: Collection) -> Option<Arc<CatalogData>> {
        match collection {
            Collection::Songs => self.songs(),
            Collection::Movies => self.movies(),
        }
    }

    pub fn songs(&self) -> Option<Arc<CatalogData>> {
        self.songs.get().cloned()
    }

    pub fn movies(&self) -> Option<Arc<CatalogData>> {
        self.movies.get().cloned()
    }
}

/// Number of records in a collection; `None` for scalars.
fn entry_count(data: &Value) -> Option<usize> {
    match data {
        Value::Object(map) => Some(map.len()),
        Value::Array(items) => Some(items.iter().filter(|item| !item.is_null()).count()),
        _ => None,
    }
}
