//! Best-effort play counters stored on the song records themselves.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::{Map, Value, json};

use crate::store::{DocumentStore, child_path};

pub const PLAY_COUNT_FIELD: &str = "played_count";

#[derive(Clone)]
pub struct PlayCounter {
    store: Arc<dyn DocumentStore>,
    songs_path: String,
}

impl PlayCounter {
    pub fn new(store: Arc<dyn DocumentStore>, songs_path: impl Into<String>) -> Self {
        Self {
            store,
            songs_path: songs_path.into(),
        }
    }

    /// Increments the counter of an existing song. Unknown ids are left
    /// alone; no record is ever created here. Returns the new count.
    pub async fn increment(&self, media_id: &str) -> Result<Option<u64>> {
        let path = child_path(&self.songs_path, media_id);
        let Some(song) = self
            .store
            .get(&path)
            .await
            .with_context(|| format!("reading {path}"))?
        else {
            tracing::info!(media = media_id, "song not found; play count unchanged");
            return Ok(None);
        };

        let current = song
            .get(PLAY_COUNT_FIELD)
            .and_then(Value::as_u64)
            .unwrap_or(0);
        let next = current + 1;
        let mut fields = Map::new();
        fields.insert(PLAY_COUNT_FIELD.to_string(), json!(next));
        self.store
            .update(&path, fields)
            .await
            .with_context(|| format!("updating {path}"))?;
        Ok(Some(next))
    }

    /// Runs [`Self::increment`] on a background task; failures are only
    /// logged.
    pub fn spawn_increment(&self, media_id: &str) -> tokio::task::JoinHandle<()> {
        let counter = self.clone();
        let media_id = media_id.to_string();
        tokio::spawn(async move {
            match counter.increment(&media_id).await {
                Ok(Some(count)) => tracing::debug!(media = %media_id, count, "play counted"),
                Ok(None) => {}
                Err(err) => {
                    tracing::error!(media = %media_id, "failed to update play count: {err:#}")
                }
            }
        })
    }
}
