//! Per-user download history with a fixed retention cap.
//!
//! History lives at `downloads/{user}/audios`. After every append the oldest
//! records beyond the cap are evicted together with their files.

use std::{
    collections::HashSet,
    io::ErrorKind,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicI64, Ordering},
    },
};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::store::{DocumentStore, child_path};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DownloadRecord {
    #[serde(rename = "audioId", default)]
    pub media_id: String,
    #[serde(rename = "fileName", default)]
    pub file_name: String,
    /// Milliseconds since the Unix epoch.
    #[serde(default)]
    pub timestamp: i64,
}

pub struct RetentionManager {
    store: Arc<dyn DocumentStore>,
    downloads_root: PathBuf,
    cap: usize,
    last_timestamp: AtomicI64,
}

impl RetentionManager {
    pub fn new(store: Arc<dyn DocumentStore>, downloads_root: PathBuf, cap: usize) -> Self {
        Self {
            store,
            downloads_root,
            cap,
            last_timestamp: AtomicI64::new(0),
        }
    }

    pub fn history_path(user_id: &str) -> String {
        format!("downloads/{user_id}/audios")
    }

    /// Wall clock in milliseconds, never lower than a value handed out before.
    fn next_timestamp(&self) -> i64 {
        let now = Utc::now().timestamp_millis();
        let previous = self.last_timestamp.fetch_max(now, Ordering::SeqCst);
        previous.max(now)
    }

    /// Appends a record for the download, then trims the user's history to
    /// the cap. Returns the evicted records.
    pub async fn record_download(
        &self,
        user_id: &str,
        media_id: &str,
        file_name: &str,
    ) -> Result<Vec<DownloadRecord>> {
        let record = DownloadRecord {
            media_id: media_id.to_string(),
            file_name: file_name.to_string(),
            timestamp: self.next_timestamp(),
        };
        let path = Self::history_path(user_id);
        let value = serde_json::to_value(&record).context("encoding download record")?;
        self.store
            .push(&path, value)
            .await
            .with_context(|| format!("saving download record for {user_id}"))?;

        self.enforce_cap(user_id).await
    }

    /// History sorted oldest first. Equal timestamps keep insertion order
    /// because push keys sort chronologically.
    pub async fn history(&self, user_id: &str) -> Result<Vec<(String, DownloadRecord)>> {
        let path = Self::history_path(user_id);
        let Some(raw) = self
            .store
            .get(&path)
            .await
            .with_context(|| format!("loading download history for {user_id}"))?
        else {
            return Ok(Vec::new());
        };
        let Some(entries) = raw.as_object() else {
            tracing::warn!(user = user_id, "download history is not a mapping");
            return Ok(Vec::new());
        };

        let mut records: Vec<(String, DownloadRecord)> = entries
            .iter()
            .filter_map(|(key, value)| {
                match serde_json::from_value::<DownloadRecord>(value.clone()) {
                    Ok(record) => Some((key.clone(), record)),
                    Err(err) => {
                        tracing::warn!(user = user_id, key = %key, "skipping malformed download record: {err}");
                        None
                    }
                }
            })
            .collect();
        records.sort_by(|(key_a, a), (key_b, b)| {
            a.timestamp.cmp(&b.timestamp).then_with(|| key_a.cmp(key_b))
        });
        Ok(records)
    }

    async fn enforce_cap(&self, user_id: &str) -> Result<Vec<DownloadRecord>> {
        let records = self.history(user_id).await?;
        if records.len() <= self.cap {
            return Ok(Vec::new());
        }

        let excess = records.len() - self.cap;
        // A re-downloaded media has several records sharing one file; the
        // file stays while any kept record still points at it.
        let retained: HashSet<String> = records[excess..]
            .iter()
            .map(|(_, record)| record.file_name.clone())
            .collect();
        let history_path = Self::history_path(user_id);
        let mut evicted = Vec::with_capacity(excess);
        for (key, record) in records.into_iter().take(excess) {
            if !retained.contains(&record.file_name) {
                self.delete_file(user_id, &record.file_name).await;
            }
            self.store
                .remove(&child_path(&history_path, &key))
                .await
                .with_context(|| format!("removing download record {key} for {user_id}"))?;
            evicted.push(record);
        }
        Ok(evicted)
    }

    /// Missing files are fine; other failures are logged and skipped.
    async fn delete_file(&self, user_id: &str, file_name: &str) {
        if !crate::is_safe_segment(file_name) {
            tracing::warn!(user = user_id, file = file_name, "not deleting unsafe file name");
            return;
        }
        let path = self.downloads_root.join(user_id).join(file_name);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => tracing::info!(path = %path.display(), "deleted old download"),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => {
                tracing::warn!(path = %path.display(), "failed to delete old download: {err}")
            }
        }
    }
}
