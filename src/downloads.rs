//! Handles `/download` requests end to end: bookkeeping, extraction, history.

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::Arc,
};

use anyhow::Context;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::{
    extractor::{ExtractionError, MediaExtractor, OUTPUT_EXTENSION},
    is_safe_segment,
    plays::PlayCounter,
    retention::RetentionManager,
    tracker::ActiveFetches,
};

/// URL prefix under which the download root is served.
pub const AUDIO_ROUTE_PREFIX: &str = "/audio";

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("Missing video ID or user ID")]
    MissingParameters,
    #[error("Invalid video ID or user ID")]
    InvalidParameters,
    #[error("Download failed")]
    Extraction(#[from] ExtractionError),
    #[error("Internal server error")]
    Internal(#[from] anyhow::Error),
}

impl DownloadError {
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::MissingParameters | Self::InvalidParameters)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadOutcome {
    /// Public URL of the file, e.g. `/audio/alice/abc.webm`.
    pub file_url: String,
    pub path: PathBuf,
    /// The file was already on disk and no extraction ran.
    pub cached: bool,
}

pub struct Downloader {
    downloads_root: PathBuf,
    extractor: Arc<dyn MediaExtractor>,
    retention: RetentionManager,
    plays: PlayCounter,
    active: Arc<ActiveFetches>,
    in_flight: PairLocks,
}

impl Downloader {
    pub fn new(
        downloads_root: PathBuf,
        extractor: Arc<dyn MediaExtractor>,
        retention: RetentionManager,
        plays: PlayCounter,
        active: Arc<ActiveFetches>,
    ) -> Self {
        Self {
            downloads_root,
            extractor,
            retention,
            plays,
            active,
            in_flight: PairLocks::default(),
        }
    }

    pub fn active(&self) -> &ActiveFetches {
        &self.active
    }

    pub fn file_name(media_id: &str) -> String {
        format!("{media_id}.{OUTPUT_EXTENSION}")
    }

    pub fn public_url(user_id: &str, file_name: &str) -> String {
        format!("{AUDIO_ROUTE_PREFIX}/{user_id}/{file_name}")
    }

    /// Downloads `media_id` for `user_id`, or reuses the file when it is
    /// already on disk. Blank identifiers are rejected before anything else
    /// happens.
    pub async fn download(
        &self,
        media_id: &str,
        user_id: &str,
    ) -> Result<DownloadOutcome, DownloadError> {
        let media_id = media_id.trim();
        let user_id = user_id.trim();
        if media_id.is_empty() || user_id.is_empty() {
            return Err(DownloadError::MissingParameters);
        }
        if !is_safe_segment(media_id) || !is_safe_segment(user_id) {
            return Err(DownloadError::InvalidParameters);
        }

        let tracked = ActiveGuard::track(&self.active, user_id, media_id);
        self.plays.spawn_increment(media_id);

        let result = self.fetch(user_id, media_id).await;
        drop(tracked);

        match &result {
            Ok(outcome) => tracing::info!(
                user = user_id,
                media = media_id,
                cached = outcome.cached,
                "download ready"
            ),
            Err(err) => tracing::error!(
                user = user_id,
                media = media_id,
                "download failed: {}",
                error_detail(err)
            ),
        }
        result
    }

    async fn fetch(&self, user_id: &str, media_id: &str) -> Result<DownloadOutcome, DownloadError> {
        let user_dir = self.downloads_root.join(user_id);
        tokio::fs::create_dir_all(&user_dir)
            .await
            .with_context(|| format!("creating {}", user_dir.display()))?;

        let file_name = Self::file_name(media_id);
        let target = user_dir.join(&file_name);
        let file_url = Self::public_url(user_id, &file_name);
        let template = user_dir.join(format!("{media_id}.%(ext)s"));

        // Serializes concurrent requests for the same pair, so the second one
        // sees the first one's file instead of running yt-dlp again.
        let _pair = self.in_flight.acquire(format!("{user_id}/{media_id}")).await;

        let cached = tokio::fs::try_exists(&target)
            .await
            .with_context(|| format!("checking {}", target.display()))?;
        let path = if cached {
            target
        } else {
            self.extractor.extract(media_id, &template).await?
        };

        self.retention
            .record_download(user_id, media_id, &file_name)
            .await?;

        Ok(DownloadOutcome {
            file_url,
            path,
            cached,
        })
    }
}

fn error_detail(err: &DownloadError) -> String {
    match err {
        DownloadError::Extraction(inner) => inner.to_string(),
        DownloadError::Internal(inner) => format!("{inner:#}"),
        other => other.to_string(),
    }
}

/// Keeps a user's entry in the active-fetch table for as long as the request
/// is alive, including when the request future is dropped mid-download.
struct ActiveGuard<'a> {
    active: &'a ActiveFetches,
    user_id: &'a str,
}

impl<'a> ActiveGuard<'a> {
    fn track(active: &'a ActiveFetches, user_id: &'a str, media_id: &str) -> Self {
        active.set(user_id, media_id);
        active.log_snapshot();
        Self { active, user_id }
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.active.remove(self.user_id);
        self.active.log_snapshot();
    }
}

/// One async mutex per `{user}/{media}` key, dropped once nobody holds or
/// waits on it.
#[derive(Default)]
struct PairLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

struct PairGuard<'a> {
    owner: &'a PairLocks,
    key: String,
    lock: Arc<AsyncMutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl PairLocks {
    async fn acquire(&self, key: String) -> PairGuard<'_> {
        let lock = self.locks.lock().entry(key.clone()).or_default().clone();
        let guard = lock.clone().lock_owned().await;
        PairGuard {
            owner: self,
            key,
            lock,
            guard: Some(guard),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().len()
    }
}

impl Drop for PairGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = self.owner.locks.lock();
        // Only the map and this guard still reference the mutex.
        if Arc::strong_count(&self.lock) == 2 {
            locks.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{DocumentStore, MemoryStore};
    use crate::testing::{CountingStore, FailingStore, FakeExtractor};
    use serde_json::{Value, json};
    use std::time::Duration;

    struct DownloadContext {
        temp: tempfile::TempDir,
        store: Arc<dyn DocumentStore>,
        extractor: Arc<FakeExtractor>,
        downloader: Arc<Downloader>,
    }

    impl DownloadContext {
        fn new(extractor: Arc<FakeExtractor>) -> Self {
            let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::with_root(
                json!({"songs": {"abc": {"title": "A"}}}),
            ));
            Self::with_store(extractor, store)
        }

        fn with_store(extractor: Arc<FakeExtractor>, store: Arc<dyn DocumentStore>) -> Self {
            let temp = tempfile::tempdir().unwrap();
            let root = temp.path().to_path_buf();
            let downloader = Downloader::new(
                root.clone(),
                extractor.clone(),
                RetentionManager::new(store.clone(), root, 5),
                PlayCounter::new(store.clone(), "songs"),
                Arc::new(ActiveFetches::new()),
            );
            Self {
                temp,
                store,
                extractor,
                downloader: Arc::new(downloader),
            }
        }

        async fn history(&self, user: &str) -> Vec<Value> {
            self.store
                .get(&RetentionManager::history_path(user))
                .await
                .unwrap()
                .and_then(|value| value.as_object().cloned())
                .map(|map| map.into_iter().map(|(_, record)| record).collect())
                .unwrap_or_default()
        }

        async fn wait_for_play_count(&self, expected: u64) {
            for _ in 0..50 {
                let count = self
                    .store
                    .get("songs/abc/played_count")
                    .await
                    .unwrap()
                    .and_then(|value| value.as_u64());
                if count == Some(expected) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("play count never reached {expected}");
        }
    }

    #[tokio::test]
    async fn fresh_download_extracts_and_records() {
        let ctx = DownloadContext::new(FakeExtractor::succeeding());
        let outcome = ctx.downloader.download("abc", "alice").await.unwrap();

        assert_eq!(outcome.file_url, "/audio/alice/abc.webm");
        assert!(!outcome.cached);
        assert_eq!(outcome.path, ctx.temp.path().join("alice").join("abc.webm"));
        assert!(outcome.path.exists());
        assert_eq!(ctx.extractor.calls(), 1);

        let history = ctx.history("alice").await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0]["audioId"], "abc");
        assert_eq!(history[0]["fileName"], "abc.webm");
        assert!(ctx.downloader.active().snapshot().is_empty());
        ctx.wait_for_play_count(1).await;
    }

    #[tokio::test]
    async fn existing_file_skips_extraction() {
        let ctx = DownloadContext::new(FakeExtractor::succeeding());
        let user_dir = ctx.temp.path().join("alice");
        std::fs::create_dir_all(&user_dir).unwrap();
        std::fs::write(user_dir.join("abc.webm"), b"cached").unwrap();

        let outcome = ctx.downloader.download("abc", "alice").await.unwrap();

        assert!(outcome.cached);
        assert_eq!(outcome.file_url, "/audio/alice/abc.webm");
        assert_eq!(ctx.extractor.calls(), 0);
        assert_eq!(ctx.history("alice").await.len(), 1);
    }

    #[tokio::test]
    async fn missing_parameters_touch_nothing() {
        let store = Arc::new(CountingStore::with_root(json!({"songs": {"abc": {}}})));
        let ctx = DownloadContext::with_store(FakeExtractor::succeeding(), store.clone());

        for (media, user) in [("", "alice"), ("abc", ""), ("  ", "  ")] {
            let err = ctx.downloader.download(media, user).await.unwrap_err();
            assert!(matches!(err, DownloadError::MissingParameters));
            assert!(err.is_client_error());
        }

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(ctx.extractor.calls(), 0);
        assert_eq!(store.writes(), 0);
        assert!(ctx.downloader.active().snapshot().is_empty());
        assert!(!ctx.temp.path().join("alice").exists());
    }

    #[tokio::test]
    async fn path_like_identifiers_are_rejected() {
        let ctx = DownloadContext::new(FakeExtractor::succeeding());
        let err = ctx.downloader.download("../abc", "alice").await.unwrap_err();
        assert!(matches!(err, DownloadError::InvalidParameters));
        let err = ctx.downloader.download("abc", "..").await.unwrap_err();
        assert!(matches!(err, DownloadError::InvalidParameters));
        assert_eq!(ctx.extractor.calls(), 0);
    }

    #[tokio::test]
    async fn extraction_failure_clears_tracker_and_skips_history() {
        let ctx = DownloadContext::new(FakeExtractor::failing());
        let err = ctx.downloader.download("abc", "alice").await.unwrap_err();

        assert!(matches!(err, DownloadError::Extraction(_)));
        assert!(!err.is_client_error());
        assert!(ctx.downloader.active().snapshot().is_empty());
        assert!(ctx.history("alice").await.is_empty());
    }

    #[tokio::test]
    async fn history_failure_is_internal_error() {
        let ctx =
            DownloadContext::with_store(FakeExtractor::succeeding(), Arc::new(FailingStore));
        let err = ctx.downloader.download("abc", "alice").await.unwrap_err();
        assert!(matches!(err, DownloadError::Internal(_)));
        assert!(ctx.downloader.active().snapshot().is_empty());
    }

    #[tokio::test]
    async fn retention_applies_through_downloads() {
        let ctx = DownloadContext::new(FakeExtractor::succeeding());
        for index in 0..6 {
            ctx.downloader
                .download(&format!("m{index}"), "alice")
                .await
                .unwrap();
        }

        let history = ctx.history("alice").await;
        assert_eq!(history.len(), 5);
        assert!(history.iter().all(|record| record["audioId"] != "m0"));
        assert!(!ctx.temp.path().join("alice").join("m0.webm").exists());
        assert!(ctx.temp.path().join("alice").join("m5.webm").exists());
    }

    #[tokio::test]
    async fn repeat_download_survives_its_own_eviction() {
        let ctx = DownloadContext::new(FakeExtractor::succeeding());
        for media in ["abc", "m1", "m2", "m3", "m4"] {
            ctx.downloader.download(media, "alice").await.unwrap();
        }

        let outcome = ctx.downloader.download("abc", "alice").await.unwrap();

        assert!(outcome.cached);
        assert_eq!(outcome.file_url, "/audio/alice/abc.webm");
        assert!(outcome.path.exists());
        assert_eq!(ctx.history("alice").await.len(), 5);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_requests_for_same_pair_extract_once() {
        let ctx = DownloadContext::new(FakeExtractor::slow(Duration::from_millis(100)));
        let first = {
            let downloader = ctx.downloader.clone();
            tokio::spawn(async move { downloader.download("abc", "alice").await })
        };
        let second = {
            let downloader = ctx.downloader.clone();
            tokio::spawn(async move { downloader.download("abc", "alice").await })
        };

        let first = first.await.unwrap().unwrap();
        let second = second.await.unwrap().unwrap();

        assert_eq!(ctx.extractor.calls(), 1);
        assert_eq!(first.file_url, second.file_url);
        assert!(first.cached != second.cached);
        assert_eq!(ctx.downloader.in_flight.len(), 0);
    }

    #[tokio::test]
    async fn cancelled_download_clears_tracker() {
        let ctx = DownloadContext::new(FakeExtractor::slow(Duration::from_millis(500)));
        let task = {
            let downloader = ctx.downloader.clone();
            tokio::spawn(async move { downloader.download("abc", "alice").await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            ctx.downloader.active().snapshot(),
            vec![("alice".to_string(), "abc".to_string())]
        );

        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());
        assert!(ctx.downloader.active().snapshot().is_empty());
        assert_eq!(ctx.downloader.in_flight.len(), 0);
        assert!(ctx.history("alice").await.is_empty());
    }

    #[tokio::test]
    async fn unknown_song_still_downloads() {
        let ctx = DownloadContext::new(FakeExtractor::succeeding());
        ctx.downloader.download("zzz", "bob").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(ctx.store.get("songs/zzz").await.unwrap().is_none());
    }
}
