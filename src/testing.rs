//! Fakes shared by the unit tests.

use std::{
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::extractor::{ExtractionError, MediaExtractor, resolve_output};
use crate::store::{DocumentStore, MemoryStore};

/// Extractor that writes a placeholder file (or fails) without spawning
/// anything.
pub struct FakeExtractor {
    calls: AtomicUsize,
    delay: Option<Duration>,
    fail: bool,
}

impl FakeExtractor {
    pub fn succeeding() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            delay: None,
            fail: false,
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            delay: None,
            fail: true,
        })
    }

    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            delay: Some(delay),
            fail: false,
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaExtractor for FakeExtractor {
    async fn extract(
        &self,
        media_id: &str,
        output_template: &Path,
    ) -> Result<PathBuf, ExtractionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail {
            return Err(ExtractionError::Reported(format!(
                "ERROR: {media_id}: Video unavailable"
            )));
        }
        let path = resolve_output(output_template);
        tokio::fs::write(&path, media_id.as_bytes())
            .await
            .map_err(|source| ExtractionError::Launch {
                program: "fake".into(),
                source,
            })?;
        Ok(path)
    }
}

/// Memory store that counts writes.
#[derive(Default)]
pub struct CountingStore {
    inner: MemoryStore,
    writes: AtomicUsize,
}

impl CountingStore {
    pub fn with_root(root: Value) -> Self {
        Self {
            inner: MemoryStore::with_root(root),
            writes: AtomicUsize::new(0),
        }
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn note_write(&self) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl DocumentStore for CountingStore {
    async fn get(&self, path: &str) -> Result<Option<Value>> {
        self.inner.get(path).await
    }

    async fn set(&self, path: &str, value: Value) -> Result<()> {
        self.note_write();
        self.inner.set(path, value).await
    }

    async fn update(&self, path: &str, fields: Map<String, Value>) -> Result<()> {
        self.note_write();
        self.inner.update(path, fields).await
    }

    async fn push(&self, path: &str, value: Value) -> Result<String> {
        self.note_write();
        self.inner.push(path, value).await
    }

    async fn remove(&self, path: &str) -> Result<()> {
        self.note_write();
        self.inner.remove(path).await
    }
}

/// Store whose every call fails, as an unreachable database would.
pub struct FailingStore;

#[async_trait]
impl DocumentStore for FailingStore {
    async fn get(&self, _path: &str) -> Result<Option<Value>> {
        anyhow::bail!("connection refused")
    }

    async fn set(&self, _path: &str, _value: Value) -> Result<()> {
        anyhow::bail!("connection refused")
    }

    async fn update(&self, _path: &str, _fields: Map<String, Value>) -> Result<()> {
        anyhow::bail!("connection refused")
    }

    async fn push(&self, _path: &str, _value: Value) -> Result<String> {
        anyhow::bail!("connection refused")
    }

    async fn remove(&self, _path: &str) -> Result<()> {
        anyhow::bail!("connection refused")
    }
}
