//! Access to the realtime JSON document tree that backs the catalog, the
//! per-user download history and the play counters.
//!
//! Paths are slash separated (`downloads/alice/audios`). Writing `null` or an
//! empty object removes a node, mirroring the hosted database.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};

use crate::config::StoreConfig;

mod firebase;
mod memory;

pub use firebase::FirebaseStore;
pub use memory::MemoryStore;

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Reads the subtree at `path`; `None` when nothing is stored there.
    async fn get(&self, path: &str) -> Result<Option<Value>>;

    /// Replaces the subtree at `path`.
    async fn set(&self, path: &str, value: Value) -> Result<()>;

    /// Writes the given children of `path`, leaving siblings untouched.
    async fn update(&self, path: &str, fields: Map<String, Value>) -> Result<()>;

    /// Appends `value` under a fresh chronologically ordered key and returns
    /// that key.
    async fn push(&self, path: &str, value: Value) -> Result<String>;

    async fn remove(&self, path: &str) -> Result<()>;
}

/// Opens the store described by the runtime configuration.
pub fn open_store(config: &StoreConfig) -> Result<Arc<dyn DocumentStore>> {
    if let Some(url) = &config.database_url {
        let store = FirebaseStore::new(url, config.auth_token.clone())
            .with_context(|| format!("configuring database at {url}"))?;
        tracing::info!(database = %url, "using hosted document store");
        return Ok(Arc::new(store));
    }

    let store = match &config.seed_file {
        Some(path) => MemoryStore::from_seed_file(path)?,
        None => MemoryStore::new(),
    };
    tracing::warn!("FIREBASE_DATABASE_URL not set; using in-memory document store");
    Ok(Arc::new(store))
}

pub(crate) fn path_segments(path: &str) -> Vec<&str> {
    path.split('/')
        .map(str::trim)
        .filter(|segment| !segment.is_empty())
        .collect()
}

pub(crate) fn child_path(parent: &str, child: &str) -> String {
    let parent = parent.trim_end_matches('/');
    if parent.is_empty() {
        child.to_string()
    } else {
        format!("{parent}/{child}")
    }
}

// Same alphabet as the hosted database's push ids; it sorts in ASCII order.
const PUSH_CHARS: &[u8; 64] = b"-0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ_abcdefghijklmnopqrstuvwxyz";

/// Generates 20 character keys: 8 characters of millisecond timestamp
/// followed by 12 characters of a counter. Keys from one generator always
/// sort in issue order, even if the wall clock steps backwards.
#[derive(Default)]
pub struct PushKeys {
    state: Mutex<PushKeyState>,
}

#[derive(Default)]
struct PushKeyState {
    last_millis: i64,
    counter: u64,
}

impl PushKeys {
    pub fn next_key(&self, now_millis: i64) -> String {
        let mut state = self.state.lock();
        state.last_millis = state.last_millis.max(now_millis);
        state.counter += 1;

        let mut key = encode_push_chars(state.last_millis.max(0) as u64, 8);
        key.push_str(&encode_push_chars(state.counter, 12));
        key
    }
}

fn encode_push_chars(mut value: u64, width: usize) -> String {
    let mut chars = vec![PUSH_CHARS[0]; width];
    for slot in chars.iter_mut().rev() {
        *slot = PUSH_CHARS[(value % 64) as usize];
        value /= 64;
    }
    chars.into_iter().map(char::from).collect()
}
