//! In-process document tree used when no hosted database is configured, and
//! by the test suites.

use std::{fs, path::Path};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde_json::{Map, Value};

use super::{DocumentStore, PushKeys, child_path, path_segments};

pub struct MemoryStore {
    root: RwLock<Value>,
    keys: PushKeys,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_root(Value::Object(Map::new()))
    }

    pub fn with_root(root: Value) -> Self {
        Self {
            root: RwLock::new(normalize(root)),
            keys: PushKeys::default(),
        }
    }

    /// Loads a JSON export of the whole database.
    pub fn from_seed_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading store seed {}", path.display()))?;
        let root: Value = serde_json::from_str(&raw)
            .with_context(|| format!("parsing store seed {}", path.display()))?;
        tracing::info!(seed = %path.display(), "seeded in-memory document store");
        Ok(Self::with_root(root))
    }

    fn read(&self, path: &str) -> Option<Value> {
        let root = self.root.read();
        let mut node = &*root;
        for segment in path_segments(path) {
            node = node.get(segment)?;
        }
        (!is_empty(node)).then(|| node.clone())
    }

    fn write(&self, path: &str, value: Value) {
        let segments = path_segments(path);
        let mut root = self.root.write();
        write_node(&mut root, &segments, value);
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, path: &str) -> Result<Option<Value>> {
        Ok(self.read(path))
    }

    async fn set(&self, path: &str, value: Value) -> Result<()> {
        self.write(path, value);
        Ok(())
    }

    async fn update(&self, path: &str, fields: Map<String, Value>) -> Result<()> {
        for (key, value) in fields {
            self.write(&child_path(path, &key), value);
        }
        Ok(())
    }

    async fn push(&self, path: &str, value: Value) -> Result<String> {
        let key = self.keys.next_key(Utc::now().timestamp_millis());
        self.write(&child_path(path, &key), value);
        Ok(key)
    }

    async fn remove(&self, path: &str) -> Result<()> {
        self.write(path, Value::Null);
        Ok(())
    }
}

fn write_node(node: &mut Value, segments: &[&str], value: Value) {
    let Some((head, rest)) = segments.split_first() else {
        *node = normalize(value);
        return;
    };

    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    if let Value::Object(map) = node {
        let child = map.entry(head.to_string()).or_insert(Value::Null);
        write_node(child, rest, value);
        if is_empty(child) {
            map.remove(*head);
        }
    }
}

/// Drops nulls and empty objects, which the hosted database never stores.
fn normalize(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, value)| (key, normalize(value)))
                .filter(|(_, value)| !is_empty(value))
                .collect(),
        ),
        other => other,
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}
