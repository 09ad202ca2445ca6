//! Firebase Realtime Database over its REST interface.
//!
//! `ureq` is blocking, so every request runs on the blocking pool.

use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use url::Url;

use super::{DocumentStore, path_segments};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct FirebaseStore {
    agent: ureq::Agent,
    base: Url,
    auth_token: Option<String>,
}

#[derive(Deserialize)]
struct PushResponse {
    name: String,
}

impl FirebaseStore {
    pub fn new(database_url: &str, auth_token: Option<String>) -> Result<Self> {
        let base = Url::parse(database_url.trim())
            .with_context(|| format!("parsing database URL {database_url:?}"))?;
        if base.cannot_be_a_base() {
            return Err(anyhow!("database URL must be hierarchical: {database_url}"));
        }
        let agent = ureq::AgentBuilder::new().timeout(REQUEST_TIMEOUT).build();
        Ok(Self {
            agent,
            base,
            auth_token,
        })
    }

    /// `{base}/{path}.json?auth=<token>`
    fn url_for(&self, path: &str) -> Result<Url> {
        let mut url = self.base.clone();
        let segments = path_segments(path);
        {
            let mut parts = url
                .path_segments_mut()
                .map_err(|_| anyhow!("database URL cannot hold a path"))?;
            parts.pop_if_empty();
            match segments.split_last() {
                Some((last, parents)) => {
                    parts.extend(parents);
                    parts.push(&format!("{last}.json"));
                }
                None => {
                    parts.push(".json");
                }
            }
        }
        if let Some(token) = &self.auth_token {
            url.query_pairs_mut().append_pair("auth", token);
        }
        Ok(url)
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(ureq::Agent) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let agent = self.agent.clone();
        tokio::task::spawn_blocking(move || op(agent))
            .await
            .context("document store request task failed")?
    }
}

#[async_trait]
impl DocumentStore for FirebaseStore {
    async fn get(&self, path: &str) -> Result<Option<Value>> {
        let url = self.url_for(path)?;
        let path = path.to_string();
        let value: Value = self
            .blocking(move |agent| {
                agent
                    .get(url.as_str())
                    .call()
                    .with_context(|| format!("GET {path}"))?
                    .into_json()
                    .with_context(|| format!("decoding GET {path}"))
            })
            .await?;
        Ok((!value.is_null()).then_some(value))
    }

    async fn set(&self, path: &str, value: Value) -> Result<()> {
        let url = self.url_for(path)?;
        let path = path.to_string();
        self.blocking(move |agent| {
            agent
                .put(url.as_str())
                .send_json(value)
                .with_context(|| format!("PUT {path}"))?;
            Ok(())
        })
        .await
    }

    async fn update(&self, path: &str, fields: Map<String, Value>) -> Result<()> {
        let url = self.url_for(path)?;
        let path = path.to_string();
        self.blocking(move |agent| {
            agent
                .request("PATCH", url.as_str())
                .send_json(Value::Object(fields))
                .with_context(|| format!("PATCH {path}"))?;
            Ok(())
        })
        .await
    }

    async fn push(&self, path: &str, value: Value) -> Result<String> {
        let url = self.url_for(path)?;
        let path = path.to_string();
        self.blocking(move |agent| {
            let response: PushResponse = agent
                .post(url.as_str())
                .send_json(value)
                .with_context(|| format!("POST {path}"))?
                .into_json()
                .with_context(|| format!("decoding POST {path}"))?;
            Ok(response.name)
        })
        .await
    }

    async fn remove(&self, path: &str) -> Result<()> {
        let url = self.url_for(path)?;
        let path = path.to_string();
        self.blocking(move |agent| {
            agent
                .delete(url.as_str())
                .call()
                .with_context(|| format!("DELETE {path}"))?;
            Ok(())
        })
        .await
    }
}
