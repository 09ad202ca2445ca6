//! Which user is currently fetching which media id. Diagnostics only: the map
//! is never persisted and does not prevent overlapping requests.

use std::{collections::BTreeMap, fmt::Write};

use parking_lot::Mutex;

const USER_HEADER: &str = "userId";
const MEDIA_HEADER: &str = "mediaId";

#[derive(Default)]
pub struct ActiveFetches {
    entries: Mutex<BTreeMap<String, String>>,
}

impl ActiveFetches {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an in-flight fetch, replacing any earlier entry for the user.
    pub fn set(&self, user_id: &str, media_id: &str) {
        self.entries
            .lock()
            .insert(user_id.to_string(), media_id.to_string());
    }

    pub fn remove(&self, user_id: &str) {
        self.entries.lock().remove(user_id);
    }

    pub fn snapshot(&self) -> Vec<(String, String)> {
        self.entries
            .lock()
            .iter()
            .map(|(user, media)| (user.clone(), media.clone()))
            .collect()
    }

    /// Renders the current entries as a small text table, with a `-` row when
    /// nothing is in flight.
    pub fn render(&self) -> String {
        let mut rows = self.snapshot();
        if rows.is_empty() {
            rows.push(("-".to_string(), "-".to_string()));
        }

        let user_width = rows
            .iter()
            .map(|(user, _)| user.chars().count())
            .chain([USER_HEADER.len()])
            .max()
            .unwrap_or_default();
        let media_width = rows
            .iter()
            .map(|(_, media)| media.chars().count())
            .chain([MEDIA_HEADER.len()])
            .max()
            .unwrap_or_default();

        let mut table = String::new();
        let _ = writeln!(
            table,
            "{:<user_width$} | {:<media_width$}",
            USER_HEADER, MEDIA_HEADER
        );
        let _ = writeln!(table, "{}-+-{}", "-".repeat(user_width), "-".repeat(media_width));
        for (user, media) in rows {
            let _ = writeln!(table, "{user:<user_width$} | {media:<media_width$}");
        }
        table
    }

    pub fn log_snapshot(&self) {
        tracing::info!(target: "active_fetches", "in-flight downloads\n{}", self.render());
    }
}
