#![forbid(unsafe_code)]

//! Backend for the Araa music site: serves the frontend bundle, the cached
//! catalog and per-user audio downloads fetched through yt-dlp.

use std::path::{Component, Path};

pub mod catalog;
pub mod config;
pub mod downloads;
pub mod extractor;
pub mod plays;
pub mod retention;
pub mod server;
pub mod startup;
pub mod store;
pub mod tracker;

#[cfg(test)]
pub(crate) mod testing;

/// True when `value` is a single normal path component, so joining it onto a
/// base directory can never escape that directory.
pub fn is_safe_segment(value: &str) -> bool {
    if value.is_empty() || value.contains(['/', '\\']) {
        return false;
    }
    let mut components = Path::new(value).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}
