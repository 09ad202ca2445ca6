//! Process bootstrap helpers run before the listener binds.

use std::path::Path;

use anyhow::{Context, Result, bail};
use nix::unistd::Uid;

/// Installs the global `tracing` subscriber. `RUST_LOG` narrows or widens the
/// default `info` level.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Refuses to start as root so yt-dlp and the deletion of stale downloads run
/// with ordinary privileges.
pub fn ensure_not_root(process: &str) -> Result<()> {
    ensure_not_root_for(Uid::current(), process)
}

fn ensure_not_root_for(uid: Uid, process: &str) -> Result<()> {
    if uid.is_root() {
        bail!(
            "{process} must not be run as root; use a regular user or a dedicated service account"
        );
    }
    Ok(())
}

/// Empties the downloads root, creating it when absent. Files from a previous
/// run are not tracked by any history and would never be evicted.
pub async fn clear_downloads_root(root: &Path) -> Result<usize> {
    tokio::fs::create_dir_all(root)
        .await
        .with_context(|| format!("creating downloads root {}", root.display()))?;

    let mut entries = tokio::fs::read_dir(root)
        .await
        .with_context(|| format!("listing downloads root {}", root.display()))?;
    let mut removed = 0;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let file_type = entry.file_type().await?;
        let outcome = if file_type.is_dir() {
            tokio::fs::remove_dir_all(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };
        outcome.with_context(|| format!("removing {}", path.display()))?;
        removed += 1;
    }

    tracing::info!(root = %root.display(), removed, "cleared downloads root");
    Ok(removed)
}
