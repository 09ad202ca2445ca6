#![forbid(unsafe_code)]

//! Araa HTTP backend.
//!
//! Boot order matters: the downloads root is wiped before the listener binds,
//! and the catalog preload runs in the background so the port opens without
//! waiting on the database.

use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    sync::Arc,
};

use anyhow::{Context, Result};
use araa_backend::{
    catalog::CatalogCache,
    config::{RuntimeConfig, RuntimeOverrides, resolve_runtime_config},
    downloads::Downloader,
    extractor::YtDlpExtractor,
    plays::PlayCounter,
    retention::RetentionManager,
    server::{AppState, router},
    startup::{clear_downloads_root, ensure_not_root, init_tracing},
    store::open_store,
    tracker::ActiveFetches,
};
use clap::Parser;
use tokio::signal;

#[derive(Debug, Parser)]
#[command(name = "backend", about = "Serves the Araa frontend, catalog and audio downloads")]
struct BackendArgs {
    /// Directory holding per-user downloads. Emptied on every start.
    #[arg(long)]
    downloads_root: Option<PathBuf>,
    /// Directory holding the built frontend bundle.
    #[arg(long)]
    www_root: Option<PathBuf>,
    #[arg(long)]
    port: Option<u16>,
    /// IPv4 or IPv6 address to listen on.
    #[arg(long, value_parser = parse_host_arg)]
    host: Option<IpAddr>,
    /// Alternate `.env` file.
    #[arg(long)]
    env_file: Option<PathBuf>,
}

impl BackendArgs {
    fn into_overrides(self) -> RuntimeOverrides {
        RuntimeOverrides {
            downloads_root: self.downloads_root,
            www_root: self.www_root,
            port: self.port,
            host: self.host.map(|host| host.to_string()),
            env_path: self.env_file,
        }
    }
}

fn parse_host_arg(value: &str) -> Result<IpAddr> {
    value
        .trim()
        .parse::<IpAddr>()
        .context("expected a valid IPv4 or IPv6 address for --host/ARAA_HOST")
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let config = resolve_runtime_config(BackendArgs::parse().into_overrides())?;

    ensure_not_root("backend")?;
    clear_downloads_root(&config.downloads_root).await?;

    let host = parse_host_arg(&config.host)?;
    let addr = SocketAddr::new(host, config.port);
    let state = build_state(&config)?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    tracing::info!("server running on http://{addr}");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    Ok(())
}

fn build_state(config: &RuntimeConfig) -> Result<AppState> {
    let store = open_store(&config.store)?;

    let catalog = Arc::new(CatalogCache::new(
        config.songs_collection.clone(),
        config.movies_collection.clone(),
    ));
    {
        let catalog = catalog.clone();
        let store = store.clone();
        tokio::spawn(async move { catalog.populate(store.as_ref()).await });
    }

    let downloader = Downloader::new(
        config.downloads_root.clone(),
        Arc::new(YtDlpExtractor::new(&config.extractor)),
        RetentionManager::new(
            store.clone(),
            config.downloads_root.clone(),
            config.retention_cap,
        ),
        PlayCounter::new(store, config.songs_collection.clone()),
        Arc::new(ActiveFetches::new()),
    );

    Ok(AppState {
        catalog,
        downloads: Arc::new(downloader),
        www_root: Arc::new(config.www_root.clone()),
        downloads_root: Arc::new(config.downloads_root.clone()),
    })
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        tracing::error!("failed to install Ctrl+C handler: {err}");
    }
    tracing::info!("shutting down");
}
