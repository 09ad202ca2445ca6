#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_PORT: u16 = 5000;
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_DOWNLOADS_ROOT: &str = "downloads";
pub const DEFAULT_WWW_ROOT: &str = "dist";
pub const DEFAULT_YTDLP_BIN: &str = "yt-dlp";
pub const DEFAULT_COOKIES_FILE: &str = "cookiesyt.txt";
pub const DEFAULT_YTDLP_FORMAT: &str = "bestaudio[ext=webm]";
pub const DEFAULT_MEDIA_SOURCE_URL: &str = "https://www.youtube.com/watch?v=";
pub const DEFAULT_SONGS_COLLECTION: &str = "songs";
pub const DEFAULT_MOVIES_COLLECTION: &str = "music_data";
pub const DEFAULT_RETENTION_CAP: usize = 5;

/// Everything the backend needs to boot, resolved from CLI overrides, the
/// process environment and the `.env` file (in that order).
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub downloads_root: PathBuf,
    pub www_root: PathBuf,
    pub host: String,
    pub port: u16,
    pub store: StoreConfig,
    pub extractor: ExtractorConfig,
    pub songs_collection: String,
    pub movies_collection: String,
    pub retention_cap: usize,
}

/// Document store location. Without a database URL the in-memory backend is
/// used, optionally seeded from a JSON export.
#[derive(Debug, Clone, Default)]
pub struct StoreConfig {
    pub database_url: Option<String>,
    pub auth_token: Option<String>,
    pub seed_file: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ExtractorConfig {
    pub program: PathBuf,
    pub cookies: PathBuf,
    pub format: String,
    pub source_url: String,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub downloads_root: Option<PathBuf>,
    pub www_root: Option<PathBuf>,
    pub port: Option<u16>,
    pub host: Option<String>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_runtime_config(overrides: RuntimeOverrides) -> Result<RuntimeConfig> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    build_runtime_config_with_overrides(&file_vars, env_var_string, overrides)
}

#[cfg(test)]
fn build_runtime_config(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
) -> Result<RuntimeConfig> {
    build_runtime_config_with_overrides(file_vars, env_lookup, RuntimeOverrides::default())
}

fn build_runtime_config_with_overrides(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RuntimeOverrides,
) -> Result<RuntimeConfig> {
    let lookup = |key: &str| lookup_value(key, file_vars, &env_lookup);

    let downloads_root = overrides
        .downloads_root
        .or_else(|| lookup("DOWNLOADS_ROOT").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DOWNLOADS_ROOT));
    let www_root = overrides
        .www_root
        .or_else(|| lookup("WWW_ROOT").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_WWW_ROOT));
    let port = match overrides.port {
        Some(port) => port,
        None => lookup_port(&lookup)?.unwrap_or(DEFAULT_PORT),
    };
    let host = overrides
        .host
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .or_else(|| lookup("ARAA_HOST"))
        .unwrap_or_else(|| DEFAULT_HOST.to_string());

    let store = StoreConfig {
        database_url: lookup("FIREBASE_DATABASE_URL"),
        auth_token: lookup("FIREBASE_AUTH_TOKEN"),
        seed_file: lookup("STORE_SEED_FILE").map(PathBuf::from),
    };

    let timeout_secs = match lookup("EXTRACT_TIMEOUT_SECS") {
        Some(raw) => raw
            .parse::<u64>()
            .with_context(|| format!("EXTRACT_TIMEOUT_SECS must be a number, got {raw:?}"))?,
        None => 0,
    };
    let extractor = ExtractorConfig {
        program: lookup("YTDLP_BIN")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_YTDLP_BIN)),
        cookies: lookup("YTDLP_COOKIES")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_COOKIES_FILE)),
        format: lookup("YTDLP_FORMAT").unwrap_or_else(|| DEFAULT_YTDLP_FORMAT.to_string()),
        source_url: lookup("MEDIA_SOURCE_URL")
            .unwrap_or_else(|| DEFAULT_MEDIA_SOURCE_URL.to_string()),
        timeout: (timeout_secs > 0).then(|| Duration::from_secs(timeout_secs)),
    };

    let retention_cap = match lookup("RETENTION_CAP") {
        Some(raw) => raw
            .parse::<usize>()
            .ok()
            .filter(|cap| *cap > 0)
            .with_context(|| format!("RETENTION_CAP must be a positive number, got {raw:?}"))?,
        None => DEFAULT_RETENTION_CAP,
    };

    Ok(RuntimeConfig {
        downloads_root,
        www_root,
        host,
        port,
        store,
        extractor,
        songs_collection: lookup("SONGS_COLLECTION")
            .unwrap_or_else(|| DEFAULT_SONGS_COLLECTION.to_string()),
        movies_collection: lookup("MOVIES_COLLECTION")
            .unwrap_or_else(|| DEFAULT_MOVIES_COLLECTION.to_string()),
        retention_cap,
    })
}

/// `ARAA_PORT` wins over the generic `PORT`; a value that is set but not a
/// port number is an error rather than a silent default.
fn lookup_port(lookup: &impl Fn(&str) -> Option<String>) -> Result<Option<u16>> {
    for key in ["ARAA_PORT", "PORT"] {
        if let Some(raw) = lookup(key) {
            let port = raw
                .parse::<u16>()
                .with_context(|| format!("{key} must be a port number, got {raw:?}"))?;
            return Ok(Some(port));
        }
    }
    Ok(None)
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key)
        .or_else(|| file_vars.get(key).cloned())
        .filter(|value| !value.trim().is_empty())
}

pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}
