//! Narrow seam around the external media extraction tool.

use std::{
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    time::Duration,
};

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;

use crate::config::ExtractorConfig;

/// Extension every download ends up with; yt-dlp is told to merge into it.
pub const OUTPUT_EXTENSION: &str = "webm";
const EXT_PLACEHOLDER: &str = "%(ext)s";
const ERROR_MARKER: &str = "ERROR:";

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("could not launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("extractor exited with {status}: {message}")]
    Failed { status: ExitStatus, message: String },
    #[error("extractor reported an error: {0}")]
    Reported(String),
    #[error("extractor timed out after {0:?}")]
    TimedOut(Duration),
    #[error("extractor finished but {} was not written", .0.display())]
    MissingOutput(PathBuf),
}

#[async_trait]
pub trait MediaExtractor: Send + Sync {
    /// Fetches `media_id` into `output_template` (a path containing
    /// `%(ext)s`) and returns the written file.
    async fn extract(
        &self,
        media_id: &str,
        output_template: &Path,
    ) -> Result<PathBuf, ExtractionError>;
}

/// Path the extractor is expected to write for a given output template.
pub fn resolve_output(output_template: &Path) -> PathBuf {
    let template = output_template.to_string_lossy();
    PathBuf::from(template.replace(EXT_PLACEHOLDER, OUTPUT_EXTENSION))
}

pub struct YtDlpExtractor {
    program: PathBuf,
    format: String,
    cookies: PathBuf,
    source_url: String,
    timeout: Option<Duration>,
}

impl YtDlpExtractor {
    pub fn new(config: &ExtractorConfig) -> Self {
        Self {
            program: config.program.clone(),
            format: config.format.clone(),
            cookies: config.cookies.clone(),
            source_url: config.source_url.clone(),
            timeout: config.timeout,
        }
    }

    fn source_url_for(&self, media_id: &str) -> String {
        format!("{}{}", self.source_url, media_id)
    }

    fn command(&self, media_id: &str, output_template: &Path) -> Command {
        let mut command = Command::new(&self.program);
        command
            .arg("-f")
            .arg(&self.format)
            .arg("--merge-output-format")
            .arg(OUTPUT_EXTENSION)
            .arg("--no-progress")
            .arg("-o")
            .arg(output_template);
        // The cookie file is optional; yt-dlp aborts when it is missing.
        if self.cookies.exists() {
            command.arg("--cookies").arg(&self.cookies);
        }
        command
            .arg(self.source_url_for(media_id))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

#[async_trait]
impl MediaExtractor for YtDlpExtractor {
    async fn extract(
        &self,
        media_id: &str,
        output_template: &Path,
    ) -> Result<PathBuf, ExtractionError> {
        let run = self.command(media_id, output_template).output();
        let output = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, run)
                .await
                .map_err(|_| ExtractionError::TimedOut(limit))?,
            None => run.await,
        }
        .map_err(|source| ExtractionError::Launch {
            program: self.program.display().to_string(),
            source,
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        for line in stdout.lines().filter(|line| !line.trim().is_empty()) {
            tracing::debug!(media = media_id, "yt-dlp: {line}");
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let mut errors = Vec::new();
        for line in stderr.lines().map(str::trim).filter(|line| !line.is_empty()) {
            if line.starts_with(ERROR_MARKER) {
                tracing::error!(media = media_id, "yt-dlp: {line}");
                errors.push(line.to_string());
            } else {
                tracing::warn!(media = media_id, "yt-dlp: {line}");
            }
        }

        if !output.status.success() {
            let message = errors
                .first()
                .cloned()
                .or_else(|| stderr.lines().rev().find(|line| !line.trim().is_empty()).map(str::to_string))
                .unwrap_or_else(|| "no diagnostic output".to_string());
            return Err(ExtractionError::Failed {
                status: output.status,
                message,
            });
        }
        if let Some(first) = errors.into_iter().next() {
            return Err(ExtractionError::Reported(first));
        }

        let written = resolve_output(output_template);
        if !tokio::fs::try_exists(&written).await.unwrap_or(false) {
            return Err(ExtractionError::MissingOutput(written));
        }
        Ok(written)
    }
}
