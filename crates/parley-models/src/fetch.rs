//! Weight file resolution and download.

use std::path::PathBuf;

use anyhow::Context;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use parley_core::config::{ParleyConfig, is_remote};

use crate::progress::ProgressReporter;

/// Where a weight file comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WeightSource {
    Local(PathBuf),
    Http(String),
}

/// Resolves `base/model_id/file` against a local directory or an HTTP
/// server, caching downloads under `cache_dir`.
#[derive(Debug, Clone)]
pub struct WeightFetcher {
    base: String,
    cache_dir: PathBuf,
    allow_remote: bool,
    client: reqwest::Client,
}

impl WeightFetcher {
    pub fn new(base: impl Into<String>, cache_dir: PathBuf, allow_remote: bool) -> Self {
        Self {
            base: base.into(),
            cache_dir,
            allow_remote,
            client: reqwest::Client::new(),
        }
    }

    pub fn from_config(config: &ParleyConfig) -> Self {
        Self::new(
            config.weights_base_url(),
            config.cache_dir(),
            config.allow_remote(),
        )
    }

    pub fn source(&self, model_id: &str, file: &str) -> WeightSource {
        let base = self.base.trim_end_matches('/');
        if base.starts_with("http://") || base.starts_with("https://") {
            return WeightSource::Http(format!("{base}/{model_id}/{file}"));
        }
        let root = base.strip_prefix("file://").unwrap_or(base);
        WeightSource::Local(PathBuf::from(root).join(model_id).join(file))
    }

    /// Make one weight file available locally and return its path.
    pub async fn fetch(
        &self,
        model_id: &str,
        file: &str,
        progress: &ProgressReporter,
    ) -> anyhow::Result<PathBuf> {
        progress.downloading(file, model_id);

        let path = match self.source(model_id, file) {
            WeightSource::Local(path) => {
                if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
                    anyhow::bail!("Weight file not found: {}", path.display());
                }
                progress.progressing(file, model_id, 100.0);
                path
            }
            WeightSource::Http(url) => self.download(&url, model_id, file, progress).await?,
        };

        progress.done(file, model_id);
        Ok(path)
    }

    async fn download(
        &self,
        url: &str,
        model_id: &str,
        file: &str,
        progress: &ProgressReporter,
    ) -> anyhow::Result<PathBuf> {
        let target = self.cache_dir.join(model_id).join(file);
        if tokio::fs::try_exists(&target).await.unwrap_or(false) {
            debug!(path = %target.display(), "Using cached weight file");
            progress.progressing(file, model_id, 100.0);
            return Ok(target);
        }

        if is_remote(url) && !self.allow_remote {
            anyhow::bail!("Remote weights are disabled (weights.allow_remote): {url}");
        }

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        info!(url, "Fetching weight file");
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("Failed to reach {url}"))?;

        if !resp.status().is_success() {
            let status = resp.status();
            anyhow::bail!("Weight fetch error {status}: {url}");
        }

        let total = resp.content_length().filter(|len| *len > 0);
        let partial = PathBuf::from(format!("{}.part", target.display()));
        let mut out = tokio::fs::File::create(&partial).await?;
        let mut stream = resp.bytes_stream();
        let mut received: u64 = 0;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.context("Weight download interrupted")?;
            out.write_all(&chunk).await?;
            received += chunk.len() as u64;
            if let Some(total) = total {
                progress.progressing(file, model_id, received as f32 / total as f32 * 100.0);
            }
        }
        out.flush().await?;
        drop(out);

        tokio::fs::rename(&partial, &target).await?;
        debug!(path = %target.display(), bytes = received, "Weight file cached");
        Ok(target)
    }
}
