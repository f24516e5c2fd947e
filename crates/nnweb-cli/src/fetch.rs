//! Fetch transport for the CLI: HTTP(S) URLs go over the network, anything
//! else is read from the local filesystem.

use std::path::Path;

use async_trait::async_trait;
use nnweb_core::runtime::Result;
use nnweb_core::{Fetcher, HttpFetcher, ProgressCallback, RuntimeError};
use tracing::debug;

/// Reads model files from disk.
///
/// Accepts plain paths and `file://` URLs. Query strings added for cache
/// busting are ignored. Progress is reported once, for the whole file.
#[derive(Debug, Default, Clone)]
pub struct LocalFetcher;

#[async_trait(?Send)]
impl Fetcher for LocalFetcher {
    async fn fetch(&self, url: &str, progress: Option<&ProgressCallback>) -> Result<Vec<u8>> {
        let path = local_path(url);
        debug!("Reading {}", path.display());

        let bytes = tokio::fs::read(path).await.map_err(|e| RuntimeError::Fetch {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

        if let Some(progress) = progress {
            let total = bytes.len() as u64;
            progress(total, total);
        }
        Ok(bytes)
    }
}

fn local_path(url: &str) -> &Path {
    let without_query = url.split('?').next().unwrap_or(url);
    Path::new(without_query.strip_prefix("file://").unwrap_or(without_query))
}

/// Routes each URL to the HTTP or local transport by scheme.
#[derive(Debug)]
pub struct CliFetcher {
    http: HttpFetcher,
    local: LocalFetcher,
}

impl CliFetcher {
    pub fn new() -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("nnweb/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http: HttpFetcher::with_client(client),
            local: LocalFetcher,
        })
    }
}

#[async_trait(?Send)]
impl Fetcher for CliFetcher {
    async fn fetch(&self, url: &str, progress: Option<&ProgressCallback>) -> Result<Vec<u8>> {
        if url.starts_with("http://") || url.starts_with("https://") {
            self.http.fetch(url, progress).await
        } else {
            self.local.fetch(url, progress).await
        }
    }
}
