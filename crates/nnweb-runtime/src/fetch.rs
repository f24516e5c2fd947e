//! Model file fetching.
//!
//! Runners never talk to the network directly: they build a [`ModelSource`]
//! for the model directory and fetch named files through it. The source
//! applies the caller's URL transform and, when asked to, appends a
//! cache-busting query parameter before handing the URL to a [`Fetcher`].

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use async_trait::async_trait;
use tracing::debug;

use crate::Result;
use crate::error::RuntimeError;

/// Progress callback invoked with `(loaded, total)` bytes.
pub type ProgressCallback = Rc<dyn Fn(u64, u64)>;

/// Rewrites a model URL before it is fetched, e.g. to point at a mirror.
pub type UrlTransform = Rc<dyn Fn(&str) -> String>;

/// Transport used to retrieve model files.
#[async_trait(?Send)]
pub trait Fetcher {
    /// Fetch `url` in full, reporting progress when the total size is known.
    async fn fetch(&self, url: &str, progress: Option<&ProgressCallback>) -> Result<Vec<u8>>;
}

/// Join a directory URL and a file name.
pub fn join_url(directory: &str, file: &str) -> String {
    if directory.is_empty() {
        file.to_string()
    } else if directory.ends_with('/') {
        format!("{}{}", directory, file)
    } else {
        format!("{}/{}", directory, file)
    }
}

/// Append a `t=<stamp>` query parameter to `url`.
pub fn cache_busted(url: &str, stamp: i64) -> String {
    let separator = if url.contains('?') { '&' } else { '?' };
    format!("{}{}t={}", url, separator, stamp)
}

fn cache_stamp() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// A model directory plus the policy for fetching files from it.
#[derive(Clone)]
pub struct ModelSource {
    directory: String,
    fetcher: Rc<dyn Fetcher>,
    url_transform: Option<UrlTransform>,
    ignore_cache: bool,
}

impl ModelSource {
    pub fn new(directory: impl Into<String>, fetcher: Rc<dyn Fetcher>) -> Self {
        Self {
            directory: directory.into(),
            fetcher,
            url_transform: None,
            ignore_cache: false,
        }
    }

    /// Rewrite every URL through `transform` before fetching.
    pub fn with_url_transform(mut self, transform: Option<UrlTransform>) -> Self {
        self.url_transform = transform;
        self
    }

    /// Bypass HTTP caches with a cache-busting parameter.
    pub fn with_ignore_cache(mut self, ignore_cache: bool) -> Self {
        self.ignore_cache = ignore_cache;
        self
    }

    pub fn directory(&self) -> &str {
        &self.directory
    }

    /// The URL that will be requested for `file`.
    pub fn url_for(&self, file: &str) -> String {
        let url = join_url(&self.directory, file);
        let url = match &self.url_transform {
            Some(transform) => transform(&url),
            None => url,
        };
        if self.ignore_cache {
            cache_busted(&url, cache_stamp())
        } else {
            url
        }
    }

    /// Fetch `file` from the directory.
    pub async fn fetch(&self, file: &str, progress: Option<&ProgressCallback>) -> Result<Vec<u8>> {
        let url = self.url_for(file);
        debug!("Fetching {}", url);
        let bytes = self.fetcher.fetch(&url, progress).await?;
        debug!("Fetched {} bytes from {}", bytes.len(), url);
        Ok(bytes)
    }
}

impl fmt::Debug for ModelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelSource")
            .field("directory", &self.directory)
            .field("url_transform", &self.url_transform.is_some())
            .field("ignore_cache", &self.ignore_cache)
            .finish()
    }
}

/// In-memory fetcher for embedded models and tests.
///
/// Files are matched on the URL without its query string; every requested
/// URL is recorded verbatim.
pub struct MemoryFetcher {
    files: HashMap<String, Vec<u8>>,
    requests: RefCell<Vec<String>>,
    chunk_size: usize,
}

impl MemoryFetcher {
    pub fn new() -> Self {
        Self {
            files: HashMap::new(),
            requests: RefCell::new(Vec::new()),
            chunk_size: 64 * 1024,
        }
    }

    /// Serve `bytes` at `url`.
    pub fn with_file(mut self, url: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        self.files.insert(url.into(), bytes.into());
        self
    }

    /// Granularity of progress reports.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// URLs requested so far, in order.
    pub fn requests(&self) -> Vec<String> {
        self.requests.borrow().clone()
    }
}

impl Default for MemoryFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait(?Send)]
impl Fetcher for MemoryFetcher {
    async fn fetch(&self, url: &str, progress: Option<&ProgressCallback>) -> Result<Vec<u8>> {
        self.requests.borrow_mut().push(url.to_string());

        let key = url.split('?').next().unwrap_or(url);
        let bytes = self
            .files
            .get(key)
            .ok_or_else(|| RuntimeError::fetch(url, "not found"))?;

        if let Some(progress) = progress {
            let total = bytes.len() as u64;
            let mut loaded = 0u64;
            for chunk in bytes.chunks(self.chunk_size) {
                loaded += chunk.len() as u64;
                progress(loaded, total);
            }
        }

        Ok(bytes.clone())
    }
}

/// HTTP fetcher streaming the response body.
#[cfg(feature = "http")]
#[derive(Debug, Clone, Default)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

#[cfg(feature = "http")]
impl HttpFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[cfg(feature = "http")]
#[async_trait(?Send)]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str, progress: Option<&ProgressCallback>) -> Result<Vec<u8>> {
        use futures_util::StreamExt;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| RuntimeError::fetch(url, e))?;

        if !response.status().is_success() {
            return Err(RuntimeError::fetch(url, format!("HTTP {}", response.status())));
        }

        let total = response.content_length();
        let mut body = Vec::with_capacity(total.unwrap_or(0) as usize);
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| RuntimeError::fetch(url, e))?;
            body.extend_from_slice(&chunk);
            if let (Some(progress), Some(total)) = (progress, total) {
                progress(body.len() as u64, total);
            }
        }

        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_join_url() {
        assert_eq!(join_url("models/a", "graph.json"), "models/a/graph.json");
        assert_eq!(join_url("https://cdn/x/", "graph.json"), "https://cdn/x/graph.json");
        assert_eq!(join_url("", "graph.json"), "graph.json");
    }

    #[test]
    fn test_cache_busted() {
        assert_eq!(cache_busted("a/b.bin", 42), "a/b.bin?t=42");
        assert_eq!(cache_busted("a/b.bin?v=1", 42), "a/b.bin?v=1&t=42");
    }

    #[test]
    fn test_url_for_applies_transform_then_cache_busting() {
        let fetcher: Rc<dyn Fetcher> = Rc::new(MemoryFetcher::new());
        let transform: UrlTransform =
            Rc::new(|url: &str| url.replace("models/", "https://mirror/"));

        let plain = ModelSource::new("models/resnet", fetcher.clone())
            .with_url_transform(Some(transform.clone()));
        assert_eq!(plain.url_for("graph.json"), "https://mirror/resnet/graph.json");

        let busted = plain.with_ignore_cache(true);
        let url = busted.url_for("graph.json");
        assert!(url.starts_with("https://mirror/resnet/graph.json?t="));
    }

    #[tokio::test]
    async fn test_memory_fetcher_ignores_query_and_records_requests() {
        let fetcher = MemoryFetcher::new().with_file("m/w.bin", vec![1u8, 2, 3]);
        let bytes = fetcher.fetch("m/w.bin?t=1", None).await.unwrap();
        assert_eq!(bytes, vec![1, 2, 3]);
        assert_eq!(fetcher.requests(), vec!["m/w.bin?t=1".to_string()]);

        let missing = fetcher.fetch("m/none.bin", None).await;
        assert!(matches!(missing, Err(RuntimeError::Fetch { .. })));
    }

    #[tokio::test]
    async fn test_memory_fetcher_progress_is_monotonic() {
        let fetcher = MemoryFetcher::new()
            .with_file("w.bin", vec![0u8; 10])
            .with_chunk_size(4);
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        let progress: ProgressCallback =
            Rc::new(move |loaded: u64, total: u64| sink.borrow_mut().push((loaded, total)));

        fetcher.fetch("w.bin", Some(&progress)).await.unwrap();

        assert_eq!(*seen.borrow(), vec![(4, 10), (8, 10), (10, 10)]);
    }
}
