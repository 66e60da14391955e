use anyhow::Result;
use dashmap::{DashMap, DashSet};
use futures::FutureExt;
use futures::future::BoxFuture;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Where asset bytes come from
pub trait AssetSource: Send + Sync + 'static {
    /// Read the whole asset at `path`
    fn fetch(&self, path: &str) -> BoxFuture<'static, Result<Vec<u8>>>;
}

fn is_remote(path: &str) -> bool {
    path.starts_with("http://") || path.starts_with("https://")
}

/// Reads asset paths relative to a root directory.
///
/// Absolute site paths such as `/models/cube.glb` resolve to `<root>/models/cube.glb`.
#[derive(Debug, Clone)]
pub struct FileSource {
    root: PathBuf,
}

impl FileSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve `path` below the root, refusing to escape it
    pub fn resolve(&self, path: &str) -> Result<PathBuf> {
        let mut resolved = self.root.clone();
        for component in Path::new(path).components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::RootDir | Component::CurDir => {}
                Component::ParentDir | Component::Prefix(_) => {
                    return Err(anyhow::anyhow!("Path {path} escapes the asset root"));
                }
            }
        }
        Ok(resolved)
    }
}

impl AssetSource for FileSource {
    fn fetch(&self, path: &str) -> BoxFuture<'static, Result<Vec<u8>>> {
        let resolved = self.resolve(path);
        async move {
            let resolved = resolved?;
            Ok(tokio::fs::read(&resolved).await?)
        }
        .boxed()
    }
}

/// Fetches `http(s)://` URLs
#[derive(Debug, Clone, Default)]
pub struct HttpSource {
    client: reqwest::Client,
}

impl HttpSource {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl AssetSource for HttpSource {
    fn fetch(&self, path: &str) -> BoxFuture<'static, Result<Vec<u8>>> {
        let request = self.client.get(path);
        async move {
            let response = request.send().await?.error_for_status()?;
            Ok(response.bytes().await?.to_vec())
        }
        .boxed()
    }
}

/// Sends remote URLs to one source and everything else to another, by default
/// [`HttpSource`] and [`FileSource`]
#[derive(Debug, Clone)]
pub struct RoutedSource<R = HttpSource, L = FileSource> {
    pub remote: R,
    pub local: L,
}

impl RoutedSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_sources(HttpSource::default(), FileSource::new(root))
    }
}

impl<R: AssetSource, L: AssetSource> RoutedSource<R, L> {
    pub fn with_sources(remote: R, local: L) -> Self {
        Self { remote, local }
    }
}

impl<R: AssetSource, L: AssetSource> AssetSource for RoutedSource<R, L> {
    fn fetch(&self, path: &str) -> BoxFuture<'static, Result<Vec<u8>>> {
        if is_remote(path) {
            tracing::trace!("Fetching {} over http", path);
            self.remote.fetch(path)
        } else {
            self.local.fetch(path)
        }
    }
}

/// In-memory source with a fetch counter and fault injection
#[derive(Debug, Default)]
pub struct MemorySource {
    files: DashMap<String, Arc<[u8]>>,
    failing: DashSet<String>,
    fetches: DashMap<String, usize>,
    total_fetches: AtomicUsize,
    latency: Option<Duration>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every fetch waits `latency` before completing
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn insert(&self, path: impl Into<String>, bytes: impl Into<Vec<u8>>) {
        let bytes: Vec<u8> = bytes.into();
        self.files.insert(path.into(), Arc::from(bytes));
    }

    /// Make fetches of `path` fail until [`Self::heal`] is called
    pub fn fail(&self, path: impl Into<String>) {
        self.failing.insert(path.into());
    }

    pub fn heal(&self, path: &str) {
        self.failing.remove(path);
    }

    /// Number of fetches attempted for `path`, failed ones included
    pub fn fetch_count(&self, path: &str) -> usize {
        self.fetches.get(path).map(|count| *count).unwrap_or(0)
    }

    pub fn total_fetches(&self) -> usize {
        self.total_fetches.load(Ordering::Relaxed)
    }

    fn lookup(&self, path: &str) -> Result<Arc<[u8]>> {
        self.total_fetches.fetch_add(1, Ordering::Relaxed);
        *self.fetches.entry(path.to_string()).or_default() += 1;
        if self.failing.contains(path) {
            return Err(anyhow::anyhow!("Simulated fetch failure for {path}"));
        }
        self.files
            .get(path)
            .map(|bytes| bytes.value().clone())
            .ok_or_else(|| anyhow::anyhow!("No such asset {path}"))
    }
}

impl AssetSource for MemorySource {
    fn fetch(&self, path: &str) -> BoxFuture<'static, Result<Vec<u8>>> {
        let found = self.lookup(path);
        let latency = self.latency;
        async move {
            if let Some(latency) = latency {
                tokio::time::sleep(latency).await;
            }
            Ok(found?.to_vec())
        }
        .boxed()
    }
}

impl<S: AssetSource> AssetSource for Arc<S> {
    fn fetch(&self, path: &str) -> BoxFuture<'static, Result<Vec<u8>>> {
        S::fetch(self, path)
    }
}
