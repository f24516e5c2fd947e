//! Runner implementations.

pub mod fallback;
pub mod gpu;

#[cfg(feature = "bytecode")]
pub mod bytecode;

use std::fmt;
use std::rc::Rc;

use async_trait::async_trait;

use crate::fetch::{Fetcher, ModelSource, ProgressCallback, UrlTransform};
use crate::{BackendKind, Result, TensorView};

/// Trait for backend runners.
///
/// A runner owns one backend's lifecycle: construct, `init`, `load`, then any
/// number of `run` calls. Calls are expected to be sequential; overlapping
/// `run` invocations are not supported.
#[async_trait(?Send)]
pub trait Runner {
    /// Which backend this instance is.
    fn kind(&self) -> BackendKind;

    /// Canonical backend name, e.g. `"portable-bytecode"`.
    fn backend_name(&self) -> &'static str {
        self.kind().name()
    }

    /// Whether `load` bypasses HTTP caches.
    fn ignore_cache(&self) -> bool;

    fn set_ignore_cache(&mut self, ignore_cache: bool);

    /// Establish the backend's execution context.
    async fn init(&mut self) -> Result<()>;

    /// Fetch and parse the model from `directory` and allocate I/O views.
    ///
    /// `progress` receives `(loaded, total)` for the main payload when the
    /// transport knows its size.
    async fn load(&mut self, directory: &str, progress: Option<ProgressCallback>) -> Result<()>;

    /// One view per graph input, in declaration order. Empty before `load`.
    fn input_views(&self) -> Vec<TensorView>;

    /// One view per graph output, in declaration order. Empty before `load`.
    fn output_views(&self) -> Vec<TensorView>;

    /// Execute the loaded graph once, reading inputs and writing outputs in place.
    async fn run(&mut self) -> Result<()>;
}

impl fmt::Debug for dyn Runner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runner")
            .field("backend", &self.backend_name())
            .field("ignore_cache", &self.ignore_cache())
            .finish()
    }
}

/// Observes the start and successful end of every `run`.
///
/// A run that never reports completion (the process died, or `run` failed)
/// leaves the monitor in its "started" state.
pub trait ExecutionMonitor {
    fn run_started(&self, kind: BackendKind);

    fn run_completed(&self, kind: BackendKind);
}

/// Collaborators shared by every runner a dispatcher constructs.
#[derive(Clone)]
pub struct RunnerContext {
    pub fetcher: Rc<dyn Fetcher>,
    pub url_transform: Option<UrlTransform>,
    pub monitor: Option<Rc<dyn ExecutionMonitor>>,
}

impl RunnerContext {
    pub fn new(fetcher: Rc<dyn Fetcher>) -> Self {
        Self {
            fetcher,
            url_transform: None,
            monitor: None,
        }
    }

    pub fn with_url_transform(mut self, transform: UrlTransform) -> Self {
        self.url_transform = Some(transform);
        self
    }

    pub fn with_monitor(mut self, monitor: Rc<dyn ExecutionMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Source for `directory` honouring this context's URL transform.
    pub fn source(&self, directory: &str, ignore_cache: bool) -> ModelSource {
        ModelSource::new(directory, self.fetcher.clone())
            .with_url_transform(self.url_transform.clone())
            .with_ignore_cache(ignore_cache)
    }
}
