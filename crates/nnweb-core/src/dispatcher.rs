//! Backend selection with ordered fallback.

use std::rc::Rc;

use nnweb_runtime::{BackendKind, ExecutionMonitor, Fetcher, Runner, RunnerContext};
use tracing::{debug, info, warn};

use crate::config::{BackendOrder, InitOption};
use crate::crash::{CrashNotice, CrashTracker};
use crate::error::{AttemptStage, BackendAttempt, ConfigError, InitError, Result};
use crate::probe::{BackendAvailability, Environment, probe_availability};
use crate::registry::Registry;

/// Picks, initializes and loads the first working backend.
pub struct Dispatcher {
    registry: Registry,
    environment: Environment,
    context: RunnerContext,
    crash_tracker: Option<Rc<CrashTracker>>,
}

impl Dispatcher {
    pub fn new(fetcher: Rc<dyn Fetcher>, environment: Environment) -> Self {
        Self {
            registry: Registry::with_defaults(),
            environment,
            context: RunnerContext::new(fetcher),
            crash_tracker: None,
        }
    }

    pub fn with_registry(mut self, registry: Registry) -> Self {
        self.registry = registry;
        self
    }

    /// Track GPU runs of every runner this dispatcher returns.
    pub fn with_crash_tracker(mut self, tracker: Rc<CrashTracker>) -> Self {
        self.context.monitor = Some(tracker.clone() as Rc<dyn ExecutionMonitor>);
        self.crash_tracker = Some(tracker);
        self
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn environment(&self) -> &Environment {
        &self.environment
    }

    pub fn crash_tracker(&self) -> Option<&CrashTracker> {
        self.crash_tracker.as_deref()
    }

    /// Notice raised when this session disabled the GPU after a crash.
    pub fn crash_notice(&self) -> Option<&CrashNotice> {
        self.crash_tracker.as_ref().and_then(|t| t.notice())
    }

    /// Probe the environment. A GPU disabled by the crash tracker reports
    /// as unavailable.
    pub fn backend_availability(&self) -> BackendAvailability {
        let mut availability = probe_availability(&self.registry, &self.environment);
        if !self.gpu_eligible() {
            availability.demote(BackendKind::Gpu);
        }
        availability
    }

    /// Initialize using the option's backend order, or the default order.
    pub async fn initialize(&self, directory: &str, option: InitOption) -> Result<Box<dyn Runner>> {
        match &option.backend_order {
            Some(order) => self.initialize_backend(order, directory, &option).await,
            None => self.select(&BackendOrder::default(), false, directory, &option).await,
        }
    }

    /// Initialize from an explicit order.
    ///
    /// Naming a kind that has no registered factory is a configuration
    /// error, raised before any backend is attempted.
    pub async fn initialize_backend(
        &self,
        order: &BackendOrder,
        directory: &str,
        option: &InitOption,
    ) -> Result<Box<dyn Runner>> {
        self.select(order, true, directory, option).await
    }

    fn gpu_eligible(&self) -> bool {
        self.crash_tracker.as_ref().map_or(true, |t| t.gpu_eligible())
    }

    fn unavailable_reason(&self, kind: BackendKind) -> &'static str {
        if kind == BackendKind::Gpu && !self.gpu_eligible() {
            "disabled after a previous crash"
        } else {
            "not supported by this environment"
        }
    }

    async fn select(
        &self,
        order: &BackendOrder,
        explicit: bool,
        directory: &str,
        option: &InitOption,
    ) -> Result<Box<dyn Runner>> {
        if explicit {
            if let Some(kind) = order
                .requested()
                .iter()
                .find(|k| !self.registry.contains(**k))
            {
                return Err(ConfigError::UnregisteredBackend(*kind).into());
            }
        }

        let availability = self.backend_availability();
        let context = match &option.url_transform {
            Some(transform) => self.context.clone().with_url_transform(transform.clone()),
            None => self.context.clone(),
        };

        let mut attempts = Vec::new();
        let mut fail = |kind: BackendKind, stage: AttemptStage, reason: String| {
            attempts.push(BackendAttempt { kind, stage, reason });
        };

        for kind in order.normalize() {
            if !self.registry.contains(kind) {
                debug!("Skipping unregistered {} backend", kind);
                continue;
            }
            if !availability.is_available(kind) {
                let reason = self.unavailable_reason(kind);
                debug!("Skipping {} backend: {}", kind, reason);
                fail(kind, AttemptStage::Unavailable, reason.to_string());
                continue;
            }

            let factory = self.registry.factory(kind)?;
            let backend_option = option.backend_option(kind);
            let mut runner = match factory.construct(&context, &self.environment, &backend_option) {
                Ok(runner) => runner,
                Err(e) => {
                    warn!("Failed to construct {} backend: {}", kind, e);
                    fail(kind, AttemptStage::Construct, e.to_string());
                    continue;
                }
            };

            if let Err(e) = runner.init().await {
                warn!("Failed to initialize {} backend: {}", kind, e);
                fail(kind, AttemptStage::Init, e.to_string());
                continue;
            }

            runner.set_ignore_cache(option.ignore_cache);
            if let Err(e) = runner.load(directory, option.progress.clone()).await {
                warn!("Failed to load model on {} backend: {}", kind, e);
                fail(kind, AttemptStage::Load, e.to_string());
                continue;
            }

            info!("Using {} backend", runner.backend_name());
            return Ok(runner);
        }

        Err(InitError::NoBackendAvailable { attempts })
    }
}
