//! Initialization options and the persisted configuration file.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use nnweb_runtime::{BackendKind, ProgressCallback, UrlTransform};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ConfigError;

/// Backend preference: a single kind or an ordered sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendOrder {
    Single(BackendKind),
    Sequence(Vec<BackendKind>),
}

impl BackendOrder {
    /// The effective candidate list.
    ///
    /// Duplicates keep their first position and `Fallback` is always the
    /// last resort, appended when the caller left it out.
    pub fn normalize(&self) -> Vec<BackendKind> {
        let requested: &[BackendKind] = match self {
            BackendOrder::Single(kind) => std::slice::from_ref(kind),
            BackendOrder::Sequence(kinds) => kinds,
        };

        let mut order = Vec::with_capacity(requested.len() + 1);
        for kind in requested {
            if !order.contains(kind) {
                order.push(*kind);
            }
        }
        if !order.contains(&BackendKind::Fallback) {
            order.push(BackendKind::Fallback);
        }
        order
    }

    /// Kinds the caller named explicitly, before normalization.
    pub fn requested(&self) -> &[BackendKind] {
        match self {
            BackendOrder::Single(kind) => std::slice::from_ref(kind),
            BackendOrder::Sequence(kinds) => kinds,
        }
    }
}

impl Default for BackendOrder {
    fn default() -> Self {
        BackendOrder::Sequence(vec![BackendKind::Gpu, BackendKind::Bytecode])
    }
}

impl From<BackendKind> for BackendOrder {
    fn from(kind: BackendKind) -> Self {
        BackendOrder::Single(kind)
    }
}

impl From<Vec<BackendKind>> for BackendOrder {
    fn from(kinds: Vec<BackendKind>) -> Self {
        BackendOrder::Sequence(kinds)
    }
}

impl<const N: usize> From<[BackendKind; N]> for BackendOrder {
    fn from(kinds: [BackendKind; N]) -> Self {
        BackendOrder::Sequence(kinds.to_vec())
    }
}

/// Options for one initialization.
#[derive(Clone, Default)]
pub struct InitOption {
    /// `None` means the default order.
    pub backend_order: Option<BackendOrder>,

    /// Per-backend option blobs handed to the runner factory as-is.
    pub backend_options: HashMap<BackendKind, Value>,

    /// Bypass HTTP caches while loading.
    pub ignore_cache: bool,

    /// Receives `(loaded, total)` while the model payload downloads.
    pub progress: Option<ProgressCallback>,

    /// Rewrites every URL before it is fetched.
    pub url_transform: Option<UrlTransform>,
}

impl InitOption {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_backend_order(mut self, order: impl Into<BackendOrder>) -> Self {
        self.backend_order = Some(order.into());
        self
    }

    pub fn with_backend_option(mut self, kind: BackendKind, option: Value) -> Self {
        self.backend_options.insert(kind, option);
        self
    }

    pub fn with_ignore_cache(mut self, ignore_cache: bool) -> Self {
        self.ignore_cache = ignore_cache;
        self
    }

    pub fn with_progress(mut self, progress: impl Fn(u64, u64) + 'static) -> Self {
        self.progress = Some(Rc::new(progress));
        self
    }

    pub fn with_url_transform(mut self, transform: impl Fn(&str) -> String + 'static) -> Self {
        self.url_transform = Some(Rc::new(transform));
        self
    }

    /// Option blob for `kind`; `Value::Null` when none was given.
    pub fn backend_option(&self, kind: BackendKind) -> Value {
        self.backend_options
            .get(&kind)
            .cloned()
            .unwrap_or(Value::Null)
    }
}

impl fmt::Debug for InitOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InitOption")
            .field("backend_order", &self.backend_order)
            .field("backend_options", &self.backend_options)
            .field("ignore_cache", &self.ignore_cache)
            .field("progress", &self.progress.is_some())
            .field("url_transform", &self.url_transform.is_some())
            .finish()
    }
}

/// Main configuration for nnweb.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NnwebConfig {
    /// Backend selection.
    pub backends: BackendConfig,

    /// Persisted crash state.
    pub state: StateConfig,
}

/// Backend selection configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Preference order by backend name. Fallback is appended implicitly.
    pub order: Vec<String>,

    /// Bypass HTTP caches while loading models.
    pub ignore_cache: bool,

    /// Per-backend option blobs keyed by backend name.
    pub options: BTreeMap<String, Value>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            order: vec![
                BackendKind::Gpu.name().to_string(),
                BackendKind::Bytecode.name().to_string(),
            ],
            ignore_cache: false,
            options: BTreeMap::new(),
        }
    }
}

/// Crash state configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// Crash state file. `None` uses the platform data directory.
    pub path: Option<PathBuf>,
}

impl NnwebConfig {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Save configuration to a JSON file.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Convert into initialization options, resolving backend names.
    pub fn init_option(&self) -> Result<InitOption, ConfigError> {
        let order = self
            .backends
            .order
            .iter()
            .map(|name| name.parse::<BackendKind>())
            .collect::<Result<Vec<_>, _>>()?;

        let mut option = InitOption::new()
            .with_backend_order(order)
            .with_ignore_cache(self.backends.ignore_cache);

        for (name, value) in &self.backends.options {
            let kind: BackendKind = name.parse()?;
            option.backend_options.insert(kind, value.clone());
        }

        Ok(option)
    }
}
