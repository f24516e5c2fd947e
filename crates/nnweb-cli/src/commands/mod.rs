//! CLI subcommands.

pub mod config;
pub mod crash;
pub mod probe;
pub mod run;

use std::path::{Path, PathBuf};
use std::rc::Rc;

use nnweb_core::{CrashTracker, FileStateStore, NnwebConfig};

/// Options shared by every subcommand.
#[derive(Debug, Default)]
pub struct Globals {
    pub config: Option<PathBuf>,
    pub state_file: Option<PathBuf>,
}

impl Globals {
    /// Explicit `--config`, or the platform default.
    pub fn config_path(&self) -> PathBuf {
        self.config.clone().unwrap_or_else(default_config_path)
    }

    /// Load the configuration; a missing default file yields defaults.
    pub fn load_config(&self) -> anyhow::Result<NnwebConfig> {
        if let Some(path) = &self.config {
            return Ok(NnwebConfig::from_file(path)?);
        }
        let path = default_config_path();
        if path.exists() {
            Ok(NnwebConfig::from_file(&path)?)
        } else {
            Ok(NnwebConfig::default())
        }
    }

    /// `--state-file`, then the configured path, then the platform data dir.
    pub fn state_path(&self, config: &NnwebConfig) -> PathBuf {
        self.state_file
            .clone()
            .or_else(|| config.state.path.clone())
            .unwrap_or_else(default_state_path)
    }

    pub fn state_store(&self, config: &NnwebConfig) -> Rc<FileStateStore> {
        Rc::new(FileStateStore::new(self.state_path(config)))
    }

    /// Start a crash-tracking session against the configured store.
    pub fn crash_tracker(&self, config: &NnwebConfig) -> Rc<CrashTracker> {
        Rc::new(CrashTracker::begin_session(self.state_store(config)))
    }
}

pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("nnweb")
        .join("config.json")
}

fn default_state_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("nnweb")
        .join("state.json")
}

/// Resolve a model directory argument: URLs pass through, paths become absolute.
pub fn model_directory(arg: &str) -> anyhow::Result<String> {
    if arg.contains("://") {
        return Ok(arg.to_string());
    }
    let path = Path::new(arg);
    if !path.is_dir() {
        anyhow::bail!("Model directory not found: {}", path.display());
    }
    Ok(std::fs::canonicalize(path)?.display().to_string())
}
