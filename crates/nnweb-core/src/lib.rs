//! Backend selection for nnweb.
//!
//! This crate provides:
//! - the capability probe reporting which backends the environment supports
//! - the registry mapping backend kinds to runner factories
//! - the [`Dispatcher`], which walks a preference order and returns the first
//!   backend that both initializes and loads the model
//! - the persistent GPU crash tracker and its state stores
//! - configuration (`NnwebConfig`, `InitOption`)

pub mod config;
pub mod crash;
pub mod dispatcher;
pub mod error;
pub mod probe;
pub mod registry;
pub mod state;

pub use config::{BackendOrder, InitOption, NnwebConfig};
pub use crash::{CrashNotice, CrashStatus, CrashTracker};
pub use dispatcher::Dispatcher;
pub use error::{AttemptStage, BackendAttempt, ConfigError, InitError, Result, StateError};
pub use probe::{BackendAvailability, Environment, probe_availability};
pub use registry::{Registry, RunnerFactory};
pub use state::{MemoryStateStore, StateStore};

#[cfg(not(target_arch = "wasm32"))]
pub use state::FileStateStore;

/// The runner layer, for items not re-exported below.
pub use nnweb_runtime as runtime;

/// Re-export runner types.
pub use nnweb_runtime::{
    BackendKind, ExecutionMonitor, Fetcher, GpuAdapter, GpuDevice, KernelDispatch, KernelTable,
    MemoryFetcher, ProgressCallback, Runner, RunnerContext, RuntimeError, TensorView, UrlTransform,
};

#[cfg(feature = "http")]
pub use nnweb_runtime::HttpFetcher;
