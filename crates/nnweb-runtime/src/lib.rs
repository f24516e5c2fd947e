//! Backend runners for nnweb.
//!
//! This crate provides the uniform [`Runner`] interface and its three
//! implementations:
//! - [`GpuRunner`] driving an external GPU device through [`GpuAdapter`]
//! - [`BytecodeRunner`] executing portable ONNX bytecode with `tract`
//! - [`FallbackRunner`] interpreting the graph descriptor op by op
//!
//! Model files are fetched through the [`Fetcher`] abstraction so the same
//! runners work against HTTP, local files or in-memory fixtures.

mod backend;
mod descriptor;
mod error;
mod fetch;
mod kind;
mod tensor;

pub use backend::fallback::{FallbackRunner, Kernel, KernelTable};
pub use backend::gpu::{GpuAdapter, GpuDevice, GpuRunner, KernelDispatch};
pub use backend::{ExecutionMonitor, Runner, RunnerContext};
pub use descriptor::{Allocation, ExecInfo, GraphDescriptor, MemoryLayout};
pub use error::RuntimeError;
pub use fetch::{
    Fetcher, MemoryFetcher, ModelSource, ProgressCallback, UrlTransform, cache_busted, join_url,
};
pub use kind::{BackendKind, ParseBackendKindError};
pub use tensor::{SharedBuffer, TensorView};

#[cfg(feature = "bytecode")]
pub use backend::bytecode::{BytecodeOptions, BytecodeRunner};

#[cfg(feature = "http")]
pub use fetch::HttpFetcher;

/// Result type for runner operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;
