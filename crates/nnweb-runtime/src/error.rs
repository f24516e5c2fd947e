//! Error types for the runner layer.

use thiserror::Error;

/// Errors raised while constructing, initializing, loading or running a backend.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// A model file could not be fetched.
    #[error("failed to fetch {url}: {reason}")]
    Fetch { url: String, reason: String },

    /// The graph descriptor is malformed or inconsistent.
    #[error("invalid graph descriptor: {0}")]
    Descriptor(String),

    /// The weight payload uses an encoding this build cannot decode.
    #[error("unsupported weight encoding: {0}")]
    UnsupportedEncoding(String),

    /// The descriptor references a kernel the interpreter does not provide.
    #[error("unknown kernel: {0}")]
    UnknownKernel(String),

    /// No compute device could be acquired.
    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Kernel source failed to compile on the device.
    #[error("kernel compilation failed: {0}")]
    Compile(String),

    /// `load` was called before `init`.
    #[error("{0} backend is not initialized")]
    NotInitialized(&'static str),

    /// `run` was called before a model was loaded.
    #[error("{0} backend has no model loaded")]
    NotLoaded(&'static str),

    /// Input data does not match the declared view.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A kernel or plan failed during execution.
    #[error("execution failed in {kernel}: {reason}")]
    Execution { kernel: String, reason: String },

    /// The bytecode model could not be parsed or optimized.
    #[error("model error: {0}")]
    Model(String),

    /// Per-backend options could not be interpreted.
    #[error("invalid backend options: {0}")]
    Options(#[from] serde_json::Error),

    /// I/O error when reading model files.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RuntimeError {
    pub(crate) fn fetch(url: &str, reason: impl ToString) -> Self {
        RuntimeError::Fetch {
            url: url.to_string(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn execution(kernel: &str, reason: impl ToString) -> Self {
        RuntimeError::Execution {
            kernel: kernel.to_string(),
            reason: reason.to_string(),
        }
    }
}
