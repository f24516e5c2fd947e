//! Backend kinds and their canonical names.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The distinct execution strategies a model can run on.
///
/// Declaration order is the default preference order, which the derived
/// `Ord` preserves: GPU first, fallback last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BackendKind {
    /// GPU-accelerated execution through an external compute device.
    #[serde(rename = "gpu")]
    Gpu,
    /// Portable bytecode (ONNX) executed by a bytecode VM.
    #[serde(rename = "portable-bytecode")]
    Bytecode,
    /// Pure interpreted fallback. Always available.
    #[serde(rename = "fallback")]
    Fallback,
}

impl BackendKind {
    /// Every kind, in default preference order.
    pub const ALL: [BackendKind; 3] = [
        BackendKind::Gpu,
        BackendKind::Bytecode,
        BackendKind::Fallback,
    ];

    /// Canonical name, also reported as a runner's `backend_name`.
    pub fn name(self) -> &'static str {
        match self {
            BackendKind::Gpu => "gpu",
            BackendKind::Bytecode => "portable-bytecode",
            BackendKind::Fallback => "fallback",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Returned when a string names no known backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown backend: {0}")]
pub struct ParseBackendKindError(pub String);

impl FromStr for BackendKind {
    type Err = ParseBackendKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gpu" | "webgpu" => Ok(BackendKind::Gpu),
            "portable-bytecode" | "bytecode" | "webassembly" | "wasm" => Ok(BackendKind::Bytecode),
            "fallback" => Ok(BackendKind::Fallback),
            _ => Err(ParseBackendKindError(s.to_string())),
        }
    }
}
