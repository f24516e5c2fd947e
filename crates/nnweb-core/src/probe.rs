//! Capability probe.

use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use nnweb_runtime::{BackendKind, GpuAdapter};
use serde::Serialize;

use crate::registry::Registry;

/// What the host platform offers.
#[derive(Clone, Default)]
pub struct Environment {
    /// GPU entry point, when the platform exposes one.
    pub gpu: Option<Rc<dyn GpuAdapter>>,

    /// A portable bytecode VM is present.
    pub bytecode_vm: bool,
}

impl Environment {
    /// The current native process. No GPU adapter is attached.
    pub fn native() -> Self {
        Self {
            gpu: None,
            bytecode_vm: cfg!(feature = "bytecode"),
        }
    }

    /// An environment with no capabilities at all.
    pub fn bare() -> Self {
        Self::default()
    }

    pub fn with_gpu(mut self, adapter: Rc<dyn GpuAdapter>) -> Self {
        self.gpu = Some(adapter);
        self
    }

    pub fn with_bytecode_vm(mut self, present: bool) -> Self {
        self.bytecode_vm = present;
        self
    }
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environment")
            .field("gpu", &self.gpu.as_ref().map(|a| a.name().to_string()))
            .field("bytecode_vm", &self.bytecode_vm)
            .finish()
    }
}

/// Which backends can be attempted right now.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendAvailability {
    pub status: BTreeMap<BackendKind, bool>,

    /// Available kinds in preference order.
    pub default_order: Vec<BackendKind>,
}

impl BackendAvailability {
    pub fn from_status(status: BTreeMap<BackendKind, bool>) -> Self {
        let default_order = BackendKind::ALL
            .into_iter()
            .filter(|kind| status.get(kind).copied().unwrap_or(false))
            .collect();
        Self { status, default_order }
    }

    pub fn is_available(&self, kind: BackendKind) -> bool {
        self.status.get(&kind).copied().unwrap_or(false)
    }

    /// Mark `kind` unavailable.
    pub fn demote(&mut self, kind: BackendKind) {
        self.status.insert(kind, false);
        self.default_order.retain(|k| *k != kind);
    }
}

/// Probe every kind against `env`. Kinds with no factory report `false`.
pub fn probe_availability(registry: &Registry, env: &Environment) -> BackendAvailability {
    let status = BackendKind::ALL
        .into_iter()
        .map(|kind| {
            let available = registry
                .factory(kind)
                .map(|factory| factory.is_available(env))
                .unwrap_or(false);
            (kind, available)
        })
        .collect();
    BackendAvailability::from_status(status)
}
