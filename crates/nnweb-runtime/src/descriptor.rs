//! Graph descriptors shared by the GPU and fallback runners.
//!
//! A descriptor is a JSON document describing a single `f32` arena:
//! weights occupy the leading `static_size` elements, every variable is an
//! allocation inside it, and `exec_infos` lists the kernels to run in order.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::ops::Range;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::Result;
use crate::error::RuntimeError;
use crate::tensor::{SharedBuffer, TensorView};

/// Weight encoding understood by this build.
pub const RAW_ENCODING: &str = "raw";

/// Largest arena a descriptor may request, in elements (4 GiB of `f32`).
pub const MAX_ARENA_ELEMENTS: usize = 1 << 30;

fn default_encoding() -> String {
    RAW_ENCODING.to_string()
}

/// Parsed graph descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphDescriptor {
    /// Graph input variable names, in view order.
    pub inputs: Vec<String>,

    /// Graph output variable names, in view order.
    pub outputs: Vec<String>,

    /// Arena layout.
    pub memory_layout: MemoryLayout,

    /// Encoding of the weight payload.
    #[serde(default = "default_encoding")]
    pub weight_encoding: String,

    /// Kernel invocations, executed in order.
    #[serde(default)]
    pub exec_infos: Vec<ExecInfo>,

    /// Shader source compiled by the GPU runner.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernel_source: Option<String>,
}

/// Arena size and variable placement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryLayout {
    /// Arena length in elements.
    pub total_size: usize,

    /// Leading elements filled from the weight payload.
    #[serde(default)]
    pub static_size: usize,

    /// Variable placements keyed by name.
    pub allocations: BTreeMap<String, Allocation>,
}

/// A variable's placement in the arena.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub offset: usize,
    pub size: usize,
    /// Logical shape; `[size]` when omitted.
    #[serde(default)]
    pub shape: Vec<usize>,
}

impl Allocation {
    /// Element range in the arena. Only meaningful once the descriptor has
    /// been validated.
    pub fn range(&self) -> Range<usize> {
        self.offset..self.offset.saturating_add(self.size)
    }

    fn end(&self) -> Option<usize> {
        self.offset.checked_add(self.size)
    }

    pub fn shape_or_flat(&self) -> Vec<usize> {
        if self.shape.is_empty() {
            vec![self.size]
        } else {
            self.shape.clone()
        }
    }
}

/// One kernel invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecInfo {
    pub entry_func_name: String,

    #[serde(default)]
    pub inputs: Vec<String>,

    #[serde(default)]
    pub outputs: Vec<String>,

    /// Kernel-specific parameters (fallback).
    #[serde(default)]
    pub call_option: serde_json::Value,

    /// Dispatch grid (GPU).
    #[serde(default = "unit_grid")]
    pub threadgroups_per_grid: [u32; 3],

    /// Threadgroup size (GPU).
    #[serde(default = "unit_grid")]
    pub threads_per_thread_group: [u32; 3],

    /// Packed kernel arguments (GPU).
    #[serde(default)]
    pub meta_buffer: Vec<i32>,
}

fn unit_grid() -> [u32; 3] {
    [1, 1, 1]
}

impl GraphDescriptor {
    /// Parse and validate a descriptor from JSON bytes.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let descriptor: GraphDescriptor = serde_json::from_slice(bytes)
            .map_err(|e| RuntimeError::Descriptor(e.to_string()))?;
        descriptor.validate()?;
        debug!(
            "Parsed descriptor: {} inputs, {} outputs, {} kernels, arena {}",
            descriptor.inputs.len(),
            descriptor.outputs.len(),
            descriptor.exec_infos.len(),
            descriptor.memory_layout.total_size
        );
        Ok(descriptor)
    }

    /// Check that every referenced variable exists and fits the arena.
    pub fn validate(&self) -> Result<()> {
        let layout = &self.memory_layout;
        if layout.total_size > MAX_ARENA_ELEMENTS {
            return Err(RuntimeError::Descriptor(format!(
                "arena size {} exceeds the limit of {} elements",
                layout.total_size, MAX_ARENA_ELEMENTS
            )));
        }
        if layout.static_size > layout.total_size {
            return Err(RuntimeError::Descriptor(format!(
                "static size {} exceeds arena size {}",
                layout.static_size, layout.total_size
            )));
        }

        for (name, alloc) in &layout.allocations {
            match alloc.end() {
                Some(end) if end <= layout.total_size => {}
                _ => {
                    return Err(RuntimeError::Descriptor(format!(
                        "allocation '{}' at offset {} with size {} does not fit arena size {}",
                        name, alloc.offset, alloc.size, layout.total_size
                    )));
                }
            }
            let elements = alloc
                .shape_or_flat()
                .iter()
                .try_fold(1usize, |acc, dim| acc.checked_mul(*dim));
            if elements != Some(alloc.size) {
                return Err(RuntimeError::Descriptor(format!(
                    "allocation '{}' shape {:?} does not match size {}",
                    name, alloc.shape, alloc.size
                )));
            }
        }

        let referenced = self
            .inputs
            .iter()
            .chain(&self.outputs)
            .chain(self.exec_infos.iter().flat_map(|e| e.inputs.iter().chain(&e.outputs)));
        for name in referenced {
            self.allocation(name)?;
        }

        Ok(())
    }

    /// Look up a variable's placement.
    pub fn allocation(&self, name: &str) -> Result<&Allocation> {
        self.memory_layout
            .allocations
            .get(name)
            .ok_or_else(|| {
                RuntimeError::Descriptor(format!("no allocation for variable '{}'", name))
            })
    }

    /// Decode the weight payload according to `weight_encoding`.
    pub fn decode_weights(&self, bytes: &[u8]) -> Result<Vec<f32>> {
        if self.weight_encoding != RAW_ENCODING {
            return Err(RuntimeError::UnsupportedEncoding(self.weight_encoding.clone()));
        }
        if bytes.len() % 4 != 0 {
            return Err(RuntimeError::Descriptor(format!(
                "weight payload of {} bytes is not a whole number of f32 values",
                bytes.len()
            )));
        }

        let weights: Vec<f32> = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        if weights.len() != self.memory_layout.static_size {
            return Err(RuntimeError::Descriptor(format!(
                "expected {} weights, payload holds {}",
                self.memory_layout.static_size,
                weights.len()
            )));
        }

        Ok(weights)
    }

    /// Build the arena with `weights` at its head.
    pub fn allocate_arena(&self, mut weights: Vec<f32>) -> Result<SharedBuffer> {
        let total = self.memory_layout.total_size;
        let additional = total.saturating_sub(weights.len());
        weights.try_reserve_exact(additional).map_err(|e| {
            RuntimeError::Descriptor(format!("cannot allocate arena of {} elements: {}", total, e))
        })?;
        weights.resize(total, 0.0);
        Ok(Rc::new(RefCell::new(weights)))
    }

    /// Views for `names` over `arena`.
    pub fn views(&self, names: &[String], arena: &SharedBuffer) -> Result<Vec<TensorView>> {
        names
            .iter()
            .map(|name| {
                let alloc = self.allocation(name)?;
                Ok(TensorView::new(
                    name.clone(),
                    alloc.shape_or_flat(),
                    arena.clone(),
                    alloc.offset,
                ))
            })
            .collect()
    }
}
