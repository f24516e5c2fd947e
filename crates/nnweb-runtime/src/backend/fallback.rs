//! Interpreted fallback runner.
//!
//! Needs nothing from the platform, so it is always available and is the
//! last resort of every backend order. Each descriptor kernel is resolved
//! against a [`KernelTable`] at load time and executed in order by `run`.

use std::collections::HashMap;
use std::fmt;
use std::ops::Range;
use std::rc::Rc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info};

use super::{Runner, RunnerContext};
use crate::descriptor::GraphDescriptor;
use crate::error::RuntimeError;
use crate::fetch::ProgressCallback;
use crate::tensor::{SharedBuffer, TensorView};
use crate::{BackendKind, Result};

const DESCRIPTOR_FILE: &str = "graph_fallback.json";
const WEIGHT_FILE: &str = "weight_fallback.bin";
const NAME: &str = "fallback";

/// A kernel the interpreter can execute.
///
/// `outputs` arrive zeroed and sized to their allocations.
pub trait Kernel {
    fn execute(
        &self,
        inputs: &[&[f32]],
        outputs: &mut [Vec<f32>],
        option: &Value,
    ) -> std::result::Result<(), String>;
}

impl<F> Kernel for F
where
    F: Fn(&[&[f32]], &mut [Vec<f32>], &Value) -> std::result::Result<(), String>,
{
    fn execute(
        &self,
        inputs: &[&[f32]],
        outputs: &mut [Vec<f32>],
        option: &Value,
    ) -> std::result::Result<(), String> {
        self(inputs, outputs, option)
    }
}

/// Kernels available to the interpreter, keyed by entry function name.
#[derive(Clone, Default)]
pub struct KernelTable {
    kernels: HashMap<String, Rc<dyn Kernel>>,
}

impl KernelTable {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// A table with the reference kernels `copy`, `relu`, `add`, `mul` and
    /// `scalar_affine`.
    pub fn reference() -> Self {
        let mut table = Self::new();
        table.register("copy", kernels::copy);
        table.register("relu", kernels::relu);
        table.register("add", kernels::add);
        table.register("mul", kernels::mul);
        table.register("scalar_affine", kernels::scalar_affine);
        table
    }

    /// Add or replace a kernel.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        kernel: impl Kernel + 'static,
    ) -> &mut Self {
        self.kernels.insert(name.into(), Rc::new(kernel));
        self
    }

    pub fn get(&self, name: &str) -> Option<Rc<dyn Kernel>> {
        self.kernels.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.kernels.contains_key(name)
    }
}

impl fmt::Debug for KernelTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.kernels.keys().collect();
        names.sort();
        f.debug_struct("KernelTable").field("kernels", &names).finish()
    }
}

mod kernels {
    use serde_json::Value;

    type KernelResult = Result<(), String>;

    fn unary(inputs: &[&[f32]], outputs: &mut [Vec<f32>], f: impl Fn(f32) -> f32) -> KernelResult {
        let (Some(x), Some(y)) = (inputs.first(), outputs.first_mut()) else {
            return Err("expected one input and one output".into());
        };
        if x.len() != y.len() {
            return Err(format!("input has {} elements, output {}", x.len(), y.len()));
        }
        for (dst, src) in y.iter_mut().zip(x.iter()) {
            *dst = f(*src);
        }
        Ok(())
    }

    /// Elementwise binary op; a single-element right operand is broadcast.
    fn binary(
        inputs: &[&[f32]],
        outputs: &mut [Vec<f32>],
        f: impl Fn(f32, f32) -> f32,
    ) -> KernelResult {
        let ([a, b], Some(y)) = (inputs, outputs.first_mut()) else {
            return Err("expected two inputs and one output".into());
        };
        if a.len() != y.len() || (b.len() != a.len() && b.len() != 1) {
            return Err(format!(
                "incompatible lengths: {} and {} into {}",
                a.len(),
                b.len(),
                y.len()
            ));
        }
        for (i, dst) in y.iter_mut().enumerate() {
            let rhs = if b.len() == 1 { b[0] } else { b[i] };
            *dst = f(a[i], rhs);
        }
        Ok(())
    }

    pub fn copy(inputs: &[&[f32]], outputs: &mut [Vec<f32>], _option: &Value) -> KernelResult {
        unary(inputs, outputs, |x| x)
    }

    pub fn relu(inputs: &[&[f32]], outputs: &mut [Vec<f32>], _option: &Value) -> KernelResult {
        unary(inputs, outputs, |x| x.max(0.0))
    }

    pub fn add(inputs: &[&[f32]], outputs: &mut [Vec<f32>], _option: &Value) -> KernelResult {
        binary(inputs, outputs, |a, b| a + b)
    }

    pub fn mul(inputs: &[&[f32]], outputs: &mut [Vec<f32>], _option: &Value) -> KernelResult {
        binary(inputs, outputs, |a, b| a * b)
    }

    pub fn scalar_affine(
        inputs: &[&[f32]],
        outputs: &mut [Vec<f32>],
        option: &Value,
    ) -> KernelResult {
        let scale = option.get("scale").and_then(Value::as_f64).unwrap_or(1.0) as f32;
        let bias = option.get("bias").and_then(Value::as_f64).unwrap_or(0.0) as f32;
        unary(inputs, outputs, |x| x * scale + bias)
    }
}

/// A kernel resolved against the arena.
struct Step {
    name: String,
    kernel: Rc<dyn Kernel>,
    inputs: Vec<Range<usize>>,
    outputs: Vec<Range<usize>>,
    option: Value,
}

struct LoadedGraph {
    arena: SharedBuffer,
    steps: Vec<Step>,
    inputs: Vec<TensorView>,
    outputs: Vec<TensorView>,
}

/// Runner for the interpreted fallback backend.
pub struct FallbackRunner {
    context: RunnerContext,
    kernels: KernelTable,
    initialized: bool,
    graph: Option<LoadedGraph>,
    ignore_cache: bool,
}

impl FallbackRunner {
    pub fn new(context: RunnerContext, kernels: KernelTable) -> Self {
        Self {
            context,
            kernels,
            initialized: false,
            graph: None,
            ignore_cache: false,
        }
    }

    fn resolve_steps(&self, descriptor: &GraphDescriptor) -> Result<Vec<Step>> {
        let ranges = |names: &[String]| -> Result<Vec<Range<usize>>> {
            names
                .iter()
                .map(|n| descriptor.allocation(n).map(|a| a.range()))
                .collect()
        };

        descriptor
            .exec_infos
            .iter()
            .map(|info| {
                let kernel = self
                    .kernels
                    .get(&info.entry_func_name)
                    .ok_or_else(|| RuntimeError::UnknownKernel(info.entry_func_name.clone()))?;
                Ok(Step {
                    name: info.entry_func_name.clone(),
                    kernel,
                    inputs: ranges(&info.inputs)?,
                    outputs: ranges(&info.outputs)?,
                    option: info.call_option.clone(),
                })
            })
            .collect()
    }

    fn execute_step(arena: &SharedBuffer, step: &Step) -> Result<()> {
        let mut outputs: Vec<Vec<f32>> = step.outputs.iter().map(|r| vec![0.0; r.len()]).collect();

        {
            let memory = arena.borrow();
            let inputs: Vec<&[f32]> = step.inputs.iter().map(|r| &memory[r.clone()]).collect();
            step.kernel
                .execute(&inputs, &mut outputs, &step.option)
                .map_err(|reason| RuntimeError::execution(&step.name, reason))?;
        }

        let mut memory = arena.borrow_mut();
        for (range, values) in step.outputs.iter().zip(outputs) {
            if values.len() != range.len() {
                return Err(RuntimeError::execution(
                    &step.name,
                    format!(
                        "kernel produced {} values for a {}-element output",
                        values.len(),
                        range.len()
                    ),
                ));
            }
            memory[range.clone()].copy_from_slice(&values);
        }
        Ok(())
    }
}

impl fmt::Debug for FallbackRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FallbackRunner")
            .field("kernels", &self.kernels)
            .field("loaded", &self.graph.is_some())
            .finish()
    }
}

#[async_trait(?Send)]
impl Runner for FallbackRunner {
    fn kind(&self) -> BackendKind {
        BackendKind::Fallback
    }

    fn ignore_cache(&self) -> bool {
        self.ignore_cache
    }

    fn set_ignore_cache(&mut self, ignore_cache: bool) {
        self.ignore_cache = ignore_cache;
    }

    async fn init(&mut self) -> Result<()> {
        self.initialized = true;
        Ok(())
    }

    async fn load(&mut self, directory: &str, progress: Option<ProgressCallback>) -> Result<()> {
        if !self.initialized {
            return Err(RuntimeError::NotInitialized(NAME));
        }
        let source = self.context.source(directory, self.ignore_cache);

        let descriptor = GraphDescriptor::parse(&source.fetch(DESCRIPTOR_FILE, None).await?)?;
        let steps = self.resolve_steps(&descriptor)?;
        let payload = source.fetch(WEIGHT_FILE, progress.as_ref()).await?;
        let weights = descriptor.decode_weights(&payload)?;

        let arena = descriptor.allocate_arena(weights)?;
        let inputs = descriptor.views(&descriptor.inputs, &arena)?;
        let outputs = descriptor.views(&descriptor.outputs, &arena)?;

        info!("Loaded fallback graph from {} ({} kernels)", source.directory(), steps.len());

        self.graph = Some(LoadedGraph {
            arena,
            steps,
            inputs,
            outputs,
        });
        Ok(())
    }

    fn input_views(&self) -> Vec<TensorView> {
        self.graph.as_ref().map(|g| g.inputs.clone()).unwrap_or_default()
    }

    fn output_views(&self) -> Vec<TensorView> {
        self.graph.as_ref().map(|g| g.outputs.clone()).unwrap_or_default()
    }

    async fn run(&mut self) -> Result<()> {
        let graph = self.graph.as_ref().ok_or(RuntimeError::NotLoaded(NAME))?;
        for step in &graph.steps {
            debug!("Executing kernel {}", step.name);
            Self::execute_step(&graph.arena, step)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::MemoryFetcher;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::cell::RefCell;

    fn weights(values: &[f32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    /// y = relu(x * w) * 0.5 + 1
    fn graph() -> String {
        json!({
            "inputs": ["x"],
            "outputs": ["y"],
            "memory_layout": {
                "total_size": 12,
                "static_size": 3,
                "allocations": {
                    "w": {"offset": 0, "size": 3},
                    "x": {"offset": 3, "size": 3, "shape": [1, 3]},
                    "h": {"offset": 6, "size": 3},
                    "y": {"offset": 9, "size": 3}
                }
            },
            "exec_infos": [
                {"entry_func_name": "mul", "inputs": ["x", "w"], "outputs": ["h"]},
                {"entry_func_name": "relu", "inputs": ["h"], "outputs": ["h"]},
                {"entry_func_name": "scalar_affine", "inputs": ["h"], "outputs": ["y"],
                 "call_option": {"scale": 0.5, "bias": 1.0}}
            ]
        })
        .to_string()
    }

    fn runner(fetcher: MemoryFetcher) -> FallbackRunner {
        FallbackRunner::new(RunnerContext::new(Rc::new(fetcher)), KernelTable::reference())
    }

    #[tokio::test]
    async fn test_interprets_graph() {
        let fetcher = MemoryFetcher::new()
            .with_file("m/graph_fallback.json", graph())
            .with_file("m/weight_fallback.bin", weights(&[1.0, -2.0, 4.0]));
        let mut runner = runner(fetcher);
        runner.init().await.unwrap();
        runner.load("m", None).await.unwrap();

        let input = runner.input_views()[0].clone();
        assert_eq!(input.shape(), &[1, 3]);
        input.set(&[2.0, 3.0, 0.5]).unwrap();

        runner.run().await.unwrap();
        assert_eq!(runner.output_views()[0].to_vec().unwrap(), vec![2.0, 1.0, 2.0]);

        // Re-running picks up the new input contents.
        input.set(&[-1.0, -1.0, -1.0]).unwrap();
        runner.run().await.unwrap();
        assert_eq!(runner.output_views()[0].to_vec().unwrap(), vec![1.0, 2.0, 1.0]);
    }

    #[tokio::test]
    async fn test_unknown_kernel_fails_load() {
        let descriptor = graph().replace("\"relu\"", "\"gelu\"");
        let fetcher = MemoryFetcher::new()
            .with_file("m/graph_fallback.json", descriptor)
            .with_file("m/weight_fallback.bin", weights(&[1.0, 1.0, 1.0]));
        let mut runner = runner(fetcher);
        runner.init().await.unwrap();

        let err = runner.load("m", None).await.unwrap_err();
        assert!(matches!(err, RuntimeError::UnknownKernel(name) if name == "gelu"));
        assert!(runner.output_views().is_empty());
    }

    #[tokio::test]
    async fn test_progress_reports_weight_payload() {
        let fetcher = MemoryFetcher::new()
            .with_file("m/graph_fallback.json", graph())
            .with_file("m/weight_fallback.bin", weights(&[1.0, 1.0, 1.0]))
            .with_chunk_size(8);
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        let progress: ProgressCallback =
            Rc::new(move |loaded: u64, total: u64| sink.borrow_mut().push((loaded, total)));

        let mut runner = runner(fetcher);
        runner.init().await.unwrap();
        runner.load("m", Some(progress)).await.unwrap();

        assert_eq!(*seen.borrow(), vec![(8, 12), (12, 12)]);
    }

    #[tokio::test]
    async fn test_ignore_cache_changes_request_urls() {
        let fetcher = Rc::new(
            MemoryFetcher::new()
                .with_file("m/graph_fallback.json", graph())
                .with_file("m/weight_fallback.bin", weights(&[1.0, 1.0, 1.0])),
        );

        let mut cached =
            FallbackRunner::new(RunnerContext::new(fetcher.clone()), KernelTable::reference());
        cached.init().await.unwrap();
        cached.load("m", None).await.unwrap();

        let mut busted =
            FallbackRunner::new(RunnerContext::new(fetcher.clone()), KernelTable::reference());
        busted.set_ignore_cache(true);
        busted.init().await.unwrap();
        busted.load("m", None).await.unwrap();

        let requests = fetcher.requests();
        assert_eq!(&requests[..2], &["m/graph_fallback.json", "m/weight_fallback.bin"]);
        assert!(requests[2].starts_with("m/graph_fallback.json?t="));
        assert!(requests[3].starts_with("m/weight_fallback.bin?t="));
    }

    #[tokio::test]
    async fn test_malformed_layout_fails_load() {
        let descriptor = graph().replace(r#""offset":9,"#, r#""offset":18446744073709551615,"#);
        let fetcher = MemoryFetcher::new()
            .with_file("m/graph_fallback.json", descriptor)
            .with_file("m/weight_fallback.bin", weights(&[1.0, 1.0, 1.0]));
        let mut runner = runner(fetcher);
        runner.init().await.unwrap();

        assert!(matches!(runner.load("m", None).await, Err(RuntimeError::Descriptor(_))));
        assert!(matches!(runner.run().await, Err(RuntimeError::NotLoaded(_))));
    }

    #[tokio::test]
    async fn test_custom_kernel() {
        let descriptor = graph().replace("\"relu\"", "\"negate\"");
        let fetcher = MemoryFetcher::new()
            .with_file("m/graph_fallback.json", descriptor)
            .with_file("m/weight_fallback.bin", weights(&[1.0, 1.0, 1.0]));

        let mut kernels = KernelTable::reference();
        kernels.register("negate", |inputs: &[&[f32]], outputs: &mut [Vec<f32>], _: &Value| {
            for (dst, src) in outputs[0].iter_mut().zip(inputs[0].iter()) {
                *dst = -src;
            }
            Ok::<(), String>(())
        });
        assert!(kernels.contains("negate"));
        assert!(!kernels.contains("gelu"));

        let mut runner = FallbackRunner::new(RunnerContext::new(Rc::new(fetcher)), kernels);
        runner.init().await.unwrap();
        runner.load("m", None).await.unwrap();
        runner.input_views()[0].set(&[1.0, -2.0, 0.0]).unwrap();
        runner.run().await.unwrap();

        assert_eq!(runner.output_views()[0].to_vec().unwrap(), vec![0.5, 2.0, 1.0]);
    }

    #[test]
    fn test_boxed_runner_debug_names_backend() {
        let mut boxed: Box<dyn Runner> = Box::new(runner(MemoryFetcher::new()));
        boxed.set_ignore_cache(true);
        let rendered = format!("{:?}", boxed);
        assert!(rendered.contains("\"fallback\""));
        assert!(rendered.contains("ignore_cache: true"));

        let result: Result<Box<dyn Runner>> = Err(RuntimeError::NotLoaded(NAME));
        assert!(matches!(result.unwrap_err(), RuntimeError::NotLoaded("fallback")));
    }

    #[test]
    fn test_binary_kernel_broadcasts_scalar() {
        let mut out = vec![vec![0.0; 3]];
        let a: &[f32] = &[1.0, 2.0, 3.0];
        let b: &[f32] = &[10.0];
        kernels::add(&[a, b], &mut out, &Value::Null).unwrap();
        assert_eq!(out[0], vec![11.0, 12.0, 13.0]);
        assert!(kernels::add(&[a], &mut out, &Value::Null).is_err());
    }
}
