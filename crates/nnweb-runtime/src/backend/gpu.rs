//! GPU runner driving an external compute device.
//!
//! Shader compilation and dispatch live outside this crate: the platform
//! supplies a [`GpuAdapter`] and the runner only sequences the calls.

use std::fmt;
use std::rc::Rc;

use async_trait::async_trait;
use tracing::{debug, info};

use super::{Runner, RunnerContext};
use crate::descriptor::{ExecInfo, GraphDescriptor};
use crate::error::RuntimeError;
use crate::fetch::ProgressCallback;
use crate::tensor::{SharedBuffer, TensorView};
use crate::{BackendKind, Result};

const DESCRIPTOR_FILE: &str = "graph_gpu.json";
const WEIGHT_FILE: &str = "weight_gpu.bin";
const NAME: &str = "gpu";

/// Entry point to the platform's GPU.
#[async_trait(?Send)]
pub trait GpuAdapter {
    /// Human-readable adapter name for logs.
    fn name(&self) -> &str;

    /// Acquire a compute device. Fails when no usable device exists.
    async fn request_device(&self) -> Result<Box<dyn GpuDevice>>;
}

/// An acquired compute device.
#[async_trait(?Send)]
pub trait GpuDevice {
    /// Compile the descriptor's kernel source.
    async fn compile(&mut self, kernel_source: &str) -> Result<()>;

    /// Run one kernel against the arena.
    async fn dispatch(&mut self, call: &KernelDispatch<'_>, memory: &mut [f32]) -> Result<()>;
}

/// Arguments of a single kernel dispatch.
#[derive(Debug, Clone, Copy)]
pub struct KernelDispatch<'a> {
    pub entry: &'a str,
    pub threadgroups_per_grid: [u32; 3],
    pub threads_per_thread_group: [u32; 3],
    pub meta_buffer: &'a [i32],
}

impl<'a> From<&'a ExecInfo> for KernelDispatch<'a> {
    fn from(info: &'a ExecInfo) -> Self {
        Self {
            entry: &info.entry_func_name,
            threadgroups_per_grid: info.threadgroups_per_grid,
            threads_per_thread_group: info.threads_per_thread_group,
            meta_buffer: &info.meta_buffer,
        }
    }
}

struct LoadedGraph {
    descriptor: GraphDescriptor,
    arena: SharedBuffer,
    inputs: Vec<TensorView>,
    outputs: Vec<TensorView>,
}

/// Runner for the GPU backend.
pub struct GpuRunner {
    adapter: Rc<dyn GpuAdapter>,
    context: RunnerContext,
    device: Option<Box<dyn GpuDevice>>,
    graph: Option<LoadedGraph>,
    ignore_cache: bool,
}

impl GpuRunner {
    pub fn new(adapter: Rc<dyn GpuAdapter>, context: RunnerContext) -> Self {
        Self {
            adapter,
            context,
            device: None,
            graph: None,
            ignore_cache: false,
        }
    }

    async fn dispatch_all(
        device: &mut dyn GpuDevice,
        descriptor: &GraphDescriptor,
        memory: &mut [f32],
    ) -> Result<()> {
        for info in &descriptor.exec_infos {
            device.dispatch(&KernelDispatch::from(info), memory).await?;
        }
        Ok(())
    }
}

impl fmt::Debug for GpuRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuRunner")
            .field("adapter", &self.adapter.name())
            .field("initialized", &self.device.is_some())
            .field("loaded", &self.graph.is_some())
            .finish()
    }
}

#[async_trait(?Send)]
impl Runner for GpuRunner {
    fn kind(&self) -> BackendKind {
        BackendKind::Gpu
    }

    fn ignore_cache(&self) -> bool {
        self.ignore_cache
    }

    fn set_ignore_cache(&mut self, ignore_cache: bool) {
        self.ignore_cache = ignore_cache;
    }

    async fn init(&mut self) -> Result<()> {
        debug!("Requesting GPU device from {}", self.adapter.name());
        self.device = Some(self.adapter.request_device().await?);
        Ok(())
    }

    async fn load(&mut self, directory: &str, progress: Option<ProgressCallback>) -> Result<()> {
        let device = self.device.as_mut().ok_or(RuntimeError::NotInitialized(NAME))?;
        let source = self.context.source(directory, self.ignore_cache);

        let descriptor = GraphDescriptor::parse(&source.fetch(DESCRIPTOR_FILE, None).await?)?;
        let kernel_source = descriptor
            .kernel_source
            .as_deref()
            .ok_or_else(|| RuntimeError::Descriptor("GPU descriptor has no kernel_source".into()))?;

        let payload = source.fetch(WEIGHT_FILE, progress.as_ref()).await?;
        let weights = descriptor.decode_weights(&payload)?;
        device.compile(kernel_source).await?;

        let arena = descriptor.allocate_arena(weights)?;
        let inputs = descriptor.views(&descriptor.inputs, &arena)?;
        let outputs = descriptor.views(&descriptor.outputs, &arena)?;

        info!(
            "Loaded GPU graph from {} ({} kernels)",
            source.directory(),
            descriptor.exec_infos.len()
        );

        self.graph = Some(LoadedGraph {
            descriptor,
            arena,
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
        let (Some(device), Some(graph)) = (self.device.as_mut(), self.graph.as_ref()) else {
            return Err(RuntimeError::NotLoaded(NAME));
        };

        if let Some(monitor) = &self.context.monitor {
            monitor.run_started(BackendKind::Gpu);
        }

        // The arena is moved out for the duration of the dispatches so no
        // RefCell borrow is held across an await.
        let mut memory = graph.arena.take();
        let result = Self::dispatch_all(device.as_mut(), &graph.descriptor, &mut memory).await;
        graph.arena.replace(memory);
        result?;

        if let Some(monitor) = &self.context.monitor {
            monitor.run_completed(BackendKind::Gpu);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ExecutionMonitor;
    use crate::fetch::MemoryFetcher;
    use pretty_assertions::assert_eq;
    use std::cell::RefCell;

    /// Device whose "double" kernel writes 2*x into y using meta offsets
    /// `[x_offset, y_offset, len]`.
    struct DoublingDevice {
        compiled: Rc<RefCell<Option<String>>>,
        fail_dispatch: bool,
    }

    #[async_trait(?Send)]
    impl GpuDevice for DoublingDevice {
        async fn compile(&mut self, kernel_source: &str) -> Result<()> {
            *self.compiled.borrow_mut() = Some(kernel_source.to_string());
            Ok(())
        }

        async fn dispatch(&mut self, call: &KernelDispatch<'_>, memory: &mut [f32]) -> Result<()> {
            if self.fail_dispatch {
                return Err(RuntimeError::execution(call.entry, "device lost"));
            }
            let [x, y, len] = [call.meta_buffer[0], call.meta_buffer[1], call.meta_buffer[2]];
            for i in 0..len as usize {
                memory[y as usize + i] = memory[x as usize + i] * 2.0;
            }
            Ok(())
        }
    }

    struct FakeAdapter {
        available: bool,
        fail_dispatch: bool,
        compiled: Rc<RefCell<Option<String>>>,
    }

    #[async_trait(?Send)]
    impl GpuAdapter for FakeAdapter {
        fn name(&self) -> &str {
            "fake"
        }

        async fn request_device(&self) -> Result<Box<dyn GpuDevice>> {
            if !self.available {
                return Err(RuntimeError::DeviceUnavailable("no adapter".into()));
            }
            Ok(Box::new(DoublingDevice {
                compiled: self.compiled.clone(),
                fail_dispatch: self.fail_dispatch,
            }))
        }
    }

    #[derive(Default)]
    struct RecordingMonitor {
        events: RefCell<Vec<&'static str>>,
    }

    impl ExecutionMonitor for RecordingMonitor {
        fn run_started(&self, _kind: BackendKind) {
            self.events.borrow_mut().push("started");
        }

        fn run_completed(&self, _kind: BackendKind) {
            self.events.borrow_mut().push("completed");
        }
    }

    const GRAPH: &str = r#"{
        "inputs": ["x"],
        "outputs": ["y"],
        "kernel_source": "kernel void double(...) {}",
        "memory_layout": {
            "total_size": 5,
            "static_size": 1,
            "allocations": {
                "w": {"offset": 0, "size": 1},
                "x": {"offset": 1, "size": 2},
                "y": {"offset": 3, "size": 2}
            }
        },
        "exec_infos": [
            {
                "entry_func_name": "double",
                "inputs": ["x"],
                "outputs": ["y"],
                "meta_buffer": [1, 3, 2]
            }
        ]
    }"#;

    type Compiled = Rc<RefCell<Option<String>>>;

    fn fixture(fail_dispatch: bool) -> (GpuRunner, Rc<RecordingMonitor>, Compiled) {
        let fetcher = MemoryFetcher::new()
            .with_file("m/graph_gpu.json", GRAPH)
            .with_file("m/weight_gpu.bin", 1.5f32.to_le_bytes().to_vec());
        let monitor = Rc::new(RecordingMonitor::default());
        let compiled = Rc::new(RefCell::new(None));
        let adapter = Rc::new(FakeAdapter {
            available: true,
            fail_dispatch,
            compiled: compiled.clone(),
        });
        let context = RunnerContext::new(Rc::new(fetcher)).with_monitor(monitor.clone());
        (GpuRunner::new(adapter, context), monitor, compiled)
    }

    #[tokio::test]
    async fn test_load_compiles_and_runs() {
        let (mut runner, monitor, compiled) = fixture(false);
        runner.init().await.unwrap();
        runner.load("m", None).await.unwrap();

        assert_eq!(compiled.borrow().as_deref(), Some("kernel void double(...) {}"));

        runner.input_views()[0].set(&[1.0, 2.5]).unwrap();
        runner.run().await.unwrap();
        assert_eq!(runner.output_views()[0].to_vec().unwrap(), vec![2.0, 5.0]);

        runner.input_views()[0].set(&[3.0, 0.0]).unwrap();
        runner.run().await.unwrap();
        assert_eq!(runner.output_views()[0].to_vec().unwrap(), vec![6.0, 0.0]);

        assert_eq!(*monitor.events.borrow(), vec!["started", "completed", "started", "completed"]);
    }

    #[tokio::test]
    async fn test_failed_run_is_never_reported_complete() {
        let (mut runner, monitor, _) = fixture(true);
        runner.init().await.unwrap();
        runner.load("m", None).await.unwrap();

        assert!(matches!(runner.run().await, Err(RuntimeError::Execution { .. })));
        assert_eq!(*monitor.events.borrow(), vec!["started"]);
        // The arena survives a failed dispatch.
        assert_eq!(runner.input_views()[0].len(), 2);
        assert_eq!(runner.input_views()[0].to_vec().unwrap(), vec![0.0, 0.0]);
    }

    #[tokio::test]
    async fn test_init_fails_without_device() {
        let adapter = Rc::new(FakeAdapter {
            available: false,
            fail_dispatch: false,
            compiled: Rc::new(RefCell::new(None)),
        });
        let mut runner = GpuRunner::new(adapter, RunnerContext::new(Rc::new(MemoryFetcher::new())));
        assert!(matches!(runner.init().await, Err(RuntimeError::DeviceUnavailable(_))));
        assert!(matches!(runner.load("m", None).await, Err(RuntimeError::NotInitialized(_))));
    }

    #[tokio::test]
    async fn test_run_before_load() {
        let (mut runner, _, _) = fixture(false);
        runner.init().await.unwrap();
        assert!(runner.input_views().is_empty());
        assert!(matches!(runner.run().await, Err(RuntimeError::NotLoaded(_))));
    }
}
