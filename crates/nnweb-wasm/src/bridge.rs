//! GPU access through a JavaScript bridge object.
//!
//! The page supplies an object shaped like:
//!
//! ```js
//! const bridge = {
//!   name: "webgpu",
//!   async requestDevice() {
//!     return {
//!       async compile(source) { /* build pipelines */ },
//!       // memory: Float32Array, updated in place
//!       async dispatch(entry, grid, group, meta, memory) { /* run the kernel */ },
//!     };
//!   },
//! };
//! ```
//!
//! Memory crosses the boundary as a copied `Float32Array`; whatever the
//! bridge writes into it is copied back into the arena after the dispatch.

use async_trait::async_trait;
use js_sys::{Float32Array, Promise};
use wasm_bindgen::JsCast;
use wasm_bindgen::prelude::*;
use wasm_bindgen_futures::JsFuture;

use nnweb_core::runtime::Result;
use nnweb_core::{GpuAdapter, GpuDevice, KernelDispatch, RuntimeError};

type JsResult<T> = std::result::Result<T, JsValue>;

#[wasm_bindgen]
extern "C" {
    /// Page-provided GPU entry point.
    pub type GpuBridge;

    #[wasm_bindgen(method, getter)]
    fn name(this: &GpuBridge) -> Option<String>;

    #[wasm_bindgen(method, catch, js_name = requestDevice)]
    fn request_device(this: &GpuBridge) -> std::result::Result<Promise, JsValue>;

    /// Device returned by `requestDevice`.
    pub type GpuBridgeDevice;

    #[wasm_bindgen(method, catch)]
    fn compile(this: &GpuBridgeDevice, source: &str) -> std::result::Result<Promise, JsValue>;

    #[wasm_bindgen(method, catch)]
    fn dispatch(
        this: &GpuBridgeDevice,
        entry: &str,
        threadgroups_per_grid: &[u32],
        threads_per_thread_group: &[u32],
        meta_buffer: &[i32],
        memory: &Float32Array,
    ) -> std::result::Result<Promise, JsValue>;
}

/// Render a thrown JS value for error messages.
pub(crate) fn js_error(value: &JsValue) -> String {
    if let Some(error) = value.dyn_ref::<js_sys::Error>() {
        return String::from(error.message());
    }
    value.as_string().unwrap_or_else(|| format!("{:?}", value))
}

async fn settle(promise: JsResult<Promise>) -> JsResult<JsValue> {
    JsFuture::from(promise?).await
}

/// [`GpuAdapter`] backed by a [`GpuBridge`].
pub struct JsGpuAdapter {
    bridge: GpuBridge,
    name: String,
}

impl JsGpuAdapter {
    pub fn new(bridge: GpuBridge) -> Self {
        let name = bridge.name().unwrap_or_else(|| "js-bridge".to_string());
        Self { bridge, name }
    }
}

#[async_trait(?Send)]
impl GpuAdapter for JsGpuAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn request_device(&self) -> Result<Box<dyn GpuDevice>> {
        let device = settle(self.bridge.request_device())
            .await
            .map_err(|e| RuntimeError::DeviceUnavailable(js_error(&e)))?;
        if device.is_null() || device.is_undefined() {
            return Err(RuntimeError::DeviceUnavailable("bridge returned no device".into()));
        }
        Ok(Box::new(JsGpuDevice {
            device: device.unchecked_into(),
        }))
    }
}

struct JsGpuDevice {
    device: GpuBridgeDevice,
}

#[async_trait(?Send)]
impl GpuDevice for JsGpuDevice {
    async fn compile(&mut self, kernel_source: &str) -> Result<()> {
        settle(self.device.compile(kernel_source))
            .await
            .map_err(|e| RuntimeError::Compile(js_error(&e)))?;
        Ok(())
    }

    async fn dispatch(&mut self, call: &KernelDispatch<'_>, memory: &mut [f32]) -> Result<()> {
        let buffer = Float32Array::from(&memory[..]);
        settle(self.device.dispatch(
            call.entry,
            &call.threadgroups_per_grid,
            &call.threads_per_thread_group,
            call.meta_buffer,
            &buffer,
        ))
        .await
        .map_err(|e| RuntimeError::Execution {
            kernel: call.entry.to_string(),
            reason: js_error(&e),
        })?;

        buffer.copy_to(memory);
        Ok(())
    }
}
