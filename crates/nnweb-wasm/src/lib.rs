//! WASM bindings for nnweb.
//!
//! ```js
//! import init, { initialize, setGpuBridge } from 'nnweb';
//!
//! await init();
//! setGpuBridge(myWebGpuBridge); // optional
//! const runner = await initialize('models/resnet', {
//!   backendOrder: ['gpu', 'portable-bytecode'],
//!   progressCallback: (loaded, total) => console.log(loaded, total),
//! });
//! runner.setInput(0, new Float32Array(pixels));
//! await runner.run();
//! const scores = runner.getOutput(0);
//! ```

mod bridge;
mod storage;

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt::Display;
use std::rc::Rc;

use js_sys::{Function, Promise, Reflect};
use serde::{Deserialize, Serialize};
use tracing::warn;
use wasm_bindgen::JsCast;
use wasm_bindgen::prelude::*;

use nnweb_core::{
    BackendKind, BackendOrder, CrashTracker, Dispatcher, Environment, HttpFetcher, InitOption,
    MemoryStateStore, Runner, StateStore, TensorView,
};

pub use bridge::{GpuBridge, JsGpuAdapter};
pub use storage::LocalStorageStore;

use bridge::js_error;

thread_local! {
    static GPU_BRIDGE: RefCell<Option<Rc<JsGpuAdapter>>> = const { RefCell::new(None) };
    static SESSION: RefCell<Option<Rc<CrashTracker>>> = const { RefCell::new(None) };
}

/// Initialize panic hook for better error messages in console.
#[wasm_bindgen(start)]
pub fn init() {
    #[cfg(feature = "console_error_panic_hook")]
    console_error_panic_hook::set_once();
}

/// Version information.
#[wasm_bindgen]
pub fn version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn to_js(err: impl Display) -> JsValue {
    JsValue::from_str(&err.to_string())
}

/// Register the page's GPU bridge. Without one the GPU backend is unavailable.
#[wasm_bindgen(js_name = setGpuBridge)]
pub fn set_gpu_bridge(bridge: GpuBridge) {
    let adapter = Rc::new(JsGpuAdapter::new(bridge));
    GPU_BRIDGE.with(|slot| *slot.borrow_mut() = Some(adapter));
}

#[wasm_bindgen(js_name = clearGpuBridge)]
pub fn clear_gpu_bridge() {
    GPU_BRIDGE.with(|slot| *slot.borrow_mut() = None);
}

/// Whether `globalThis.a.b...` exists and is not null.
fn has_global(path: &[&str]) -> bool {
    let mut current: JsValue = js_sys::global().into();
    for key in path {
        match Reflect::get(&current, &JsValue::from_str(key)) {
            Ok(value) if !value.is_undefined() && !value.is_null() => current = value,
            _ => return false,
        }
    }
    true
}

fn environment() -> Environment {
    let mut env = Environment::native();
    env.bytecode_vm &= has_global(&["WebAssembly"]);
    if has_global(&["navigator", "gpu"]) {
        if let Some(adapter) = GPU_BRIDGE.with(|slot| slot.borrow().clone()) {
            env = env.with_gpu(adapter);
        }
    }
    env
}

/// The page's crash-tracking session, started on first use.
fn crash_tracker() -> Rc<CrashTracker> {
    SESSION.with(|slot| {
        slot.borrow_mut()
            .get_or_insert_with(|| {
                let store: Rc<dyn StateStore> = match LocalStorageStore::open() {
                    Ok(store) => Rc::new(store),
                    Err(e) => {
                        warn!("GPU crash state will not persist: {}", e);
                        Rc::new(MemoryStateStore::new())
                    }
                };
                let tracker = CrashTracker::begin_session(store);
                if let Some(notice) = tracker.notice() {
                    web_sys::console::warn_1(&JsValue::from_str(&notice.message));
                }
                Rc::new(tracker)
            })
            .clone()
    })
}

fn dispatcher() -> Dispatcher {
    Dispatcher::new(Rc::new(HttpFetcher::new()), environment()).with_crash_tracker(crash_tracker())
}

/// Resolve `directory` against the page URL so the fetcher gets an absolute URL.
fn resolve_directory(directory: &str) -> String {
    let base = web_sys::window().and_then(|w| w.location().href().ok());
    match base.and_then(|base| web_sys::Url::new_with_base(directory, &base).ok()) {
        Some(url) => url.href(),
        None => directory.to_string(),
    }
}

/// Backend availability as `{ status: { gpu, "portable-bytecode", fallback }, default_order }`.
#[wasm_bindgen(js_name = getBackendAvailability)]
pub fn get_backend_availability() -> Result<JsValue, JsValue> {
    dispatcher()
        .backend_availability()
        .serialize(&serde_wasm_bindgen::Serializer::json_compatible())
        .map_err(to_js)
}

/// Message shown once after the GPU backend crashed in an earlier session.
#[wasm_bindgen(js_name = getCrashNotice)]
pub fn get_crash_notice() -> Option<String> {
    crash_tracker().notice().map(|n| n.message.clone())
}

/// Allow the GPU backend again from the next page load.
#[wasm_bindgen(js_name = resetCrashStatus)]
pub fn reset_crash_status() -> Result<(), JsValue> {
    crash_tracker().reset().map_err(to_js)
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct JsInitOptions {
    backend_order: Option<BackendNames>,
    backend_options: BTreeMap<String, serde_json::Value>,
    ignore_cache: bool,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum BackendNames {
    One(String),
    Many(Vec<String>),
}

fn parse_kind(name: &str) -> Result<BackendKind, JsValue> {
    name.parse().map_err(to_js)
}

fn function_field(options: &JsValue, key: &str) -> Result<Option<Function>, JsValue> {
    let value = Reflect::get(options, &JsValue::from_str(key))?;
    if value.is_undefined() || value.is_null() {
        return Ok(None);
    }
    value
        .dyn_into::<Function>()
        .map(Some)
        .map_err(|_| JsValue::from_str(&format!("{} must be a function", key)))
}

/// Convert the JS options object into an [`InitOption`].
fn parse_options(options: &JsValue) -> Result<InitOption, JsValue> {
    if options.is_undefined() || options.is_null() {
        return Ok(InitOption::new());
    }

    let parsed: JsInitOptions = serde_wasm_bindgen::from_value(options.clone())?;
    let mut option = InitOption::new().with_ignore_cache(parsed.ignore_cache);

    if let Some(names) = parsed.backend_order {
        let order = match names {
            BackendNames::One(name) => BackendOrder::Single(parse_kind(&name)?),
            BackendNames::Many(names) => BackendOrder::Sequence(
                names.iter().map(|n| parse_kind(n)).collect::<Result<_, _>>()?,
            ),
        };
        option = option.with_backend_order(order);
    }

    for (name, value) in parsed.backend_options {
        option = option.with_backend_option(parse_kind(&name)?, value);
    }

    if let Some(callback) = function_field(options, "progressCallback")? {
        option = option.with_progress(move |loaded, total| {
            let loaded = JsValue::from_f64(loaded as f64);
            let total = JsValue::from_f64(total as f64);
            if let Err(e) = callback.call2(&JsValue::NULL, &loaded, &total) {
                warn!("progressCallback threw: {}", js_error(&e));
            }
        });
    }

    if let Some(transform) = function_field(options, "transformUrlDelegate")? {
        option = option.with_url_transform(move |url| {
            match transform.call1(&JsValue::NULL, &JsValue::from_str(url)) {
                Ok(value) => value.as_string().unwrap_or_else(|| url.to_string()),
                Err(e) => {
                    warn!("transformUrlDelegate threw: {}", js_error(&e));
                    url.to_string()
                }
            }
        });
    }

    Ok(option)
}

/// Load the model in `directory` on the first backend that works.
///
/// `options` fields: `backendOrder` (name or array), `backendOptions`
/// (per-backend objects keyed by name), `ignoreCache`, `progressCallback`
/// and `transformUrlDelegate`.
#[wasm_bindgen]
pub async fn initialize(directory: String, options: JsValue) -> Result<WasmRunner, JsValue> {
    let option = parse_options(&options)?;
    let runner = dispatcher()
        .initialize(&resolve_directory(&directory), option)
        .await
        .map_err(to_js)?;
    Ok(WasmRunner::new(runner))
}

/// A loaded model bound to one backend.
#[wasm_bindgen]
pub struct WasmRunner {
    runner: Rc<RefCell<Option<Box<dyn Runner>>>>,
    backend: &'static str,
    inputs: Vec<TensorView>,
    outputs: Vec<TensorView>,
}

impl WasmRunner {
    pub fn new(runner: Box<dyn Runner>) -> Self {
        Self {
            backend: runner.backend_name(),
            inputs: runner.input_views(),
            outputs: runner.output_views(),
            runner: Rc::new(RefCell::new(Some(runner))),
        }
    }

    fn view<'a>(
        views: &'a [TensorView],
        index: usize,
        what: &str,
    ) -> Result<&'a TensorView, JsValue> {
        views.get(index).ok_or_else(|| {
            let available = views.len();
            JsValue::from_str(&format!(
                "{} index {} out of range ({} available)",
                what, index, available
            ))
        })
    }
}

#[wasm_bindgen]
impl WasmRunner {
    #[wasm_bindgen(getter, js_name = backendName)]
    pub fn backend_name(&self) -> String {
        self.backend.to_string()
    }

    #[wasm_bindgen(js_name = inputNames)]
    pub fn input_names(&self) -> Vec<String> {
        self.inputs.iter().map(|v| v.name().to_string()).collect()
    }

    #[wasm_bindgen(js_name = outputNames)]
    pub fn output_names(&self) -> Vec<String> {
        self.outputs.iter().map(|v| v.name().to_string()).collect()
    }

    #[wasm_bindgen(js_name = inputShape)]
    pub fn input_shape(&self, index: usize) -> Result<Vec<u32>, JsValue> {
        let view = Self::view(&self.inputs, index, "input")?;
        Ok(view.shape().iter().map(|&d| d as u32).collect())
    }

    #[wasm_bindgen(js_name = outputShape)]
    pub fn output_shape(&self, index: usize) -> Result<Vec<u32>, JsValue> {
        let view = Self::view(&self.outputs, index, "output")?;
        Ok(view.shape().iter().map(|&d| d as u32).collect())
    }

    /// Copy `data` into input `index`.
    #[wasm_bindgen(js_name = setInput)]
    pub fn set_input(&self, index: usize, data: &[f32]) -> Result<(), JsValue> {
        Self::view(&self.inputs, index, "input")?.set(data).map_err(to_js)
    }

    /// Copy of output `index` as a `Float32Array`.
    #[wasm_bindgen(js_name = getOutput)]
    pub fn get_output(&self, index: usize) -> Result<Vec<f32>, JsValue> {
        Self::view(&self.outputs, index, "output")?.to_vec().map_err(to_js)
    }

    /// Execute the model once. Rejects if another run is still pending.
    pub fn run(&self) -> Promise {
        let slot = self.runner.clone();
        wasm_bindgen_futures::future_to_promise(async move {
            let mut runner = slot
                .borrow_mut()
                .take()
                .ok_or_else(|| JsValue::from_str("a run is already in progress"))?;
            let result = runner.run().await;
            *slot.borrow_mut() = Some(runner);
            result.map(|_| JsValue::UNDEFINED).map_err(to_js)
        })
    }
}
