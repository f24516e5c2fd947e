//! Portable bytecode runner executing ONNX models with Tract.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use tract_onnx::Onnx;
use tract_onnx::prelude::*;

use super::{Runner, RunnerContext};
use crate::error::RuntimeError;
use crate::fetch::ProgressCallback;
use crate::tensor::TensorView;
use crate::{BackendKind, Result};

const MODEL_FILE: &str = "graph_bytecode.onnx";
const NAME: &str = "portable-bytecode";

/// Input element types the runner can feed from `f32` views.
const INPUT_TYPES: [DatumType; 3] = [DatumType::F32, DatumType::I64, DatumType::I32];

type Plan = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// Per-backend options accepted by [`BytecodeRunner`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BytecodeOptions {
    /// Concrete shapes for the model inputs, replacing dynamic dimensions.
    pub input_shapes: Vec<Vec<usize>>,
}

impl BytecodeOptions {
    /// Interpret an opaque option blob; `null` means defaults.
    pub fn from_value(value: &serde_json::Value) -> Result<Self> {
        if value.is_null() {
            return Ok(Self::default());
        }
        Ok(serde_json::from_value(value.clone())?)
    }
}

struct LoadedModel {
    plan: Plan,
    input_types: Vec<DatumType>,
    inputs: Vec<TensorView>,
    outputs: Vec<TensorView>,
}

/// Runner for the portable bytecode backend.
pub struct BytecodeRunner {
    context: RunnerContext,
    options: BytecodeOptions,
    framework: Option<Onnx>,
    model: Option<LoadedModel>,
    ignore_cache: bool,
}

impl BytecodeRunner {
    pub fn new(context: RunnerContext, options: BytecodeOptions) -> Self {
        Self {
            context,
            options,
            framework: None,
            model: None,
            ignore_cache: false,
        }
    }

    fn compile(framework: &Onnx, options: &BytecodeOptions, bytes: &[u8]) -> Result<LoadedModel> {
        let mut model = framework
            .model_for_read(&mut std::io::Cursor::new(bytes))
            .map_err(|e| RuntimeError::Model(format!("failed to parse model: {}", e)))?;

        for (idx, shape) in options.input_shapes.iter().enumerate() {
            let fact = InferenceFact::dt_shape(f32::datum_type(), shape.as_slice());
            model.set_input_fact(idx, fact).map_err(|e| {
                RuntimeError::Model(format!("failed to set input shape {}: {}", idx, e))
            })?;
        }

        let model = model
            .into_optimized()
            .map_err(|e| RuntimeError::Model(format!("failed to optimize: {}", e)))?;

        let (inputs, input_types) = Self::views(&model, &model.inputs)?;
        let (outputs, _) = Self::views(&model, &model.outputs)?;

        for (view, datum_type) in inputs.iter().zip(&input_types) {
            if !INPUT_TYPES.contains(datum_type) {
                return Err(RuntimeError::Model(format!(
                    "input '{}' has unsupported element type {:?}",
                    view.name(),
                    datum_type
                )));
            }
        }

        let plan = model
            .into_runnable()
            .map_err(|e| RuntimeError::Model(format!("failed to build plan: {}", e)))?;

        Ok(LoadedModel {
            plan,
            input_types,
            inputs,
            outputs,
        })
    }

    /// One owned view per outlet, plus the outlet's element type. Shapes must
    /// be concrete after optimization.
    fn views(
        model: &TypedModel,
        outlets: &[OutletId],
    ) -> Result<(Vec<TensorView>, Vec<DatumType>)> {
        let mut views = Vec::with_capacity(outlets.len());
        let mut types = Vec::with_capacity(outlets.len());
        for outlet in outlets {
            let name = model
                .outlet_label(*outlet)
                .map(str::to_string)
                .unwrap_or_else(|| model.node(outlet.node).name.clone());
            let fact = model
                .outlet_fact(*outlet)
                .map_err(|e| RuntimeError::Model(e.to_string()))?;
            let shape = fact.shape.as_concrete().ok_or_else(|| {
                RuntimeError::Model(format!(
                    "'{}' has a dynamic shape; set input_shapes in the backend options",
                    name
                ))
            })?;
            types.push(fact.datum_type);
            views.push(TensorView::owned(name, shape.to_vec()));
        }
        Ok((views, types))
    }

    fn to_tvalue(view: &TensorView, datum_type: DatumType) -> Result<TValue> {
        let shape = tract_ndarray::IxDyn(view.shape());
        let data = view.to_vec()?;
        let tensor = match datum_type {
            DatumType::I64 => {
                let data = data.iter().map(|v| *v as i64).collect();
                tract_ndarray::ArrayD::<i64>::from_shape_vec(shape, data).map(|a| a.into_tensor())
            }
            DatumType::I32 => {
                let data = data.iter().map(|v| *v as i32).collect();
                tract_ndarray::ArrayD::<i32>::from_shape_vec(shape, data).map(|a| a.into_tensor())
            }
            _ => tract_ndarray::ArrayD::from_shape_vec(shape, data).map(|a| a.into_tensor()),
        }
        .map_err(|e| RuntimeError::InvalidInput(e.to_string()))?;
        Ok(tensor.into_tvalue())
    }
}

impl fmt::Debug for BytecodeRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BytecodeRunner")
            .field("options", &self.options)
            .field("initialized", &self.framework.is_some())
            .field("loaded", &self.model.is_some())
            .finish()
    }
}

#[async_trait(?Send)]
impl Runner for BytecodeRunner {
    fn kind(&self) -> BackendKind {
        BackendKind::Bytecode
    }

    fn ignore_cache(&self) -> bool {
        self.ignore_cache
    }

    fn set_ignore_cache(&mut self, ignore_cache: bool) {
        self.ignore_cache = ignore_cache;
    }

    async fn init(&mut self) -> Result<()> {
        debug!("Preparing ONNX framework");
        self.framework = Some(tract_onnx::onnx());
        Ok(())
    }

    async fn load(&mut self, directory: &str, progress: Option<ProgressCallback>) -> Result<()> {
        let framework = self
            .framework
            .as_ref()
            .ok_or(RuntimeError::NotInitialized(NAME))?;
        let source = self.context.source(directory, self.ignore_cache);
        let bytes = source.fetch(MODEL_FILE, progress.as_ref()).await?;

        debug!("Compiling ONNX model from {} bytes", bytes.len());
        let model = Self::compile(framework, &self.options, &bytes)?;
        info!(
            "Loaded bytecode model from {} ({} inputs, {} outputs)",
            source.directory(),
            model.inputs.len(),
            model.outputs.len()
        );

        self.model = Some(model);
        Ok(())
    }

    fn input_views(&self) -> Vec<TensorView> {
        self.model
            .as_ref()
            .map(|m| m.inputs.clone())
            .unwrap_or_default()
    }

    fn output_views(&self) -> Vec<TensorView> {
        self.model
            .as_ref()
            .map(|m| m.outputs.clone())
            .unwrap_or_default()
    }

    async fn run(&mut self) -> Result<()> {
        let model = self.model.as_ref().ok_or(RuntimeError::NotLoaded(NAME))?;

        let inputs: TVec<TValue> = model
            .inputs
            .iter()
            .zip(&model.input_types)
            .map(|(view, datum_type)| Self::to_tvalue(view, *datum_type))
            .collect::<Result<TVec<_>>>()?;

        let results = model
            .plan
            .run(inputs)
            .map_err(|e| RuntimeError::execution(NAME, e))?;

        for (view, result) in model.outputs.iter().zip(results.iter()) {
            let output_error = |e: TractError| {
                RuntimeError::execution(NAME, format!("output '{}': {}", view.name(), e))
            };
            let values = result.cast_to::<f32>().map_err(output_error)?;
            let array = values.to_array_view::<f32>().map_err(output_error)?;
            if array.len() != view.len() {
                return Err(RuntimeError::execution(
                    NAME,
                    format!(
                        "output '{}' has {} elements, view holds {}",
                        view.name(),
                        array.len(),
                        view.len()
                    ),
                ));
            }
            view.with_mut(|dst| {
                for (d, s) in dst.iter_mut().zip(array.iter()) {
                    *d = *s;
                }
            })?;
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
    use std::rc::Rc;

    /// Minimal protobuf writer for building ONNX models in tests.
    mod onnx {
        pub const FLOAT: u64 = 1;
        pub const INT64: u64 = 7;
        pub const BOOL: u64 = 9;

        pub enum Dim {
            Fixed(u64),
            Named(&'static str),
        }

        fn varint(mut value: u64, out: &mut Vec<u8>) {
            loop {
                let byte = (value & 0x7f) as u8;
                value >>= 7;
                if value == 0 {
                    out.push(byte);
                    return;
                }
                out.push(byte | 0x80);
            }
        }

        fn int(field: u64, value: u64) -> Vec<u8> {
            let mut out = Vec::new();
            varint(field << 3, &mut out);
            varint(value, &mut out);
            out
        }

        fn bytes(field: u64, payload: &[u8]) -> Vec<u8> {
            let mut out = Vec::new();
            varint((field << 3) | 2, &mut out);
            varint(payload.len() as u64, &mut out);
            out.extend_from_slice(payload);
            out
        }

        pub fn value_info(name: &str, elem_type: u64, dims: &[Dim]) -> Vec<u8> {
            let shape: Vec<u8> = dims
                .iter()
                .flat_map(|dim| {
                    let value = match dim {
                        Dim::Fixed(n) => int(1, *n),
                        Dim::Named(symbol) => bytes(2, symbol.as_bytes()),
                    };
                    bytes(1, &value)
                })
                .collect();
            let tensor = [int(1, elem_type), bytes(2, &shape)].concat();
            [bytes(1, name.as_bytes()), bytes(2, &bytes(1, &tensor))].concat()
        }

        /// `Cast` attribute `to`.
        pub fn cast_to(elem_type: u64) -> Vec<u8> {
            [bytes(1, b"to"), int(3, elem_type), int(20, 2)].concat()
        }

        /// A single-node graph from `x` to `y`.
        pub fn model(op: &str, attributes: &[Vec<u8>], input: &[u8], output: &[u8]) -> Vec<u8> {
            let mut node = [
                bytes(1, b"x"),
                bytes(2, b"y"),
                bytes(3, b"y"),
                bytes(4, op.as_bytes()),
            ]
            .concat();
            for attribute in attributes {
                node.extend(bytes(5, attribute));
            }
            let graph = [
                bytes(1, &node),
                bytes(2, b"graph"),
                bytes(11, input),
                bytes(12, output),
            ]
            .concat();
            [int(1, 7), bytes(7, &graph), bytes(8, &int(2, 13))].concat()
        }
    }

    use onnx::Dim::{Fixed, Named};

    fn relu_model(dims: &[onnx::Dim]) -> Vec<u8> {
        onnx::model(
            "Relu",
            &[],
            &onnx::value_info("x", onnx::FLOAT, dims),
            &onnx::value_info("y", onnx::FLOAT, dims),
        )
    }

    fn runner(model: Vec<u8>, options: BytecodeOptions) -> BytecodeRunner {
        let fetcher = MemoryFetcher::new().with_file("m/graph_bytecode.onnx", model);
        BytecodeRunner::new(RunnerContext::new(Rc::new(fetcher)), options)
    }

    #[test]
    fn test_options_from_value() {
        assert_eq!(
            BytecodeOptions::from_value(&serde_json::Value::Null).unwrap(),
            BytecodeOptions::default()
        );

        let options =
            BytecodeOptions::from_value(&json!({"input_shapes": [[1, 3, 8, 8]]})).unwrap();
        assert_eq!(options.input_shapes, vec![vec![1, 3, 8, 8]]);

        assert!(BytecodeOptions::from_value(&json!({"input_shapes": "big"})).is_err());
    }

    #[tokio::test]
    async fn test_runs_relu_model() {
        let mut runner = runner(relu_model(&[Fixed(1), Fixed(3)]), BytecodeOptions::default());
        runner.init().await.unwrap();
        runner.load("m", None).await.unwrap();

        let input = runner.input_views()[0].clone();
        let output = runner.output_views()[0].clone();
        assert_eq!(input.name(), "x");
        assert_eq!(input.shape(), &[1, 3]);
        assert_eq!(output.name(), "y");
        assert_eq!(output.shape(), &[1, 3]);

        input.set(&[-1.0, 0.0, 2.0]).unwrap();
        runner.run().await.unwrap();
        assert_eq!(output.to_vec().unwrap(), vec![0.0, 0.0, 2.0]);

        // Re-running picks up the new input contents.
        input.set(&[3.0, -4.0, 5.0]).unwrap();
        runner.run().await.unwrap();
        assert_eq!(output.to_vec().unwrap(), vec![3.0, 0.0, 5.0]);
    }

    #[tokio::test]
    async fn test_input_shapes_fix_dynamic_dims() {
        let model = relu_model(&[Named("N"), Fixed(3)]);

        let mut unsized_runner = runner(model.clone(), BytecodeOptions::default());
        unsized_runner.init().await.unwrap();
        let err = unsized_runner.load("m", None).await.unwrap_err();
        assert!(matches!(err, RuntimeError::Model(msg) if msg.contains("input_shapes")));

        let options = BytecodeOptions {
            input_shapes: vec![vec![2, 3]],
        };
        let mut runner = runner(model, options);
        runner.init().await.unwrap();
        runner.load("m", None).await.unwrap();

        assert_eq!(runner.input_views()[0].shape(), &[2, 3]);
        assert_eq!(runner.output_views()[0].shape(), &[2, 3]);

        runner.input_views()[0]
            .set(&[1.0, -1.0, 2.0, -2.0, 3.0, -3.0])
            .unwrap();
        runner.run().await.unwrap();
        assert_eq!(
            runner.output_views()[0].to_vec().unwrap(),
            vec![1.0, 0.0, 2.0, 0.0, 3.0, 0.0]
        );
    }

    #[tokio::test]
    async fn test_int64_inputs_are_converted() {
        let model = onnx::model(
            "Cast",
            &[onnx::cast_to(onnx::FLOAT)],
            &onnx::value_info("x", onnx::INT64, &[Fixed(3)]),
            &onnx::value_info("y", onnx::FLOAT, &[Fixed(3)]),
        );
        let mut runner = runner(model, BytecodeOptions::default());
        runner.init().await.unwrap();
        runner.load("m", None).await.unwrap();

        runner.input_views()[0].set(&[1.0, -2.0, 3.0]).unwrap();
        runner.run().await.unwrap();
        assert_eq!(runner.output_views()[0].to_vec().unwrap(), vec![1.0, -2.0, 3.0]);
    }

    #[tokio::test]
    async fn test_unsupported_input_type_fails_load() {
        let model = onnx::model(
            "Cast",
            &[onnx::cast_to(onnx::FLOAT)],
            &onnx::value_info("x", onnx::BOOL, &[Fixed(2)]),
            &onnx::value_info("y", onnx::FLOAT, &[Fixed(2)]),
        );
        let mut runner = runner(model, BytecodeOptions::default());
        runner.init().await.unwrap();

        let err = runner.load("m", None).await.unwrap_err();
        assert!(matches!(err, RuntimeError::Model(msg) if msg.contains("'x'")));
        assert!(runner.input_views().is_empty());
    }

    #[tokio::test]
    async fn test_load_requires_init() {
        let mut runner = runner(relu_model(&[Fixed(3)]), BytecodeOptions::default());
        assert!(matches!(
            runner.load("m", None).await,
            Err(RuntimeError::NotInitialized(_))
        ));

        runner.init().await.unwrap();
        runner.load("m", None).await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_model_fails_load() {
        let mut runner = runner(b"not a protobuf".to_vec(), BytecodeOptions::default());
        runner.init().await.unwrap();

        assert!(matches!(runner.load("m", None).await, Err(RuntimeError::Model(_))));
        assert!(runner.input_views().is_empty());
        assert!(matches!(runner.run().await, Err(RuntimeError::NotLoaded(_))));
    }

    #[tokio::test]
    async fn test_missing_model_is_a_fetch_error() {
        let mut runner = BytecodeRunner::new(
            RunnerContext::new(Rc::new(MemoryFetcher::new())),
            BytecodeOptions::default(),
        );
        runner.init().await.unwrap();
        assert!(matches!(
            runner.load("m", None).await,
            Err(RuntimeError::Fetch { .. })
        ));
    }
}
