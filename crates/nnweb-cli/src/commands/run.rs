//! Run command - load a model directory and execute it once.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Instant;

use clap::Args;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use serde_json::Value;
use tracing::info;

use nnweb_core::{BackendKind, Dispatcher, Environment, TensorView};

use super::{Globals, model_directory};
use crate::fetch::CliFetcher;

/// Arguments for the run command.
#[derive(Args)]
pub struct RunArgs {
    /// Model directory (path or URL)
    #[arg(required = true)]
    directory: String,

    /// Backend to try, in order; may be repeated (fallback is always last)
    #[arg(short, long = "backend")]
    backends: Vec<String>,

    /// Bypass HTTP caches while loading
    #[arg(long)]
    no_cache: bool,

    /// JSON file with input data: an object keyed by input name, or an
    /// array in input order
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Output file (default: stdout)
    #[arg(short, long)]
    output: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
struct RunReport {
    backend: &'static str,
    elapsed_ms: u128,
    outputs: BTreeMap<String, OutputTensor>,
}

#[derive(Debug, Serialize)]
struct OutputTensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

pub async fn run(args: RunArgs, globals: &Globals) -> anyhow::Result<()> {
    let config = globals.load_config()?;
    let directory = model_directory(&args.directory)?;

    let mut option = config.init_option()?;
    if !args.backends.is_empty() {
        let order = args
            .backends
            .iter()
            .map(|name| name.parse::<BackendKind>())
            .collect::<Result<Vec<_>, _>>()?;
        option = option.with_backend_order(order);
    }
    if args.no_cache {
        option = option.with_ignore_cache(true);
    }

    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} {msg} [{bar:30.cyan/blue}] {bytes}/{total_bytes}")?
            .progress_chars("##-"),
    );
    pb.set_message("Loading model");
    let progress = pb.clone();
    option = option.with_progress(move |loaded, total| {
        progress.set_length(total);
        progress.set_position(loaded);
    });

    let dispatcher = Dispatcher::new(Rc::new(CliFetcher::new()?), Environment::native())
        .with_crash_tracker(globals.crash_tracker(&config));

    if let Some(notice) = dispatcher.crash_notice() {
        pb.suspend(|| eprintln!("{} {}", style("⚠").yellow(), notice.message));
    }

    let start = Instant::now();
    let runner = dispatcher.initialize(&directory, option).await;
    pb.finish_and_clear();
    let mut runner = runner?;

    info!("Loaded {} on {} backend", directory, runner.backend_name());

    if let Some(input_path) = &args.input {
        let inputs: Value = serde_json::from_str(&fs::read_to_string(input_path)?)?;
        fill_inputs(&runner.input_views(), &inputs)?;
    }

    runner.run().await?;

    let outputs: BTreeMap<String, OutputTensor> = runner
        .output_views()
        .iter()
        .map(|view| {
            let tensor = OutputTensor {
                shape: view.shape().to_vec(),
                data: view.to_vec()?,
            };
            Ok((view.name().to_string(), tensor))
        })
        .collect::<nnweb_core::runtime::Result<_>>()?;

    let report = RunReport {
        backend: runner.backend_name(),
        elapsed_ms: start.elapsed().as_millis(),
        outputs,
    };
    let json = serde_json::to_string_pretty(&report)?;

    if let Some(output_path) = &args.output {
        fs::write(output_path, &json)?;
        println!(
            "{} Output written to {}",
            style("✓").green(),
            output_path.display()
        );
    } else {
        println!("{}", json);
    }

    Ok(())
}

/// Copy JSON input data into the runner's input views.
fn fill_inputs(views: &[TensorView], inputs: &Value) -> anyhow::Result<()> {
    match inputs {
        Value::Object(map) => {
            for (name, data) in map {
                let view = views
                    .iter()
                    .find(|v| v.name() == name)
                    .ok_or_else(|| anyhow::anyhow!("Model has no input named '{}'", name))?;
                view.set(&parse_data(name, data)?)?;
            }
        }
        Value::Array(items) => {
            if items.len() != views.len() {
                anyhow::bail!("Expected {} inputs, got {}", views.len(), items.len());
            }
            for (view, data) in views.iter().zip(items) {
                view.set(&parse_data(view.name(), data)?)?;
            }
        }
        _ => anyhow::bail!("Input file must contain a JSON object or array"),
    }
    Ok(())
}

fn parse_data(name: &str, data: &Value) -> anyhow::Result<Vec<f32>> {
    let mut values = Vec::new();
    flatten(data, &mut values)
        .ok_or_else(|| anyhow::anyhow!("Input '{}' must be a (nested) array of numbers", name))?;
    Ok(values)
}

fn flatten(value: &Value, out: &mut Vec<f32>) -> Option<()> {
    match value {
        Value::Number(n) => out.push(n.as_f64()? as f32),
        Value::Array(items) => {
            for item in items {
                flatten(item, out)?;
            }
        }
        _ => return None,
    }
    Some(())
}
