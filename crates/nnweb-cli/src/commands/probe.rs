//! Probe command - report backend availability.

use std::rc::Rc;

use clap::Args;
use console::style;

use nnweb_core::{BackendKind, Dispatcher, Environment};

use super::Globals;
use crate::fetch::CliFetcher;

/// Arguments for the probe command.
#[derive(Args)]
pub struct ProbeArgs {
    /// Print machine-readable JSON
    #[arg(long)]
    json: bool,
}

pub fn run(args: ProbeArgs, globals: &Globals) -> anyhow::Result<()> {
    let config = globals.load_config()?;
    let dispatcher = Dispatcher::new(Rc::new(CliFetcher::new()?), Environment::native())
        .with_crash_tracker(globals.crash_tracker(&config));

    if let Some(notice) = dispatcher.crash_notice() {
        eprintln!("{} {}", style("⚠").yellow(), notice.message);
    }

    let availability = dispatcher.backend_availability();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&availability)?);
        return Ok(());
    }

    println!("{}", style("Backend availability").bold());
    println!();
    for kind in BackendKind::ALL {
        let marker = if availability.is_available(kind) {
            style("✓ available").green()
        } else {
            style("✗ unavailable").red()
        };
        println!("  {:<20} {}", style(kind.name()).cyan(), marker);
    }

    let order: Vec<_> = availability.default_order.iter().map(|k| k.name()).collect();
    println!();
    println!("Default order: {}", order.join(" → "));

    Ok(())
}
