//! Crash command - inspect or clear persisted GPU crash state.

use clap::{Args, Subcommand};
use console::style;

use nnweb_core::{CrashStatus, CrashTracker};

use super::Globals;

/// Arguments for the crash command.
#[derive(Args)]
pub struct CrashArgs {
    #[command(subcommand)]
    command: CrashCommand,
}

#[derive(Subcommand)]
enum CrashCommand {
    /// Show the persisted GPU crash status
    Status,

    /// Clear the crash status so the GPU is tried again
    Reset,
}

pub fn run(args: CrashArgs, globals: &Globals) -> anyhow::Result<()> {
    let config = globals.load_config()?;
    let path = globals.state_path(&config);
    let tracker = CrashTracker::attach(globals.state_store(&config));

    match args.command {
        CrashCommand::Status => {
            let status = tracker.status();
            let styled = match status {
                CrashStatus::Crashed | CrashStatus::Running => style(status.as_str()).red(),
                CrashStatus::Completed => style(status.as_str()).green(),
                CrashStatus::None => style(status.as_str()).dim(),
            };
            println!("State file:  {}", path.display());
            println!("GPU status:  {}", styled);
            println!("Alert shown: {}", tracker.alert_shown());

            if status == CrashStatus::Crashed {
                println!();
                println!("Run 'nnweb crash reset' to allow the GPU backend again.");
            }
        }
        CrashCommand::Reset => {
            tracker.reset()?;
            println!("{} GPU crash status cleared", style("✓").green());
        }
    }

    Ok(())
}
