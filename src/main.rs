//! nnrt - CLI

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use nnrt::runtime::device::DeviceManager;
use nnrt::util::config::{load_config, RuntimeConfig};
use nnrt::util::logger;
use nnrt::{PlaceholderBindings, NAME, VERSION};
use std::fs;
use std::path::{Path, PathBuf};

/// Host-side runtime for partitioned neural network programs
#[derive(Parser, Debug)]
#[command(name = "nnrt")]
#[command(version = VERSION)]
#[command(about = NAME, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List the devices described by a config file
    Devices {
        /// Config file
        #[arg(short, long, value_name = "FILE")]
        config: PathBuf,
    },

    /// Provision the program of a config file and print its placements
    Plan {
        /// Config file
        #[arg(short, long, value_name = "FILE")]
        config: PathBuf,
    },

    /// Provision the program of a config file and run one request
    Run {
        /// Config file
        #[arg(short, long, value_name = "FILE")]
        config: PathBuf,

        /// Write collected trace events as Chrome trace JSON
        #[arg(long, value_name = "FILE")]
        trace_out: Option<PathBuf>,
    },

    /// Print version information
    Version,
}

fn main() -> Result<()> {
    let args = Args::parse();

    if args.verbose {
        logger::init_debug();
    } else {
        logger::init();
    }

    match args.command {
        Commands::Devices { config } => {
            let config = read_config(&config)?;
            for (id, device) in config.build_devices() {
                println!(
                    "{:>3}  {:<12} {:>14} bytes",
                    id,
                    device.name(),
                    device.capacity()
                );
            }
        }
        Commands::Plan { config } => {
            let config = read_config(&config)?;
            let plan = nnrt::plan(&config)?;
            for (task, placement) in plan.placements() {
                println!(
                    "{:<24} device {:>3} {:>14} bytes",
                    task, placement.device, placement.bytes
                );
            }
            for (id, device) in plan.provisioner.devices() {
                println!(
                    "device {:>3}: {} of {} bytes used",
                    id,
                    device.used_memory(),
                    device.capacity()
                );
            }
        }
        Commands::Run { config, trace_out } => {
            let config = read_config(&config)?;
            let outcome = nnrt::run(&config, PlaceholderBindings::new())?;
            for report in &outcome.reports {
                for record in report.tasks() {
                    println!(
                        "{:<12} {:<24} {:<10} {:>8} us",
                        report.schedule,
                        record.name,
                        record.state,
                        record.elapsed_us.unwrap_or(0)
                    );
                }
            }
            if let Some(path) = trace_out {
                let trace = outcome
                    .trace
                    .context("Tracing is disabled in the config")?;
                let json = trace
                    .to_chrome_json()
                    .context("Failed to serialize trace")?;
                fs::write(&path, json)
                    .with_context(|| format!("Failed to write trace: {}", path.display()))?;
            }
        }
        Commands::Version => {
            println!("{} {}", NAME, VERSION);
        }
    }

    Ok(())
}

fn read_config(path: &Path) -> Result<RuntimeConfig> {
    load_config(path).with_context(|| format!("Failed to load config: {}", path.display()))
}
