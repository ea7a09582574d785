use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use kernelpipe::accel::{AccelerationPipeline, PipelineError};
use kernelpipe::config::{LoggingConfig, PipelineConfig};
use kernelpipe::runtime::{self, ComputeRuntime, DeviceClass, FaultInjector, RuntimeOp};

#[derive(Parser)]
#[command(
    name = "kernelpipe",
    about = "Square a vector of floats on a compute device and verify the result",
    version,
    long_about = None
)]
struct Cli {
    /// Path to a TOML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the square pipeline once
    Run {
        /// Number of elements
        #[arg(long)]
        count: Option<usize>,

        /// Device class to run on
        #[arg(long, value_enum)]
        device: Option<DeviceClass>,

        /// Seed for the random input
        #[arg(long)]
        seed: Option<u64>,

        /// Work-group size (queried from the device when omitted)
        #[arg(long)]
        group_size: Option<usize>,

        /// OpenCL C file to build instead of the built-in kernel
        #[arg(long)]
        kernel_file: Option<PathBuf>,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,

        /// Fail the given runtime operation
        #[arg(long, value_enum)]
        inject_fault: Option<RuntimeOp>,
    },

    /// List the devices of the configured runtime
    Devices {
        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Print the kernel source that `run` would build
    Source,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match PipelineConfig::resolve(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e:#}");
            return ExitCode::FAILURE;
        }
    };
    init_tracing(&config.logging);

    let result = match cli.command {
        Commands::Run {
            count,
            device,
            seed,
            group_size,
            kernel_file,
            json,
            inject_fault,
        } => {
            if let Some(count) = count {
                config.data.count = count;
            }
            if let Some(device) = device {
                config.device.class = device;
            }
            if seed.is_some() {
                config.data.seed = seed;
            }
            if group_size.is_some() {
                config.dispatch.group_size = group_size;
            }
            if kernel_file.is_some() {
                config.kernel.source_path = kernel_file;
            }
            run(&config, json, inject_fault)
        }
        Commands::Devices { json } => devices(&config, json),
        Commands::Source => config.pipeline_settings().map(|s| print!("{}", s.kernel_source)),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            report_error(&e);
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn run(config: &PipelineConfig, json: bool, inject_fault: Option<RuntimeOp>) -> Result<()> {
    let settings = config.pipeline_settings()?;
    let runtime = config.compute_runtime()?;
    let runtime: Box<dyn ComputeRuntime> = match inject_fault {
        Some(op) => Box::new(FaultInjector::new(runtime).fail_on(op)),
        None => runtime,
    };

    let input = kernelpipe::input::random_samples(config.data.count, config.data.seed);
    tracing::info!(count = input.len(), seed = ?config.data.seed, "Running square pipeline");
    let outcome = AccelerationPipeline::new(runtime.as_ref(), settings).run(&input)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&outcome.report)?);
    } else {
        println!("{}", outcome.report);
    }
    Ok(())
}

fn devices(config: &PipelineConfig, json: bool) -> Result<()> {
    let rt = config.compute_runtime()?;
    let devices = runtime::enumerate(rt.as_ref());
    if json {
        let listing: Vec<_> = devices
            .iter()
            .map(|(id, info)| serde_json::json!({ "id": id, "info": info }))
            .collect();
        println!("{}", serde_json::to_string_pretty(&listing)?);
        return Ok(());
    }

    if devices.is_empty() {
        println!("No devices configured.");
        return Ok(());
    }
    println!(
        "{:<4} | {:<28} | {:<15} | {:>9} | {:>10} | Available",
        "Id", "Name", "Class", "Max group", "Memory MiB"
    );
    println!("{:-<4}-|-{:-<28}-|-{:-<15}-|-{:-<9}-|-{:-<10}-|-{:-<9}", "", "", "", "", "", "");
    for (id, info) in &devices {
        println!(
            "{:<4} | {:<28} | {:<15} | {:>9} | {:>10} | {}",
            id.raw(),
            info.name,
            info.class.to_string(),
            info.max_work_group_size,
            info.global_mem_bytes / (1024 * 1024),
            if info.available { "yes" } else { "no" }
        );
    }
    Ok(())
}

/// Print `err` naming the failing stage; build logs go out verbatim.
fn report_error(err: &anyhow::Error) {
    match err.downcast_ref::<PipelineError>() {
        Some(pipeline_err) => {
            eprintln!("Error: {} stage failed: {err:#}", pipeline_err.stage());
            if let PipelineError::BuildFailed { log } = pipeline_err {
                eprintln!("{log}");
            }
        }
        None => eprintln!("Error: {err:#}"),
    }
}
