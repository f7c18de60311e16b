use clap::{Parser, Subcommand};
use hairscan::config::AppConfig;
use hairscan::inference::torch::convert::{ConvertOptions, convert, inspect};
use hairscan::inference::torch::select_device;
use std::path::PathBuf;
use std::process::ExitCode;

/// Inspects legacy model artifacts and converts them to TorchScript.
#[derive(Parser)]
#[command(name = "hairscan-convert")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List every tensor in an artifact and flag the attention layers
    Inspect {
        /// Weights archive (.ot, .safetensors) or TorchScript module
        artifact: PathBuf,
    },
    /// Rebuild a legacy weights artifact and save it as a TorchScript module
    Convert {
        /// Legacy weights archive
        source: PathBuf,
        /// Where to write the module; defaults to model.compatible_path
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Accept replacement attention when the legacy attention weights do not fit
        #[arg(long)]
        allow_degraded: bool,
        /// cpu, cuda or auto; defaults to model.device
        #[arg(long)]
        device: Option<String>,
    },
}

fn main() -> ExitCode {
    dotenv::dotenv().ok();
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let config = match AppConfig::load() {
        Ok(config) => config,
        Err(e) => {
            log::error!("Invalid configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match Cli::parse().command {
        Commands::Inspect { artifact } => match inspect(&artifact) {
            Ok(entries) => {
                let mut attention = 0;
                for entry in &entries {
                    let marker = if entry.attention {
                        attention += 1;
                        "  [attention]"
                    } else {
                        ""
                    };
                    println!("{} {:?}{}", entry.name, entry.shape, marker);
                }
                println!(
                    "{} tensors, {} in attention layers",
                    entries.len(),
                    attention
                );
                ExitCode::SUCCESS
            }
            Err(e) => {
                log::error!("Cannot read {}: {}", artifact.display(), e);
                ExitCode::FAILURE
            }
        },
        Commands::Convert {
            source,
            output,
            allow_degraded,
            device,
        } => {
            let target = output.unwrap_or_else(|| config.model.compatible_path.clone());
            let options = ConvertOptions {
                device: select_device(device.as_deref().unwrap_or(&config.model.device)),
                architecture: config.model.legacy.clone(),
                allow_degraded,
            };
            match convert(&source, &target, &options) {
                Ok(report) => {
                    println!(
                        "Wrote {} ({}, {})",
                        report.target.display(),
                        report.strategy,
                        report.provenance
                    );
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    log::error!("Conversion of {} failed: {}", source.display(), e);
                    ExitCode::FAILURE
                }
            }
        }
    }
}
