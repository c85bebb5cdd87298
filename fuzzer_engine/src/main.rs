use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use fuzzer_data::Config;
use fuzzer_engine::engine::Engine;
use log::error;

/// Coverage-guided fuzzer for firmware and kernel code running inside
/// snapshot-restored VMs. Each worker boots an emulator, snapshots it after
/// harness setup and mutates structured seeds against it.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();

    let args = Args::parse();
    let config = match Config::from_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!("failed to read configuration {}: {e}", args.config.display());
            return ExitCode::FAILURE;
        }
    };

    Engine::new(config).run().await
}
