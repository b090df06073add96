use std::path::PathBuf;

use ::tracing::error;
use clap::Parser;
use service::Service;

mod config;
mod data_model;
mod error;
mod instance_lock;
mod node_registry;
mod processor;
mod remote;
mod service;
mod state_store;
mod tracing;
use tracing::setup_tracing;

#[cfg(test)]
mod testing;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[arg(short, long, value_name = "config file", help = "Path to config file")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => match config::DispatcherConfig::from_path(path) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("invalid config {}: {err:#}", path.display());
                std::process::exit(2);
            }
        },
        None => config::DispatcherConfig::default(),
    };

    let _log_guard = match setup_tracing(&config) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("error setting up logging: {err:#}");
            std::process::exit(2);
        }
    };

    let service = match Service::from_config(config, cli.config) {
        Ok(service) => service,
        Err(err) => {
            // covers the single-instance lock held by a running daemon
            error!("error creating service: {err:#}");
            std::process::exit(1);
        }
    };
    if let Err(err) = service.start().await {
        error!("error running service: {err:#}");
        std::process::exit(1);
    }
}
