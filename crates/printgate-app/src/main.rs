// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Printgate: network printer emulator daemon.
//
// Entry point.  Parses the command line, initialises logging, wires the
// backend services, and runs until Ctrl-C.

mod services;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use printgate_core::error::Result;
use services::app_services::AppServices;

/// Raw 9100 and IPP print ingestion with background conversion.
#[derive(Debug, Parser)]
#[command(name = "printgate", version, about)]
struct Cli {
    /// JSON configuration file; defaults apply to anything it omits.
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Override the data directory from the configuration.
    #[arg(long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short, long)]
    verbose: bool,

    /// Print the effective configuration as JSON and exit.
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();

    let config = match services::resolve_config(cli.config.as_deref(), cli.data_dir) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    if cli.print_config {
        return match serde_json::to_string_pretty(&config) {
            Ok(json) => {
                println!("{json}");
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!(error = %e, "could not serialise configuration");
                ExitCode::FAILURE
            }
        };
    }

    info!(data_dir = %config.data_dir.display(), "Printgate starting");
    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Printgate stopped with an error");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: printgate_core::config::ServerConfig) -> Result<()> {
    let mut services = AppServices::init(config)?;
    if let Err(e) = services.start().await {
        services.stop().await?;
        return Err(e);
    }

    tokio::signal::ctrl_c().await?;
    info!("interrupt received, shutting down");
    services.stop().await
}
