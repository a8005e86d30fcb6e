// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Host Compute CLI
//!
//! Command-line front-end that runs one command in one container.

use clap::{Parser, Subcommand};

mod commands;

/// hcsctl - Run a command in a host compute container
#[derive(Parser)]
#[command(name = "hcsctl")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "hcsctl.yaml")]
    pub config: String,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create a container, run the configured process in it and tear both down
    Run {
        /// Use the in-process simulated host instead of vmcompute.dll
        #[arg(long)]
        simulate: bool,
    },

    /// Validate a configuration file
    Validate {
        /// Path to the configuration file
        file: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(log_level)
        .with_writer(std::io::stderr)
        .init();

    // Dispatch to command handlers
    match cli.command {
        Commands::Run { simulate } => commands::run::execute(&cli.config, simulate).await,
        Commands::Validate { file } => commands::validate::execute(&file).await,
    }
}
