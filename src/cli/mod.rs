// Command Line Interface Module
// clap-driven entry points for running the engine and checking configuration

pub mod commands;

use clap::{Parser, Subcommand};
use colored::*;

/// Transactional TCP server
#[derive(Parser)]
#[command(name = "txn-server")]
#[command(version)]
#[command(about = "Transactional TCP server with pooled connection state and provider forwarding", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the server until SIGTERM or SIGINT
    Start {
        /// Configuration file path
        #[arg(short, long, default_value = "txn.toml")]
        config: String,

        /// Emit JSON logs instead of compact text
        #[arg(long)]
        json_logs: bool,
    },

    /// Validate configuration file
    Validate {
        /// Configuration file to validate
        #[arg(short, long, default_value = "txn.toml")]
        file: String,
    },
}

/// Print a success message
pub fn success(msg: &str) {
    println!("{} {}", "✓".green().bold(), msg);
}

/// Print an error message
pub fn error(msg: &str) {
    eprintln!("{} {}", "✗".red().bold(), msg);
}

/// Print an info message
pub fn info(msg: &str) {
    println!("{} {}", "ℹ".blue().bold(), msg);
}

pub fn print_banner() {
    println!(
        "{} {}",
        "txn-server".bright_cyan().bold(),
        env!("CARGO_PKG_VERSION").bright_white()
    );
}
