//! Command-line interface

pub mod commands;
pub mod output;

use clap::{Parser, Subcommand};
use commands::{RunCommand, ValidateCommand, WorkerCommand};
use std::ffi::OsString;

/// Event-processing flows with ordered concurrent stages
#[derive(Debug, Parser, Clone)]
#[command(name = "flowline")]
#[command(version = "0.1.0")]
#[command(about = "Run event-processing flows described in YAML", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

/// Available commands
#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run a flow over JSON-lines input
    Run(RunCommand),

    /// Validate a flow configuration
    Validate(ValidateCommand),

    /// Serve as a process-mechanism worker on stdin/stdout
    Worker(WorkerCommand),
}

impl Cli {
    /// Parse CLI arguments from environment
    pub fn from_args() -> Self {
        Self::parse()
    }

    /// Parse CLI arguments from a slice
    pub fn try_parse_from<I, T>(itr: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        <Self as Parser>::try_parse_from(itr)
    }
}
