//! CLI command definitions

use clap::Args;

/// Run a flow
#[derive(Debug, Args, Clone)]
pub struct RunCommand {
    /// Path to flow YAML file
    #[arg(short, long)]
    pub file: String,

    /// JSON-lines input file (stdin when omitted)
    #[arg(short, long)]
    pub input: Option<String>,

    /// Don't print progress or the summary
    #[arg(short, long)]
    pub quiet: bool,
}

/// Validate a flow configuration
#[derive(Debug, Args, Clone)]
pub struct ValidateCommand {
    /// Path to flow YAML file
    #[arg(short, long)]
    pub file: String,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Serve as a worker process
#[derive(Debug, Args, Clone)]
pub struct WorkerCommand {
    /// Processor to run, as JSON (e.g. '{"kind":"sleep","millis":10}')
    #[arg(long)]
    pub spec: String,
}
