use anyhow::{Context, Result};
use flowline::cli::commands::{RunCommand, ValidateCommand, WorkerCommand};
use flowline::cli::output::*;
use flowline::cli::{Cli, Command};
use flowline::execution::serve_worker;
use flowline::steps::JsonLinesWriter;
use flowline::{build_flow, AsyncEmitSource, FlowConfig, FlowError, ProcessCommand, ProcessorSpec};
use std::time::Instant;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::{debug, error, info, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::from_args();

    // Initialize logging; stdout carries data, so logs go to stderr
    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("Failed to set logging subscriber")?;

    // Execute command
    match &cli.command {
        Command::Run(cmd) => run_flow(cmd).await?,
        Command::Validate(cmd) => validate_flow(cmd)?,
        Command::Worker(cmd) => run_worker(cmd).await?,
    }

    Ok(())
}

async fn run_flow(cmd: &RunCommand) -> Result<()> {
    let config = FlowConfig::from_file(&cmd.file).context("Failed to load flow config")?;
    if !cmd.quiet {
        eprintln!("{} Loaded flow: {}", INFO, style(&config.name).bold());
    }

    // Process stages re-run this binary as their worker
    let exe = std::env::current_exe().context("Failed to locate the flowline executable")?;
    let worker = ProcessCommand::new(exe.to_string_lossy());

    let steps = config.to_steps(JsonLinesWriter::new(tokio::io::stdout()), &worker)?;
    let flow = build_flow(AsyncEmitSource::with_options(config.source.clone()), steps)?;
    debug!("Flow '{}' enters at step '{}'", config.name, flow.head_name());

    let input: Box<dyn AsyncBufRead + Unpin + Send> = match &cmd.input {
        Some(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("Failed to open input {}", path))?;
            Box::new(BufReader::new(file))
        }
        None => Box::new(BufReader::new(tokio::io::stdin())),
    };

    let spinner = (!cmd.quiet).then(create_spinner);
    if let Some(spinner) = &spinner {
        spinner.set_message(format!("{} {}", ROCKET, config.name));
    }

    let started = Instant::now();
    let result = feed(flow.run()?, input, spinner.as_ref()).await;
    if let Some(spinner) = spinner {
        spinner.finish_and_clear();
    }

    match result {
        Ok(events) => {
            info!("Flow '{}' finished with {} events", config.name, events);
            if !cmd.quiet {
                eprintln!("{}", format_summary(&config.name, events, started.elapsed()));
            }
            Ok(())
        }
        Err(FeedError::Flow(e)) => {
            eprintln!("{}", format_failure(&config.name, &e));
            error!("{}", e);
            std::process::exit(1);
        }
        Err(FeedError::Input(e)) => Err(e),
    }
}

enum FeedError {
    Flow(FlowError),
    Input(anyhow::Error),
}

impl From<FlowError> for FeedError {
    fn from(e: FlowError) -> Self {
        FeedError::Flow(e)
    }
}

/// Emit every non-empty input line as one event, then terminate
async fn feed(
    mut controller: flowline::AsyncController,
    input: Box<dyn AsyncBufRead + Unpin + Send>,
    spinner: Option<&indicatif::ProgressBar>,
) -> std::result::Result<u64, FeedError> {
    let mut lines = input.lines();
    let mut line_number = 0u64;
    let mut events = 0u64;

    while let Some(line) = lines
        .next_line()
        .await
        .context("Failed to read input")
        .map_err(FeedError::Input)?
    {
        line_number += 1;
        if line.trim().is_empty() {
            continue;
        }
        let body: serde_json::Value = serde_json::from_str(&line)
            .with_context(|| format!("Invalid JSON on input line {}", line_number))
            .map_err(FeedError::Input)?;
        controller.emit(body).await?;
        events += 1;
        if let Some(spinner) = spinner {
            spinner.inc(1);
        }
    }

    controller.terminate().await?;
    controller.await_termination().await?;
    Ok(events)
}

fn validate_flow(cmd: &ValidateCommand) -> Result<()> {
    println!("{} Validating flow...", INFO);

    match FlowConfig::from_file(&cmd.file) {
        Ok(config) => {
            println!("{} Flow configuration is valid!", CHECK);
            println!("{}", format_flow(&config));

            if cmd.json {
                let json = serde_json::to_string_pretty(&config)?;
                println!("\n{}", json);
            }
            Ok(())
        }
        Err(e) => {
            println!("{} Validation failed:", CROSS);
            println!("  {}", style(format!("{:#}", e)).red());
            std::process::exit(1);
        }
    }
}

async fn run_worker(cmd: &WorkerCommand) -> Result<()> {
    let spec: ProcessorSpec = serde_json::from_str(&cmd.spec).context("Invalid processor spec")?;
    serve_worker(BufReader::new(tokio::io::stdin()), tokio::io::stdout(), |body, context| {
        let context = (!context.is_null()).then_some(context);
        spec.apply(body, context)
    })
    .await
}
