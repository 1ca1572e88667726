//! CLI output formatting
//!
//! Sink records own stdout, so everything here is meant for stderr.

use crate::core::config::{FlowConfig, StepConfig};
use crate::core::FlowError;
use console::Emoji;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

// Re-export style
pub use console::style;

// Emojis for output
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "✓ ");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "✗ ");
pub static INFO: Emoji<'_, '_> = Emoji("ℹ️  ", "i ");
pub static ROCKET: Emoji<'_, '_> = Emoji("🚀 ", "> ");

/// Create a spinner counting emitted events
pub fn create_spinner() -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    if let Ok(template) = ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed_precise}] {pos} events {msg}") {
        spinner.set_style(template);
    }
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner
}

/// One line per step of a flow
pub fn format_step(index: usize, step: &StepConfig) -> String {
    let label = step.name().unwrap_or(step.kind());
    match step {
        StepConfig::Concurrent {
            mechanism,
            max_in_flight,
            ..
        } => format!(
            "  {}. {} ({}, max_in_flight {})",
            index + 1,
            style(label).bold(),
            style(mechanism).cyan(),
            max_in_flight
        ),
        StepConfig::Filter { field, pattern, .. } => format!(
            "  {}. {} ({} =~ {})",
            index + 1,
            style(label).bold(),
            field,
            style(pattern).dim()
        ),
        StepConfig::Map { .. } => format!("  {}. {}", index + 1, style(label).bold()),
    }
}

/// Overview of a validated flow
pub fn format_flow(config: &FlowConfig) -> String {
    let mut lines = vec![
        format!("  Name: {}", style(&config.name).bold()),
        format!("  Steps: {}", style(config.steps.len()).cyan()),
    ];
    lines.extend(config.steps.iter().enumerate().map(|(i, step)| format!("  {}", format_step(i, step))));
    let mechanisms = config.mechanisms();
    if !mechanisms.is_empty() {
        let names: Vec<String> = mechanisms.iter().map(ToString::to_string).collect();
        lines.push(format!("  Mechanisms: {}", style(names.join(", ")).cyan()));
    }
    lines.push(format!(
        "  Sink: batches of {}{}",
        style(config.sink.max_events).cyan(),
        if config.sink.full_event { ", full events" } else { "" }
    ));
    lines.join("\n")
}

/// Final line after a run
pub fn format_summary(name: &str, events: u64, elapsed: Duration) -> String {
    format!(
        "{} {} processed {} events in {}",
        CHECK,
        style(name).bold(),
        style(events).cyan(),
        style(format_duration(elapsed)).dim()
    )
}

/// Final line after a failed run
pub fn format_failure(name: &str, error: &FlowError) -> String {
    let kind = match error {
        FlowError::Usage(_) => "usage error",
        FlowError::Processing { .. } => "processing failed",
        FlowError::Step { .. } => "step failed",
        FlowError::Resource { .. } => "worker failure",
        FlowError::Sink { .. } => "sink failed",
        FlowError::Aborted(_) => "aborted",
    };
    format!("{} {} {}: {}", CROSS, style(name).bold(), style(kind).red(), error)
}

pub fn format_duration(duration: Duration) -> String {
    let millis = duration.as_millis();
    if millis < 1000 {
        format!("{}ms", millis)
    } else if millis < 60_000 {
        format!("{:.2}s", duration.as_secs_f64())
    } else {
        let secs = duration.as_secs();
        format!("{}m {}s", secs / 60, secs % 60)
    }
}
