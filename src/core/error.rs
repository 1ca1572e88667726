//! Flow error types

use thiserror::Error;

/// Errors raised while building, running or terminating a flow
///
/// Cloneable so that a failed controller can keep reporting the same failure
/// from every later call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FlowError {
    /// Invalid configuration or a call made in the wrong controller state
    #[error("Usage error: {0}")]
    Usage(String),

    /// A processing function failed for the event at `position`
    #[error("Step '{step}' failed processing event at position {position}: {message}")]
    Processing {
        step: String,
        position: u64,
        message: String,
    },

    /// A transform or fold function failed
    #[error("Step '{step}' failed: {message}")]
    Step { step: String, message: String },

    /// Worker thread or process could not be started or talked to
    #[error("Step '{step}' resource error: {message}")]
    Resource { step: String, message: String },

    /// A sink write failed
    #[error("Sink '{step}' write failed: {message}")]
    Sink { step: String, message: String },

    /// The flow driver stopped unexpectedly
    #[error("Flow aborted: {0}")]
    Aborted(String),
}

impl FlowError {
    pub fn usage(message: impl Into<String>) -> Self {
        FlowError::Usage(message.into())
    }

    pub fn step(step: &str, error: anyhow::Error) -> Self {
        FlowError::Step {
            step: step.to_string(),
            message: format!("{:#}", error),
        }
    }

    pub fn resource(step: &str, message: impl Into<String>) -> Self {
        FlowError::Resource {
            step: step.to_string(),
            message: message.into(),
        }
    }

    pub fn is_usage(&self) -> bool {
        matches!(self, FlowError::Usage(_))
    }
}
