//! Flow construction

use crate::core::{link_steps, FlowError, Step};
use crate::execution::source::Source;

/// A linked chain waiting to be activated by its source
pub struct Flow<S> {
    source: S,
    head: Box<dyn Step>,
}

/// Link `steps` in order behind `source`
///
/// Fails when `steps` is empty, when a step other than the last one cannot
/// take a successor, or when the last step is not terminal.
pub fn build_flow<S: Source>(source: S, steps: Vec<Box<dyn Step>>) -> Result<Flow<S>, FlowError> {
    let head = link_steps(steps)?;
    Ok(Flow { source, head })
}

impl<S: Source> Flow<S> {
    /// Name of the first step
    pub fn head_name(&self) -> &str {
        self.head.name()
    }

    /// Activate the flow and return its controller
    pub fn run(self) -> Result<S::Controller, FlowError> {
        self.source.activate(self.head)
    }
}
