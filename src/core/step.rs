//! Step abstraction
//!
//! Every node of a flow implements [`Step`]. Non-terminal steps own their
//! successors through an [`Outlet`]; forwarding an event means awaiting the
//! successor's `accept`, so a failure anywhere downstream comes back as the
//! failure of the upstream `accept`.

use crate::core::{Event, FlowError};
use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;

/// Boxed, sendable future
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A node in a flow
#[async_trait]
pub trait Step: Send {
    /// Name used in logs and errors
    fn name(&self) -> &str;

    /// Whether this step forwards to a successor (false for sinks and aggregators)
    fn accepts_successor(&self) -> bool {
        true
    }

    /// The successors of this step, if it has any
    fn outlet_mut(&mut self) -> Option<&mut Outlet> {
        None
    }

    /// Initialize step-local resources, then the successors
    async fn init(&mut self) -> Result<(), FlowError> {
        if let Some(outlet) = self.outlet_mut() {
            outlet.init().await?;
        }
        Ok(())
    }

    /// Process one event, forwarding zero or more derived events
    async fn accept(&mut self, event: Event) -> Result<(), FlowError>;

    /// Flush buffered state and terminate the successors
    ///
    /// Returns the value accumulated by the terminal step, if any.
    async fn accept_termination(&mut self) -> Result<Option<Value>, FlowError>;
}

/// The successors of a step
#[derive(Default)]
pub struct Outlet {
    successors: Vec<Box<dyn Step>>,
}

impl Outlet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a successor
    pub fn attach(&mut self, step: Box<dyn Step>) {
        self.successors.push(step);
    }

    pub(crate) fn len(&self) -> usize {
        self.successors.len()
    }

    pub async fn init(&mut self) -> Result<(), FlowError> {
        for successor in &mut self.successors {
            successor.init().await?;
        }
        Ok(())
    }

    /// Deliver an event to every successor, in attachment order
    pub async fn forward(&mut self, event: Event) -> Result<(), FlowError> {
        let Some((last, rest)) = self.successors.split_last_mut() else {
            return Ok(());
        };
        for successor in rest {
            successor.accept(event.clone()).await?;
        }
        last.accept(event).await
    }

    /// Terminate every successor, returning the first terminal value
    pub async fn terminate(&mut self) -> Result<Option<Value>, FlowError> {
        let mut result = None;
        for successor in &mut self.successors {
            let value = successor.accept_termination().await?;
            if result.is_none() {
                result = value;
            }
        }
        Ok(result)
    }
}

/// Link an ordered list of steps into a chain, returning its head
///
/// Every step but the last must accept a successor, and the last one must be
/// terminal so no event silently falls off the end.
pub fn link_steps(steps: Vec<Box<dyn Step>>) -> Result<Box<dyn Step>, FlowError> {
    let mut steps = steps.into_iter().rev();
    let mut head = steps
        .next()
        .ok_or_else(|| FlowError::usage("A flow needs at least one step"))?;

    if head.accepts_successor() {
        return Err(FlowError::usage(format!(
            "Flow must end in a terminal step, but '{}' expects a successor",
            head.name()
        )));
    }

    for mut step in steps {
        let name = step.name().to_string();
        match step.outlet_mut() {
            Some(outlet) => outlet.attach(head),
            None => {
                return Err(FlowError::usage(format!(
                    "Step '{}' is terminal and cannot have a successor",
                    name
                )))
            }
        }
        head = step;
    }

    Ok(head)
}
