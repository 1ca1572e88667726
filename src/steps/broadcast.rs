//! Fan-out to several independent branches

use crate::core::{link_steps, Event, FlowError, Outlet, Step};
use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

/// Delivers every event to each branch, in branch order
///
/// Each branch is its own linear chain and must end in a terminal step. The
/// first branch returning a value decides the flow's result.
pub struct Broadcast {
    name: String,
    branches: Outlet,
}

impl Broadcast {
    pub fn new(branches: Vec<Vec<Box<dyn Step>>>) -> Result<Self, FlowError> {
        if branches.is_empty() {
            return Err(FlowError::usage("Broadcast needs at least one branch"));
        }
        let mut outlet = Outlet::new();
        for branch in branches {
            outlet.attach(link_steps(branch)?);
        }
        Ok(Self {
            name: "broadcast".to_string(),
            branches: outlet,
        })
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

#[async_trait]
impl Step for Broadcast {
    fn name(&self) -> &str {
        &self.name
    }

    // The branches are the successors; nothing can follow a broadcast.
    fn accepts_successor(&self) -> bool {
        false
    }

    async fn init(&mut self) -> Result<(), FlowError> {
        debug!("Broadcast '{}' starting {} branches", self.name, self.branches.len());
        self.branches.init().await
    }

    async fn accept(&mut self, event: Event) -> Result<(), FlowError> {
        self.branches.forward(event).await
    }

    async fn accept_termination(&mut self) -> Result<Option<Value>, FlowError> {
        self.branches.terminate().await
    }
}
