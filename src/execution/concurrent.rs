//! Bounded-concurrency execution stage
//!
//! Events are admitted into a window of at most `max_in_flight` outstanding
//! units, processed concurrently by the configured mechanism and forwarded to
//! the successor in exactly the order they were admitted.
//!
//! A forwarder task owns the successors. Every unit reports its completion to
//! the forwarder, which parks it in a [`ReorderBuffer`] until all earlier
//! positions have been forwarded. A unit's admission permit travels with its
//! completion and is dropped only after forwarding, which is what bounds
//! in-flight plus buffered work.

use crate::core::{Event, FlowError, Outlet, Step};
use crate::execution::dispatch::{dispatcher_for, ConcurrencyMechanism, Dispatch, EventProcessor, UnitFailure, UnitOutcome};
use crate::execution::window::{AdmissionWindow, ReorderBuffer};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, OwnedSemaphorePermit};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// A finished unit of work on its way to the forwarder
struct Completion {
    position: u64,
    event: Event,
    outcome: UnitOutcome,
    permit: OwnedSemaphorePermit,
}

/// State that exists between `init` and termination
struct Running {
    window: AdmissionWindow,
    dispatcher: Arc<dyn Dispatch>,
    completions: mpsc::UnboundedSender<Completion>,
    forwarder: JoinHandle<Result<Outlet, FlowError>>,
    next_position: u64,
}

/// Runs a processing function concurrently while preserving event order
pub struct ConcurrentExecution<C = ()> {
    name: String,
    processor: EventProcessor<C>,
    max_in_flight: usize,
    pass_context: bool,
    context: Option<Arc<C>>,
    outlet: Outlet,
    running: Option<Running>,
    failure: Option<FlowError>,
}

impl<C: Send + Sync + 'static> ConcurrentExecution<C> {
    pub fn new(processor: EventProcessor<C>, max_in_flight: usize) -> Result<Self, FlowError> {
        if max_in_flight == 0 {
            return Err(FlowError::usage("max_in_flight must be greater than zero"));
        }
        Ok(Self {
            name: format!("concurrent_{}", processor.mechanism()),
            processor,
            max_in_flight,
            pass_context: false,
            context: None,
            outlet: Outlet::new(),
            running: None,
            failure: None,
        })
    }

    /// Set the context and hand it to the processing function
    pub fn with_context(mut self, context: C) -> Self {
        self.context = Some(Arc::new(context));
        self.pass_context = true;
        self
    }

    /// Whether the processing function receives the context
    pub fn pass_context(mut self, pass: bool) -> Self {
        self.pass_context = pass;
        self
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn mechanism(&self) -> ConcurrencyMechanism {
        self.processor.mechanism()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    /// Await the forwarder after it stopped on its own and record why
    async fn collect_failure(&mut self) -> FlowError {
        if let Some(failure) = &self.failure {
            return failure.clone();
        }
        let failure = match self.running.take() {
            Some(running) => {
                drop(running.completions);
                let failure = match running.forwarder.await {
                    Ok(Err(e)) => e,
                    Ok(Ok(_)) => FlowError::Aborted(format!("forwarder of step '{}' stopped early", self.name)),
                    Err(e) => FlowError::Aborted(format!("forwarder of step '{}' panicked: {}", self.name, e)),
                };
                running.dispatcher.shutdown().await;
                failure
            }
            None => FlowError::usage(format!("Step '{}' was used before init or after termination", self.name)),
        };
        error!("{}", failure);
        self.failure = Some(failure.clone());
        failure
    }
}

/// Closes the window when the forwarder exits, including by panic
struct CloseOnExit(AdmissionWindow);

impl Drop for CloseOnExit {
    fn drop(&mut self) {
        self.0.close();
    }
}

/// Release completions strictly in admission order
async fn forward_in_order(
    step: String,
    mut outlet: Outlet,
    window: AdmissionWindow,
    mut completions: mpsc::UnboundedReceiver<Completion>,
) -> Result<Outlet, FlowError> {
    let _closer = CloseOnExit(window);
    let mut pending: ReorderBuffer<(Event, UnitOutcome, OwnedSemaphorePermit)> = ReorderBuffer::new();

    while let Some(completion) = completions.recv().await {
        let Completion {
            position,
            event,
            outcome,
            permit,
        } = completion;
        if pending.insert(position, (event, outcome, permit)).is_err() {
            return Err(FlowError::Aborted(format!("step '{}' saw position {} twice", step, position)));
        }

        while let Some((position, (event, outcome, permit))) = pending.pop_ready() {
            let result = match outcome {
                Ok(body) => outlet.forward(event.with_body(body)).await,
                Err(UnitFailure::Processing(message)) => Err(FlowError::Processing {
                    step: step.clone(),
                    position,
                    message,
                }),
                Err(UnitFailure::Resource(message)) => Err(FlowError::resource(&step, message)),
            };
            result?;
            drop(permit);
        }
    }

    if !pending.is_empty() {
        return Err(FlowError::Aborted(format!(
            "step '{}' lost the unit at position {}",
            step,
            pending.next_position()
        )));
    }
    Ok(outlet)
}

#[async_trait]
impl<C: Send + Sync + 'static> Step for ConcurrentExecution<C> {
    fn name(&self) -> &str {
        &self.name
    }

    fn outlet_mut(&mut self) -> Option<&mut Outlet> {
        Some(&mut self.outlet)
    }

    async fn init(&mut self) -> Result<(), FlowError> {
        if self.running.is_some() {
            return Err(FlowError::usage(format!("Step '{}' initialized twice", self.name)));
        }
        let context = if self.pass_context { self.context.clone() } else { None };
        let dispatcher = dispatcher_for(&self.name, &self.processor, context, self.max_in_flight)?;
        self.outlet.init().await?;

        let window = AdmissionWindow::new(self.max_in_flight);
        let (completions, receiver) = mpsc::unbounded_channel();
        let forwarder = tokio::spawn(forward_in_order(
            self.name.clone(),
            std::mem::take(&mut self.outlet),
            window.clone(),
            receiver,
        ));

        info!(
            "Step '{}' running {} mechanism with max_in_flight {}",
            self.name,
            dispatcher.mechanism(),
            self.max_in_flight
        );
        self.running = Some(Running {
            window,
            dispatcher,
            completions,
            forwarder,
            next_position: 0,
        });
        Ok(())
    }

    async fn accept(&mut self, event: Event) -> Result<(), FlowError> {
        let window = match &self.running {
            Some(running) if self.failure.is_none() && !running.window.is_closed() => Some(running.window.clone()),
            _ => None,
        };
        let admitted = match window {
            Some(window) => window.admit().await,
            None => None,
        };
        let Some(permit) = admitted else {
            return Err(self.collect_failure().await);
        };
        let Some(running) = self.running.as_mut() else {
            return Err(self.collect_failure().await);
        };

        let position = running.next_position;
        running.next_position += 1;
        debug!(
            "Step '{}' admitted position {} ({} outstanding)",
            self.name,
            position,
            running.window.outstanding()
        );

        let unit = tokio::spawn(running.dispatcher.dispatch(event.body().clone()));
        let completions = running.completions.clone();
        tokio::spawn(async move {
            let outcome = unit
                .await
                .unwrap_or_else(|e| Err(UnitFailure::Processing(format!("processing task failed: {}", e))));
            // A send fails only after the forwarder exited and closed the window,
            // so the next accept reports why.
            let _ = completions.send(Completion {
                position,
                event,
                outcome,
                permit,
            });
        });
        Ok(())
    }

    async fn accept_termination(&mut self) -> Result<Option<Value>, FlowError> {
        if self.failure.is_some() {
            return Err(self.collect_failure().await);
        }
        let Some(running) = self.running.take() else {
            return Err(FlowError::usage(format!(
                "Step '{}' terminated before init or twice",
                self.name
            )));
        };

        let admitted = running.next_position;
        drop(running.completions);
        let forwarded = running.forwarder.await;
        running.dispatcher.shutdown().await;

        let mut outlet = match forwarded {
            Ok(Ok(outlet)) => outlet,
            Ok(Err(e)) => {
                error!("{}", e);
                self.failure = Some(e.clone());
                return Err(e);
            }
            Err(e) => {
                let e = FlowError::Aborted(format!("forwarder of step '{}' panicked: {}", self.name, e));
                self.failure = Some(e.clone());
                return Err(e);
            }
        };
        debug!("Step '{}' drained after {} events", self.name, admitted);
        outlet.terminate().await
    }
}
