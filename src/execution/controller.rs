//! Controllers: the emitting side of an activated flow
//!
//! A controller feeds events into the head of the chain through a bounded
//! channel. The chain itself is driven elsewhere: by a task on the caller's
//! runtime for [`AsyncController`], by a dedicated thread for
//! [`SyncController`]. Any step failure ends the driver; the controller picks
//! the failure up on its next call and keeps reporting it.

use crate::core::{Event, FlowError, Step};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// What the controller sends to the driver
#[derive(Debug)]
pub(crate) enum Signal {
    Event(Event),
    Terminate,
}

/// Lifecycle of a controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerState {
    /// Accepting events
    Running,
    /// Termination requested, result not yet collected
    Terminating,
    /// A step failed; every further call returns this error
    Failed(FlowError),
    /// The result has been collected
    Done,
}

/// Run the chain until termination is requested or every sender is gone
pub(crate) async fn drive(
    mut head: Box<dyn Step>,
    mut signals: mpsc::Receiver<Signal>,
) -> Result<Option<Value>, FlowError> {
    let mut accepted = 0u64;
    while let Some(signal) = signals.recv().await {
        match signal {
            Signal::Event(event) => {
                head.accept(event).await?;
                accepted += 1;
            }
            Signal::Terminate => break,
        }
    }
    // Refuse anything emitted after the termination signal.
    signals.close();

    debug!("Terminating flow after {} events", accepted);
    let result = head.accept_termination().await?;
    info!("Flow terminated after {} events", accepted);
    Ok(result)
}

/// Unpack full events, then assign an id and a key the way the source is configured to
fn prepare(event: Event, key_field: Option<&str>) -> Event {
    let event = event.restore_full_event();
    let event = if event.id().is_none() {
        event.with_id(Uuid::new_v4().to_string())
    } else {
        event
    };
    if event.key().is_some() {
        return event;
    }
    let key = key_field
        .and_then(|field| event.body().get(field))
        .and_then(|value| match value {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        });
    match key {
        Some(key) => event.with_key(key),
        None => event,
    }
}

fn emit_after_terminate() -> FlowError {
    FlowError::usage("emit called after terminate")
}

fn await_before_terminate() -> FlowError {
    FlowError::usage("await_termination called before terminate")
}

fn await_twice() -> FlowError {
    FlowError::usage("await_termination called twice")
}

/// Controller of a flow driven by a task on the caller's runtime
pub struct AsyncController {
    signals: Option<mpsc::Sender<Signal>>,
    driver: Option<tokio::task::JoinHandle<Result<Option<Value>, FlowError>>>,
    state: ControllerState,
    key_field: Option<String>,
}

impl AsyncController {
    pub(crate) fn new(
        signals: mpsc::Sender<Signal>,
        driver: tokio::task::JoinHandle<Result<Option<Value>, FlowError>>,
        key_field: Option<String>,
    ) -> Self {
        Self {
            signals: Some(signals),
            driver: Some(driver),
            state: ControllerState::Running,
            key_field,
        }
    }

    pub fn state(&self) -> &ControllerState {
        &self.state
    }

    /// Push one event into the flow, waiting while the source buffer is full
    pub async fn emit(&mut self, event: impl Into<Event>) -> Result<(), FlowError> {
        match &self.state {
            ControllerState::Running => {}
            ControllerState::Failed(e) => return Err(e.clone()),
            ControllerState::Terminating | ControllerState::Done => return Err(emit_after_terminate()),
        }
        let event = prepare(event.into(), self.key_field.as_deref());
        self.send(Signal::Event(event)).await
    }

    /// Ask the flow to drain and terminate
    pub async fn terminate(&mut self) -> Result<(), FlowError> {
        match &self.state {
            ControllerState::Running => {}
            ControllerState::Failed(e) => return Err(e.clone()),
            ControllerState::Terminating | ControllerState::Done => return Ok(()),
        }
        self.send(Signal::Terminate).await?;
        self.signals = None;
        self.state = ControllerState::Terminating;
        Ok(())
    }

    /// Wait for every step to terminate and return the terminal value
    pub async fn await_termination(&mut self) -> Result<Option<Value>, FlowError> {
        match &self.state {
            ControllerState::Terminating => {}
            ControllerState::Running => return Err(await_before_terminate()),
            ControllerState::Failed(e) => return Err(e.clone()),
            ControllerState::Done => return Err(await_twice()),
        }
        let result = self.join().await;
        self.state = match &result {
            Ok(_) => ControllerState::Done,
            Err(e) => ControllerState::Failed(e.clone()),
        };
        result
    }

    async fn send(&mut self, signal: Signal) -> Result<(), FlowError> {
        let finished = self.driver.as_ref().map_or(true, |driver| driver.is_finished());
        let sent = match &self.signals {
            Some(signals) if !finished => signals.send(signal).await.is_ok(),
            _ => false,
        };
        if sent {
            return Ok(());
        }
        let failure = match self.join().await {
            Err(e) => e,
            Ok(_) => FlowError::Aborted("flow stopped before termination was requested".to_string()),
        };
        warn!("Flow failed: {}", failure);
        self.signals = None;
        self.state = ControllerState::Failed(failure.clone());
        Err(failure)
    }

    async fn join(&mut self) -> Result<Option<Value>, FlowError> {
        let driver = self
            .driver
            .take()
            .ok_or_else(|| FlowError::Aborted("flow driver already collected".to_string()))?;
        match driver.await {
            Ok(result) => result,
            Err(e) => Err(FlowError::Aborted(format!("flow driver panicked: {}", e))),
        }
    }
}

/// Controller of a flow driven by a dedicated thread
///
/// Every call blocks the calling thread, so it must not be used from inside
/// an async runtime.
pub struct SyncController {
    signals: Option<mpsc::Sender<Signal>>,
    driver: Option<std::thread::JoinHandle<Result<Option<Value>, FlowError>>>,
    state: ControllerState,
    key_field: Option<String>,
}

impl SyncController {
    pub(crate) fn new(
        signals: mpsc::Sender<Signal>,
        driver: std::thread::JoinHandle<Result<Option<Value>, FlowError>>,
        key_field: Option<String>,
    ) -> Self {
        Self {
            signals: Some(signals),
            driver: Some(driver),
            state: ControllerState::Running,
            key_field,
        }
    }

    pub fn state(&self) -> &ControllerState {
        &self.state
    }

    /// Push one event into the flow, blocking while the source buffer is full
    pub fn emit(&mut self, event: impl Into<Event>) -> Result<(), FlowError> {
        match &self.state {
            ControllerState::Running => {}
            ControllerState::Failed(e) => return Err(e.clone()),
            ControllerState::Terminating | ControllerState::Done => return Err(emit_after_terminate()),
        }
        let event = prepare(event.into(), self.key_field.as_deref());
        self.send(Signal::Event(event))
    }

    /// Ask the flow to drain and terminate
    pub fn terminate(&mut self) -> Result<(), FlowError> {
        match &self.state {
            ControllerState::Running => {}
            ControllerState::Failed(e) => return Err(e.clone()),
            ControllerState::Terminating | ControllerState::Done => return Ok(()),
        }
        self.send(Signal::Terminate)?;
        self.signals = None;
        self.state = ControllerState::Terminating;
        Ok(())
    }

    /// Block until every step has terminated and return the terminal value
    pub fn await_termination(&mut self) -> Result<Option<Value>, FlowError> {
        match &self.state {
            ControllerState::Terminating => {}
            ControllerState::Running => return Err(await_before_terminate()),
            ControllerState::Failed(e) => return Err(e.clone()),
            ControllerState::Done => return Err(await_twice()),
        }
        let result = self.join();
        self.state = match &result {
            Ok(_) => ControllerState::Done,
            Err(e) => ControllerState::Failed(e.clone()),
        };
        result
    }

    fn send(&mut self, signal: Signal) -> Result<(), FlowError> {
        let finished = self.driver.as_ref().map_or(true, |driver| driver.is_finished());
        let sent = match &self.signals {
            Some(signals) if !finished => signals.blocking_send(signal).is_ok(),
            _ => false,
        };
        if sent {
            return Ok(());
        }
        let failure = match self.join() {
            Err(e) => e,
            Ok(_) => FlowError::Aborted("flow stopped before termination was requested".to_string()),
        };
        warn!("Flow failed: {}", failure);
        self.signals = None;
        self.state = ControllerState::Failed(failure.clone());
        Err(failure)
    }

    fn join(&mut self) -> Result<Option<Value>, FlowError> {
        let driver = self
            .driver
            .take()
            .ok_or_else(|| FlowError::Aborted("flow driver already collected".to_string()))?;
        driver
            .join()
            .unwrap_or_else(|_| Err(FlowError::Aborted("flow driver thread panicked".to_string())))
    }
}
