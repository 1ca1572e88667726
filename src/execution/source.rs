//! Sources: entry points that decide how a flow is driven

use crate::core::{FlowError, Step};
use crate::execution::controller::{drive, AsyncController, Signal, SyncController};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

fn default_buffer_size() -> usize {
    8
}

/// Options shared by every source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceOptions {
    /// Events the source buffers before `emit` has to wait
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Body field used as the event key when an event has none
    #[serde(default)]
    pub key_field: Option<String>,
}

impl Default for SourceOptions {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            key_field: None,
        }
    }
}

impl SourceOptions {
    pub fn validate(&self) -> Result<(), FlowError> {
        if self.buffer_size == 0 {
            return Err(FlowError::usage("buffer_size must be greater than zero"));
        }
        Ok(())
    }
}

/// Starts a linked chain and hands back its controller
pub trait Source {
    type Controller;

    fn activate(self, head: Box<dyn Step>) -> Result<Self::Controller, FlowError>;
}

/// Source whose controller suspends; the chain runs as a task on the current runtime
#[derive(Debug, Clone, Default)]
pub struct AsyncEmitSource {
    options: SourceOptions,
}

impl AsyncEmitSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: SourceOptions) -> Self {
        Self { options }
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.options.buffer_size = buffer_size;
        self
    }

    pub fn with_key_field(mut self, field: impl Into<String>) -> Self {
        self.options.key_field = Some(field.into());
        self
    }
}

impl Source for AsyncEmitSource {
    type Controller = AsyncController;

    fn activate(self, mut head: Box<dyn Step>) -> Result<AsyncController, FlowError> {
        self.options.validate()?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| FlowError::usage("AsyncEmitSource must be activated inside a tokio runtime"))?;

        let (signals, receiver) = mpsc::channel(self.options.buffer_size);
        let driver = runtime.spawn(async move {
            head.init().await?;
            drive(head, receiver).await
        });
        info!("Flow activated with async source (buffer {})", self.options.buffer_size);
        Ok(AsyncController::new(signals, driver, self.options.key_field))
    }
}

/// Source whose controller blocks; the chain runs on its own thread and runtime
#[derive(Debug, Clone, Default)]
pub struct SyncEmitSource {
    options: SourceOptions,
}

impl SyncEmitSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: SourceOptions) -> Self {
        Self { options }
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.options.buffer_size = buffer_size;
        self
    }

    pub fn with_key_field(mut self, field: impl Into<String>) -> Self {
        self.options.key_field = Some(field.into());
        self
    }
}

impl Source for SyncEmitSource {
    type Controller = SyncController;

    /// Blocks until the chain is initialized; initialization errors are returned here
    fn activate(self, mut head: Box<dyn Step>) -> Result<SyncController, FlowError> {
        self.options.validate()?;
        let (signals, receiver) = mpsc::channel(self.options.buffer_size);
        let (ready, initialized) = oneshot::channel::<Result<(), FlowError>>();

        let driver = std::thread::Builder::new()
            .name("flow-driver".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let failure = FlowError::Aborted(format!("failed to build flow runtime: {}", e));
                        let _ = ready.send(Err(failure.clone()));
                        return Err(failure);
                    }
                };
                runtime.block_on(async move {
                    if let Err(e) = head.init().await {
                        let _ = ready.send(Err(e.clone()));
                        return Err(e);
                    }
                    let _ = ready.send(Ok(()));
                    drive(head, receiver).await
                })
            })
            .map_err(|e| FlowError::Aborted(format!("failed to start flow thread: {}", e)))?;

        match initialized.blocking_recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = driver.join();
                return Err(e);
            }
            Err(_) => {
                let _ = driver.join();
                return Err(FlowError::Aborted("flow thread stopped during initialization".to_string()));
            }
        }
        debug!("Flow thread initialized");
        info!("Flow activated with sync source (buffer {})", self.options.buffer_size);
        Ok(SyncController::new(signals, driver, self.options.key_field))
    }
}
