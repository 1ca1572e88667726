//! Flow execution: sources, controllers and the concurrent stage

pub mod concurrent;
pub mod controller;
pub mod dispatch;
pub mod flow;
pub mod process;
pub mod source;
pub mod window;

pub use concurrent::ConcurrentExecution;
pub use controller::{AsyncController, ControllerState, SyncController};
pub use dispatch::{ConcurrencyMechanism, Dispatch, EventProcessor, PendingWork, UnitFailure};
pub use flow::{build_flow, Flow};
pub use process::{serve_worker, ProcessCommand, WorkerReply, WorkerRequest};
pub use source::{AsyncEmitSource, Source, SourceOptions, SyncEmitSource};
pub use window::{AdmissionWindow, ReorderBuffer};
