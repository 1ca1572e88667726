//! flowline - composable event-processing flows with ordered concurrent stages

pub mod cli;
pub mod core;
pub mod execution;
pub mod processors;
pub mod steps;

// Re-export commonly used types
pub use core::config::FlowConfig;
pub use core::{link_steps, Event, FlowError, Outlet, Step};
pub use execution::{
    build_flow, AsyncController, AsyncEmitSource, ConcurrencyMechanism, ConcurrentExecution, ControllerState,
    EventProcessor, Flow, ProcessCommand, Source, SourceOptions, SyncController, SyncEmitSource,
};
pub use processors::ProcessorSpec;
pub use steps::{Broadcast, Filter, FlatMap, Map, Reduce, RoutingSelector, Sink, SinkWriter};
