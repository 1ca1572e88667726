//! Core domain models for flowline
//!
//! This module defines the event, the step abstraction every node of a flow
//! implements, the error type and the YAML configuration.

pub mod config;
pub mod error;
pub mod event;
pub mod step;

pub use error::FlowError;
pub use event::Event;
pub use step::*;
