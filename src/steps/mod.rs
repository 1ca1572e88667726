//! Built-in step variants

pub mod broadcast;
pub mod reduce;
pub mod sink;
pub mod transform;

pub use broadcast::Broadcast;
pub use reduce::Reduce;
pub use sink::{
    BatchLog, JsonLinesWriter, MemoryWriter, Record, Route, RoutingSelector, Sink, SinkWriter,
    KEY_COLUMN,
};
pub use transform::{Filter, FlatMap, Map};
