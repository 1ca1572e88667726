//! Batching, routing sink step
//!
//! A [`Sink`] buffers up to `max_events` records and hands each full batch to
//! a [`SinkWriter`], the boundary to an external system (message broker,
//! time-series store, a file). Every record carries the destination resolved
//! by the sink's [`RoutingSelector`].

use crate::core::{Event, FlowError, Step};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, error};

/// Placeholder selecting the event key in [`RoutingSelector::TableColumn`]
pub const KEY_COLUMN: &str = "$key";

/// Destination resolved for a record
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    Partition(i32),
    Table(String),
}

/// One serialized event, ready to be written
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Record {
    pub route: Option<Route>,
    pub key: Option<String>,
    pub payload: Value,
}

/// How a sink picks the destination of each event
#[derive(Clone, Default)]
pub enum RoutingSelector {
    /// No routing information
    #[default]
    Unrouted,
    /// Every event goes to one partition
    Partition(i32),
    /// Partition computed from the event
    ShardingFunc(Arc<dyn Fn(&Event) -> i32 + Send + Sync>),
    /// Every event goes to one table
    Table(String),
    /// Table named by a body field, or by the event key for [`KEY_COLUMN`]
    TableColumn(String),
}

impl fmt::Debug for RoutingSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoutingSelector::Unrouted => write!(f, "Unrouted"),
            RoutingSelector::Partition(p) => write!(f, "Partition({})", p),
            RoutingSelector::ShardingFunc(_) => write!(f, "ShardingFunc(..)"),
            RoutingSelector::Table(t) => write!(f, "Table({})", t),
            RoutingSelector::TableColumn(c) => write!(f, "TableColumn({})", c),
        }
    }
}

impl RoutingSelector {
    pub fn sharding_func<F>(func: F) -> Self
    where
        F: Fn(&Event) -> i32 + Send + Sync + 'static,
    {
        RoutingSelector::ShardingFunc(Arc::new(func))
    }

    /// Resolve the destination of an event
    pub fn resolve(&self, event: &Event) -> anyhow::Result<Option<Route>> {
        let route = match self {
            RoutingSelector::Unrouted => None,
            RoutingSelector::Partition(p) => Some(Route::Partition(*p)),
            RoutingSelector::ShardingFunc(func) => Some(Route::Partition(func(event))),
            RoutingSelector::Table(table) => Some(Route::Table(table.clone())),
            RoutingSelector::TableColumn(column) if column == KEY_COLUMN => {
                let key = event
                    .key()
                    .ok_or_else(|| anyhow::anyhow!("event {:?} has no key to route by", event.id()))?;
                Some(Route::Table(key.to_string()))
            }
            RoutingSelector::TableColumn(column) => match event.body().get(column) {
                Some(Value::String(table)) => Some(Route::Table(table.clone())),
                Some(other) if !other.is_null() => Some(Route::Table(other.to_string())),
                _ => anyhow::bail!("event {:?} has no '{}' field to route by", event.id(), column),
            },
        };
        Ok(route)
    }
}

/// Writes batches of records to an external system
#[async_trait]
pub trait SinkWriter: Send {
    /// Write one batch; records are in arrival order
    async fn write_batch(&mut self, batch: Vec<Record>) -> anyhow::Result<()>;

    /// Release the writer after the final batch
    async fn close(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Terminal step buffering events into batches for a [`SinkWriter`]
pub struct Sink<W> {
    name: String,
    writer: W,
    max_events: usize,
    routing: RoutingSelector,
    full_event: bool,
    buffer: Vec<Record>,
    batches_written: u64,
}

impl<W: SinkWriter> Sink<W> {
    /// Create a sink writing one event per batch
    pub fn new(writer: W) -> Self {
        Self {
            name: "sink".to_string(),
            writer,
            max_events: 1,
            routing: RoutingSelector::Unrouted,
            full_event: false,
            buffer: Vec::new(),
            batches_written: 0,
        }
    }

    /// Batch size threshold, must be positive
    pub fn with_max_events(mut self, max_events: usize) -> Result<Self, FlowError> {
        if max_events == 0 {
            return Err(FlowError::usage("max_events must be positive"));
        }
        self.max_events = max_events;
        self.buffer = Vec::with_capacity(max_events);
        Ok(self)
    }

    pub fn with_routing(mut self, routing: RoutingSelector) -> Self {
        self.routing = routing;
        self
    }

    /// Write the whole event (id, key, body, time) instead of the body alone
    pub fn with_full_event(mut self, full_event: bool) -> Self {
        self.full_event = full_event;
        self
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    fn to_record(&self, event: Event) -> anyhow::Result<Record> {
        let route = self.routing.resolve(&event)?;
        let key = event.key().map(str::to_string);
        let payload = if self.full_event {
            event.to_full_event()?
        } else {
            event.into_body()
        };
        Ok(Record { route, key, payload })
    }

    async fn flush(&mut self) -> Result<(), FlowError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let batch = std::mem::replace(&mut self.buffer, Vec::with_capacity(self.max_events));
        let size = batch.len();
        self.writer.write_batch(batch).await.map_err(|e| {
            error!("Sink '{}' failed writing a batch of {}: {:#}", self.name, size, e);
            FlowError::Sink {
                step: self.name.clone(),
                message: format!("{:#}", e),
            }
        })?;
        self.batches_written += 1;
        debug!("Sink '{}' wrote batch #{} ({} records)", self.name, self.batches_written, size);
        Ok(())
    }
}

#[async_trait]
impl<W: SinkWriter> Step for Sink<W> {
    fn name(&self) -> &str {
        &self.name
    }

    fn accepts_successor(&self) -> bool {
        false
    }

    async fn accept(&mut self, event: Event) -> Result<(), FlowError> {
        let record = self.to_record(event).map_err(|e| FlowError::step(&self.name, e))?;
        self.buffer.push(record);
        if self.buffer.len() >= self.max_events {
            self.flush().await?;
        }
        Ok(())
    }

    async fn accept_termination(&mut self) -> Result<Option<Value>, FlowError> {
        self.flush().await?;
        self.writer.close().await.map_err(|e| FlowError::Sink {
            step: self.name.clone(),
            message: format!("{:#}", e),
        })?;
        Ok(None)
    }
}

/// Shared view of the batches written by a [`MemoryWriter`]
#[derive(Debug, Clone, Default)]
pub struct BatchLog {
    batches: Arc<Mutex<Vec<Vec<Record>>>>,
}

impl BatchLog {
    pub fn batches(&self) -> Vec<Vec<Record>> {
        self.batches.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batches().iter().map(Vec::len).collect()
    }

    /// All payloads, flattened in write order
    pub fn payloads(&self) -> Vec<Value> {
        self.batches()
            .into_iter()
            .flatten()
            .map(|record| record.payload)
            .collect()
    }
}

/// Keeps written batches in memory
#[derive(Debug, Default)]
pub struct MemoryWriter {
    log: BatchLog,
}

impl MemoryWriter {
    pub fn new() -> (Self, BatchLog) {
        let log = BatchLog::default();
        (Self { log: log.clone() }, log)
    }
}

#[async_trait]
impl SinkWriter for MemoryWriter {
    async fn write_batch(&mut self, batch: Vec<Record>) -> anyhow::Result<()> {
        self.log
            .batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(batch);
        Ok(())
    }
}

/// Writes each record as one JSON line
pub struct JsonLinesWriter<W> {
    output: W,
    records_written: u64,
}

impl<W: AsyncWrite + Unpin + Send> JsonLinesWriter<W> {
    pub fn new(output: W) -> Self {
        Self {
            output,
            records_written: 0,
        }
    }

    pub fn records_written(&self) -> u64 {
        self.records_written
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> SinkWriter for JsonLinesWriter<W> {
    async fn write_batch(&mut self, batch: Vec<Record>) -> anyhow::Result<()> {
        let mut buf = Vec::new();
        for record in &batch {
            serde_json::to_writer(&mut buf, record)?;
            buf.push(b'\n');
        }
        self.output.write_all(&buf).await?;
        self.output.flush().await?;
        self.records_written += batch.len() as u64;
        Ok(())
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        self.output.flush().await?;
        Ok(())
    }
}
