//! Event domain model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Field marking a body as a whole serialized event
pub const FULL_EVENT_MARKER: &str = "full_event_wrapper";

/// The unit of data flowing through a flow
///
/// Events are value objects: steps derive new events with `with_body` and
/// friends instead of mutating an event another step may still observe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Identifier used to correlate results after concurrent processing
    #[serde(default)]
    id: Option<String>,

    /// Partitioning/routing key (None = unpartitioned)
    #[serde(default)]
    key: Option<String>,

    /// The payload
    body: Value,

    /// When the event entered the flow
    #[serde(default = "Utc::now")]
    time: DateTime<Utc>,
}

impl Event {
    /// Create an event with no key and no id
    pub fn new(body: impl Into<Value>) -> Self {
        Self {
            id: None,
            key: None,
            body: body.into(),
            time: Utc::now(),
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Derive an event carrying a new body, keeping id, key and time
    pub fn with_body(mut self, body: Value) -> Self {
        self.body = body;
        self
    }

    pub fn body(&self) -> &Value {
        &self.body
    }

    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn time(&self) -> DateTime<Utc> {
        self.time
    }

    /// Consume the event, returning its body
    pub fn into_body(self) -> Value {
        self.body
    }

    /// Serialize id, key, body and time, marked so a source can restore them
    pub fn to_full_event(&self) -> serde_json::Result<Value> {
        let mut value = serde_json::to_value(self)?;
        if let Value::Object(fields) = &mut value {
            fields.insert(FULL_EVENT_MARKER.to_string(), Value::Bool(true));
        }
        Ok(value)
    }

    /// Unpack a body written by [`Event::to_full_event`]
    ///
    /// The wrapped id, key and time replace this event's; unmarked or
    /// malformed bodies are left alone.
    pub fn restore_full_event(self) -> Event {
        if self.body.get(FULL_EVENT_MARKER) != Some(&Value::Bool(true)) {
            return self;
        }
        match Event::deserialize(&self.body) {
            Ok(inner) => Event {
                id: inner.id.or(self.id),
                key: inner.key.or(self.key),
                body: inner.body,
                time: inner.time,
            },
            Err(_) => self,
        }
    }
}

impl From<Value> for Event {
    fn from(body: Value) -> Self {
        Event::new(body)
    }
}
