//! Pass-through transform steps: map, flat-map and filter

use crate::core::{Event, FlowError, Outlet, Step};
use async_trait::async_trait;
use serde_json::Value;

type MapFn = Box<dyn Fn(Value) -> anyhow::Result<Value> + Send + Sync>;
type FlatMapFn = Box<dyn Fn(Value) -> anyhow::Result<Vec<Value>> + Send + Sync>;
type PredicateFn = Box<dyn Fn(&Event) -> anyhow::Result<bool> + Send + Sync>;

/// Replaces each event's body with the result of a function
pub struct Map {
    name: String,
    function: MapFn,
    outlet: Outlet,
}

impl Map {
    pub fn new<F>(function: F) -> Self
    where
        F: Fn(Value) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        Self {
            name: "map".to_string(),
            function: Box::new(function),
            outlet: Outlet::new(),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

#[async_trait]
impl Step for Map {
    fn name(&self) -> &str {
        &self.name
    }

    fn outlet_mut(&mut self) -> Option<&mut Outlet> {
        Some(&mut self.outlet)
    }

    async fn accept(&mut self, event: Event) -> Result<(), FlowError> {
        let body = (self.function)(event.body().clone()).map_err(|e| FlowError::step(&self.name, e))?;
        self.outlet.forward(event.with_body(body)).await
    }

    async fn accept_termination(&mut self) -> Result<Option<Value>, FlowError> {
        self.outlet.terminate().await
    }
}

/// Emits zero or more derived events per input event
///
/// Derived events share the key, id and time of their input.
pub struct FlatMap {
    name: String,
    function: FlatMapFn,
    outlet: Outlet,
}

impl FlatMap {
    pub fn new<F>(function: F) -> Self
    where
        F: Fn(Value) -> anyhow::Result<Vec<Value>> + Send + Sync + 'static,
    {
        Self {
            name: "flat_map".to_string(),
            function: Box::new(function),
            outlet: Outlet::new(),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

#[async_trait]
impl Step for FlatMap {
    fn name(&self) -> &str {
        &self.name
    }

    fn outlet_mut(&mut self) -> Option<&mut Outlet> {
        Some(&mut self.outlet)
    }

    async fn accept(&mut self, event: Event) -> Result<(), FlowError> {
        let bodies = (self.function)(event.body().clone()).map_err(|e| FlowError::step(&self.name, e))?;
        for body in bodies {
            self.outlet.forward(event.clone().with_body(body)).await?;
        }
        Ok(())
    }

    async fn accept_termination(&mut self) -> Result<Option<Value>, FlowError> {
        self.outlet.terminate().await
    }
}

/// Forwards only the events matching a predicate
pub struct Filter {
    name: String,
    predicate: PredicateFn,
    outlet: Outlet,
}

impl Filter {
    pub fn new<F>(predicate: F) -> Self
    where
        F: Fn(&Event) -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        Self {
            name: "filter".to_string(),
            predicate: Box::new(predicate),
            outlet: Outlet::new(),
        }
    }

    /// Keep events whose body field (as a string) matches a regex
    pub fn field_matches(field: impl Into<String>, pattern: regex::Regex) -> Self {
        let field = field.into();
        Self::new(move |event| {
            let matched = match event.body().get(&field) {
                Some(Value::String(s)) => pattern.is_match(s),
                Some(Value::Null) | None => false,
                Some(other) => pattern.is_match(&other.to_string()),
            };
            Ok(matched)
        })
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

#[async_trait]
impl Step for Filter {
    fn name(&self) -> &str {
        &self.name
    }

    fn outlet_mut(&mut self) -> Option<&mut Outlet> {
        Some(&mut self.outlet)
    }

    async fn accept(&mut self, event: Event) -> Result<(), FlowError> {
        if (self.predicate)(&event).map_err(|e| FlowError::step(&self.name, e))? {
            self.outlet.forward(event).await?;
        }
        Ok(())
    }

    async fn accept_termination(&mut self) -> Result<Option<Value>, FlowError> {
        self.outlet.terminate().await
    }
}
