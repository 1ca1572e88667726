//! Terminal aggregator

use crate::core::{Event, FlowError, Step};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

type FoldFn<A> = Box<dyn FnMut(A, Event) -> anyhow::Result<A> + Send>;

/// Folds every received event into a single accumulator
///
/// The fold runs once per event, in arrival order, never concurrently with
/// itself. On termination the accumulator is serialized and handed back to
/// the controller.
pub struct Reduce<A> {
    name: String,
    accumulator: Option<A>,
    fold: FoldFn<A>,
    events_seen: u64,
}

impl<A: Serialize + Send + 'static> Reduce<A> {
    /// Fold over event bodies
    pub fn new<F>(initial: A, mut fold: F) -> Self
    where
        F: FnMut(A, Value) -> A + Send + 'static,
    {
        Self::build(initial, Box::new(move |acc, event: Event| Ok(fold(acc, event.into_body()))))
    }

    /// Fold over full events (body plus key, id and time)
    pub fn full_event<F>(initial: A, mut fold: F) -> Self
    where
        F: FnMut(A, Event) -> A + Send + 'static,
    {
        Self::build(initial, Box::new(move |acc, event| Ok(fold(acc, event))))
    }

    /// Fold over event bodies with a fallible function
    pub fn try_new<F>(initial: A, mut fold: F) -> Self
    where
        F: FnMut(A, Value) -> anyhow::Result<A> + Send + 'static,
    {
        Self::build(initial, Box::new(move |acc, event: Event| fold(acc, event.into_body())))
    }

    /// Fold over full events with a fallible function
    pub fn try_full_event<F>(initial: A, fold: F) -> Self
    where
        F: FnMut(A, Event) -> anyhow::Result<A> + Send + 'static,
    {
        Self::build(initial, Box::new(fold))
    }

    fn build(initial: A, fold: FoldFn<A>) -> Self {
        Self {
            name: "reduce".to_string(),
            accumulator: Some(initial),
            fold,
            events_seen: 0,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

#[async_trait]
impl<A: Serialize + Send + 'static> Step for Reduce<A> {
    fn name(&self) -> &str {
        &self.name
    }

    fn accepts_successor(&self) -> bool {
        false
    }

    async fn accept(&mut self, event: Event) -> Result<(), FlowError> {
        let accumulator = self.accumulator.take().ok_or_else(|| {
            FlowError::usage(format!("Reduce '{}' received an event after a failed fold or termination", self.name))
        })?;
        let next = (self.fold)(accumulator, event).map_err(|e| FlowError::step(&self.name, e))?;
        self.accumulator = Some(next);
        self.events_seen += 1;
        Ok(())
    }

    async fn accept_termination(&mut self) -> Result<Option<Value>, FlowError> {
        let accumulator = self
            .accumulator
            .take()
            .ok_or_else(|| FlowError::usage(format!("Reduce '{}' terminated twice", self.name)))?;
        tracing::debug!("Reduce '{}' finished after {} events", self.name, self.events_seen);
        let value = serde_json::to_value(accumulator).map_err(|e| FlowError::step(&self.name, e.into()))?;
        Ok(Some(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_sum_bodies() {
        let mut reduce = Reduce::new(0i64, |acc, body| acc + body.as_i64().unwrap_or(0));
        for i in 1..=4 {
            reduce.accept(Event::new(json!(i))).await.unwrap();
        }
        assert_eq!(reduce.accept_termination().await.unwrap(), Some(json!(10)));
    }

    #[tokio::test]
    async fn test_full_event_fold_sees_ids() {
        let mut reduce = Reduce::full_event(Vec::<String>::new(), |mut acc, event| {
            acc.push(event.id().unwrap_or("-").to_string());
            acc
        });
        reduce.accept(Event::new(json!(1)).with_id("a")).await.unwrap();
        reduce.accept(Event::new(json!(2))).await.unwrap();
        assert_eq!(reduce.accept_termination().await.unwrap(), Some(json!(["a", "-"])));
    }

    #[tokio::test]
    async fn test_failed_fold_poisons_reduce() {
        let mut reduce = Reduce::try_new(0i64, |acc, body| {
            let n = body.as_i64().ok_or_else(|| anyhow::anyhow!("not a number: {}", body))?;
            Ok(acc + n)
        })
        .named("sum");

        reduce.accept(Event::new(json!(1))).await.unwrap();
        let err = reduce.accept(Event::new(json!("x"))).await.unwrap_err();
        assert_eq!(err.to_string(), "Step 'sum' failed: not a number: \"x\"");
        assert!(reduce.accept(Event::new(json!(2))).await.unwrap_err().is_usage());
    }

    #[test]
    fn test_reduce_is_terminal() {
        let reduce = Reduce::new((), |acc, _| acc);
        assert!(!reduce.accepts_successor());
    }
}
