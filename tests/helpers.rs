//! Test utility functions for flowline
#![allow(dead_code)]

use flowline::execution::{ConcurrencyMechanism, EventProcessor, ProcessCommand};
use flowline::{build_flow, AsyncEmitSource, FlowError, Map, ProcessorSpec, Reduce, Step};
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// The flowline binary, used as the worker program for process stages
pub fn worker_command() -> ProcessCommand {
    ProcessCommand::new(env!("CARGO_BIN_EXE_flowline"))
}

/// Terminal step appending every body it receives to a list
pub fn collector() -> Box<dyn Step> {
    Box::new(
        Reduce::new(Vec::<Value>::new(), |mut acc, body| {
            acc.push(body);
            acc
        })
        .named("collector"),
    )
}

/// Integers `0..n` as event bodies
pub fn numbers(n: i64) -> Vec<Value> {
    (0..n).map(|i| json!(i)).collect()
}

/// Build a processor from a spec for any mechanism
pub fn processor(spec: ProcessorSpec, mechanism: ConcurrencyMechanism) -> EventProcessor<Value> {
    spec.to_processor(mechanism, &worker_command())
        .expect("processor spec should encode")
}

pub fn sleep_spec(millis: u64, jitter: u64) -> ProcessorSpec {
    ProcessorSpec::Sleep { millis, jitter }
}

/// A file that workers of every mechanism append `<label> <body>` lines to
pub struct TraceLog {
    _dir: TempDir,
    path: String,
}

impl TraceLog {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("temp dir should be created");
        let path = dir.path().join("trace.log").to_string_lossy().to_string();
        Self { _dir: dir, path }
    }

    fn trace(&self, label: &str) -> ProcessorSpec {
        ProcessorSpec::Trace {
            path: self.path.clone(),
            label: label.to_string(),
        }
    }

    /// Sleep with random jitter, tracing `start` before and `end` after
    pub fn traced_sleep(&self, millis: u64, jitter: u64) -> ProcessorSpec {
        ProcessorSpec::Chain {
            steps: vec![self.trace("start"), sleep_spec(millis, jitter), self.trace("end")],
        }
    }

    /// Step tracing `forwarded` for every event reaching it
    pub fn forwarded_marker(&self) -> Box<dyn Step> {
        let trace = self.trace("forwarded");
        Box::new(Map::new(move |body| trace.apply(body, None)).named("forwarded_marker"))
    }

    pub fn entries(&self) -> Vec<(String, Value)> {
        std::fs::read_to_string(&self.path)
            .unwrap_or_default()
            .lines()
            .map(|line| {
                let (label, body) = line.split_once(' ').expect("trace line has a label");
                (label.to_string(), serde_json::from_str(body).expect("trace body is JSON"))
            })
            .collect()
    }

    /// Bodies traced under `label`, in the order they were written
    pub fn bodies(&self, label: &str) -> Vec<Value> {
        self.entries()
            .into_iter()
            .filter(|(l, _)| l == label)
            .map(|(_, body)| body)
            .collect()
    }

    /// Most units started and not yet forwarded at any one time
    pub fn peak_outstanding(&self) -> usize {
        let mut current = 0usize;
        let mut peak = 0usize;
        for (label, _) in self.entries() {
            match label.as_str() {
                "start" => {
                    current += 1;
                    peak = peak.max(current);
                }
                "forwarded" => current = current.saturating_sub(1),
                _ => {}
            }
        }
        peak
    }
}

/// Result of driving a flow to completion
pub struct FlowRun {
    pub result: Result<Option<Value>, FlowError>,
    pub emitted: usize,
    pub elapsed: Duration,
}

impl FlowRun {
    /// The terminal value, which must be a list
    pub fn list(&self) -> Vec<Value> {
        match &self.result {
            Ok(Some(Value::Array(items))) => items.clone(),
            other => panic!("expected a list result, got {:?}", other),
        }
    }

    pub fn error(&self) -> &FlowError {
        match &self.result {
            Err(e) => e,
            Ok(value) => panic!("expected the flow to fail, got {:?}", value),
        }
    }
}

/// Emit `inputs` through an async source, then terminate and await the result
///
/// Stops emitting at the first failure and reports it.
pub async fn run_async(steps: Vec<Box<dyn Step>>, inputs: Vec<Value>) -> FlowRun {
    let start = Instant::now();
    let flow = build_flow(AsyncEmitSource::new(), steps).expect("flow should build");
    let mut controller = flow.run().expect("flow should activate");

    let mut emitted = 0;
    for input in inputs {
        if let Err(e) = controller.emit(input).await {
            return FlowRun {
                result: Err(e),
                emitted,
                elapsed: start.elapsed(),
            };
        }
        emitted += 1;
    }

    let result = match controller.terminate().await {
        Ok(()) => controller.await_termination().await,
        Err(e) => Err(e),
    };
    FlowRun {
        result,
        emitted,
        elapsed: start.elapsed(),
    }
}

pub fn assert_in_order(bodies: &[Value], n: i64) {
    let expected = numbers(n);
    assert_eq!(bodies, expected.as_slice(), "bodies arrived out of order");
}
