//! Ordering, backpressure and timing of the concurrent execution stage

mod helpers;

use flowline::execution::ConcurrencyMechanism;
use flowline::{ConcurrentExecution, EventProcessor, Map, ProcessorSpec, Step};
use helpers::*;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

async fn assert_order_preserved(mechanism: ConcurrencyMechanism) {
    let trace = TraceLog::new();
    let stage = ConcurrentExecution::new(processor(trace.traced_sleep(2, 40), mechanism), 4).unwrap();
    let steps: Vec<Box<dyn Step>> = vec![Box::new(stage), collector()];

    let run = run_async(steps, numbers(30)).await;
    assert_in_order(&run.list(), 30);

    let completed = trace.bodies("end");
    assert_eq!(completed.len(), 30);
    assert_ne!(completed, numbers(30), "units never completed out of order");
}

#[tokio::test]
async fn test_cooperative_preserves_order() {
    assert_order_preserved(ConcurrencyMechanism::Cooperative).await;
}

#[tokio::test]
async fn test_thread_preserves_order() {
    assert_order_preserved(ConcurrencyMechanism::Thread).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_process_preserves_order() {
    assert_order_preserved(ConcurrencyMechanism::Process).await;
}

/// Integers 0..7, cooperative, window of 10, half a second each
#[tokio::test]
async fn test_cooperative_scenario_runs_in_parallel() {
    let stage = ConcurrentExecution::new(processor(sleep_spec(500, 0), ConcurrencyMechanism::Cooperative), 10).unwrap();
    let steps: Vec<Box<dyn Step>> = vec![Box::new(stage), collector()];

    let run = run_async(steps, numbers(8)).await;

    assert_eq!(run.list(), numbers(8));
    assert!(run.elapsed > Duration::from_millis(500), "took {:?}", run.elapsed);
    assert!(run.elapsed < Duration::from_secs(4), "took {:?}", run.elapsed);
}

#[tokio::test]
async fn test_thread_runtime_bound() {
    let stage = ConcurrentExecution::new(processor(sleep_spec(200, 0), ConcurrencyMechanism::Thread), 6).unwrap();
    let steps: Vec<Box<dyn Step>> = vec![Box::new(stage), collector()];

    let run = run_async(steps, numbers(6)).await;

    assert_in_order(&run.list(), 6);
    assert!(run.elapsed > Duration::from_millis(200), "took {:?}", run.elapsed);
    assert!(run.elapsed < Duration::from_millis(1200), "took {:?}", run.elapsed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_process_runtime_bound() {
    let stage = ConcurrentExecution::new(processor(sleep_spec(400, 0), ConcurrencyMechanism::Process), 4).unwrap();
    let steps: Vec<Box<dyn Step>> = vec![Box::new(stage), collector()];

    let run = run_async(steps, numbers(4)).await;

    assert_in_order(&run.list(), 4);
    assert!(run.elapsed > Duration::from_millis(400), "took {:?}", run.elapsed);
    assert!(run.elapsed < Duration::from_millis(1600), "took {:?}", run.elapsed);
}

/// Counts units between processor entry and forwarding downstream
struct Outstanding {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl Outstanding {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }

    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn forwarded(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }
}

fn counted_steps(stage: Box<dyn Step>, outstanding: Arc<Outstanding>) -> Vec<Box<dyn Step>> {
    vec![
        stage,
        Box::new(Map::new(move |body| {
            outstanding.forwarded();
            Ok(body)
        })),
        collector(),
    ]
}

#[tokio::test]
async fn test_cooperative_backpressure_bound() {
    let outstanding = Outstanding::new();
    let counter = outstanding.clone();
    let processor = EventProcessor::cooperative(move |body: Value| {
        counter.enter();
        async move {
            let n = body.as_u64().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(n * 13 % 17)).await;
            Ok(body)
        }
    });
    let stage = Box::new(ConcurrentExecution::new(processor, 3).unwrap());

    let run = run_async(counted_steps(stage, outstanding.clone()), numbers(40)).await;

    assert_in_order(&run.list(), 40);
    let peak = outstanding.peak.load(Ordering::SeqCst);
    assert!(peak <= 3, "peak outstanding was {}", peak);
    assert!(peak > 1, "stage never overlapped work");
}

#[tokio::test]
async fn test_thread_backpressure_bound() {
    let outstanding = Outstanding::new();
    let counter = outstanding.clone();
    let processor = EventProcessor::thread(move |body| {
        counter.enter();
        let n = body.as_u64().unwrap_or(0);
        std::thread::sleep(Duration::from_millis(n * 7 % 11));
        Ok(body)
    });
    let stage = Box::new(ConcurrentExecution::new(processor, 4).unwrap());

    let run = run_async(counted_steps(stage, outstanding.clone()), numbers(40)).await;

    assert_in_order(&run.list(), 40);
    assert!(outstanding.peak.load(Ordering::SeqCst) <= 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_process_backpressure_bound() {
    let trace = TraceLog::new();
    let stage = ConcurrentExecution::new(processor(trace.traced_sleep(5, 30), ConcurrencyMechanism::Process), 3).unwrap();
    let steps: Vec<Box<dyn Step>> = vec![Box::new(stage), trace.forwarded_marker(), collector()];

    let run = run_async(steps, numbers(24)).await;

    assert_in_order(&run.list(), 24);
    assert_eq!(trace.bodies("forwarded"), numbers(24));
    let peak = trace.peak_outstanding();
    assert!(peak <= 3, "peak outstanding was {}", peak);
    assert!(peak > 1, "worker processes never overlapped");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_process_workers_receive_context_copy() {
    let spec = ProcessorSpec::Enrich {
        field: "region".to_string(),
    };
    let stage = ConcurrentExecution::new(processor(spec, ConcurrencyMechanism::Process), 2)
        .unwrap()
        .with_context(json!({"name": "eu-west"}));
    let steps: Vec<Box<dyn Step>> = vec![Box::new(stage), collector()];

    let inputs: Vec<Value> = (0..4).map(|i| json!({ "n": i })).collect();
    let run = run_async(steps, inputs).await;

    let expected: Vec<Value> = (0..4)
        .map(|i| json!({ "n": i, "region": {"name": "eu-west"} }))
        .collect();
    assert_eq!(run.list(), expected);
}

#[tokio::test]
async fn test_thread_workers_share_context() {
    let processor = EventProcessor::thread_with_context(|_, calls: Option<&AtomicUsize>| {
        let call = calls.map(|calls| calls.fetch_add(1, Ordering::SeqCst) + 1);
        Ok(json!(call))
    });
    let stage = ConcurrentExecution::new(processor, 3)
        .unwrap()
        .with_context(AtomicUsize::new(0));
    let steps: Vec<Box<dyn Step>> = vec![Box::new(stage), collector()];

    let run = run_async(steps, numbers(9)).await;

    let mut calls: Vec<u64> = run.list().iter().filter_map(Value::as_u64).collect();
    calls.sort_unstable();
    assert_eq!(calls, (1..=9).collect::<Vec<u64>>());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_process_failure_reports_position() {
    let spec = ProcessorSpec::FailOn { value: json!(3) };
    let stage = ConcurrentExecution::new(processor(spec, ConcurrencyMechanism::Process), 2)
        .unwrap()
        .named("guarded");
    let steps: Vec<Box<dyn Step>> = vec![Box::new(stage), collector()];

    let run = run_async(steps, numbers(6)).await;

    assert_eq!(
        run.error(),
        &flowline::FlowError::Processing {
            step: "guarded".to_string(),
            position: 3,
            message: "refusing to process 3".to_string(),
        }
    );
}

#[tokio::test]
async fn test_missing_worker_program_is_a_resource_error() {
    let processor = EventProcessor::process(flowline::ProcessCommand::new("/nonexistent/flowline-worker"));
    let stage = ConcurrentExecution::new(processor, 2)
        .unwrap()
        .with_context(json!(null))
        .pass_context(false);
    let steps: Vec<Box<dyn Step>> = vec![Box::new(stage), collector()];

    let run = run_async(steps, numbers(3)).await;
    assert!(
        matches!(run.error(), flowline::FlowError::Resource { .. }),
        "got {:?}",
        run.error()
    );
}
