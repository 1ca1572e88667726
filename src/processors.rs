//! Built-in processing functions usable from flow configuration
//!
//! The same processor runs on every mechanism: inline in a map step, as a
//! cooperative task, on a worker thread, or inside a `flowline worker`
//! process.

use crate::core::BoxFuture;
use crate::execution::{ConcurrencyMechanism, EventProcessor, ProcessCommand};
use anyhow::{bail, Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::hash_map::DefaultHasher;
use std::fs::OpenOptions;
use std::hash::{Hash, Hasher};
use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A processing function described as data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProcessorSpec {
    /// Return the body unchanged
    Identity,

    /// Wait without using the CPU, then return the body
    ///
    /// `jitter` adds a random delay of up to that many milliseconds, seeded
    /// by the body so the same body always waits the same time.
    Sleep {
        millis: u64,
        #[serde(default)]
        jitter: u64,
    },

    /// Spin on the CPU, then return the body
    BusyWait { millis: u64 },

    /// Fail for bodies equal to `value`
    FailOn { value: Value },

    /// Set a field of an object body
    SetField { field: String, value: Value },

    /// Copy the stage context into a field of an object body
    Enrich { field: String },

    /// Append `<label> <body>` as one line to a file
    Trace { path: String, label: String },

    /// Run several processors one after the other
    Chain { steps: Vec<ProcessorSpec> },
}

fn object_mut<'a>(body: &'a mut Value, field: &str) -> Result<&'a mut serde_json::Map<String, Value>> {
    body.as_object_mut()
        .with_context(|| format!("cannot set field '{}' on a non-object body", field))
}

fn sleep_time(millis: u64, jitter: u64, body: &Value) -> Duration {
    if jitter == 0 {
        return Duration::from_millis(millis);
    }
    let mut hasher = DefaultHasher::new();
    body.to_string().hash(&mut hasher);
    let mut rng = StdRng::seed_from_u64(hasher.finish());
    Duration::from_millis(millis + rng.random_range(0..=jitter))
}

fn append_line(path: &str, line: &str) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open trace file {}", path))?;
    file.write_all(line.as_bytes())
        .with_context(|| format!("Failed to write trace file {}", path))
}

fn busy_wait(duration: Duration) {
    let start = Instant::now();
    while start.elapsed() < duration {
        std::hint::spin_loop();
    }
}

impl ProcessorSpec {
    /// Run synchronously, blocking the calling thread for `sleep` and `busy_wait`
    pub fn apply(&self, mut body: Value, context: Option<&Value>) -> Result<Value> {
        match self {
            ProcessorSpec::Identity => {}
            ProcessorSpec::Sleep { millis, jitter } => std::thread::sleep(sleep_time(*millis, *jitter, &body)),
            ProcessorSpec::BusyWait { millis } => busy_wait(Duration::from_millis(*millis)),
            ProcessorSpec::FailOn { value } => {
                if body == *value {
                    bail!("refusing to process {}", body);
                }
            }
            ProcessorSpec::SetField { field, value } => {
                object_mut(&mut body, field)?.insert(field.clone(), value.clone());
            }
            ProcessorSpec::Enrich { field } => {
                let context = context.with_context(|| format!("no context to copy into '{}'", field))?;
                object_mut(&mut body, field)?.insert(field.clone(), context.clone());
            }
            ProcessorSpec::Trace { path, label } => append_line(path, &format!("{} {}\n", label, body))?,
            ProcessorSpec::Chain { steps } => {
                for step in steps {
                    body = step.apply(body, context)?;
                }
            }
        }
        Ok(body)
    }

    /// Run as a task; `sleep` suspends instead of blocking
    ///
    /// `busy_wait` still holds the runtime thread, which is the point of it.
    pub fn apply_async(&self, body: Value, context: Option<Arc<Value>>) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            match self {
                ProcessorSpec::Sleep { millis, jitter } => {
                    tokio::time::sleep(sleep_time(*millis, *jitter, &body)).await;
                    Ok(body)
                }
                ProcessorSpec::Chain { steps } => {
                    let mut body = body;
                    for step in steps {
                        body = step.apply_async(body, context.clone()).await?;
                    }
                    Ok(body)
                }
                other => other.apply(body, context.as_deref()),
            }
        })
    }

    /// Build a processor for a concurrent stage
    ///
    /// Process workers re-run `worker` with `worker --spec <json>`.
    pub fn to_processor(&self, mechanism: ConcurrencyMechanism, worker: &ProcessCommand) -> Result<EventProcessor<Value>> {
        let processor = match mechanism {
            ConcurrencyMechanism::Cooperative => {
                let spec = Arc::new(self.clone());
                EventProcessor::cooperative_with_context(move |body, context| {
                    let spec = spec.clone();
                    async move { spec.apply_async(body, context).await }
                })
            }
            ConcurrencyMechanism::Thread => {
                let spec = self.clone();
                EventProcessor::thread_with_context(move |body, context| spec.apply(body, context))
            }
            ConcurrencyMechanism::Process => {
                let encoded = serde_json::to_string(self).context("Failed to encode processor spec")?;
                EventProcessor::process(worker.clone().args(["worker", "--spec"]).arg(encoded))
            }
        };
        Ok(processor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_from_yaml() {
        let spec: ProcessorSpec = serde_yaml::from_str("kind: set_field\nfield: seen\nvalue: true").unwrap();
        assert_eq!(
            spec,
            ProcessorSpec::SetField {
                field: "seen".to_string(),
                value: json!(true)
            }
        );

        let spec: ProcessorSpec = serde_json::from_str(r#"{"kind":"busy_wait","millis":3}"#).unwrap();
        assert_eq!(spec, ProcessorSpec::BusyWait { millis: 3 });
    }

    #[test]
    fn test_fail_on_matching_body() {
        let spec = ProcessorSpec::FailOn { value: json!(4) };
        assert_eq!(spec.apply(json!(3), None).unwrap(), json!(3));
        assert_eq!(spec.apply(json!(4), None).unwrap_err().to_string(), "refusing to process 4");
    }

    #[test]
    fn test_enrich_needs_context_and_object() {
        let spec = ProcessorSpec::Enrich {
            field: "region".to_string(),
        };
        let context = json!("eu-west");
        assert_eq!(
            spec.apply(json!({"n": 1}), Some(&context)).unwrap(),
            json!({"n": 1, "region": "eu-west"})
        );
        assert!(spec.apply(json!({"n": 1}), None).is_err());
        assert!(spec.apply(json!(1), Some(&context)).is_err());
    }

    #[test]
    fn test_jitter_is_bounded_and_stable() {
        let delays: Vec<Duration> = (0..30).map(|i| sleep_time(5, 40, &json!(i))).collect();
        for (i, delay) in delays.iter().enumerate() {
            assert!(*delay >= Duration::from_millis(5) && *delay <= Duration::from_millis(45));
            assert_eq!(*delay, sleep_time(5, 40, &json!(i)));
        }
        let descents = delays.windows(2).filter(|pair| pair[0] > pair[1]).count();
        assert!(descents >= 5, "delays barely vary: {:?}", delays);
    }

    #[tokio::test]
    async fn test_sleep_suspends() {
        let spec = ProcessorSpec::Sleep { millis: 20, jitter: 0 };
        let start = Instant::now();
        assert_eq!(spec.apply_async(json!("x"), None).await.unwrap(), json!("x"));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn test_chain_traces_around_work() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.log").to_string_lossy().to_string();
        let yaml = format!(
            "kind: chain\nsteps:\n  - kind: trace\n    path: {path}\n    label: start\n  - kind: set_field\n    field: seen\n    value: true\n  - kind: trace\n    path: {path}\n    label: end\n"
        );
        let spec: ProcessorSpec = serde_yaml::from_str(&yaml).unwrap();

        assert_eq!(spec.apply(json!({"n": 1}), None).unwrap(), json!({"n": 1, "seen": true}));
        assert_eq!(
            spec.apply_async(json!({"n": 2}), None).await.unwrap(),
            json!({"n": 2, "seen": true})
        );

        let trace = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            trace,
            "start {\"n\":1}\nend {\"n\":1,\"seen\":true}\nstart {\"n\":2}\nend {\"n\":2,\"seen\":true}\n"
        );
    }

    #[test]
    fn test_trace_reports_unwritable_path() {
        let spec = ProcessorSpec::Trace {
            path: "/nonexistent/dir/trace.log".to_string(),
            label: "start".to_string(),
        };
        let err = spec.apply(json!(1), None).unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to open trace file"));
    }

    #[test]
    fn test_process_processor_runs_worker_command() {
        let worker = ProcessCommand::new("/usr/bin/flowline");
        let processor = ProcessorSpec::Identity
            .to_processor(ConcurrencyMechanism::Process, &worker)
            .unwrap();
        match processor {
            EventProcessor::Process { command, .. } => {
                assert_eq!(command.program, "/usr/bin/flowline");
                assert_eq!(command.args, vec!["worker", "--spec", r#"{"kind":"identity"}"#]);
            }
            _ => panic!("expected a process processor"),
        }
    }
}
