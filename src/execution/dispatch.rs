//! Concurrency mechanisms for the concurrent stage
//!
//! Every mechanism turns an event body into a [`PendingWork`]: a future that
//! resolves once the processing function has finished, wherever it ran. The
//! stage's ordering logic only ever sees `PendingWork`, so cooperative tasks,
//! thread-pool jobs and worker processes share one admission window and one
//! reorder buffer.

use crate::core::{BoxFuture, FlowError};
use crate::execution::process::{ProcessCommand, ProcessPool};
use async_trait::async_trait;
use crossbeam_channel::{Receiver, Sender};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// How the processing function is executed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConcurrencyMechanism {
    /// Tasks on the flow's own async runtime
    Cooperative,
    /// A pool of worker threads
    Thread,
    /// A pool of worker processes
    Process,
}

impl fmt::Display for ConcurrencyMechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConcurrencyMechanism::Cooperative => write!(f, "cooperative"),
            ConcurrencyMechanism::Thread => write!(f, "thread"),
            ConcurrencyMechanism::Process => write!(f, "process"),
        }
    }
}

/// Why a unit of work produced no result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitFailure {
    /// The processing function failed or panicked
    Processing(String),
    /// The mechanism could not run the function
    Resource(String),
}

/// Outcome of one unit of work
pub type UnitOutcome = Result<Value, UnitFailure>;

/// A dispatched unit of work; resolves on completion
pub type PendingWork = BoxFuture<'static, UnitOutcome>;

type CooperativeFn<C> = Arc<dyn Fn(Value, Option<Arc<C>>) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;
type ThreadedFn<C> = Arc<dyn Fn(Value, Option<&C>) -> anyhow::Result<Value> + Send + Sync>;
type ContextEncoder<C> = fn(&C) -> serde_json::Result<Value>;

/// The user-supplied processing function, in the shape its mechanism needs
pub enum EventProcessor<C> {
    Cooperative(CooperativeFn<C>),
    Thread(ThreadedFn<C>),
    /// Workers receive a copy of the context, encoded once per stage
    Process {
        command: ProcessCommand,
        encode_context: ContextEncoder<C>,
    },
}

impl EventProcessor<()> {
    /// An async function run as a task on the flow's runtime
    pub fn cooperative<F, Fut>(function: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Self::cooperative_with_context(move |body, _| function(body))
    }

    /// A blocking function run on a worker thread
    pub fn thread<F>(function: F) -> Self
    where
        F: Fn(Value) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        Self::thread_with_context(move |body, _| function(body))
    }
}

impl<C: Send + Sync + 'static> EventProcessor<C> {
    /// Like [`EventProcessor::cooperative`], receiving the stage context
    pub fn cooperative_with_context<F, Fut>(function: F) -> Self
    where
        F: Fn(Value, Option<Arc<C>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        EventProcessor::Cooperative(Arc::new(move |body, context| Box::pin(function(body, context))))
    }

    /// Like [`EventProcessor::thread`], receiving the stage context
    pub fn thread_with_context<F>(function: F) -> Self
    where
        F: Fn(Value, Option<&C>) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        EventProcessor::Thread(Arc::new(function))
    }

    pub fn mechanism(&self) -> ConcurrencyMechanism {
        match self {
            EventProcessor::Cooperative(_) => ConcurrencyMechanism::Cooperative,
            EventProcessor::Thread(_) => ConcurrencyMechanism::Thread,
            EventProcessor::Process { .. } => ConcurrencyMechanism::Process,
        }
    }
}

impl<C: Serialize + Send + Sync + 'static> EventProcessor<C> {
    /// A worker program speaking the JSON-lines worker protocol
    pub fn process(command: ProcessCommand) -> Self {
        EventProcessor::Process {
            command,
            encode_context: |context| serde_json::to_value(context),
        }
    }
}

/// Starts units of work for one mechanism
#[async_trait]
pub trait Dispatch: Send + Sync {
    fn mechanism(&self) -> ConcurrencyMechanism;

    /// Start processing a body
    fn dispatch(&self, body: Value) -> PendingWork;

    /// Release pooled resources once no more work will be dispatched
    async fn shutdown(&self) {}
}

/// Runs async processing functions as tasks
pub struct CooperativeDispatcher<C> {
    function: CooperativeFn<C>,
    context: Option<Arc<C>>,
}

impl<C> CooperativeDispatcher<C> {
    pub fn new(function: CooperativeFn<C>, context: Option<Arc<C>>) -> Self {
        Self { function, context }
    }
}

#[async_trait]
impl<C: Send + Sync + 'static> Dispatch for CooperativeDispatcher<C> {
    fn mechanism(&self) -> ConcurrencyMechanism {
        ConcurrencyMechanism::Cooperative
    }

    fn dispatch(&self, body: Value) -> PendingWork {
        let work = (self.function)(body, self.context.clone());
        Box::pin(async move { work.await.map_err(|e| UnitFailure::Processing(format!("{:#}", e))) })
    }
}

type Job = Box<dyn FnOnce() + Send>;

/// Fixed set of named worker threads fed through a channel
pub struct ThreadPool {
    jobs: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    /// Spawn `size` threads named `<name>-<n>`
    pub fn new(name: &str, size: usize) -> std::io::Result<Self> {
        let (jobs, queue) = crossbeam_channel::unbounded::<Job>();
        let mut workers = Vec::with_capacity(size);
        for n in 0..size {
            let queue: Receiver<Job> = queue.clone();
            let handle = std::thread::Builder::new()
                .name(format!("{}-{}", name, n))
                .spawn(move || {
                    while let Ok(job) = queue.recv() {
                        job();
                    }
                })?;
            workers.push(handle);
        }
        Ok(Self {
            jobs: Some(jobs),
            workers,
        })
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Queue a job; false once the pool has shut down
    pub fn execute(&self, job: Job) -> bool {
        match &self.jobs {
            Some(jobs) => jobs.send(job).is_ok(),
            None => false,
        }
    }

    /// Stop accepting jobs and wait for the workers to finish
    pub fn join(mut self) {
        self.jobs.take();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                warn!("Worker thread exited with a panic");
            }
        }
    }
}

/// Runs blocking processing functions on a [`ThreadPool`]
pub struct ThreadedDispatcher<C> {
    function: ThreadedFn<C>,
    context: Option<Arc<C>>,
    pool: std::sync::Mutex<Option<ThreadPool>>,
}

impl<C> ThreadedDispatcher<C> {
    pub fn new(function: ThreadedFn<C>, context: Option<Arc<C>>, pool: ThreadPool) -> Self {
        Self {
            function,
            context,
            pool: std::sync::Mutex::new(Some(pool)),
        }
    }
}

#[async_trait]
impl<C: Send + Sync + 'static> Dispatch for ThreadedDispatcher<C> {
    fn mechanism(&self) -> ConcurrencyMechanism {
        ConcurrencyMechanism::Thread
    }

    fn dispatch(&self, body: Value) -> PendingWork {
        let (done, completion) = oneshot::channel();
        let function = self.function.clone();
        let context = self.context.clone();
        let job: Job = Box::new(move || {
            let outcome = catch_unwind(AssertUnwindSafe(|| function(body, context.as_deref())));
            let outcome = match outcome {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(UnitFailure::Processing(format!("{:#}", e))),
                Err(_) => Err(UnitFailure::Processing("processing function panicked".to_string())),
            };
            let _ = done.send(outcome);
        });

        let queued = self
            .pool
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .as_ref()
            .map(|pool| pool.execute(job))
            .unwrap_or(false);

        Box::pin(async move {
            if !queued {
                return Err(UnitFailure::Resource("thread pool is shut down".to_string()));
            }
            completion
                .await
                .unwrap_or_else(|_| Err(UnitFailure::Resource("worker thread dropped the job".to_string())))
        })
    }

    async fn shutdown(&self) {
        let pool = self
            .pool
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(pool) = pool {
            let size = pool.size();
            if tokio::task::spawn_blocking(move || pool.join()).await.is_err() {
                warn!("Joining the thread pool failed");
            }
            debug!("Thread pool of {} workers stopped", size);
        }
    }
}

/// Runs processing functions in worker processes
pub struct ProcessDispatcher {
    pool: Arc<ProcessPool>,
}

impl ProcessDispatcher {
    pub fn new(pool: ProcessPool) -> Self {
        Self { pool: Arc::new(pool) }
    }
}

#[async_trait]
impl Dispatch for ProcessDispatcher {
    fn mechanism(&self) -> ConcurrencyMechanism {
        ConcurrencyMechanism::Process
    }

    fn dispatch(&self, body: Value) -> PendingWork {
        let pool = self.pool.clone();
        Box::pin(async move { pool.process(body).await })
    }

    async fn shutdown(&self) {
        self.pool.shutdown().await;
    }
}

/// Build the dispatcher for a processor
pub(crate) fn dispatcher_for<C>(
    step: &str,
    processor: &EventProcessor<C>,
    context: Option<Arc<C>>,
    pool_size: usize,
) -> Result<Arc<dyn Dispatch>, FlowError>
where
    C: Send + Sync + 'static,
{
    let dispatcher: Arc<dyn Dispatch> = match processor {
        EventProcessor::Cooperative(function) => Arc::new(CooperativeDispatcher::new(function.clone(), context)),
        EventProcessor::Thread(function) => {
            let pool = ThreadPool::new(step, pool_size)
                .map_err(|e| FlowError::resource(step, format!("failed to spawn worker threads: {}", e)))?;
            Arc::new(ThreadedDispatcher::new(function.clone(), context, pool))
        }
        EventProcessor::Process { command, encode_context } => {
            let context = match context {
                Some(context) => encode_context(context.as_ref())
                    .map_err(|e| FlowError::usage(format!("context of step '{}' is not serializable: {}", step, e)))?,
                None => Value::Null,
            };
            Arc::new(ProcessDispatcher::new(ProcessPool::new(step, command.clone(), context, pool_size)))
        }
    };
    Ok(dispatcher)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_cooperative_dispatch_passes_context() {
        let processor = EventProcessor::<String>::cooperative_with_context(|body, context| async move {
            Ok(json!(format!("{}{}", context.map(|c| c.to_string()).unwrap_or_default(), body)))
        });
        let EventProcessor::Cooperative(function) = processor else {
            panic!("expected cooperative processor");
        };
        let dispatcher = CooperativeDispatcher::new(function, Some(Arc::new("ctx-".to_string())));
        assert_eq!(dispatcher.dispatch(json!(1)).await, Ok(json!("ctx-1")));
    }

    #[tokio::test]
    async fn test_thread_dispatch_reports_errors_and_panics() {
        let processor = EventProcessor::thread(|body| match body.as_i64() {
            Some(0) => anyhow::bail!("zero is not allowed"),
            Some(1) => panic!("one is worse"),
            _ => Ok(body),
        });
        let EventProcessor::Thread(function) = processor else {
            panic!("expected thread processor");
        };
        let pool = ThreadPool::new("test-pool", 2).unwrap();
        let dispatcher = ThreadedDispatcher::new(function, None, pool);

        assert_eq!(dispatcher.dispatch(json!(5)).await, Ok(json!(5)));
        assert_eq!(
            dispatcher.dispatch(json!(0)).await,
            Err(UnitFailure::Processing("zero is not allowed".to_string()))
        );
        assert_eq!(
            dispatcher.dispatch(json!(1)).await,
            Err(UnitFailure::Processing("processing function panicked".to_string()))
        );

        dispatcher.shutdown().await;
        assert!(matches!(dispatcher.dispatch(json!(2)).await, Err(UnitFailure::Resource(_))));
    }

    #[test]
    fn test_mechanism_from_processor() {
        let processor = EventProcessor::<()>::process(ProcessCommand::new("worker"));
        assert_eq!(processor.mechanism(), ConcurrencyMechanism::Process);
        assert_eq!(ConcurrencyMechanism::Thread.to_string(), "thread");
    }
}
