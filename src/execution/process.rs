//! Worker processes for the process concurrency mechanism
//!
//! Workers are long-lived child processes that speak newline-delimited JSON
//! on stdin/stdout. The parent sends one `init` frame carrying a copy of the
//! stage context, then one `process` frame per event; every frame gets exactly
//! one reply.

use crate::execution::dispatch::{UnitFailure, UnitOutcome};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, Semaphore};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// How long a worker gets to exit after its stdin is closed
const WORKER_EXIT_GRACE: Duration = Duration::from_secs(5);

/// Program and arguments used to start a worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl ProcessCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

/// Frame sent to a worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerRequest {
    Init {
        #[serde(default)]
        context: Value,
    },
    Process {
        body: Value,
    },
}

/// Frame sent back by a worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WorkerReply {
    Ok {
        #[serde(default)]
        body: Value,
    },
    Error {
        message: String,
    },
}

/// Parent-side handle on one worker process
struct Worker {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
}

impl Worker {
    async fn spawn(command: &ProcessCommand, context: &Value) -> Result<Self, String> {
        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| format!("failed to start worker '{}': {}", command.program, e))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| "worker stdin is not piped".to_string())?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| "worker stdout is not piped".to_string())?;

        let mut worker = Self {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
        };

        match worker
            .exchange(&WorkerRequest::Init {
                context: context.clone(),
            })
            .await?
        {
            WorkerReply::Ok { .. } => Ok(worker),
            WorkerReply::Error { message } => Err(format!("worker rejected its context: {}", message)),
        }
    }

    /// Send one frame and read its reply
    async fn exchange(&mut self, request: &WorkerRequest) -> Result<WorkerReply, String> {
        let mut line = serde_json::to_string(request).map_err(|e| format!("failed to encode frame: {}", e))?;
        line.push('\n');
        self.stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| format!("failed to write to worker: {}", e))?;
        self.stdin
            .flush()
            .await
            .map_err(|e| format!("failed to write to worker: {}", e))?;

        let reply = self
            .stdout
            .next_line()
            .await
            .map_err(|e| format!("failed to read from worker: {}", e))?
            .ok_or_else(|| "worker exited unexpectedly".to_string())?;
        serde_json::from_str(&reply).map_err(|e| format!("malformed worker reply '{}': {}", reply.trim(), e))
    }

    async fn stop(self) {
        let Worker { mut child, stdin, .. } = self;
        drop(stdin);
        match timeout(WORKER_EXIT_GRACE, child.wait()).await {
            Ok(Ok(status)) if !status.success() => warn!("Worker exited with {}", status),
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!("Failed to wait for worker: {}", e),
            Err(_) => {
                warn!("Worker did not exit within {:?}, killing it", WORKER_EXIT_GRACE);
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill worker: {}", e);
                }
            }
        }
    }
}

/// A pool of up to `capacity` workers, started on demand
pub struct ProcessPool {
    step: String,
    command: ProcessCommand,
    context: Value,
    slots: Semaphore,
    idle: Mutex<Vec<Worker>>,
    spawned: AtomicUsize,
}

impl ProcessPool {
    pub fn new(step: &str, command: ProcessCommand, context: Value, capacity: usize) -> Self {
        Self {
            step: step.to_string(),
            command,
            context,
            slots: Semaphore::new(capacity),
            idle: Mutex::new(Vec::new()),
            spawned: AtomicUsize::new(0),
        }
    }

    /// Number of workers started so far
    pub fn spawned(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }

    /// Run one body through an idle worker, starting one if none is free
    pub async fn process(&self, body: Value) -> UnitOutcome {
        let _slot = self
            .slots
            .acquire()
            .await
            .map_err(|_| UnitFailure::Resource("process pool is shut down".to_string()))?;

        let idle = self.idle.lock().await.pop();
        let mut worker = match idle {
            Some(worker) => worker,
            None => {
                let worker = Worker::spawn(&self.command, &self.context)
                    .await
                    .map_err(UnitFailure::Resource)?;
                let count = self.spawned.fetch_add(1, Ordering::SeqCst) + 1;
                debug!("Step '{}' started worker process {}", self.step, count);
                worker
            }
        };

        // A worker that failed mid-exchange is dropped, which kills it.
        let reply = worker
            .exchange(&WorkerRequest::Process { body })
            .await
            .map_err(UnitFailure::Resource)?;
        self.idle.lock().await.push(worker);

        match reply {
            WorkerReply::Ok { body } => Ok(body),
            WorkerReply::Error { message } => Err(UnitFailure::Processing(message)),
        }
    }

    /// Refuse new work and stop every idle worker
    pub async fn shutdown(&self) {
        self.slots.close();
        let workers: Vec<Worker> = self.idle.lock().await.drain(..).collect();
        let count = workers.len();
        for worker in workers {
            worker.stop().await;
        }
        info!("Step '{}' stopped {} worker processes", self.step, count);
    }
}

/// Worker side of the protocol
///
/// Reads frames from `reader` until end of input, answering each one on
/// `writer`. The handler receives the body and the context from the `init`
/// frame (`Null` when none was sent).
pub async fn serve_worker<R, W, F>(reader: R, mut writer: W, mut handler: F) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
    F: FnMut(Value, &Value) -> anyhow::Result<Value>,
{
    let mut lines = reader.lines();
    let mut context = Value::Null;
    let mut handled = 0u64;

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let reply = match serde_json::from_str::<WorkerRequest>(&line) {
            Ok(WorkerRequest::Init { context: received }) => {
                context = received;
                WorkerReply::Ok { body: Value::Null }
            }
            Ok(WorkerRequest::Process { body }) => {
                handled += 1;
                match handler(body, &context) {
                    Ok(body) => WorkerReply::Ok { body },
                    Err(e) => WorkerReply::Error {
                        message: format!("{:#}", e),
                    },
                }
            }
            Err(e) => WorkerReply::Error {
                message: format!("malformed frame: {}", e),
            },
        };

        let mut encoded = serde_json::to_string(&reply)?;
        encoded.push('\n');
        writer.write_all(encoded.as_bytes()).await?;
        writer.flush().await?;
    }

    debug!("Worker input closed after {} events", handled);
    Ok(())
}
