//! Public API types for the evaluation bridge.

use std::fmt;
use std::sync::Arc;

use evalq_core::settings::{ContextConfig, ContextMode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;

use crate::engine::BridgeInner;
use crate::evaluator::Evaluator;
use crate::queue::Completion;
use crate::session::Session;

/// Configuration for a bridge instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeConfig {
    /// One implicit context, or a registry of handle-addressed contexts.
    pub mode: ContextMode,

    /// Maximum number of admitted jobs waiting for the worker.
    ///
    /// Zero selects the mode's default.
    pub queue_capacity: usize,

    /// Options for every context the bridge creates.
    pub context: ContextConfig,

    /// Maximum number of completed jobs retained in the snapshot.
    pub recent_jobs_max: usize,
}

impl BridgeConfig {
    /// Default queue capacity for the multi-context mode.
    pub const DEFAULT_MULTI_QUEUE_CAPACITY: usize = 100;

    /// Default queue capacity for the single-context mode.
    pub const DEFAULT_SINGLE_QUEUE_CAPACITY: usize = 1;

    /// Default size of the recent-jobs ring buffer.
    pub const DEFAULT_RECENT_JOBS_MAX: usize = 32;

    /// Multi-context configuration with default limits.
    pub fn multi() -> Self {
        Self {
            mode: ContextMode::Multi,
            queue_capacity: Self::DEFAULT_MULTI_QUEUE_CAPACITY,
            context: ContextConfig::default(),
            recent_jobs_max: Self::DEFAULT_RECENT_JOBS_MAX,
        }
    }

    /// Single-context configuration with default limits.
    pub fn single() -> Self {
        Self {
            mode: ContextMode::Single,
            queue_capacity: Self::DEFAULT_SINGLE_QUEUE_CAPACITY,
            ..Self::multi()
        }
    }

    /// Set the queue capacity.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub(crate) fn normalized(mut self) -> Self {
        if self.queue_capacity == 0 {
            self.queue_capacity = match self.mode {
                ContextMode::Single => Self::DEFAULT_SINGLE_QUEUE_CAPACITY,
                ContextMode::Multi => Self::DEFAULT_MULTI_QUEUE_CAPACITY,
            };
        }
        if self.recent_jobs_max == 0 {
            self.recent_jobs_max = Self::DEFAULT_RECENT_JOBS_MAX;
        }
        self
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self::multi()
    }
}

/// Opaque reference to a context slot. Never reused within a bridge's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextHandle(usize);

impl ContextHandle {
    /// Wrap a raw slot index received from a host.
    pub fn from_raw(index: usize) -> Self {
        Self(index)
    }

    /// Raw slot index, for handing to a host.
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for ContextHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Errors reported synchronously to producers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    /// The job queue is at capacity; the submission was rejected.
    #[error("job queue full (capacity {capacity})")]
    QueueFull {
        /// Configured capacity.
        capacity: usize,
    },

    /// The handle was never issued or its context has been destroyed.
    #[error("invalid context handle {0}")]
    InvalidHandle(ContextHandle),

    /// A multi-context bridge was asked to run a job without a handle.
    #[error("a context handle is required in multi-context mode")]
    MissingHandle,

    /// Handle operations against a single-context bridge.
    #[error("context handles are not supported in single-context mode")]
    HandlesUnsupported,

    /// Shutdown has been requested; no new jobs are admitted.
    #[error("bridge is shutting down")]
    ShuttingDown,

    /// The job was admitted but the worker went away before completing it.
    #[error("job abandoned before completion")]
    Abandoned,
}

impl BridgeError {
    /// Whether the error indicates a caller-side bug rather than a transient
    /// condition. Hosts abort on fatal errors instead of retrying.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BridgeError::InvalidHandle(_)
                | BridgeError::MissingHandle
                | BridgeError::HandlesUnsupported
        )
    }
}

/// Captured result of one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOutput {
    /// Job identifier (admission order).
    pub job_id: u64,
    /// Text written to the output stream.
    pub stdout: String,
    /// Text written to the error stream (engine errors land here).
    pub stderr: String,
}

impl JobOutput {
    /// True when the engine wrote nothing to the error stream.
    pub fn success(&self) -> bool {
        self.stderr.is_empty()
    }
}

/// Summary of a completed job retained in the snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOutcome {
    /// Job identifier (admission order).
    pub job_id: u64,
    /// Context the job ran against; `None` for the implicit context.
    pub context: Option<ContextHandle>,
    /// Whether the error stream was empty.
    pub success: bool,
    /// Bytes written to the output stream.
    pub stdout_len: usize,
    /// Bytes written to the error stream.
    pub stderr_len: usize,
    /// Time spent inside the engine (milliseconds).
    pub eval_ms: u64,
    /// Completion time (UTC, milliseconds since the epoch).
    pub finished_at: i64,
}

/// State of the worker loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerState {
    /// Blocked on the next job or cancellation.
    Waiting,
    /// Running one job to completion.
    Executing,
    /// Exited; no further jobs will run.
    Terminal,
}

/// Bridge event stream payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BridgeEvent {
    /// Worker loop started.
    Started,
    /// Shutdown was requested (emitted once).
    StopRequested,
    /// A context was added to the registry.
    ContextCreated {
        /// New handle.
        handle: ContextHandle,
    },
    /// A live context was tombstoned.
    ContextDestroyed {
        /// Destroyed handle.
        handle: ContextHandle,
    },
    /// The worker dequeued a job.
    JobStarted {
        /// Job identifier.
        job_id: u64,
        /// Target context.
        context: Option<ContextHandle>,
    },
    /// A job finished and its completion was delivered.
    JobFinished {
        /// Job outcome.
        outcome: JobOutcome,
    },
    /// Worker loop reached its terminal state.
    Stopped,
}

/// Current bridge state snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    /// Whether shutdown has been requested.
    pub stop_requested: bool,
    /// Worker loop state.
    pub worker: WorkerState,
    /// Jobs admitted but not yet dequeued.
    pub queued: usize,
    /// Jobs completed so far.
    pub completed: u64,
    /// Contexts currently resolvable.
    pub live_contexts: usize,
    /// Recently completed jobs (newest last).
    pub recent_jobs: Vec<JobOutcome>,
}

/// Pending result of a submitted job.
#[derive(Debug)]
pub struct JobTicket {
    job_id: u64,
    rx: oneshot::Receiver<JobOutput>,
}

impl JobTicket {
    /// Job identifier assigned at admission.
    pub fn job_id(&self) -> u64 {
        self.job_id
    }

    /// Wait for the worker to finish the job.
    pub async fn output(self) -> Result<JobOutput, BridgeError> {
        self.rx.await.map_err(|_| BridgeError::Abandoned)
    }
}

/// Producer-side handle. Cheap to clone; every clone talks to the same worker.
pub struct Bridge<E: Evaluator> {
    pub(crate) inner: Arc<BridgeInner<E>>,
}

impl<E: Evaluator> Clone for Bridge<E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<E: Evaluator> Bridge<E> {
    /// Effective (normalized) configuration.
    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    /// Create a context with the bridge's default context options.
    pub fn new_context(&self) -> Result<ContextHandle, BridgeError> {
        self.inner.new_context(&self.inner.config.context)
    }

    /// Create a context with explicit options.
    pub fn new_context_with(&self, config: ContextConfig) -> Result<ContextHandle, BridgeError> {
        self.inner.new_context(&config)
    }

    /// Tombstone a context. Unknown or already destroyed handles are ignored.
    pub fn destroy_context(&self, handle: ContextHandle) -> Result<(), BridgeError> {
        self.inner.destroy_context(handle)
    }

    /// Whether `handle` currently resolves to a live context.
    pub fn is_live(&self, handle: ContextHandle) -> bool {
        self.inner.is_live(handle)
    }

    /// Enqueue `input` for evaluation and return a ticket for its output.
    ///
    /// `target` must be `Some` in multi-context mode and `None` in
    /// single-context mode. Never blocks.
    pub fn submit(
        &self,
        target: Option<ContextHandle>,
        input: impl Into<String>,
    ) -> Result<JobTicket, BridgeError> {
        let (tx, rx) = oneshot::channel();
        let job_id = self
            .inner
            .enqueue(target, input.into(), Completion::Reply(tx))?;
        Ok(JobTicket { job_id, rx })
    }

    /// Enqueue `input` and invoke `callback(stdout, stderr)` on the worker once
    /// the job has run. Returns the job id. Never blocks.
    pub fn submit_with<F>(
        &self,
        target: Option<ContextHandle>,
        input: impl Into<String>,
        callback: F,
    ) -> Result<u64, BridgeError>
    where
        F: FnOnce(String, String) + Send + 'static,
    {
        self.inner
            .enqueue(target, input.into(), Completion::Callback(Box::new(callback)))
    }

    /// Open a session that owns a fresh context until dropped.
    pub fn session(&self) -> Result<Session<E>, BridgeError> {
        Session::open(self)
    }

    /// Request a graceful shutdown. Idempotent.
    pub fn request_stop(&self) {
        self.inner.request_stop();
    }

    /// Whether shutdown has been requested.
    pub fn is_stopping(&self) -> bool {
        self.inner.should_stop()
    }
}

/// Handle to a running bridge instance.
pub struct BridgeHandle<E: Evaluator> {
    pub(crate) inner: Arc<BridgeInner<E>>,
    pub(crate) join: tokio::task::JoinHandle<anyhow::Result<()>>,
}

/// Start a new bridge: creates the queue (and the implicit context in
/// single-context mode) and spawns the worker loop.
///
/// Must be called from within a tokio runtime.
pub fn start_bridge<E: Evaluator>(config: BridgeConfig, evaluator: E) -> BridgeHandle<E> {
    crate::engine::start_bridge(config, evaluator)
}

impl<E: Evaluator> BridgeHandle<E> {
    /// Producer handle for this bridge.
    pub fn bridge(&self) -> Bridge<E> {
        Bridge {
            inner: self.inner.clone(),
        }
    }

    /// Subscribe to the bridge event stream.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<BridgeEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Get the latest snapshot.
    pub fn snapshot(&self) -> StatusSnapshot {
        self.inner.snapshot_tx.borrow().clone()
    }

    /// Receiver notified on every snapshot change.
    pub fn watch_snapshot(&self) -> tokio::sync::watch::Receiver<StatusSnapshot> {
        self.inner.snapshot_tx.subscribe()
    }

    /// Request a graceful shutdown (finish admitted work, admit nothing new).
    pub fn request_stop(&self) {
        self.inner.request_stop();
    }

    /// Wait for the worker loop to reach its terminal state.
    pub async fn wait(self) -> anyhow::Result<()> {
        match self.join.await {
            Ok(res) => res,
            Err(err) => Err(anyhow::anyhow!("bridge worker join error: {err}")),
        }
    }
}
