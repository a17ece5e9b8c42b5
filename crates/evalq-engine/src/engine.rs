use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use evalq_core::settings::{ContextConfig, ContextMode};
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

use crate::api::{
    BridgeConfig, BridgeError, BridgeEvent, BridgeHandle, ContextHandle, StatusSnapshot,
    WorkerState,
};
use crate::evaluator::Evaluator;
use crate::queue::{bounded, Completion, Job, JobQueue, JobReceiver, SharedContext};
use crate::registry::ContextRegistry;

/// Where jobs find their context: one implicit context, or the registry.
enum Contexts<C> {
    Single(SharedContext<C>),
    Multi(ContextRegistry<C>),
}

pub(crate) struct BridgeInner<E: Evaluator> {
    pub(crate) config: BridgeConfig,
    pub(crate) evaluator: Arc<E>,
    pub(crate) event_tx: broadcast::Sender<BridgeEvent>,
    pub(crate) snapshot_tx: watch::Sender<StatusSnapshot>,
    contexts: Contexts<E::Context>,
    queue: JobQueue<E::Context>,
    stop_requested: AtomicBool,
    cancel_tx: watch::Sender<bool>,
    /// Id of the last admitted job. Held across `try_send` so ids follow
    /// queue order and rejected submissions consume none.
    last_job_id: Mutex<u64>,
}

impl<E: Evaluator> BridgeInner<E> {
    pub(crate) fn emit(&self, event: BridgeEvent) {
        let _ = self.event_tx.send(event);
    }

    pub(crate) fn update_snapshot(&self, f: impl FnOnce(&mut StatusSnapshot)) {
        self.snapshot_tx.send_modify(|snap| {
            f(snap);
            snap.queued = self.queue.len();
            snap.stop_requested = self.should_stop();
        });
    }

    pub(crate) fn request_stop(&self) {
        if !self.stop_requested.swap(true, Ordering::SeqCst) {
            info!("stop requested");
            self.cancel_tx.send_replace(true);
            self.emit(BridgeEvent::StopRequested);
            self.update_snapshot(|_| {});
        }
    }

    pub(crate) fn should_stop(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    pub(crate) fn cancel_rx(&self) -> watch::Receiver<bool> {
        self.cancel_tx.subscribe()
    }

    fn live_contexts(&self) -> usize {
        match &self.contexts {
            Contexts::Single(_) => 1,
            Contexts::Multi(registry) => registry.live(),
        }
    }

    pub(crate) fn new_context(&self, config: &ContextConfig) -> Result<ContextHandle, BridgeError> {
        let Contexts::Multi(registry) = &self.contexts else {
            return Err(BridgeError::HandlesUnsupported);
        };
        let handle = registry.insert(self.evaluator.new_context(config));
        debug!(%handle, restricted = config.restricted, "context created");
        self.emit(BridgeEvent::ContextCreated { handle });
        self.update_snapshot(|snap| snap.live_contexts = registry.live());
        Ok(handle)
    }

    pub(crate) fn destroy_context(&self, handle: ContextHandle) -> Result<(), BridgeError> {
        let Contexts::Multi(registry) = &self.contexts else {
            return Err(BridgeError::HandlesUnsupported);
        };
        if registry.destroy(handle) {
            debug!(%handle, "context destroyed");
            self.emit(BridgeEvent::ContextDestroyed { handle });
            self.update_snapshot(|snap| snap.live_contexts = registry.live());
        } else {
            debug!(%handle, "ignoring destroy of unknown context");
        }
        Ok(())
    }

    pub(crate) fn is_live(&self, handle: ContextHandle) -> bool {
        match &self.contexts {
            Contexts::Single(_) => false,
            Contexts::Multi(registry) => registry.resolve(handle).is_some(),
        }
    }

    fn resolve_target(
        &self,
        target: Option<ContextHandle>,
    ) -> Result<SharedContext<E::Context>, BridgeError> {
        match (&self.contexts, target) {
            (Contexts::Single(context), None) => Ok(context.clone()),
            (Contexts::Single(_), Some(_)) => Err(BridgeError::HandlesUnsupported),
            (Contexts::Multi(_), None) => Err(BridgeError::MissingHandle),
            (Contexts::Multi(registry), Some(handle)) => registry
                .resolve(handle)
                .ok_or(BridgeError::InvalidHandle(handle)),
        }
    }

    pub(crate) fn enqueue(
        &self,
        target: Option<ContextHandle>,
        input: String,
        completion: Completion,
    ) -> Result<u64, BridgeError> {
        if self.should_stop() {
            return Err(BridgeError::ShuttingDown);
        }
        let context = self.resolve_target(target).inspect_err(|err| {
            error!(?target, "rejected job: {err}");
        })?;

        let mut last_job_id = self.last_job_id.lock().unwrap_or_else(PoisonError::into_inner);
        let id = *last_job_id + 1;
        let job = Job {
            id,
            target,
            context,
            input,
            completion,
        };
        match self.queue.enqueue(job) {
            Ok(()) => {
                *last_job_id = id;
                drop(last_job_id);
                debug!(job_id = id, ?target, "job admitted");
                self.update_snapshot(|_| {});
                Ok(id)
            }
            Err(err) => {
                drop(last_job_id);
                warn!(?target, "job rejected: {err}");
                Err(err)
            }
        }
    }
}

pub(crate) fn start_bridge<E: Evaluator>(config: BridgeConfig, evaluator: E) -> BridgeHandle<E> {
    let config = config.normalized();
    let evaluator = Arc::new(evaluator);

    let contexts = match config.mode {
        ContextMode::Single => Contexts::Single(Arc::new(Mutex::new(
            evaluator.new_context(&config.context),
        ))),
        ContextMode::Multi => Contexts::Multi(ContextRegistry::new()),
    };
    let live_contexts = match &contexts {
        Contexts::Single(_) => 1,
        Contexts::Multi(_) => 0,
    };

    let (queue, rx) = bounded(config.queue_capacity);
    let (event_tx, _) = broadcast::channel::<BridgeEvent>(1024);
    let (snapshot_tx, _) = watch::channel(StatusSnapshot {
        stop_requested: false,
        worker: WorkerState::Waiting,
        queued: 0,
        completed: 0,
        live_contexts,
        recent_jobs: Vec::new(),
    });
    let (cancel_tx, _) = watch::channel(false);

    let inner = Arc::new(BridgeInner {
        config,
        evaluator,
        event_tx,
        snapshot_tx,
        contexts,
        queue,
        stop_requested: AtomicBool::new(false),
        cancel_tx,
        last_job_id: Mutex::new(0),
    });

    let join = tokio::spawn(run_bridge(inner.clone(), rx));
    BridgeHandle { inner, join }
}

async fn run_bridge<E: Evaluator>(
    inner: Arc<BridgeInner<E>>,
    rx: JobReceiver<E::Context>,
) -> anyhow::Result<()> {
    info!(
        mode = ?inner.config.mode,
        queue_capacity = inner.config.queue_capacity,
        "bridge started"
    );
    inner.emit(BridgeEvent::Started);

    let result = crate::worker::run_worker_loop(&inner, rx).await;

    inner.update_snapshot(|snap| {
        snap.worker = WorkerState::Terminal;
        snap.live_contexts = inner.live_contexts();
    });
    inner.emit(BridgeEvent::Stopped);
    info!("bridge stopped");
    result
}
