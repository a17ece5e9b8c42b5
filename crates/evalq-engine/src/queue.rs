use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};

use crate::api::{BridgeError, ContextHandle, JobOutput};

/// A context shared between the registry and the jobs bound to it.
///
/// Only the worker ever locks it, so the lock is never contended.
pub(crate) type SharedContext<C> = Arc<Mutex<C>>;

pub(crate) type Callback = Box<dyn FnOnce(String, String) + Send + 'static>;

/// Where a finished job's output goes.
pub(crate) enum Completion {
    Reply(oneshot::Sender<JobOutput>),
    Callback(Callback),
}

pub(crate) struct Job<C> {
    pub(crate) id: u64,
    pub(crate) target: Option<ContextHandle>,
    pub(crate) context: SharedContext<C>,
    pub(crate) input: String,
    pub(crate) completion: Completion,
}

/// Producer half of the bounded FIFO job queue.
pub(crate) struct JobQueue<C> {
    tx: mpsc::Sender<Job<C>>,
}

/// Consumer half, owned by the worker loop.
pub(crate) struct JobReceiver<C> {
    rx: mpsc::Receiver<Job<C>>,
}

pub(crate) fn bounded<C>(capacity: usize) -> (JobQueue<C>, JobReceiver<C>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (JobQueue { tx }, JobReceiver { rx })
}

impl<C> JobQueue<C> {
    pub(crate) fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    pub(crate) fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// Admit `job` without waiting. A full queue rejects immediately.
    pub(crate) fn enqueue(&self, job: Job<C>) -> Result<(), BridgeError> {
        match self.tx.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(BridgeError::QueueFull {
                capacity: self.capacity(),
            }),
            Err(TrySendError::Closed(_)) => Err(BridgeError::ShuttingDown),
        }
    }
}

impl<C> JobReceiver<C> {
    /// Next job in admission order, or `None` once cancellation is observed
    /// with nothing queued. Queued jobs take precedence over cancellation.
    pub(crate) async fn dequeue(&mut self, cancel: &mut watch::Receiver<bool>) -> Option<Job<C>> {
        tokio::select! {
            biased;
            job = self.rx.recv() => job,
            _ = cancel.wait_for(|stop| *stop) => None,
        }
    }

    /// Refuse further admissions; jobs already queued can still be received.
    pub(crate) fn close(&mut self) {
        self.rx.close();
    }

    /// Remaining jobs after [`JobReceiver::close`].
    pub(crate) async fn drain_next(&mut self) -> Option<Job<C>> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(id: u64) -> Job<()> {
        let (tx, _rx) = oneshot::channel();
        Job {
            id,
            target: None,
            context: Arc::new(Mutex::new(())),
            input: String::new(),
            completion: Completion::Reply(tx),
        }
    }

    #[tokio::test]
    async fn rejects_when_full_and_preserves_order() {
        let (queue, mut rx) = bounded::<()>(2);
        let (_cancel_tx, mut cancel) = watch::channel(false);

        queue.enqueue(job(1)).unwrap();
        queue.enqueue(job(2)).unwrap();
        assert_eq!(queue.len(), 2);
        assert_eq!(
            queue.enqueue(job(3)).unwrap_err(),
            BridgeError::QueueFull { capacity: 2 }
        );

        assert_eq!(rx.dequeue(&mut cancel).await.map(|j| j.id), Some(1));
        queue.enqueue(job(4)).unwrap();
        assert_eq!(rx.dequeue(&mut cancel).await.map(|j| j.id), Some(2));
        assert_eq!(rx.dequeue(&mut cancel).await.map(|j| j.id), Some(4));
        assert_eq!(queue.len(), 0);
    }

    #[tokio::test]
    async fn queued_jobs_win_over_cancellation() {
        let (queue, mut rx) = bounded::<()>(4);
        let (cancel_tx, mut cancel) = watch::channel(false);

        queue.enqueue(job(1)).unwrap();
        cancel_tx.send_replace(true);

        assert_eq!(rx.dequeue(&mut cancel).await.map(|j| j.id), Some(1));
        assert!(rx.dequeue(&mut cancel).await.is_none());
    }

    #[tokio::test]
    async fn closed_queue_refuses_admission_but_drains() {
        let (queue, mut rx) = bounded::<()>(4);
        queue.enqueue(job(1)).unwrap();
        rx.close();

        assert_eq!(queue.enqueue(job(2)).unwrap_err(), BridgeError::ShuttingDown);
        assert_eq!(rx.drain_next().await.map(|j| j.id), Some(1));
        assert!(rx.drain_next().await.is_none());
    }
}
