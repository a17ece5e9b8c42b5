use std::collections::VecDeque;
use std::fmt::Write as _;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, PoisonError};
use std::time::Instant;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::api::{BridgeEvent, JobOutcome, JobOutput, WorkerState};
use crate::engine::BridgeInner;
use crate::evaluator::{Evaluator, OutputStreams};
use crate::queue::{Completion, Job, JobReceiver};

/// Worker-owned bookkeeping; the only mutable state besides the contexts.
struct WorkerRuntime {
    streams: OutputStreams,
    completed: u64,
    recent_jobs: VecDeque<JobOutcome>,
    recent_jobs_max: usize,
}

impl WorkerRuntime {
    fn record(&mut self, outcome: JobOutcome) {
        self.completed += 1;
        self.recent_jobs.push_back(outcome);
        while self.recent_jobs.len() > self.recent_jobs_max.max(1) {
            self.recent_jobs.pop_front();
        }
    }
}

/// The single consumer: runs jobs strictly one at a time in admission order
/// until cancellation is observed with nothing queued.
pub(crate) async fn run_worker_loop<E: Evaluator>(
    inner: &Arc<BridgeInner<E>>,
    mut rx: JobReceiver<E::Context>,
) -> anyhow::Result<()> {
    let mut cancel = inner.cancel_rx();
    let mut runtime = WorkerRuntime {
        streams: OutputStreams::default(),
        completed: 0,
        recent_jobs: VecDeque::new(),
        recent_jobs_max: inner.config.recent_jobs_max,
    };

    while let Some(job) = rx.dequeue(&mut cancel).await {
        execute(inner, &mut runtime, job).await;
    }

    // Admissions racing the stop request may have landed after the last
    // dequeue; close the queue and run them so every admitted job completes.
    rx.close();
    let mut drained = 0usize;
    while let Some(job) = rx.drain_next().await {
        execute(inner, &mut runtime, job).await;
        drained += 1;
    }
    if drained > 0 {
        info!(drained, "ran jobs admitted during shutdown");
    }

    debug!(completed = runtime.completed, "worker loop finished");
    Ok(())
}

async fn execute<E: Evaluator>(
    inner: &Arc<BridgeInner<E>>,
    runtime: &mut WorkerRuntime,
    job: Job<E::Context>,
) {
    let Job {
        id,
        target,
        context,
        input,
        completion,
    } = job;

    debug!(job_id = id, ?target, "job started");
    inner.emit(BridgeEvent::JobStarted {
        job_id: id,
        context: target,
    });
    inner.update_snapshot(|snap| snap.worker = WorkerState::Executing);

    let started_at = Instant::now();
    let evaluator = inner.evaluator.clone();
    let streams = std::mem::take(&mut runtime.streams);
    let evaluated = tokio::task::spawn_blocking(move || {
        let mut streams = streams;
        let mut ctx = context.lock().unwrap_or_else(PoisonError::into_inner);
        evaluator.evaluate(&mut ctx, &input, &mut streams);
        streams
    })
    .await;
    let eval_ms = started_at.elapsed().as_millis() as u64;

    runtime.streams = match evaluated {
        Ok(streams) => streams,
        Err(err) => {
            error!(job_id = id, "evaluation panicked: {err}");
            let mut streams = OutputStreams::default();
            let _ = writeln!(streams.stderr, "internal error: evaluation panicked");
            streams
        }
    };

    let output = JobOutput {
        job_id: id,
        stdout: runtime.streams.stdout.clone(),
        stderr: runtime.streams.stderr.clone(),
    };
    let outcome = JobOutcome {
        job_id: id,
        context: target,
        success: output.success(),
        stdout_len: output.stdout.len(),
        stderr_len: output.stderr.len(),
        eval_ms,
        finished_at: Utc::now().timestamp_millis(),
    };
    deliver(id, completion, output);
    runtime.streams.clear();

    runtime.record(outcome.clone());
    let recent_jobs: Vec<JobOutcome> = runtime.recent_jobs.iter().cloned().collect();
    let completed = runtime.completed;
    inner.update_snapshot(|snap| {
        snap.worker = WorkerState::Waiting;
        snap.completed = completed;
        snap.recent_jobs = recent_jobs;
    });
    debug!(job_id = id, eval_ms, success = outcome.success, "job finished");
    inner.emit(BridgeEvent::JobFinished { outcome });
}

fn deliver(job_id: u64, completion: Completion, output: JobOutput) {
    match completion {
        Completion::Reply(tx) => {
            if tx.send(output).is_err() {
                debug!(job_id, "job ticket dropped before completion");
            }
        }
        Completion::Callback(callback) => {
            let JobOutput { stdout, stderr, .. } = output;
            if catch_unwind(AssertUnwindSafe(|| callback(stdout, stderr))).is_err() {
                warn!(job_id, "completion callback panicked");
            }
        }
    }
}
