use std::path::PathBuf;

use anyhow::Context;
use tracing::{debug, warn};

use evalq_engine::{
    Bridge, BridgeError, BridgeHandle, CalcEvaluator, ContextHandle, JobOutput, JobTicket, Session,
};

enum Pending {
    Queued(JobTicket),
    Done(Result<JobOutput, BridgeError>),
}

impl Pending {
    async fn settle(&mut self) {
        let current = std::mem::replace(self, Pending::Done(Err(BridgeError::Abandoned)));
        *self = match current {
            Pending::Queued(ticket) => Pending::Done(ticket.output().await),
            done => done,
        };
    }
}

struct FileJob {
    path: PathBuf,
    _session: Session<CalcEvaluator>,
    pending: Pending,
}

/// Submit `source`, waiting on the oldest unfinished file whenever the queue
/// is full.
async fn submit_with_retry(
    bridge: &Bridge<CalcEvaluator>,
    handle: ContextHandle,
    source: String,
    earlier: &mut [FileJob],
) -> Result<JobTicket, BridgeError> {
    loop {
        match bridge.submit(Some(handle), source.clone()) {
            Err(BridgeError::QueueFull { capacity }) => {
                let Some(oldest) = earlier
                    .iter_mut()
                    .find(|job| matches!(job.pending, Pending::Queued(_)))
                else {
                    return Err(BridgeError::QueueFull { capacity });
                };
                debug!(path = %oldest.path.display(), "queue full, waiting for an earlier file");
                oldest.pending.settle().await;
            }
            other => return other,
        }
    }
}

/// Evaluate every file in its own session. Files are queued as fast as the
/// queue admits them; output is printed in argument order.
pub async fn run_files(
    handle: BridgeHandle<CalcEvaluator>,
    files: Vec<PathBuf>,
) -> anyhow::Result<i32> {
    let bridge = handle.bridge();
    let mut jobs: Vec<FileJob> = Vec::with_capacity(files.len());
    for path in files {
        let source = std::fs::read_to_string(&path)
            .with_context(|| format!("read {}", path.display()))?;
        let session = bridge.session()?;
        let submitted = submit_with_retry(&bridge, session.handle(), source, &mut jobs).await;
        let pending = match submitted {
            Ok(ticket) => Pending::Queued(ticket),
            Err(err) => Pending::Done(Err(err)),
        };
        jobs.push(FileJob {
            path,
            _session: session,
            pending,
        });
    }

    let show_headers = jobs.len() > 1;
    let mut failed = false;
    for mut job in jobs {
        job.pending.settle().await;
        let Pending::Done(output) = job.pending else {
            continue;
        };
        if show_headers {
            println!("==> {} <==", job.path.display());
        }
        match output {
            Ok(JobOutput { stdout, stderr, .. }) => {
                print!("{stdout}");
                eprint!("{stderr}");
                failed |= !stderr.is_empty();
            }
            Err(err) => {
                warn!(path = %job.path.display(), "not evaluated: {err}");
                eprintln!("{}: {err}", job.path.display());
                failed = true;
            }
        }
    }

    handle.request_stop();
    handle.wait().await?;
    Ok(i32::from(failed))
}
