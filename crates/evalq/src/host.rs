//! JSON-lines host over stdin/stdout.
//!
//! Each input line is one request; each output line one response. Results
//! arrive asynchronously, tagged with the request id the caller chose.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use evalq_engine::{BridgeError, CalcEvaluator, ContextHandle, ENTRY_POINTS, EntryPoints, Host};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum Request {
    NewContext,
    DestroyContext {
        context: ContextHandle,
    },
    Run {
        id: u64,
        #[serde(default)]
        context: Option<ContextHandle>,
        input: String,
    },
    Exit,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Response {
    Ready {
        slot: String,
        entries: Vec<&'static str>,
    },
    Context {
        context: ContextHandle,
    },
    Result {
        id: u64,
        stdout: String,
        stderr: String,
    },
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        message: String,
        fatal: bool,
    },
}

impl Response {
    fn error(id: Option<u64>, err: &BridgeError) -> Self {
        Response::Error {
            id,
            message: err.to_string(),
            fatal: err.is_fatal(),
        }
    }
}

/// What the reader loop does after a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
    Abort,
}

/// Apply one request line to the entry points. Responses, including the
/// asynchronous `result`, go to `out`.
pub fn dispatch(
    entries: &EntryPoints<CalcEvaluator>,
    line: &str,
    out: &mpsc::UnboundedSender<Response>,
) -> Flow {
    let request = match serde_json::from_str::<Request>(line) {
        Ok(request) => request,
        Err(err) => {
            warn!("malformed request: {err}");
            let _ = out.send(Response::Error {
                id: None,
                message: format!("malformed request: {err}"),
                fatal: false,
            });
            return Flow::Continue;
        }
    };

    let failure = match request {
        Request::NewContext => match entries.new_context() {
            Ok(context) => {
                let _ = out.send(Response::Context { context });
                return Flow::Continue;
            }
            Err(err) => (None, err),
        },
        Request::DestroyContext { context } => {
            entries.destroy_context(context);
            return Flow::Continue;
        }
        Request::Run { id, context, input } => {
            let results = out.clone();
            let submitted = entries.run(context, input, move |stdout, stderr| {
                let _ = results.send(Response::Result { id, stdout, stderr });
            });
            match submitted {
                Ok(job_id) => {
                    debug!(id, job_id, "run admitted");
                    return Flow::Continue;
                }
                Err(err) => (Some(id), err),
            }
        }
        Request::Exit => {
            entries.exit();
            return Flow::Exit;
        }
    };

    let (id, err) = failure;
    let _ = out.send(Response::error(id, &err));
    if err.is_fatal() {
        error!("aborting session: {err}");
        entries.exit();
        Flow::Abort
    } else {
        Flow::Continue
    }
}

/// Host reading requests from stdin and writing responses to stdout.
pub struct StdioHost {
    out: Option<mpsc::UnboundedSender<Response>>,
    writer: Option<JoinHandle<anyhow::Result<()>>>,
    reader: Option<JoinHandle<()>>,
    aborted: Arc<AtomicBool>,
}

impl StdioHost {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            out: Some(tx),
            writer: Some(tokio::spawn(write_responses(rx))),
            reader: None,
            aborted: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Stop reading, flush every pending response and report whether the
    /// session was aborted by a fatal request.
    pub async fn finish(mut self) -> anyhow::Result<bool> {
        if let Some(reader) = self.reader.take() {
            reader.abort();
            let _ = reader.await;
        }
        self.out = None;
        if let Some(writer) = self.writer.take() {
            writer.await.context("response writer join")??;
        }
        Ok(self.aborted.load(Ordering::SeqCst))
    }
}

impl Host<CalcEvaluator> for StdioHost {
    fn register(&mut self, slot: &str, entries: EntryPoints<CalcEvaluator>) -> anyhow::Result<()> {
        let out = self
            .out
            .clone()
            .context("stdio host already finished")?;
        out.send(Response::Ready {
            slot: slot.to_string(),
            entries: ENTRY_POINTS.to_vec(),
        })
        .context("response writer closed")?;

        let aborted = self.aborted.clone();
        self.reader = Some(tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            loop {
                let line = match lines.next_line().await {
                    Ok(Some(line)) => line,
                    Ok(None) => {
                        debug!("stdin closed");
                        entries.exit();
                        return;
                    }
                    Err(err) => {
                        error!("stdin read failed: {err}");
                        entries.exit();
                        return;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                match dispatch(&entries, &line, &out) {
                    Flow::Continue => {}
                    Flow::Exit => return,
                    Flow::Abort => {
                        aborted.store(true, Ordering::SeqCst);
                        return;
                    }
                }
            }
        }));
        Ok(())
    }
}

async fn write_responses(mut rx: mpsc::UnboundedReceiver<Response>) -> anyhow::Result<()> {
    let mut stdout = tokio::io::stdout();
    while let Some(response) = rx.recv().await {
        let mut line = serde_json::to_vec(&response).context("serialize response")?;
        line.push(b'\n');
        stdout.write_all(&line).await.context("write response")?;
        stdout.flush().await.context("flush response")?;
    }
    Ok(())
}
