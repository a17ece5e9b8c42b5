use std::io::IsTerminal;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use evalq_engine::{BridgeError, BridgeHandle, CalcEvaluator};

const PROMPT: &str = "> ";

/// Read stdin a line at a time and evaluate each line in the bridge's single
/// context. Returns 1 if any line wrote to stderr.
pub async fn run_repl(handle: BridgeHandle<CalcEvaluator>) -> anyhow::Result<i32> {
    let bridge = handle.bridge();
    let mut status = handle.watch_snapshot();
    let interactive = std::io::stdin().is_terminal();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    let mut stderr = tokio::io::stderr();
    let mut failed = false;

    loop {
        if interactive {
            stdout.write_all(PROMPT.as_bytes()).await?;
            stdout.flush().await?;
        }

        let line = tokio::select! {
            line = lines.next_line() => line.context("read stdin")?,
            _ = status.wait_for(|s| s.stop_requested) => None,
        };
        let Some(line) = line else {
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        let output = match bridge.submit(None, line) {
            Ok(ticket) => ticket.output().await,
            Err(err) => Err(err),
        };
        let output = match output {
            Ok(output) => output,
            Err(BridgeError::ShuttingDown) => break,
            Err(err) => return Err(err).context("submit line"),
        };
        failed |= !output.success();
        stdout.write_all(output.stdout.as_bytes()).await?;
        stdout.flush().await?;
        stderr.write_all(output.stderr.as_bytes()).await?;
    }

    handle.request_stop();
    handle.wait().await?;
    Ok(i32::from(failed))
}
