//! The table of named entry points handed to a host calling environment,
//! and the startup handshake that registers it.

use tracing::{info, warn};

use crate::api::{Bridge, BridgeError, BridgeHandle, ContextHandle};
use crate::evaluator::Evaluator;

/// Environment variable naming the host's registration slot.
pub const CALLBACK_ENV: &str = "EVALQ_CALLBACK";

/// Names under which the entry points are exposed to hosts.
pub const ENTRY_POINTS: [&str; 4] = ["newContext", "destroyContext", "run", "exit"];

/// Registration slot selected through [`CALLBACK_ENV`], if set and non-empty.
pub fn callback_slot() -> Option<String> {
    std::env::var(CALLBACK_ENV).ok().filter(|slot| !slot.is_empty())
}

/// Host-facing entry points over one bridge.
pub struct EntryPoints<E: Evaluator> {
    bridge: Bridge<E>,
}

impl<E: Evaluator> Clone for EntryPoints<E> {
    fn clone(&self) -> Self {
        Self {
            bridge: self.bridge.clone(),
        }
    }
}

impl<E: Evaluator> EntryPoints<E> {
    /// Wrap a producer handle.
    pub fn new(bridge: Bridge<E>) -> Self {
        Self { bridge }
    }

    /// `newContext`: create a context with the bridge's default options.
    pub fn new_context(&self) -> Result<ContextHandle, BridgeError> {
        self.bridge.new_context()
    }

    /// `destroyContext`: tombstone a context. Never fails; unknown handles and
    /// single-context bridges are ignored.
    pub fn destroy_context(&self, handle: ContextHandle) {
        if let Err(err) = self.bridge.destroy_context(handle) {
            warn!(%handle, "destroyContext ignored: {err}");
        }
    }

    /// `run`: enqueue `input` and call `callback(stdout, stderr)` later.
    ///
    /// Returns immediately. A rejected submission is reported here and the
    /// callback is never invoked; [`BridgeError::is_fatal`] tells the host
    /// whether to abort.
    pub fn run<F>(
        &self,
        handle: Option<ContextHandle>,
        input: String,
        callback: F,
    ) -> Result<u64, BridgeError>
    where
        F: FnOnce(String, String) + Send + 'static,
    {
        self.bridge.submit_with(handle, input, callback)
    }

    /// `exit`: request shutdown. Idempotent.
    pub fn exit(&self) {
        self.bridge.request_stop();
    }
}

/// A calling environment that can receive the entry-point table.
pub trait Host<E: Evaluator> {
    /// Install `entries` under `slot`. The host drives them from then on.
    fn register(&mut self, slot: &str, entries: EntryPoints<E>) -> anyhow::Result<()>;
}

/// Hand the entry points to `host` under `slot`, then block until the worker
/// loop reaches its terminal state.
pub async fn serve<E, H>(host: &mut H, slot: &str, handle: BridgeHandle<E>) -> anyhow::Result<()>
where
    E: Evaluator,
    H: Host<E>,
{
    if let Err(err) = host.register(slot, EntryPoints::new(handle.bridge())) {
        handle.request_stop();
        handle.wait().await?;
        return Err(err.context(format!("register entry points under {slot:?}")));
    }
    info!(slot, entries = ?ENTRY_POINTS, "entry points registered");
    handle.wait().await
}
