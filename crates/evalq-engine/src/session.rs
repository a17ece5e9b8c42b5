use tracing::debug;

use crate::api::{Bridge, BridgeError, ContextHandle, JobOutput};
use crate::evaluator::Evaluator;

/// A context owned for the lifetime of this value.
///
/// Jobs run through [`Session::run`] see each other's bindings. Dropping the
/// session destroys the context; jobs already admitted still complete.
pub struct Session<E: Evaluator> {
    bridge: Bridge<E>,
    handle: ContextHandle,
}

impl<E: Evaluator> Session<E> {
    pub(crate) fn open(bridge: &Bridge<E>) -> Result<Self, BridgeError> {
        let handle = bridge.new_context()?;
        Ok(Self {
            bridge: bridge.clone(),
            handle,
        })
    }

    /// Handle of the owned context.
    pub fn handle(&self) -> ContextHandle {
        self.handle
    }

    /// Evaluate `input` in this session's context.
    pub async fn run(&self, input: impl Into<String>) -> Result<JobOutput, BridgeError> {
        self.bridge.submit(Some(self.handle), input)?.output().await
    }
}

impl<E: Evaluator> Drop for Session<E> {
    fn drop(&mut self) {
        if let Err(err) = self.bridge.destroy_context(self.handle) {
            debug!(handle = %self.handle, "session context not destroyed: {err}");
        }
    }
}
