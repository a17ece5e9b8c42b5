use std::sync::{Arc, Mutex, PoisonError};

use crate::api::ContextHandle;
use crate::queue::SharedContext;

/// Append-only table of evaluation contexts.
///
/// Destroyed slots are tombstoned rather than removed, so a handle is never
/// reissued and indices after a destroyed slot stay valid. The lock guards the
/// slot sequence only; it is never held while a context is being evaluated.
pub(crate) struct ContextRegistry<C> {
    slots: Mutex<Vec<Option<SharedContext<C>>>>,
}

impl<C> ContextRegistry<C> {
    pub(crate) fn new() -> Self {
        Self {
            slots: Mutex::new(Vec::new()),
        }
    }

    fn slots(&self) -> std::sync::MutexGuard<'_, Vec<Option<SharedContext<C>>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append `context` and return its handle.
    pub(crate) fn insert(&self, context: C) -> ContextHandle {
        let context = Arc::new(Mutex::new(context));
        let mut slots = self.slots();
        slots.push(Some(context));
        ContextHandle::from_raw(slots.len() - 1)
    }

    /// Tombstone `handle`. Returns whether a live context was destroyed;
    /// out-of-range and already destroyed handles are a no-op.
    ///
    /// Jobs already admitted against the context keep their own reference and
    /// still run.
    pub(crate) fn destroy(&self, handle: ContextHandle) -> bool {
        let mut slots = self.slots();
        match slots.get_mut(handle.index()) {
            Some(slot) => slot.take().is_some(),
            None => false,
        }
    }

    pub(crate) fn resolve(&self, handle: ContextHandle) -> Option<SharedContext<C>> {
        self.slots().get(handle.index()).and_then(|slot| slot.clone())
    }

    pub(crate) fn live(&self) -> usize {
        self.slots().iter().filter(|slot| slot.is_some()).count()
    }
}
