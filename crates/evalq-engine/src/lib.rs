#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! Serializing bridge between many concurrent callers and one evaluation engine.
//!
//! Callers create contexts, submit jobs and request shutdown through a
//! [`Bridge`]; a single worker task evaluates jobs one at a time in admission
//! order and delivers each job's two output streams exactly once.

/// Public API for the bridge crate.
pub mod api;
/// Named entry points handed to a host environment.
pub mod boundary;
/// Engine abstraction driven by the worker.
pub mod evaluator;

mod engine;
mod queue;
mod registry;
mod session;
mod worker;

pub use api::{
    start_bridge, Bridge, BridgeConfig, BridgeError, BridgeEvent, BridgeHandle, ContextHandle,
    JobOutcome, JobOutput, JobTicket, StatusSnapshot, WorkerState,
};
pub use boundary::{callback_slot, serve, EntryPoints, Host, CALLBACK_ENV, ENTRY_POINTS};
pub use evalq_core::settings::{ContextConfig, ContextMode};
pub use evaluator::{CalcEvaluator, Evaluator, OutputStreams};
pub use session::Session;
