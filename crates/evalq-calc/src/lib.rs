#![deny(missing_docs)]
#![deny(unreachable_pub)]

//! Small arithmetic interpreter with per-session variable bindings.

/// Public API for this crate.
pub mod api;

mod eval;
mod parse;
mod value;

pub use api::{run, CalcError, Session, SessionConfig};
pub use value::Value;
