use evalq_calc::{Session as CalcSession, SessionConfig};
use evalq_core::settings::ContextConfig;

/// A synchronous engine evaluating text input against mutable contexts.
///
/// The bridge calls [`Evaluator::evaluate`] from exactly one worker at a time,
/// so implementations need no internal locking around a context.
pub trait Evaluator: Send + Sync + 'static {
    /// Per-session engine state.
    type Context: Send + 'static;

    /// Build a fresh context.
    fn new_context(&self, config: &ContextConfig) -> Self::Context;

    /// Evaluate `input` against `ctx`, appending to `out`.
    ///
    /// Evaluation errors are output: write them to `out.stderr`.
    fn evaluate(&self, ctx: &mut Self::Context, input: &str, out: &mut OutputStreams);
}

/// The two text streams captured for one job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputStreams {
    /// Regular output.
    pub stdout: String,
    /// Error output.
    pub stderr: String,
}

impl OutputStreams {
    /// Empty both buffers, keeping their allocations.
    pub fn clear(&mut self) {
        self.stdout.clear();
        self.stderr.clear();
    }
}

/// [`Evaluator`] backed by the `evalq-calc` interpreter.
#[derive(Debug, Clone, Copy, Default)]
pub struct CalcEvaluator;

impl Evaluator for CalcEvaluator {
    type Context = CalcSession;

    fn new_context(&self, config: &ContextConfig) -> CalcSession {
        CalcSession::new(SessionConfig {
            restricted: config.restricted,
            ..SessionConfig::default()
        })
    }

    fn evaluate(&self, ctx: &mut CalcSession, input: &str, out: &mut OutputStreams) {
        evalq_calc::run(ctx, input, &mut out.stdout, &mut out.stderr);
    }
}
