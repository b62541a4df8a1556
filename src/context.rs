//! Request-scoped state threaded into every backend call.

use crate::json_ext::Object;
use serde_json_bytes::Value;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// Execution context for one request.
///
/// Carries the request-supplied variable map and the cancellation signal.
/// Plans themselves are immutable; everything request-scoped lives here.
#[derive(Clone, Debug, Default)]
pub struct Context {
    variables: Object,
    cancellation: CancellationToken,
}

impl Context {
    pub fn new(variables: Object) -> Self {
        Self {
            variables,
            cancellation: CancellationToken::new(),
        }
    }

    /// Replaces the cancellation token, typically with one derived from the
    /// transport's connection lifetime.
    pub fn with_cancellation(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = cancellation;
        self
    }

    /// Looks up a request-supplied variable by name.
    pub fn variable(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Resolves once the request is cancelled. Every blocking backend call
    /// selects over this.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancellation.cancelled()
    }
}
