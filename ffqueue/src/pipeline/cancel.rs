//! Cancellation handle carrying the reason it was fired.

use std::sync::{Arc, OnceLock};

use tokio_util::sync::CancellationToken;

/// Cooperative cancellation token plus the cause of the first cancellation.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    token: CancellationToken,
    cause: Arc<OnceLock<String>>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the handle. Only the first cause is kept.
    pub fn cancel(&self, cause: impl Into<String>) {
        let _ = self.cause.set(cause.into());
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn cause(&self) -> Option<&str> {
        self.cause.get().map(String::as_str)
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}
