//! Cancellation context threaded through every blocking operation.
//!
//! Storage operations can spend a long time in lock-wait or checkpoint
//! loops. A `Cx` is a cheap clonable handle to a shared cancellation flag;
//! loops call [`Cx::checkpoint`] between attempts and bail out with
//! `PetraError::Interrupted` once another thread has called [`Cx::cancel`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use petra_error::{PetraError, Result};

/// Cancellation handle. Clones share one flag.
#[derive(Debug, Clone, Default)]
pub struct Cx {
    cancelled: Arc<AtomicBool>,
}

impl Cx {
    /// A fresh, un-cancelled context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent; takes effect at the next
    /// [`checkpoint`](Self::checkpoint) any holder reaches.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Fail with `Interrupted` if cancellation has been requested.
    pub fn checkpoint(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(PetraError::Interrupted)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_cx_passes_checkpoint() {
        let cx = Cx::new();
        assert!(!cx.is_cancelled());
        cx.checkpoint().unwrap();
    }

    #[test]
    fn cancel_trips_checkpoint() {
        let cx = Cx::new();
        cx.cancel();
        assert!(matches!(cx.checkpoint(), Err(PetraError::Interrupted)));
    }

    #[test]
    fn clones_share_the_flag() {
        let cx = Cx::new();
        let other = cx.clone();
        other.cancel();
        assert!(cx.is_cancelled());
    }

    #[test]
    fn cancel_is_idempotent() {
        let cx = Cx::new();
        cx.cancel();
        cx.cancel();
        assert!(cx.is_cancelled());
    }
}
