//! Cancellation support for in-flight operations.
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

/// A shareable flag for cancelling in-flight operations.
///
/// Cloning the token yields another handle to the same flag.
/// Operations check the token between response messages:
/// once triggered, the operation aborts its association
/// and fails with a cancellation error,
/// distinguishable from a peer closing the connection.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Create a new, untriggered token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Trigger cancellation on every handle of this token.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation has been triggered.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancelling_one_handle_triggers_all() {
        let token = CancellationToken::new();
        let other = token.clone();
        assert!(!other.is_cancelled());
        token.cancel();
        assert!(other.is_cancelled());
    }
}
