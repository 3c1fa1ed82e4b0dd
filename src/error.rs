//! Error types shared across the crate.
//!
//! Error handling follows two rules:
//!
//! - Recoverable runtime conditions (a queue racing with shutdown, an
//!   executor refusing a submission) are typed `Result` errors.
//! - Invariant violations and misuse (invalid capacities, inverted
//!   ranges, unlocking against the wrong lock) panic at the call site.
//!
//! User-supplied callbacks communicate failure through
//! [`CompletionError`], a cloneable wrapper over an arbitrary error
//! value that can carry suppressed secondary errors.

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

/// A shared, cloneable error value flowing through completion futures.
///
/// Wraps an arbitrary `Error + Send + Sync` payload. Secondary failures
/// (for example an error transformer that itself failed) are attached as
/// suppressed errors rather than replacing the original.
#[derive(Clone)]
pub struct CompletionError {
    inner: Arc<dyn StdError + Send + Sync>,
    suppressed: Vec<Arc<dyn StdError + Send + Sync>>,
}

impl CompletionError {
    /// Wraps an error value.
    pub fn new<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(error),
            suppressed: Vec::new(),
        }
    }

    /// Wraps an already-shared error value.
    #[must_use]
    pub fn from_arc(error: Arc<dyn StdError + Send + Sync>) -> Self {
        Self {
            inner: error,
            suppressed: Vec::new(),
        }
    }

    /// Creates an error from a plain message.
    #[must_use]
    pub fn msg(message: impl Into<String>) -> Self {
        Self::new(MessageError(message.into()))
    }

    /// Creates an error describing a panic payload from a user callback.
    #[must_use]
    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = payload
            .downcast_ref::<&'static str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "callback panicked".to_string());
        Self::new(MessageError(message))
    }

    /// Attaches a suppressed secondary error, returning the original.
    #[must_use]
    pub fn with_suppressed(mut self, error: Self) -> Self {
        self.suppressed.push(error.inner);
        self
    }

    /// Returns the wrapped error value.
    #[must_use]
    pub fn inner(&self) -> &(dyn StdError + Send + Sync) {
        &*self.inner
    }

    /// Returns any suppressed secondary errors.
    #[must_use]
    pub fn suppressed(&self) -> &[Arc<dyn StdError + Send + Sync>] {
        &self.suppressed
    }
}

impl fmt::Display for CompletionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)?;
        if !self.suppressed.is_empty() {
            write!(f, " ({} suppressed)", self.suppressed.len())?;
        }
        Ok(())
    }
}

impl fmt::Debug for CompletionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionError")
            .field("inner", &self.inner)
            .field("suppressed", &self.suppressed.len())
            .finish()
    }
}

impl StdError for CompletionError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(&*self.inner as &(dyn StdError + 'static))
    }
}

#[derive(Debug)]
struct MessageError(String);

impl fmt::Display for MessageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl StdError for MessageError {}

/// Errors raised by the prioritised task queue and thread pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    /// The queue has been shut down and accepts no further tasks.
    #[error("queue is shutdown")]
    Shutdown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_error_displays() {
        let err = CompletionError::msg("stage failed");
        assert_eq!(err.to_string(), "stage failed");
        assert!(err.suppressed().is_empty());
    }

    #[test]
    fn suppressed_errors_are_attached_not_substituted() {
        let err = CompletionError::msg("original")
            .with_suppressed(CompletionError::msg("transformer blew up"));
        assert!(err.to_string().contains("original"));
        assert_eq!(err.suppressed().len(), 1);
    }

    #[test]
    fn clone_shares_payload() {
        let err = CompletionError::msg("shared");
        let clone = err.clone();
        assert!(std::ptr::eq(
            err.inner() as *const _ as *const u8,
            clone.inner() as *const _ as *const u8,
        ));
    }
}
