//! Cancellation of lazy acquisitions.

use std::fmt;
use std::mem;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

use crate::error::CancelCause;

/// A cancel listener.
pub type CancelListener = Box<dyn FnOnce() + Send>;

/// Identifier of a registered cancel listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CancelListenerId(u64);

impl CancelListenerId {
    /// Construct an identifier from a raw value, for use by implementations of
    /// [`CancellationToken`].
    #[inline]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }
}

/// A handle through which a lazy acquisition can be cancelled.
pub trait CancellationToken: Send + Sync {
    /// Test if cancellation has been requested.
    fn is_cancellation_requested(&self) -> bool;

    /// Register a listener called once when cancellation is requested.
    ///
    /// If cancellation already has been requested, the listener must be
    /// called immediately.
    fn add_cancel_listener(&self, listener: CancelListener) -> CancelListenerId;

    /// Remove a listener which has not been called yet.
    fn remove_cancel_listener(&self, id: CancelListenerId);

    /// Return the cause of the cancellation if it has been requested.
    ///
    /// Implementations which don't track a cause might return `Ok(())` even
    /// when cancelled, in which case a generic error is reported.
    fn check_cancelled(&self) -> Result<(), CancelCause>;
}

/// The default cause of a cancellation.
#[derive(Debug, Error)]
#[error("Operation was cancelled")]
pub struct CancelledError;

struct Inner {
    cause: Option<CancelCause>,
    next_id: u64,
    listeners: Vec<(CancelListenerId, CancelListener)>,
}

/// A [`CancellationToken`] which is cancelled by hand.
///
/// Clones share the same cancellation state.
///
/// # Examples
///
/// ```
/// use aggregate_limit::{CancellationSource, CancellationToken};
///
/// let source = CancellationSource::new();
/// assert!(!source.is_cancellation_requested());
///
/// source.cancel();
/// assert!(source.is_cancellation_requested());
/// assert!(source.check_cancelled().is_err());
/// ```
#[derive(Clone)]
pub struct CancellationSource {
    inner: Arc<Mutex<Inner>>,
}

impl Default for CancellationSource {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationSource {
    /// Construct a new source which is not cancelled.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                cause: None,
                next_id: 0,
                listeners: Vec::new(),
            })),
        }
    }

    /// Request cancellation with [`CancelledError`] as the cause.
    pub fn cancel(&self) {
        self.cancel_with(Arc::new(CancelledError));
    }

    /// Request cancellation with a custom cause.
    ///
    /// Only the first request has any effect.
    pub fn cancel_with(&self, cause: CancelCause) {
        let listeners = {
            let mut inner = self.inner.lock();

            if inner.cause.is_some() {
                return;
            }

            inner.cause = Some(cause);
            mem::take(&mut inner.listeners)
        };

        for (_, listener) in listeners {
            listener();
        }
    }

    /// Get the source as a shared token.
    pub fn token(&self) -> Arc<dyn CancellationToken> {
        Arc::new(self.clone())
    }
}

impl CancellationToken for CancellationSource {
    fn is_cancellation_requested(&self) -> bool {
        self.inner.lock().cause.is_some()
    }

    fn add_cancel_listener(&self, listener: CancelListener) -> CancelListenerId {
        let mut inner = self.inner.lock();
        let id = CancelListenerId(inner.next_id);
        inner.next_id = inner.next_id.wrapping_add(1);

        if inner.cause.is_some() {
            drop(inner);
            listener();
            return id;
        }

        inner.listeners.push((id, listener));
        id
    }

    fn remove_cancel_listener(&self, id: CancelListenerId) {
        let removed = {
            let mut inner = self.inner.lock();

            inner
                .listeners
                .iter()
                .position(|(other, _)| *other == id)
                .map(|index| inner.listeners.remove(index))
        };

        drop(removed);
    }

    fn check_cancelled(&self) -> Result<(), CancelCause> {
        match &self.inner.lock().cause {
            Some(cause) => Err(cause.clone()),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for CancellationSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();

        f.debug_struct("CancellationSource")
            .field("cancelled", &inner.cause.is_some())
            .field("listeners", &inner.listeners.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::{CancellationSource, CancellationToken};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_listeners_fire_once() {
        let source = CancellationSource::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let c = calls.clone();
        source.add_cancel_listener(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));

        let removed = source.add_cancel_listener(Box::new(|| panic!("removed")));
        source.remove_cancel_listener(removed);

        source.cancel();
        source.cancel();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Late listeners are called right away.
        let c = calls.clone();
        source.add_cancel_listener(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_custom_cause() {
        let source = CancellationSource::new();
        assert!(source.check_cancelled().is_ok());

        source.cancel_with(Arc::new(std::io::Error::new(
            std::io::ErrorKind::Other,
            "shutting down",
        )));

        let cause = source.check_cancelled().unwrap_err();
        assert_eq!(cause.to_string(), "shutting down");
    }
}
