use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::base::{Core, Listener, ListenerId, Release};
use crate::error::Error;
use crate::token::Token;

/// Limits how much weight can be spent within a rolling window.
///
/// Rolling back a token returns its weight immediately. Committing it keeps
/// the weight spent until `delay` has passed since the commit.
///
/// Committing tokens requires a Tokio runtime, since the deferred release is
/// driven by a spawned timer.
#[derive(Clone)]
pub struct TimespanLimit {
    core: Arc<Core>,
    delay: Duration,
}

impl TimespanLimit {
    /// Construct a limit allowing `count` weight to be committed per `delay`.
    pub fn new(delay: Duration, count: usize) -> Result<Self, Error> {
        if count == 0 {
            return Err(Error::Configuration {
                field: "perTimespan",
                message: "count value should be above zero integer",
            });
        }

        if delay.is_zero() {
            return Err(Error::Configuration {
                field: "perTimespan",
                message: "delay value should be above zero integer",
            });
        }

        Ok(Self {
            core: Core::new(count, Release::Deferred(delay)),
            delay,
        })
    }

    /// The length of the window.
    #[inline]
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Weight which can currently be accrued.
    pub fn available_weight(&self) -> Result<usize, Error> {
        self.core.available_weight()
    }

    /// Total weight of the limit per window.
    pub fn max_weight(&self) -> Result<usize, Error> {
        self.core.max_weight()
    }

    /// Reserve `weight`, failing with [`Error::NoTokensAvailable`] if there
    /// isn't enough of it.
    pub fn accrue_token(&self, weight: usize) -> Result<Token, Error> {
        self.core.accrue_token(weight)
    }

    /// Register a listener called on the next release which leaves weight
    /// available.
    pub fn add_release_listener(&self, listener: Listener) -> ListenerId {
        self.core.add_release_listener(listener)
    }

    /// Remove a listener which hasn't fired yet.
    pub fn remove_release_listener(&self, id: ListenerId) -> bool {
        self.core.remove_release_listener(id)
    }

    /// Stop accepting tokens and wait for all outstanding ones to be
    /// finalized.
    ///
    /// Committed tokens still waiting out their window are released right
    /// away instead.
    pub async fn dispose(&self) {
        self.core.dispose().await
    }

    pub(crate) fn core(&self) -> &Arc<Core> {
        &self.core
    }
}

impl fmt::Debug for TimespanLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimespanLimit")
            .field("delay", &self.delay)
            .field("core", &self.core)
            .finish()
    }
}
