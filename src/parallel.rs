use std::fmt;
use std::sync::Arc;

use crate::base::{Core, Listener, ListenerId, Release};
use crate::error::Error;
use crate::token::Token;

/// Limits how much weight can be held at the same time.
///
/// Committing or rolling back a token returns its weight right away.
///
/// # Examples
///
/// ```
/// use aggregate_limit::ParallelLimit;
///
/// # fn main() -> Result<(), aggregate_limit::Error> {
/// let limit = ParallelLimit::new(2)?;
///
/// let a = limit.accrue_token(1)?;
/// let b = limit.accrue_token(1)?;
/// assert!(limit.accrue_token(1).is_err());
///
/// a.commit();
/// assert_eq!(limit.available_weight()?, 1);
/// b.rollback();
/// assert_eq!(limit.available_weight()?, 2);
/// # Ok(()) }
/// ```
#[derive(Clone)]
pub struct ParallelLimit {
    core: Arc<Core>,
}

impl ParallelLimit {
    /// Construct a limit allowing `count` weight to be held at once.
    pub fn new(count: usize) -> Result<Self, Error> {
        if count == 0 {
            return Err(Error::Configuration {
                field: "parallel",
                message: "count value should be above zero integer",
            });
        }

        Ok(Self {
            core: Core::new(count, Release::Immediate),
        })
    }

    /// Weight which can currently be accrued.
    pub fn available_weight(&self) -> Result<usize, Error> {
        self.core.available_weight()
    }

    /// Total weight of the limit.
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
    pub async fn dispose(&self) {
        self.core.dispose().await
    }

    pub(crate) fn core(&self) -> &Arc<Core> {
        &self.core
    }
}

impl fmt::Debug for ParallelLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ParallelLimit").field(&self.core).finish()
    }
}
