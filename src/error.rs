use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// The cause carried by a cancellation handle.
pub type CancelCause = Arc<dyn StdError + Send + Sync>;

/// Error type for limits.
///
/// Use [`Error::is_limit`] to distinguish "could not get a token" from
/// misuse of the API.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum Error {
    /// A limit did not have enough weight available.
    #[error("No available tokens")]
    NoTokensAvailable,
    /// A lazy acquisition was not satisfied in time.
    #[error("Timeout: Token was not accrued in {0:?}")]
    Timeout(Duration),
    /// The cancellation handle of a lazy acquisition fired.
    #[error("Token was not accrued: {0}")]
    Cancelled(#[source] CancelCause),
    /// The cancellation handle fired without exposing a cause.
    #[error("Timeout: Token was not accrued due to cancel request")]
    CancelRequested,
    /// A queued acquisition was flushed because the limit is being disposed.
    #[error("Timeout: Token was not accrued due to disposing")]
    Disposing,
    /// Operation on a limit which is disposing or disposed.
    #[error("Wrong operation on disposed object")]
    Disposed,
    /// Tokens must have a weight of at least one.
    #[error("Token weight should be above zero")]
    InvalidWeight,
    /// Tried to accrue more weight than some limit could ever supply.
    #[error("Token weight {weight} exceeds the maximum weight {max}")]
    TokenOverflow {
        /// The requested weight.
        weight: usize,
        /// The smallest maximum weight among the limits.
        max: usize,
    },
    /// Invalid limit options.
    #[error("Wrong limit options: {field} {message}")]
    Configuration {
        /// The offending option.
        field: &'static str,
        /// What is wrong with it.
        message: &'static str,
    },
}

impl Error {
    /// Test if this error means that a token could not be accrued.
    ///
    /// These are recoverable, the caller might retry later. Other errors are
    /// programming errors.
    pub fn is_limit(&self) -> bool {
        matches!(
            self,
            Error::NoTokensAvailable
                | Error::Timeout(..)
                | Error::Cancelled(..)
                | Error::CancelRequested
                | Error::Disposing
        )
    }
}

#[cfg(test)]
mod tests {
    use super::Error;
    use std::time::Duration;

    #[test]
    fn test_is_limit() {
        assert!(Error::NoTokensAvailable.is_limit());
        assert!(Error::Timeout(Duration::from_millis(10)).is_limit());
        assert!(Error::CancelRequested.is_limit());
        assert!(Error::Disposing.is_limit());
        assert!(!Error::Disposed.is_limit());
        assert!(!Error::InvalidWeight.is_limit());
        assert!(!Error::TokenOverflow { weight: 3, max: 2 }.is_limit());
        assert!(!Error::Configuration {
            field: "parallel",
            message: "count value should be above zero integer"
        }
        .is_limit());
    }

    #[test]
    fn test_display() {
        assert_eq!(
            "Timeout: Token was not accrued in 250ms",
            Error::Timeout(Duration::from_millis(250)).to_string()
        );
        assert_eq!(
            "Wrong limit options: perSecond count value should be above zero integer",
            Error::Configuration {
                field: "perSecond",
                message: "count value should be above zero integer"
            }
            .to_string()
        );
    }
}
