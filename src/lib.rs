#![deny(missing_docs)]
//! Admission control through tokens.
//!
//! A token is permission to proceed with some work. It is only handed out if
//! *every* configured constraint can supply it at the same time:
//!
//! * A [`ParallelLimit`] bounds how much weight is held at once. Committing or
//!   rolling back a token returns its weight immediately.
//! * A [`TimespanLimit`] bounds how much weight is spent within a rolling
//!   window. Rolling back returns the weight immediately, while a committed
//!   token keeps it spent until the window has passed.
//!
//! An [`AggregatedLimit`] combines any number of these. Acquisition is all or
//! nothing, so a request never leaves partial holds behind.
//!
//! ## Example
//!
//! ```no_run
//! use aggregate_limit::{AggregatedLimit, LazyOptions};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), aggregate_limit::Error> {
//!     let limit = AggregatedLimit::builder()
//!         .per_second(2)
//!         .per_minute(10)
//!         .parallel(1)
//!         .build()?;
//!
//!     for n in 0..4 {
//!         let options = LazyOptions::new().timeout(Duration::from_secs(10));
//!         let token = limit.accrue_token_lazy(options).await?;
//!         println!("Working on {n}");
//!         token.commit();
//!     }
//!
//!     limit.dispose().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Waiting
//!
//! [`AggregatedLimit::accrue_token_immediately`] fails with
//! [`Error::NoTokensAvailable`] if a token can't be handed out right away.
//! [`AggregatedLimit::accrue_token_lazy`] instead waits in a FIFO queue until
//! a token can be handed out, the optional timeout passes, or the optional
//! [`CancellationToken`] is cancelled.
//!
//! ## Shutting down
//!
//! [`AggregatedLimit::dispose`] fails everything still waiting and completes
//! once every outstanding token has been committed or rolled back. Tokens
//! waiting out a window are released right away.
//!
//! ## Features
//!
//! * `tracing` - emit [tracing] events at the `trace` level.
//!
//! [tracing]: https://docs.rs/tracing

mod aggregated;
mod base;
mod cancel;
mod config;
mod error;
mod parallel;
mod timespan;
mod token;

pub use self::aggregated::{AccrueLazy, AggregatedLimit, LazyOptions};
pub use self::base::{Listener, ListenerId};
pub use self::cancel::{
    CancelListener, CancelListenerId, CancellationSource, CancellationToken, CancelledError,
};
pub use self::config::{Builder, LimitOpts, Timespan};
pub use self::error::{CancelCause, Error};
pub use self::parallel::ParallelLimit;
pub use self::timespan::TimespanLimit;
pub use self::token::Token;
