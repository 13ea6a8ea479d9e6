//! All-or-nothing acquisition across a set of primitive limits.
//!
//! An attempt reserves weight from every limit in one pass. If any limit is
//! short, everything reserved so far is rolled back, the short limits are
//! recorded as *busy* and a one-shot release listener is registered on each.
//! While anything is busy no attempt is made at all. Once the last busy limit
//! reports a release the wait queue is served in order, stopping at the first
//! waiter which still can't be satisfied.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{ready, Context, Poll};
use std::time::Duration;

use futures_util::future::join_all;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::base::{check_weight, Accrual, Listener};
use crate::cancel::{CancelListenerId, CancellationToken};
use crate::config::{Builder, Constraint, LimitOpts};
use crate::error::Error;
use crate::token::Token;

type Callback = Box<dyn FnOnce(Result<Token, Error>) + Send>;

/// Options for a lazy acquisition.
///
/// Without a timeout or a cancellation handle the acquisition waits until it
/// is satisfied or the limit is disposed.
#[derive(Clone)]
pub struct LazyOptions {
    weight: usize,
    timeout: Option<Duration>,
    cancel: Option<Arc<dyn CancellationToken>>,
}

impl Default for LazyOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl LazyOptions {
    /// Acquire a single unit of weight and wait indefinitely.
    pub fn new() -> Self {
        Self {
            weight: 1,
            timeout: None,
            cancel: None,
        }
    }

    /// The weight to acquire.
    #[inline(always)]
    pub fn weight(mut self, weight: usize) -> Self {
        self.weight = weight;
        self
    }

    /// Fail with [`Error::Timeout`] if not satisfied within `timeout`.
    ///
    /// The timer is spawned on the current Tokio runtime.
    #[inline(always)]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Fail once `cancel` is cancelled.
    #[inline(always)]
    pub fn cancel(mut self, cancel: Arc<dyn CancellationToken>) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

impl fmt::Debug for LazyOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyOptions")
            .field("weight", &self.weight)
            .field("timeout", &self.timeout)
            .field("cancel", &self.cancel.is_some())
            .finish()
    }
}

/// What can end a wait other than being served.
#[derive(Default)]
struct Triggers {
    timer: Option<JoinHandle<()>>,
    cancel: Option<(Arc<dyn CancellationToken>, CancelListenerId)>,
}

impl Triggers {
    fn disarm(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }

        if let Some((cancel, id)) = self.cancel.take() {
            cancel.remove_cancel_listener(id);
        }
    }
}

/// A queued lazy acquisition.
struct Waiter {
    id: u64,
    weight: usize,
    callback: Callback,
    triggers: Triggers,
}

impl Waiter {
    fn complete(mut self, result: Result<Token, Error>) {
        self.triggers.disarm();
        (self.callback)(result);
    }
}

/// Progress of serving the wait queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Drain {
    Idle,
    Running,
    /// Busy limits were released again while the queue was being served.
    Rerun,
}

struct State {
    /// Indexes of limits known to be short of weight.
    busy: Vec<usize>,
    queue: VecDeque<Waiter>,
    next_waiter: u64,
    disposing: bool,
    drain: Drain,
}

struct Inner {
    limits: Vec<Constraint>,
    /// The smallest capacity among the limits.
    max: usize,
    state: Mutex<State>,
}

impl Inner {
    /// A weight above the capacity of some limit would mark it busy with no
    /// release ever coming, so it is turned away before the limits are
    /// looked at.
    fn check_weight(&self, weight: usize) -> Result<(), Error> {
        check_weight(weight)?;

        if weight > self.max {
            return Err(Error::TokenOverflow {
                weight,
                max: self.max,
            });
        }

        Ok(())
    }

    fn check_not_disposing(&self) -> Result<(), Error> {
        if self.state.lock().disposing {
            return Err(Error::Disposed);
        }

        Ok(())
    }

    /// Try to reserve `weight` from every limit at once.
    ///
    /// Returns `Ok(None)` without looking at the limits if any of them is
    /// known to be busy.
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "trace", skip(self)))]
    fn try_accrue(self: &Arc<Self>, weight: usize) -> Result<Option<Token>, Error> {
        let mut tokens = Vec::with_capacity(self.limits.len());
        let mut state = self.state.lock();

        if !state.busy.is_empty() || state.disposing {
            return Ok(None);
        }

        let mut failure = None;

        for (index, limit) in self.limits.iter().enumerate() {
            match limit
                .core()
                .accrue_or_listen(weight, || self.release_listener(index))
            {
                Ok(Accrual::Token(token)) => tokens.push(token),
                Ok(Accrual::Busy) => state.busy.push(index),
                Err(error) => {
                    failure = Some(error);
                    break;
                }
            }
        }

        let busy = !state.busy.is_empty();
        // Rolling back notifies listeners, which lock the state.
        drop(state);

        if let Some(error) = failure {
            tokens.iter().for_each(Token::rollback);
            return Err(error);
        }

        if busy {
            #[cfg(feature = "tracing")]
            tracing::trace!(reserved = tokens.len(), "limits busy");
            tokens.iter().for_each(Token::rollback);
            return Ok(None);
        }

        Ok(Some(Token::aggregated(tokens)))
    }

    fn release_listener(self: &Arc<Self>, index: usize) -> Listener {
        let inner = Arc::downgrade(self);

        Box::new(move |_| {
            if let Some(inner) = inner.upgrade() {
                inner.on_release(index);
            }
        })
    }

    fn on_release(self: &Arc<Self>, index: usize) {
        let mut state = self.state.lock();
        debug_assert!(state.busy.contains(&index), "released limit was not busy");
        state.busy.retain(|busy| *busy != index);

        if !state.busy.is_empty() {
            return;
        }

        drop(state);
        self.drive();
    }

    /// Serve the wait queue unless that is already in progress, in which case
    /// the ongoing pass is asked to go around once more.
    fn drive(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();

            if state.drain != Drain::Idle {
                state.drain = Drain::Rerun;
                return;
            }

            state.drain = Drain::Running;
        }

        loop {
            self.serve_waiters();

            let mut state = self.state.lock();

            if state.drain == Drain::Rerun {
                state.drain = Drain::Running;
                continue;
            }

            state.drain = Drain::Idle;
            return;
        }
    }

    fn serve_waiters(self: &Arc<Self>) {
        loop {
            let (id, weight) = {
                let state = self.state.lock();

                match state.queue.front() {
                    Some(waiter) => (waiter.id, waiter.weight),
                    None => return,
                }
            };

            let result = match self.try_accrue(weight) {
                Ok(Some(token)) => Ok(token),
                Ok(None) => return,
                Err(error) => Err(error),
            };

            let waiter = {
                let mut state = self.state.lock();

                if state.queue.front().map(|waiter| waiter.id) == Some(id) {
                    state.queue.pop_front()
                } else {
                    None
                }
            };

            match waiter {
                Some(waiter) => waiter.complete(result),
                // The head timed out or was cancelled in the meantime, so
                // whatever it got is handed back by dropping it.
                None => drop(result),
            }
        }
    }

    /// Queue a waiter, or complete it right away if possible.
    ///
    /// Returns the identifier of the waiter if it was queued.
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "trace", skip(self, callback)))]
    fn accrue_lazy(
        self: &Arc<Self>,
        opts: LazyOptions,
        callback: Callback,
    ) -> Result<Option<u64>, Error> {
        let LazyOptions {
            weight,
            timeout,
            cancel,
        } = opts;

        self.check_weight(weight)?;
        self.check_not_disposing()?;

        if let Some(token) = self.try_accrue(weight)? {
            callback(Ok(token));
            return Ok(None);
        }

        if let Some(cancel) = &cancel {
            if cancel.is_cancellation_requested() {
                callback(Err(cancel_error(&**cancel)));
                return Ok(None);
            }
        }

        let id = {
            let mut state = self.state.lock();

            if state.disposing {
                return Err(Error::Disposed);
            }

            let id = state.next_waiter;
            state.next_waiter = state.next_waiter.wrapping_add(1);

            state.queue.push_back(Waiter {
                id,
                weight,
                callback,
                triggers: Triggers::default(),
            });

            id
        };

        // Triggers are armed outside of the lock since a cancel listener might
        // be called immediately.
        let timer = timeout.map(|timeout| {
            tokio::spawn(expire_after(Arc::downgrade(self), id, timeout))
        });

        let cancel = cancel.map(|cancel| {
            let inner = Arc::downgrade(self);
            let handle = cancel.clone();

            let listener = cancel.add_cancel_listener(Box::new(move || {
                if let Some(inner) = inner.upgrade() {
                    inner.expire(id, cancel_error(&*handle));
                }
            }));

            (cancel, listener)
        });

        let mut triggers = Triggers { timer, cancel };
        let mut state = self.state.lock();
        let waiter = state.queue.iter_mut().find(|waiter| waiter.id == id);

        if let Some(waiter) = waiter {
            waiter.triggers = triggers;
            // Capacity might have come back before the waiter was queued, in
            // which case no release will arrive to serve it.
            let kick = state.busy.is_empty();
            drop(state);

            if kick {
                self.drive();
            }
        } else {
            // Already expired or served.
            drop(state);
            triggers.disarm();
        }

        Ok(Some(id))
    }

    /// Fail a queued waiter with `error`.
    ///
    /// Whichever of timeout, cancellation, or being served reaches the waiter
    /// first wins and later attempts are no-ops.
    fn expire(self: &Arc<Self>, id: u64, error: Error) {
        if let Some(waiter) = self.remove(id) {
            #[cfg(feature = "tracing")]
            tracing::trace!(id, %error, "expiring waiter");
            waiter.complete(Err(error));
        }
    }

    /// Remove a waiter whose receiver went away.
    fn abandon(self: &Arc<Self>, id: u64) {
        if let Some(mut waiter) = self.remove(id) {
            waiter.triggers.disarm();
        }
    }

    fn remove(self: &Arc<Self>, id: u64) -> Option<Waiter> {
        let mut state = self.state.lock();
        let index = state.queue.iter().position(|waiter| waiter.id == id)?;
        let waiter = state.queue.remove(index);
        let kick = index == 0 && state.busy.is_empty();
        drop(state);

        // The next waiter might fit where the removed head did not.
        if kick {
            self.drive();
        }

        waiter
    }
}

async fn expire_after(inner: Weak<Inner>, id: u64, timeout: Duration) {
    tokio::time::sleep(timeout).await;

    if let Some(inner) = inner.upgrade() {
        inner.expire(id, Error::Timeout(timeout));
    }
}

fn cancel_error(cancel: &dyn CancellationToken) -> Error {
    match cancel.check_cancelled() {
        Err(cause) => Error::Cancelled(cause),
        Ok(()) => Error::CancelRequested,
    }
}

/// A limit combining any number of concurrency and timespan limits.
///
/// A token is only handed out if every limit can supply the requested weight,
/// and then it holds weight in all of them.
///
/// # Examples
///
/// ```
/// use aggregate_limit::AggregatedLimit;
///
/// # fn main() -> Result<(), aggregate_limit::Error> {
/// let limit = AggregatedLimit::builder().parallel(2).build()?;
///
/// let a = limit.accrue_token_immediately(1)?;
/// let _b = limit.accrue_token_immediately(1)?;
/// assert!(limit.accrue_token_immediately(1).is_err());
///
/// a.commit();
/// let _c = limit.accrue_token_immediately(1)?;
/// # Ok(()) }
/// ```
#[derive(Clone)]
pub struct AggregatedLimit {
    inner: Arc<Inner>,
}

impl AggregatedLimit {
    /// Construct a limit through a builder.
    pub fn builder() -> Builder {
        Builder::default()
    }

    /// Construct a limit from options.
    ///
    /// A limit without any constraints hands out every token asked for.
    pub fn new(opts: LimitOpts) -> Result<Self, Error> {
        let limits = opts.build_limits()?;

        let max = limits
            .iter()
            .map(|limit| limit.core().capacity())
            .min()
            .unwrap_or(usize::MAX);

        Ok(Self {
            inner: Arc::new(Inner {
                limits,
                max,
                state: Mutex::new(State {
                    busy: Vec::new(),
                    queue: VecDeque::new(),
                    next_waiter: 0,
                    disposing: false,
                    drain: Drain::Idle,
                }),
            }),
        })
    }

    /// Weight which can currently be accrued, the smallest across all limits.
    pub fn available_weight(&self) -> Result<usize, Error> {
        self.inner.check_not_disposing()?;

        self.inner
            .limits
            .iter()
            .try_fold(usize::MAX, |min, limit| {
                Ok::<_, Error>(min.min(limit.core().available_weight()?))
            })
    }

    /// The smallest total weight across all limits.
    pub fn max_weight(&self) -> Result<usize, Error> {
        self.inner.check_not_disposing()?;

        self.inner
            .limits
            .iter()
            .try_fold(usize::MAX, |min, limit| {
                Ok::<_, Error>(min.min(limit.core().max_weight()?))
            })
    }

    /// Accrue a token of the given `weight` without waiting.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::NoTokensAvailable`] if any limit is short of weight,
    /// with [`Error::TokenOverflow`] if `weight` is above [`max_weight`], and
    /// with [`Error::Disposed`] once [`dispose`] has been called.
    ///
    /// [`max_weight`]: AggregatedLimit::max_weight
    ///
    /// [`dispose`]: AggregatedLimit::dispose
    pub fn accrue_token_immediately(&self, weight: usize) -> Result<Token, Error> {
        self.inner.check_weight(weight)?;
        self.inner.check_not_disposing()?;

        match self.inner.try_accrue(weight)? {
            Some(token) => Ok(token),
            None => Err(Error::NoTokensAvailable),
        }
    }

    /// Accrue a token, waiting in line for it if necessary.
    ///
    /// Dropping the returned future gives up the place in line, and hands back
    /// a token which was accrued but never received.
    ///
    /// A weight above [`max_weight`] can never be satisfied and resolves to
    /// [`Error::TokenOverflow`] without queueing.
    ///
    /// [`max_weight`]: AggregatedLimit::max_weight
    ///
    /// # Examples
    ///
    /// ```
    /// use aggregate_limit::{AggregatedLimit, LazyOptions};
    /// use std::time::Duration;
    ///
    /// # #[tokio::main(flavor = "current_thread")]
    /// # async fn main() -> Result<(), aggregate_limit::Error> {
    /// let limit = AggregatedLimit::builder().per_second(1).build()?;
    ///
    /// limit.accrue_token_immediately(1)?.commit();
    ///
    /// let options = LazyOptions::new().timeout(Duration::from_secs(5));
    /// let token = limit.accrue_token_lazy(options).await?;
    /// token.commit();
    /// # Ok(()) }
    /// ```
    pub fn accrue_token_lazy(&self, opts: LazyOptions) -> AccrueLazy {
        let (tx, rx) = oneshot::channel();

        let callback: Callback = Box::new(move |result| {
            let _ = tx.send(result);
        });

        let waiter = match self.inner.accrue_lazy(opts, callback) {
            Ok(waiter) => waiter,
            Err(error) => {
                let (tx, rx) = oneshot::channel();
                let _ = tx.send(Err(error));

                return AccrueLazy {
                    inner: self.inner.clone(),
                    waiter: None,
                    rx,
                };
            }
        };

        AccrueLazy {
            inner: self.inner.clone(),
            waiter,
            rx,
        }
    }

    /// Accrue a token, calling `callback` with the outcome once it is known.
    ///
    /// The callback might be called before this function returns.
    ///
    /// # Errors
    ///
    /// Misuse such as a zero weight, a weight above [`max_weight`] or calling
    /// this on a disposed limit is reported directly, and then `callback` is
    /// never called.
    ///
    /// [`max_weight`]: AggregatedLimit::max_weight
    pub fn accrue_token_lazy_with<F>(&self, opts: LazyOptions, callback: F) -> Result<(), Error>
    where
        F: FnOnce(Result<Token, Error>) + Send + 'static,
    {
        self.inner.accrue_lazy(opts, Box::new(callback))?;
        Ok(())
    }

    /// Shut down the limit.
    ///
    /// Queued acquisitions fail with [`Error::Disposing`] and any new ones fail
    /// with [`Error::Disposed`]. Completes once every outstanding token has
    /// been finalized.
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "trace", skip(self)))]
    pub async fn dispose(&self) {
        let waiters = {
            let mut state = self.inner.state.lock();
            state.disposing = true;
            mem::take(&mut state.queue)
        };

        #[cfg(feature = "tracing")]
        tracing::debug!(waiters = waiters.len(), "disposing");

        for waiter in waiters {
            waiter.complete(Err(Error::Disposing));
        }

        join_all(self.inner.limits.iter().map(|limit| limit.core().dispose())).await;
    }
}

impl fmt::Debug for AggregatedLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();

        f.debug_struct("AggregatedLimit")
            .field("limits", &self.inner.limits)
            .field("busy", &state.busy)
            .field("waiters", &state.queue.len())
            .field("disposing", &state.disposing)
            .finish()
    }
}

/// The future returned by [`AggregatedLimit::accrue_token_lazy`].
#[must_use = "dropping this future gives up the place in line"]
pub struct AccrueLazy {
    inner: Arc<Inner>,
    waiter: Option<u64>,
    rx: oneshot::Receiver<Result<Token, Error>>,
}

impl Future for AccrueLazy {
    type Output = Result<Token, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let result = ready!(Pin::new(&mut this.rx).poll(cx));
        this.waiter = None;

        // The sender is only dropped unused if the waiter was discarded
        // without being completed.
        Poll::Ready(result.unwrap_or(Err(Error::Disposing)))
    }
}

impl Drop for AccrueLazy {
    fn drop(&mut self) {
        if let Some(id) = self.waiter.take() {
            self.inner.abandon(id);
        }
    }
}

impl fmt::Debug for AccrueLazy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccrueLazy")
            .field("waiter", &self.waiter)
            .finish()
    }
}
