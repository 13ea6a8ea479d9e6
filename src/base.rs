//! Bookkeeping shared by the primitive limits.
//!
//! A core owns a fixed capacity, the set of outstanding reservations against
//! it and the release listeners waiting for capacity to come back. Locks are
//! never held while listeners run, so a listener is free to call back into any
//! limit.

use std::collections::HashMap;
use std::fmt;
use std::mem;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::Error;
use crate::token::Token;

/// A one-shot release listener.
///
/// It is called with the available weight after the release which triggered
/// it.
pub type Listener = Box<dyn FnOnce(usize) + Send>;

/// Identifier of a registered release listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// How a committed reservation gives its weight back.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Release {
    /// Right away.
    Immediate,
    /// Once the given delay has passed since the commit.
    Deferred(Duration),
}

/// Outcome of [`Core::accrue_or_listen`].
pub(crate) enum Accrual {
    /// Weight was reserved.
    Token(Token),
    /// Not enough weight, a listener was registered.
    Busy,
}

struct Reservation {
    weight: usize,
    /// Committed and waiting for its deferred release.
    finalizing: bool,
    timer: Option<JoinHandle<()>>,
}

struct State {
    available: usize,
    disposing: bool,
    next_id: u64,
    reservations: HashMap<u64, Reservation>,
    listeners: Vec<(ListenerId, Listener)>,
    /// Disposals waiting for the last reservation to go away.
    drained: Vec<oneshot::Sender<()>>,
}

impl State {
    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        id
    }

    fn reserve(&mut self, weight: usize) -> u64 {
        let id = self.next_id();
        self.available -= weight;
        self.reservations.insert(
            id,
            Reservation {
                weight,
                finalizing: false,
                timer: None,
            },
        );
        id
    }

    /// Drop the reservation and collect what has to be notified once the lock
    /// is released.
    fn release(&mut self, id: u64) -> Released {
        let Some(reservation) = self.reservations.remove(&id) else {
            return Released::default();
        };

        if let Some(timer) = reservation.timer {
            timer.abort();
        }

        self.available += reservation.weight;

        let drained = if self.reservations.is_empty() {
            mem::take(&mut self.drained)
        } else {
            Vec::new()
        };

        // Listeners are only interested in releases which leave something
        // behind to take.
        let listeners = if self.available > 0 {
            mem::take(&mut self.listeners)
        } else {
            Vec::new()
        };

        Released {
            available: self.available,
            listeners,
            drained,
        }
    }
}

#[derive(Default)]
struct Released {
    available: usize,
    listeners: Vec<(ListenerId, Listener)>,
    drained: Vec<oneshot::Sender<()>>,
}

impl Released {
    fn notify(self) {
        for tx in self.drained {
            let _ = tx.send(());
        }

        for (_, listener) in self.listeners {
            listener(self.available);
        }
    }
}

pub(crate) struct Core {
    max: usize,
    release: Release,
    state: Mutex<State>,
}

impl Core {
    pub(crate) fn new(max: usize, release: Release) -> Arc<Self> {
        Arc::new(Self {
            max,
            release,
            state: Mutex::new(State {
                available: max,
                disposing: false,
                next_id: 0,
                reservations: HashMap::new(),
                listeners: Vec::new(),
                drained: Vec::new(),
            }),
        })
    }

    pub(crate) fn available_weight(&self) -> Result<usize, Error> {
        let state = self.state.lock();

        if state.disposing {
            return Err(Error::Disposed);
        }

        Ok(state.available)
    }

    /// The total weight, whether or not the limit is disposing.
    pub(crate) fn capacity(&self) -> usize {
        self.max
    }

    pub(crate) fn max_weight(&self) -> Result<usize, Error> {
        if self.state.lock().disposing {
            return Err(Error::Disposed);
        }

        Ok(self.max)
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(level = "trace", skip(self)))]
    pub(crate) fn accrue_token(self: &Arc<Self>, weight: usize) -> Result<Token, Error> {
        check_weight(weight)?;
        let mut state = self.state.lock();

        if state.disposing {
            return Err(Error::Disposed);
        }

        if state.available < weight {
            return Err(Error::NoTokensAvailable);
        }

        let id = state.reserve(weight);
        Ok(Token::reservation(self.clone(), id))
    }

    /// Reserve `weight`, or register the listener built by `listener` if there
    /// isn't enough of it.
    ///
    /// Both happen under the same lock, so a release can't slip in between the
    /// shortage being observed and the listener being registered.
    pub(crate) fn accrue_or_listen<F>(
        self: &Arc<Self>,
        weight: usize,
        listener: F,
    ) -> Result<Accrual, Error>
    where
        F: FnOnce() -> Listener,
    {
        check_weight(weight)?;
        let mut state = self.state.lock();

        if state.disposing {
            return Err(Error::Disposed);
        }

        if state.available < weight {
            let id = ListenerId(state.next_id());
            state.listeners.push((id, listener()));
            return Ok(Accrual::Busy);
        }

        let id = state.reserve(weight);
        Ok(Accrual::Token(Token::reservation(self.clone(), id)))
    }

    pub(crate) fn add_release_listener(&self, listener: Listener) -> ListenerId {
        let mut state = self.state.lock();
        let id = ListenerId(state.next_id());
        state.listeners.push((id, listener));
        id
    }

    pub(crate) fn remove_release_listener(&self, id: ListenerId) -> bool {
        let mut state = self.state.lock();

        match state.listeners.iter().position(|(other, _)| *other == id) {
            Some(index) => {
                drop(state.listeners.remove(index));
                true
            }
            None => false,
        }
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(level = "trace", skip(self)))]
    pub(crate) fn commit(self: &Arc<Self>, id: u64) {
        let delay = match self.release {
            Release::Immediate => None,
            Release::Deferred(delay) => Some(delay),
        };

        let mut state = self.state.lock();
        let disposing = state.disposing;

        let Some(reservation) = state.reservations.get_mut(&id) else {
            return;
        };

        if reservation.finalizing {
            return;
        }

        match delay {
            // A disposing limit releases right away so that disposal doesn't
            // have to wait out the window.
            Some(delay) if !disposing => {
                reservation.finalizing = true;
                let core = Arc::downgrade(self);
                reservation.timer = Some(tokio::spawn(finalize_after(core, id, delay)));
            }
            _ => {
                let released = state.release(id);
                drop(state);
                released.notify();
            }
        }
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(level = "trace", skip(self)))]
    pub(crate) fn rollback(&self, id: u64) {
        let mut state = self.state.lock();

        match state.reservations.get(&id) {
            Some(reservation) if !reservation.finalizing => {}
            _ => return,
        }

        let released = state.release(id);
        drop(state);
        released.notify();
    }

    fn finalize(&self, id: u64) {
        let released = self.state.lock().release(id);
        released.notify();
    }

    /// Stop accepting reservations and wait for the outstanding ones to be
    /// released.
    ///
    /// Committed reservations still waiting out their window are released
    /// immediately.
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "trace", skip(self)))]
    pub(crate) async fn dispose(&self) {
        let (released, drained) = {
            let mut state = self.state.lock();
            state.disposing = true;

            let finalizing = state
                .reservations
                .iter()
                .filter(|(_, reservation)| reservation.finalizing)
                .map(|(id, _)| *id)
                .collect::<Vec<_>>();

            let released = finalizing
                .into_iter()
                .map(|id| state.release(id))
                .collect::<Vec<_>>();

            let drained = if state.reservations.is_empty() {
                None
            } else {
                let (tx, rx) = oneshot::channel();
                state.drained.push(tx);
                Some(rx)
            };

            (released, drained)
        };

        for released in released {
            released.notify();
        }

        if let Some(drained) = drained {
            #[cfg(feature = "tracing")]
            tracing::trace!("waiting for outstanding reservations");
            let _ = drained.await;
        }
    }
}

impl fmt::Debug for Core {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();

        f.debug_struct("Core")
            .field("max", &self.max)
            .field("available", &state.available)
            .field("release", &self.release)
            .field("reservations", &state.reservations.len())
            .field("disposing", &state.disposing)
            .finish()
    }
}

async fn finalize_after(core: Weak<Core>, id: u64, delay: Duration) {
    tokio::time::sleep(delay).await;

    if let Some(core) = core.upgrade() {
        core.finalize(id);
    }
}

pub(crate) fn check_weight(weight: usize) -> Result<(), Error> {
    if weight == 0 {
        return Err(Error::InvalidWeight);
    }

    Ok(())
}
