use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::base::Core;

/// A reservation of weight against one or more limits.
///
/// A token is finalized exactly once, either through [`Token::commit`] or
/// [`Token::rollback`]. Whichever is called first takes effect and every later
/// call is a no-op.
///
/// Dropping a token which hasn't been finalized rolls it back.
#[must_use = "dropping a token rolls it back"]
pub struct Token {
    finalized: AtomicBool,
    kind: Kind,
}

enum Kind {
    Reservation { core: Arc<Core>, id: u64 },
    Aggregated(Vec<Token>),
}

impl Token {
    pub(crate) fn reservation(core: Arc<Core>, id: u64) -> Self {
        Self {
            finalized: AtomicBool::new(false),
            kind: Kind::Reservation { core, id },
        }
    }

    pub(crate) fn aggregated(tokens: Vec<Token>) -> Self {
        Self {
            finalized: AtomicBool::new(false),
            kind: Kind::Aggregated(tokens),
        }
    }

    /// Mark the work guarded by this token as done.
    ///
    /// Concurrency slots are returned immediately, while hits against a
    /// timespan stay spent until the window has passed.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime when the token covers a
    /// timespan limit, since releasing the hit is scheduled on a timer.
    pub fn commit(&self) {
        if self.finalized.swap(true, Ordering::AcqRel) {
            return;
        }

        match &self.kind {
            Kind::Reservation { core, id } => core.commit(*id),
            Kind::Aggregated(tokens) => tokens.iter().for_each(Token::commit),
        }
    }

    /// Abandon the token, as if it was never accrued.
    ///
    /// All reserved weight is returned immediately.
    pub fn rollback(&self) {
        if self.finalized.swap(true, Ordering::AcqRel) {
            return;
        }

        match &self.kind {
            Kind::Reservation { core, id } => core.rollback(*id),
            Kind::Aggregated(tokens) => tokens.iter().for_each(Token::rollback),
        }
    }

    /// Test if the token has been committed or rolled back.
    pub fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::Acquire)
    }
}

impl Drop for Token {
    fn drop(&mut self) {
        self.rollback();
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_struct("Token");
        f.field("finalized", &self.is_finalized());

        match &self.kind {
            Kind::Reservation { id, .. } => f.field("id", id),
            Kind::Aggregated(tokens) => f.field("tokens", tokens),
        };

        f.finish()
    }
}
