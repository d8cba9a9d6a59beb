//! Round-robin session scheduling.
//!
//! The scheduler owns the rotation of in-flight sessions and steps them one
//! token at a time. It is single-threaded cooperative: all session state is
//! only ever touched from the thread driving [SessionScheduler::step_next].
//! It holds sessions weakly, so dropping a session handle simply makes its
//! entry vanish on the next visit.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use crate::inference_session::{
    InferenceError, InferenceFeedback, InferenceRequest, InferenceSession, SessionCore, StepOutcome,
};

/// The rotation of active sessions.
///
/// One scheduler typically serves a whole process, but nothing stops an
/// embedder from running several; each is an independent rotation.
#[derive(Default)]
pub struct SessionScheduler {
    active: RefCell<VecDeque<Weak<SessionCore>>>,
}

impl SessionScheduler {
    /// Create an empty scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start (or restart) a query on `session` and place it in the rotation.
    ///
    /// The prompt is encoded (chat-wrapped for chat models), the session's
    /// position and sampler are reset, and `callback` receives each decoded
    /// piece from [SessionScheduler::step_next]. Returning
    /// [InferenceFeedback::Halt] from the callback cancels the session.
    pub fn query(
        &self,
        session: &InferenceSession,
        request: InferenceRequest,
        callback: impl FnMut(&str) -> InferenceFeedback + 'static,
    ) -> Result<(), InferenceError> {
        let core = session.core();
        core.reset_for_query(request, Box::new(callback))?;
        if !core.is_registered() {
            core.set_registered(true);
            self.active.borrow_mut().push_back(Arc::downgrade(core));
        }
        Ok(())
    }

    /// Step the next session in the rotation by one token.
    ///
    /// Visits exactly one rotation slot: a live session produces (at most)
    /// one piece for its callback, a cancelled or dropped one is swept.
    /// Returns whether any session remains active, so
    /// `while scheduler.step_next() {}` drains the rotation.
    pub fn step_next(&self) -> bool {
        let front = self.active.borrow_mut().pop_front();
        let weak = match front {
            Some(weak) => weak,
            None => return false,
        };

        match weak.upgrade() {
            Some(core) => match core.step() {
                StepOutcome::Continue => self.active.borrow_mut().push_back(weak),
                StepOutcome::Deregister => core.set_registered(false),
            },
            // The owning handle was dropped mid-generation; nothing to do.
            None => {}
        }

        !self.active.borrow().is_empty()
    }

    /// Mark a session as cancelled.
    ///
    /// The session is deregistered on its next scheduler visit; no callback
    /// fires for it after this returns. Cancelling a finished (or already
    /// cancelled) session is a no-op.
    pub fn cancel(&self, session: &InferenceSession) {
        session.core().mark_cancelled();
    }

    /// Number of sessions currently in the rotation (dropped handles that
    /// have not been swept yet are not counted).
    pub fn active_sessions(&self) -> usize {
        self.active
            .borrow()
            .iter()
            .filter(|weak| weak.upgrade().is_some())
            .count()
    }
}
