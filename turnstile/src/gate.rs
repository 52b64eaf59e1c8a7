//! Turn gates: who may act next.
//!
//! Both gates implement [`TurnGate`]:
//!
//! | Gate | Primitive | Wake |
//! |------|-----------|------|
//! | [`SemaphoreGate`] | one named counting semaphore per party | exactly the next holder |
//! | [`CondvarGate`] | process-shared mutex + condvar in the session record | broadcast, every waiter re-checks `turn` |
//!
//! Every wait is bounded by the poll interval, so `acquire` notices
//! termination within one interval even if a wake-up is lost.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::config::SessionConfig;
use crate::error::{GateError, ResourceError};
use crate::game::{Board, PartyId};
use crate::ipc::Creator;
use crate::ipc::semaphore::{self, NamedSemaphore};
use crate::shared::record::{RecordGuard, SessionRecord};
use crate::trace::{debug, trace, warn};

/// What `acquire` observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateEvent {
    /// The caller now holds the turn.
    Turn,
    /// The session is over; the caller must not act.
    Terminated,
}

/// Single-holder turn arbitration.
pub trait TurnGate: Send + Sync {
    /// Blocks until it is `party`'s turn or the session has terminated.
    ///
    /// # Errors
    ///
    /// The underlying wait primitive failed.
    fn acquire(&self, party: PartyId) -> Result<GateEvent, GateError>;

    /// Ends the caller's turn and wakes `next`.
    ///
    /// Passing the caller's own id hands the turn back to itself, which is how
    /// a rejected move keeps the turn.
    ///
    /// # Errors
    ///
    /// The underlying post/broadcast failed.
    fn release_and_advance(&self, next: PartyId) -> Result<(), GateError>;

    /// Marks the gate terminated and wakes every waiter. Idempotent.
    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Counting-signal gate: one wake token per party.
///
/// The coordinator posts party 0's token to start; afterwards exactly one
/// token is outstanding at any time until [`close`](TurnGate::close) posts
/// every token so all waiters come back and see the closed flag.
#[derive(Debug)]
pub struct SemaphoreGate {
    tokens: [NamedSemaphore<Creator>; 2],
    closed: AtomicBool,
    poll: Duration,
}

impl SemaphoreGate {
    /// Creates both semaphores empty, replacing leftovers if configured to.
    ///
    /// # Errors
    ///
    /// [`ResourceError::Semaphore`] if a name is invalid or taken.
    pub fn create(config: &SessionConfig) -> Result<Self, ResourceError> {
        let make = |party: PartyId| -> Result<NamedSemaphore<Creator>, ResourceError> {
            let name = config.turn_semaphore(party)?;
            let fail = |source| ResourceError::Semaphore {
                name: name.to_string(),
                source,
            };
            if config.reclaim_stale {
                semaphore::unlink(&name).map_err(fail)?;
            }
            NamedSemaphore::<Creator>::create(name.clone(), 0).map_err(fail)
        };
        Ok(Self {
            tokens: [make(PartyId::ZERO)?, make(PartyId::ONE)?],
            closed: AtomicBool::new(false),
            poll: config.poll_interval,
        })
    }
}

impl TurnGate for SemaphoreGate {
    fn acquire(&self, party: PartyId) -> Result<GateEvent, GateError> {
        let token = &self.tokens[party.index()];
        loop {
            if self.is_closed() {
                return Ok(GateEvent::Terminated);
            }
            if token.wait_timeout(self.poll).map_err(GateError::Wait)? {
                return Ok(if self.is_closed() {
                    GateEvent::Terminated
                } else {
                    trace!(%party, "turn acquired");
                    GateEvent::Turn
                });
            }
        }
    }

    fn release_and_advance(&self, next: PartyId) -> Result<(), GateError> {
        if self.is_closed() {
            return Ok(());
        }
        self.tokens[next.index()].post().map_err(GateError::Post)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("closing semaphore gate");
        for token in &self.tokens {
            if let Err(e) = token.post() {
                warn!(name = %token.name(), error = %e, "failed to wake party on close");
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Condition-wait gate over the shared session record.
///
/// A party may proceed when both seats are ready and `turn` names it, or when
/// the session is over. The predicate is re-evaluated after every wake-up,
/// spurious or not. While waiting, the gate also watches the other
/// participants' pids and ends the session if one of them died.
pub struct CondvarGate<'a> {
    record: &'a SessionRecord,
    poll: Duration,
}

impl<'a> CondvarGate<'a> {
    #[must_use]
    pub fn new(record: &'a SessionRecord, poll: Duration) -> Self {
        Self { record, poll }
    }

    fn lock(&self) -> Result<RecordGuard<'a>, GateError> {
        let mut guard = self.record.lock().map_err(GateError::Lock)?;
        self.record.recover(&mut guard);
        Ok(guard)
    }

    /// Like [`acquire`](TurnGate::acquire), calling `on_change` with the board
    /// every time a move lands while `party` waits.
    ///
    /// # Errors
    ///
    /// The lock or the condition wait failed.
    pub fn acquire_with(
        &self,
        party: PartyId,
        mut on_change: impl FnMut(Board),
    ) -> Result<GateEvent, GateError> {
        let mut guard = self.lock()?;
        let mut seen = guard.state.moves();
        loop {
            if guard.state.outcome().is_terminal() {
                return Ok(GateEvent::Terminated);
            }
            if let Some(cause) = guard.find_dead_peer(Some(party)) {
                if guard.abandon(cause) {
                    warn!(%party, %cause, "peer gone, abandoning session");
                }
                self.record.publish(&guard);
                guard.notify_all();
                return Ok(GateEvent::Terminated);
            }
            if guard.state.moves() != seen {
                seen = guard.state.moves();
                on_change(guard.state.board());
            }
            if guard.roster.all_ready() && guard.state.turn() == party {
                trace!(%party, "turn acquired");
                return Ok(GateEvent::Turn);
            }
            guard.wait_timeout(self.poll).map_err(GateError::Wait)?;
            self.record.recover(&mut guard);
        }
    }
}

impl TurnGate for CondvarGate<'_> {
    fn acquire(&self, party: PartyId) -> Result<GateEvent, GateError> {
        self.acquire_with(party, |_| {})
    }

    /// `turn` has already been advanced by the move that ended the caller's
    /// turn; this publishes it and wakes every waiter.
    fn release_and_advance(&self, next: PartyId) -> Result<(), GateError> {
        let guard = self.lock()?;
        debug_assert!(
            guard.state.outcome().is_terminal() || guard.state.turn() == next,
            "turn must already name the next holder"
        );
        self.record.publish(&guard);
        guard.notify_all();
        Ok(())
    }

    fn close(&self) {
        match self.lock() {
            Ok(mut guard) => {
                if guard.state.abandon() {
                    debug!("condvar gate closed before a decision");
                }
                self.record.publish(&guard);
                guard.notify_all();
            }
            Err(e) => warn!(error = %e, "failed to lock session record on close"),
        }
    }

    fn is_closed(&self) -> bool {
        self.record.terminal().is_terminal()
    }
}
