//! Party endpoint of the shared-memory transport.
//!
//! A party maps the session record, takes the next free seat and then plays
//! directly on the shared state: moves are validated and applied under the
//! process-shared lock, and the condvar broadcast hands the turn over.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use minstant::Instant;

use super::record::SessionRecord;
use crate::config::{SessionConfig, Timeout};
use crate::error::{ConnectError, GateError, PartyError, PeerClosed};
use crate::game::{Outcome, PartyId, Rules, TicTacToe};
use crate::gate::{CondvarGate, GateEvent};
use crate::ipc::Opener;
use crate::ipc::shmem::{Shm, ShmError};
use crate::party::{Input, MoveSource, PartyEvent, PartyReport, Termination};
use crate::trace::{debug, info, warn};

/// A party seated in a shared-memory session.
pub struct ShmParty {
    shm: Shm<SessionRecord, Opener>,
    id: PartyId,
    poll: Duration,
    rules: Arc<dyn Rules>,
    detached: bool,
}

impl ShmParty {
    /// Maps the session segment and registers under the next free seat.
    ///
    /// # Errors
    ///
    /// - [`ConnectError::Absent`] when no session segment exists or the
    ///   session is already over.
    /// - [`ConnectError::SessionFull`] when both seats are taken.
    /// - [`ConnectError::Shm`] when the segment never finishes initializing.
    pub fn connect(config: &SessionConfig) -> Result<Self, ConnectError> {
        Self::connect_as(config, std::process::id() as i32)
    }

    pub(crate) fn connect_as(config: &SessionConfig, pid: i32) -> Result<Self, ConnectError> {
        let path = config.segment()?;
        let shm = match Shm::<SessionRecord, Opener>::open(path.clone()) {
            Ok(shm) => shm,
            Err(e) if e.errno() == Some(rustix::io::Errno::NOENT) => {
                return Err(ConnectError::Absent(path.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let init_wait = match config.connect_timeout {
            Timeout::Duration(d) => d,
            Timeout::Infinite => Duration::MAX,
        };
        if !shm.wait_for_init(init_wait) {
            return Err(ShmError::InitTimeout {
                path: path.to_string(),
            }
            .into());
        }

        let id = {
            let mut guard = shm.lock()?;
            shm.recover(&mut guard);
            if guard.state.outcome().is_terminal() {
                return Err(ConnectError::Absent(path.to_string()));
            }
            let Some(id) = PartyId::new(guard.roster.registered as usize) else {
                return Err(ConnectError::SessionFull);
            };
            guard.roster.registered += 1;
            guard.roster.pids[id.index()] = pid;
            guard.roster.ready[id.index()] = true;
            guard.notify_all();
            id
        };

        info!(party = %id, segment = %path, "joined shared session");
        Ok(Self {
            shm,
            id,
            poll: config.poll_interval,
            rules: Arc::new(TicTacToe),
            detached: false,
        })
    }

    /// Replaces the rules engine; both parties must use the same one.
    #[must_use]
    pub fn with_rules(mut self, rules: Arc<dyn Rules>) -> Self {
        self.rules = rules;
        self
    }

    #[must_use]
    pub fn id(&self) -> PartyId {
        self.id
    }

    /// Plays until the session terminates, then detaches.
    ///
    /// Moves come from `source` only while this party holds the turn. Every
    /// step is reported to `observer`, ending with exactly one
    /// [`PartyEvent::Terminated`].
    ///
    /// # Errors
    ///
    /// Lock, wait or move source failures. The seat is released either way.
    pub fn play(
        mut self,
        source: &mut dyn MoveSource,
        mut observer: impl FnMut(&PartyEvent),
    ) -> Result<PartyReport, PartyError> {
        observer(&PartyEvent::Connected(self.id));
        let mut moves_sent = 0;
        let mut input_time = Duration::ZERO;
        let played = self.play_turns(source, &mut observer, &mut moves_sent, &mut input_time);
        let left = self.detach();

        let input_closed = played?;
        let (outcome, abandoned_by) = left?;
        let cause = match (input_closed, abandoned_by) {
            (true, _) => Termination::InputClosed,
            (false, Some(peer)) => Termination::PeerClosed(peer),
            (false, None) => Termination::Concluded,
        };
        info!(party = %self.id, %outcome, ?cause, "leaving session");
        observer(&PartyEvent::Terminated { outcome, cause });
        Ok(PartyReport {
            party: self.id,
            outcome,
            cause,
            moves_sent,
            input_time,
        })
    }

    /// Returns `true` if the party left because its move source ran dry.
    fn play_turns(
        &self,
        source: &mut dyn MoveSource,
        observer: &mut impl FnMut(&PartyEvent),
        moves_sent: &mut u32,
        input_time: &mut Duration,
    ) -> Result<bool, PartyError> {
        let record: &SessionRecord = &self.shm;
        let gate = CondvarGate::new(record, self.poll);
        let party = self.id;

        loop {
            let event = gate.acquire_with(party, |board| {
                source.observe(&board);
                observer(&PartyEvent::Board(board));
            })?;
            if event == GateEvent::Terminated {
                return Ok(false);
            }

            let board = record.lock().map_err(GateError::Lock)?.state.board();
            source.observe(&board);
            observer(&PartyEvent::Board(board));
            observer(&PartyEvent::YourTurn);
            let started = Instant::now();

            // Acting: keep the turn until a move is accepted.
            loop {
                if record.terminal().is_terminal() {
                    return Ok(false);
                }
                let position = match source.poll_move(self.poll)? {
                    Input::Move(position) => position,
                    Input::Pending => continue,
                    Input::Malformed(line) => {
                        observer(&PartyEvent::InvalidMove(format!(
                            "cannot read `{line}` as a move, expected `<row> <col>`"
                        )));
                        continue;
                    }
                    Input::Closed => return Ok(true),
                };

                let elapsed = started.elapsed();
                *moves_sent += 1;
                *input_time += elapsed;
                let mut guard = record.lock().map_err(GateError::Lock)?;
                record.recover(&mut guard);
                let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
                let slot = &mut guard.roster.input_nanos[party.index()];
                *slot = slot.saturating_add(nanos);
                match guard.state.submit_move(party, position, self.rules.as_ref()) {
                    Ok(result) => {
                        debug!(%party, pos = %position, outcome = %result.outcome, "move applied");
                        record.publish(&guard);
                        guard.notify_all();
                        break;
                    }
                    Err(e) => {
                        drop(guard);
                        debug!(%party, reason = %e, "move rejected");
                        observer(&PartyEvent::InvalidMove(e.to_string()));
                        observer(&PartyEvent::Board(board));
                    }
                }
            }
        }
    }

    /// Marks the seat detached, abandoning the session if it is still open.
    ///
    /// Returns the outcome and who, if anyone, vanished.
    fn detach(&mut self) -> io::Result<(Outcome, Option<PeerClosed>)> {
        let mut guard = self.shm.lock()?;
        self.shm.recover(&mut guard);
        if !self.detached {
            self.detached = true;
            guard.roster.detached[self.id.index()] = true;
            if guard.abandon(PeerClosed::Party(self.id)) {
                warn!(party = %self.id, "left an open session");
            }
            self.shm.publish(&guard);
            guard.notify_all();
        }
        Ok((guard.state.outcome(), guard.roster.abandoned_by()))
    }
}

impl Drop for ShmParty {
    fn drop(&mut self) {
        if !self.detached
            && let Err(e) = self.detach()
        {
            warn!(party = %self.id, error = %e, "failed to detach");
        }
    }
}
