//! Party endpoint of the mediated transport.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use minstant::Instant;

use super::protocol::{CoordinatorMessage, MoveMessage};
use crate::config::SessionConfig;
use crate::error::{ConnectError, PartyError, PeerClosed};
use crate::game::{Outcome, PartyId};
use crate::ipc::Opener;
use crate::ipc::fifo::{Fifo, FifoReader, FifoWriter, ReadStatus};
use crate::party::{Input, MoveSource, PartyEvent, PartyPhase, PartyReport, Termination};
use crate::trace::{debug, info, warn};

fn absent(path: &Path) -> ConnectError {
    ConnectError::Absent(path.display().to_string())
}

fn attach(path: PathBuf) -> Result<Fifo<Opener>, ConnectError> {
    Fifo::<Opener>::attach(&path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => absent(&path),
        _ => ConnectError::Io(e),
    })
}

/// A party connected to a mediated session.
#[derive(Debug)]
pub struct PipeParty {
    id: PartyId,
    poll: Duration,
    tx: FifoWriter,
    rx: FifoReader,
}

impl PipeParty {
    /// Opens both channels of seat `id` and waits for the coordinator's
    /// welcome.
    ///
    /// # Errors
    ///
    /// - [`ConnectError::Absent`] when no coordinator has created the channels
    ///   or none is reading them.
    /// - [`ConnectError::Timeout`] when no welcome arrives within
    ///   `connect_timeout`.
    /// - [`ConnectError::SeatTaken`] when another process already plays seat
    ///   `id`.
    /// - [`ConnectError::Handshake`] or [`ConnectError::SeatMismatch`] for an
    ///   unexpected first message.
    pub fn connect(config: &SessionConfig, id: PartyId) -> Result<Self, ConnectError> {
        let client = attach(config.client_channel(id))?;
        let tx = client.open_writer().map_err(|e| match e.raw_os_error() {
            Some(libc::ENXIO) => absent(client.path()),
            _ => ConnectError::Io(e),
        })?;
        // The lock marks the seat as held until this party closes its channel.
        if !tx.try_lock()? {
            return Err(ConnectError::SeatTaken(id));
        }
        let server = attach(config.server_channel(id))?;
        let mut rx = server.open_reader()?;

        let deadline = config.connect_timeout.deadline(Instant::now());
        loop {
            match rx.read_message(config.poll_interval)? {
                ReadStatus::Message(line) => match line.parse::<CoordinatorMessage>() {
                    Ok(CoordinatorMessage::Welcome(assigned)) if assigned == id => break,
                    Ok(CoordinatorMessage::Welcome(assigned)) => {
                        return Err(ConnectError::SeatMismatch {
                            expected: id,
                            assigned,
                        });
                    }
                    _ => return Err(ConnectError::Handshake(line)),
                },
                ReadStatus::Pending => {}
                ReadStatus::Closed => return Err(absent(server.path())),
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(ConnectError::Timeout);
            }
        }

        info!(party = %id, "joined mediated session");
        Ok(Self {
            id,
            poll: config.poll_interval,
            tx,
            rx,
        })
    }

    #[must_use]
    pub fn id(&self) -> PartyId {
        self.id
    }

    /// Plays until the session terminates, then closes both channels.
    ///
    /// Moves come from `source` only while this party holds the turn. Every
    /// step is reported to `observer`, ending with exactly one
    /// [`PartyEvent::Terminated`].
    ///
    /// # Errors
    ///
    /// Channel or move source I/O failures other than the coordinator going
    /// away, which ends the session as [`PeerClosed::Coordinator`].
    pub fn play(
        mut self,
        source: &mut dyn MoveSource,
        mut observer: impl FnMut(&PartyEvent),
    ) -> Result<PartyReport, PartyError> {
        let mut phase = PartyPhase::WaitingForTurn;
        let mut turn_started = Instant::now();
        let mut moves_sent = 0;
        let mut input_time = Duration::ZERO;
        let coordinator_gone = (Outcome::Drawn, Termination::PeerClosed(PeerClosed::Coordinator));

        observer(&PartyEvent::Connected(self.id));
        let (outcome, cause) = loop {
            // While acting, only drain what is already there.
            let wait = if phase == PartyPhase::Acting { Duration::ZERO } else { self.poll };
            match self.rx.read_message(wait)? {
                ReadStatus::Message(line) => {
                    match line.parse::<CoordinatorMessage>() {
                        Ok(CoordinatorMessage::Board(board)) => {
                            source.observe(&board);
                            observer(&PartyEvent::Board(board));
                        }
                        Ok(CoordinatorMessage::YourTurn) => {
                            if phase != PartyPhase::Acting {
                                phase = PartyPhase::Acting;
                                turn_started = Instant::now();
                            }
                            observer(&PartyEvent::YourTurn);
                        }
                        Ok(CoordinatorMessage::InvalidMove) => {
                            observer(&PartyEvent::InvalidMove(
                                "rejected by the coordinator".into(),
                            ));
                        }
                        Ok(CoordinatorMessage::GameOver(outcome)) => {
                            break (outcome, Termination::Concluded);
                        }
                        Ok(CoordinatorMessage::Welcome(_)) => {
                            debug!(party = %self.id, "repeated welcome");
                        }
                        Err(e) => {
                            warn!(party = %self.id, error = %e, "ignoring unreadable message");
                        }
                    }
                    // Drain the channel before asking the source again.
                    continue;
                }
                ReadStatus::Pending => {}
                ReadStatus::Closed => break coordinator_gone,
            }

            if phase != PartyPhase::Acting {
                continue;
            }
            match source.poll_move(self.poll)? {
                Input::Move(position) => {
                    let elapsed = turn_started.elapsed();
                    match self.tx.send(&MoveMessage { position, elapsed }) {
                        Ok(()) => {}
                        Err(e) if e.kind() == io::ErrorKind::BrokenPipe => break coordinator_gone,
                        Err(e) => return Err(e.into()),
                    }
                    debug!(party = %self.id, pos = %position, "move sent");
                    moves_sent += 1;
                    input_time += elapsed;
                    phase = PartyPhase::WaitingForTurn;
                }
                Input::Pending => {}
                Input::Malformed(line) => observer(&PartyEvent::InvalidMove(format!(
                    "cannot read `{line}` as a move, expected `<row> <col>`"
                ))),
                Input::Closed => break (Outcome::Drawn, Termination::InputClosed),
            }
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
}
