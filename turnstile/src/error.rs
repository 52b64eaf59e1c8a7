//! Error taxonomy.
//!
//! | Error | Raised by | Effect |
//! |-------|-----------|--------|
//! | [`ResourceError`] | creating/attaching OS objects | fatal at startup |
//! | [`ConnectError`] | party rendezvous | caller retries or aborts |
//! | [`ProtocolError`] | malformed wire token | party is asked to retry |
//! | [`InvalidMove`] | move validation | party keeps the turn |
//! | [`PeerClosed`] | channel/segment/process went away | session ends drawn |

use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::game::{Outcome, PartyId, Position};
use crate::ipc::shmem::ShmError;

/// An OS-level IPC object could not be created, opened or attached.
#[derive(Debug, Error)]
pub enum ResourceError {
    /// Creating, removing or opening a FIFO failed.
    #[error("channel {}: {source}", path.display())]
    Channel {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// Creating or removing a named semaphore failed.
    #[error("semaphore {name}: {source}")]
    Semaphore {
        name: String,
        #[source]
        source: io::Error,
    },
    /// Shared memory name, creation or mapping failed.
    #[error("shared memory error: {0}")]
    Shm(#[from] ShmError),
    /// Initializing the process-shared lock failed.
    #[error("process-shared lock: {0}")]
    Lock(#[source] io::Error),
    /// A worker thread could not be started.
    #[error("failed to spawn thread: {0}")]
    Spawn(#[source] io::Error),
}

/// A party could not join a session.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// No session is waiting at the rendezvous point.
    #[error("no session at {0}")]
    Absent(String),
    /// Both seats are taken.
    #[error("session already has two parties")]
    SessionFull,
    /// Another process already holds the requested seat.
    #[error("seat {0} is already taken")]
    SeatTaken(PartyId),
    /// The coordinator did not answer in time.
    #[error("timed out waiting for the coordinator")]
    Timeout,
    /// The coordinator answered with something other than a welcome.
    #[error("unexpected handshake message `{0}`")]
    Handshake(String),
    /// The seat the party asked for is not the one it was given.
    #[error("expected seat {expected}, coordinator assigned {assigned}")]
    SeatMismatch { expected: PartyId, assigned: PartyId },
    /// Shared memory attach failed for a reason other than absence.
    #[error("shared memory error: {0}")]
    Shm(#[from] ShmError),
    /// Opening a channel or the lock failed.
    #[error("connect I/O error: {0}")]
    Io(#[from] io::Error),
}

/// A wire token could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("empty message")]
    Empty,
    #[error("unknown message `{0}`")]
    Unknown(String),
    #[error("malformed {kind} message `{raw}`")]
    Malformed { kind: &'static str, raw: String },
}

/// A move was rejected. State is unchanged and the party keeps the turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InvalidMove {
    #[error("{0} is off the board")]
    OutOfBounds(Position),
    #[error("{0} is already taken")]
    Occupied(Position),
    #[error("party {party} moved during party {turn}'s turn")]
    NotYourTurn { party: PartyId, turn: PartyId },
    #[error("session is over ({0})")]
    SessionOver(Outcome),
}

/// The other side went away without concluding the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum PeerClosed {
    #[error("party {0} disconnected")]
    Party(PartyId),
    #[error("coordinator disconnected")]
    Coordinator,
}

/// A turn gate primitive failed.
#[derive(Debug, Error)]
pub enum GateError {
    #[error("waiting for the turn failed: {0}")]
    Wait(#[source] io::Error),
    #[error("handing off the turn failed: {0}")]
    Post(#[source] io::Error),
    #[error("session lock failed: {0}")]
    Lock(#[source] io::Error),
}

/// Failure while a coordinator runs a session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Resource(#[from] ResourceError),
    #[error(transparent)]
    Gate(#[from] GateError),
    /// Not every party joined within the configured wait.
    #[error("timed out with {joined} of {expected} parties joined")]
    AwaitTimeout { joined: usize, expected: usize },
    /// `run` was called before `await_parties` completed.
    #[error("parties have not joined yet")]
    NotReady,
    /// Sessions are strictly two-party.
    #[error("sessions have exactly two parties, asked for {0}")]
    PartyCount(usize),
}

/// Failure inside a party endpoint.
#[derive(Debug, Error)]
pub enum PartyError {
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error(transparent)]
    Gate(#[from] GateError),
    /// The coordinator sent something this party cannot interpret.
    #[error("coordinator sent an invalid message: {0}")]
    Protocol(#[from] ProtocolError),
    /// Channel or input source I/O failed.
    #[error("party I/O error: {0}")]
    Io(#[from] io::Error),
}
