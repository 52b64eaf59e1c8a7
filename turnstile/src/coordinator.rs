//! Session coordinator contract and the report it produces.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PeerClosed, SessionError};
use crate::game::{Outcome, PartyId};

/// Lifecycle shared by both transports.
///
/// ```text
/// create() ──> await_parties(2) ──> run() ──> teardown()
///   objects       seats taken        play      objects removed
/// ```
pub trait SessionCoordinator {
    /// Blocks until `n` parties have registered. Only `n == 2` is supported.
    ///
    /// # Errors
    ///
    /// [`SessionError::AwaitTimeout`] if the configured wait runs out,
    /// [`SessionError::PartyCount`] for any `n` other than 2.
    fn await_parties(&mut self, n: usize) -> Result<(), SessionError>;

    /// Plays the session to termination, notifies every party and detaches
    /// every per-party primitive.
    ///
    /// # Errors
    ///
    /// [`SessionError::NotReady`] before `await_parties` succeeded; resource
    /// failures that make supervision impossible.
    fn run(&mut self) -> Result<SessionSummary, SessionError>;

    /// Removes every OS object this coordinator created. Idempotent.
    fn teardown(&mut self);
}

/// What happened in one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub outcome: Outcome,
    pub moves: u32,
    /// Wall time from both parties joining to termination.
    pub runtime: Duration,
    /// Time each party spent producing its moves, as reported by the party.
    pub input_time: [Duration; 2],
    /// Set when the session ended because someone vanished.
    pub abandoned_by: Option<PeerClosed>,
}

impl SessionSummary {
    #[must_use]
    pub fn total_input_time(&self) -> Duration {
        self.input_time.iter().sum()
    }

    /// Runtime minus time spent waiting on input.
    #[must_use]
    pub fn adjusted(&self) -> Duration {
        self.runtime.saturating_sub(self.total_input_time())
    }
}

impl fmt::Display for SessionSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.outcome {
            Outcome::Decided(p) => writeln!(f, "Result: party {p} wins")?,
            _ => writeln!(f, "Result: draw")?,
        }
        if let Some(cause) = self.abandoned_by {
            writeln!(f, "Ended early: {cause}")?;
        }
        writeln!(f, "Moves: {}", self.moves)?;
        writeln!(f, "Total runtime: {:.3} s", self.runtime.as_secs_f64())?;
        for party in PartyId::ALL {
            writeln!(
                f,
                "Input time party {party}: {:.3} s",
                self.input_time[party.index()].as_secs_f64()
            )?;
        }
        write!(
            f,
            "Adjusted time (runtime - input): {:.3} s",
            self.adjusted().as_secs_f64()
        )
    }
}
