//! Strict two-party turn arbitration between processes.
//!
//! Two transports share one session model ([`session::SessionState`]) and one
//! rules engine ([`game::Rules`]):
//!
//! - [`mediated`]: parties talk to a coordinator over FIFOs; named semaphores
//!   decide whose turn it is.
//! - [`shared`]: parties play directly on a shared memory record guarded by a
//!   process-shared mutex and condition variable.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod game;
pub mod gate;
pub mod ipc;
pub mod mediated;
pub mod party;
pub mod session;
pub mod shared;
pub mod trace;

pub use config::{SessionConfig, Timeout, Transport};
pub use coordinator::{SessionCoordinator, SessionSummary};
pub use game::{Board, Outcome, PartyId, Position, Rules, TicTacToe};
pub use party::{MoveSource, PartyEvent, PartyReport};
pub use trace::init_tracing;

#[doc(inline)]
pub use ipc::shmem::SharedMemorySafe;

// Re-export serde traits for convenience
pub use serde::{Deserialize, Serialize};
