//! Mediated transport: FIFOs for messages, named semaphores for turns.
//!
//! Each party talks only to the coordinator over its own pair of FIFOs
//! (`client<id>` inbound, `server<id>` outbound). The coordinator owns the
//! session state and decides every move.

pub mod coordinator;
pub mod party;
pub mod protocol;

pub use coordinator::PipeCoordinator;
pub use party::PipeParty;
pub use protocol::{CoordinatorMessage, MoveMessage};
