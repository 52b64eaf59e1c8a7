//! Shared-memory transport.
//!
//! One POSIX shared memory segment holds the [`SessionRecord`](record::SessionRecord):
//! board, turn, outcome, seats and a process-shared mutex/condvar pair. The
//! coordinator creates and supervises it; parties map it and play on it
//! directly.

pub mod coordinator;
pub mod party;
pub mod record;

pub use coordinator::ShmCoordinator;
pub use party::ShmParty;
