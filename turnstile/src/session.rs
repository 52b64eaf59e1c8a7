//! Session state shared by both transports.

pub mod state;

pub use state::{MoveResult, SessionState};
