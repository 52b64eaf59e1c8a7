//! Cross-process primitives.
//!
//! Every named OS object in this module follows the same ownership rule: the
//! process that creates a name is the one that removes it. The rule is carried
//! in the type as a [`Creator`] or [`Opener`] marker so that dropping a handle
//! does the right cleanup without a runtime flag.
//!
//! - [`shmem`] - typed POSIX shared memory
//! - [`pshared`] - process-shared mutex + condition variable living in shared memory
//! - [`semaphore`] - named POSIX counting semaphores
//! - [`fifo`] - named FIFO byte channels with newline framing

pub mod fifo;
pub mod pshared;
pub mod semaphore;
pub mod shmem;

/// Cleanup behavior of a handle to a named OS object.
///
/// ```text
/// Creator          Opener
///    ↓                ↓
///   Drop            Drop
///    ↓                ↓
///  close            close
///  unlink         (no unlink)
/// ```
pub trait Ownership {
    /// Whether dropping the handle removes the name from the system.
    const SHOULD_UNLINK: bool;
}

/// Typestate marker for the process that created a named object.
///
/// Dropping a `Creator` handle closes it and unlinks the name.
#[derive(Debug)]
pub struct Creator;

impl Ownership for Creator {
    const SHOULD_UNLINK: bool = true;
}

/// Typestate marker for a process that opened an existing named object.
///
/// Dropping an `Opener` handle only closes it; the name stays for the
/// creator to remove.
#[derive(Debug)]
pub struct Opener;

impl Ownership for Opener {
    const SHOULD_UNLINK: bool = false;
}
