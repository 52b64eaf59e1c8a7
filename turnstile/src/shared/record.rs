//! Fixed layout of the shared-memory session record.
//!
//! ```text
//! SessionRecord (repr C, one per session, mapped by every process)
//! ┌──────────────┬──────────────┬────────────────────────────────────────┐
//! │ init: u64    │ terminal: u8 │ ProcessMutex<Guarded>                  │
//! │ (magic once  │ (mirror of   │  ├─ SessionState (board, turn, outcome)│
//! │  ready)      │  outcome)    │  ├─ Roster (seats, pids, telemetry)    │
//! │              │              │  └─ coordinator pid                    │
//! └──────────────┴──────────────┴────────────────────────────────────────┘
//! ```
//!
//! Everything except `init` and `terminal` is read and written only under the
//! process-shared lock. `terminal` is a single atomically updated byte, so
//! pollers may read it without the lock.

use std::io;
use std::mem::MaybeUninit;
use std::ptr::addr_of_mut;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::Duration;

use minstant::Instant;

use crate::error::PeerClosed;
use crate::game::{Outcome, PartyId};
use crate::ipc::pshared::{ProcessMutex, ProcessMutexGuard};
use crate::ipc::shmem::SharedMemorySafe;
use crate::session::SessionState;

const INIT_MAGIC: u64 = 0x5455_524E_5354_494C; // "TURNSTIL" in ASCII

const ABANDONED_NONE: u8 = 0;
const ABANDONED_COORDINATOR: u8 = 3;

/// Seat bookkeeping.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Roster {
    /// Seats handed out so far.
    pub registered: u8,
    pub ready: [bool; 2],
    /// Set by a party on its way out.
    pub detached: [bool; 2],
    pub pids: [i32; 2],
    /// Accumulated time each party spent producing moves.
    pub input_nanos: [u64; 2],
    /// Who vanished, if the session was abandoned.
    abandoned_by: u8,
}

impl Roster {
    /// `true` once both seats are taken and ready.
    #[must_use]
    pub fn all_ready(&self) -> bool {
        self.registered as usize == PartyId::ALL.len() && self.ready.iter().all(|&r| r)
    }

    #[must_use]
    pub fn abandoned_by(&self) -> Option<PeerClosed> {
        match self.abandoned_by {
            ABANDONED_NONE => None,
            ABANDONED_COORDINATOR => Some(PeerClosed::Coordinator),
            raw => PartyId::new(usize::from(raw - 1)).map(PeerClosed::Party),
        }
    }

    fn record_abandon(&mut self, cause: PeerClosed) {
        if self.abandoned_by == ABANDONED_NONE {
            self.abandoned_by = match cause {
                PeerClosed::Party(p) => 1 + p.index() as u8,
                PeerClosed::Coordinator => ABANDONED_COORDINATOR,
            };
        }
    }
}

/// Lock-protected part of the record.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Guarded {
    pub state: SessionState,
    pub roster: Roster,
    pub coordinator_pid: i32,
}

impl Guarded {
    /// Ends the session as drawn on behalf of a vanished participant.
    ///
    /// Returns `true` if this call ended the session.
    pub fn abandon(&mut self, cause: PeerClosed) -> bool {
        let ended = self.state.abandon();
        if ended {
            self.roster.record_abandon(cause);
        }
        ended
    }

    /// First participant found dead, looking from `viewer`'s side.
    ///
    /// `None` as viewer means the coordinator is asking.
    #[must_use]
    pub fn find_dead_peer(&self, viewer: Option<PartyId>) -> Option<PeerClosed> {
        if viewer.is_some() && !pid_alive(self.coordinator_pid) {
            return Some(PeerClosed::Coordinator);
        }
        PartyId::ALL
            .into_iter()
            .filter(|&p| Some(p) != viewer)
            .filter(|p| p.index() < self.roster.registered as usize)
            .filter(|p| !self.roster.detached[p.index()])
            .find(|p| !pid_alive(self.roster.pids[p.index()]))
            .map(PeerClosed::Party)
    }
}

/// The whole shared-memory record.
#[repr(C)]
pub struct SessionRecord {
    init: AtomicU64,
    terminal: AtomicU8,
    lock: ProcessMutex<Guarded>,
}

// SAFETY: repr(C); Roster, Guarded and SessionState are plain data; the
// atomics and the process-shared lock are designed for cross-process use.
unsafe impl SharedMemorySafe for Roster {}
unsafe impl SharedMemorySafe for Guarded {}
unsafe impl SharedMemorySafe for SessionRecord {}

pub type RecordGuard<'a> = ProcessMutexGuard<'a, Guarded>;

impl SessionRecord {
    /// Initializes a freshly mapped record and publishes the init marker last.
    ///
    /// # Errors
    ///
    /// Failure to initialize the process-shared lock.
    pub fn init_in_place(slot: &mut MaybeUninit<Self>, coordinator_pid: i32) -> io::Result<()> {
        let this = slot.as_mut_ptr();
        // SAFETY: `this` is valid, writable and not yet visible as a `Self`;
        // each field is written through a raw pointer before any read.
        unsafe {
            addr_of_mut!((*this).init).write(AtomicU64::new(0));
            addr_of_mut!((*this).terminal).write(AtomicU8::new(Outcome::InProgress.to_raw()));
            let lock = &mut *addr_of_mut!((*this).lock).cast::<MaybeUninit<ProcessMutex<Guarded>>>();
            ProcessMutex::init_in_place(
                lock,
                Guarded {
                    state: SessionState::new(),
                    roster: Roster::default(),
                    coordinator_pid,
                },
            )?;
            (*this).init.store(INIT_MAGIC, Ordering::Release);
        }
        Ok(())
    }

    /// Waits until the creator published the init marker.
    #[must_use]
    pub fn wait_for_init(&self, timeout: Duration) -> bool {
        let start = Instant::now();
        loop {
            if self.init.load(Ordering::Acquire) == INIT_MAGIC {
                return true;
            }
            if start.elapsed() >= timeout {
                return false;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Takes the session lock.
    ///
    /// # Errors
    ///
    /// Unrecoverable lock failures.
    pub fn lock(&self) -> io::Result<RecordGuard<'_>> {
        self.lock.lock()
    }

    /// Terminal status without taking the lock.
    #[must_use]
    pub fn terminal(&self) -> Outcome {
        Outcome::from_raw(self.terminal.load(Ordering::Acquire))
    }

    /// Copies the guarded outcome into the lock-free mirror.
    ///
    /// Must be called with `guard` held after any change to the outcome.
    pub fn publish(&self, guard: &Guarded) {
        self.terminal
            .store(guard.state.outcome().to_raw(), Ordering::Release);
    }

    /// Handles a lock recovered from a dead owner: the half-finished update
    /// cannot be trusted, so the session ends drawn.
    pub fn recover(&self, guard: &mut RecordGuard<'_>) {
        if guard.owner_died() {
            let culprit = guard.find_dead_peer(None).unwrap_or(PeerClosed::Coordinator);
            if guard.abandon(culprit) {
                crate::trace::warn!(cause = %culprit, "lock owner died, abandoning session");
            }
            self.publish(guard);
            guard.notify_all();
        }
    }
}

/// `kill(pid, 0)` liveness check. Unset pids count as alive.
#[must_use]
pub fn pid_alive(pid: i32) -> bool {
    if pid <= 0 {
        return true;
    }
    // SAFETY: signal 0 performs only the permission and existence check.
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}
