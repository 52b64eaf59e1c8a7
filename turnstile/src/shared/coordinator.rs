//! Coordinator of the shared-memory transport.
//!
//! The coordinator only owns the segment and supervises: parties validate and
//! apply their own moves under the session lock. A named monitor thread
//! watches the outcome and the parties' pids, and after termination gives the
//! parties `detach_grace` to leave before the segment is removed.

use std::thread;
use std::time::Duration;

use minstant::Instant;

use super::record::{SessionRecord, pid_alive};
use crate::config::SessionConfig;
use crate::coordinator::{SessionCoordinator, SessionSummary};
use crate::error::{GateError, ResourceError, SessionError};
use crate::game::PartyId;
use crate::ipc::Creator;
use crate::ipc::shmem::{self, Shm};
use crate::trace::{debug, error, info, warn};

/// Session coordinator over one shared-memory record.
pub struct ShmCoordinator {
    config: SessionConfig,
    shm: Option<Shm<SessionRecord, Creator>>,
    joined: bool,
}

impl ShmCoordinator {
    /// Creates and initializes the session segment.
    ///
    /// With `reclaim_stale` set, a segment left behind by a crashed session
    /// is unlinked first.
    ///
    /// # Errors
    ///
    /// [`ResourceError::Shm`] if the segment cannot be created,
    /// [`ResourceError::Lock`] if the process-shared lock cannot be set up.
    pub fn create(config: SessionConfig) -> Result<Self, ResourceError> {
        let path = config.segment()?;
        if config.reclaim_stale {
            shmem::unlink(&path)?;
        }

        let pid = std::process::id() as i32;
        let mut init_error = None;
        let shm = Shm::<SessionRecord, Creator>::create(path, |slot| {
            if let Err(e) = SessionRecord::init_in_place(slot, pid) {
                init_error = Some(e);
            }
        })?;
        if let Some(e) = init_error {
            return Err(ResourceError::Lock(e));
        }

        info!(session = %config.name, segment = %shm.path(), "shared session created");
        Ok(Self {
            config,
            shm: Some(shm),
            joined: false,
        })
    }

    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub(crate) fn record(&self) -> Option<&SessionRecord> {
        self.shm.as_deref()
    }

    /// Waits for the outcome, abandoning the session if a party dies first.
    fn supervise(record: &SessionRecord, poll: Duration) -> Result<(), GateError> {
        let mut guard = record.lock().map_err(GateError::Lock)?;
        loop {
            record.recover(&mut guard);
            if guard.state.outcome().is_terminal() {
                break;
            }
            if let Some(cause) = guard.find_dead_peer(None) {
                if guard.abandon(cause) {
                    warn!(%cause, "party died, abandoning session");
                }
                break;
            }
            guard.wait_timeout(poll).map_err(GateError::Wait)?;
        }
        record.publish(&guard);
        guard.notify_all();
        Ok(())
    }

    /// Waits up to `grace` for every seated party to detach or die.
    fn await_detach(record: &SessionRecord, poll: Duration, grace: Duration) -> Result<(), GateError> {
        let start = Instant::now();
        let mut guard = record.lock().map_err(GateError::Lock)?;
        loop {
            record.recover(&mut guard);
            let roster = &guard.roster;
            let lingering = PartyId::ALL
                .into_iter()
                .take(roster.registered as usize)
                .filter(|p| !roster.detached[p.index()] && pid_alive(roster.pids[p.index()]))
                .count();
            if lingering == 0 {
                debug!("all parties detached");
                return Ok(());
            }
            if start.elapsed() >= grace {
                warn!(lingering, "parties did not detach in time");
                return Ok(());
            }
            guard.notify_all();
            guard.wait_timeout(poll).map_err(GateError::Wait)?;
        }
    }
}

impl SessionCoordinator for ShmCoordinator {
    fn await_parties(&mut self, n: usize) -> Result<(), SessionError> {
        if n != PartyId::ALL.len() {
            return Err(SessionError::PartyCount(n));
        }
        let record = self.record().ok_or(SessionError::NotReady)?;
        let deadline = self.config.await_timeout.deadline(Instant::now());
        info!(expected = n, "waiting for parties");

        let mut guard = record.lock().map_err(GateError::Lock)?;
        loop {
            record.recover(&mut guard);
            if guard.roster.all_ready() {
                break;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(SessionError::AwaitTimeout {
                    joined: guard.roster.registered as usize,
                    expected: n,
                });
            }
            guard
                .wait_timeout(self.config.poll_interval)
                .map_err(GateError::Wait)?;
        }
        // Seated parties may be waiting on the ready condition.
        guard.notify_all();
        drop(guard);

        self.joined = true;
        info!("both parties joined");
        Ok(())
    }

    fn run(&mut self) -> Result<SessionSummary, SessionError> {
        if !self.joined {
            return Err(SessionError::NotReady);
        }
        let record = self.record().ok_or(SessionError::NotReady)?;
        let poll = self.config.poll_interval;
        let grace = self.config.detach_grace;

        let start = Instant::now();
        info!("session started");
        thread::scope(|s| -> Result<(), SessionError> {
            let monitor = thread::Builder::new()
                .name("turnstile-monitor".into())
                .spawn_scoped(s, move || -> Result<(), GateError> {
                    Self::supervise(record, poll)?;
                    Self::await_detach(record, poll, grace)
                })
                .map_err(ResourceError::Spawn)?;
            match monitor.join() {
                Ok(result) => Ok(result?),
                Err(payload) => {
                    error!("monitor panicked");
                    std::panic::resume_unwind(payload)
                }
            }
        })?;
        let runtime = start.elapsed();

        let guard = record.lock().map_err(GateError::Lock)?;
        let summary = SessionSummary {
            outcome: guard.state.outcome(),
            moves: guard.state.moves(),
            runtime,
            input_time: guard.roster.input_nanos.map(Duration::from_nanos),
            abandoned_by: guard.roster.abandoned_by(),
        };
        drop(guard);
        self.joined = false;
        info!(outcome = %summary.outcome, moves = summary.moves, "session over");
        Ok(summary)
    }

    fn teardown(&mut self) {
        if let Some(shm) = self.shm.take() {
            info!(segment = %shm.path(), "shared session removed");
        }
    }
}

impl Drop for ShmCoordinator {
    fn drop(&mut self) {
        self.teardown();
    }
}
