//! Coordinator of the mediated transport.
//!
//! ```text
//!              client<i> FIFO                     server<i> FIFO
//!  party i ─────────────────────> handler i ─────────────────────> party i
//!                                    │  ▲
//!                          acquire   │  │ release_and_advance(next)
//!                                    ▼  │
//!                          SemaphoreGate (one token per party)
//! ```
//!
//! One named thread per party serves that party's turns; the calling thread
//! watches for hang-ups and waits for termination. All moves go through one
//! [`SessionState`] behind a mutex, and the gate is only advanced after that
//! mutex has been released.

use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use minstant::Instant;

use super::protocol::{CoordinatorMessage, MoveMessage};
use crate::config::SessionConfig;
use crate::coordinator::{SessionCoordinator, SessionSummary};
use crate::error::{GateError, PeerClosed, ResourceError, SessionError};
use crate::game::{PartyId, Rules, TicTacToe};
use crate::gate::{GateEvent, SemaphoreGate, TurnGate};
use crate::ipc::Creator;
use crate::ipc::fifo::{self, Fifo, FifoReader, FifoWriter, HangupProbe, ReadStatus};
use crate::session::{MoveResult, SessionState};
use crate::trace::{debug, error, info, warn};

fn channel_error(path: &Path, source: io::Error) -> ResourceError {
    ResourceError::Channel {
        path: path.to_path_buf(),
        source,
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The two FIFO nodes of one party.
#[derive(Debug)]
struct Channels {
    /// Party → coordinator.
    client: Fifo<Creator>,
    /// Coordinator → party.
    server: Fifo<Creator>,
}

/// Session coordinator over FIFOs and named semaphores.
pub struct PipeCoordinator {
    config: SessionConfig,
    rules: Box<dyn Rules>,
    channels: Vec<Channels>,
    readers: [Option<FifoReader>; 2],
    writers: [Option<FifoWriter>; 2],
    gate: Option<SemaphoreGate>,
    joined: usize,
    made_dir: bool,
}

impl PipeCoordinator {
    /// Creates every FIFO and semaphore of the session.
    ///
    /// With `reclaim_stale` set, leftovers of a crashed session under the same
    /// names are removed first.
    ///
    /// # Errors
    ///
    /// [`ResourceError`] if any object cannot be created or opened.
    pub fn create(config: SessionConfig) -> Result<Self, ResourceError> {
        let made_dir = !config.channel_dir.exists();
        std::fs::create_dir_all(&config.channel_dir)
            .map_err(|e| channel_error(&config.channel_dir, e))?;

        let mut channels = Vec::with_capacity(PartyId::ALL.len());
        let mut readers = [None, None];
        for party in PartyId::ALL {
            let client = make_fifo(&config, &config.client_channel(party))?;
            let server = make_fifo(&config, &config.server_channel(party))?;
            let reader = client
                .open_reader()
                .map_err(|e| channel_error(client.path(), e))?;
            readers[party.index()] = Some(reader);
            channels.push(Channels { client, server });
        }
        let gate = SemaphoreGate::create(&config)?;

        info!(
            session = %config.name,
            channels = %config.channel_dir.display(),
            "mediated session created"
        );
        Ok(Self {
            config,
            rules: Box::new(TicTacToe),
            channels,
            readers,
            writers: [None, None],
            gate: Some(gate),
            joined: 0,
            made_dir,
        })
    }

    /// Replaces the rules engine. Must be called before [`run`](SessionCoordinator::run).
    #[must_use]
    pub fn with_rules(mut self, rules: impl Rules + 'static) -> Self {
        self.rules = Box::new(rules);
        self
    }

    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Parties that have been welcomed so far.
    #[must_use]
    pub fn joined(&self) -> usize {
        self.joined
    }

    /// Tries to open the write end of every unseated party's channel and
    /// welcomes whoever is listening.
    fn seat_listeners(&mut self) -> Result<(), ResourceError> {
        for party in PartyId::ALL {
            if self.writers[party.index()].is_some() {
                continue;
            }
            let server = &self.channels[party.index()].server;
            let mut writer = match server.open_writer() {
                Ok(w) => w,
                Err(e) if e.raw_os_error() == Some(libc::ENXIO) => continue,
                Err(e) => return Err(channel_error(server.path(), e)),
            };
            if let Err(e) = writer.send(&CoordinatorMessage::Welcome(party)) {
                warn!(%party, error = %e, "party left before welcome");
                continue;
            }
            self.writers[party.index()] = Some(writer);
            self.joined += 1;
            info!(%party, joined = self.joined, "party joined");
        }
        Ok(())
    }
}

fn make_fifo(config: &SessionConfig, path: &Path) -> Result<Fifo<Creator>, ResourceError> {
    if config.reclaim_stale {
        fifo::remove_stale(path).map_err(|e| channel_error(path, e))?;
    }
    Fifo::<Creator>::create(path).map_err(|e| channel_error(path, e))
}

impl SessionCoordinator for PipeCoordinator {
    fn await_parties(&mut self, n: usize) -> Result<(), SessionError> {
        if n != PartyId::ALL.len() {
            return Err(SessionError::PartyCount(n));
        }
        let deadline = self.config.await_timeout.deadline(Instant::now());
        info!(expected = n, "waiting for parties");
        loop {
            self.seat_listeners()?;
            if self.joined == n {
                return Ok(());
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(SessionError::AwaitTimeout {
                    joined: self.joined,
                    expected: n,
                });
            }
            thread::sleep(self.config.poll_interval);
        }
    }

    fn run(&mut self) -> Result<SessionSummary, SessionError> {
        if self.joined < PartyId::ALL.len() {
            return Err(SessionError::NotReady);
        }
        let mut readers = Vec::with_capacity(PartyId::ALL.len());
        for slot in &mut self.readers {
            readers.push(slot.take().ok_or(SessionError::NotReady)?);
        }
        let probes = readers
            .iter()
            .map(FifoReader::hangup_probe)
            .collect::<io::Result<Vec<_>>>()
            .map_err(|e| channel_error(&self.config.channel_dir, e))?;
        let writers = [self.writers[0].take(), self.writers[1].take()];
        let gate = self.gate.as_ref().ok_or(SessionError::NotReady)?;

        let hub = Hub {
            state: Mutex::new(SessionState::new()),
            rules: self.rules.as_ref(),
            gate,
            writers: writers.map(Mutex::new),
            input_nanos: [AtomicU64::new(0), AtomicU64::new(0)],
            cause: Mutex::new(None),
            finished: AtomicBool::new(false),
            poll: self.config.poll_interval,
        };

        let start = Instant::now();
        info!("session started");
        thread::scope(|s| -> Result<(), SessionError> {
            let hub = &hub;
            let mut handlers = Vec::with_capacity(readers.len());
            for (party, reader) in PartyId::ALL.into_iter().zip(readers) {
                let spawned = thread::Builder::new()
                    .name(format!("turnstile-party-{party}"))
                    .spawn_scoped(s, move || serve(hub, party, reader));
                match spawned {
                    Ok(handle) => handlers.push(handle),
                    Err(e) => {
                        hub.halt(None);
                        return Err(ResourceError::Spawn(e).into());
                    }
                }
            }
            if let Err(e) = hub.gate.release_and_advance(PartyId::ZERO) {
                hub.halt(None);
                return Err(e.into());
            }
            hub.monitor(&probes);
            for handle in handlers {
                if handle.join().is_err() {
                    error!("party handler panicked");
                }
            }
            Ok(())
        })?;
        let runtime = start.elapsed();

        // Normally every party was told at the moment the outcome was set.
        hub.announce();
        let (outcome, moves) = {
            let state = lock(&hub.state);
            (state.outcome(), state.moves())
        };

        let summary = SessionSummary {
            outcome,
            moves,
            runtime,
            input_time: hub
                .input_nanos
                .each_ref()
                .map(|n| Duration::from_nanos(n.load(Ordering::Relaxed))),
            abandoned_by: *lock(&hub.cause),
        };
        info!(%outcome, moves, "session over");
        Ok(summary)
    }

    fn teardown(&mut self) {
        self.readers = [None, None];
        self.writers = [None, None];
        let had_objects = !self.channels.is_empty() || self.gate.is_some();
        self.channels.clear();
        self.gate = None;
        if self.made_dir {
            if let Err(e) = std::fs::remove_dir(&self.config.channel_dir) {
                debug!(error = %e, "channel directory left in place");
            }
            self.made_dir = false;
        }
        if had_objects {
            info!(session = %self.config.name, "mediated session removed");
        }
    }
}

impl Drop for PipeCoordinator {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// State shared by the handler threads and the monitor during `run`.
struct Hub<'a> {
    state: Mutex<SessionState>,
    rules: &'a dyn Rules,
    gate: &'a SemaphoreGate,
    writers: [Mutex<Option<FifoWriter>>; 2],
    input_nanos: [AtomicU64; 2],
    cause: Mutex<Option<PeerClosed>>,
    finished: AtomicBool,
    poll: Duration,
}

/// What a handler got back while waiting for a move.
enum Received {
    Line(String),
    Garbled,
    Gone,
}

impl Hub<'_> {
    fn send(&self, party: PartyId, msg: CoordinatorMessage) -> io::Result<()> {
        match lock(&self.writers[party.index()]).as_mut() {
            Some(writer) => writer.send(&msg),
            None => Err(io::ErrorKind::BrokenPipe.into()),
        }
    }

    /// Wakes every gate waiter and notifies every party once the outcome is
    /// set.
    fn finish(&self) {
        self.finished.store(true, Ordering::Release);
        self.gate.close();
        self.announce();
    }

    /// Sends the final board and `Game Over` to every party not yet told,
    /// then closes its channel. Each writer is taken out exactly once.
    fn announce(&self) {
        let (board, outcome) = {
            let state = lock(&self.state);
            (state.board(), state.outcome())
        };
        if !outcome.is_terminal() {
            return;
        }
        for party in PartyId::ALL {
            let Some(mut writer) = lock(&self.writers[party.index()]).take() else {
                continue;
            };
            let notice = writer
                .send(&CoordinatorMessage::Board(board))
                .and_then(|()| writer.send(&CoordinatorMessage::GameOver(outcome)));
            match notice {
                Ok(()) => debug!(%party, %outcome, "termination notice sent"),
                Err(e) => warn!(%party, error = %e, "termination notice not delivered"),
            }
        }
    }

    /// Ends the session as drawn if it is still open, then finishes.
    fn halt(&self, cause: Option<PeerClosed>) {
        {
            let mut state = lock(&self.state);
            if state.abandon() {
                match cause {
                    Some(cause) => warn!(%cause, "abandoning session"),
                    None => warn!("session halted"),
                }
                *lock(&self.cause) = cause;
            }
        }
        self.finish();
    }

    /// Blocks until the session finishes. A hung-up channel wakes it at once;
    /// the finished flag is checked at least once per poll interval.
    fn monitor(&self, probes: &[HangupProbe]) {
        while !self.finished.load(Ordering::Acquire) {
            match HangupProbe::first_hung_up(probes, self.poll) {
                Ok(Some(i)) => self.halt(Some(PeerClosed::Party(PartyId::ALL[i]))),
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, "hang-up wait failed");
                    thread::sleep(self.poll);
                }
            }
        }
    }

    fn await_move(&self, party: PartyId, reader: &mut FifoReader) -> Received {
        loop {
            if self.gate.is_closed() {
                return Received::Gone;
            }
            match reader.read_message(self.poll) {
                Ok(ReadStatus::Message(line)) => return Received::Line(line),
                Ok(ReadStatus::Pending) => {}
                Ok(ReadStatus::Closed) => {
                    self.halt(Some(PeerClosed::Party(party)));
                    return Received::Gone;
                }
                Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                    warn!(%party, error = %e, "oversized message");
                    return Received::Garbled;
                }
                Err(e) => {
                    warn!(%party, error = %e, "channel read failed");
                    self.halt(Some(PeerClosed::Party(party)));
                    return Received::Gone;
                }
            }
        }
    }

    /// Tells `party` its move was rejected and hands the turn straight back.
    fn reject(&self, party: PartyId) -> Result<(), GateError> {
        if let Err(e) = self.send(party, CoordinatorMessage::InvalidMove) {
            debug!(%party, error = %e, "rejection not delivered");
            self.halt(Some(PeerClosed::Party(party)));
            return Ok(());
        }
        self.gate.release_and_advance(party)
    }

    fn serve_turns(&self, party: PartyId, reader: &mut FifoReader) -> Result<(), GateError> {
        loop {
            if self.gate.acquire(party)? == GateEvent::Terminated {
                return Ok(());
            }
            let board = lock(&self.state).board();
            let granted = self
                .send(party, CoordinatorMessage::Board(board))
                .and_then(|()| self.send(party, CoordinatorMessage::YourTurn));
            if let Err(e) = granted {
                debug!(%party, error = %e, "turn grant not delivered");
                self.halt(Some(PeerClosed::Party(party)));
                return Ok(());
            }

            let line = match self.await_move(party, reader) {
                Received::Line(line) => line,
                Received::Garbled => {
                    self.reject(party)?;
                    continue;
                }
                Received::Gone => return Ok(()),
            };
            let mv = match line.parse::<MoveMessage>() {
                Ok(mv) => mv,
                Err(e) => {
                    warn!(%party, error = %e, "unreadable move");
                    self.reject(party)?;
                    continue;
                }
            };
            let nanos = u64::try_from(mv.elapsed.as_nanos()).unwrap_or(u64::MAX);
            let _ = self.input_nanos[party.index()].fetch_update(
                Ordering::Relaxed,
                Ordering::Relaxed,
                |total| Some(total.saturating_add(nanos)),
            );

            let result = lock(&self.state).submit_move(party, mv.position, self.rules);
            match result {
                Ok(MoveResult {
                    next: Some(next), ..
                }) => {
                    debug!(%party, pos = %mv.position, "move accepted");
                    self.gate.release_and_advance(next)?;
                }
                Ok(MoveResult { outcome, next: None }) => {
                    info!(%party, pos = %mv.position, %outcome, "final move");
                    self.finish();
                }
                Err(e) => {
                    info!(%party, reason = %e, "move rejected");
                    self.reject(party)?;
                }
            }
        }
    }
}

/// Halts the session if its handler leaves by any path, panics included.
struct HaltOnExit<'h, 'a>(&'h Hub<'a>);

impl Drop for HaltOnExit<'_, '_> {
    fn drop(&mut self) {
        self.0.halt(None);
    }
}

fn serve(hub: &Hub<'_>, party: PartyId, mut reader: FifoReader) {
    let _halt = HaltOnExit(hub);
    if let Err(e) = hub.serve_turns(party, &mut reader) {
        error!(%party, error = %e, "turn gate failed");
    }
    debug!(%party, "handler done");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::{Board, Outcome, Position};
    use crate::ipc::Opener;
    use serial_test::serial;
    use std::sync::atomic::AtomicUsize;

    static COUNTER: AtomicUsize = AtomicUsize::new(0);

    fn test_config() -> SessionConfig {
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        let mut config = SessionConfig::named(format!("ts-med-{}-{}", std::process::id(), n));
        config.poll_interval = Duration::from_millis(10);
        config.await_timeout = Duration::from_millis(100).into();
        config
    }

    fn create(config: SessionConfig) -> Option<PipeCoordinator> {
        match PipeCoordinator::create(config) {
            Ok(c) => Some(c),
            Err(ResourceError::Semaphore { source, .. })
                if source.raw_os_error() == Some(libc::EACCES) =>
            {
                eprintln!("Skipping: named semaphores unavailable: {source}");
                None
            }
            Err(e) => panic!("{e}"),
        }
    }

    #[test]
    #[serial]
    fn test_create_and_teardown_remove_objects() {
        let config = test_config();
        let Some(mut coordinator) = create(config.clone()) else {
            return;
        };
        for party in PartyId::ALL {
            assert!(config.client_channel(party).exists());
            assert!(config.server_channel(party).exists());
        }
        coordinator.teardown();
        coordinator.teardown();
        for party in PartyId::ALL {
            assert!(!config.client_channel(party).exists());
            assert!(!config.server_channel(party).exists());
        }
        assert!(!config.channel_dir.exists());
    }

    #[test]
    #[serial]
    fn test_create_reclaims_stale_channels() {
        let config = test_config();
        std::fs::create_dir_all(&config.channel_dir).unwrap();
        std::fs::write(config.client_channel(PartyId::ZERO), b"stale").unwrap();
        let Some(coordinator) = create(config.clone()) else {
            return;
        };
        assert!(Fifo::<Opener>::attach(config.client_channel(PartyId::ZERO)).is_ok());
        drop(coordinator);
        std::fs::remove_dir(&config.channel_dir).ok();
    }

    #[test]
    #[serial]
    fn test_await_times_out_and_run_refuses() {
        let Some(mut coordinator) = create(test_config()) else {
            return;
        };
        assert!(matches!(
            coordinator.await_parties(3),
            Err(SessionError::PartyCount(3))
        ));
        assert!(matches!(
            coordinator.await_parties(2),
            Err(SessionError::AwaitTimeout {
                joined: 0,
                expected: 2
            })
        ));
        assert!(matches!(coordinator.run(), Err(SessionError::NotReady)));
    }

    /// Drives the wire protocol by hand and sends a garbled move first.
    #[test]
    #[serial]
    fn test_garbled_move_keeps_the_turn() {
        let config = test_config();
        let Some(mut coordinator) = create(config.clone()) else {
            return;
        };

        let mut readers = Vec::new();
        let mut writers = Vec::new();
        for party in PartyId::ALL {
            let server = Fifo::<Opener>::attach(config.server_channel(party)).unwrap();
            readers.push(server.open_reader().unwrap());
            let client = Fifo::<Opener>::attach(config.client_channel(party)).unwrap();
            writers.push(client.open_writer().unwrap());
        }
        coordinator.await_parties(2).unwrap();

        let wait = Duration::from_secs(2);
        let expect = |reader: &mut FifoReader, want: &str| {
            let got = loop {
                match reader.read_message(wait).unwrap() {
                    ReadStatus::Message(m) => break m,
                    ReadStatus::Pending => {}
                    ReadStatus::Closed => panic!("closed while waiting for {want}"),
                }
            };
            assert_eq!(got, want);
        };

        thread::scope(|s| {
            let run = s.spawn(|| coordinator.run());
            let (r0, r1) = readers.split_at_mut(1);
            let (r0, r1) = (&mut r0[0], &mut r1[0]);
            expect(r0, "Welcome|0");
            expect(r1, "Welcome|1");

            expect(r0, "Board|.........");
            expect(r0, "Your Turn");
            writers[0].send(&"not a move").unwrap();
            expect(r0, "Invalid Move");
            expect(r0, "Board|.........");
            expect(r0, "Your Turn");

            // An overlong line costs exactly one rejection; the moves after it
            // only line up if its tail was skipped.
            writers[0].send(&"7".repeat(600)).unwrap();
            expect(r0, "Invalid Move");
            expect(r0, "Board|.........");
            expect(r0, "Your Turn");

            // Top row for party 0, party 1 plays the middle row.
            let script = [(0, 0), (1, 0), (0, 1), (1, 1), (0, 2)];
            let mut board = Board::new();
            for (i, (r, c)) in script.into_iter().enumerate() {
                let party = PartyId::ALL[i % 2];
                let reader = if party == PartyId::ZERO { &mut *r0 } else { &mut *r1 };
                if i > 0 {
                    expect(reader, &format!("Board|{board}"));
                    expect(reader, "Your Turn");
                }
                let mv = MoveMessage {
                    position: Position::new(r, c),
                    elapsed: Duration::from_millis(100),
                };
                writers[party.index()].send(&mv).unwrap();
                let cell = mv.position.cell().unwrap();
                board.set(cell, party.mark());
            }

            let summary = run.join().unwrap().unwrap();
            assert_eq!(summary.outcome, Outcome::Decided(PartyId::ZERO));
            assert_eq!(summary.moves, 5);
            assert_eq!(summary.abandoned_by, None);
            assert_eq!(summary.input_time[0], Duration::from_millis(300));
            assert_eq!(summary.input_time[1], Duration::from_millis(200));

            for reader in [&mut *r0, &mut *r1] {
                expect(reader, &format!("Board|{board}"));
                expect(reader, "Game Over|Winner:0");
            }
        });
    }
}
