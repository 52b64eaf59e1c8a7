//! End-to-end sessions over the mediated transport.
//!
//! Threads stand in for the three processes: the coordinator runs in one
//! scoped thread and each party in another, all talking through real FIFOs
//! and named semaphores.
//!
//! ```bash
//! RUST_LOG=turnstile=debug cargo test --test pipe_session -- --nocapture
//! ```

use std::io;
use std::sync::Once;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use serial_test::serial;

use turnstile::coordinator::{SessionCoordinator, SessionSummary};
use turnstile::error::{ConnectError, PeerClosed, ResourceError, SessionError};
use turnstile::mediated::{PipeCoordinator, PipeParty};
use turnstile::party::{
    Input, MoveSource, PartyEvent, PartyReport, RandomMoves, ScriptedMoves, Termination,
};
use turnstile::{Outcome, PartyId, Position, SessionConfig};

static INIT_TRACING: Once = Once::new();
static COUNTER: AtomicUsize = AtomicUsize::new(0);

fn init_test_tracing() {
    INIT_TRACING.call_once(|| {
        turnstile::init_tracing();
    });
}

fn test_config() -> SessionConfig {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    let mut config = SessionConfig::named(format!("ts-pipe-it-{}-{}", std::process::id(), n));
    config.poll_interval = Duration::from_millis(10);
    config.await_timeout = Duration::from_secs(5).into();
    config
}

fn coordinator(config: &SessionConfig) -> Option<PipeCoordinator> {
    match PipeCoordinator::create(config.clone()) {
        Ok(c) => Some(c),
        Err(ResourceError::Semaphore { source, .. })
            if source.raw_os_error() == Some(libc::EACCES) =>
        {
            eprintln!("Skipping: named semaphores unavailable: {source}");
            None
        }
        Err(e) => panic!("failed to create session: {e}"),
    }
}

/// Runs a full session with one source per party; returns the summary,
/// both reports and party 0's event log.
fn play_session(
    config: &SessionConfig,
    mut coordinator: PipeCoordinator,
    mut sources: [Box<dyn MoveSource + Send>; 2],
) -> (SessionSummary, [PartyReport; 2], Vec<PartyEvent>) {
    let [source0, source1] = &mut sources;
    thread::scope(|s| {
        let run = s.spawn(move || -> Result<SessionSummary, SessionError> {
            coordinator.await_parties(2)?;
            let summary = coordinator.run();
            coordinator.teardown();
            summary
        });
        let one = s.spawn(|| {
            PipeParty::connect(config, PartyId::ONE)
                .unwrap()
                .play(source1.as_mut(), |_| {})
                .unwrap()
        });
        let mut events = Vec::new();
        let zero = PipeParty::connect(config, PartyId::ZERO)
            .unwrap()
            .play(source0.as_mut(), |e| events.push(e.clone()))
            .unwrap();
        let summary = run.join().unwrap().unwrap();
        (summary, [zero, one.join().unwrap()], events)
    })
}

#[test]
#[serial]
fn random_session_reaches_a_consistent_outcome() {
    init_test_tracing();
    for seed in 0..5 {
        let config = test_config();
        let Some(coordinator) = coordinator(&config) else {
            return;
        };
        let (summary, reports, events) = play_session(
            &config,
            coordinator,
            [
                Box::new(RandomMoves::seeded(seed)),
                Box::new(RandomMoves::seeded(seed + 100)),
            ],
        );

        assert!(summary.outcome.is_terminal());
        assert!((5..=9).contains(&summary.moves), "{} moves", summary.moves);
        assert_eq!(summary.abandoned_by, None);
        for report in &reports {
            assert_eq!(report.outcome, summary.outcome);
            assert_eq!(report.cause, Termination::Concluded);
        }
        // Party 0 moves first, so it makes the odd-numbered moves.
        assert_eq!(reports[0].moves_sent + reports[1].moves_sent, summary.moves);
        assert_eq!(reports[0].moves_sent, summary.moves.div_ceil(2));

        let terminated = events
            .iter()
            .filter(|e| matches!(e, PartyEvent::Terminated { .. }))
            .count();
        assert_eq!(terminated, 1);
        assert!(matches!(events.last(), Some(PartyEvent::Terminated { .. })));

        for party in PartyId::ALL {
            assert!(!config.client_channel(party).exists());
            assert!(!config.server_channel(party).exists());
        }
    }
}

#[test]
#[serial]
fn rejected_move_keeps_the_turn() {
    init_test_tracing();
    let config = test_config();
    let Some(coordinator) = coordinator(&config) else {
        return;
    };
    let (summary, reports, events) = play_session(
        &config,
        coordinator,
        [
            Box::new(ScriptedMoves::new([
                Position::new(5, 5),
                Position::new(0, 0),
                Position::new(0, 1),
                Position::new(0, 2),
            ])),
            Box::new(ScriptedMoves::new([Position::new(1, 0), Position::new(1, 1)])),
        ],
    );

    assert_eq!(summary.outcome, Outcome::Decided(PartyId::ZERO));
    assert_eq!(summary.moves, 5);
    assert_eq!(reports[0].moves_sent, 4);
    assert_eq!(reports[1].outcome, Outcome::Decided(PartyId::ZERO));

    let rejected = events
        .iter()
        .position(|e| matches!(e, PartyEvent::InvalidMove(_)))
        .unwrap();
    // The turn is granted again right after the rejection.
    assert!(matches!(events[rejected + 1], PartyEvent::Board(_)));
    assert!(matches!(events[rejected + 2], PartyEvent::YourTurn));

    let Some(PartyEvent::Board(last)) = events.iter().rev().nth(1) else {
        panic!("no final board before termination");
    };
    assert_eq!(last.to_string(), "XXXOO....");
}

#[test]
#[serial]
fn party_leaving_ends_the_session_drawn() {
    init_test_tracing();
    let config = test_config();
    let Some(coordinator) = coordinator(&config) else {
        return;
    };
    // Party 1 has nothing to play and walks away on its first turn.
    let (summary, reports, _) = play_session(
        &config,
        coordinator,
        [
            Box::new(ScriptedMoves::new([Position::new(1, 1), Position::new(0, 0)])),
            Box::new(ScriptedMoves::new([])),
        ],
    );

    assert_eq!(summary.outcome, Outcome::Drawn);
    assert_eq!(summary.moves, 1);
    assert_eq!(summary.abandoned_by, Some(PeerClosed::Party(PartyId::ONE)));
    assert_eq!(reports[0].outcome, Outcome::Drawn);
    assert_eq!(reports[1].cause, Termination::InputClosed);
}

/// Holds the turn without ever deciding on a move.
struct Idle;

impl MoveSource for Idle {
    fn poll_move(&mut self, wait: Duration) -> io::Result<Input> {
        thread::sleep(wait);
        Ok(Input::Pending)
    }
}

#[test]
#[serial]
fn acting_party_hears_of_a_departure_within_a_poll() {
    init_test_tracing();
    let mut config = test_config();
    config.poll_interval = Duration::from_millis(100);
    let poll = config.poll_interval;
    let Some(mut coordinator) = coordinator(&config) else {
        return;
    };

    let (summary, report, ended_at, left_at) = thread::scope(|s| {
        let run = s.spawn(move || -> Result<SessionSummary, SessionError> {
            coordinator.await_parties(2)?;
            let summary = coordinator.run();
            coordinator.teardown();
            summary
        });
        let zero = s.spawn(|| {
            let mut ended_at = None;
            let report = PipeParty::connect(&config, PartyId::ZERO)
                .unwrap()
                .play(&mut Idle, |e| {
                    if matches!(e, PartyEvent::Terminated { .. }) {
                        ended_at = Some(Instant::now());
                    }
                })
                .unwrap();
            (report, ended_at.unwrap())
        });

        // Party 1 sits through party 0's turn, then leaves mid-turn.
        let one = PipeParty::connect(&config, PartyId::ONE).unwrap();
        thread::sleep(poll * 5);
        let left_at = Instant::now();
        drop(one);

        let (report, ended_at) = zero.join().unwrap();
        (run.join().unwrap().unwrap(), report, ended_at, left_at)
    });

    let latency = ended_at.duration_since(left_at);
    assert!(latency < poll * 2, "notice took {latency:?}");
    assert_eq!(summary.outcome, Outcome::Drawn);
    assert_eq!(summary.moves, 0);
    assert_eq!(summary.abandoned_by, Some(PeerClosed::Party(PartyId::ONE)));
    assert_eq!(report.outcome, Outcome::Drawn);
    assert_eq!(report.moves_sent, 0);
}

#[test]
#[serial]
fn coordinator_vanishing_ends_the_party() {
    init_test_tracing();
    let mut config = test_config();
    config.await_timeout = Duration::from_millis(50).into();
    let Some(mut coordinator) = coordinator(&config) else {
        return;
    };

    thread::scope(|s| {
        let party = s.spawn(|| {
            let party = PipeParty::connect(&config, PartyId::ONE).unwrap();
            party
                .play(&mut ScriptedMoves::new([Position::new(0, 0)]), |_| {})
                .unwrap()
        });
        // Seat party 1 only, then go away without running the session.
        while coordinator.joined() == 0 {
            assert!(coordinator.await_parties(2).is_err());
        }
        drop(coordinator);

        let report = party.join().unwrap();
        assert_eq!(report.outcome, Outcome::Drawn);
        assert_eq!(report.cause, Termination::PeerClosed(PeerClosed::Coordinator));
        assert_eq!(report.moves_sent, 0);
    });
}

#[test]
fn connect_without_session_fails() {
    let config = test_config();
    assert!(matches!(
        PipeParty::connect(&config, PartyId::ZERO),
        Err(ConnectError::Absent(_))
    ));
}
