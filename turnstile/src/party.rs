//! Party endpoint plumbing shared by both transports.
//!
//! A party walks through the phases below and reports each step to an
//! observer callback; where its moves come from is a [`MoveSource`].
//!
//! ```text
//!  connect() ──> WaitingForTurn <──> Acting
//!                       │               │
//!                       └─> play() returns <┘
//! ```
//!
//! Connecting and Terminated are carried by the endpoint types themselves:
//! `connect` is the only way to get one, and `play` consumes it.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, Read};
use std::os::fd::AsFd;
use std::time::Duration;

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::IteratorRandom;
use rustix::event::{PollFd, PollFlags, poll};

use crate::error::PeerClosed;
use crate::game::{Board, Outcome, PartyId, Position};
use crate::ipc::fifo::{LineFramer, MAX_MESSAGE_LEN, timespec};

/// Where a connected party is within `play`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PartyPhase {
    WaitingForTurn,
    Acting,
}

/// Why a party stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The session reached its outcome normally.
    Concluded,
    /// Someone vanished and the session was abandoned.
    PeerClosed(PeerClosed),
    /// This party's move source ran dry, so it left.
    InputClosed,
}

/// Progress notifications handed to the observer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartyEvent {
    Connected(PartyId),
    Board(Board),
    YourTurn,
    /// The last move was rejected; the turn stays with this party.
    InvalidMove(String),
    /// Delivered exactly once, last.
    Terminated {
        outcome: Outcome,
        cause: Termination,
    },
}

/// What a party did in its session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartyReport {
    pub party: PartyId,
    pub outcome: Outcome,
    pub cause: Termination,
    /// Moves this party submitted, accepted or not.
    pub moves_sent: u32,
    pub input_time: Duration,
}

/// Result of polling a move source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Move(Position),
    /// Nothing yet.
    Pending,
    /// A line that does not read as a move.
    Malformed(String),
    /// The source is exhausted.
    Closed,
}

/// Supplies moves while a party holds the turn.
pub trait MoveSource {
    /// Returns the next move, waiting at most `wait`.
    ///
    /// # Errors
    ///
    /// I/O failures of the underlying source.
    fn poll_move(&mut self, wait: Duration) -> io::Result<Input>;

    /// Called with every board the party learns about.
    fn observe(&mut self, _board: &Board) {}
}

/// Parses `"<row> <col>"`, whitespace separated, nothing else on the line.
#[must_use]
pub fn parse_move(line: &str) -> Option<Position> {
    let mut it = line.split_whitespace();
    let row = it.next()?.parse().ok()?;
    let col = it.next()?.parse().ok()?;
    if it.next().is_some() {
        return None;
    }
    Some(Position::new(row, col))
}

fn classify(line: &str) -> Input {
    let line = line.trim();
    if line.is_empty() {
        return Input::Pending;
    }
    parse_move(line).map_or_else(|| Input::Malformed(line.to_owned()), Input::Move)
}

/// Moves typed on standard input, one `row col` pair per line.
///
/// Reads at most once per call and only after `poll` reported data, so a
/// half-typed line never blocks the caller.
#[derive(Debug)]
pub struct StdinMoves {
    file: File,
    framer: LineFramer,
    eof: bool,
}

impl StdinMoves {
    /// # Errors
    ///
    /// Failure to duplicate descriptor 0.
    pub fn new() -> io::Result<Self> {
        let fd = rustix::io::dup(io::stdin().as_fd())?;
        Ok(Self::from_file(File::from(fd)))
    }

    pub(crate) fn from_file(file: File) -> Self {
        Self {
            file,
            framer: LineFramer::default(),
            eof: false,
        }
    }
}

impl MoveSource for StdinMoves {
    fn poll_move(&mut self, wait: Duration) -> io::Result<Input> {
        if let Some(line) = self.framer.next_line() {
            return Ok(classify(&line));
        }
        if self.eof {
            return Ok(self.framer.finish().map_or(Input::Closed, |l| classify(&l)));
        }

        let mut fds = [PollFd::new(&self.file, PollFlags::IN)];
        match poll(&mut fds, Some(&timespec(wait))) {
            Ok(0) | Err(rustix::io::Errno::INTR) => return Ok(Input::Pending),
            Ok(_) => {}
            Err(e) => return Err(e.into()),
        }

        let mut chunk = [0u8; MAX_MESSAGE_LEN];
        let n = match self.file.read(&mut chunk) {
            Ok(n) => n,
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                return Ok(Input::Pending);
            }
            Err(e) => return Err(e),
        };
        if n == 0 {
            self.eof = true;
            return Ok(self.framer.finish().map_or(Input::Closed, |l| classify(&l)));
        }
        if self.framer.push(&chunk[..n]) {
            return Ok(Input::Malformed(format!(
                "line longer than {MAX_MESSAGE_LEN} bytes"
            )));
        }
        Ok(self.framer.next_line().map_or(Input::Pending, |l| classify(&l)))
    }
}

/// A fixed list of moves, then [`Input::Closed`].
#[derive(Debug, Clone, Default)]
pub struct ScriptedMoves {
    moves: VecDeque<Position>,
}

impl ScriptedMoves {
    #[must_use]
    pub fn new(moves: impl IntoIterator<Item = Position>) -> Self {
        Self {
            moves: moves.into_iter().collect(),
        }
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        self.moves.len()
    }
}

impl MoveSource for ScriptedMoves {
    fn poll_move(&mut self, _wait: Duration) -> io::Result<Input> {
        Ok(self.moves.pop_front().map_or(Input::Closed, Input::Move))
    }
}

/// Picks a uniformly random empty cell of the last observed board.
#[derive(Debug, Clone)]
pub struct RandomMoves {
    rng: StdRng,
    board: Board,
}

impl RandomMoves {
    #[must_use]
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            board: Board::new(),
        }
    }
}

impl MoveSource for RandomMoves {
    fn poll_move(&mut self, _wait: Duration) -> io::Result<Input> {
        Ok(self
            .board
            .empty_cells()
            .choose(&mut self.rng)
            .map_or(Input::Closed, Input::Move))
    }

    fn observe(&mut self, board: &Board) {
        self.board = *board;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_move() {
        assert_eq!(parse_move("1 2"), Some(Position::new(1, 2)));
        assert_eq!(parse_move("  0\t0 "), Some(Position::new(0, 0)));
        assert_eq!(parse_move("5 5"), Some(Position::new(5, 5)));
        assert_eq!(parse_move("-1 0"), Some(Position::new(-1, 0)));
        assert_eq!(parse_move("1"), None);
        assert_eq!(parse_move("a b"), None);
        assert_eq!(parse_move("1 2 3"), None);
    }

    #[test]
    fn test_stdin_moves_do_not_block_on_a_partial_line() {
        let (typist, input) = std::os::unix::net::UnixStream::pair().unwrap();
        let mut typist = typist;
        let mut src = StdinMoves::from_file(File::from(std::os::fd::OwnedFd::from(input)));
        let wait = Duration::from_millis(20);

        assert_eq!(src.poll_move(wait).unwrap(), Input::Pending);
        io::Write::write_all(&mut typist, b"1 ").unwrap();
        let start = std::time::Instant::now();
        assert_eq!(src.poll_move(wait).unwrap(), Input::Pending);
        assert!(start.elapsed() < Duration::from_secs(1));

        io::Write::write_all(&mut typist, b"2\nnope\n\n0 0").unwrap();
        assert_eq!(src.poll_move(wait).unwrap(), Input::Move(Position::new(1, 2)));
        assert_eq!(src.poll_move(wait).unwrap(), Input::Malformed("nope".into()));
        assert_eq!(src.poll_move(wait).unwrap(), Input::Pending);

        // A last line without a newline still counts once input ends.
        drop(typist);
        let mut rest = Vec::new();
        for _ in 0..3 {
            rest.push(src.poll_move(wait).unwrap());
        }
        assert_eq!(rest[0], Input::Move(Position::new(0, 0)));
        assert_eq!(rest[1], Input::Closed);
        assert_eq!(rest[2], Input::Closed);
    }

    #[test]
    fn test_stdin_moves_skip_an_overlong_line() {
        let (mut typist, input) = std::os::unix::net::UnixStream::pair().unwrap();
        let mut src = StdinMoves::from_file(File::from(std::os::fd::OwnedFd::from(input)));
        let wait = Duration::from_millis(20);

        io::Write::write_all(&mut typist, "9".repeat(600).as_bytes()).unwrap();
        io::Write::write_all(&mut typist, b"\n2 2\n").unwrap();
        let mut seen = Vec::new();
        while seen.last() != Some(&Input::Move(Position::new(2, 2))) {
            match src.poll_move(wait).unwrap() {
                Input::Pending => {}
                other => seen.push(other),
            }
        }
        assert_eq!(seen.len(), 2);
        assert!(matches!(seen[0], Input::Malformed(_)));
    }

    #[test]
    fn test_scripted_moves_run_dry() {
        let mut src = ScriptedMoves::new([Position::new(0, 0), Position::new(1, 1)]);
        assert_eq!(src.poll_move(Duration::ZERO).unwrap(), Input::Move(Position::new(0, 0)));
        assert_eq!(src.remaining(), 1);
        assert_eq!(src.poll_move(Duration::ZERO).unwrap(), Input::Move(Position::new(1, 1)));
        assert_eq!(src.poll_move(Duration::ZERO).unwrap(), Input::Closed);
    }

    #[test]
    fn test_random_moves_pick_empty_cells() {
        let mut src = RandomMoves::seeded(7);
        let board: Board = "XOXOX.OXO".parse().unwrap();
        src.observe(&board);
        for _ in 0..10 {
            assert_eq!(src.poll_move(Duration::ZERO).unwrap(), Input::Move(Position::new(1, 2)));
        }
        src.observe(&"XOXOXXOXO".parse().unwrap());
        assert_eq!(src.poll_move(Duration::ZERO).unwrap(), Input::Closed);
    }

    #[test]
    fn test_random_moves_are_reproducible() {
        let draw = |seed| {
            let mut src = RandomMoves::seeded(seed);
            src.observe(&Board::new());
            (0..5)
                .map(|_| src.poll_move(Duration::ZERO).unwrap())
                .collect::<Vec<_>>()
        };
        assert_eq!(draw(42), draw(42));
    }
}
