//! Tic-tac-toe board and rules.
//!
//! The session layer only depends on the [`Rules`] trait; [`TicTacToe`] is the
//! one implementation shipped here.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::ipc::shmem::SharedMemorySafe;

/// Side length of the board.
pub const BOARD_SIZE: usize = 3;

/// Number of cells on the board.
pub const CELLS: usize = BOARD_SIZE * BOARD_SIZE;

/// Zero-based identity of a party, assigned in registration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartyId(u8);

impl PartyId {
    pub const ZERO: PartyId = PartyId(0);
    pub const ONE: PartyId = PartyId(1);

    /// Both parties in seat order.
    pub const ALL: [PartyId; 2] = [PartyId::ZERO, PartyId::ONE];

    /// Builds an id from a seat index; `None` unless `index` is 0 or 1.
    #[must_use]
    pub const fn new(index: usize) -> Option<Self> {
        match index {
            0 => Some(PartyId::ZERO),
            1 => Some(PartyId::ONE),
            _ => None,
        }
    }

    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// The opponent.
    #[must_use]
    pub const fn other(self) -> Self {
        PartyId(1 - self.0)
    }

    /// The mark this party places. Party 0 plays `X`.
    #[must_use]
    pub const fn mark(self) -> Mark {
        match self.0 {
            0 => Mark::X,
            _ => Mark::O,
        }
    }
}

impl fmt::Display for PartyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PartyId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<usize>()
            .ok()
            .and_then(PartyId::new)
            .ok_or_else(|| format!("party id must be 0 or 1, got `{s}`"))
    }
}

/// Content of a single cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Mark {
    Empty = 0,
    X = 1,
    O = 2,
}

impl Mark {
    const fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Mark::X,
            2 => Mark::O,
            _ => Mark::Empty,
        }
    }

    /// Owner of the mark, if any.
    #[must_use]
    pub const fn party(self) -> Option<PartyId> {
        match self {
            Mark::Empty => None,
            Mark::X => Some(PartyId::ZERO),
            Mark::O => Some(PartyId::ONE),
        }
    }

    const fn symbol(self) -> char {
        match self {
            Mark::Empty => '.',
            Mark::X => 'X',
            Mark::O => 'O',
        }
    }
}

/// Board coordinates as submitted by a party. May be out of bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Position {
    pub row: i32,
    pub col: i32,
}

impl Position {
    #[must_use]
    pub const fn new(row: i32, col: i32) -> Self {
        Self { row, col }
    }

    /// Row-major cell index, or `None` when off the board.
    #[must_use]
    pub fn cell(self) -> Option<usize> {
        let size = BOARD_SIZE as i32;
        if (0..size).contains(&self.row) && (0..size).contains(&self.col) {
            Some((self.row * size + self.col) as usize)
        } else {
            None
        }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.row, self.col)
    }
}

/// The 3x3 grid, stored row-major as raw [`Mark`] bytes so it can live in
/// shared memory.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct Board([u8; CELLS]);

// SAFETY: a plain byte array.
unsafe impl SharedMemorySafe for Board {}

impl Board {
    #[must_use]
    pub const fn new() -> Self {
        Self([Mark::Empty as u8; CELLS])
    }

    /// Mark at a row-major cell index.
    #[must_use]
    pub fn get(&self, cell: usize) -> Mark {
        self.0.get(cell).copied().map_or(Mark::Empty, Mark::from_raw)
    }

    /// Mark at `(row, col)`, `None` when off the board.
    #[must_use]
    pub fn at(&self, pos: Position) -> Option<Mark> {
        pos.cell().map(|cell| self.get(cell))
    }

    pub(crate) fn set(&mut self, cell: usize, mark: Mark) {
        self.0[cell] = mark as u8;
    }

    /// `true` when no cell is empty.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.0.iter().all(|&c| c != Mark::Empty as u8)
    }

    /// Number of non-empty cells.
    #[must_use]
    pub fn filled(&self) -> usize {
        self.0.iter().filter(|&&c| c != Mark::Empty as u8).count()
    }

    /// Positions of every empty cell in row-major order.
    pub fn empty_cells(&self) -> impl Iterator<Item = Position> + '_ {
        (0..CELLS)
            .filter(|&cell| self.get(cell) == Mark::Empty)
            .map(|cell| Position::new((cell / BOARD_SIZE) as i32, (cell % BOARD_SIZE) as i32))
    }

    /// Multi-line rendering for terminals.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(64);
        for row in 0..BOARD_SIZE {
            for col in 0..BOARD_SIZE {
                if col > 0 {
                    out.push_str(" | ");
                }
                let mark = self.get(row * BOARD_SIZE + col);
                out.push(if mark == Mark::Empty { ' ' } else { mark.symbol() });
            }
            out.push('\n');
            if row + 1 < BOARD_SIZE {
                out.push_str("---------\n");
            }
        }
        out
    }
}

/// Compact form: nine `X`/`O`/`.` characters, row-major.
impl fmt::Display for Board {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for cell in 0..CELLS {
            write!(f, "{}", self.get(cell).symbol())?;
        }
        Ok(())
    }
}

impl fmt::Debug for Board {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Board({self})")
    }
}

impl FromStr for Board {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.chars().count() != CELLS {
            return Err(format!("board must have {CELLS} cells, got `{s}`"));
        }
        let mut board = Board::new();
        for (cell, ch) in s.chars().enumerate() {
            let mark = match ch {
                'X' => Mark::X,
                'O' => Mark::O,
                '.' => Mark::Empty,
                other => return Err(format!("unknown cell `{other}`")),
            };
            board.set(cell, mark);
        }
        Ok(board)
    }
}

/// Terminal status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Outcome {
    InProgress,
    Decided(PartyId),
    Drawn,
}

impl Outcome {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Outcome::InProgress)
    }

    /// Winner, if the session was decided.
    #[must_use]
    pub const fn winner(self) -> Option<PartyId> {
        match self {
            Outcome::Decided(p) => Some(p),
            _ => None,
        }
    }

    /// Single-byte encoding for shared memory.
    pub(crate) const fn to_raw(self) -> u8 {
        match self {
            Outcome::InProgress => 0,
            Outcome::Decided(p) => 1 + p.0,
            Outcome::Drawn => 3,
        }
    }

    /// Unknown bytes decode as [`Outcome::Drawn`] so a corrupted record ends
    /// the session instead of leaving it open.
    pub(crate) const fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Outcome::InProgress,
            1 => Outcome::Decided(PartyId::ZERO),
            2 => Outcome::Decided(PartyId::ONE),
            _ => Outcome::Drawn,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::InProgress => f.write_str("in progress"),
            Outcome::Decided(p) => write!(f, "party {p} wins"),
            Outcome::Drawn => f.write_str("draw"),
        }
    }
}

/// Evaluates a board. Must be a pure function of the board.
pub trait Rules: Send + Sync {
    fn evaluate(&self, board: &Board) -> Outcome;
}

/// Three in a row on a 3x3 grid.
#[derive(Debug, Clone, Copy, Default)]
pub struct TicTacToe;

const LINES: [[usize; 3]; 8] = [
    [0, 1, 2],
    [3, 4, 5],
    [6, 7, 8],
    [0, 3, 6],
    [1, 4, 7],
    [2, 5, 8],
    [0, 4, 8],
    [2, 4, 6],
];

impl Rules for TicTacToe {
    fn evaluate(&self, board: &Board) -> Outcome {
        // A line wins even when it also fills the board.
        for [a, b, c] in LINES {
            let mark = board.get(a);
            if let Some(party) = mark.party()
                && mark == board.get(b)
                && mark == board.get(c)
            {
                return Outcome::Decided(party);
            }
        }
        if board.is_full() {
            Outcome::Drawn
        } else {
            Outcome::InProgress
        }
    }
}
