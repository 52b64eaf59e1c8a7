//! The shared session record and move validation.
//!
//! [`SessionState`] is `repr(C)` plain bytes so that the very same record is
//! owned by the mediated coordinator and mapped by every process of the
//! shared-memory transport. It carries no lock of its own; callers hold the
//! transport's exclusion around every method that takes `&mut self`.

use crate::error::InvalidMove;
use crate::game::{Board, Mark, Outcome, PartyId, Position, Rules};
use crate::ipc::shmem::SharedMemorySafe;

/// Board, turn and terminal status of one session.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionState {
    board: Board,
    turn: u8,
    outcome: u8,
    moves: u8,
}

// SAFETY: repr(C) of plain bytes.
unsafe impl SharedMemorySafe for SessionState {}

/// Effect of an accepted move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MoveResult {
    /// Status after evaluating the new board.
    pub outcome: Outcome,
    /// Who holds the turn now; `None` once the session is over.
    pub next: Option<PartyId>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionState {
    /// Empty board, party 0 to move, in progress.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            board: Board::new(),
            turn: 0,
            outcome: 0,
            moves: 0,
        }
    }

    #[must_use]
    pub fn board(&self) -> Board {
        self.board
    }

    /// Party holding the turn. Meaningless once the session is over.
    #[must_use]
    pub fn turn(&self) -> PartyId {
        if self.turn == 0 { PartyId::ZERO } else { PartyId::ONE }
    }

    #[must_use]
    pub fn outcome(&self) -> Outcome {
        Outcome::from_raw(self.outcome)
    }

    /// Accepted moves so far.
    #[must_use]
    pub fn moves(&self) -> u32 {
        u32::from(self.moves)
    }

    /// Applies `party`'s move at `pos`.
    ///
    /// The move is rejected, leaving every field untouched, when the session
    /// is over, when it is not `party`'s turn, or when `pos` is off the board
    /// or taken. Otherwise the cell is marked, `rules` re-evaluates the board
    /// and the turn passes to the opponent only if play continues.
    ///
    /// # Errors
    ///
    /// The matching [`InvalidMove`] variant.
    pub fn submit_move(
        &mut self,
        party: PartyId,
        pos: Position,
        rules: &(impl Rules + ?Sized),
    ) -> Result<MoveResult, InvalidMove> {
        let outcome = self.outcome();
        if outcome.is_terminal() {
            return Err(InvalidMove::SessionOver(outcome));
        }
        let turn = self.turn();
        if party != turn {
            return Err(InvalidMove::NotYourTurn { party, turn });
        }
        let cell = pos.cell().ok_or(InvalidMove::OutOfBounds(pos))?;
        if self.board.get(cell) != Mark::Empty {
            return Err(InvalidMove::Occupied(pos));
        }

        self.board.set(cell, party.mark());
        self.moves = self.moves.saturating_add(1);

        let outcome = rules.evaluate(&self.board);
        if outcome.is_terminal() {
            self.outcome = outcome.to_raw();
            return Ok(MoveResult {
                outcome,
                next: None,
            });
        }

        let next = party.other();
        self.turn = next.index() as u8;
        Ok(MoveResult {
            outcome,
            next: Some(next),
        })
    }

    /// Moves the session to a terminal `outcome`.
    ///
    /// Returns `true` only for the call that performed the transition; a
    /// session that is already over keeps its first outcome.
    pub fn conclude(&mut self, outcome: Outcome) -> bool {
        if self.outcome().is_terminal() || !outcome.is_terminal() {
            return false;
        }
        self.outcome = outcome.to_raw();
        true
    }

    /// Ends the session as drawn because a participant vanished.
    pub fn abandon(&mut self) -> bool {
        self.conclude(Outcome::Drawn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::TicTacToe;
    use rand::rngs::StdRng;
    use rand::seq::IteratorRandom;
    use rand::SeedableRng;

    const P0: PartyId = PartyId::ZERO;
    const P1: PartyId = PartyId::ONE;

    fn play(state: &mut SessionState, moves: &[(PartyId, i32, i32)]) -> MoveResult {
        let mut last = None;
        for &(p, r, c) in moves {
            last = Some(state.submit_move(p, Position::new(r, c), &TicTacToe).unwrap());
        }
        last.unwrap()
    }

    #[test]
    fn test_main_diagonal_decides_for_party_zero() {
        let mut state = SessionState::new();
        let result = play(
            &mut state,
            &[(P0, 0, 0), (P1, 0, 1), (P0, 1, 1), (P1, 0, 2), (P0, 2, 2)],
        );
        assert_eq!(result.outcome, Outcome::Decided(P0));
        assert_eq!(result.next, None);
        assert_eq!(state.outcome(), Outcome::Decided(P0));
        assert_eq!(state.moves(), 5);
    }

    #[test]
    fn test_out_of_bounds_keeps_turn_then_retry_succeeds() {
        let mut state = SessionState::new();
        let before = state;
        assert_eq!(
            state.submit_move(P0, Position::new(5, 5), &TicTacToe),
            Err(InvalidMove::OutOfBounds(Position::new(5, 5)))
        );
        assert_eq!(state, before);
        assert_eq!(state.turn(), P0);

        let ok = state.submit_move(P0, Position::new(0, 0), &TicTacToe).unwrap();
        assert_eq!(ok.next, Some(P1));
    }

    #[test]
    fn test_occupied_and_wrong_turn_do_not_mutate() {
        let mut state = SessionState::new();
        play(&mut state, &[(P0, 1, 1)]);
        let before = state;

        assert_eq!(
            state.submit_move(P1, Position::new(1, 1), &TicTacToe),
            Err(InvalidMove::Occupied(Position::new(1, 1)))
        );
        assert_eq!(
            state.submit_move(P0, Position::new(0, 0), &TicTacToe),
            Err(InvalidMove::NotYourTurn { party: P0, turn: P1 })
        );
        assert_eq!(state, before);
    }

    #[test]
    fn test_draw_fill() {
        // X O X / X O O / O X X
        let mut state = SessionState::new();
        let result = play(
            &mut state,
            &[
                (P0, 0, 0),
                (P1, 0, 1),
                (P0, 0, 2),
                (P1, 1, 1),
                (P0, 1, 0),
                (P1, 1, 2),
                (P0, 2, 1),
                (P1, 2, 0),
                (P0, 2, 2),
            ],
        );
        assert_eq!(result.outcome, Outcome::Drawn);
        assert!(state.board().is_full());
    }

    #[test]
    fn test_ninth_move_win_beats_draw() {
        // X O X / O X O / O X X: the last move fills the board and completes
        // the main diagonal.
        let mut state = SessionState::new();
        let result = play(
            &mut state,
            &[
                (P0, 0, 0),
                (P1, 0, 1),
                (P0, 0, 2),
                (P1, 1, 0),
                (P0, 1, 1),
                (P1, 1, 2),
                (P0, 2, 1),
                (P1, 2, 0),
                (P0, 2, 2),
            ],
        );
        assert!(state.board().is_full());
        assert_eq!(result.outcome, Outcome::Decided(P0));
    }

    #[test]
    fn test_terminal_is_monotonic() {
        let mut state = SessionState::new();
        play(
            &mut state,
            &[(P0, 0, 0), (P1, 1, 0), (P0, 0, 1), (P1, 1, 1), (P0, 0, 2)],
        );
        assert_eq!(state.outcome(), Outcome::Decided(P0));
        assert!(!state.abandon());
        assert!(!state.conclude(Outcome::Decided(P1)));
        assert_eq!(
            state.submit_move(P1, Position::new(2, 2), &TicTacToe),
            Err(InvalidMove::SessionOver(Outcome::Decided(P0)))
        );
        assert_eq!(state.outcome(), Outcome::Decided(P0));
    }

    #[test]
    fn test_abandon_draws_once() {
        let mut state = SessionState::new();
        assert!(!state.conclude(Outcome::InProgress));
        assert!(state.abandon());
        assert!(!state.abandon());
        assert_eq!(state.outcome(), Outcome::Drawn);
    }

    #[test]
    fn test_random_games_alternate_strictly() {
        let mut rng = StdRng::seed_from_u64(0x7157);
        for _ in 0..200 {
            let mut state = SessionState::new();
            let mut expected = P0;
            loop {
                let pos = state.board().empty_cells().choose(&mut rng).unwrap();
                assert_eq!(state.turn(), expected);
                let result = state.submit_move(expected, pos, &TicTacToe).unwrap();
                match result.next {
                    Some(next) => {
                        assert_eq!(next, expected.other());
                        expected = next;
                    }
                    None => {
                        assert!(result.outcome.is_terminal());
                        break;
                    }
                }
            }
        }
    }
}
