//! Text messages exchanged over the mediated channels.
//!
//! One message per line, at most [`MAX_MESSAGE_LEN`](crate::ipc::fifo::MAX_MESSAGE_LEN)
//! bytes.
//!
//! | Direction | Message | Wire form |
//! |-----------|---------|-----------|
//! | coordinator → party | welcome | `Welcome\|<id>` |
//! | coordinator → party | board | `Board\|<9 cells of X, O or .>` |
//! | coordinator → party | turn grant | `Your Turn` |
//! | coordinator → party | rejection | `Invalid Move` |
//! | coordinator → party | termination | `Game Over\|Winner:<id or none>` |
//! | party → coordinator | move | `<row> <col> <seconds spent>` |

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ProtocolError;
use crate::game::{Board, Outcome, PartyId, Position};

const WELCOME: &str = "Welcome|";
const BOARD: &str = "Board|";
const YOUR_TURN: &str = "Your Turn";
const INVALID_MOVE: &str = "Invalid Move";
const GAME_OVER: &str = "Game Over|Winner:";

/// Messages sent by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorMessage {
    /// Registration accepted under this identity.
    Welcome(PartyId),
    Board(Board),
    YourTurn,
    /// The last move was rejected; the turn is granted again right after.
    InvalidMove,
    /// Terminal outcome. Never carries [`Outcome::InProgress`].
    GameOver(Outcome),
}

impl fmt::Display for CoordinatorMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Welcome(id) => write!(f, "{WELCOME}{id}"),
            Self::Board(board) => write!(f, "{BOARD}{board}"),
            Self::YourTurn => f.write_str(YOUR_TURN),
            Self::InvalidMove => f.write_str(INVALID_MOVE),
            Self::GameOver(outcome) => match outcome.winner() {
                Some(p) => write!(f, "{GAME_OVER}{p}"),
                None => write!(f, "{GAME_OVER}none"),
            },
        }
    }
}

impl FromStr for CoordinatorMessage {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let malformed = |kind| ProtocolError::Malformed {
            kind,
            raw: s.to_owned(),
        };
        if s.is_empty() {
            return Err(ProtocolError::Empty);
        }
        if s == YOUR_TURN {
            return Ok(Self::YourTurn);
        }
        if s == INVALID_MOVE {
            return Ok(Self::InvalidMove);
        }
        if let Some(rest) = s.strip_prefix(WELCOME) {
            return rest
                .parse()
                .map(Self::Welcome)
                .map_err(|_| malformed("welcome"));
        }
        if let Some(rest) = s.strip_prefix(BOARD) {
            return rest.parse().map(Self::Board).map_err(|_| malformed("board"));
        }
        if let Some(rest) = s.strip_prefix(GAME_OVER) {
            return match rest {
                // Older peers encode a draw as a sentinel id.
                "none" | "-1" | "2" => Ok(Self::GameOver(Outcome::Drawn)),
                id => id
                    .parse()
                    .map(|p| Self::GameOver(Outcome::Decided(p)))
                    .map_err(|_| malformed("game over")),
            };
        }
        Err(ProtocolError::Unknown(s.to_owned()))
    }
}

/// A move as sent by a party, with the time it took to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MoveMessage {
    pub position: Position,
    pub elapsed: Duration,
}

impl fmt::Display for MoveMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {:.3}",
            self.position.row,
            self.position.col,
            self.elapsed.as_secs_f64()
        )
    }
}

impl FromStr for MoveMessage {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || ProtocolError::Malformed {
            kind: "move",
            raw: s.to_owned(),
        };
        let mut it = s.split_whitespace();
        let (Some(row), Some(col), Some(secs), None) = (it.next(), it.next(), it.next(), it.next())
        else {
            return Err(if s.trim().is_empty() {
                ProtocolError::Empty
            } else {
                malformed()
            });
        };
        let row = row.parse().map_err(|_| malformed())?;
        let col = col.parse().map_err(|_| malformed())?;
        let secs: f64 = secs.parse().map_err(|_| malformed())?;
        let elapsed = Duration::try_from_secs_f64(secs).map_err(|_| malformed())?;
        Ok(Self {
            position: Position::new(row, col),
            elapsed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coordinator_wire_forms() {
        let board: Board = "X.O......".parse().unwrap();
        let cases = [
            (CoordinatorMessage::Welcome(PartyId::ONE), "Welcome|1"),
            (CoordinatorMessage::Board(board), "Board|X.O......"),
            (CoordinatorMessage::YourTurn, "Your Turn"),
            (CoordinatorMessage::InvalidMove, "Invalid Move"),
            (
                CoordinatorMessage::GameOver(Outcome::Decided(PartyId::ZERO)),
                "Game Over|Winner:0",
            ),
            (CoordinatorMessage::GameOver(Outcome::Drawn), "Game Over|Winner:none"),
        ];
        for (msg, wire) in cases {
            assert_eq!(msg.to_string(), wire);
            assert_eq!(wire.parse::<CoordinatorMessage>(), Ok(msg));
        }
    }

    #[test]
    fn test_draw_sentinels() {
        for wire in ["Game Over|Winner:-1", "Game Over|Winner:2"] {
            assert_eq!(
                wire.parse::<CoordinatorMessage>(),
                Ok(CoordinatorMessage::GameOver(Outcome::Drawn))
            );
        }
    }

    #[test]
    fn test_bad_coordinator_messages() {
        assert_eq!("".parse::<CoordinatorMessage>(), Err(ProtocolError::Empty));
        assert!(matches!(
            "Hello".parse::<CoordinatorMessage>(),
            Err(ProtocolError::Unknown(_))
        ));
        assert!(matches!(
            "Board|XO".parse::<CoordinatorMessage>(),
            Err(ProtocolError::Malformed { kind: "board", .. })
        ));
        assert!(matches!(
            "Welcome|7".parse::<CoordinatorMessage>(),
            Err(ProtocolError::Malformed { kind: "welcome", .. })
        ));
    }

    #[test]
    fn test_move_message() {
        let msg = MoveMessage {
            position: Position::new(2, 1),
            elapsed: Duration::from_millis(1_250),
        };
        assert_eq!(msg.to_string(), "2 1 1.250");
        assert_eq!("2 1 1.250".parse::<MoveMessage>(), Ok(msg));

        let far: MoveMessage = "5 5 0".parse().unwrap();
        assert_eq!(far.position, Position::new(5, 5));
        assert_eq!(far.elapsed, Duration::ZERO);
    }

    #[test]
    fn test_bad_move_messages() {
        for raw in ["1 2", "1 2 3 4", "a 1 0.5", "1 1 -0.5", "1 1 NaN", "1 1 inf"] {
            assert!(
                matches!(raw.parse::<MoveMessage>(), Err(ProtocolError::Malformed { .. })),
                "{raw}"
            );
        }
        assert_eq!("  ".parse::<MoveMessage>(), Err(ProtocolError::Empty));
    }
}
