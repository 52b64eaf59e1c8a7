//! Turnstile party.
//!
//! Joins a running session and plays moves typed on standard input (`row col`
//! per line), or random moves with `--random`.
//!
//! # Usage
//!
//! ```sh
//! turnstile-party --transport pipe --id 0
//! turnstile-party --transport shm --random 42
//! ```

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use turnstile::error::{ConnectError, PartyError};
use turnstile::mediated::PipeParty;
use turnstile::party::{RandomMoves, StdinMoves, Termination};
use turnstile::shared::ShmParty;
use turnstile::{MoveSource, Outcome, PartyEvent, PartyId, SessionConfig, Transport};

#[derive(Debug, Error)]
enum CliError {
    #[error("{0}")]
    Usage(String),
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error(transparent)]
    Party(#[from] PartyError),
    #[error("standard input: {0}")]
    Stdin(#[from] io::Error),
}

struct Options {
    transport: Transport,
    config: SessionConfig,
    id: PartyId,
    random: Option<u64>,
}

fn main() {
    if let Err(e) = run() {
        eprintln!("turnstile-party: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), CliError> {
    turnstile::init_tracing();
    let args: Vec<String> = std::env::args().collect();
    let opts = parse_args(&args)?;

    let mut source: Box<dyn MoveSource> = match opts.random {
        Some(seed) => Box::new(RandomMoves::seeded(seed)),
        None => Box::new(StdinMoves::new()?),
    };

    let report = match opts.transport {
        Transport::Pipe => {
            PipeParty::connect(&opts.config, opts.id)?.play(source.as_mut(), print_event)?
        }
        Transport::Shm => ShmParty::connect(&opts.config)?.play(source.as_mut(), print_event)?,
    };

    println!(
        "Moves sent: {}, input time: {:.3} s",
        report.moves_sent,
        report.input_time.as_secs_f64()
    );
    Ok(())
}

fn print_event(event: &PartyEvent) {
    match event {
        PartyEvent::Connected(id) => {
            println!("Connected as party {id}, playing {:?}", id.mark());
        }
        PartyEvent::Board(board) => println!("\n{}", board.render()),
        PartyEvent::YourTurn => println!("Your turn. Enter row and column (0-2), e.g. `1 2`:"),
        PartyEvent::InvalidMove(reason) => println!("Invalid move: {reason}. Try again."),
        PartyEvent::Terminated { outcome, cause } => {
            match outcome {
                Outcome::Decided(winner) => println!("Game over: party {winner} wins."),
                _ => println!("Game over: draw."),
            }
            match cause {
                Termination::Concluded => {}
                Termination::PeerClosed(peer) => println!("The session ended early: {peer}."),
                Termination::InputClosed => println!("Input closed, left the session."),
            }
        }
    }
}

fn value<'a>(args: &'a [String], i: usize, flag: &str) -> Result<&'a str, CliError> {
    args.get(i)
        .map(String::as_str)
        .ok_or_else(|| CliError::Usage(format!("missing value for {flag}")))
}

fn parse_args(args: &[String]) -> Result<Options, CliError> {
    let mut transport = Transport::default();
    let mut name: Option<String> = None;
    let mut dir: Option<PathBuf> = None;
    let mut poll_ms: Option<u64> = None;
    let mut id = PartyId::ZERO;
    let mut random = None;

    let mut i = 1;
    while i < args.len() {
        let flag = args[i].as_str();
        match flag {
            "--transport" | "-t" => {
                i += 1;
                transport = value(args, i, flag)?.parse().map_err(CliError::Usage)?;
            }
            "--name" | "-n" => {
                i += 1;
                name = Some(value(args, i, flag)?.to_owned());
            }
            "--dir" | "-d" => {
                i += 1;
                dir = Some(PathBuf::from(value(args, i, flag)?));
            }
            "--poll-ms" => {
                i += 1;
                let raw = value(args, i, flag)?;
                poll_ms = Some(raw.parse().map_err(|_| {
                    CliError::Usage(format!("{flag} expects a number, got `{raw}`"))
                })?);
            }
            "--id" | "-i" => {
                i += 1;
                id = value(args, i, flag)?.parse().map_err(CliError::Usage)?;
            }
            "--random" | "-r" => {
                // The seed is optional.
                match args.get(i + 1).and_then(|s| s.parse::<u64>().ok()) {
                    Some(seed) => {
                        random = Some(seed);
                        i += 1;
                    }
                    None => random = Some(rand::random()),
                }
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            other => return Err(CliError::Usage(format!("unknown argument `{other}`"))),
        }
        i += 1;
    }

    let mut config = name.map_or_else(SessionConfig::default, |n| SessionConfig::named(n));
    if let Some(dir) = dir {
        config.channel_dir = dir;
    }
    if let Some(ms) = poll_ms {
        config.poll_interval = Duration::from_millis(ms.max(1));
    }
    Ok(Options {
        transport,
        config,
        id,
        random,
    })
}

fn print_usage() {
    eprintln!(
        "Usage: turnstile-party [OPTIONS]

Options:
  -t, --transport <pipe|shm>  IPC mechanism (default: pipe)
  -n, --name <NAME>           Session name, prefix of every OS object (default: turnstile)
  -d, --dir <DIR>             Directory for the pipe channels (default: $TMPDIR/<name>)
      --poll-ms <MS>          Upper bound on every wait (default: 100)
  -i, --id <0|1>              Seat to take (pipe only; shm assigns seats in join order)
  -r, --random [SEED]         Play random moves instead of reading standard input
  -h, --help                  Print this help"
    );
}
