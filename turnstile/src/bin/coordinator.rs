//! Turnstile session coordinator.
//!
//! Creates the session objects, waits for two parties, runs one session and
//! prints its summary, as text or (with `--json`) as one JSON object.
//!
//! # Usage
//!
//! ```sh
//! turnstile-coordinator --transport pipe --name demo --poll-ms 50
//! turnstile-coordinator --transport shm --await-secs 60 --json
//! ```

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use turnstile::coordinator::SessionCoordinator;
use turnstile::error::{ResourceError, SessionError};
use turnstile::mediated::PipeCoordinator;
use turnstile::shared::ShmCoordinator;
use turnstile::{SessionConfig, Timeout, Transport};

#[derive(Debug, Error)]
enum CliError {
    #[error("{0}")]
    Usage(String),
    #[error(transparent)]
    Resource(#[from] ResourceError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("failed to encode summary: {0}")]
    Json(#[from] serde_json::Error),
}

struct Options {
    transport: Transport,
    config: SessionConfig,
    json: bool,
}

fn main() {
    if let Err(e) = run() {
        eprintln!("turnstile-coordinator: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), CliError> {
    turnstile::init_tracing();
    let args: Vec<String> = std::env::args().collect();
    let Options {
        transport,
        config,
        json,
    } = parse_args(&args)?;

    let mut coordinator: Box<dyn SessionCoordinator> = match transport {
        Transport::Pipe => Box::new(PipeCoordinator::create(config)?),
        Transport::Shm => Box::new(ShmCoordinator::create(config)?),
    };

    eprintln!("turnstile-coordinator: {transport} session ready, waiting for 2 parties");
    let result = coordinator
        .await_parties(2)
        .and_then(|()| coordinator.run());
    coordinator.teardown();

    let summary = result?;
    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("{summary}");
    }
    Ok(())
}

fn value<'a>(args: &'a [String], i: usize, flag: &str) -> Result<&'a str, CliError> {
    args.get(i)
        .map(String::as_str)
        .ok_or_else(|| CliError::Usage(format!("missing value for {flag}")))
}

fn number(raw: &str, flag: &str) -> Result<u64, CliError> {
    raw.parse()
        .map_err(|_| CliError::Usage(format!("{flag} expects a number, got `{raw}`")))
}

fn parse_args(args: &[String]) -> Result<Options, CliError> {
    let mut transport = Transport::default();
    let mut name: Option<String> = None;
    let mut dir: Option<PathBuf> = None;
    let mut poll_ms: Option<u64> = None;
    let mut await_secs: Option<u64> = None;
    let mut json = false;

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
                poll_ms = Some(number(value(args, i, flag)?, flag)?);
            }
            "--await-secs" => {
                i += 1;
                await_secs = Some(number(value(args, i, flag)?, flag)?);
            }
            "--json" => json = true,
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
    if let Some(secs) = await_secs {
        config.await_timeout = Timeout::Duration(Duration::from_secs(secs));
    }
    Ok(Options {
        transport,
        config,
        json,
    })
}

fn print_usage() {
    eprintln!(
        "Usage: turnstile-coordinator [OPTIONS]

Options:
  -t, --transport <pipe|shm>  IPC mechanism (default: pipe)
  -n, --name <NAME>           Session name, prefix of every OS object (default: turnstile)
  -d, --dir <DIR>             Directory for the pipe channels (default: $TMPDIR/<name>)
      --poll-ms <MS>          Upper bound on every wait (default: 100)
      --await-secs <SECS>     Give up if both parties have not joined by then
      --json                  Print the summary as JSON
  -h, --help                  Print this help"
    );
}
