//! Session configuration and OS object naming.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use minstant::Instant;

use crate::game::PartyId;
use crate::ipc::shmem::{Result, ShmPath};

/// Timeout specification for blocking operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Wait indefinitely.
    Infinite,
    /// Wait for at most the specified duration.
    Duration(Duration),
}

impl Timeout {
    /// Absolute deadline counted from `start`, `None` when infinite.
    ///
    /// A duration too large to represent is treated as infinite.
    #[must_use]
    pub fn deadline(self, start: Instant) -> Option<Instant> {
        match self {
            Timeout::Infinite => None,
            Timeout::Duration(d) => start.checked_add(d),
        }
    }
}

impl From<Duration> for Timeout {
    fn from(d: Duration) -> Self {
        Self::Duration(d)
    }
}

/// Which IPC mechanism a session runs over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Transport {
    /// FIFOs and named semaphores through a coordinator.
    #[default]
    Pipe,
    /// One shared memory record under a process-shared lock.
    Shm,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Transport::Pipe => "pipe",
            Transport::Shm => "shm",
        })
    }
}

impl FromStr for Transport {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pipe" | "fifo" => Ok(Transport::Pipe),
            "shm" | "shared" => Ok(Transport::Shm),
            other => Err(format!("unknown transport `{other}`, expected pipe or shm")),
        }
    }
}

/// Everything both sides of a session must agree on, plus local tuning.
///
/// Coordinator and parties derive every OS object name from `name` and
/// `channel_dir`, so they only need the same two values to meet.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Prefix for semaphore and shared memory names.
    pub name: String,
    /// Directory holding the FIFOs of the mediated transport.
    pub channel_dir: PathBuf,
    /// Upper bound on every wait, so termination is noticed within one
    /// interval.
    pub poll_interval: Duration,
    /// How long a party waits for the coordinator to accept it.
    pub connect_timeout: Timeout,
    /// How long the coordinator waits for both parties.
    pub await_timeout: Timeout,
    /// How long the shared-memory coordinator waits for parties to detach
    /// after termination before removing the segment.
    pub detach_grace: Duration,
    /// Remove leftovers of a crashed session before creating objects.
    pub reclaim_stale: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::named("turnstile")
    }
}

impl SessionConfig {
    /// Default settings under a different object prefix.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            channel_dir: std::env::temp_dir().join(&name),
            name,
            poll_interval: Duration::from_millis(100),
            connect_timeout: Timeout::Duration(Duration::from_secs(5)),
            await_timeout: Timeout::Infinite,
            detach_grace: Duration::from_secs(2),
            reclaim_stale: true,
        }
    }

    /// Named semaphore that wakes `party`: `/<name>-turn-<id>`.
    ///
    /// # Errors
    ///
    /// When `name` makes an invalid POSIX name.
    pub fn turn_semaphore(&self, party: PartyId) -> Result<ShmPath> {
        ShmPath::new(format!("/{}-turn-{}", self.name, party))
    }

    /// Shared memory segment of the shared transport: `/<name>-session`.
    ///
    /// # Errors
    ///
    /// When `name` makes an invalid POSIX name.
    pub fn segment(&self) -> Result<ShmPath> {
        ShmPath::new(format!("/{}-session", self.name))
    }

    /// Party → coordinator FIFO.
    #[must_use]
    pub fn client_channel(&self, party: PartyId) -> PathBuf {
        self.channel_dir.join(format!("client{party}"))
    }

    /// Coordinator → party FIFO.
    #[must_use]
    pub fn server_channel(&self, party: PartyId) -> PathBuf {
        self.channel_dir.join(format!("server{party}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_names() {
        let config = SessionConfig::default();
        assert_eq!(config.poll_interval, Duration::from_millis(100));
        assert_eq!(config.await_timeout, Timeout::Infinite);
        assert_eq!(
            config.turn_semaphore(PartyId::ONE).unwrap().as_ref(),
            "/turnstile-turn-1"
        );
        assert_eq!(config.segment().unwrap().as_ref(), "/turnstile-session");
        assert!(config.client_channel(PartyId::ZERO).ends_with("turnstile/client0"));
        assert!(config.server_channel(PartyId::ONE).ends_with("turnstile/server1"));
    }

    #[test]
    fn test_invalid_prefix_rejected() {
        let config = SessionConfig::named("bad/name");
        assert!(config.segment().is_err());
    }

    #[test]
    fn test_huge_timeout_never_expires() {
        let now = Instant::now();
        assert_eq!(Timeout::Duration(Duration::MAX).deadline(now), None);
    }

    #[test]
    fn test_transport_names() {
        assert_eq!("shm".parse::<Transport>(), Ok(Transport::Shm));
        assert_eq!("pipe".parse::<Transport>(), Ok(Transport::Pipe));
        assert_eq!(Transport::Shm.to_string(), "shm");
        assert!("udp".parse::<Transport>().is_err());
    }

    #[test]
    fn test_timeout_deadline() {
        let now = Instant::now();
        assert_eq!(Timeout::Infinite.deadline(now), None);
        let d = Timeout::from(Duration::from_millis(5)).deadline(now).unwrap();
        assert!(d > now);
    }
}
