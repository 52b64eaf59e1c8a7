//! Named FIFOs carrying newline-framed text messages.
//!
//! Every end is opened `O_NONBLOCK` and every read is bounded by `poll`, so a
//! reader can always come back up for air and look at session state.
//!
//! ```text
//!   writer process                         reader process
//!  ┌─────────────┐   "Your Turn\n"        ┌──────────────┐
//!  │ FifoWriter  │ ─────────────────────> │ FifoReader   │
//!  └─────────────┘        <dir>/<name>    └──────────────┘
//! ```
//!
//! A FIFO's EOF is ambiguous: `read` returns 0 both before any writer has
//! opened it and after the last writer has closed it. [`FifoReader`] only
//! reports [`ReadStatus::Closed`] once it has seen evidence of a writer.

use std::ffi::CString;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::marker::PhantomData;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::time::Duration;

use rustix::event::{PollFd, PollFlags, Timespec, poll};
use rustix::fs::{FlockOperation, flock};

use super::{Creator, Opener, Ownership};
use crate::trace::{debug, warn};

/// Largest message accepted before the reader gives up on framing.
pub const MAX_MESSAGE_LEN: usize = 256;

/// A named FIFO on the filesystem.
///
/// [`Fifo<Creator>`] makes the node and removes it on drop; [`Fifo<Opener>`]
/// attaches to an existing node.
#[derive(Debug)]
pub struct Fifo<Mode: Ownership> {
    path: PathBuf,
    _mode: PhantomData<Mode>,
}

/// Removes a leftover FIFO (or any file) at `path`, ignoring "not found".
///
/// # Errors
///
/// Any other error from `unlink`.
pub fn remove_stale(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            debug!(path = %path.display(), "removed stale channel");
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

impl Fifo<Creator> {
    /// Creates the FIFO node with mode `0600`.
    ///
    /// # Errors
    ///
    /// `EEXIST` if something already lives at `path`.
    pub fn create(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let c = CString::new(path.as_os_str().as_bytes())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        // SAFETY: c is a valid NUL-terminated path.
        if unsafe { libc::mkfifo(c.as_ptr(), 0o600) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            path,
            _mode: PhantomData,
        })
    }
}

impl Fifo<Opener> {
    /// Attaches to an existing FIFO node.
    ///
    /// # Errors
    ///
    /// `NotFound` if nothing is at `path`, `InvalidInput` if it is not a FIFO.
    pub fn attach(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let meta = std::fs::metadata(&path)?;
        if !meta.file_type().is_fifo() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a FIFO", path.display()),
            ));
        }
        Ok(Self {
            path,
            _mode: PhantomData,
        })
    }
}

impl<Mode: Ownership> Fifo<Mode> {
    /// Location of the node.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Opens the read end. Never blocks, even without a writer.
    ///
    /// # Errors
    ///
    /// Errors from `open(2)`.
    pub fn open_reader(&self) -> io::Result<FifoReader> {
        let file = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&self.path)?;
        Ok(FifoReader::new(file))
    }

    /// Opens the write end.
    ///
    /// # Errors
    ///
    /// `ENXIO` while nobody has the read end open; callers retry.
    pub fn open_writer(&self) -> io::Result<FifoWriter> {
        let file = OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&self.path)?;
        Ok(FifoWriter { file })
    }
}

impl<Mode: Ownership> Drop for Fifo<Mode> {
    fn drop(&mut self) {
        if Mode::SHOULD_UNLINK
            && let Err(e) = std::fs::remove_file(&self.path)
            && e.kind() != io::ErrorKind::NotFound
        {
            warn!(path = %self.path.display(), error = %e, "failed to remove channel");
        }
    }
}

/// Result of one bounded read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadStatus {
    /// One complete message, without its terminator.
    Message(String),
    /// Nothing complete arrived within the wait.
    Pending,
    /// Every writer has gone away and the buffer is drained.
    Closed,
}

pub(crate) fn timespec(wait: Duration) -> Timespec {
    Timespec {
        tv_sec: wait.as_secs().try_into().unwrap_or(i64::MAX as _),
        tv_nsec: wait.subsec_nanos() as _,
    }
}

/// Waits until `fd` reports one of `flags` or `wait` elapses.
///
/// Returns the reported events, empty on timeout or `EINTR`.
fn wait_for(file: &File, flags: PollFlags, wait: Duration) -> io::Result<PollFlags> {
    let mut fds = [PollFd::new(file, flags)];
    match poll(&mut fds, Some(&timespec(wait))) {
        Ok(0) => Ok(PollFlags::empty()),
        Ok(_) => Ok(fds[0].revents()),
        Err(rustix::io::Errno::INTR) => Ok(PollFlags::empty()),
        Err(e) => Err(e.into()),
    }
}

/// Newline framing with a length cap.
///
/// Once a line grows past [`MAX_MESSAGE_LEN`] without a terminator the framer
/// reports the overflow once, then drops everything up to and including the
/// next `\n` so the following line starts clean.
#[derive(Debug, Default)]
pub(crate) struct LineFramer {
    buf: Vec<u8>,
    discarding: bool,
}

impl LineFramer {
    /// Appends `bytes`; returns `true` if this started an overflow.
    pub(crate) fn push(&mut self, bytes: &[u8]) -> bool {
        self.buf.extend_from_slice(bytes);
        self.skip_discarded();
        if self.buf.len() > MAX_MESSAGE_LEN && !self.buf.contains(&b'\n') {
            self.buf.clear();
            self.discarding = true;
            return true;
        }
        false
    }

    fn skip_discarded(&mut self) {
        if !self.discarding {
            return;
        }
        match self.buf.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                self.buf.drain(..=pos);
                self.discarding = false;
            }
            None => self.buf.clear(),
        }
    }

    /// Next complete line, without its terminator.
    pub(crate) fn next_line(&mut self) -> Option<String> {
        let pos = self.buf.iter().position(|&b| b == b'\n')?;
        let line: Vec<u8> = self.buf.drain(..=pos).collect();
        Some(decode(&line[..line.len() - 1]))
    }

    /// Whatever is left once the input has ended.
    pub(crate) fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buf);
        if std::mem::take(&mut self.discarding) || rest.is_empty() {
            return None;
        }
        Some(decode(&rest))
    }
}

fn decode(line: &[u8]) -> String {
    String::from_utf8_lossy(line).trim_end_matches('\r').to_owned()
}

/// Read end of a FIFO with newline framing.
#[derive(Debug)]
pub struct FifoReader {
    file: File,
    framer: LineFramer,
    writer_seen: bool,
}

impl FifoReader {
    fn new(file: File) -> Self {
        Self {
            file,
            framer: LineFramer::default(),
            writer_seen: false,
        }
    }

    /// Whether a writer has ever been observed on this end.
    #[must_use]
    pub fn writer_seen(&self) -> bool {
        self.writer_seen
    }

    /// Returns the next complete message, waiting at most `wait` for one.
    ///
    /// # Errors
    ///
    /// Read or poll failures, and `InvalidData` once per line that runs past
    /// [`MAX_MESSAGE_LEN`] bytes; the rest of that line is skipped.
    pub fn read_message(&mut self, wait: Duration) -> io::Result<ReadStatus> {
        if let Some(line) = self.framer.next_line() {
            return Ok(ReadStatus::Message(line));
        }

        let ready = wait_for(&self.file, PollFlags::IN, wait)?;
        if ready.is_empty() {
            return Ok(ReadStatus::Pending);
        }

        let mut chunk = [0u8; MAX_MESSAGE_LEN];
        match self.file.read(&mut chunk) {
            Ok(0) if self.writer_seen || ready.contains(PollFlags::HUP) => {
                self.writer_seen = true;
                Ok(ReadStatus::Closed)
            }
            Ok(0) => Ok(ReadStatus::Pending),
            Ok(n) => {
                self.writer_seen = true;
                if self.framer.push(&chunk[..n]) {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "unterminated message exceeds frame limit",
                    ));
                }
                Ok(self
                    .framer
                    .next_line()
                    .map_or(ReadStatus::Pending, ReadStatus::Message))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                // EAGAIN means a writer holds the other end.
                self.writer_seen = true;
                Ok(ReadStatus::Pending)
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(ReadStatus::Pending),
            Err(e) => Err(e),
        }
    }

    /// A second descriptor for the same open file, used to watch for hang-up
    /// from another thread while this reader is busy.
    ///
    /// # Errors
    ///
    /// Errors from `dup(2)`.
    pub fn hangup_probe(&self) -> io::Result<HangupProbe> {
        Ok(HangupProbe {
            file: self.file.try_clone()?,
        })
    }
}

/// Non-consuming hang-up check on a FIFO read end.
#[derive(Debug)]
pub struct HangupProbe {
    file: File,
}

impl HangupProbe {
    /// Waits up to `wait` for any of `probes` to see every writer gone.
    ///
    /// Returns the index of the first hung-up channel. Buffered data neither
    /// wakes the wait nor gets consumed.
    ///
    /// # Errors
    ///
    /// Poll failures.
    pub fn first_hung_up(probes: &[HangupProbe], wait: Duration) -> io::Result<Option<usize>> {
        // POLLHUP is reported even when no events are requested.
        let mut fds: Vec<PollFd<'_>> = probes
            .iter()
            .map(|p| PollFd::new(&p.file, PollFlags::empty()))
            .collect();
        match poll(&mut fds, Some(&timespec(wait))) {
            Ok(0) | Err(rustix::io::Errno::INTR) => Ok(None),
            Ok(_) => Ok(fds
                .iter()
                .position(|fd| fd.revents().contains(PollFlags::HUP))),
            Err(e) => Err(e.into()),
        }
    }
}

/// How long a write may stall on a full pipe before it is treated as a dead
/// reader.
const WRITE_STALL: Duration = Duration::from_secs(1);

/// Write end of a FIFO.
#[derive(Debug)]
pub struct FifoWriter {
    file: File,
}

impl FifoWriter {
    /// Takes an exclusive advisory lock on the node without waiting.
    ///
    /// Returns `false` if another open file already holds it. The lock goes
    /// away with the last descriptor of this writer.
    ///
    /// # Errors
    ///
    /// `flock(2)` failures other than `EWOULDBLOCK`.
    pub fn try_lock(&self) -> io::Result<bool> {
        match flock(&self.file, FlockOperation::NonBlockingLockExclusive) {
            Ok(()) => Ok(true),
            Err(rustix::io::Errno::WOULDBLOCK) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Writes `msg` followed by `\n`.
    ///
    /// Messages shorter than `PIPE_BUF` land atomically.
    ///
    /// # Errors
    ///
    /// `BrokenPipe` when the reader is gone, `TimedOut` when the pipe stays
    /// full, other write errors as-is.
    pub fn send(&mut self, msg: &impl fmt::Display) -> io::Result<()> {
        let framed = format!("{msg}\n");
        let mut rest = framed.as_bytes();
        while !rest.is_empty() {
            match self.file.write(rest) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => rest = &rest[n..],
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if wait_for(&self.file, PollFlags::OUT, WRITE_STALL)?.is_empty() {
                        return Err(io::ErrorKind::TimedOut.into());
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}
