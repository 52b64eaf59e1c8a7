//! Typed POSIX shared memory with typestate-based cleanup.
//!
//! [`Shm<T, Mode>`] maps exactly one `T` into the address space. The creating
//! process initializes the value in place (so that address-sensitive members
//! such as a `pthread_mutex_t` never move) and unlinks the name on drop; every
//! other process opens the existing object and only unmaps it.
//!
//! ```text
//! Unsafe POSIX operations:    Safe Rust wrappers:
//! ┌──────────────────┐        ┌────────────────────┐
//! │ shm_open()       │───────>│ Shm::create()      │
//! │ ftruncate()      │        │ Shm::open()        │
//! │ mmap()           │───────>│                    │
//! │ munmap()         │───────>│ Drop::drop()       │
//! │ shm_unlink()     │───────>│ Drop::drop()       │
//! │ *mut T           │───────>│ Deref              │
//! └──────────────────┘        └────────────────────┘
//! ```
//!
//! # Crash leftovers
//!
//! A creator killed by a signal never runs `Drop`, so the name survives.
//! Coordinators call [`unlink`] on their well-known path before creating.

use rustix::fs::{Mode, fstat, ftruncate};
use rustix::mm::{MapFlags, ProtFlags, mmap, munmap};
use rustix::{io, shm};
use std::fmt;
use std::marker::PhantomData;
use std::mem::{MaybeUninit, size_of};
use std::ops::Deref;
use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};
use std::ptr::{NonNull, null_mut};
use std::sync::atomic::*;

use super::{Creator, Opener, Ownership};

/// Result alias for shared memory operations.
pub type Result<T> = std::result::Result<T, ShmError>;

/// Contextual errors produced by [`Shm`].
#[derive(Debug)]
pub enum ShmError {
    /// The provided POSIX shared memory name is invalid.
    InvalidPath { path: String, reason: &'static str },
    /// `mmap`, `shm_open`, `ftruncate`, etc. failed with an errno.
    PosixError {
        op: &'static str,
        path: String,
        source: io::Errno,
    },
    /// The existing shared memory object has a different size than `T`.
    SizeMismatch {
        path: String,
        expected: usize,
        actual: i64,
    },
    /// The creator never finished initializing the object.
    InitTimeout { path: String },
}

impl ShmError {
    fn posix(op: &'static str, path: &ShmPath, err: io::Errno) -> Self {
        Self::PosixError {
            op,
            path: path.to_string(),
            source: err,
        }
    }

    /// Returns the errno if this error came from a POSIX call.
    #[must_use]
    pub fn errno(&self) -> Option<io::Errno> {
        match self {
            ShmError::PosixError { source, .. } => Some(*source),
            _ => None,
        }
    }
}

impl fmt::Display for ShmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShmError::InvalidPath { path, reason } => {
                write!(f, "invalid shared memory path `{}`: {}", path, reason)
            }
            ShmError::PosixError { op, path, source } => {
                write!(f, "{} failed for `{}`: {}", op, path, source)
            }
            ShmError::SizeMismatch {
                path,
                expected,
                actual,
            } => write!(
                f,
                "shared memory `{}` size mismatch: expected {} bytes, got {}",
                path, expected, actual
            ),
            ShmError::InitTimeout { path } => {
                write!(f, "shared memory `{}` was never initialized", path)
            }
        }
    }
}

impl std::error::Error for ShmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ShmError::PosixError { source, .. } => Some(source),
            _ => None,
        }
    }
}

const POSIX_NAME_MAX: usize = 255;

/// A validated POSIX shared memory object name.
///
/// Must start with `/`, contain no further `/`, and fit in `NAME_MAX`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShmPath(String);

impl ShmPath {
    /// Validates and wraps a shared memory name.
    ///
    /// # Errors
    ///
    /// [`ShmError::InvalidPath`] if the name breaks one of the POSIX rules.
    pub fn new(path: impl Into<String>) -> Result<Self> {
        let path = path.into();
        validate_shm_path(&path)?;
        Ok(Self(path))
    }
}

impl AsRef<str> for ShmPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShmPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<ShmPath> for String {
    fn from(path: ShmPath) -> Self {
        path.0
    }
}

fn validate_shm_path(path: &str) -> Result<()> {
    if !path.starts_with('/') {
        return Err(ShmError::InvalidPath {
            path: path.to_string(),
            reason: "path must start with '/'",
        });
    }

    if path[1..].contains('/') {
        return Err(ShmError::InvalidPath {
            path: path.to_string(),
            reason: "path must not contain additional '/' characters",
        });
    }

    if path.len() > POSIX_NAME_MAX {
        return Err(ShmError::InvalidPath {
            path: path.to_string(),
            reason: "path length must be <= 255 bytes",
        });
    }

    Ok(())
}

/// Removes a shared memory name, ignoring "does not exist".
///
/// # Errors
///
/// Any errno other than `ENOENT`.
pub fn unlink(path: &ShmPath) -> Result<()> {
    match shm::unlink(path.as_ref()) {
        Ok(()) | Err(io::Errno::NOENT) => Ok(()),
        Err(err) => Err(ShmError::posix("shm_unlink", path, err)),
    }
}

/// Types safe to place in POSIX shared memory and touch from several processes.
///
/// # Safety
///
/// Implementers must guarantee:
///
/// | Property | Requirement |
/// |----------|-------------|
/// | **Layout** | `#[repr(C)]` or `#[repr(transparent)]` |
/// | **Pointers** | No heap/stack pointers or references |
/// | **Fields** | All fields are themselves safe to share |
/// | **Drop** | Still sound if `Drop` never runs (SIGKILL) |
/// | **Concurrency** | Mutable state is behind atomics or a process-shared lock |
///
/// `std::sync::Mutex` is process-local and must not appear in such a type;
/// use [`ProcessMutex`](super::pshared::ProcessMutex) instead.
pub unsafe trait SharedMemorySafe: Send + Sync {}

macro_rules! impl_shared_memory_safe {
    ($($t:ty),* $(,)?) => {
        $(
            unsafe impl SharedMemorySafe for $t {}
        )*
    };
}

impl_shared_memory_safe! {
    i8, i16, i32, i64, isize,
    u8, u16, u32, u64, usize,
    bool,
    AtomicBool,
    AtomicI8, AtomicI16, AtomicI32, AtomicI64, AtomicIsize,
    AtomicU8, AtomicU16, AtomicU32, AtomicU64, AtomicUsize,
}

unsafe impl<T: SharedMemorySafe, const N: usize> SharedMemorySafe for [T; N] {}

/// Smart pointer to a `T` living in POSIX shared memory.
///
/// `Mode` ([`Creator`] or [`Opener`]) decides at compile time whether dropping
/// the handle unlinks the name.
///
/// | Mode | On Drop |
/// |------|---------|
/// | [`Creator`] | `munmap()` + `shm_unlink()` |
/// | [`Opener`] | `munmap()` only |
pub struct Shm<T: SharedMemorySafe, Mode: Ownership> {
    ptr: NonNull<T>,
    size: usize,
    path: ShmPath,
    _mode: PhantomData<Mode>,
}

// SAFETY: T: SharedMemorySafe already requires Send + Sync, and the pointer
// targets a shared mapping rather than thread-local data.
unsafe impl<T: SharedMemorySafe, Mode: Ownership> Send for Shm<T, Mode> {}

// SAFETY: see Send.
unsafe impl<T: SharedMemorySafe, Mode: Ownership> Sync for Shm<T, Mode> {}

fn map<T>(fd: &rustix::fd::OwnedFd, path: &ShmPath) -> Result<NonNull<T>> {
    // SAFETY: a fresh MAP_SHARED mapping of a file descriptor we own. The
    // kernel picks the address, so it aliases nothing in this process, and
    // mmap returns page-aligned memory which satisfies any alignment of T.
    let ptr = unsafe {
        mmap(
            null_mut(),
            size_of::<T>(),
            ProtFlags::READ | ProtFlags::WRITE,
            MapFlags::SHARED,
            fd,
            0,
        )
    }
    .map_err(|err| ShmError::posix("mmap", path, err))?;

    NonNull::new(ptr.cast::<T>()).ok_or(ShmError::PosixError {
        op: "mmap",
        path: path.to_string(),
        source: io::Errno::NOMEM,
    })
}

impl<T: SharedMemorySafe> Shm<T, Creator> {
    /// Creates new shared memory, maps it, and initializes it in place.
    ///
    /// `init` receives the zero-filled mapping and must fully initialize it.
    /// It runs before any other process can observe a complete `T`, so it is
    /// where process-shared locks get their attributes.
    ///
    /// # Errors
    ///
    /// - invalid name
    /// - the name already exists (`EEXIST`)
    /// - permissions (`EACCES`), memory (`ENOMEM`), descriptor limits
    ///
    /// # Panics
    ///
    /// Propagates a panic from `init` after unmapping and unlinking.
    pub fn create(path: ShmPath, init: impl FnOnce(&mut MaybeUninit<T>)) -> Result<Self> {
        let fd = shm::open(
            path.as_ref(),
            shm::OFlags::CREATE | shm::OFlags::EXCL | shm::OFlags::RDWR,
            Mode::RUSR | Mode::WUSR,
        )
        .map_err(|err| ShmError::posix("shm_open", &path, err))?;

        if let Err(e) = ftruncate(&fd, size_of::<T>() as u64) {
            drop(fd);
            let _ = shm::unlink(path.as_ref());
            return Err(ShmError::posix("ftruncate", &path, e));
        }

        let ptr = match map::<T>(&fd, &path) {
            Ok(ptr) => ptr,
            Err(err) => {
                drop(fd);
                let _ = shm::unlink(path.as_ref());
                return Err(err);
            }
        };

        let shm = Self {
            ptr,
            size: size_of::<T>(),
            path,
            _mode: PhantomData,
        };

        let init_result = catch_unwind(AssertUnwindSafe(|| {
            // SAFETY: the mapping is exactly size_of::<T>() bytes, aligned, and
            // nobody else holds a Rust reference to it yet.
            let uninit = unsafe { &mut *shm.ptr.as_ptr().cast::<MaybeUninit<T>>() };
            init(uninit);
        }));

        match init_result {
            Ok(()) => Ok(shm),
            Err(payload) => {
                drop(shm);
                resume_unwind(payload);
            }
        }
    }
}

impl<T: SharedMemorySafe> Shm<T, Opener> {
    /// Opens and maps shared memory created by another process.
    ///
    /// The caller is responsible for waiting until the creator's in-place
    /// initialization is visible (typically an init marker inside `T`).
    ///
    /// # Errors
    ///
    /// - the object does not exist (`ENOENT`)
    /// - permissions (`EACCES`)
    /// - the object size differs from `size_of::<T>()`
    pub fn open(path: ShmPath) -> Result<Self> {
        let fd = shm::open(path.as_ref(), shm::OFlags::RDWR, Mode::empty())
            .map_err(|err| ShmError::posix("shm_open", &path, err))?;

        let stat = fstat(&fd).map_err(|err| ShmError::posix("fstat", &path, err))?;
        let expected_size = size_of::<T>() as i64;
        if stat.st_size != expected_size {
            return Err(ShmError::SizeMismatch {
                path: path.to_string(),
                expected: size_of::<T>(),
                actual: stat.st_size,
            });
        }

        let ptr = map::<T>(&fd, &path)?;

        Ok(Self {
            ptr,
            size: size_of::<T>(),
            path,
            _mode: PhantomData,
        })
    }
}

impl<T: SharedMemorySafe, Mode: Ownership> Shm<T, Mode> {
    /// The name this mapping was created or opened with.
    #[must_use]
    pub fn path(&self) -> &ShmPath {
        &self.path
    }
}

impl<T: SharedMemorySafe, Mode: Ownership> Drop for Shm<T, Mode> {
    fn drop(&mut self) {
        // SAFETY: ptr/size describe the mapping created in create/open and it
        // is unmapped exactly once, here.
        unsafe {
            let _ = munmap(self.ptr.as_ptr().cast(), self.size);
        }

        if Mode::SHOULD_UNLINK {
            let _ = shm::unlink(self.path.as_ref());
        }
    }
}

impl<T: SharedMemorySafe, Mode: Ownership> Deref for Shm<T, Mode> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: the mapping stays valid until Drop, and T: SharedMemorySafe
        // makes shared access through &T sound.
        unsafe { self.ptr.as_ref() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C)]
    struct Counter {
        value: AtomicU64,
        flag: AtomicBool,
    }

    unsafe impl SharedMemorySafe for Counter {}

    fn init_counter(uninit: &mut MaybeUninit<Counter>) {
        uninit.write(Counter {
            value: AtomicU64::new(7),
            flag: AtomicBool::new(false),
        });
    }

    fn test_path(suffix: &str) -> ShmPath {
        ShmPath::new(format!("/turnstile-shm-test-{}-{}", std::process::id(), suffix)).unwrap()
    }

    #[test]
    fn test_shm_creator_and_opener_share_memory() -> Result<()> {
        let path = test_path("share");
        unlink(&path)?;

        let creator = match Shm::<Counter, Creator>::create(path.clone(), init_counter) {
            Ok(shm) => shm,
            Err(err @ ShmError::PosixError { source, .. }) if source == io::Errno::ACCESS => {
                eprintln!("Skipping test_shm_creator_and_opener_share_memory: {err}");
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        assert_eq!(creator.value.load(Ordering::SeqCst), 7);

        {
            let opener = Shm::<Counter, Opener>::open(path.clone())?;
            assert_eq!(opener.value.load(Ordering::SeqCst), 7);
            opener.value.store(200, Ordering::SeqCst);
            opener.flag.store(true, Ordering::SeqCst);
        }

        assert_eq!(creator.value.load(Ordering::SeqCst), 200);
        assert!(creator.flag.load(Ordering::SeqCst));

        drop(creator);
        assert!(matches!(
            Shm::<Counter, Opener>::open(path),
            Err(ShmError::PosixError { source: io::Errno::NOENT, .. })
        ));
        Ok(())
    }

    #[test]
    fn test_shm_create_twice_fails() -> Result<()> {
        let path = test_path("twice");
        unlink(&path)?;

        let _first = match Shm::<Counter, Creator>::create(path.clone(), init_counter) {
            Ok(shm) => shm,
            Err(err @ ShmError::PosixError { source, .. }) if source == io::Errno::ACCESS => {
                eprintln!("Skipping test_shm_create_twice_fails: {err}");
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        let second = Shm::<Counter, Creator>::create(path, init_counter);
        assert!(matches!(
            second,
            Err(ShmError::PosixError { source: io::Errno::EXIST, .. })
        ));
        Ok(())
    }

    #[test]
    fn test_shm_open_size_mismatch() -> Result<()> {
        #[repr(C)]
        struct Large {
            a: [AtomicU64; 8],
        }
        unsafe impl SharedMemorySafe for Large {}

        let path = test_path("size");
        unlink(&path)?;

        let _small = match Shm::<Counter, Creator>::create(path.clone(), init_counter) {
            Ok(shm) => shm,
            Err(err @ ShmError::PosixError { source, .. }) if source == io::Errno::ACCESS => {
                eprintln!("Skipping test_shm_open_size_mismatch: {err}");
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        match Shm::<Large, Opener>::open(path) {
            Err(ShmError::SizeMismatch {
                expected, actual, ..
            }) => {
                assert_eq!(expected, size_of::<Large>());
                assert_eq!(actual, size_of::<Counter>() as i64);
            }
            Err(e) => panic!("Expected SizeMismatch error, got: {e}"),
            Ok(_) => panic!("Expected SizeMismatch error, but open() succeeded"),
        }
        Ok(())
    }

    #[test]
    fn test_shm_open_missing_is_noent() {
        let path = test_path("missing");
        let _ = unlink(&path);
        let err = Shm::<Counter, Opener>::open(path).err().unwrap();
        assert_eq!(err.errno(), Some(io::Errno::NOENT));
    }

    #[test]
    fn test_validate_shm_path() {
        assert!(ShmPath::new("/valid-name_123").is_ok());
        assert!(matches!(
            ShmPath::new("no-slash"),
            Err(ShmError::InvalidPath { reason, .. }) if reason == "path must start with '/'"
        ));
        assert!(matches!(
            ShmPath::new("/foo/bar"),
            Err(ShmError::InvalidPath { reason, .. })
                if reason == "path must not contain additional '/' characters"
        ));
        assert!(ShmPath::new(format!("/{}", "a".repeat(254))).is_ok());
        assert!(matches!(
            ShmPath::new(format!("/{}", "a".repeat(255))),
            Err(ShmError::InvalidPath { reason, .. })
                if reason == "path length must be <= 255 bytes"
        ));
    }
}
