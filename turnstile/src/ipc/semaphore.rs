//! Named POSIX counting semaphores.
//!
//! A [`NamedSemaphore<Creator>`] is created with `O_CREAT | O_EXCL` and
//! unlinked when dropped. Parties never open these by name; the coordinator
//! owns both tokens. Names follow the same rules as shared memory names
//! ([`ShmPath`]).
//!
//! Waits are always bounded: [`NamedSemaphore::wait_timeout`] is the only way
//! to take a token, so a waiter can look at other state between attempts.

use std::ffi::CString;
use std::io;
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::ptr::NonNull;
use std::time::Duration;

use super::pshared::add_duration;
use super::shmem::ShmPath;
use super::{Creator, Ownership};

/// Handle to a named semaphore.
#[derive(Debug)]
pub struct NamedSemaphore<Mode: Ownership> {
    sem: NonNull<libc::sem_t>,
    name: ShmPath,
    _mode: PhantomData<Mode>,
}

// SAFETY: sem_t operations are thread-safe; the handle is just a pointer to a
// kernel-backed mapping that stays valid until sem_close.
unsafe impl<Mode: Ownership> Send for NamedSemaphore<Mode> {}

// SAFETY: see Send.
unsafe impl<Mode: Ownership> Sync for NamedSemaphore<Mode> {}

fn c_name(name: &ShmPath) -> io::Result<CString> {
    CString::new(name.as_ref()).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

/// Removes a semaphore name, ignoring "does not exist".
///
/// # Errors
///
/// Any errno other than `ENOENT`.
pub fn unlink(name: &ShmPath) -> io::Result<()> {
    let c = c_name(name)?;
    // SAFETY: c is a valid NUL-terminated string.
    if unsafe { libc::sem_unlink(c.as_ptr()) } == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ENOENT) {
        Ok(())
    } else {
        Err(err)
    }
}

impl NamedSemaphore<Creator> {
    /// Creates a new semaphore holding `initial` tokens.
    ///
    /// # Errors
    ///
    /// `EEXIST` if the name is taken, `EACCES` and friends otherwise.
    pub fn create(name: ShmPath, initial: u32) -> io::Result<Self> {
        let c = c_name(&name)?;
        // SAFETY: variadic sem_open with O_CREAT takes (mode_t, unsigned int),
        // both promoted to c_uint.
        let sem = unsafe {
            libc::sem_open(
                c.as_ptr(),
                libc::O_CREAT | libc::O_EXCL,
                0o600 as libc::c_uint,
                initial as libc::c_uint,
            )
        };
        Self::from_raw(sem, name)
    }
}

impl<Mode: Ownership> NamedSemaphore<Mode> {
    fn from_raw(sem: *mut libc::sem_t, name: ShmPath) -> io::Result<Self> {
        if sem == libc::SEM_FAILED {
            return Err(io::Error::last_os_error());
        }
        let sem = NonNull::new(sem).ok_or_else(|| io::Error::from(io::ErrorKind::Other))?;
        Ok(Self {
            sem,
            name,
            _mode: PhantomData,
        })
    }

    /// The semaphore's name.
    #[must_use]
    pub fn name(&self) -> &ShmPath {
        &self.name
    }

    /// Adds one token, waking one waiter if any.
    ///
    /// # Errors
    ///
    /// `EOVERFLOW` if the count would exceed `SEM_VALUE_MAX`.
    pub fn post(&self) -> io::Result<()> {
        // SAFETY: sem is valid until Drop.
        if unsafe { libc::sem_post(self.sem.as_ptr()) } == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    /// Takes one token, waiting at most `timeout`.
    ///
    /// Returns `Ok(true)` if a token was taken and `Ok(false)` on timeout.
    /// Signal interruptions are retried against the same deadline.
    ///
    /// # Errors
    ///
    /// Any failure of `clock_gettime` or `sem_timedwait` other than
    /// `ETIMEDOUT`/`EINTR`.
    pub fn wait_timeout(&self, timeout: Duration) -> io::Result<bool> {
        let mut now = MaybeUninit::<libc::timespec>::uninit();
        // SAFETY: clock_gettime writes a full timespec on success.
        if unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, now.as_mut_ptr()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: initialized by the successful call above.
        let deadline = add_duration(unsafe { now.assume_init() }, timeout);

        loop {
            // SAFETY: sem is valid until Drop; deadline is a valid timespec.
            if unsafe { libc::sem_timedwait(self.sem.as_ptr(), &deadline) } == 0 {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::ETIMEDOUT) => return Ok(false),
                Some(libc::EINTR) => continue,
                _ => return Err(err),
            }
        }
    }
}

impl<Mode: Ownership> Drop for NamedSemaphore<Mode> {
    fn drop(&mut self) {
        // SAFETY: sem came from a successful sem_open and is closed once.
        unsafe {
            libc::sem_close(self.sem.as_ptr());
        }
        if Mode::SHOULD_UNLINK {
            let _ = unlink(&self.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static COUNTER: AtomicUsize = AtomicUsize::new(0);

    fn unique_name() -> ShmPath {
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        ShmPath::new(format!("/turnstile-sem-test-{}-{}", std::process::id(), n)).unwrap()
    }

    fn create_or_skip(name: &ShmPath, initial: u32) -> Option<NamedSemaphore<Creator>> {
        match NamedSemaphore::<Creator>::create(name.clone(), initial) {
            Ok(sem) => Some(sem),
            Err(e) if e.raw_os_error() == Some(libc::EACCES) => {
                eprintln!("Skipping semaphore test: {e}");
                None
            }
            Err(e) => panic!("sem_open failed: {e}"),
        }
    }

    #[test]
    fn test_post_then_wait() {
        let name = unique_name();
        let Some(sem) = create_or_skip(&name, 0) else {
            return;
        };
        sem.post().unwrap();
        assert!(sem.wait_timeout(Duration::from_millis(10)).unwrap());
        assert!(!sem.wait_timeout(Duration::from_millis(10)).unwrap());
    }

    #[test]
    fn test_wait_times_out_without_token() {
        let name = unique_name();
        let Some(sem) = create_or_skip(&name, 0) else {
            return;
        };
        let start = std::time::Instant::now();
        assert!(!sem.wait_timeout(Duration::from_millis(30)).unwrap());
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_creator_unlinks_on_drop() {
        let name = unique_name();
        let Some(sem) = create_or_skip(&name, 1) else {
            return;
        };
        assert!(sem.wait_timeout(Duration::from_millis(10)).unwrap());
        drop(sem);

        // The name is free again and the new semaphore starts from scratch.
        let again = NamedSemaphore::<Creator>::create(name.clone(), 0).unwrap();
        assert!(!again.wait_timeout(Duration::from_millis(10)).unwrap());
        drop(again);
        unlink(&name).unwrap();
    }

    #[test]
    fn test_create_existing_name_fails() {
        let name = unique_name();
        let Some(_sem) = create_or_skip(&name, 0) else {
            return;
        };
        let err = NamedSemaphore::<Creator>::create(name, 0).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EEXIST));
    }

    #[test]
    fn test_wait_wakes_on_post_from_other_thread() {
        let name = unique_name();
        let Some(sem) = create_or_skip(&name, 0) else {
            return;
        };
        std::thread::scope(|s| {
            s.spawn(|| {
                std::thread::sleep(Duration::from_millis(20));
                sem.post().unwrap();
            });
            assert!(sem.wait_timeout(Duration::from_secs(5)).unwrap());
        });
    }
}
