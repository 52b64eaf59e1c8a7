//! Process-shared mutex and condition variable.
//!
//! [`ProcessMutex<T>`] bundles a `pthread_mutex_t`, a `pthread_cond_t` and the
//! value they guard into one `repr(C)` block meant to live inside a [`Shm`]
//! mapping. Both primitives carry `PTHREAD_PROCESS_SHARED`; the mutex is also
//! robust, so a process dying while it holds the lock does not wedge the
//! others. The next locker gets the lock back with
//! [`ProcessMutexGuard::owner_died`] set.
//!
//! The condition variable is bound to `CLOCK_MONOTONIC`, so bounded waits are
//! immune to wall-clock jumps.
//!
//! ```text
//!  ┌──────────────────────── ProcessMutex<T> ───────────────────────┐
//!  │ pthread_mutex_t (pshared, robust) │ pthread_cond_t │ T (data)  │
//!  └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! [`Shm`]: super::shmem::Shm

use std::cell::UnsafeCell;
use std::io;
use std::mem::MaybeUninit;
use std::ops::{Deref, DerefMut};
use std::ptr::addr_of_mut;
use std::time::Duration;

use super::shmem::SharedMemorySafe;

/// A mutex + condition variable pair that works across processes.
#[repr(C)]
pub struct ProcessMutex<T> {
    mutex: UnsafeCell<libc::pthread_mutex_t>,
    cond: UnsafeCell<libc::pthread_cond_t>,
    data: UnsafeCell<T>,
}

// SAFETY: the pthread objects are designed for concurrent use from any thread
// or process, and `data` is only reachable through a guard holding the lock.
unsafe impl<T: Send> Send for ProcessMutex<T> {}

// SAFETY: see Send.
unsafe impl<T: Send> Sync for ProcessMutex<T> {}

// SAFETY: repr(C), no pointers, the pthread objects are initialized with
// PTHREAD_PROCESS_SHARED, and T is itself shareable.
unsafe impl<T: SharedMemorySafe> SharedMemorySafe for ProcessMutex<T> {}

/// Outcome of a bounded condition wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    /// Woken by a broadcast (or spuriously). Re-check the predicate.
    Notified,
    /// The wait timed out.
    TimedOut,
}

fn os_error(op: &'static str, rc: libc::c_int) -> io::Error {
    let err = io::Error::from_raw_os_error(rc);
    crate::trace::debug!(op, error = %err, "pthread call failed");
    err
}

fn check(op: &'static str, rc: libc::c_int) -> io::Result<()> {
    if rc == 0 { Ok(()) } else { Err(os_error(op, rc)) }
}

/// # Safety
///
/// `mutex` must point to writable, unshared memory for a `pthread_mutex_t`.
unsafe fn init_mutex(mutex: *mut libc::pthread_mutex_t) -> io::Result<()> {
    let mut attr = MaybeUninit::<libc::pthread_mutexattr_t>::uninit();
    // SAFETY: attr is initialized before use and destroyed on every path.
    unsafe {
        check("pthread_mutexattr_init", libc::pthread_mutexattr_init(attr.as_mut_ptr()))?;
        let rc = check(
            "pthread_mutexattr_setpshared",
            libc::pthread_mutexattr_setpshared(attr.as_mut_ptr(), libc::PTHREAD_PROCESS_SHARED),
        )
        .and_then(|()| {
            check(
                "pthread_mutexattr_setrobust",
                libc::pthread_mutexattr_setrobust(attr.as_mut_ptr(), libc::PTHREAD_MUTEX_ROBUST),
            )
        })
        .and_then(|()| check("pthread_mutex_init", libc::pthread_mutex_init(mutex, attr.as_ptr())));
        libc::pthread_mutexattr_destroy(attr.as_mut_ptr());
        rc
    }
}

/// # Safety
///
/// `cond` must point to writable, unshared memory for a `pthread_cond_t`.
unsafe fn init_cond(cond: *mut libc::pthread_cond_t) -> io::Result<()> {
    let mut attr = MaybeUninit::<libc::pthread_condattr_t>::uninit();
    // SAFETY: attr is initialized before use and destroyed on every path.
    unsafe {
        check("pthread_condattr_init", libc::pthread_condattr_init(attr.as_mut_ptr()))?;
        let rc = check(
            "pthread_condattr_setpshared",
            libc::pthread_condattr_setpshared(attr.as_mut_ptr(), libc::PTHREAD_PROCESS_SHARED),
        )
        .and_then(|()| {
            check(
                "pthread_condattr_setclock",
                libc::pthread_condattr_setclock(attr.as_mut_ptr(), libc::CLOCK_MONOTONIC),
            )
        })
        .and_then(|()| check("pthread_cond_init", libc::pthread_cond_init(cond, attr.as_ptr())));
        libc::pthread_condattr_destroy(attr.as_mut_ptr());
        rc
    }
}

impl<T> ProcessMutex<T> {
    /// Initializes the mutex, the condition variable and the value in place.
    ///
    /// Must run exactly once per mapping, before any other process can reach
    /// the memory. The object must never be moved afterwards.
    ///
    /// # Errors
    ///
    /// Any error returned by the `pthread_*attr_*` or `*_init` calls.
    pub fn init_in_place(slot: &mut MaybeUninit<Self>, value: T) -> io::Result<()> {
        let this = slot.as_mut_ptr();

        // SAFETY: `this` points to writable memory large enough for Self that
        // no one else can observe yet; field pointers are derived without
        // creating references to uninitialized data.
        unsafe {
            let mutex = UnsafeCell::raw_get(addr_of_mut!((*this).mutex));
            let cond = UnsafeCell::raw_get(addr_of_mut!((*this).cond));
            init_mutex(mutex)?;
            if let Err(err) = init_cond(cond) {
                libc::pthread_mutex_destroy(mutex);
                return Err(err);
            }
            UnsafeCell::raw_get(addr_of_mut!((*this).data)).write(value);
        }
        Ok(())
    }

    /// Blocks until the lock is held.
    ///
    /// If the previous owner died while holding the lock the mutex is marked
    /// consistent again and the returned guard reports
    /// [`owner_died`](ProcessMutexGuard::owner_died).
    ///
    /// # Errors
    ///
    /// Any other error from `pthread_mutex_lock` (e.g. `ENOTRECOVERABLE`).
    pub fn lock(&self) -> io::Result<ProcessMutexGuard<'_, T>> {
        // SAFETY: the mutex was initialized by init_in_place.
        let rc = unsafe { libc::pthread_mutex_lock(self.mutex.get()) };
        let owner_died = match rc {
            0 => false,
            libc::EOWNERDEAD => {
                if let Err(err) = self.make_consistent() {
                    // SAFETY: EOWNERDEAD still hands us the lock.
                    unsafe { libc::pthread_mutex_unlock(self.mutex.get()) };
                    return Err(err);
                }
                true
            }
            rc => return Err(os_error("pthread_mutex_lock", rc)),
        };
        Ok(ProcessMutexGuard {
            lock: self,
            owner_died,
        })
    }

    fn make_consistent(&self) -> io::Result<()> {
        // SAFETY: called only while holding the lock after EOWNERDEAD.
        check("pthread_mutex_consistent", unsafe {
            libc::pthread_mutex_consistent(self.mutex.get())
        })
    }
}

/// RAII guard for [`ProcessMutex`]. Unlocks on drop.
pub struct ProcessMutexGuard<'a, T> {
    lock: &'a ProcessMutex<T>,
    owner_died: bool,
}

impl<T> ProcessMutexGuard<'_, T> {
    /// `true` once this guard has recovered the lock from a dead owner.
    ///
    /// The guarded value may then be half-updated.
    #[must_use]
    pub fn owner_died(&self) -> bool {
        self.owner_died
    }

    /// Atomically releases the lock and waits for a broadcast or `timeout`.
    ///
    /// The lock is held again when this returns. Spurious wakeups are
    /// reported as [`WaitResult::Notified`]; callers re-check their predicate.
    ///
    /// # Errors
    ///
    /// Any error from `clock_gettime` or `pthread_cond_timedwait` other than
    /// `ETIMEDOUT`.
    pub fn wait_timeout(&mut self, timeout: Duration) -> io::Result<WaitResult> {
        let deadline = monotonic_deadline(timeout)?;
        // SAFETY: both objects were initialized by init_in_place and this
        // guard holds the mutex.
        let rc = unsafe {
            libc::pthread_cond_timedwait(self.lock.cond.get(), self.lock.mutex.get(), &deadline)
        };
        match rc {
            0 => Ok(WaitResult::Notified),
            libc::ETIMEDOUT => Ok(WaitResult::TimedOut),
            libc::EOWNERDEAD => {
                self.lock.make_consistent()?;
                self.owner_died = true;
                Ok(WaitResult::Notified)
            }
            rc => Err(os_error("pthread_cond_timedwait", rc)),
        }
    }

    /// Wakes every waiter on the condition variable.
    pub fn notify_all(&self) {
        // SAFETY: the condition variable was initialized by init_in_place.
        unsafe {
            libc::pthread_cond_broadcast(self.lock.cond.get());
        }
    }
}

impl<T> Deref for ProcessMutexGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: the guard holds the lock.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for ProcessMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard holds the lock exclusively.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for ProcessMutexGuard<'_, T> {
    fn drop(&mut self) {
        // SAFETY: the guard holds the lock.
        unsafe {
            libc::pthread_mutex_unlock(self.lock.mutex.get());
        }
    }
}

fn monotonic_deadline(timeout: Duration) -> io::Result<libc::timespec> {
    let mut now = MaybeUninit::<libc::timespec>::uninit();
    // SAFETY: clock_gettime writes a full timespec on success.
    if unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, now.as_mut_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: initialized by the successful call above.
    let now = unsafe { now.assume_init() };
    Ok(add_duration(now, timeout))
}

/// Adds `d` to `ts`, normalizing nanoseconds and saturating on overflow.
pub(crate) fn add_duration(ts: libc::timespec, d: Duration) -> libc::timespec {
    let mut sec = ts.tv_sec.saturating_add(d.as_secs().min(i64::MAX as u64) as libc::time_t);
    let mut nsec = ts.tv_nsec + d.subsec_nanos() as libc::c_long;
    if nsec >= 1_000_000_000 {
        nsec -= 1_000_000_000;
        sec = sec.saturating_add(1);
    }
    libc::timespec {
        tv_sec: sec,
        tv_nsec: nsec,
    }
}
