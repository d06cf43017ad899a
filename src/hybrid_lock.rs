//! The hybrid spin-then-block semaphore (component A).
//!
//! Spins on an atomic counter living in a named POSIX shared-memory region
//! for a bounded number of attempts, then falls back to blocking on a named
//! kernel semaphore used purely as a doorbell: the counter, not the kernel
//! semaphore's own internal value, is always the source of truth for how
//! many permits are available. This mirrors
//! `original_source/network_tools/hybrid_lock/tests.py`'s `HybridSpinSemaphore`
//! (`CONNECT_OR_CREATE` / `CONNECT_TO_EXISTING` / `CREATE_NEW_OVERWRITE` /
//! `CREATE_NEW_EXCLUSIVE`), reimplemented with Rust atomics in place of the
//! original's C extension.

use std::ffi::CString;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::{Duration, Instant};

use crate::error::LockError;
use crate::shm::{OpenMode, SharedRegion};

/// Bound on the userspace spin phase before falling back to the kernel.
/// Within the ~1000-10,000 range the design allows; short critical
/// sections (a memcpy of a few KB) should resolve well inside this.
const SPIN_ATTEMPTS: u32 = 4000;

/// How a lock should be obtained, mirroring the four constructor modes
/// the original exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    ConnectOrCreate,
    ConnectExisting,
    CreateOverwrite,
    CreateExclusive,
}

impl From<CreateMode> for OpenMode {
    fn from(mode: CreateMode) -> Self {
        match mode {
            CreateMode::ConnectOrCreate => OpenMode::ConnectOrCreate,
            CreateMode::ConnectExisting => OpenMode::ConnectExisting,
            CreateMode::CreateOverwrite => OpenMode::CreateOverwrite,
            CreateMode::CreateExclusive => OpenMode::CreateExclusive,
        }
    }
}

/// Layout of the shared counter/destroyed/waiters triple the spec
/// describes as a hybrid lock's state. `#[repr(C)]` so every process
/// mapping the same named region agrees on field offsets.
#[repr(C)]
struct RawLockState {
    counter: AtomicI32,
    destroyed: AtomicI32,
    waiters: AtomicI32,
}

struct NamedSemaphore {
    name: CString,
    handle: *mut libc::sem_t,
}

// The semaphore handle is a kernel-managed resource safely shared across
// threads within this process; cross-process sharing goes through the
// kernel's own name table, not this pointer.
unsafe impl Send for NamedSemaphore {}
unsafe impl Sync for NamedSemaphore {}

impl NamedSemaphore {
    fn open(name: &str, mode: CreateMode, initial_value: u32) -> Result<Self, LockError> {
        let full = if name.starts_with('/') {
            name.to_string()
        } else {
            format!("/{name}")
        };
        let cname = CString::new(full).map_err(|e| LockError::Os(e.into()))?;

        let handle = unsafe {
            match mode {
                CreateMode::ConnectExisting => libc::sem_open(cname.as_ptr(), 0),
                CreateMode::CreateExclusive => libc::sem_open(
                    cname.as_ptr(),
                    libc::O_CREAT | libc::O_EXCL,
                    0o600u32,
                    initial_value,
                ),
                CreateMode::CreateOverwrite => {
                    libc::sem_unlink(cname.as_ptr());
                    libc::sem_open(
                        cname.as_ptr(),
                        libc::O_CREAT | libc::O_EXCL,
                        0o600u32,
                        initial_value,
                    )
                }
                CreateMode::ConnectOrCreate => {
                    libc::sem_open(cname.as_ptr(), libc::O_CREAT, 0o600u32, initial_value)
                }
            }
        };

        if handle == libc::SEM_FAILED {
            let err = std::io::Error::last_os_error();
            return Err(match (mode, err.raw_os_error()) {
                (CreateMode::CreateExclusive, Some(libc::EEXIST)) => {
                    LockError::AlreadyExists(name.to_string())
                }
                (CreateMode::ConnectExisting, Some(libc::ENOENT)) => {
                    LockError::NoSuchSemaphore(name.to_string())
                }
                _ => LockError::Os(err),
            });
        }

        Ok(Self { name: cname, handle })
    }

    /// Block until posted or `deadline` elapses. `None` deadline blocks
    /// indefinitely.
    fn wait(&self, deadline: Option<Instant>) -> Result<(), LockError> {
        match deadline {
            None => {
                if unsafe { libc::sem_wait(self.handle) } != 0 {
                    return Err(LockError::Os(std::io::Error::last_os_error()));
                }
                Ok(())
            }
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                let now = unsafe {
                    let mut ts = std::mem::zeroed::<libc::timespec>();
                    libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts);
                    ts
                };
                let mut ts = now;
                ts.tv_sec += remaining.as_secs() as libc::time_t;
                ts.tv_nsec += remaining.subsec_nanos() as libc::c_long;
                if ts.tv_nsec >= 1_000_000_000 {
                    ts.tv_sec += 1;
                    ts.tv_nsec -= 1_000_000_000;
                }

                if unsafe { libc::sem_timedwait(self.handle, &ts) } != 0 {
                    let err = std::io::Error::last_os_error();
                    if err.raw_os_error() == Some(libc::ETIMEDOUT) {
                        return Err(LockError::TimedOut(String::new()));
                    }
                    return Err(LockError::Os(err));
                }
                Ok(())
            }
        }
    }

    fn post(&self) {
        unsafe { libc::sem_post(self.handle) };
    }

    fn close(&self) {
        unsafe { libc::sem_close(self.handle) };
    }

    fn unlink(&self) {
        unsafe { libc::sem_unlink(self.name.as_ptr()) };
    }
}

impl Drop for NamedSemaphore {
    fn drop(&mut self) {
        self.close();
    }
}

/// A named, reference-countable shared-memory semaphore that spins before
/// blocking. See the module docs and spec `4.A` for the full contract.
pub struct HybridLock {
    name: String,
    region: SharedRegion,
    doorbell: NamedSemaphore,
}

fn state_name(name: &str) -> String {
    format!("{name}_state")
}

fn doorbell_name(name: &str) -> String {
    format!("{name}_doorbell")
}

impl HybridLock {
    /// Open (per `mode`) a hybrid lock named `name`. `initial_value` is
    /// only used when this call creates the underlying resources.
    pub fn open(name: &str, mode: CreateMode, initial_value: i32) -> Result<Self, LockError> {
        let region = SharedRegion::open(
            &state_name(name),
            std::mem::size_of::<RawLockState>(),
            mode.into(),
        )
        .map_err(|e| match mode {
            CreateMode::CreateExclusive if e.raw_os_error() == Some(libc::EEXIST) => {
                LockError::AlreadyExists(name.to_string())
            }
            _ if e.raw_os_error() == Some(libc::ENOENT) => {
                LockError::NoSuchSemaphore(name.to_string())
            }
            other => LockError::Os(other),
        })?;

        let doorbell = NamedSemaphore::open(&doorbell_name(name), mode, 0)?;

        let lock = Self {
            name: name.to_string(),
            region,
            doorbell,
        };

        if lock.region.created {
            lock.raw().counter.store(initial_value, Ordering::SeqCst);
            lock.raw().destroyed.store(0, Ordering::SeqCst);
            lock.raw().waiters.store(0, Ordering::SeqCst);
        }

        Ok(lock)
    }

    fn raw(&self) -> &RawLockState {
        unsafe { &*(self.region.as_ptr() as *const RawLockState) }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> i32 {
        self.raw().counter.load(Ordering::Acquire)
    }

    pub fn destroyed(&self) -> bool {
        self.raw().destroyed.load(Ordering::Acquire) != 0
    }

    fn try_acquire(&self) -> bool {
        let raw = self.raw();
        let mut current = raw.counter.load(Ordering::Acquire);
        loop {
            if current < 1 {
                return false;
            }
            match raw.counter.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    /// Acquire one permit. `timeout` of `None` blocks indefinitely;
    /// `Some(Duration::ZERO)` attempts once and returns immediately.
    ///
    /// The timeout is a hard bound across both the spin and block phases:
    /// time already spent spinning is deducted from the budget handed to
    /// the kernel wait, rather than each phase getting its own full
    /// timeout (spec.md's open question on this is resolved in favor of
    /// the hard bound, since a per-phase bound would let a contended lock
    /// take up to `2 * timeout`).
    pub fn lock(&self, timeout: Option<Duration>, spin: bool) -> Result<(), LockError> {
        let start = Instant::now();
        let deadline = timeout.map(|t| start + t);

        if spin {
            for _ in 0..SPIN_ATTEMPTS {
                if self.destroyed() {
                    return Err(LockError::Destroyed(self.name.clone()));
                }
                if self.try_acquire() {
                    return Ok(());
                }
                std::hint::spin_loop();
            }
        }

        if let Some(deadline) = deadline
            && Instant::now() >= deadline
        {
            return Err(LockError::TimedOut(self.name.clone()));
        }

        self.raw().waiters.fetch_add(1, Ordering::AcqRel);
        let result = loop {
            if self.destroyed() {
                break Err(LockError::Destroyed(self.name.clone()));
            }
            if self.try_acquire() {
                break Ok(());
            }
            if let Err(e) = self.doorbell.wait(deadline) {
                if matches!(e, LockError::TimedOut(_)) {
                    break Err(LockError::TimedOut(self.name.clone()));
                }
                break Err(e);
            }
        };
        self.raw().waiters.fetch_sub(1, Ordering::AcqRel);
        result
    }

    /// Release one permit. If there are blocked waiters, wakes exactly
    /// one via the doorbell semaphore. The counter increment happens
    /// (`Ordering::Release`) strictly before the post, so a woken waiter
    /// observing the post is guaranteed to see the new counter value.
    pub fn unlock(&self) {
        let raw = self.raw();
        raw.counter.fetch_add(1, Ordering::Release);
        if raw.waiters.load(Ordering::Acquire) > 0 {
            self.doorbell.post();
        }
    }

    /// Mark the lock destroyed, wake every current waiter, and unlink the
    /// named OS resources. Idempotent from the caller's perspective: a
    /// second `destroy()` observes `destroyed() == true` and is a no-op
    /// beyond re-unlinking (which tolerates `ENOENT`).
    pub fn destroy(&self) {
        self.raw().destroyed.store(1, Ordering::SeqCst);
        let waiting = self.raw().waiters.load(Ordering::Acquire);
        for _ in 0..waiting.max(0) {
            self.doorbell.post();
        }
        // Post a few extra times in case a waiter was between its destroyed
        // check and entering the kernel wait when the count above was taken.
        for _ in 0..4 {
            self.doorbell.post();
        }
        self.doorbell.unlink();
        let _ = SharedRegion::unlink(&state_name(&self.name));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn unique_name(tag: &str) -> String {
        format!("shmrpc_lock_test_{tag}_{}", std::process::id())
    }

    fn cleanup(name: &str) {
        let _ = SharedRegion::unlink(&state_name(name));
        let cname = CString::new(format!("/{}", doorbell_name(name))).unwrap();
        unsafe { libc::sem_unlink(cname.as_ptr()) };
    }

    #[test]
    fn create_overwrite_then_value_reflects_locking() {
        let name = unique_name("value");
        cleanup(&name);

        let lock = HybridLock::open(&name, CreateMode::CreateOverwrite, 1).unwrap();
        assert_eq!(lock.value(), 1);
        lock.lock(Some(Duration::from_secs(1)), true).unwrap();
        assert_eq!(lock.value(), 0);
        lock.unlock();
        assert_eq!(lock.value(), 1);

        lock.destroy();
        cleanup(&name);
    }

    #[test]
    fn create_exclusive_then_duplicate_fails() {
        let name = unique_name("exclusive");
        cleanup(&name);

        let first = HybridLock::open(&name, CreateMode::CreateExclusive, 1).unwrap();
        let second = HybridLock::open(&name, CreateMode::CreateExclusive, 1);
        assert!(matches!(second, Err(LockError::AlreadyExists(_))));

        first.destroy();
        cleanup(&name);
    }

    #[test]
    fn connect_existing_sees_same_value() {
        let name = unique_name("connect");
        cleanup(&name);

        let a = HybridLock::open(&name, CreateMode::CreateOverwrite, 1).unwrap();
        let b = HybridLock::open(&name, CreateMode::ConnectExisting, 0 /* ignored */).unwrap();
        assert_eq!(a.value(), b.value());

        a.lock(None, true).unwrap();
        assert_eq!(b.value(), 0);
        a.unlock();

        a.destroy();
        cleanup(&name);
    }

    #[test]
    fn connect_existing_fails_when_absent() {
        let name = unique_name("absent");
        cleanup(&name);
        let result = HybridLock::open(&name, CreateMode::ConnectExisting, 0);
        assert!(matches!(result, Err(LockError::NoSuchSemaphore(_))));
    }

    #[test]
    fn zero_timeout_on_held_lock_times_out() {
        let name = unique_name("timeout");
        cleanup(&name);

        let lock = HybridLock::open(&name, CreateMode::CreateOverwrite, 1).unwrap();
        lock.lock(None, true).unwrap();

        let result = lock.lock(Some(Duration::ZERO), false);
        assert!(matches!(result, Err(LockError::TimedOut(_))));
        assert_eq!(lock.value(), 0, "state must not change on timeout");

        lock.destroy();
        cleanup(&name);
    }

    #[test]
    fn destroy_wakes_blocked_waiter() {
        let name = unique_name("destroy");
        cleanup(&name);

        let lock = Arc::new(HybridLock::open(&name, CreateMode::CreateOverwrite, 0).unwrap());
        let waiter = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || lock.lock(Some(Duration::from_secs(5)), true))
        };

        thread::sleep(Duration::from_millis(50));
        lock.destroy();

        let result = waiter.join().unwrap();
        assert!(matches!(result, Err(LockError::Destroyed(_))));
        cleanup(&name);
    }

    #[test]
    fn contended_lock_hands_off_exactly_once() {
        let name = unique_name("contended");
        cleanup(&name);

        let lock = Arc::new(HybridLock::open(&name, CreateMode::CreateOverwrite, 1).unwrap());
        lock.lock(None, true).unwrap();

        let waiter = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || lock.lock(Some(Duration::from_secs(5)), true))
        };
        thread::sleep(Duration::from_millis(50));
        lock.unlock();

        assert!(waiter.join().unwrap().is_ok());
        assert_eq!(lock.value(), 0);

        lock.unlock();
        lock.destroy();
        cleanup(&name);
    }
}
