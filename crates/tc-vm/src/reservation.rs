//! The reservation engine.
//!
//! One process-wide reservation slot implements load-linked /
//! store-conditional semantics for the guest CPUs: acquiring a
//! reservation flips the target page's user view to read-only, so any
//! conflicting write by another thread faults into the query path and
//! invalidates the slot. All slot changes happen under the custom
//! [`ReservationMutex`]; waiter notifications are issued only after
//! that lock is dropped.

use std::cell::Cell;
use std::num::NonZeroU64;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{fence, AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::backing::Protection;
use crate::constants::{MAX_RESERVATION_SIZE, PAGE_SIZE};
use crate::error::{VmError, VmResult};
use crate::pages::PageFlags;
use crate::vm::{VmContext, VmState};

/// Owner value meaning "unowned".
const INVALID_OWNER: u64 = 0;

thread_local! {
    static THREAD_TOKEN: NonZeroU64 = {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        // the counter starts at 1 and only grows
        NonZeroU64::new(NEXT.fetch_add(1, Ordering::Relaxed)).unwrap_or(NonZeroU64::MIN)
    };

    static DID_BREAK: Cell<bool> = const { Cell::new(false) };
}

/// Opaque per-thread identity, comparable for equality only.
///
/// Used as the owner of the reservation slot and of the custom mutex;
/// zero is reserved for "no owner".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadToken(NonZeroU64);

impl ThreadToken {
    /// Token of the calling thread.
    pub fn current() -> Self {
        Self(THREAD_TOKEN.with(|t| *t))
    }

    #[inline]
    pub(crate) fn get(self) -> u64 {
        self.0.get()
    }
}

/// Whether the last reservation-layer call on this thread broke an
/// existing reservation. CPU backends use this to derive
/// store-conditional result codes.
pub fn did_break_reservation() -> bool {
    DID_BREAK.with(|c| c.get())
}

fn set_did_break(value: bool) {
    DID_BREAK.with(|c| c.set(value));
}

/// Self-identifying mutex serializing all reservation, allocation and
/// protection-change paths.
///
/// Acquisition CAS-loops on the owner word; a contended thread parks
/// on a condition variable with a 1 ms timeout between retries.
/// Re-entry by the owning thread is reported as a deadlock instead of
/// hanging.
pub struct ReservationMutex<T> {
    owner: AtomicU64,
    fallback: Mutex<()>,
    cond: Condvar,
    do_notify: AtomicBool,
    data: std::cell::UnsafeCell<T>,
}

unsafe impl<T: Send> Send for ReservationMutex<T> {}
unsafe impl<T: Send> Sync for ReservationMutex<T> {}

impl<T> ReservationMutex<T> {
    pub fn new(data: T) -> Self {
        Self {
            owner: AtomicU64::new(INVALID_OWNER),
            fallback: Mutex::new(()),
            cond: Condvar::new(),
            do_notify: AtomicBool::new(false),
            data: std::cell::UnsafeCell::new(data),
        }
    }

    /// Acquire the lock for the calling thread.
    pub fn lock(&self) -> VmResult<ReservationGuard<'_, T>> {
        let me = ThreadToken::current().get();
        let mut slow: Option<MutexGuard<'_, ()>> = None;

        while self
            .owner
            .compare_exchange(INVALID_OWNER, me, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            if self.owner.load(Ordering::Relaxed) == me {
                return Err(VmError::Deadlock);
            }

            match slow.as_mut() {
                None => slow = Some(self.fallback.lock()),
                Some(guard) => {
                    let _ = self.cond.wait_for(guard, Duration::from_millis(1));
                }
            }
        }

        drop(slow);
        self.do_notify.store(true, Ordering::Relaxed);

        Ok(ReservationGuard { mutex: self, me })
    }
}

/// RAII guard for [`ReservationMutex`]; releases and signals one
/// contended waiter on drop.
pub struct ReservationGuard<'a, T> {
    mutex: &'a ReservationMutex<T>,
    me: u64,
}

impl<T> Deref for ReservationGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for ReservationGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for ReservationGuard<'_, T> {
    fn drop(&mut self) {
        if self
            .mutex
            .owner
            .compare_exchange(self.me, INVALID_OWNER, Ordering::Release, Ordering::Relaxed)
            .is_err()
        {
            // Only the owning thread can hold a guard.
            panic!("reservation lock released by a thread that does not own it");
        }

        if self.mutex.do_notify.load(Ordering::Relaxed) {
            self.mutex.cond.notify_one();
        }
    }
}

/// Validate a reservation/waiter range: a power-of-two size within one
/// page, with `addr` aligned to it.
pub(crate) fn validate_range(addr: u32, size: u32) -> VmResult<()> {
    if size == 0
        || addr == 0
        || size > MAX_RESERVATION_SIZE
        || !size.is_power_of_two()
        || addr & (size - 1) != 0
    {
        return Err(VmError::InvalidArgs { addr, size });
    }
    Ok(())
}

impl VmContext {
    /// Reprotect the reserved page: read-only while a reservation is
    /// held, no-access around a privileged store.
    fn reservation_set_protection(&self, addr: u32, no_access: bool) -> VmResult<()> {
        let prot = if no_access {
            Protection::None
        } else {
            Protection::ReadOnly
        };
        self.backing
            .protect_user(addr & !(PAGE_SIZE - 1), PAGE_SIZE, prot)
            .map_err(|source| VmError::Protection { addr, source })
    }

    /// Break the current reservation if it lies on the same page as
    /// `addr`; restores read-write access and clears the slot.
    /// Returns whether a reservation was broken.
    pub(crate) fn reservation_break_locked(
        &self,
        state: &mut VmState,
        addr: u32,
    ) -> VmResult<bool> {
        if state.rsize != 0 && state.raddr >> 12 == addr >> 12 {
            self.backing
                .protect_user(addr & !(PAGE_SIZE - 1), PAGE_SIZE, Protection::ReadWrite)
                .map_err(|source| VmError::Protection { addr, source })?;

            state.raddr = 0;
            state.rsize = 0;
            self.res_owner.store(INVALID_OWNER, Ordering::Release);

            return Ok(true);
        }

        Ok(false)
    }

    /// Break any reservation on the page containing `addr` and notify
    /// waiters over the former reservation range.
    pub fn reservation_break(&self, addr: u32) -> VmResult<()> {
        let mut state = self.state.lock()?;

        let raddr = state.raddr;
        let rsize = state.rsize;

        let broke = self.reservation_break_locked(&mut state, addr)?;
        set_did_break(broke);

        drop(state);
        if broke {
            self.waiters.notify_range(raddr, rsize);
        }
        Ok(())
    }

    /// Load-linked: claim `[addr, addr + dst.len())` for the calling
    /// thread and copy its current contents into `dst`.
    ///
    /// Any other live reservation is broken first. The target page
    /// must be writable, allocated, and reservation-eligible.
    pub fn reservation_acquire(&self, dst: &mut [u8], addr: u32) -> VmResult<()> {
        let size = dst.len() as u32;
        let mut state = self.state.lock()?;

        validate_range(addr, size)?;

        let flags = self.pages.load((addr >> 12) as usize);
        if !flags.contains(PageFlags::WRITABLE | PageFlags::ALLOCATED)
            || flags.contains(PageFlags::NO_RESERVATIONS)
        {
            return Err(VmError::InvalidPageFlags {
                addr,
                size,
                flags: flags.bits(),
            });
        }

        // break any previous reservation, wherever it lives
        let broke = if self.res_owner.load(Ordering::Relaxed) != INVALID_OWNER {
            let raddr = state.raddr;
            self.reservation_break_locked(&mut state, raddr)?
        } else {
            false
        };
        set_did_break(broke);

        // make conflicting writes fault until the reservation dies
        self.reservation_set_protection(addr, false)?;

        state.raddr = addr;
        state.rsize = size;
        self.res_owner
            .store(ThreadToken::current().get(), Ordering::Release);

        fence(Ordering::SeqCst);

        // the page is still readable through the user view
        unsafe { dst.copy_from_slice(self.backing.user_slice(addr, dst.len())) };

        Ok(())
    }

    /// Store-conditional: write `data` at `addr` if the calling thread
    /// still owns a reservation at exactly `(addr, data.len())`.
    ///
    /// Returns `Ok(false)` when the reservation was lost.
    pub fn reservation_update(&self, addr: u32, data: &[u8]) -> VmResult<bool> {
        let size = data.len() as u32;
        let mut state = self.state.lock()?;

        validate_range(addr, size)?;

        if self.res_owner.load(Ordering::Relaxed) != ThreadToken::current().get()
            || state.raddr != addr
            || state.rsize != size
        {
            // atomic update failed
            return Ok(false);
        }

        // nothing may observe the mid-write state
        self.reservation_set_protection(addr, true)?;

        unsafe {
            self.backing
                .priv_slice_mut(addr, data.len())
                .copy_from_slice(data)
        };

        self.reservation_break_locked(&mut state, addr)?;

        drop(state);
        self.waiters.notify_range(addr, size);

        Ok(true)
    }

    /// Fault-path hook for a native access at `[addr, addr + size)`.
    ///
    /// Returns `Ok(false)` if the address is unmapped. For a write on
    /// the reserved page, `callback` decides whether the access
    /// proceeds; if it does and the ranges truly overlap, the
    /// reservation is broken and waiters are notified.
    pub fn reservation_query(
        &self,
        addr: u32,
        size: u32,
        is_writing: bool,
        callback: impl FnOnce() -> bool,
    ) -> VmResult<bool> {
        let mut state = self.state.lock()?;

        if !self.check_addr(addr, 1) {
            return Ok(false);
        }

        if is_writing && state.rsize != 0 && state.raddr >> 12 == addr >> 12 {
            let result = callback();

            let overlaps = size != 0
                && addr as u64 + size as u64 - 1 >= state.raddr as u64
                && state.raddr as u64 + state.rsize as u64 - 1 >= addr as u64;

            if result && overlaps {
                let raddr = state.raddr;
                let rsize = state.rsize;

                let broke = self.reservation_break_locked(&mut state, addr)?;
                set_did_break(broke);

                if broke {
                    drop(state);
                    self.waiters.notify_range(raddr, rsize);
                }
            }

            return Ok(result);
        }

        Ok(true)
    }

    /// Lock-free check whether `current` owns the live reservation.
    ///
    /// The answer may be stale; `reservation_update` re-checks under
    /// the lock before committing anything.
    pub fn reservation_test(&self, current: ThreadToken) -> bool {
        self.res_owner.load(Ordering::Acquire) == current.get()
    }

    /// Drop the calling thread's reservation, if it still holds one.
    pub fn reservation_free(&self) -> VmResult<()> {
        let me = ThreadToken::current();

        if !self.reservation_test(me) {
            return Ok(());
        }

        let mut state = self.state.lock()?;

        if self.res_owner.load(Ordering::Relaxed) == me.get() {
            let raddr = state.raddr;
            let broke = self.reservation_break_locked(&mut state, raddr)?;
            set_did_break(broke);
        }

        Ok(())
    }

    /// Perform an arbitrary guest-atomic operation on
    /// `[addr, addr + size)`.
    ///
    /// Breaks any foreign reservation, claims the slot, blocks all
    /// access to the page, then hands `proc` the privileged bytes of
    /// the range. The slot is released and waiters notified afterwards.
    pub fn reservation_op(
        &self,
        addr: u32,
        size: u32,
        proc: impl FnOnce(&mut [u8]),
    ) -> VmResult<()> {
        let mut state = self.state.lock()?;

        validate_range(addr, size)?;

        set_did_break(false);

        let me = ThreadToken::current().get();

        // check and possibly break a previous reservation
        if self.res_owner.load(Ordering::Relaxed) != me
            || state.raddr != addr
            || state.rsize != size
        {
            if self.res_owner.load(Ordering::Relaxed) != INVALID_OWNER {
                let raddr = state.raddr;
                self.reservation_break_locked(&mut state, raddr)?;
            }
            set_did_break(true);
        }

        self.reservation_set_protection(addr, true)?;

        state.raddr = addr;
        state.rsize = size;
        self.res_owner.store(me, Ordering::Release);

        fence(Ordering::SeqCst);

        proc(unsafe { self.backing.priv_slice_mut(addr, size as usize) });

        self.reservation_break_locked(&mut state, addr)?;

        drop(state);
        self.waiters.notify_range(addr, size);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_tokens_are_stable() {
        let a = ThreadToken::current();
        let b = ThreadToken::current();
        assert_eq!(a, b);

        let other = std::thread::spawn(ThreadToken::current).join().unwrap();
        assert_ne!(a, other);
    }

    #[test]
    fn test_mutex_basic() {
        let mutex = ReservationMutex::new(5u32);

        {
            let mut guard = mutex.lock().unwrap();
            *guard += 1;
        }

        assert_eq!(*mutex.lock().unwrap(), 6);
    }

    #[test]
    fn test_mutex_reentry_is_deadlock() {
        let mutex = ReservationMutex::new(());

        let _guard = mutex.lock().unwrap();
        assert!(matches!(mutex.lock(), Err(VmError::Deadlock)));
    }

    #[test]
    fn test_mutex_contention() {
        use std::sync::Arc;

        let mutex = Arc::new(ReservationMutex::new(0u64));
        let mut handles = Vec::new();

        for _ in 0..4 {
            let mutex = mutex.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    *mutex.lock().unwrap() += 1;
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(*mutex.lock().unwrap(), 4000);
    }

    #[test]
    fn test_validate_range() {
        assert!(validate_range(0x10000, 128).is_ok());
        assert!(validate_range(0x10000, 4096).is_ok());
        assert!(validate_range(0x10000, 1).is_ok());

        assert!(validate_range(0x10000, 0).is_err());
        assert!(validate_range(0, 128).is_err());
        assert!(validate_range(0x10000, 96).is_err());
        assert!(validate_range(0x10000, 8192).is_err());
        assert!(validate_range(0x10040, 128).is_err());
    }
}
