//! Waits on guest address ranges.
//!
//! A bounded table of pending waiters, each watching a power-of-two
//! aligned byte range with a caller predicate. Writers that break
//! reservations notify overlapping waiters synchronously; a background
//! poller re-evaluates every armed predicate periodically as a safety
//! net for state the notification paths cannot see.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};

use tc_core::EmuStatus;

use crate::constants::WAITER_LIMIT;
use crate::error::{VmError, VmResult};
use crate::reservation::validate_range;
use crate::vm::VmContext;

/// Outcome of one waiter-predicate evaluation.
pub enum PredicateResult {
    /// Condition not met yet; keep waiting.
    Pending,
    /// Condition met; the wait completes.
    Ready,
    /// The predicate failed; the error surfaces at the wait site.
    Failed(VmError),
}

type WaiterPred = Box<dyn FnMut() -> PredicateResult + Send>;

/// State of one waiting thread.
///
/// `addr`/`mask` mirror the watched range for lock-free matching in
/// the notification sweep; the predicate itself is only touched under
/// the per-waiter mutex. A fired waiter has `addr == 0` and
/// `mask == !0`, which matches no notification.
struct Waiter {
    addr: AtomicU32,
    mask: AtomicU32,
    pred: Mutex<Option<WaiterPred>>,
    cond: Condvar,
}

impl Waiter {
    fn new(addr: u32, mask: u32, pred: WaiterPred) -> Self {
        Self {
            addr: AtomicU32::new(addr),
            mask: AtomicU32::new(mask),
            pred: Mutex::new(Some(pred)),
            cond: Condvar::new(),
        }
    }

    /// Evaluate the predicate under the waiter's lock; on success (or
    /// failure) disarm the range and wake the waiting thread.
    fn try_notify(&self) -> bool {
        let mut pred = self.pred.lock();

        match pred.as_mut() {
            None => return false,
            Some(p) => match p() {
                PredicateResult::Pending => return false,
                PredicateResult::Ready => {
                    *pred = None;
                }
                PredicateResult::Failed(err) => {
                    // re-raise on the waiting thread, once
                    let mut captured = Some(err);
                    *pred = Some(Box::new(move || match captured.take() {
                        Some(err) => PredicateResult::Failed(err),
                        None => PredicateResult::Ready,
                    }));
                }
            },
        }

        // set addr and mask to invalid values to prevent further polling
        self.addr.store(0, Ordering::Relaxed);
        self.mask.store(!0, Ordering::Relaxed);

        self.cond.notify_one();

        true
    }
}

struct WaiterSlots {
    list: Vec<Option<Arc<Waiter>>>,
    /// Lowest slot worth probing for insertion.
    nil: usize,
    /// One past the highest slot in use.
    max: usize,
}

/// The bounded waiter table.
pub(crate) struct WaiterRegistry {
    slots: Mutex<WaiterSlots>,
    shutdown: AtomicBool,
}

impl WaiterRegistry {
    pub(crate) fn new() -> Self {
        Self {
            slots: Mutex::new(WaiterSlots {
                list: vec![None; WAITER_LIMIT],
                nil: 0,
                max: 0,
            }),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Register a waiter and lock its predicate before the registry
    /// lock is released, so no notification can fire ahead of the wait
    /// loop.
    fn insert<'a>(
        &self,
        waiter: &'a Arc<Waiter>,
    ) -> VmResult<(usize, MutexGuard<'a, Option<WaiterPred>>)> {
        let mut slots = self.slots.lock();

        // look for an empty position
        let mut index = None;
        while slots.nil < slots.max {
            let probe = slots.nil;
            slots.nil += 1;
            if slots.list[probe].is_none() {
                index = Some(probe);
                break;
            }
        }

        let index = match index {
            Some(index) => index,
            None => {
                if slots.max >= WAITER_LIMIT {
                    return Err(VmError::WaiterLimit(slots.max));
                }
                let index = slots.max;
                slots.max += 1;
                slots.nil = slots.max;
                index
            }
        };

        slots.list[index] = Some(waiter.clone());

        let guard = waiter.pred.lock();
        drop(slots);

        Ok((index, guard))
    }

    /// Drop a waiter slot and contract the cursors.
    fn remove(&self, index: usize) {
        let mut slots = self.slots.lock();

        slots.list[index] = None;

        // amortize adding a new element
        slots.nil = slots.nil.min(index);

        // amortize polling
        while slots.max > 0 && slots.list[slots.max - 1].is_none() {
            slots.max -= 1;
        }
    }

    /// Notify every waiter whose range overlaps `[addr, addr + size)`.
    /// `size` must be a power of two with `addr` aligned to it.
    pub(crate) fn notify_range(&self, addr: u32, size: u32) {
        if size == 0 {
            return;
        }

        let mask = !(size - 1);
        let slots = self.slots.lock();

        for slot in slots.list[..slots.max].iter().flatten() {
            // overlap test over the masks generated from both sizes
            if (slot.addr.load(Ordering::Relaxed) ^ addr) & (mask & slot.mask.load(Ordering::Relaxed))
                == 0
            {
                slot.try_notify();
            }
        }
    }

    /// Re-evaluate every armed waiter. Returns true when all of them
    /// signaled (or none were armed).
    pub(crate) fn notify_all(&self) -> bool {
        let slots = self.slots.lock();

        let mut armed = 0usize;
        let mut signaled = 0usize;

        for slot in slots.list[..slots.max].iter().flatten() {
            if slot.addr.load(Ordering::Relaxed) != 0 {
                armed += 1;
                if slot.try_notify() {
                    signaled += 1;
                }
            }
        }

        armed == signaled
    }

    /// Ask the poller to exit.
    pub(crate) fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    /// Start the background notification thread.
    pub(crate) fn start_poller(registry: Arc<WaiterRegistry>, emu: EmuStatus) {
        let spawned = thread::Builder::new()
            .name("vm:waiter-poll".into())
            .spawn(move || {
                while !emu.is_stopped() && !registry.shutdown.load(Ordering::Relaxed) {
                    // sweep until every armed waiter fired
                    while !registry.notify_all()
                        && !emu.is_paused()
                        && !registry.shutdown.load(Ordering::Relaxed)
                    {
                        thread::yield_now();
                    }

                    thread::sleep(Duration::from_millis(1));
                }

                tracing::trace!("waiter poll thread exiting");
            });

        if let Err(err) = spawned {
            tracing::error!(%err, "failed to spawn waiter poll thread");
        }
    }
}

impl VmContext {
    /// Notify waiters overlapping `[addr, addr + size)`.
    pub fn notify_at(&self, addr: u32, size: u32) -> VmResult<()> {
        validate_range(addr, size)?;
        self.waiters.notify_range(addr, size);
        Ok(())
    }

    /// Block until `pred` reports [`PredicateResult::Ready`] for the
    /// watched range `[addr, addr + size)`.
    ///
    /// The predicate runs under the waiter's own lock, either on this
    /// thread or on a notifying thread; a captured failure is
    /// re-raised here. The wait observes the emulator status and ends
    /// with [`VmError::Stopped`] once emulation stops.
    pub fn wait_until(
        &self,
        addr: u32,
        size: u32,
        pred: impl FnMut() -> PredicateResult + Send + 'static,
    ) -> VmResult<()> {
        validate_range(addr, size)?;

        let waiter = Arc::new(Waiter::new(addr, !(size - 1), Box::new(pred)));
        let (index, mut pred_guard) = self.waiters.insert(&waiter)?;

        let result = loop {
            // a notifier that ran the predicate successfully clears it
            let outcome = match pred_guard.as_mut() {
                None => break Ok(()),
                Some(p) => p(),
            };

            match outcome {
                PredicateResult::Ready => break Ok(()),
                PredicateResult::Failed(err) => break Err(err),
                PredicateResult::Pending => {
                    if self.emu.is_stopped() {
                        break Err(VmError::Stopped);
                    }
                    waiter.cond.wait(&mut pred_guard);
                }
            }
        };

        // reset the slot data to avoid excessive signaling
        *pred_guard = None;
        waiter.addr.store(0, Ordering::Relaxed);
        waiter.mask.store(!0, Ordering::Relaxed);

        // release the waiter lock before touching the registry lock
        drop(pred_guard);
        self.waiters.remove(index);

        result
    }
}
