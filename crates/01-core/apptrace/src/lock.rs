//! Deadline-bounded spin lock layered on a critical section.
//!
//! The acquire path must behave the same from task context, interrupt context
//! and a panic handler, where no scheduler is available to park on. `take`
//! therefore busy-polls: it masks interrupts, spins for a budget derived from
//! the deadline's remaining time, and unmasks again between batches so pending
//! interrupts get serviced. On timeout the critical section has already been
//! left and nothing is held.

use std::cell::UnsafeCell;
use std::fmt;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};

#[cfg(feature = "loom")]
use loom::sync::atomic::{AtomicBool, Ordering};
#[cfg(not(feature = "loom"))]
use std::sync::atomic::{AtomicBool, Ordering};

use crate::deadline::{Deadline, Timeout};
use crate::platform::{CriticalSection, HostCriticalSection, IrqState};
use crate::TraceResult;

/// Spin iterations attempted per microsecond of remaining deadline.
const SPINS_PER_US: u64 = 8;
/// Longest run of attempts made with interrupts masked.
const MAX_SPIN_BATCH: u32 = 1024;

#[inline]
pub(crate) fn spin_hint() {
    #[cfg(feature = "loom")]
    loom::thread::yield_now();
    #[cfg(not(feature = "loom"))]
    std::hint::spin_loop();
}

/// Converts the deadline's remaining time into a spin budget for one batch.
fn spin_budget(remaining: Timeout) -> u32 {
    match remaining {
        Timeout::Infinite => MAX_SPIN_BATCH,
        Timeout::Micros(us) => {
            let spins = us.saturating_mul(SPINS_PER_US);
            u32::try_from(spins).unwrap_or(u32::MAX).clamp(1, MAX_SPIN_BATCH)
        }
    }
}

/// Mutual exclusion primitive usable from any execution context.
///
/// Not reentrant: taking a lock already held by the caller spins until the
/// deadline expires.
pub struct Lock {
    locked: AtomicBool,
    cs: &'static dyn CriticalSection,
}

impl Lock {
    /// Lock backed by the host critical-section emulation.
    pub fn new() -> Self {
        Self::with_critical_section(&HostCriticalSection)
    }

    pub fn with_critical_section(cs: &'static dyn CriticalSection) -> Self {
        Self {
            locked: AtomicBool::new(false),
            cs,
        }
    }

    /// Acquires the lock, spinning until `deadline` expires.
    ///
    /// On success interrupts stay masked until the returned guard is dropped.
    pub fn take(&self, deadline: &mut Deadline) -> TraceResult<LockGuard<'_>> {
        loop {
            let irq = self.cs.enter();
            if self.spin_acquire(spin_budget(deadline.remaining())) {
                return Ok(LockGuard::new(self, irq));
            }
            self.cs.exit(irq);
            deadline.check()?;
        }
    }

    /// Single acquisition attempt.
    pub fn try_take(&self) -> Option<LockGuard<'_>> {
        let irq = self.cs.enter();
        if self.spin_acquire(1) {
            Some(LockGuard::new(self, irq))
        } else {
            self.cs.exit(irq);
            None
        }
    }

    /// Observes whether some owner currently holds the lock.
    pub fn is_held(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    fn spin_acquire(&self, budget: u32) -> bool {
        for attempt in 0..budget {
            if self
                .locked
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return true;
            }
            if attempt + 1 < budget {
                spin_hint();
            }
        }
        false
    }

    fn give(&self, irq: IrqState) {
        debug_assert!(
            self.locked.load(Ordering::Relaxed),
            "giving a lock that is not held"
        );
        self.locked.store(false, Ordering::Release);
        self.cs.exit(irq);
    }
}

impl Default for Lock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Lock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lock")
            .field("held", &self.is_held())
            .finish()
    }
}

/// Proof of ownership returned by [`Lock::take`]; dropping it gives the lock back.
///
/// The guard pins the interrupt state saved at `take` time, so it cannot leave
/// the thread (core) that masked interrupts.
#[must_use = "dropping the guard immediately releases the lock"]
pub struct LockGuard<'a> {
    lock: &'a Lock,
    irq: IrqState,
    _not_send: PhantomData<*const ()>,
}

impl<'a> LockGuard<'a> {
    fn new(lock: &'a Lock, irq: IrqState) -> Self {
        Self {
            lock,
            irq,
            _not_send: PhantomData,
        }
    }

    /// Interrupt state that will be restored on release.
    pub fn irq_state(&self) -> IrqState {
        self.irq
    }

    /// Releases the lock explicitly.
    pub fn give(self) {
        drop(self);
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.lock.give(self.irq);
    }
}

impl fmt::Debug for LockGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard").field("irq", &self.irq).finish()
    }
}

/// Value that can only be reached while holding its [`Lock`].
pub struct Locked<T> {
    lock: Lock,
    value: UnsafeCell<T>,
}

// SAFETY: Access to `value` is serialised by `lock`; the guard hands out at most
// one reference at a time, so sharing `Locked<T>` only requires `T: Send`.
unsafe impl<T: Send> Send for Locked<T> {}
// SAFETY: See above. `&Locked<T>` never exposes `&T` without the lock held.
unsafe impl<T: Send> Sync for Locked<T> {}

impl<T> Locked<T> {
    pub fn new(value: T) -> Self {
        Self {
            lock: Lock::new(),
            value: UnsafeCell::new(value),
        }
    }

    pub fn with_critical_section(cs: &'static dyn CriticalSection, value: T) -> Self {
        Self {
            lock: Lock::with_critical_section(cs),
            value: UnsafeCell::new(value),
        }
    }

    pub fn lock(&self, deadline: &mut Deadline) -> TraceResult<LockedGuard<'_, T>> {
        let guard = self.lock.take(deadline)?;
        Ok(LockedGuard { guard, cell: self })
    }

    pub fn try_lock(&self) -> Option<LockedGuard<'_, T>> {
        let guard = self.lock.try_take()?;
        Some(LockedGuard { guard, cell: self })
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_held()
    }

    /// Exclusive access without locking, available when the borrow proves it.
    pub fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }

    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

impl<T: Default> Default for Locked<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// Scoped access to the value inside a [`Locked`].
pub struct LockedGuard<'a, T> {
    guard: LockGuard<'a>,
    cell: &'a Locked<T>,
}

impl<T> LockedGuard<'_, T> {
    pub fn irq_state(&self) -> IrqState {
        self.guard.irq_state()
    }
}

impl<T> Deref for LockedGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: `guard` proves the lock is held for the lifetime of `self`.
        unsafe { &*self.cell.value.get() }
    }
}

impl<T> DerefMut for LockedGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: `guard` proves the lock is held and `&mut self` is unique.
        unsafe { &mut *self.cell.value.get() }
    }
}


#[cfg(all(test, feature = "loom"))]
mod loom_tests {
    use super::*;
    use loom::sync::atomic::AtomicUsize;
    use loom::sync::Arc;
    use loom::thread;

    #[test]
    fn slow_loom_lock_mutual_exclusion() {
        loom::model(|| {
            let lock = Arc::new(Lock::new());
            let inside = Arc::new(AtomicUsize::new(0));

            let handles: Vec<_> = (0..2)
                .map(|_| {
                    let lock = Arc::clone(&lock);
                    let inside = Arc::clone(&inside);
                    thread::spawn(move || {
                        let guard = lock.take(&mut Deadline::infinite()).unwrap();
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        inside.fetch_sub(1, Ordering::SeqCst);
                        drop(guard);
                    })
                })
                .collect();

            for handle in handles {
                handle.join().unwrap();
            }
            assert!(!lock.is_held());
        });
    }
}
