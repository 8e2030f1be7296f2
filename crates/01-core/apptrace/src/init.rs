//! Lock-guarded, first-call-wins initialisation.
//!
//! Several cores may race to bring up the same global state at boot. The cell
//! serialises them on a [`Lock`]: the first caller runs its initialiser, every
//! later caller observes `Ready` and gets the same value back.

use std::cell::UnsafeCell;
use std::fmt;
use std::mem::MaybeUninit;

#[cfg(feature = "loom")]
use loom::sync::atomic::{AtomicU8, Ordering};
#[cfg(not(feature = "loom"))]
use std::sync::atomic::{AtomicU8, Ordering};

use crate::deadline::Deadline;
use crate::lock::Lock;
use crate::TraceResult;

const UNINITIALIZED: u8 = 0;
const INITIALIZING: u8 = 1;
const READY: u8 = 2;

/// Lifecycle of an [`InitCell`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InitState {
    Uninitialized,
    Initializing,
    Ready,
}

impl InitState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            READY => InitState::Ready,
            INITIALIZING => InitState::Initializing,
            _ => InitState::Uninitialized,
        }
    }

    pub fn is_ready(self) -> bool {
        self == InitState::Ready
    }
}

/// Write-once slot with an explicit `Uninitialized → Initializing → Ready` lifecycle.
pub struct InitCell<T> {
    lock: Lock,
    state: AtomicU8,
    value: UnsafeCell<MaybeUninit<T>>,
}

// SAFETY: The value is written once under `lock` and only read after `state`
// is published as READY with release ordering.
unsafe impl<T: Send> Send for InitCell<T> {}
// SAFETY: Shared access only hands out `&T`, hence `T: Sync`; the value may be
// initialised on any thread, hence `T: Send`.
unsafe impl<T: Send + Sync> Sync for InitCell<T> {}

impl<T> InitCell<T> {
    pub fn new() -> Self {
        Self {
            lock: Lock::new(),
            state: AtomicU8::new(UNINITIALIZED),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    pub fn state(&self) -> InitState {
        InitState::from_raw(self.state.load(Ordering::Acquire))
    }

    /// Returns the value once the cell is `Ready`.
    pub fn get(&self) -> Option<&T> {
        if self.state().is_ready() {
            // SAFETY: READY is only published after the value was written.
            Some(unsafe { self.ready_ref() })
        } else {
            None
        }
    }

    /// Runs `init` if no caller has completed initialisation yet.
    ///
    /// A failing initialiser leaves the cell `Uninitialized` so a later call may
    /// retry. The lock wait is bounded by `deadline`.
    pub fn get_or_try_init<F>(&self, deadline: &mut Deadline, init: F) -> TraceResult<&T>
    where
        F: FnOnce() -> TraceResult<T>,
    {
        if let Some(value) = self.get() {
            return Ok(value);
        }

        let _guard = self.lock.take(deadline)?;
        if self.state.load(Ordering::Acquire) == READY {
            // SAFETY: READY observed under the lock.
            return Ok(unsafe { self.ready_ref() });
        }

        self.state.store(INITIALIZING, Ordering::Relaxed);
        match init() {
            Ok(value) => {
                // SAFETY: The lock is held and the state is not READY, so no
                // reader can observe the slot while it is written.
                unsafe { (*self.value.get()).write(value) };
                self.state.store(READY, Ordering::Release);
                // SAFETY: Just initialised.
                Ok(unsafe { self.ready_ref() })
            }
            Err(err) => {
                self.state.store(UNINITIALIZED, Ordering::Release);
                Err(err)
            }
        }
    }

    /// # Safety
    /// The caller must have observed `READY` with acquire ordering.
    unsafe fn ready_ref(&self) -> &T {
        // SAFETY: Guaranteed initialised by the caller contract.
        unsafe { (*self.value.get()).assume_init_ref() }
    }
}

impl<T> Default for InitCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for InitCell<T> {
    fn drop(&mut self) {
        if self.state().is_ready() {
            // SAFETY: READY means the slot holds a value, and `&mut self` is unique.
            unsafe { self.value.get_mut().assume_init_drop() };
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for InitCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InitCell")
            .field("state", &self.state())
            .field("value", &self.get())
            .finish()
    }
}
