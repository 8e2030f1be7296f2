//! Capabilities the tracing core consumes from the platform.
//!
//! On target these map to the RTOS interrupt-mask primitives, the CPU cycle
//! counter and the core-id register. The host implementations below emulate
//! them per thread so the same code paths run under `cargo test`:
//! * [`HostCriticalSection`] – per-thread interrupt mask with nested save/restore.
//! * [`SystemClock`] – process-wide monotonic microsecond counter.
//! * [`ManualClock`] – test clock driven by hand, with a configurable wrap point.
//! * [`current_core`] / [`set_current_core`] – which "core" the calling thread is.

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Instant;

/// Interrupt mask level reported by a thread that has interrupts enabled.
pub const IRQ_LEVEL_ENABLED: u32 = 0;
/// Interrupt mask level installed while inside a critical section.
pub const IRQ_LEVEL_MASKED: u32 = 0xF;

/// Interrupt state captured when entering a critical section.
///
/// The value is opaque to callers and must be handed back, unmodified, to the
/// matching [`CriticalSection::exit`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IrqState(u32);

impl IrqState {
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }
}

/// Disables preemption and interrupts on the executing core.
pub trait CriticalSection: Send + Sync {
    /// Masks interrupts and returns the state that was active before.
    fn enter(&self) -> IrqState;
    /// Restores the state returned by the matching [`CriticalSection::enter`].
    fn exit(&self, state: IrqState);
}

thread_local! {
    static IRQ_LEVEL: Cell<u32> = const { Cell::new(IRQ_LEVEL_ENABLED) };
    static CORE_ID: Cell<u32> = const { Cell::new(0) };
}

/// Host emulation of an interrupt-masking critical section.
#[derive(Clone, Copy, Debug, Default)]
pub struct HostCriticalSection;

impl CriticalSection for HostCriticalSection {
    fn enter(&self) -> IrqState {
        IRQ_LEVEL.with(|level| IrqState(level.replace(IRQ_LEVEL_MASKED)))
    }

    fn exit(&self, state: IrqState) {
        IRQ_LEVEL.with(|level| level.set(state.0));
    }
}

/// Current emulated interrupt state of the calling thread.
pub fn current_irq_state() -> IrqState {
    IRQ_LEVEL.with(|level| IrqState(level.get()))
}

/// Returns true while the calling thread is inside a host critical section.
pub fn interrupts_masked() -> bool {
    current_irq_state().raw() != IRQ_LEVEL_ENABLED
}

/// Id of the core the calling thread is emulating. Defaults to 0.
pub fn current_core() -> u32 {
    CORE_ID.with(Cell::get)
}

/// Pins the calling thread to an emulated core id.
pub fn set_current_core(id: u32) {
    CORE_ID.with(|core| core.set(id));
}

/// Monotonic microsecond counter that may wrap at [`Clock::max_us`].
pub trait Clock: Send + Sync {
    /// Current raw counter value in microseconds.
    fn now_us(&self) -> u64;

    /// Largest value the counter reaches before wrapping to zero.
    fn max_us(&self) -> u64 {
        u64::MAX
    }
}

/// Microseconds elapsed since the first clock read of the process.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_us(&self) -> u64 {
        static EPOCH: OnceLock<Instant> = OnceLock::new();
        let epoch = EPOCH.get_or_init(Instant::now);
        u64::try_from(epoch.elapsed().as_micros()).unwrap_or(u64::MAX)
    }
}

/// Hand-driven clock for deterministic deadline tests.
#[derive(Debug)]
pub struct ManualClock {
    now: AtomicU64,
    max: u64,
}

impl ManualClock {
    pub const fn new(start_us: u64) -> Self {
        Self::with_wrap(start_us, u64::MAX)
    }

    /// Clock whose counter wraps to zero after `max_us`.
    pub const fn with_wrap(start_us: u64, max_us: u64) -> Self {
        Self {
            now: AtomicU64::new(start_us),
            max: max_us,
        }
    }

    pub fn set(&self, now_us: u64) {
        debug_assert!(now_us <= self.max, "clock value beyond wrap point");
        self.now.store(now_us, Ordering::SeqCst);
    }

    /// Moves the counter forward, wrapping past `max_us` like a hardware counter.
    pub fn advance(&self, delta_us: u64) {
        let now = self.now.load(Ordering::SeqCst);
        let headroom = self.max - now;
        let next = if delta_us <= headroom {
            now + delta_us
        } else {
            delta_us - headroom - 1
        };
        self.now.store(next, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_us(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }

    fn max_us(&self) -> u64 {
        self.max
    }
}
