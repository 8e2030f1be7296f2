#![deny(unsafe_op_in_unsafe_fn)]
//! Core primitives of the application tracing substrate.
//!
//! This crate holds the pieces every tracing tier builds on:
//! * [`Deadline`] / [`Timeout`] – microsecond wait bounds with an infinite sentinel.
//! * [`Lock`] / [`Locked`] – critical-section spin lock usable from task, interrupt and panic context.
//! * [`InitCell`] – lock-guarded first-call-wins initialisation.
//! * [`RingBuffer`] – single-producer/single-consumer ring with a shrinkable logical size.
//! * [`StagingRing`] / [`ReceiveRing`] – locked up-stream and down-stream staging used by transports.
//! * [`platform`] – critical-section, clock and core-id capabilities with host emulations.

mod deadline;
mod error;
mod init;
mod lock;
pub mod platform;
mod ring;
mod staging;

pub use deadline::{Deadline, Timeout, TIMEOUT_INFINITE_US};
pub use error::{alloc_buffer, TraceError, TraceResult};
pub use init::{InitCell, InitState};
pub use lock::{Lock, LockGuard, Locked, LockedGuard};
pub use platform::{Clock, CriticalSection, IrqState};
pub use ring::RingBuffer;
pub use staging::{
    BlockHeader, HeaderFormat, ReceiveRing, StageGrant, StagingRing, MAX_BLOCK_LEN,
};
