//! Plugin fabric for the application tracing substrate.
//!
//! This crate composes the core primitives into something an application opens:
//! * [`Encoder`] / [`Transport`] – capability traits implemented by wire formats and channels.
//! * [`Registry`] – name → descriptor tables filled by [`register_encoder!`] / [`register_transport!`].
//! * [`Session`] – one encoder bound to one transport, with write/flush/read/panic-flush.
//! * [`global`] – the process-wide session and its panic hook.

mod config;
pub mod global;
mod port;
mod registry;
mod session;
mod stats;

pub use inventory;

pub use apptrace::{
    Deadline, InitState, LockGuard, StageGrant, Timeout, TraceError, TraceResult,
    TIMEOUT_INFINITE_US,
};
pub use config::{panic_flush_timeout, TransportSettings, DEFAULT_PANIC_FLUSH_TIMEOUT_US};
pub use port::{
    downcast_config, ConfigKey, Encoder, EncoderDescriptor, EncoderState, LinkKind, OpaqueConfig,
    PanicContext, Transport, TransportDescriptor,
};
pub use registry::{EncoderRegistration, Registry, TransportRegistration};
pub use session::{Session, SessionParams};
pub use stats::SessionStats;
