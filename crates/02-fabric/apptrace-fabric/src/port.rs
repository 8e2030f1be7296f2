//! Capability contracts between a session and its plugins.
//!
//! A [`Transport`] moves bytes over one physical channel. An [`Encoder`] turns
//! application data into the wire format and exclusively owns the transport it
//! was initialised with. Both are produced by `'static` descriptors that live in
//! the [`crate::Registry`].

use std::any::Any;
use std::fmt;

use apptrace::{
    platform, Deadline, InitCell, InitState, Lock, LockGuard, StageGrant, TraceError, TraceResult,
};

/// Opaque, implementation-defined configuration handed to `init`.
pub type OpaqueConfig<'a> = Option<&'a (dyn Any + Send + Sync)>;

/// Downcasts an opaque config, rejecting values of the wrong type.
pub fn downcast_config<'a, T: Any>(
    cfg: OpaqueConfig<'a>,
    expected: &'static str,
) -> TraceResult<Option<&'a T>> {
    match cfg {
        None => Ok(None),
        Some(value) => value
            .downcast_ref::<T>()
            .map(Some)
            .ok_or(TraceError::InvalidArgument(expected)),
    }
}

/// Physical kind of channel behind a transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LinkKind {
    Unknown,
    DebugProbe,
    Uart,
}

impl fmt::Display for LinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LinkKind::Unknown => "unknown",
            LinkKind::DebugProbe => "debug-probe",
            LinkKind::Uart => "uart",
        };
        f.write_str(name)
    }
}

/// Runtime-tunable transport parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ConfigKey {
    /// Bytes of header prepended to every staged block.
    HeaderSize = 0,
    /// Microseconds a panic-time flush may wait; all ones waits indefinitely.
    FlushTimeout = 1,
    /// Minimum staged bytes before `flush` pushes data to the host.
    FlushThreshold = 2,
}

impl ConfigKey {
    pub const ALL: [ConfigKey; 3] = [
        ConfigKey::HeaderSize,
        ConfigKey::FlushTimeout,
        ConfigKey::FlushThreshold,
    ];

    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(ConfigKey::HeaderSize),
            1 => Some(ConfigKey::FlushTimeout),
            2 => Some(ConfigKey::FlushThreshold),
            _ => None,
        }
    }
}

/// What a fault handler knows when it asks for a final flush.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PanicContext<'a> {
    pub core_id: u32,
    pub message: Option<&'a str>,
}

impl<'a> PanicContext<'a> {
    /// Context for the calling core.
    pub fn current(message: Option<&'a str>) -> Self {
        Self {
            core_id: platform::current_core(),
            message,
        }
    }
}

/// A channel that moves bytes between the target and the host.
///
/// Every method takes `&self`; implementations keep their mutable state behind
/// their own locks so one transport can be driven from several cores.
pub trait Transport: Send + Sync {
    /// Copies down-stream bytes into `buf`, waiting for at least one.
    fn read(&self, buf: &mut [u8], deadline: &mut Deadline) -> TraceResult<usize>;

    /// Stages `data` as one block and signals the channel to drain it.
    fn write(&self, data: &[u8], deadline: &mut Deadline) -> TraceResult<()>;

    /// Largest `data` a single [`Transport::write`] accepts.
    fn max_write(&self) -> usize {
        usize::MAX
    }

    /// Reserves a block in staging memory, committed when the grant drops.
    fn reserve(&self, len: usize, deadline: &mut Deadline) -> TraceResult<StageGrant<'_>> {
        let _ = (len, deadline);
        Err(TraceError::NotSupported("reserve"))
    }

    /// Pushes staged data to the host once at least `min_size` bytes are pending.
    fn flush(&self, min_size: u32, deadline: &mut Deadline) -> TraceResult<()>;

    /// Flush for callers that must not wait on the staging lock.
    fn flush_without_lock(&self) -> TraceResult<()> {
        Err(TraceError::NotSupported("flush_without_lock"))
    }

    /// Installs `storage` as the down-stream receive buffer.
    fn configure_receive_buffer(&self, storage: Box<[u8]>) -> TraceResult<()> {
        let _ = storage;
        Err(TraceError::NotSupported("configure_receive_buffer"))
    }

    fn is_host_connected(&self) -> bool;

    fn link_kind(&self) -> LinkKind;

    fn set_config(&self, key: ConfigKey, value: u32) -> TraceResult<()>;

    fn get_config(&self, key: ConfigKey) -> TraceResult<u32>;

    /// Best-effort final flush from a fault handler. Must not panic.
    fn panic_flush(&self, info: &PanicContext<'_>);
}

/// Registered factory for a [`Transport`].
pub trait TransportDescriptor: Sync {
    fn init(&self, cfg: OpaqueConfig<'_>) -> TraceResult<Box<dyn Transport>>;
}

/// A wire format bound to exactly one transport.
pub trait Encoder: Send + Sync {
    /// Binds the encoder to `transport`. Later calls succeed without rebinding.
    fn init(&self, transport: Box<dyn Transport>, cfg: OpaqueConfig<'_>) -> TraceResult<()>;

    fn is_ready(&self) -> bool;

    /// Formats `data` and forwards it to the transport.
    fn write(&self, data: &[u8], deadline: &mut Deadline) -> TraceResult<()>;

    /// Zero-copy block reservation; only formats that add no framing support it.
    fn reserve(&self, len: usize, deadline: &mut Deadline) -> TraceResult<StageGrant<'_>> {
        let _ = (len, deadline);
        Err(TraceError::NotSupported("reserve"))
    }

    /// Takes the encoder lock. Dropping the guard (or `give()`) releases it.
    fn take_lock(&self, deadline: &mut Deadline) -> TraceResult<LockGuard<'_>>;

    /// The transport bound by [`Encoder::init`].
    fn transport(&self) -> TraceResult<&dyn Transport>;

    /// Final flush from a fault handler, called with the encoder lock held
    /// when it could be taken. Must not panic.
    fn panic_flush(&self, info: &PanicContext<'_>);
}

/// Registered factory for an [`Encoder`].
pub trait EncoderDescriptor: Sync {
    fn create(&self) -> TraceResult<Box<dyn Encoder>>;
}

/// State every encoder carries: its lock and the once-bound transport.
pub struct EncoderState {
    lock: Lock,
    transport: InitCell<Box<dyn Transport>>,
}

impl EncoderState {
    pub fn new() -> Self {
        Self {
            lock: Lock::new(),
            transport: InitCell::new(),
        }
    }

    /// Binds `transport` unless a previous call already did.
    pub fn bind(&self, transport: Box<dyn Transport>) -> TraceResult<()> {
        let mut bound_here = false;
        self.transport
            .get_or_try_init(&mut Deadline::infinite(), || {
                bound_here = true;
                Ok(transport)
            })?;
        if !bound_here {
            tracing::debug!("encoder already bound; keeping the first transport");
        }
        Ok(())
    }

    pub fn state(&self) -> InitState {
        self.transport.state()
    }

    pub fn is_ready(&self) -> bool {
        self.state().is_ready()
    }

    pub fn transport(&self) -> TraceResult<&dyn Transport> {
        self.transport
            .get()
            .map(|transport| &**transport)
            .ok_or(TraceError::InvalidState("encoder has no transport bound"))
    }

    pub fn take_lock(&self, deadline: &mut Deadline) -> TraceResult<LockGuard<'_>> {
        self.lock.take(deadline)
    }
}

impl Default for EncoderState {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EncoderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncoderState")
            .field("lock", &self.lock)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_keys_round_trip_through_raw_values() {
        for key in ConfigKey::ALL {
            assert_eq!(ConfigKey::from_u32(key as u32), Some(key));
        }
        assert_eq!(ConfigKey::from_u32(3), None);
    }

    #[test]
    fn downcast_rejects_wrong_config_type() {
        let value = 7u32;
        let cfg: OpaqueConfig<'_> = Some(&value);
        assert_eq!(downcast_config::<u32>(cfg, "u32").unwrap(), Some(&7));
        assert_eq!(
            downcast_config::<String>(cfg, "expected a String").unwrap_err(),
            TraceError::InvalidArgument("expected a String")
        );
        assert_eq!(downcast_config::<u32>(None, "u32").unwrap(), None);
    }

    #[test]
    fn unbound_encoder_state_reports_invalid_state() {
        let state = EncoderState::new();
        assert!(!state.is_ready());
        assert!(matches!(
            state.transport().err(),
            Some(TraceError::InvalidState(_))
        ));
    }
}
