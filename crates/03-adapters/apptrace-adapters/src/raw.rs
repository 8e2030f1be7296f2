//! Encoder that forwards bytes unchanged.
//!
//! Writes longer than the transport accepts in one block are split into
//! consecutive blocks under a single hold of the encoder lock, so concurrent
//! writers never interleave inside one record. Reservations keep the same lock
//! until their block is committed.

use apptrace::{Deadline, LockGuard, StageGrant, TraceResult};
use apptrace_fabric::{
    Encoder, EncoderDescriptor, EncoderState, OpaqueConfig, PanicContext, Transport,
};

#[derive(Debug, Default)]
pub struct RawEncoder {
    state: EncoderState,
}

impl RawEncoder {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Encoder for RawEncoder {
    fn init(&self, transport: Box<dyn Transport>, _cfg: OpaqueConfig<'_>) -> TraceResult<()> {
        self.state.bind(transport)
    }

    fn is_ready(&self) -> bool {
        self.state.is_ready()
    }

    fn write(&self, data: &[u8], deadline: &mut Deadline) -> TraceResult<()> {
        let transport = self.state.transport()?;
        let _guard = self.state.take_lock(deadline)?;
        let chunk = transport.max_write().max(1);
        for piece in data.chunks(chunk) {
            transport.write(piece, deadline)?;
        }
        log::trace!("raw encoder forwarded {} bytes", data.len());
        Ok(())
    }

    fn reserve(&self, len: usize, deadline: &mut Deadline) -> TraceResult<StageGrant<'_>> {
        let transport = self.state.transport()?;
        let guard = self.state.take_lock(deadline)?;
        Ok(transport.reserve(len, deadline)?.holding(guard))
    }

    fn take_lock(&self, deadline: &mut Deadline) -> TraceResult<LockGuard<'_>> {
        self.state.take_lock(deadline)
    }

    fn transport(&self) -> TraceResult<&dyn Transport> {
        self.state.transport()
    }

    fn panic_flush(&self, info: &PanicContext<'_>) {
        if let Ok(transport) = self.state.transport() {
            transport.panic_flush(info);
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct RawDescriptor;

impl EncoderDescriptor for RawDescriptor {
    fn create(&self) -> TraceResult<Box<dyn Encoder>> {
        Ok(Box::new(RawEncoder::new()))
    }
}
