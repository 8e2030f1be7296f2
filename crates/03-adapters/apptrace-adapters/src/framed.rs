//! Length-prefixed record encoder.
//!
//! ```text
//!  0        2      3      4
//!  +--------+------+------+----------------+
//!  | len LE | core | seq  | payload (len)  |
//!  +--------+------+------+----------------+
//! ```
//!
//! `seq` increments per record and wraps; the host uses it to spot records
//! dropped by a timed-out write. Each record goes out as one transport block.

use std::sync::atomic::{AtomicU8, Ordering};

use apptrace::{platform, Deadline, LockGuard, TraceError, TraceResult};
use apptrace_fabric::{
    Encoder, EncoderDescriptor, EncoderState, OpaqueConfig, PanicContext, Transport,
};
use smallvec::SmallVec;

/// Bytes in front of every record.
pub const FRAME_HEADER_LEN: usize = 4;

#[derive(Debug, Default)]
pub struct FramedEncoder {
    state: EncoderState,
    seq: AtomicU8,
}

impl FramedEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Largest payload one record can carry over `transport`.
    pub fn max_payload(transport: &dyn Transport) -> usize {
        transport
            .max_write()
            .saturating_sub(FRAME_HEADER_LEN)
            .min(usize::from(u16::MAX))
    }
}

impl Encoder for FramedEncoder {
    fn init(&self, transport: Box<dyn Transport>, _cfg: OpaqueConfig<'_>) -> TraceResult<()> {
        self.state.bind(transport)
    }

    fn is_ready(&self) -> bool {
        self.state.is_ready()
    }

    fn write(&self, data: &[u8], deadline: &mut Deadline) -> TraceResult<()> {
        let transport = self.state.transport()?;
        if data.len() > Self::max_payload(transport) {
            return Err(TraceError::InvalidArgument(
                "record exceeds the transport block size",
            ));
        }

        let _guard = self.state.take_lock(deadline)?;
        let seq = self.seq.load(Ordering::Relaxed);
        let mut frame: SmallVec<[u8; 64]> =
            SmallVec::with_capacity(FRAME_HEADER_LEN + data.len());
        frame.extend_from_slice(&(data.len() as u16).to_le_bytes());
        frame.push(platform::current_core() as u8);
        frame.push(seq);
        frame.extend_from_slice(data);

        transport.write(&frame, deadline)?;
        self.seq.store(seq.wrapping_add(1), Ordering::Relaxed);
        Ok(())
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
pub struct FramedDescriptor;

impl EncoderDescriptor for FramedDescriptor {
    fn create(&self) -> TraceResult<Box<dyn Encoder>> {
        Ok(Box::new(FramedEncoder::new()))
    }
}

/// One decoded record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Frame<'a> {
    pub core: u8,
    pub seq: u8,
    pub payload: &'a [u8],
}

/// Splits a host-side byte stream into complete records.
///
/// Returns the records and the unconsumed tail (an incomplete record).
pub fn decode_frames(mut bytes: &[u8]) -> (Vec<Frame<'_>>, &[u8]) {
    let mut frames = Vec::new();
    while bytes.len() >= FRAME_HEADER_LEN {
        let len = usize::from(u16::from_le_bytes([bytes[0], bytes[1]]));
        if bytes.len() < FRAME_HEADER_LEN + len {
            break;
        }
        frames.push(Frame {
            core: bytes[2],
            seq: bytes[3],
            payload: &bytes[FRAME_HEADER_LEN..FRAME_HEADER_LEN + len],
        });
        bytes = &bytes[FRAME_HEADER_LEN + len..];
    }
    (frames, bytes)
}
