//! Lock-guarded staging between a transport's producer and its channel drain.
//!
//! [`StagingRing`] is the up-stream half: producers reserve whole blocks (an
//! optional [`BlockHeader`] followed by the payload) and the channel drains raw
//! bytes towards the host. [`ReceiveRing`] is the down-stream half: the host
//! pushes bytes in and the target reads them out. Both wrap a [`RingBuffer`] in
//! a [`Locked`] so producer and consumer may live on different cores.

use std::fmt;

use crate::deadline::Deadline;
use crate::error::alloc_buffer;
use crate::lock::{spin_hint, LockGuard, Locked, LockedGuard};
use crate::platform::current_core;
use crate::ring::RingBuffer;
use crate::{TraceError, TraceResult};

/// Largest payload a block header can describe.
pub const MAX_BLOCK_LEN: usize = 0x7FFF;

const CORE_BIT: u16 = 1 << 15;

/// Size of the header prepended to every staged block.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum HeaderFormat {
    /// Payload bytes only.
    #[default]
    None,
    /// `len | core << 15`, little endian.
    Short,
    /// [`HeaderFormat::Short`] followed by the written length.
    Long,
}

impl HeaderFormat {
    pub fn from_size(bytes: u32) -> Option<Self> {
        match bytes {
            0 => Some(HeaderFormat::None),
            2 => Some(HeaderFormat::Short),
            4 => Some(HeaderFormat::Long),
            _ => None,
        }
    }

    /// Header length in bytes.
    pub const fn len(self) -> usize {
        match self {
            HeaderFormat::None => 0,
            HeaderFormat::Short => 2,
            HeaderFormat::Long => 4,
        }
    }

    pub const fn is_none(self) -> bool {
        matches!(self, HeaderFormat::None)
    }
}

/// Decoded block header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockHeader {
    /// Payload bytes reserved for the block.
    pub len: u16,
    /// Core that staged the block (0 or 1).
    pub core: u8,
    /// Payload bytes actually written; equals `len` for short headers.
    pub written: u16,
}

impl BlockHeader {
    pub fn encode(&self, format: HeaderFormat, out: &mut [u8]) {
        let word = (self.len & !CORE_BIT) | (u16::from(self.core & 1) << 15);
        match format {
            HeaderFormat::None => {}
            HeaderFormat::Short => out[..2].copy_from_slice(&word.to_le_bytes()),
            HeaderFormat::Long => {
                out[..2].copy_from_slice(&word.to_le_bytes());
                out[2..4].copy_from_slice(&self.written.to_le_bytes());
            }
        }
    }

    /// Parses the header at the start of `bytes`.
    pub fn decode(format: HeaderFormat, bytes: &[u8]) -> Option<Self> {
        if format.is_none() || bytes.len() < format.len() {
            return None;
        }
        let word = u16::from_le_bytes([bytes[0], bytes[1]]);
        let len = word & !CORE_BIT;
        let written = match format {
            HeaderFormat::Long => u16::from_le_bytes([bytes[2], bytes[3]]),
            _ => len,
        };
        Some(Self {
            len,
            core: u8::from(word & CORE_BIT != 0),
            written,
        })
    }
}

/// Up-stream staging ring shared by a transport's writers and its drain.
pub struct StagingRing {
    ring: Locked<RingBuffer>,
    capacity: u32,
}

impl StagingRing {
    pub fn new(capacity: usize) -> TraceResult<Self> {
        let ring = RingBuffer::new(alloc_buffer(capacity)?)?;
        let capacity = ring.size();
        Ok(Self {
            ring: Locked::new(ring),
            capacity,
        })
    }

    /// Allocated size of the underlying ring.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Largest payload a single block may carry with `header`.
    pub fn max_block(&self, header: HeaderFormat) -> usize {
        let usable = (self.capacity as usize).saturating_sub(1 + header.len());
        if header.is_none() {
            usable
        } else {
            usable.min(MAX_BLOCK_LEN)
        }
    }

    /// Reserves a block of `len` payload bytes, calling `kick` between attempts.
    ///
    /// `kick` runs with the ring unlocked and gives the caller a chance to move
    /// staged data towards the channel. The block is visible to the drain once
    /// the grant is dropped.
    pub fn reserve<'a, K>(
        &'a self,
        header: HeaderFormat,
        len: usize,
        deadline: &mut Deadline,
        mut kick: K,
    ) -> TraceResult<StageGrant<'a>>
    where
        K: FnMut(),
    {
        if len > self.max_block(header) {
            return Err(TraceError::InvalidArgument(
                "block does not fit in the staging ring",
            ));
        }
        let total = (header.len() + len) as u32;

        loop {
            let mut ring = self.ring.lock(deadline)?;
            if ring.is_empty() && ring.writable_size() < total {
                ring.reset();
            }
            if let Some(offset) = ring.produce_offset(total) {
                let mut grant = StageGrant {
                    ring,
                    offset,
                    header,
                    len,
                    outer: None,
                };
                grant.write_header(len);
                return Ok(grant);
            }
            drop(ring);

            kick();
            deadline.check()?;
            spin_hint();
        }
    }

    /// Copies `data` into one block.
    pub fn stage<K>(
        &self,
        header: HeaderFormat,
        data: &[u8],
        deadline: &mut Deadline,
        kick: K,
    ) -> TraceResult<()>
    where
        K: FnMut(),
    {
        let mut grant = self.reserve(header, data.len(), deadline, kick)?;
        grant.payload_mut().copy_from_slice(data);
        Ok(())
    }

    /// Hands up to `max` staged bytes to `sink` in contiguous chunks.
    pub fn drain<F>(&self, deadline: &mut Deadline, max: usize, sink: F) -> TraceResult<usize>
    where
        F: FnMut(&[u8]),
    {
        let mut ring = self.ring.lock(deadline)?;
        Ok(drain_into(&mut ring, max, sink))
    }

    /// Like [`StagingRing::drain`] but gives up immediately if the ring is busy.
    pub fn try_drain<F>(&self, max: usize, sink: F) -> Option<usize>
    where
        F: FnMut(&[u8]),
    {
        let mut ring = self.ring.try_lock()?;
        Some(drain_into(&mut ring, max, sink))
    }

    /// Bytes staged but not yet drained.
    pub fn staged(&self, deadline: &mut Deadline) -> TraceResult<u32> {
        Ok(self.ring.lock(deadline)?.len())
    }

    /// Like [`StagingRing::staged`] but gives up immediately if the ring is busy.
    pub fn try_staged(&self) -> Option<u32> {
        self.ring.try_lock().map(|ring| ring.len())
    }

    /// Drops everything staged.
    pub fn clear(&self, deadline: &mut Deadline) -> TraceResult<()> {
        self.ring.lock(deadline)?.reset();
        Ok(())
    }
}

impl fmt::Debug for StagingRing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StagingRing")
            .field("capacity", &self.capacity)
            .field("busy", &self.ring.is_locked())
            .finish()
    }
}

fn drain_into<F>(ring: &mut RingBuffer, max: usize, mut sink: F) -> usize
where
    F: FnMut(&[u8]),
{
    let mut drained = 0;
    while drained < max {
        let budget = u32::try_from(max - drained).unwrap_or(u32::MAX);
        let chunk = ring.readable_size().min(budget);
        if chunk == 0 {
            break;
        }
        let Some(bytes) = ring.consume(chunk) else {
            break;
        };
        sink(bytes);
        drained += chunk as usize;
    }
    drained
}

/// A reserved block inside a [`StagingRing`].
///
/// The ring stays locked while the grant is alive, so keep it short.
#[must_use = "the block is committed when the grant is dropped"]
pub struct StageGrant<'a> {
    // Released before `outer`.
    ring: LockedGuard<'a, RingBuffer>,
    offset: u32,
    header: HeaderFormat,
    len: usize,
    outer: Option<LockGuard<'a>>,
}

impl<'a> StageGrant<'a> {
    /// Payload bytes reserved.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        let header = self.header.len();
        let total = (header + self.len) as u32;
        &mut self.ring.span_mut(self.offset, total)[header..]
    }

    /// Keeps `guard` held until the block is committed.
    ///
    /// Encoders use this so a reservation cannot land between the blocks of
    /// another writer's record.
    pub fn holding(mut self, guard: LockGuard<'a>) -> Self {
        self.outer = Some(guard);
        self
    }

    /// Commits the block, recording that only `written` payload bytes are meaningful.
    pub fn commit(mut self, written: usize) {
        let written = written.min(self.len);
        self.write_header(written);
    }

    fn write_header(&mut self, written: usize) {
        if self.header.is_none() {
            return;
        }
        let header = BlockHeader {
            len: self.len as u16,
            core: current_core() as u8,
            written: written as u16,
        };
        let format = self.header;
        let span = self.ring.span_mut(self.offset, format.len() as u32);
        header.encode(format, span);
    }
}

impl fmt::Debug for StageGrant<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageGrant")
            .field("offset", &self.offset)
            .field("header", &self.header)
            .field("len", &self.len)
            .field("holding", &self.outer.is_some())
            .finish()
    }
}

/// Down-stream ring filled by the host and read by the target.
pub struct ReceiveRing {
    ring: Locked<Option<RingBuffer>>,
}

impl ReceiveRing {
    pub fn new() -> Self {
        Self {
            ring: Locked::new(None),
        }
    }

    /// Installs `storage` as the receive buffer, discarding anything unread.
    pub fn configure(&self, storage: Box<[u8]>, deadline: &mut Deadline) -> TraceResult<()> {
        let ring = RingBuffer::new(storage)?;
        *self.ring.lock(deadline)? = Some(ring);
        Ok(())
    }

    pub fn is_configured(&self, deadline: &mut Deadline) -> TraceResult<bool> {
        Ok(self.ring.lock(deadline)?.is_some())
    }

    /// Accepts as much of `data` as fits and returns the count.
    pub fn push(&self, data: &[u8], deadline: &mut Deadline) -> TraceResult<usize> {
        let mut guard = self.ring.lock(deadline)?;
        let ring = guard
            .as_mut()
            .ok_or(TraceError::InvalidState("receive buffer not configured"))?;

        let mut pushed = 0;
        while pushed < data.len() {
            let budget = u32::try_from(data.len() - pushed).unwrap_or(u32::MAX);
            let chunk = ring.writable_size().min(budget);
            if chunk == 0 {
                break;
            }
            let Some(span) = ring.produce(chunk) else {
                break;
            };
            span.copy_from_slice(&data[pushed..pushed + chunk as usize]);
            pushed += chunk as usize;
        }
        Ok(pushed)
    }

    /// Waits for down-stream bytes and copies up to `buf.len()` of them.
    pub fn read(&self, buf: &mut [u8], deadline: &mut Deadline) -> TraceResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            {
                let mut guard = self.ring.lock(deadline)?;
                let ring = guard
                    .as_mut()
                    .ok_or(TraceError::InvalidState("receive buffer not configured"))?;
                let copied = copy_out(ring, buf);
                if copied > 0 {
                    return Ok(copied);
                }
            }
            deadline.check()?;
            spin_hint();
        }
    }
}

impl Default for ReceiveRing {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ReceiveRing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReceiveRing")
            .field("busy", &self.ring.is_locked())
            .finish()
    }
}

fn copy_out(ring: &mut RingBuffer, buf: &mut [u8]) -> usize {
    let mut copied = 0;
    while copied < buf.len() {
        let budget = u32::try_from(buf.len() - copied).unwrap_or(u32::MAX);
        let chunk = ring.readable_size().min(budget);
        if chunk == 0 {
            break;
        }
        let Some(bytes) = ring.consume(chunk) else {
            break;
        };
        buf[copied..copied + bytes.len()].copy_from_slice(bytes);
        copied += bytes.len();
    }
    copied
}
