//! Single-producer/single-consumer byte ring with a shrinkable logical size.
//!
//! ```text
//!  rd <= wr:   |....RxxxxxxxxW.........|      occupied = [rd, wr)
//!  rd >  wr:   |xxxW.........Rxxxxx|---|      occupied = [rd, cur_size) ∪ [0, wr)
//!                                  ^cur_size  ^size
//! ```
//!
//! Every grant is contiguous. When a request does not fit in the tail but does
//! fit before the reader, the producer shrinks the logical size to the current
//! write position (`cur_size = wr`) and wraps. The skipped tail is not part of
//! the buffer for that lap; the full size comes back as soon as the reader
//! drains up to `cur_size`.
//!
//! One byte always stays free so `rd == wr` unambiguously means empty. The ring
//! does no synchronisation of its own: concurrent producer and consumer must be
//! serialised externally, normally by keeping the ring inside a [`crate::Locked`].

use std::fmt;

use crate::{TraceError, TraceResult};

/// Ring state over caller-provided storage.
pub struct RingBuffer<S = Box<[u8]>> {
    data: S,
    size: u32,
    cur_size: u32,
    rd: u32,
    wr: u32,
}

impl<S> RingBuffer<S>
where
    S: AsRef<[u8]> + AsMut<[u8]>,
{
    /// Wraps `data` as an empty ring. The whole slice becomes the allocated size.
    pub fn new(data: S) -> TraceResult<Self> {
        let len = data.as_ref().len();
        let size = u32::try_from(len)
            .map_err(|_| TraceError::InvalidArgument("ring storage exceeds u32 range"))?;
        if size == 0 {
            return Err(TraceError::InvalidArgument("ring storage must not be empty"));
        }
        Ok(Self {
            data,
            size,
            cur_size: size,
            rd: 0,
            wr: 0,
        })
    }

    /// Allocated size of the backing storage.
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Logical size for the current lap; below [`RingBuffer::size`] while shrunk.
    pub fn cur_size(&self) -> u32 {
        self.cur_size
    }

    pub fn read_pos(&self) -> u32 {
        self.rd
    }

    pub fn write_pos(&self) -> u32 {
        self.wr
    }

    pub fn is_empty(&self) -> bool {
        self.rd == self.wr
    }

    /// Total bytes produced but not yet consumed, across the wrap.
    pub fn len(&self) -> u32 {
        if self.rd <= self.wr {
            self.wr - self.rd
        } else {
            (self.cur_size - self.rd) + self.wr
        }
    }

    /// Forgets all data and restores the full logical size.
    pub fn reset(&mut self) {
        self.rd = 0;
        self.wr = 0;
        self.cur_size = self.size;
    }

    pub fn into_inner(self) -> S {
        self.data
    }

    /// Reserves `size` contiguous bytes for writing and advances the write cursor.
    ///
    /// `None` means the request cannot be granted right now; it is a
    /// backpressure signal, not a fault.
    pub fn produce(&mut self, size: u32) -> Option<&mut [u8]> {
        let offset = self.produce_offset(size)?;
        Some(self.span_mut(offset, size))
    }

    /// Returns the next `size` readable bytes and advances the read cursor.
    pub fn consume(&mut self, size: u32) -> Option<&[u8]> {
        let offset = self.consume_offset(size)?;
        let start = offset as usize;
        Some(&self.data.as_ref()[start..start + size as usize])
    }

    /// Largest contiguous span [`RingBuffer::consume`] can return now.
    pub fn readable_size(&self) -> u32 {
        if self.rd <= self.wr {
            self.wr - self.rd
        } else {
            self.cur_size - self.rd
        }
    }

    /// Largest contiguous span [`RingBuffer::produce`] can grant at the write cursor.
    pub fn writable_size(&self) -> u32 {
        if self.rd <= self.wr {
            let tail = self.size - self.wr;
            if tail > 0 && self.rd == 0 {
                tail - 1
            } else {
                tail
            }
        } else {
            self.rd - self.wr - 1
        }
    }

    /// Producer half of the cursor protocol; returns the offset of the grant.
    pub(crate) fn produce_offset(&mut self, size: u32) -> Option<u32> {
        let offset = self.wr;
        if self.rd <= self.wr {
            let end = self.wr.checked_add(size)?;
            if end < self.size {
                self.wr = end;
                return Some(offset);
            }
            // Any wrap would land the writer on an unconsumed byte 0.
            if self.rd == 0 {
                return None;
            }
            if end == self.size {
                self.wr = 0;
                return Some(offset);
            }
            if size > self.rd - 1 {
                return None;
            }
            // Shrink for this lap so the grant starts at 0 instead of straddling the end.
            self.cur_size = self.wr;
            self.wr = 0;
            if self.rd == self.cur_size {
                self.rd = 0;
                self.cur_size = self.size;
            }
            self.wr = size;
            log::trace!(
                "ring shrunk to {} of {} bytes for a {size} byte grant",
                self.cur_size,
                self.size
            );
            Some(0)
        } else {
            if size > self.rd - self.wr - 1 {
                return None;
            }
            self.wr += size;
            Some(offset)
        }
    }

    /// Consumer half of the cursor protocol; returns the offset of the span.
    pub(crate) fn consume_offset(&mut self, size: u32) -> Option<u32> {
        let offset = self.rd;
        let end = self.rd.checked_add(size)?;
        if self.rd <= self.wr {
            if end > self.wr {
                return None;
            }
            self.rd = end;
        } else {
            if end > self.cur_size {
                return None;
            }
            if end == self.cur_size {
                self.cur_size = self.size;
                self.rd = 0;
            } else {
                self.rd = end;
            }
        }
        Some(offset)
    }

    pub(crate) fn span_mut(&mut self, offset: u32, len: u32) -> &mut [u8] {
        let start = offset as usize;
        &mut self.data.as_mut()[start..start + len as usize]
    }
}

impl<S> fmt::Debug for RingBuffer<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingBuffer")
            .field("size", &self.size)
            .field("cur_size", &self.cur_size)
            .field("rd", &self.rd)
            .field("wr", &self.wr)
            .finish()
    }
}
