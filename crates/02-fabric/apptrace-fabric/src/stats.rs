use std::sync::atomic::{AtomicU64, Ordering};

use apptrace::{TraceError, TraceResult};

#[derive(Default)]
pub(crate) struct SessionMetrics {
    writes: AtomicU64,
    bytes: AtomicU64,
    timeouts: AtomicU64,
    errors: AtomicU64,
    flushes: AtomicU64,
}

impl SessionMetrics {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_write(&self, len: usize, result: &TraceResult<()>) {
        match result {
            Ok(()) => {
                self.writes.fetch_add(1, Ordering::Relaxed);
                self.bytes.fetch_add(len as u64, Ordering::Relaxed);
            }
            Err(err) => self.record_error(err),
        }
    }

    pub(crate) fn record_flush(&self, result: &TraceResult<()>) {
        match result {
            Ok(()) => {
                self.flushes.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => self.record_error(err),
        }
    }

    fn record_error(&self, err: &TraceError) {
        if err.is_timeout() {
            self.timeouts.fetch_add(1, Ordering::Relaxed);
        } else {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn snapshot(&self) -> SessionStats {
        SessionStats {
            writes: self.writes.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time counters of a [`crate::Session`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Writes accepted by the encoder.
    pub writes: u64,
    /// Payload bytes of accepted writes.
    pub bytes: u64,
    /// Writes and flushes that ran out of time.
    pub timeouts: u64,
    /// Writes and flushes that failed for any other reason.
    pub errors: u64,
    pub flushes: u64,
}
