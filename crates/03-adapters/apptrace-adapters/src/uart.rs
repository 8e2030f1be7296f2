//! Serial-line transport.
//!
//! Staged bytes are pumped into a bounded TX FIFO that a [`UartLine`] empties
//! on the host side. The line carries a plain byte stream, so blocks have no
//! header and the host is always considered connected.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use apptrace::{
    Deadline, HeaderFormat, ReceiveRing, StageGrant, StagingRing, TraceError, TraceResult,
};
use apptrace_fabric::{
    downcast_config, panic_flush_timeout, ConfigKey, LinkKind, OpaqueConfig, PanicContext,
    Transport, TransportDescriptor,
};
use parking_lot::Mutex;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UartConfig {
    pub staging_capacity: usize,
    pub tx_fifo_capacity: usize,
    pub rx_capacity: usize,
    pub flush_timeout_us: u32,
    pub flush_threshold: u32,
}

impl Default for UartConfig {
    fn default() -> Self {
        Self {
            staging_capacity: 4 * 1024,
            tx_fifo_capacity: 128,
            rx_capacity: 256,
            flush_timeout_us: 500_000,
            flush_threshold: 0,
        }
    }
}

struct Shared {
    staging: StagingRing,
    tx_fifo: Mutex<VecDeque<u8>>,
    fifo_capacity: usize,
    rx: ReceiveRing,
    claimed: AtomicBool,
    flush_timeout_us: AtomicU32,
    flush_threshold: AtomicU32,
}

impl Shared {
    /// Moves staged bytes into the FIFO; returns how many moved.
    fn pump(&self) -> usize {
        let mut fifo = self.tx_fifo.lock();
        let free = self.fifo_capacity.saturating_sub(fifo.len());
        if free == 0 {
            return 0;
        }
        self.staging
            .try_drain(free, |chunk| fifo.extend(chunk.iter().copied()))
            .unwrap_or(0)
    }

    fn pending(&self, deadline: &mut Deadline) -> TraceResult<usize> {
        let staged = self.staging.staged(deadline)? as usize;
        Ok(staged + self.tx_fifo.lock().len())
    }

    fn try_idle(&self) -> bool {
        self.staging.try_staged() == Some(0)
            && self.tx_fifo.try_lock().map_or(false, |fifo| fifo.is_empty())
    }
}

/// Host end of the serial line.
#[derive(Clone)]
pub struct UartLine {
    shared: Arc<Shared>,
}

impl UartLine {
    pub fn new(config: UartConfig) -> TraceResult<Self> {
        if config.tx_fifo_capacity == 0 {
            return Err(TraceError::InvalidArgument("tx fifo must hold at least one byte"));
        }
        let rx = ReceiveRing::new();
        if config.rx_capacity > 0 {
            rx.configure(
                apptrace::alloc_buffer(config.rx_capacity)?,
                &mut Deadline::infinite(),
            )?;
        }
        Ok(Self {
            shared: Arc::new(Shared {
                staging: StagingRing::new(config.staging_capacity)?,
                tx_fifo: Mutex::new(VecDeque::with_capacity(config.tx_fifo_capacity)),
                fifo_capacity: config.tx_fifo_capacity,
                rx,
                claimed: AtomicBool::new(false),
                flush_timeout_us: AtomicU32::new(config.flush_timeout_us),
                flush_threshold: AtomicU32::new(config.flush_threshold),
            }),
        })
    }

    /// Takes whatever sits in the TX FIFO, then refills it from staging.
    pub fn take_tx(&self) -> Vec<u8> {
        let out: Vec<u8> = self.shared.tx_fifo.lock().drain(..).collect();
        self.shared.pump();
        out
    }

    pub fn pending_tx(&self) -> usize {
        self.shared.tx_fifo.lock().len()
    }

    /// Feeds bytes into the target's RX buffer; returns how many fit.
    pub fn inject_rx(&self, data: &[u8]) -> TraceResult<usize> {
        self.shared.rx.push(data, &mut Deadline::infinite())
    }
}

impl fmt::Debug for UartLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UartLine")
            .field("staging", &self.shared.staging)
            .field("fifo_capacity", &self.shared.fifo_capacity)
            .finish()
    }
}

pub struct UartTransport {
    shared: Arc<Shared>,
}

impl Transport for UartTransport {
    fn read(&self, buf: &mut [u8], deadline: &mut Deadline) -> TraceResult<usize> {
        self.shared.rx.read(buf, deadline)
    }

    fn write(&self, data: &[u8], deadline: &mut Deadline) -> TraceResult<()> {
        let shared = &self.shared;
        shared.staging.stage(HeaderFormat::None, data, deadline, || {
            shared.pump();
        })?;
        shared.pump();
        Ok(())
    }

    fn max_write(&self) -> usize {
        self.shared.staging.max_block(HeaderFormat::None)
    }

    fn reserve(&self, len: usize, deadline: &mut Deadline) -> TraceResult<StageGrant<'_>> {
        let shared = &self.shared;
        shared
            .staging
            .reserve(HeaderFormat::None, len, deadline, || {
                shared.pump();
            })
    }

    fn flush(&self, min_size: u32, deadline: &mut Deadline) -> TraceResult<()> {
        self.shared.pump();
        if self.shared.pending(deadline)? < min_size as usize {
            return Ok(());
        }
        loop {
            self.shared.pump();
            if self.shared.pending(deadline)? == 0 {
                return Ok(());
            }
            deadline.check()?;
            std::hint::spin_loop();
        }
    }

    fn flush_without_lock(&self) -> TraceResult<()> {
        let raw = self.shared.flush_timeout_us.load(Ordering::Relaxed);
        let mut deadline = Deadline::new(panic_flush_timeout(Some(raw)));
        loop {
            self.shared.pump();
            if self.shared.try_idle() {
                return Ok(());
            }
            deadline.check()?;
            std::hint::spin_loop();
        }
    }

    fn configure_receive_buffer(&self, storage: Box<[u8]>) -> TraceResult<()> {
        self.shared.rx.configure(storage, &mut Deadline::infinite())
    }

    fn is_host_connected(&self) -> bool {
        true
    }

    fn link_kind(&self) -> LinkKind {
        LinkKind::Uart
    }

    fn set_config(&self, key: ConfigKey, value: u32) -> TraceResult<()> {
        match key {
            ConfigKey::HeaderSize if value == 0 => {}
            ConfigKey::HeaderSize => {
                return Err(TraceError::InvalidArgument("uart blocks carry no header"))
            }
            ConfigKey::FlushTimeout => self.shared.flush_timeout_us.store(value, Ordering::Relaxed),
            ConfigKey::FlushThreshold => {
                self.shared.flush_threshold.store(value, Ordering::Relaxed)
            }
        }
        Ok(())
    }

    fn get_config(&self, key: ConfigKey) -> TraceResult<u32> {
        Ok(match key {
            ConfigKey::HeaderSize => 0,
            ConfigKey::FlushTimeout => self.shared.flush_timeout_us.load(Ordering::Relaxed),
            ConfigKey::FlushThreshold => self.shared.flush_threshold.load(Ordering::Relaxed),
        })
    }

    fn panic_flush(&self, _info: &PanicContext<'_>) {
        let _ = self.flush_without_lock();
    }
}

impl Drop for UartTransport {
    fn drop(&mut self) {
        self.shared.claimed.store(false, Ordering::Release);
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct UartDescriptor;

impl TransportDescriptor for UartDescriptor {
    fn init(&self, cfg: OpaqueConfig<'_>) -> TraceResult<Box<dyn Transport>> {
        let line = match downcast_config::<UartLine>(cfg, "uart transport expects a UartLine")? {
            Some(line) => line.clone(),
            None => UartLine::new(UartConfig::default())?,
        };
        if line.shared.claimed.swap(true, Ordering::AcqRel) {
            return Err(TraceError::InvalidState(
                "uart line is already bound to a transport",
            ));
        }
        log::debug!(
            "uart: transport ready, {} byte fifo",
            line.shared.fifo_capacity
        );
        Ok(Box::new(UartTransport {
            shared: line.shared,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use apptrace::Timeout;

    fn transport(config: UartConfig) -> (Box<dyn Transport>, UartLine) {
        let line = UartLine::new(config).unwrap();
        let transport = UartDescriptor.init(Some(&line)).unwrap();
        (transport, line)
    }

    #[test]
    fn writes_land_in_the_fifo_in_order() {
        let (transport, line) = transport(UartConfig {
            tx_fifo_capacity: 4,
            ..UartConfig::default()
        });
        transport.write(b"hello", &mut Deadline::infinite()).unwrap();
        assert_eq!(line.pending_tx(), 4);

        let mut received = Vec::new();
        loop {
            let chunk = line.take_tx();
            if chunk.is_empty() {
                break;
            }
            received.extend(chunk);
        }
        assert_eq!(received, b"hello");
    }

    #[test]
    fn flush_times_out_while_the_host_is_not_reading() {
        let (transport, line) = transport(UartConfig::default());
        transport.write(b"stuck", &mut Deadline::infinite()).unwrap();
        let err = transport
            .flush(0, &mut Deadline::new(Timeout::Micros(200)))
            .unwrap_err();
        assert!(err.is_timeout());

        assert_eq!(line.take_tx(), b"stuck");
        transport.flush(0, &mut Deadline::immediate()).unwrap();
    }

    #[test]
    fn flush_below_threshold_returns_immediately() {
        let (transport, _line) = transport(UartConfig::default());
        transport.write(b"abc", &mut Deadline::infinite()).unwrap();
        transport.flush(16, &mut Deadline::immediate()).unwrap();
    }

    #[test]
    fn only_headerless_blocks_are_accepted() {
        let (transport, _line) = transport(UartConfig::default());
        assert_eq!(
            transport.set_config(ConfigKey::HeaderSize, 2),
            Err(TraceError::InvalidArgument("uart blocks carry no header"))
        );
        transport.set_config(ConfigKey::HeaderSize, 0).unwrap();
        assert_eq!(transport.get_config(ConfigKey::HeaderSize).unwrap(), 0);
        assert_eq!(transport.link_kind(), LinkKind::Uart);
        assert!(transport.is_host_connected());
    }

    #[test]
    fn injected_bytes_are_read_back() {
        let (transport, line) = transport(UartConfig {
            rx_capacity: 8,
            ..UartConfig::default()
        });
        assert_eq!(line.inject_rx(b"0123456789").unwrap(), 7);
        let mut buf = [0u8; 16];
        let n = transport.read(&mut buf, &mut Deadline::infinite()).unwrap();
        assert_eq!(&buf[..n], b"0123456");
    }

    #[test]
    fn empty_fifo_is_rejected() {
        let err = UartLine::new(UartConfig {
            tx_fifo_capacity: 0,
            ..UartConfig::default()
        })
        .unwrap_err();
        assert!(matches!(err, TraceError::InvalidArgument(_)));
    }
}
