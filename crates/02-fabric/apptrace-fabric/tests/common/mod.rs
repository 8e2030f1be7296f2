//! In-memory plugins used by the fabric integration tests.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use apptrace_fabric::{
    downcast_config, ConfigKey, Deadline, Encoder, EncoderDescriptor, EncoderState, LinkKind,
    LockGuard, OpaqueConfig, PanicContext, TraceError, TraceResult, Transport,
    TransportDescriptor,
};
use parking_lot::Mutex;

/// Host-visible state of a loopback transport.
pub struct LoopbackState {
    pub sent: Mutex<Vec<u8>>,
    pub capacity: usize,
    pub flushes: AtomicUsize,
    pub panic_flushes: AtomicUsize,
    config: Mutex<[u32; 3]>,
    rx: Mutex<Option<VecDeque<u8>>>,
    claimed: AtomicBool,
}

/// Config handed to the loopback descriptor; the test keeps a clone to inspect.
#[derive(Clone)]
pub struct LoopbackHandle(pub Arc<LoopbackState>);

impl LoopbackHandle {
    pub fn new(capacity: usize) -> Self {
        Self(Arc::new(LoopbackState {
            sent: Mutex::new(Vec::new()),
            capacity,
            flushes: AtomicUsize::new(0),
            panic_flushes: AtomicUsize::new(0),
            config: Mutex::new([0, 1_000, 0]),
            rx: Mutex::new(None),
            claimed: AtomicBool::new(false),
        }))
    }

    pub fn sent(&self) -> Vec<u8> {
        self.0.sent.lock().clone()
    }

    pub fn flushes(&self) -> usize {
        self.0.flushes.load(Ordering::SeqCst)
    }

    pub fn panic_flushes(&self) -> usize {
        self.0.panic_flushes.load(Ordering::SeqCst)
    }

    pub fn host_send(&self, data: &[u8]) {
        if let Some(rx) = self.0.rx.lock().as_mut() {
            rx.extend(data.iter().copied());
        }
    }
}

struct Loopback {
    state: Arc<LoopbackState>,
}

impl Transport for Loopback {
    fn read(&self, buf: &mut [u8], deadline: &mut Deadline) -> TraceResult<usize> {
        loop {
            {
                let mut rx = self.state.rx.lock();
                let rx = rx
                    .as_mut()
                    .ok_or(TraceError::InvalidState("receive buffer not configured"))?;
                if !rx.is_empty() {
                    let n = buf.len().min(rx.len());
                    for slot in buf.iter_mut().take(n) {
                        *slot = rx.pop_front().unwrap_or_default();
                    }
                    return Ok(n);
                }
            }
            deadline.check()?;
            std::hint::spin_loop();
        }
    }

    fn write(&self, data: &[u8], deadline: &mut Deadline) -> TraceResult<()> {
        loop {
            {
                let mut sent = self.state.sent.lock();
                if sent.len() + data.len() <= self.state.capacity {
                    sent.extend_from_slice(data);
                    return Ok(());
                }
            }
            deadline.check()?;
            std::hint::spin_loop();
        }
    }

    fn flush(&self, min_size: u32, _deadline: &mut Deadline) -> TraceResult<()> {
        if self.state.sent.lock().len() >= min_size as usize {
            self.state.flushes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn flush_without_lock(&self) -> TraceResult<()> {
        self.state.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn configure_receive_buffer(&self, storage: Box<[u8]>) -> TraceResult<()> {
        *self.state.rx.lock() = Some(VecDeque::with_capacity(storage.len()));
        Ok(())
    }

    fn is_host_connected(&self) -> bool {
        true
    }

    fn link_kind(&self) -> LinkKind {
        LinkKind::Unknown
    }

    fn set_config(&self, key: ConfigKey, value: u32) -> TraceResult<()> {
        self.state.config.lock()[key as usize] = value;
        Ok(())
    }

    fn get_config(&self, key: ConfigKey) -> TraceResult<u32> {
        Ok(self.state.config.lock()[key as usize])
    }

    fn panic_flush(&self, _info: &PanicContext<'_>) {
        self.state.panic_flushes.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct LoopbackDescriptor;

impl TransportDescriptor for LoopbackDescriptor {
    fn init(&self, cfg: OpaqueConfig<'_>) -> TraceResult<Box<dyn Transport>> {
        let handle = downcast_config::<LoopbackHandle>(cfg, "loopback expects a LoopbackHandle")?
            .cloned()
            .unwrap_or_else(|| LoopbackHandle::new(usize::MAX));
        if handle.0.claimed.swap(true, Ordering::SeqCst) {
            return Err(TraceError::InvalidState("loopback already bound"));
        }
        Ok(Box::new(Loopback { state: handle.0 }))
    }
}

/// Transport whose init always fails.
pub struct BrokenDescriptor;

impl TransportDescriptor for BrokenDescriptor {
    fn init(&self, _cfg: OpaqueConfig<'_>) -> TraceResult<Box<dyn Transport>> {
        Err(TraceError::NoMemory { requested: 4096 })
    }
}

/// Forwards bytes unchanged under the encoder lock.
#[derive(Default)]
pub struct Passthrough {
    state: EncoderState,
}

impl Encoder for Passthrough {
    fn init(&self, transport: Box<dyn Transport>, _cfg: OpaqueConfig<'_>) -> TraceResult<()> {
        self.state.bind(transport)
    }

    fn is_ready(&self) -> bool {
        self.state.is_ready()
    }

    fn write(&self, data: &[u8], deadline: &mut Deadline) -> TraceResult<()> {
        let transport = self.state.transport()?;
        let _guard = self.state.take_lock(deadline)?;
        transport.write(data, deadline)
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

pub struct PassthroughDescriptor;

impl EncoderDescriptor for PassthroughDescriptor {
    fn create(&self) -> TraceResult<Box<dyn Encoder>> {
        Ok(Box::new(Passthrough::default()))
    }
}
