//! Debug-probe transport over a shared memory window.
//!
//! The target stages blocks in a [`StagingRing`]; the probe, modelled by a
//! [`HostWindow`], pulls them out whenever it is attached. While no host is
//! attached a full ring is emptied instead of blocking the writer, so tracing
//! never stalls firmware that runs without a debugger.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use apptrace::{
    BlockHeader, Deadline, HeaderFormat, ReceiveRing, StageGrant, StagingRing, TraceError,
    TraceResult,
};
use apptrace_fabric::{
    downcast_config, panic_flush_timeout, ConfigKey, LinkKind, OpaqueConfig, PanicContext,
    Transport, TransportDescriptor,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MembufConfig {
    /// Up-stream staging bytes.
    pub capacity: usize,
    /// 0, 2 or 4.
    pub header_size: u32,
    pub flush_timeout_us: u32,
    pub flush_threshold: u32,
    /// Down-stream buffer installed at creation; 0 leaves it to `configure_receive_buffer`.
    pub rx_capacity: usize,
}

impl Default for MembufConfig {
    fn default() -> Self {
        Self {
            capacity: 16 * 1024,
            header_size: 2,
            flush_timeout_us: 500_000,
            flush_threshold: 0,
            rx_capacity: 0,
        }
    }
}

struct Shared {
    staging: StagingRing,
    rx: ReceiveRing,
    attached: AtomicBool,
    claimed: AtomicBool,
    header_size: AtomicU32,
    flush_timeout_us: AtomicU32,
    flush_threshold: AtomicU32,
    discarded: AtomicU64,
}

impl Shared {
    fn header(&self) -> HeaderFormat {
        HeaderFormat::from_size(self.header_size.load(Ordering::Relaxed)).unwrap_or_default()
    }

    fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }

    /// Empties the ring while nobody is listening.
    fn discard_if_detached(&self) {
        if self.is_attached() {
            return;
        }
        if let Some(dropped) = self.staging.try_drain(usize::MAX, |_| {}) {
            if dropped > 0 {
                self.discarded.fetch_add(dropped as u64, Ordering::Relaxed);
                log::trace!("membuf: host detached, discarded {dropped} staged bytes");
            }
        }
    }
}

/// The memory window shared between the target and the debug probe.
///
/// Pass a `MembufLink` as the transport config and keep a [`HostWindow`] to
/// play the probe.
#[derive(Clone)]
pub struct MembufLink {
    shared: Arc<Shared>,
}

impl MembufLink {
    pub fn new(config: MembufConfig) -> TraceResult<Self> {
        if HeaderFormat::from_size(config.header_size).is_none() {
            return Err(TraceError::InvalidArgument("header size must be 0, 2 or 4"));
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
                staging: StagingRing::new(config.capacity)?,
                rx,
                attached: AtomicBool::new(false),
                claimed: AtomicBool::new(false),
                header_size: AtomicU32::new(config.header_size),
                flush_timeout_us: AtomicU32::new(config.flush_timeout_us),
                flush_threshold: AtomicU32::new(config.flush_threshold),
                discarded: AtomicU64::new(0),
            }),
        })
    }

    pub fn host(&self) -> HostWindow {
        HostWindow {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl fmt::Debug for MembufLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MembufLink")
            .field("staging", &self.shared.staging)
            .field("attached", &self.shared.is_attached())
            .finish()
    }
}

/// A block pulled out of the window by the host.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostBlock {
    pub core: u8,
    pub payload: Vec<u8>,
}

/// Host-side view of the window.
#[derive(Clone)]
pub struct HostWindow {
    shared: Arc<Shared>,
}

impl HostWindow {
    pub fn attach(&self) {
        self.shared.attached.store(true, Ordering::Release);
        log::debug!("membuf: host attached");
    }

    pub fn detach(&self) {
        self.shared.attached.store(false, Ordering::Release);
        log::debug!("membuf: host detached");
    }

    pub fn is_attached(&self) -> bool {
        self.shared.is_attached()
    }

    /// Pulls everything staged, headers included.
    ///
    /// A grant holds the ring until it is committed, so the window only ever
    /// contains whole blocks and every drain ends on a block boundary.
    pub fn drain_bytes(&self) -> TraceResult<Vec<u8>> {
        let mut out = Vec::new();
        self.shared
            .staging
            .drain(&mut Deadline::infinite(), usize::MAX, |chunk| {
                out.extend_from_slice(chunk)
            })?;
        Ok(out)
    }

    /// Pulls everything staged and splits it into blocks.
    ///
    /// Without headers the drained bytes come back as one block from core 0.
    pub fn drain_blocks(&self) -> TraceResult<Vec<HostBlock>> {
        let bytes = self.drain_bytes()?;
        Ok(split_blocks(self.shared.header(), &bytes))
    }

    /// Sends down-stream bytes; returns how many fit.
    pub fn send(&self, data: &[u8]) -> TraceResult<usize> {
        self.shared.rx.push(data, &mut Deadline::infinite())
    }

    pub fn staged(&self) -> TraceResult<u32> {
        self.shared.staging.staged(&mut Deadline::infinite())
    }

    /// Bytes dropped while detached.
    pub fn discarded(&self) -> u64 {
        self.shared.discarded.load(Ordering::Relaxed)
    }
}

fn split_blocks(format: HeaderFormat, bytes: &[u8]) -> Vec<HostBlock> {
    if format.is_none() {
        if bytes.is_empty() {
            return Vec::new();
        }
        return vec![HostBlock {
            core: 0,
            payload: bytes.to_vec(),
        }];
    }

    let mut blocks = Vec::new();
    let mut rest = bytes;
    while let Some(header) = BlockHeader::decode(format, rest) {
        let end = format.len() + usize::from(header.len);
        if end > rest.len() {
            break;
        }
        let written = usize::from(header.written.min(header.len));
        blocks.push(HostBlock {
            core: header.core,
            payload: rest[format.len()..format.len() + written].to_vec(),
        });
        rest = &rest[end..];
    }
    if !rest.is_empty() {
        // Only reachable when the header size changed with blocks still staged.
        log::warn!("membuf: dropped {} bytes that do not parse as blocks", rest.len());
    }
    blocks
}

impl fmt::Debug for HostWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostWindow")
            .field("attached", &self.is_attached())
            .finish()
    }
}

pub struct MembufTransport {
    shared: Arc<Shared>,
}

impl Transport for MembufTransport {
    fn read(&self, buf: &mut [u8], deadline: &mut Deadline) -> TraceResult<usize> {
        self.shared.rx.read(buf, deadline)
    }

    fn write(&self, data: &[u8], deadline: &mut Deadline) -> TraceResult<()> {
        let shared = &self.shared;
        shared
            .staging
            .stage(shared.header(), data, deadline, || shared.discard_if_detached())
    }

    fn max_write(&self) -> usize {
        self.shared.staging.max_block(self.shared.header())
    }

    fn reserve(&self, len: usize, deadline: &mut Deadline) -> TraceResult<StageGrant<'_>> {
        let shared = &self.shared;
        shared
            .staging
            .reserve(shared.header(), len, deadline, || shared.discard_if_detached())
    }

    fn flush(&self, min_size: u32, deadline: &mut Deadline) -> TraceResult<()> {
        if !self.shared.is_attached() {
            return Ok(());
        }
        if self.shared.staging.staged(deadline)? < min_size {
            return Ok(());
        }
        loop {
            if !self.shared.is_attached() || self.shared.staging.staged(deadline)? == 0 {
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
            if !self.shared.is_attached() || self.shared.staging.try_staged() == Some(0) {
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
        self.shared.is_attached()
    }

    fn link_kind(&self) -> LinkKind {
        LinkKind::DebugProbe
    }

    fn set_config(&self, key: ConfigKey, value: u32) -> TraceResult<()> {
        match key {
            ConfigKey::HeaderSize => {
                HeaderFormat::from_size(value)
                    .ok_or(TraceError::InvalidArgument("header size must be 0, 2 or 4"))?;
                self.shared.header_size.store(value, Ordering::Relaxed);
            }
            ConfigKey::FlushTimeout => self.shared.flush_timeout_us.store(value, Ordering::Relaxed),
            ConfigKey::FlushThreshold => {
                self.shared.flush_threshold.store(value, Ordering::Relaxed)
            }
        }
        Ok(())
    }

    fn get_config(&self, key: ConfigKey) -> TraceResult<u32> {
        let value = match key {
            ConfigKey::HeaderSize => &self.shared.header_size,
            ConfigKey::FlushTimeout => &self.shared.flush_timeout_us,
            ConfigKey::FlushThreshold => &self.shared.flush_threshold,
        };
        Ok(value.load(Ordering::Relaxed))
    }

    fn panic_flush(&self, _info: &PanicContext<'_>) {
        let _ = self.flush_without_lock();
    }
}

impl Drop for MembufTransport {
    fn drop(&mut self) {
        self.shared.claimed.store(false, Ordering::Release);
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct MembufDescriptor;

impl TransportDescriptor for MembufDescriptor {
    fn init(&self, cfg: OpaqueConfig<'_>) -> TraceResult<Box<dyn Transport>> {
        let link = match downcast_config::<MembufLink>(cfg, "membuf transport expects a MembufLink")?
        {
            Some(link) => link.clone(),
            None => MembufLink::new(MembufConfig::default())?,
        };
        if link.shared.claimed.swap(true, Ordering::AcqRel) {
            return Err(TraceError::InvalidState(
                "membuf link is already bound to a transport",
            ));
        }
        log::debug!(
            "membuf: transport ready, {} byte window",
            link.shared.staging.capacity()
        );
        Ok(Box::new(MembufTransport {
            shared: link.shared,
        }))
    }
}
