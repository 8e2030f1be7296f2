//! A session binds one encoder to one transport and is what applications write to.

use std::fmt;
use std::io::Write as _;

use apptrace::{Deadline, StageGrant, TraceError, TraceResult};
use smallvec::SmallVec;

use crate::config::{panic_flush_timeout, TransportSettings};
use crate::port::{ConfigKey, Encoder, LinkKind, OpaqueConfig, PanicContext, Transport};
use crate::registry::Registry;
use crate::stats::{SessionMetrics, SessionStats};

/// Everything [`Session::open`] needs to pick and configure its plugins.
#[derive(Clone, Copy, Default)]
pub struct SessionParams<'a> {
    /// Reserved for the core; passed through untouched.
    pub core_reserved: OpaqueConfig<'a>,
    pub encoder_name: &'a str,
    pub encoder_cfg: OpaqueConfig<'a>,
    pub transport_name: &'a str,
    pub transport_cfg: OpaqueConfig<'a>,
    /// Applied with `set_config` once the transport is up.
    pub settings: Option<TransportSettings>,
}

impl<'a> SessionParams<'a> {
    pub fn new(encoder_name: &'a str, transport_name: &'a str) -> Self {
        Self {
            encoder_name,
            transport_name,
            ..Self::default()
        }
    }

    pub fn with_encoder_cfg(mut self, cfg: &'a (dyn std::any::Any + Send + Sync)) -> Self {
        self.encoder_cfg = Some(cfg);
        self
    }

    pub fn with_transport_cfg(mut self, cfg: &'a (dyn std::any::Any + Send + Sync)) -> Self {
        self.transport_cfg = Some(cfg);
        self
    }

    pub fn with_core_reserved(mut self, cfg: &'a (dyn std::any::Any + Send + Sync)) -> Self {
        self.core_reserved = Some(cfg);
        self
    }

    pub fn with_settings(mut self, settings: TransportSettings) -> Self {
        self.settings = Some(settings);
        self
    }
}

impl fmt::Debug for SessionParams<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionParams")
            .field("encoder_name", &self.encoder_name)
            .field("encoder_cfg", &self.encoder_cfg.is_some())
            .field("transport_name", &self.transport_name)
            .field("transport_cfg", &self.transport_cfg.is_some())
            .field("settings", &self.settings)
            .finish()
    }
}

/// An open encoder/transport pair. There is no close path; a session lives
/// until the process ends.
pub struct Session {
    encoder: Box<dyn Encoder>,
    encoder_name: String,
    transport_name: String,
    metrics: SessionMetrics,
}

impl Session {
    /// Opens a session against the process-wide [`Registry::global`].
    pub fn open(params: SessionParams<'_>) -> TraceResult<Self> {
        Self::open_in(Registry::global(), params)
    }

    /// Opens a session against an explicit registry.
    pub fn open_in(registry: &Registry, params: SessionParams<'_>) -> TraceResult<Self> {
        if params.encoder_name.is_empty() {
            return Err(TraceError::InvalidArgument("encoder name must not be empty"));
        }
        if params.transport_name.is_empty() {
            return Err(TraceError::InvalidArgument(
                "transport name must not be empty",
            ));
        }

        let encoder_desc = registry.find_encoder(params.encoder_name).ok_or_else(|| {
            TraceError::not_found(format!("encoder `{}`", params.encoder_name))
        })?;
        let transport_desc = registry
            .find_transport(params.transport_name)
            .ok_or_else(|| {
                TraceError::not_found(format!("transport `{}`", params.transport_name))
            })?;

        let transport = transport_desc.init(params.transport_cfg).map_err(|err| {
            tracing::warn!(transport = params.transport_name, %err, "transport init failed");
            err
        })?;
        let encoder = encoder_desc.create()?;
        encoder.init(transport, params.encoder_cfg)?;

        let session = Self {
            encoder,
            encoder_name: params.encoder_name.to_owned(),
            transport_name: params.transport_name.to_owned(),
            metrics: SessionMetrics::new(),
        };

        if let Some(settings) = params.settings {
            let transport = session.transport()?;
            for (key, value) in settings.entries() {
                transport.set_config(key, value)?;
            }
        }

        tracing::info!(
            encoder = params.encoder_name,
            transport = params.transport_name,
            link = %session.link_kind(),
            "trace session ready"
        );
        Ok(session)
    }

    pub fn encoder_name(&self) -> &str {
        &self.encoder_name
    }

    pub fn transport_name(&self) -> &str {
        &self.transport_name
    }

    pub fn encoder(&self) -> &dyn Encoder {
        self.encoder.as_ref()
    }

    fn transport(&self) -> TraceResult<&dyn Transport> {
        self.encoder.transport()
    }

    /// Hands `data` to the encoder. A `TimedOut` result means the event was dropped.
    pub fn write(&self, data: &[u8], deadline: &mut Deadline) -> TraceResult<()> {
        let result = self.encoder.write(data, deadline);
        self.metrics.record_write(data.len(), &result);
        result
    }

    /// Formats `args` on the stack and writes the result as one record.
    pub fn write_fmt(&self, args: fmt::Arguments<'_>, deadline: &mut Deadline) -> TraceResult<()> {
        let mut line: SmallVec<[u8; 128]> = SmallVec::new();
        line.write_fmt(args)
            .map_err(|_| TraceError::InvalidArgument("format arguments failed"))?;
        self.write(&line, deadline)
    }

    /// Reserves `len` bytes directly in transport staging memory.
    ///
    /// The block is committed when the grant is dropped or passed to
    /// [`StageGrant::commit`]. Other writers wait until then.
    pub fn reserve(&self, len: usize, deadline: &mut Deadline) -> TraceResult<StageGrant<'_>> {
        let grant = self.encoder.reserve(len, deadline);
        if grant.is_ok() {
            self.metrics.record_write(len, &Ok(()));
        }
        grant
    }

    /// Pushes staged data to the host if at least `FlushThreshold` bytes are pending.
    pub fn flush(&self, deadline: &mut Deadline) -> TraceResult<()> {
        let result = self.flush_locked(deadline);
        self.metrics.record_flush(&result);
        result
    }

    fn flush_locked(&self, deadline: &mut Deadline) -> TraceResult<()> {
        let transport = self.transport()?;
        let _guard = self.encoder.take_lock(deadline)?;
        let threshold = transport.get_config(ConfigKey::FlushThreshold).unwrap_or(0);
        transport.flush(threshold, deadline)
    }

    /// Flush for contexts that cannot wait for the encoder lock.
    pub fn flush_without_lock(&self) -> TraceResult<()> {
        let result = self.transport()?.flush_without_lock();
        self.metrics.record_flush(&result);
        result
    }

    /// Reads down-stream bytes sent by the host.
    pub fn read(&self, buf: &mut [u8], deadline: &mut Deadline) -> TraceResult<usize> {
        self.transport()?.read(buf, deadline)
    }

    pub fn configure_receive_buffer(&self, storage: Box<[u8]>) -> TraceResult<()> {
        self.transport()?.configure_receive_buffer(storage)
    }

    pub fn is_host_connected(&self) -> bool {
        self.transport()
            .map(|transport| transport.is_host_connected())
            .unwrap_or(false)
    }

    pub fn link_kind(&self) -> LinkKind {
        self.transport()
            .map(|transport| transport.link_kind())
            .unwrap_or(LinkKind::Unknown)
    }

    pub fn set_config(&self, key: ConfigKey, value: u32) -> TraceResult<()> {
        self.transport()?.set_config(key, value)
    }

    pub fn get_config(&self, key: ConfigKey) -> TraceResult<u32> {
        self.transport()?.get_config(key)
    }

    /// Last-chance flush from a fault handler.
    ///
    /// Waits at most the transport's `FlushTimeout` for the encoder lock and
    /// falls back to [`Transport::flush_without_lock`] if it cannot be taken.
    /// Never fails and never logs.
    pub fn panic_flush(&self, info: &PanicContext<'_>) {
        let Ok(transport) = self.transport() else {
            return;
        };
        let timeout = panic_flush_timeout(transport.get_config(ConfigKey::FlushTimeout).ok());
        let mut deadline = Deadline::new(timeout);
        match self.encoder.take_lock(&mut deadline) {
            Ok(guard) => {
                self.encoder.panic_flush(info);
                guard.give();
            }
            Err(_) => {
                let _ = transport.flush_without_lock();
            }
        }
    }

    pub fn stats(&self) -> SessionStats {
        self.metrics.snapshot()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("encoder", &self.encoder_name)
            .field("transport", &self.transport_name)
            .field("ready", &self.encoder.is_ready())
            .finish()
    }
}
