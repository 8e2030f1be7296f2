use apptrace::{Timeout, TIMEOUT_INFINITE_US};

use crate::port::ConfigKey;

/// Wait used by `panic_flush` when the transport reports no finite flush timeout.
pub const DEFAULT_PANIC_FLUSH_TIMEOUT_US: u32 = 1_000_000;

/// Transport parameters applied through `set_config` right after a session opens.
///
/// Unset fields keep the transport's own defaults.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TransportSettings {
    pub header_size: Option<u32>,
    pub flush_timeout_us: Option<u32>,
    pub flush_threshold: Option<u32>,
}

impl TransportSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_header_size(mut self, bytes: u32) -> Self {
        self.header_size = Some(bytes);
        self
    }

    pub fn with_flush_timeout(mut self, timeout: Timeout) -> Self {
        self.flush_timeout_us = Some(timeout.as_us());
        self
    }

    pub fn with_flush_threshold(mut self, bytes: u32) -> Self {
        self.flush_threshold = Some(bytes);
        self
    }

    /// The configured keys in `ConfigKey` order.
    pub fn entries(&self) -> impl Iterator<Item = (ConfigKey, u32)> + '_ {
        ConfigKey::ALL.into_iter().filter_map(|key| {
            let value = match key {
                ConfigKey::HeaderSize => self.header_size,
                ConfigKey::FlushTimeout => self.flush_timeout_us,
                ConfigKey::FlushThreshold => self.flush_threshold,
            };
            value.map(|value| (key, value))
        })
    }
}

/// Timeout for the panic-time lock attempt derived from a raw `FlushTimeout`.
///
/// An infinite value is replaced by [`DEFAULT_PANIC_FLUSH_TIMEOUT_US`]: a
/// fault handler must always get control back.
pub fn panic_flush_timeout(raw_us: Option<u32>) -> Timeout {
    match raw_us {
        Some(us) if us != TIMEOUT_INFINITE_US => Timeout::Micros(u64::from(us)),
        _ => Timeout::Micros(u64::from(DEFAULT_PANIC_FLUSH_TIMEOUT_US)),
    }
}
