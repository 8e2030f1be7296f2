//! Name → descriptor tables for encoders and transports.
//!
//! Plugins announce themselves at link time with [`register_encoder!`] and
//! [`register_transport!`]; [`Registry::global`] gathers every submission once.
//! Embedders and tests can also build a [`Registry`] by hand.

use std::fmt;
use std::sync::OnceLock;

use smallvec::SmallVec;

use crate::port::{EncoderDescriptor, TransportDescriptor};

/// Link-time encoder registration.
#[derive(Clone, Copy)]
pub struct EncoderRegistration {
    pub name: &'static str,
    pub descriptor: &'static dyn EncoderDescriptor,
}

impl EncoderRegistration {
    pub const fn new(name: &'static str, descriptor: &'static dyn EncoderDescriptor) -> Self {
        Self { name, descriptor }
    }
}

inventory::collect!(EncoderRegistration);

/// Link-time transport registration.
#[derive(Clone, Copy)]
pub struct TransportRegistration {
    pub name: &'static str,
    pub descriptor: &'static dyn TransportDescriptor,
}

impl TransportRegistration {
    pub const fn new(name: &'static str, descriptor: &'static dyn TransportDescriptor) -> Self {
        Self { name, descriptor }
    }
}

inventory::collect!(TransportRegistration);

/// Registers an encoder descriptor under a name at link time.
///
/// ```ignore
/// struct MyEncoderDescriptor;
/// impl EncoderDescriptor for MyEncoderDescriptor { /* ... */ }
///
/// apptrace_fabric::register_encoder!("mine", MyEncoderDescriptor);
/// ```
#[macro_export]
macro_rules! register_encoder {
    ($name:expr, $descriptor:expr $(,)?) => {
        $crate::inventory::submit! {
            $crate::EncoderRegistration::new($name, &$descriptor)
        }
    };
}

/// Registers a transport descriptor under a name at link time.
#[macro_export]
macro_rules! register_transport {
    ($name:expr, $descriptor:expr $(,)?) => {
        $crate::inventory::submit! {
            $crate::TransportRegistration::new($name, &$descriptor)
        }
    };
}

/// Ordered, append-only plugin tables.
#[derive(Clone, Default)]
pub struct Registry {
    encoders: Vec<EncoderRegistration>,
    transports: Vec<TransportRegistration>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every link-time submission.
    pub fn from_inventory() -> Self {
        let mut registry = Self::new();
        for entry in inventory::iter::<EncoderRegistration> {
            registry.encoders.push(*entry);
        }
        for entry in inventory::iter::<TransportRegistration> {
            registry.transports.push(*entry);
        }
        tracing::debug!(
            encoders = registry.encoders.len(),
            transports = registry.transports.len(),
            "collected plugin registrations"
        );
        registry
    }

    /// Process-wide registry, gathered from link-time submissions on first use.
    pub fn global() -> &'static Registry {
        static GLOBAL: OnceLock<Registry> = OnceLock::new();
        GLOBAL.get_or_init(Self::from_inventory)
    }

    pub fn register_encoder(
        &mut self,
        name: &'static str,
        descriptor: &'static dyn EncoderDescriptor,
    ) -> &mut Self {
        self.encoders
            .push(EncoderRegistration::new(name, descriptor));
        self
    }

    pub fn register_transport(
        &mut self,
        name: &'static str,
        descriptor: &'static dyn TransportDescriptor,
    ) -> &mut Self {
        self.transports
            .push(TransportRegistration::new(name, descriptor));
        self
    }

    /// First encoder registered under exactly `name`; `None` for an empty name.
    pub fn find_encoder(&self, name: &str) -> Option<&'static dyn EncoderDescriptor> {
        if name.is_empty() {
            return None;
        }
        self.encoders
            .iter()
            .find(|entry| entry.name == name)
            .map(|entry| entry.descriptor)
    }

    /// First transport registered under exactly `name`; `None` for an empty name.
    pub fn find_transport(&self, name: &str) -> Option<&'static dyn TransportDescriptor> {
        if name.is_empty() {
            return None;
        }
        self.transports
            .iter()
            .find(|entry| entry.name == name)
            .map(|entry| entry.descriptor)
    }

    pub fn encoder_names(&self) -> SmallVec<[&'static str; 8]> {
        self.encoders.iter().map(|entry| entry.name).collect()
    }

    pub fn transport_names(&self) -> SmallVec<[&'static str; 8]> {
        self.transports.iter().map(|entry| entry.name).collect()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("encoders", &self.encoder_names())
            .field("transports", &self.transport_names())
            .finish()
    }
}
