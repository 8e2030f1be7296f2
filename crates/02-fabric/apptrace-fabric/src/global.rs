//! The process-wide trace session.
//!
//! Every core may call [`open`] at startup; the first caller opens the session
//! and the rest get the same one back. A failed open leaves the slot empty so a
//! later call can retry.

use std::panic;
use std::sync::{Once, OnceLock};

use apptrace::{Deadline, InitCell, InitState, TraceResult};

use crate::port::PanicContext;
use crate::registry::Registry;
use crate::session::{Session, SessionParams};

fn slot() -> &'static InitCell<Session> {
    static SESSION: OnceLock<InitCell<Session>> = OnceLock::new();
    SESSION.get_or_init(InitCell::new)
}

/// Opens the global session from the link-time registry, or returns the open one.
pub fn open(params: SessionParams<'_>) -> TraceResult<&'static Session> {
    open_in(Registry::global(), params)
}

/// Like [`open`] with an explicit registry.
///
/// Once a session is ready, later parameters are ignored.
pub fn open_in(registry: &Registry, params: SessionParams<'_>) -> TraceResult<&'static Session> {
    slot().get_or_try_init(&mut Deadline::infinite(), || {
        Session::open_in(registry, params)
    })
}

/// The global session, if one has been opened.
pub fn session() -> Option<&'static Session> {
    slot().get()
}

pub fn state() -> InitState {
    slot().state()
}

/// Routes `std` panics through [`Session::panic_flush`] before the previous hook runs.
///
/// Installing more than once has no further effect.
pub fn install_panic_hook() {
    static INSTALLED: Once = Once::new();
    INSTALLED.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if let Some(session) = session() {
                let payload = info.payload();
                let message = payload
                    .downcast_ref::<&str>()
                    .copied()
                    .or_else(|| payload.downcast_ref::<String>().map(String::as_str));
                session.panic_flush(&PanicContext::current(message));
            }
            previous(info);
        }));
    });
}
