//! Built-in encoders and transports.
//!
//! | name     | kind      | notes                                        |
//! |----------|-----------|----------------------------------------------|
//! | `raw`    | encoder   | bytes forwarded unchanged, split per block   |
//! | `framed` | encoder   | `[len][core][seq]` records                   |
//! | `membuf` | transport | shared-memory window polled by a debug probe |
//! | `uart`   | transport | headerless byte stream through a TX FIFO     |
//!
//! Linking this crate submits all four to the global registry.

pub mod framed;
pub mod membuf;
pub mod raw;
pub mod uart;

use apptrace_fabric::{register_encoder, register_transport, Registry};

pub use framed::{decode_frames, Frame, FramedDescriptor, FramedEncoder, FRAME_HEADER_LEN};
pub use membuf::{HostBlock, HostWindow, MembufConfig, MembufDescriptor, MembufLink};
pub use raw::{RawDescriptor, RawEncoder};
pub use uart::{UartConfig, UartDescriptor, UartLine};

pub const RAW: &str = "raw";
pub const FRAMED: &str = "framed";
pub const MEMBUF: &str = "membuf";
pub const UART: &str = "uart";

register_encoder!(RAW, RawDescriptor);
register_encoder!(FRAMED, FramedDescriptor);
register_transport!(MEMBUF, MembufDescriptor);
register_transport!(UART, UartDescriptor);

/// Adds the built-ins to an explicit registry, in table order.
pub fn register_builtin(registry: &mut Registry) -> &mut Registry {
    registry
        .register_encoder(RAW, &RawDescriptor)
        .register_encoder(FRAMED, &FramedDescriptor)
        .register_transport(MEMBUF, &MembufDescriptor)
        .register_transport(UART, &UartDescriptor)
}
