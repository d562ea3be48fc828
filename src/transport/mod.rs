//! Transport module - sockets and display names.
//!
//! Provides:
//! - A blocking/non-blocking stream over Unix or TCP sockets
//! - The readiness wait used by the connection's I/O duty holder
//! - Display name parsing and socket opening

mod display;
mod socket;

pub use display::{
    open_display, parse_display, resolve_display, DisplayName, DISPLAY_ENV, TCP_PORT_BASE,
    UNIX_SOCKET_BASE,
};
pub use socket::{Readiness, Stream};
