//! Display names and opening the matching socket.
//!
//! A display name has the form `[host]:display[.screen]`. Everything before
//! the last colon is the host, so IPv6 addresses (`::1:0`) and the DECnet
//! `host::display` form keep their colons in the host part.
//!
//! # Example
//!
//! ```
//! use xwire_client::transport::parse_display;
//!
//! let name = parse_display("hydra:0.1").unwrap();
//! assert_eq!(name.host, "hydra");
//! assert_eq!(name.display, 0);
//! assert_eq!(name.screen, 1);
//! ```

use super::socket::Stream;
use crate::error::{Result, XwireError};

/// Directory holding local server sockets.
pub const UNIX_SOCKET_BASE: &str = "/tmp/.X11-unix/X";

/// TCP port of display 0.
pub const TCP_PORT_BASE: u16 = 6000;

/// Environment variable consulted when no display name is given.
pub const DISPLAY_ENV: &str = "DISPLAY";

/// A parsed display name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayName {
    /// Host part; empty for the local Unix socket.
    pub host: String,
    /// Display number.
    pub display: u32,
    /// Preferred screen, 0 when not given.
    pub screen: u32,
}

fn parse_number(s: &str) -> Option<u32> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

/// Parse `[host]:display[.screen]`.
///
/// Returns `None` for anything that does not fully match; nothing is
/// partially filled in.
pub fn parse_display(name: &str) -> Option<DisplayName> {
    let colon = name.rfind(':')?;
    let host = &name[..colon];
    let rest = &name[colon + 1..];

    let (display, screen) = match rest.split_once('.') {
        Some((display, screen)) => (parse_number(display)?, parse_number(screen)?),
        None => (parse_number(rest)?, 0),
    };

    Some(DisplayName {
        host: host.to_string(),
        display,
        screen,
    })
}

/// Parse `name`, or `$DISPLAY` when `name` is `None` or empty.
pub fn resolve_display(name: Option<&str>) -> Result<DisplayName> {
    let name = match name {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => std::env::var(DISPLAY_ENV)
            .map_err(|_| XwireError::InvalidDisplay(String::new()))?,
    };
    parse_display(&name).ok_or(XwireError::InvalidDisplay(name))
}

impl DisplayName {
    /// Path of the local socket for this display.
    pub fn unix_path(&self) -> String {
        format!("{}{}", UNIX_SOCKET_BASE, self.display)
    }

    /// TCP port for this display, if it fits in a port number.
    pub fn tcp_port(&self) -> Option<u16> {
        u16::try_from(self.display)
            .ok()
            .and_then(|d| TCP_PORT_BASE.checked_add(d))
    }
}

/// Open a stream to the display: the local socket for an empty host,
/// TCP port `6000 + display` otherwise.
pub fn open_display(name: &DisplayName) -> Result<Stream> {
    if name.host.is_empty() {
        tracing::debug!("Opening local display socket {}", name.unix_path());
        Stream::connect_unix(name.unix_path())
    } else {
        let port = name
            .tcp_port()
            .ok_or_else(|| XwireError::InvalidDisplay(format!("{}:{}", name.host, name.display)))?;
        tracing::debug!("Opening TCP display {}:{}", name.host, port);
        Stream::connect_tcp(&name.host, port)
    }
}
