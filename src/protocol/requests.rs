//! The few requests the connection issues on its own behalf.
//!
//! Everything else is framed by callers; the connection only needs a
//! round-trip request for syncing, extension queries, BIG-REQUESTS
//! negotiation and resource id refills.

use super::packet::Packet;
use super::wire_format::{padded_len, read_word, REQUEST_PREFIX_SIZE};
use crate::error::{Result, XwireError};
use crate::ext::{Extension, BIG_REQUESTS, XC_MISC};

/// Core GetInputFocus; its reply is used as a cheap round trip.
pub const GET_INPUT_FOCUS: u8 = 43;

/// Core QueryExtension.
pub const QUERY_EXTENSION: u8 = 98;

/// BIG-REQUESTS Enable minor opcode.
pub const BIG_REQUESTS_ENABLE: u8 = 0;

/// XC-MISC GetXIDRange minor opcode.
pub const XC_MISC_GET_XID_RANGE: u8 = 1;

/// GLX VendorPrivateWithReply minor opcode.
pub const GLX_VENDOR_PRIVATE_WITH_REPLY: u8 = 17;

/// GLX GetFBConfigs minor opcode.
pub const GLX_GET_FB_CONFIGS: u8 = 21;

/// Vendor code of GLX GetFBConfigsSGIX sent through VendorPrivateWithReply.
pub const GLX_VENDOR_GET_FB_CONFIGS_SGIX: u32 = 0x10004;

/// Describes a request to `Connection::send_request`.
#[derive(Debug, Clone, Copy)]
pub struct RequestInfo {
    /// Extension the request belongs to, `None` for core requests.
    pub extension: Option<&'static Extension>,
    /// Major opcode for core requests, minor opcode for extension requests.
    pub opcode: u8,
    /// The request produces no reply.
    pub is_void: bool,
}

impl RequestInfo {
    /// A core protocol request.
    pub const fn core(opcode: u8, is_void: bool) -> Self {
        Self {
            extension: None,
            opcode,
            is_void,
        }
    }

    /// A request of `extension`.
    pub const fn extension(extension: &'static Extension, opcode: u8, is_void: bool) -> Self {
        Self {
            extension: Some(extension),
            opcode,
            is_void,
        }
    }
}

/// Write opcodes and a 16-bit length into the prefix of `fixed`.
///
/// For the connection's own requests, sent with `flags::RAW` so that
/// framing them never consults the negotiated maximum request length.
pub(crate) fn frame_short(fixed: &mut [u8], major: u8, minor: u8, tail: &[&[u8]]) -> Result<()> {
    let bytes =
        padded_len(fixed.len()) + tail.iter().map(|c| padded_len(c.len())).sum::<usize>();
    let length = u16::try_from(bytes / 4)
        .map_err(|_| XwireError::Protocol(format!("request of {} bytes is too long", bytes)))?;
    if fixed.len() < REQUEST_PREFIX_SIZE {
        return Err(XwireError::Protocol(format!(
            "request of {} bytes is shorter than its prefix",
            fixed.len()
        )));
    }
    fixed[0] = major;
    fixed[1] = minor;
    fixed[2..4].copy_from_slice(&length.to_ne_bytes());
    Ok(())
}

/// GetInputFocus: prefix only, filled in by `send_request`.
pub fn get_input_focus() -> ([u8; REQUEST_PREFIX_SIZE], RequestInfo) {
    ([0; REQUEST_PREFIX_SIZE], RequestInfo::core(GET_INPUT_FOCUS, false))
}

/// QueryExtension fixed part; the name follows as a separate chunk.
pub fn query_extension(name: &str) -> Result<([u8; 8], RequestInfo)> {
    let len = u16::try_from(name.len()).map_err(|_| {
        XwireError::Protocol(format!("extension name of {} bytes is too long", name.len()))
    })?;
    let mut fixed = [0u8; 8];
    fixed[4..6].copy_from_slice(&len.to_ne_bytes());
    Ok((fixed, RequestInfo::core(QUERY_EXTENSION, false)))
}

/// BIG-REQUESTS Enable.
pub fn big_requests_enable() -> ([u8; REQUEST_PREFIX_SIZE], RequestInfo) {
    (
        [0; REQUEST_PREFIX_SIZE],
        RequestInfo::extension(&BIG_REQUESTS, BIG_REQUESTS_ENABLE, false),
    )
}

/// XC-MISC GetXIDRange.
pub fn xc_misc_get_xid_range() -> ([u8; REQUEST_PREFIX_SIZE], RequestInfo) {
    (
        [0; REQUEST_PREFIX_SIZE],
        RequestInfo::extension(&XC_MISC, XC_MISC_GET_XID_RANGE, false),
    )
}

fn check_reply(packet: &Packet, min_len: usize, what: &str) -> Result<()> {
    if !packet.is_reply() || packet.len() < min_len {
        return Err(XwireError::Protocol(format!(
            "malformed {} reply ({} bytes, type {})",
            what,
            packet.len(),
            packet.response_type()
        )));
    }
    Ok(())
}

/// Answer to a QueryExtension request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryExtensionReply {
    /// The server provides the extension.
    pub present: bool,
    /// Major opcode assigned to the extension.
    pub major_opcode: u8,
    /// First event code, 0 if the extension has no events.
    pub first_event: u8,
    /// First error code, 0 if the extension has no errors.
    pub first_error: u8,
}

impl QueryExtensionReply {
    /// Parse a QueryExtension reply.
    pub fn parse(packet: &Packet) -> Result<Self> {
        check_reply(packet, 12, "QueryExtension")?;
        let b = packet.as_bytes();
        Ok(Self {
            present: b[8] != 0,
            major_opcode: b[9],
            first_event: b[10],
            first_error: b[11],
        })
    }
}

/// Parse a BIG-REQUESTS Enable reply into the maximum request length.
pub fn parse_big_requests_enable(packet: &Packet) -> Result<u32> {
    check_reply(packet, 12, "BIG-REQUESTS Enable")?;
    Ok(read_word(packet.as_bytes(), 2))
}

/// A range of resource ids handed out by XC-MISC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XidRange {
    /// First id of the range.
    pub start_id: u32,
    /// Number of ids in the range.
    pub count: u32,
}

impl XidRange {
    /// Parse an XC-MISC GetXIDRange reply.
    pub fn parse(packet: &Packet) -> Result<Self> {
        check_reply(packet, 16, "GetXIDRange")?;
        let b = packet.as_bytes();
        Ok(Self {
            start_id: read_word(b, 2),
            count: read_word(b, 3),
        })
    }
}
