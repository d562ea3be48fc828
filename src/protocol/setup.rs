//! Connection setup messages.
//!
//! The client opens every connection with a setup request and the server
//! answers with a response that either refuses the connection, asks for more
//! authentication, or carries the setup data.
//!
//! ```text
//! Request (12 bytes + name + data):
//! ┌───────┬─────┬───────┬───────┬──────────┬──────────┬─────┐
//! │ Order │ pad │ Major │ Minor │ Name len │ Data len │ pad │
//! │ 1     │ 1   │ u16   │ u16   │ u16      │ u16      │ 2   │
//! └───────┴─────┴───────┴───────┴──────────┴──────────┴─────┘
//!
//! Response header (8 bytes, followed by 4 * length bytes):
//! ┌────────┬────────────┬───────┬───────┬────────┐
//! │ Status │ Reason len │ Major │ Minor │ Length │
//! │ 1      │ 1          │ u16   │ u16   │ u16    │
//! └────────┴────────────┴───────┴───────┴────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use xwire_client::protocol::{encode_setup_request, AuthInfo};
//!
//! let auth = AuthInfo::new("MIT-MAGIC-COOKIE-1", vec![0u8; 16]);
//! let bytes = encode_setup_request(Some(&auth))?;
//! assert_eq!(bytes.len(), 12 + 20 + 16);
//! # Ok::<(), xwire_client::XwireError>(())
//! ```

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::wire_format::{pad, padded_len};
use crate::error::{Result, XwireError};

/// Protocol major version requested by the client.
pub const PROTOCOL_MAJOR_VERSION: u16 = 11;

/// Protocol minor version requested by the client.
pub const PROTOCOL_MINOR_VERSION: u16 = 0;

/// Size of the fixed part of the setup request.
pub const SETUP_REQUEST_SIZE: usize = 12;

/// Size of the fixed part of every setup response.
pub const SETUP_RESPONSE_HEADER_SIZE: usize = 8;

/// Byte order marker for this host: `'B'` for big endian, `'l'` for little.
#[cfg(target_endian = "big")]
pub const BYTE_ORDER_MARKER: u8 = b'B';

/// Byte order marker for this host: `'B'` for big endian, `'l'` for little.
#[cfg(target_endian = "little")]
pub const BYTE_ORDER_MARKER: u8 = b'l';

/// Response status: connection refused.
pub const STATUS_FAILED: u8 = 0;

/// Response status: connection accepted.
pub const STATUS_SUCCESS: u8 = 1;

/// Response status: further authentication required.
pub const STATUS_AUTHENTICATE: u8 = 2;

/// Offset of the vendor string in a successful response.
const VENDOR_OFFSET: usize = 40;

/// Authorization protocol name and data sent with the setup request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthInfo {
    /// Authorization protocol name (e.g. `MIT-MAGIC-COOKIE-1`).
    pub name: Vec<u8>,
    /// Opaque authorization data.
    pub data: Vec<u8>,
}

impl AuthInfo {
    /// Create auth info from a protocol name and its data.
    pub fn new(name: impl Into<Vec<u8>>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }
}

/// Encode the setup request, optionally carrying authorization.
///
/// Fails if either auth part is longer than its 16-bit length field allows.
pub fn encode_setup_request(auth: Option<&AuthInfo>) -> Result<Vec<u8>> {
    let (name, data): (&[u8], &[u8]) = match auth {
        Some(auth) => (&auth.name, &auth.data),
        None => (&[], &[]),
    };
    let name_len = part_len(name, "name")?;
    let data_len = part_len(data, "data")?;

    let mut buf = Vec::with_capacity(
        SETUP_REQUEST_SIZE + padded_len(name.len()) + padded_len(data.len()),
    );
    buf.push(BYTE_ORDER_MARKER);
    buf.push(0);
    buf.extend_from_slice(&PROTOCOL_MAJOR_VERSION.to_ne_bytes());
    buf.extend_from_slice(&PROTOCOL_MINOR_VERSION.to_ne_bytes());
    buf.extend_from_slice(&name_len.to_ne_bytes());
    buf.extend_from_slice(&data_len.to_ne_bytes());
    buf.extend_from_slice(&[0, 0]);

    for part in [name, data] {
        buf.extend_from_slice(part);
        buf.resize(buf.len() + pad(part.len()), 0);
    }
    Ok(buf)
}

fn part_len(part: &[u8], what: &str) -> Result<u16> {
    u16::try_from(part.len()).map_err(|_| {
        XwireError::Protocol(format!(
            "authorization {} of {} bytes does not fit the setup request",
            what,
            part.len()
        ))
    })
}

/// The fixed 8-byte part of a setup response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupResponseHeader {
    /// One of `STATUS_FAILED`, `STATUS_SUCCESS`, `STATUS_AUTHENTICATE`.
    pub status: u8,
    /// Length of the failure reason (failed responses only).
    pub reason_len: u8,
    /// Server protocol major version.
    pub protocol_major_version: u16,
    /// Server protocol minor version.
    pub protocol_minor_version: u16,
    /// Length of the rest of the response in 4-byte units.
    pub length: u16,
}

impl SetupResponseHeader {
    /// Decode the response header.
    ///
    /// Returns `None` if buffer is shorter than 8 bytes.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < SETUP_RESPONSE_HEADER_SIZE {
            return None;
        }
        Some(Self {
            status: buf[0],
            reason_len: buf[1],
            protocol_major_version: u16::from_ne_bytes([buf[2], buf[3]]),
            protocol_minor_version: u16::from_ne_bytes([buf[4], buf[5]]),
            length: u16::from_ne_bytes([buf[6], buf[7]]),
        })
    }

    /// Number of bytes that follow the header.
    #[inline]
    pub fn body_len(&self) -> usize {
        self.length as usize * 4
    }
}

/// Setup data sent by the server on success. Immutable once decoded.
///
/// The leading fields are decoded; the full response, including the screen
/// and format lists, stays available through [`Setup::raw`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Setup {
    raw: Bytes,
    /// Server protocol major version.
    pub protocol_major_version: u16,
    /// Server protocol minor version.
    pub protocol_minor_version: u16,
    /// Vendor release number.
    pub release_number: u32,
    /// Base value for client resource ids.
    pub resource_id_base: u32,
    /// Bits of a resource id the client may set.
    pub resource_id_mask: u32,
    /// Size of the motion history buffer.
    pub motion_buffer_size: u32,
    /// Largest request length in 4-byte units without BIG-REQUESTS.
    pub maximum_request_length: u16,
    /// Number of screens.
    pub roots_len: u8,
    /// Number of pixmap formats.
    pub pixmap_formats_len: u8,
    /// Image byte order (0 LSB first, 1 MSB first).
    pub image_byte_order: u8,
    /// Bitmap bit order.
    pub bitmap_format_bit_order: u8,
    /// Bitmap scanline unit.
    pub bitmap_format_scanline_unit: u8,
    /// Bitmap scanline pad.
    pub bitmap_format_scanline_pad: u8,
    /// Smallest keycode.
    pub min_keycode: u8,
    /// Largest keycode.
    pub max_keycode: u8,
    /// Vendor string.
    pub vendor: String,
}

impl Setup {
    /// The complete response bytes, header included.
    #[inline]
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    fn decode_success(raw: Bytes, header: &SetupResponseHeader) -> Result<Self> {
        if raw.len() < VENDOR_OFFSET {
            return Err(XwireError::Protocol(format!(
                "setup response of {} bytes is too short",
                raw.len()
            )));
        }
        let u32_at = |at: usize| u32::from_ne_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]]);
        let vendor_len = u16::from_ne_bytes([raw[24], raw[25]]) as usize;
        let vendor_end = (VENDOR_OFFSET + vendor_len).min(raw.len());
        let vendor = String::from_utf8_lossy(&raw[VENDOR_OFFSET..vendor_end]).into_owned();

        Ok(Self {
            protocol_major_version: header.protocol_major_version,
            protocol_minor_version: header.protocol_minor_version,
            release_number: u32_at(8),
            resource_id_base: u32_at(12),
            resource_id_mask: u32_at(16),
            motion_buffer_size: u32_at(20),
            maximum_request_length: u16::from_ne_bytes([raw[26], raw[27]]),
            roots_len: raw[28],
            pixmap_formats_len: raw[29],
            image_byte_order: raw[30],
            bitmap_format_bit_order: raw[31],
            bitmap_format_scanline_unit: raw[32],
            bitmap_format_scanline_pad: raw[33],
            min_keycode: raw[34],
            max_keycode: raw[35],
            vendor,
            raw,
        })
    }
}

/// Decode a complete setup response (header plus body).
///
/// Refusals are turned into `SetupFailed` or `SetupAuthenticate` errors
/// carrying the server's reason text.
pub fn decode_setup_response(raw: Bytes) -> Result<Setup> {
    let header = SetupResponseHeader::decode(&raw).ok_or_else(|| {
        XwireError::Protocol(format!("setup response of {} bytes has no header", raw.len()))
    })?;
    let body = &raw[SETUP_RESPONSE_HEADER_SIZE..];

    match header.status {
        STATUS_SUCCESS => Setup::decode_success(raw.clone(), &header),
        STATUS_FAILED => {
            let len = (header.reason_len as usize).min(body.len());
            Err(XwireError::SetupFailed {
                reason: String::from_utf8_lossy(&body[..len]).into_owned(),
            })
        }
        STATUS_AUTHENTICATE => {
            let reason = String::from_utf8_lossy(body)
                .trim_end_matches('\0')
                .to_string();
            Err(XwireError::SetupAuthenticate { reason })
        }
        other => Err(XwireError::Protocol(format!(
            "unknown setup status {}",
            other
        ))),
    }
}
