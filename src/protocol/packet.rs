//! Inbound packets with typed accessors.
//!
//! A packet is one complete reply, error or event as read from the server,
//! tagged with the full 32-bit sequence number it was matched to.
//! Uses `bytes::Bytes` so packets can move between queues without copying.
//!
//! # Example
//!
//! ```
//! use xwire_client::protocol::{build_packet, Packet, PacketKind, REPLY};
//!
//! let bytes = build_packet(REPLY, 0, 7, &[1, 2, 3, 4]);
//! let packet = Packet::new(bytes.into(), 7)?;
//!
//! assert_eq!(packet.kind(), PacketKind::Reply);
//! assert_eq!(packet.len(), 32);
//! # Ok::<(), xwire_client::XwireError>(())
//! ```

use bytes::Bytes;

use crate::error::{Result, XwireError};

use super::wire_format::{
    padded_len, GenericHeader, ERROR, GE_GENERIC, HEADER_SIZE, REPLY, SEND_EVENT_MASK,
};

/// What a packet is, decided by its first byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    /// Discriminant 0.
    Error,
    /// Discriminant 1.
    Reply,
    /// Any other discriminant; holds the event code without the SendEvent bit.
    Event(u8),
}

/// A complete inbound packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    data: Bytes,
    sequence: u32,
}

impl Packet {
    /// Create a packet from its raw bytes and widened sequence number.
    ///
    /// Fails if `data` is shorter than the 32-byte header block.
    pub fn new(data: Bytes, sequence: u32) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(XwireError::Protocol(format!(
                "packet of {} bytes is shorter than its header",
                data.len()
            )));
        }
        Ok(Self { data, sequence })
    }

    /// Wrap bytes the input engine has already framed.
    pub(crate) fn framed(data: Bytes, sequence: u32) -> Self {
        debug_assert!(data.len() >= HEADER_SIZE);
        Self { data, sequence }
    }

    /// Raw bytes of the packet, header included.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Cheap clone of the raw bytes.
    #[inline]
    pub fn bytes(&self) -> Bytes {
        self.data.clone()
    }

    /// Consume the packet and return its bytes.
    pub fn into_bytes(self) -> Bytes {
        self.data
    }

    /// Total length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Always false: a packet holds at least its header.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Full 32-bit sequence number of the request this packet answers
    /// (for events: the last request the server had processed).
    #[inline]
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// The raw discriminant byte.
    #[inline]
    pub fn response_type(&self) -> u8 {
        self.data[0]
    }

    /// Classify the packet.
    pub fn kind(&self) -> PacketKind {
        match self.response_type() {
            ERROR => PacketKind::Error,
            REPLY => PacketKind::Reply,
            other => PacketKind::Event(other & !SEND_EVENT_MASK),
        }
    }

    /// Check if this is an error.
    #[inline]
    pub fn is_error(&self) -> bool {
        self.response_type() == ERROR
    }

    /// Check if this is a reply.
    #[inline]
    pub fn is_reply(&self) -> bool {
        self.response_type() == REPLY
    }

    /// Check if this event was produced by a SendEvent request.
    #[inline]
    pub fn is_send_event(&self) -> bool {
        !self.is_error() && !self.is_reply() && self.response_type() & SEND_EVENT_MASK != 0
    }

    /// Check if this is a generic (extension) event.
    #[inline]
    pub fn is_generic_event(&self) -> bool {
        self.response_type() & !SEND_EVENT_MASK == GE_GENERIC
    }

    /// Error code, for error packets.
    pub fn error_code(&self) -> Option<u8> {
        self.is_error().then(|| self.data[1])
    }

    /// Decoded leading fields.
    pub fn header(&self) -> GenericHeader {
        GenericHeader {
            response_type: self.data[0],
            detail: self.data[1],
            sequence: self.sequence as u16,
            length: u32::from_ne_bytes([self.data[4], self.data[5], self.data[6], self.data[7]]),
        }
    }
}

/// A reply or an error delivered to the caller that asked for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// The request's reply.
    Reply(Packet),
    /// A checked error for the request.
    Error(Packet),
}

impl Response {
    pub(crate) fn from_packet(packet: Packet) -> Self {
        if packet.is_error() {
            Response::Error(packet)
        } else {
            Response::Reply(packet)
        }
    }

    /// The packet, whichever kind it is.
    pub fn packet(&self) -> &Packet {
        match self {
            Response::Reply(p) | Response::Error(p) => p,
        }
    }

    /// The reply, dropping an error.
    pub fn into_reply(self) -> Option<Packet> {
        match self {
            Response::Reply(p) => Some(p),
            Response::Error(_) => None,
        }
    }
}

/// Result of a non-blocking reply check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyStatus {
    /// More responses for the request may still arrive.
    Pending,
    /// The request is settled: here is its response, or `None` if it had none.
    Ready(Option<Response>),
}

/// Build a server packet as a single byte vector.
///
/// Writes the 32-byte block with the given discriminant, detail byte and
/// 16-bit sequence. For replies and generic events `body` follows the
/// length field, padded to a multiple of 4, and the length field counts the
/// bytes beyond 32. Errors and events are always 32 bytes; longer bodies
/// are truncated.
///
/// # Example
///
/// ```
/// use xwire_client::protocol::{build_packet, REPLY};
///
/// let bytes = build_packet(REPLY, 0, 1, &[0u8; 40]);
/// assert_eq!(bytes.len(), 8 + 40);
/// ```
pub fn build_packet(response_type: u8, detail: u8, sequence: u16, body: &[u8]) -> Vec<u8> {
    let counts_length = response_type == REPLY || response_type & !SEND_EVENT_MASK == GE_GENERIC;
    let total = if counts_length {
        (8 + padded_len(body.len())).max(HEADER_SIZE)
    } else {
        HEADER_SIZE
    };
    let mut buf = vec![0u8; total];
    let header = GenericHeader {
        response_type,
        detail,
        sequence,
        length: if counts_length {
            ((total - HEADER_SIZE) / 4) as u32
        } else {
            0
        },
    };
    header.encode_into(&mut buf);
    if counts_length {
        buf[8..8 + body.len()].copy_from_slice(body);
    } else if response_type == ERROR {
        let n = body.len().min(HEADER_SIZE - 8);
        buf[8..8 + n].copy_from_slice(&body[..n]);
    } else {
        // Events have no length field: their payload starts right after the sequence.
        let n = body.len().min(HEADER_SIZE - 4);
        buf[4..4 + n].copy_from_slice(&body[..n]);
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_creation() {
        let packet = Packet::new(Bytes::from(build_packet(REPLY, 3, 42, b"hello")), 42).unwrap();

        assert_eq!(packet.kind(), PacketKind::Reply);
        assert_eq!(packet.sequence(), 42);
        assert_eq!(packet.len(), HEADER_SIZE);
        assert_eq!(&packet.as_bytes()[8..13], b"hello");
        assert_eq!(packet.header().detail, 3);
    }

    #[test]
    fn test_packet_kinds() {
        let error = Packet::new(Bytes::from(build_packet(ERROR, 9, 1, &[])), 1).unwrap();
        assert_eq!(error.kind(), PacketKind::Error);
        assert_eq!(error.error_code(), Some(9));

        let event_bytes = build_packet(12 | SEND_EVENT_MASK, 0, 1, &[]);
        let event = Packet::new(Bytes::from(event_bytes), 1).unwrap();
        assert_eq!(event.kind(), PacketKind::Event(12));
        assert!(event.is_send_event());
        assert_eq!(event.error_code(), None);
    }

    #[test]
    fn test_build_packet_long_reply() {
        let bytes = build_packet(REPLY, 0, 5, &[0xAB; 30]);
        // 8 header bytes + 30 body bytes padded to 32
        assert_eq!(bytes.len(), 40);
        let header = GenericHeader::decode(&bytes).unwrap();
        assert_eq!(header.length, 2);
        assert_eq!(header.sequence, 5);
    }

    #[test]
    fn test_build_packet_event_layout() {
        let bytes = build_packet(2, 0, 9, &[1, 2, 3, 4]);
        assert_eq!(bytes.len(), HEADER_SIZE);
        assert_eq!(&bytes[4..8], &[1, 2, 3, 4]);
    }

    #[test]
    fn test_response_from_packet() {
        let error = Packet::new(Bytes::from(build_packet(ERROR, 2, 1, &[])), 1).unwrap();
        assert!(matches!(Response::from_packet(error), Response::Error(_)));

        let reply = Packet::new(Bytes::from(build_packet(REPLY, 0, 1, &[])), 1).unwrap();
        let response = Response::from_packet(reply.clone());
        assert_eq!(response.packet(), &reply);
        assert_eq!(response.into_reply(), Some(reply));
    }

    #[test]
    fn test_new_rejects_short_data() {
        assert!(matches!(Packet::new(Bytes::new(), 1), Err(XwireError::Protocol(_))));
        assert!(Packet::new(Bytes::from(vec![1u8; HEADER_SIZE - 1]), 1).is_err());

        let packet = Packet::new(Bytes::from(vec![1u8; HEADER_SIZE]), 1).unwrap();
        assert!(!packet.is_empty());
        assert_eq!(packet.response_type(), 1);
    }

    #[test]
    fn test_bytes_zero_copy() {
        let packet = Packet::new(Bytes::from(build_packet(REPLY, 0, 1, &[])), 1).unwrap();
        let a = packet.bytes();
        let b = packet.bytes();
        assert_eq!(a.as_ptr(), b.as_ptr());
    }
}
