//! Wire format constants and the generic inbound header.
//!
//! Every packet the server sends starts with the same 32-byte block:
//! ```text
//! ┌──────────┬────────┬──────────┬──────────┬─────────────────┐
//! │ Type     │ Detail │ Sequence │ Length   │ Type specific   │
//! │ 1 byte   │ 1 byte │ uint16   │ uint32   │ 24 bytes        │
//! └──────────┴────────┴──────────┴──────────┴─────────────────┘
//! ```
//!
//! Multi-byte integers use the byte order negotiated during the handshake,
//! which is always the client's native order.

/// Size of the fixed block every inbound packet starts with.
pub const HEADER_SIZE: usize = 32;

/// Size of the request prefix holding opcode, minor opcode and length.
pub const REQUEST_PREFIX_SIZE: usize = 4;

/// Discriminant of an error packet.
pub const ERROR: u8 = 0;

/// Discriminant of a reply packet.
pub const REPLY: u8 = 1;

/// KeymapNotify events carry no sequence number.
pub const KEYMAP_NOTIFY: u8 = 11;

/// Generic events carry extra data counted by their length field.
pub const GE_GENERIC: u8 = 35;

/// Bit set on events that were produced by a SendEvent request.
pub const SEND_EVENT_MASK: u8 = 0x80;

/// Flag constants for `Connection::send_request`.
pub mod flags {
    /// Errors for this request are delivered to the reply waiter, not the event queue.
    pub const CHECKED: u32 = 0b0000_0001;
    /// The caller has already filled in opcode and length; leave the request untouched.
    pub const RAW: u32 = 0b0000_0010;
    /// Replies to this request are dropped as soon as they are read.
    pub const DISCARD_REPLY: u32 = 0b0000_0100;

    /// Check if a specific flag is set.
    #[inline]
    pub fn has_flag(flags: u32, flag: u32) -> bool {
        flags & flag != 0
    }
}

/// Number of zero bytes needed to pad `len` to a multiple of 4.
#[inline]
pub fn pad(len: usize) -> usize {
    len.wrapping_neg() & 3
}

/// `len` rounded up to a multiple of 4.
#[inline]
pub fn padded_len(len: usize) -> usize {
    len + pad(len)
}

/// Decoded leading fields of an inbound packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenericHeader {
    /// Packet discriminant (0 error, 1 reply, otherwise an event code).
    pub response_type: u8,
    /// Error code for errors, type-specific detail otherwise.
    pub detail: u8,
    /// Low 16 bits of the sequence number.
    pub sequence: u16,
    /// Additional length in 4-byte units (replies and generic events only).
    pub length: u32,
}

impl GenericHeader {
    /// Decode the generic header.
    ///
    /// Returns `None` if buffer is shorter than 8 bytes.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < 8 {
            return None;
        }
        Some(Self {
            response_type: buf[0],
            detail: buf[1],
            sequence: u16::from_ne_bytes([buf[2], buf[3]]),
            length: u32::from_ne_bytes([buf[4], buf[5], buf[6], buf[7]]),
        })
    }

    /// Encode the header fields into the first 8 bytes of `buf`.
    ///
    /// # Panics
    ///
    /// Panics if buffer is smaller than 8 bytes.
    pub fn encode_into(&self, buf: &mut [u8]) {
        buf[0] = self.response_type;
        buf[1] = self.detail;
        buf[2..4].copy_from_slice(&self.sequence.to_ne_bytes());
        buf[4..8].copy_from_slice(&self.length.to_ne_bytes());
    }

    /// Discriminant with the SendEvent bit cleared.
    #[inline]
    pub fn base_type(&self) -> u8 {
        self.response_type & !SEND_EVENT_MASK
    }

    /// Whether this packet carries a trustworthy sequence number.
    #[inline]
    pub fn has_sequence(&self) -> bool {
        self.base_type() != KEYMAP_NOTIFY
    }

    /// Check if this is a reply.
    #[inline]
    pub fn is_reply(&self) -> bool {
        self.response_type == REPLY
    }

    /// Check if this is an error.
    #[inline]
    pub fn is_error(&self) -> bool {
        self.response_type == ERROR
    }

    /// 4-byte words this packet occupies beyond the fixed 32-byte block,
    /// as declared by its length field.
    pub fn declared_extra_words(&self) -> u64 {
        if self.is_reply() || self.base_type() == GE_GENERIC {
            u64::from(self.length)
        } else {
            0
        }
    }
}

/// Read a native-endian `u32` at 4-byte word index `word`.
#[inline]
pub fn read_word(buf: &[u8], word: usize) -> u32 {
    let at = word * 4;
    u32::from_ne_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

/// Number of bits set in a value mask, i.e. how many values follow it.
#[inline]
pub fn popcount(mask: u32) -> u32 {
    mask.count_ones()
}
