//! Protocol module - wire format, packets and the requests the core issues.
//!
//! This module implements the byte-level side of the connection:
//! - 32-byte inbound header decoding and padding rules
//! - Wraparound-aware sequence arithmetic
//! - Packet struct with typed accessors
//! - Setup request/response encoding

pub mod requests;
pub mod sequence;

mod packet;
mod setup;
mod wire_format;

pub use packet::{build_packet, Packet, PacketKind, ReplyStatus, Response};
pub use requests::{QueryExtensionReply, RequestInfo, XidRange};
pub use setup::{
    decode_setup_response, encode_setup_request, AuthInfo, Setup, SetupResponseHeader,
    BYTE_ORDER_MARKER, PROTOCOL_MAJOR_VERSION, PROTOCOL_MINOR_VERSION, SETUP_REQUEST_SIZE,
    SETUP_RESPONSE_HEADER_SIZE, STATUS_AUTHENTICATE, STATUS_FAILED, STATUS_SUCCESS,
};
pub use wire_format::{
    flags, pad, padded_len, popcount, read_word, GenericHeader, ERROR, GE_GENERIC, HEADER_SIZE,
    KEYMAP_NOTIFY, REPLY, REQUEST_PREFIX_SIZE, SEND_EVENT_MASK,
};

#[cfg(test)]
pub(crate) use setup::tests::success_response;
