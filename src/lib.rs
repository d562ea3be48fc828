//! # xwire-client
//!
//! Thread-safe client connection core for the X11 wire protocol.
//!
//! This crate owns the socket to an X server and everything between
//! "here are the bytes of a request" and "here is the reply for sequence
//! number N": request sequencing and buffering, extended request lengths,
//! demultiplexing of replies, errors and events, and arbitration of socket
//! I/O between threads. It does not know any request beyond the few it
//! issues itself.
//!
//! ## Architecture
//!
//! - **Output** (`output`): stage buffer plus gathered writes
//! - **Input** (`input`): incremental packet framing and routing
//! - **Connection** ([`Connection`]): the shared lock, the I/O duty token
//!   and the public API
//!
//! ## Example
//!
//! ```no_run
//! use xwire_client::protocol::{flags, RequestInfo};
//! use xwire_client::Connection;
//!
//! let (conn, _screen) = Connection::connect(None)?;
//!
//! // NoOperation (opcode 127), checked so its error can be collected.
//! let mut request = [0u8; 4];
//! let seq = conn.send_request(flags::CHECKED, &RequestInfo::core(127, true), &mut request, &[])?;
//! assert!(conn.request_check(seq)?.is_none());
//! # Ok::<(), xwire_client::XwireError>(())
//! ```

pub mod config;
pub mod error;
pub mod ext;
pub mod protocol;
pub mod transport;

mod connection;
mod input;
mod output;
mod xid;

pub use config::{AuthInfo, ConnectionBuilder, ConnectionConfig};
pub use connection::{Connection, SYNC_THRESHOLD};
pub use error::{Result, ShutdownReason, XwireError};
pub use ext::Extension;
pub use input::DEFAULT_READ_CHUNK_SIZE;
pub use output::DEFAULT_OUTPUT_BUFFER_SIZE;
pub use protocol::{Packet, PacketKind, ReplyStatus, Response};
