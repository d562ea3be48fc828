//! In-process fake X server for integration tests.
//!
//! The server runs on a background thread over one end of a
//! `UnixStream::pair()`. It answers the setup request, then reads requests
//! one by one and writes whatever the test's handler returns for each.

#![allow(dead_code)]

use std::io::{self, Read, Write};
use std::os::unix::net::UnixStream;
use std::thread::{self, JoinHandle};

use xwire_client::protocol::{build_packet, ERROR, REPLY};
use xwire_client::transport::Stream;
use xwire_client::Connection;

pub const RESOURCE_ID_BASE: u32 = 0x0060_0000;
pub const RESOURCE_ID_MASK: u32 = 0x001F_FFFF;
pub const SETUP_MAX_REQUEST: u16 = 64;
pub const BIG_REQUESTS_MAX: u32 = 1 << 20;

pub const BIG_REQUESTS_MAJOR: u8 = 130;
pub const XC_MISC_MAJOR: u8 = 131;
pub const GLX_MAJOR: u8 = 132;

pub const GET_INPUT_FOCUS: u8 = 43;
pub const QUERY_EXTENSION: u8 = 98;
pub const NO_OPERATION: u8 = 127;

/// One request as the server saw it.
#[derive(Debug, Clone)]
pub struct Request {
    /// Sequence number the server assigned.
    pub seq: u32,
    pub major: u8,
    pub minor: u8,
    /// Request bytes, extended length word removed.
    pub data: Vec<u8>,
    /// Whether the request used the extended length encoding.
    pub big: bool,
}

impl Request {
    pub fn seq16(&self) -> u16 {
        self.seq as u16
    }

    pub fn word(&self, index: usize) -> u32 {
        let at = index * 4;
        u32::from_ne_bytes([
            self.data[at],
            self.data[at + 1],
            self.data[at + 2],
            self.data[at + 3],
        ])
    }
}

pub type Handler = Box<dyn FnMut(&Request) -> Vec<Vec<u8>> + Send>;

/// Which extensions the server claims to have.
#[derive(Debug, Clone, Copy)]
pub struct Extensions {
    pub big_requests: bool,
    pub xc_misc: bool,
    pub glx: bool,
}

impl Default for Extensions {
    fn default() -> Self {
        Self {
            big_requests: true,
            xc_misc: true,
            glx: true,
        }
    }
}

pub fn setup_response(base: u32, mask: u32, max_request: u16, vendor: &str) -> Vec<u8> {
    let mut body = vec![0u8; 32];
    body[0..4].copy_from_slice(&1u32.to_ne_bytes());
    body[4..8].copy_from_slice(&base.to_ne_bytes());
    body[8..12].copy_from_slice(&mask.to_ne_bytes());
    body[16..18].copy_from_slice(&(vendor.len() as u16).to_ne_bytes());
    body[18..20].copy_from_slice(&max_request.to_ne_bytes());
    body[26] = 8;
    body[27] = 255;
    body.extend_from_slice(vendor.as_bytes());
    while body.len() % 4 != 0 {
        body.push(0);
    }

    let mut out = vec![1u8, 0];
    out.extend_from_slice(&11u16.to_ne_bytes());
    out.extend_from_slice(&0u16.to_ne_bytes());
    out.extend_from_slice(&((body.len() / 4) as u16).to_ne_bytes());
    out.extend_from_slice(&body);
    out
}

/// Replies for the requests the connection core issues by itself.
pub fn standard_response(request: &Request, extensions: Extensions) -> Vec<Vec<u8>> {
    match request.major {
        GET_INPUT_FOCUS => vec![build_packet(REPLY, 1, request.seq16(), &[0u8; 4])],
        QUERY_EXTENSION => {
            let len = u16::from_ne_bytes([request.data[4], request.data[5]]) as usize;
            let name = &request.data[8..8 + len];
            let major = match name {
                b"BIG-REQUESTS" if extensions.big_requests => BIG_REQUESTS_MAJOR,
                b"XC-MISC" if extensions.xc_misc => XC_MISC_MAJOR,
                b"GLX" if extensions.glx => GLX_MAJOR,
                _ => 0,
            };
            let body = [u8::from(major != 0), major, 0, 0];
            vec![build_packet(REPLY, 0, request.seq16(), &body)]
        }
        BIG_REQUESTS_MAJOR => vec![build_packet(
            REPLY,
            0,
            request.seq16(),
            &BIG_REQUESTS_MAX.to_ne_bytes(),
        )],
        XC_MISC_MAJOR => {
            let mut body = Vec::new();
            body.extend_from_slice(&0x100u32.to_ne_bytes());
            body.extend_from_slice(&4u32.to_ne_bytes());
            vec![build_packet(REPLY, 0, request.seq16(), &body)]
        }
        _ => Vec::new(),
    }
}

/// An error packet for `request`.
pub fn error_for(request: &Request, code: u8) -> Vec<u8> {
    let mut body = [0u8; 4];
    body[0..2].copy_from_slice(&u16::from(request.minor).to_ne_bytes());
    body[2] = request.major;
    build_packet(ERROR, code, request.seq16(), &body)
}

pub struct FakeServer {
    handle: JoinHandle<Vec<Request>>,
}

impl FakeServer {
    /// Start a server with the standard responses and a connected client.
    pub fn start() -> (Connection, FakeServer) {
        Self::with_handler(Extensions::default(), Box::new(|_| Vec::new()))
    }

    /// Start a server whose `handler` output is sent before the standard
    /// response for each request.
    pub fn with_handler(extensions: Extensions, handler: Handler) -> (Connection, FakeServer) {
        let (client, server) = UnixStream::pair().expect("socket pair");
        let handle = thread::spawn(move || serve(server, extensions, handler));
        let conn = Connection::connect_to_stream(Stream::from(client), None).expect("handshake");
        (conn, FakeServer { handle })
    }

    /// Wait for the server to see the client hang up, returning every
    /// request it received.
    pub fn finish(self, conn: Connection) -> Vec<Request> {
        drop(conn);
        self.handle.join().expect("server thread")
    }
}

fn serve(mut socket: UnixStream, extensions: Extensions, mut handler: Handler) -> Vec<Request> {
    let mut seen = Vec::new();
    let mut prefix = [0u8; 12];
    if socket.read_exact(&mut prefix).is_err() {
        return seen;
    }
    let setup = setup_response(RESOURCE_ID_BASE, RESOURCE_ID_MASK, SETUP_MAX_REQUEST, "Fake X");
    if socket.write_all(&setup).is_err() {
        return seen;
    }

    let mut seq = 0u32;
    while let Ok(Some(request)) = read_request(&mut socket, seq + 1) {
        seq += 1;
        let mut out = handler(&request);
        out.extend(standard_response(&request, extensions));
        for packet in out {
            if socket.write_all(&packet).is_err() {
                return seen;
            }
        }
        seen.push(request);
    }
    seen
}

fn read_request(socket: &mut UnixStream, seq: u32) -> io::Result<Option<Request>> {
    let mut head = [0u8; 4];
    match socket.read_exact(&mut head) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let short = u16::from_ne_bytes([head[2], head[3]]) as usize;
    let (units, big) = if short == 0 {
        let mut word = [0u8; 4];
        socket.read_exact(&mut word)?;
        (u32::from_ne_bytes(word) as usize - 1, true)
    } else {
        (short, false)
    };

    let mut data = vec![0u8; units * 4];
    data[..4].copy_from_slice(&head);
    socket.read_exact(&mut data[4..])?;
    Ok(Some(Request {
        seq,
        major: head[0],
        minor: head[1],
        data,
        big,
    }))
}
