//! The shared connection: request submission and response retrieval.
//!
//! A [`Connection`] is shared by reference (typically in an `Arc`) between
//! any number of threads. One lock guards all I/O state; the extension
//! cache, the resource id allocator and the maximum request length each
//! have their own.
//!
//! ```text
//!   send_request ──► [ output: stage buffer / writev ] ──┐
//!                                                        ├──► socket
//!   wait_for_reply ◄─ replies map ◄─┐                    │
//!   wait_for_event ◄─ event queue ◄─┴─ [ input: plan ] ◄─┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use xwire_client::Connection;
//!
//! let (conn, _screen) = Connection::connect(None)?;
//! conn.sync()?;
//! while let Some(event) = conn.poll_for_event()? {
//!     println!("event type {}", event.response_type());
//! }
//! # Ok::<(), xwire_client::XwireError>(())
//! ```

mod handshake;
mod wait;

use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::config::{ConnectionBuilder, ConnectionConfig};
use crate::error::{Result, ShutdownReason, XwireError};
use crate::ext::{ExtensionCache, BIG_REQUESTS, GLX};
use crate::input::{InputState, Workaround};
use crate::output::{request_parts, OutputState, WriteBatch};
use crate::protocol::requests::{
    self, GLX_GET_FB_CONFIGS, GLX_VENDOR_GET_FB_CONFIGS_SGIX, GLX_VENDOR_PRIVATE_WITH_REPLY,
};
use crate::protocol::sequence::{wrapping_ge, wrapping_gt};
use crate::protocol::{
    flags, padded_len, read_word, AuthInfo, Packet, ReplyStatus, RequestInfo, Response, Setup,
    REQUEST_PREFIX_SIZE,
};
use crate::transport::Stream;
use crate::xid::XidState;

pub(crate) use wait::DutyToken;

/// Outstanding void requests allowed before a sync round trip is forced.
pub const SYNC_THRESHOLD: u32 = 65530;

/// All mutable I/O state, guarded by the connection lock.
#[derive(Debug)]
pub(crate) struct IoState {
    pub out: OutputState,
    pub input: InputState,
    pub duty: DutyToken,
    pub shutdown: Option<ShutdownReason>,
}

/// Negotiation state of the maximum request length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestLength {
    Unknown,
    /// BIG-REQUESTS Enable was sent with this sequence number.
    Pending(u32),
    Known(u32),
}

/// Framing decided before the request is sequenced.
#[derive(Debug)]
struct Framed {
    workaround: Workaround,
    big_length: Option<[u8; 4]>,
}

/// A connection to the server.
pub struct Connection {
    stream: Stream,
    setup: Setup,
    io: Mutex<IoState>,
    event_cond: Condvar,
    out_cond: Condvar,
    pub(crate) extensions: ExtensionCache,
    pub(crate) xid: Mutex<XidState>,
    max_request_length: Mutex<RequestLength>,
}

impl Connection {
    /// Connect to `display` (or `$DISPLAY`), returning the connection and the
    /// screen named in the display string.
    pub fn connect(display: Option<&str>) -> Result<(Self, u32)> {
        ConnectionBuilder::new().connect(display)
    }

    /// Connect to `display` (or `$DISPLAY`) with explicit authorization.
    pub fn connect_with_auth(display: Option<&str>, auth: AuthInfo) -> Result<(Self, u32)> {
        ConnectionBuilder::new().auth(auth).connect(display)
    }

    /// Perform the handshake over an already connected stream.
    pub fn connect_to_stream(stream: Stream, auth: Option<AuthInfo>) -> Result<Self> {
        let mut builder = ConnectionBuilder::new();
        if let Some(auth) = auth {
            builder = builder.auth(auth);
        }
        builder.connect_to_stream(stream)
    }

    /// Start configuring a connection.
    pub fn builder() -> ConnectionBuilder {
        ConnectionBuilder::new()
    }

    pub(crate) fn establish(
        stream: Stream,
        auth: Option<&AuthInfo>,
        config: &ConnectionConfig,
    ) -> Result<Self> {
        stream.set_nonblocking(false)?;
        let setup = handshake::handshake(&stream, auth)?;
        stream.set_nonblocking(true)?;

        let xid = XidState::new(setup.resource_id_base, setup.resource_id_mask);
        Ok(Self {
            stream,
            io: Mutex::new(IoState {
                out: OutputState::new(config.output_buffer_size),
                input: InputState::new(config.read_chunk_size),
                duty: DutyToken::default(),
                shutdown: None,
            }),
            event_cond: Condvar::new(),
            out_cond: Condvar::new(),
            extensions: ExtensionCache::default(),
            xid: Mutex::new(xid),
            max_request_length: Mutex::new(RequestLength::Unknown),
            setup,
        })
    }

    /// Setup data sent by the server.
    #[inline]
    pub fn setup(&self) -> &Setup {
        &self.setup
    }

    /// Whether the connection has been shut down.
    pub fn has_error(&self) -> bool {
        self.io.lock().shutdown.is_some()
    }

    /// Why the connection was shut down, if it was.
    pub fn shutdown_reason(&self) -> Option<ShutdownReason> {
        self.io.lock().shutdown
    }

    /// Send a request and return its sequence number.
    ///
    /// `fixed` holds the fixed part of the request, starting with the 4-byte
    /// prefix; opcode and length are filled in unless `flags::RAW` is set.
    /// `tail` holds the variable-length parts. Each part is padded to a
    /// multiple of 4 bytes on the wire.
    ///
    /// Requests are buffered; use [`flush`](Self::flush) or wait for a reply
    /// to push them out.
    pub fn send_request(
        &self,
        flags: u32,
        info: &RequestInfo,
        fixed: &mut [u8],
        tail: &[&[u8]],
    ) -> Result<u32> {
        self.io.lock().check()?;
        let framed = self.frame_request(flags, info, fixed, tail)?;

        let mut guard = self.io.lock();
        self.enqueue(&mut guard, flags, info.is_void, fixed, tail, &framed)
    }

    /// Fill in opcodes and length, choosing the extended length encoding
    /// when the request is too long for the 16-bit field.
    fn frame_request(
        &self,
        flags: u32,
        info: &RequestInfo,
        fixed: &mut [u8],
        tail: &[&[u8]],
    ) -> Result<Framed> {
        if fixed.len() < REQUEST_PREFIX_SIZE {
            return Err(XwireError::Protocol(format!(
                "request of {} bytes is shorter than its prefix",
                fixed.len()
            )));
        }

        let mut framed = Framed {
            workaround: Workaround::None,
            big_length: None,
        };
        if flags::has_flag(flags, flags::RAW) {
            return Ok(framed);
        }

        match info.extension {
            Some(extension) => {
                let data = self
                    .extension_data(extension)?
                    .filter(|data| data.present)
                    .ok_or(XwireError::ExtensionMissing(extension.name()))?;
                fixed[0] = data.major_opcode;
                fixed[1] = info.opcode;

                let fb_configs = info.opcode == GLX_GET_FB_CONFIGS
                    || (info.opcode == GLX_VENDOR_PRIVATE_WITH_REPLY
                        && fixed.len() >= 8
                        && read_word(fixed, 1) == GLX_VENDOR_GET_FB_CONFIGS_SGIX);
                if extension.name() == GLX.name() && fb_configs {
                    framed.workaround = Workaround::GlxGetFbConfigs;
                }
            }
            None => fixed[0] = info.opcode,
        }

        let bytes = padded_len(fixed.len())
            + tail.iter().map(|c| padded_len(c.len())).sum::<usize>();
        let length = (bytes / 4) as u64;
        if length <= u64::from(self.setup.maximum_request_length) {
            fixed[2..4].copy_from_slice(&(length as u16).to_ne_bytes());
        } else {
            let maximum = self.maximum_request_length()?;
            let extended = length + 1;
            if extended > u64::from(maximum) {
                return Err(XwireError::RequestTooLarge {
                    length: extended,
                    maximum,
                });
            }
            fixed[2..4].copy_from_slice(&0u16.to_ne_bytes());
            framed.big_length = Some((extended as u32).to_ne_bytes());
        }
        Ok(framed)
    }

    /// Assign the next sequence number and stage or write the request.
    fn enqueue(
        &self,
        guard: &mut MutexGuard<'_, IoState>,
        flags: u32,
        is_void: bool,
        fixed: &[u8],
        tail: &[&[u8]],
        framed: &Framed,
    ) -> Result<u32> {
        self.wait_for_writer(guard)?;

        if is_void && guard.out.request.wrapping_sub(guard.input.request_read) > SYNC_THRESHOLD {
            tracing::debug!(
                "{} requests outstanding since sequence {}, syncing",
                guard.out.request.wrapping_sub(guard.input.request_read),
                guard.input.request_read
            );
            MutexGuard::unlocked(guard, || self.sync())?;
            self.wait_for_writer(guard)?;
        }

        let request = guard.out.request.wrapping_add(1);
        guard.out.request = request;
        if !is_void {
            guard.input.request_expected = request;
        }
        if framed.workaround != Workaround::None
            || flags::has_flag(flags, flags::CHECKED | flags::DISCARD_REPLY)
        {
            guard.input.expect_reply(request, framed.workaround, flags);
        }

        let parts = request_parts(fixed, framed.big_length.as_ref(), tail);
        let len: usize = parts.iter().map(|p| p.len()).sum();
        tracing::trace!("Request {} ({} bytes)", request, len);

        if guard.out.fits(len) {
            guard.out.append(&parts);
        } else {
            let staged = guard.out.take_queue();
            self.send_batch(guard, WriteBatch::new(staged, parts))?;
        }
        Ok(request)
    }

    /// Send a GetInputFocus whose reply is dropped, as a sequence marker.
    fn send_sync_locked(&self, guard: &mut MutexGuard<'_, IoState>) -> Result<u32> {
        let (mut fixed, info) = requests::get_input_focus();
        requests::frame_short(&mut fixed, info.opcode, 0, &[])?;
        let framed = Framed {
            workaround: Workaround::None,
            big_length: None,
        };
        self.enqueue(guard, flags::DISCARD_REPLY, info.is_void, &fixed, &[], &framed)
    }

    fn send_batch(&self, guard: &mut MutexGuard<'_, IoState>, mut batch: WriteBatch<'_>) -> Result<()> {
        while !batch.is_done() {
            self.conn_wait(guard, &self.out_cond, Some(&mut batch))?;
        }
        guard.out.request_written = guard.out.request;
        guard.out.recycle(batch.into_staged());
        self.out_cond.notify_all();
        guard.input.wake_up_next_reader(&self.event_cond);
        Ok(())
    }

    fn flush_to_locked(&self, guard: &mut MutexGuard<'_, IoState>, request: u32) -> Result<()> {
        loop {
            guard.check()?;
            if wrapping_ge(guard.out.request_written, request) {
                return Ok(());
            }
            if guard.duty.writing {
                self.out_cond.wait(guard);
                continue;
            }
            if !guard.out.has_queued() {
                return Err(XwireError::Protocol(format!(
                    "request {} is neither written nor queued",
                    request
                )));
            }
            let staged = guard.out.take_queue();
            return self.send_batch(guard, WriteBatch::new(staged, Vec::new()));
        }
    }

    fn check_issued(guard: &IoState, request: u32) -> Result<()> {
        if wrapping_gt(request, guard.out.request) {
            return Err(XwireError::Protocol(format!(
                "request {} has not been sent (last is {})",
                request, guard.out.request
            )));
        }
        Ok(())
    }

    /// Write every buffered request.
    pub fn flush(&self) -> Result<()> {
        let mut guard = self.io.lock();
        let request = guard.out.request;
        self.flush_to_locked(&mut guard, request)
    }

    /// Make sure every request up to `request` reached the socket.
    pub fn flush_to(&self, request: u32) -> Result<()> {
        let mut guard = self.io.lock();
        Self::check_issued(&guard, request)?;
        self.flush_to_locked(&mut guard, request)
    }

    /// Round trip to the server.
    pub fn sync(&self) -> Result<()> {
        let (mut fixed, info) = requests::get_input_focus();
        let request = self.send_request(0, &info, &mut fixed, &[])?;
        self.wait_for_reply(request)?;
        Ok(())
    }

    /// Block until the response to `request` is known.
    ///
    /// Returns the reply, the error for a checked request, or `None` when
    /// the request is settled without either.
    pub fn wait_for_reply(&self, request: u32) -> Result<Option<Response>> {
        let mut guard = self.io.lock();
        Self::check_issued(&guard, request)?;
        self.wait_for_reply_locked(&mut guard, request)
    }

    fn wait_for_reply_locked(
        &self,
        guard: &mut MutexGuard<'_, IoState>,
        request: u32,
    ) -> Result<Option<Response>> {
        let outcome = match self.flush_to_locked(guard, request) {
            Ok(()) => {
                let cond = Arc::new(Condvar::new());
                guard.input.insert_reader(request, cond.clone());
                let outcome = loop {
                    if let ReplyStatus::Ready(response) = guard.input.poll_for_reply(request) {
                        break Ok(response);
                    }
                    if let Err(e) = self.conn_wait(guard, &cond, None) {
                        break Err(e);
                    }
                };
                guard.input.remove_reader(&cond);
                outcome
            }
            Err(e) => Err(e),
        };
        guard.input.wake_up_next_reader(&self.event_cond);
        outcome
    }

    /// Check for the response to `request` without blocking.
    ///
    /// Reads from the socket only when no other thread is reading. Does not
    /// flush.
    pub fn poll_for_reply(&self, request: u32) -> Result<ReplyStatus> {
        let mut guard = self.io.lock();
        guard.check()?;
        Self::check_issued(&guard, request)?;

        let status = guard.input.poll_for_reply(request);
        if matches!(status, ReplyStatus::Pending) && guard.duty.reading == 0 {
            self.read_available(&mut guard)?;
            return Ok(guard.input.poll_for_reply(request));
        }
        Ok(status)
    }

    /// Drop the responses to `request`, now and when they arrive.
    pub fn discard_reply(&self, request: u32) {
        let mut guard = self.io.lock();
        if guard.shutdown.is_some() || wrapping_gt(request, guard.out.request) {
            return;
        }
        guard.input.discard_reply(request);
    }

    /// Find out whether the void request `request`, sent with
    /// `flags::CHECKED`, failed. Forces a round trip if the answer is not
    /// yet known.
    pub fn request_check(&self, request: u32) -> Result<Option<Packet>> {
        let mut guard = self.io.lock();
        guard.check()?;
        Self::check_issued(&guard, request)?;

        if wrapping_ge(request, guard.input.request_expected)
            && wrapping_gt(request, guard.input.request_completed)
        {
            self.send_sync_locked(&mut guard)?;
            let last = guard.out.request;
            self.flush_to_locked(&mut guard, last)?;
        }

        match self.wait_for_reply_locked(&mut guard, request)? {
            Some(Response::Error(error)) => Ok(Some(error)),
            Some(Response::Reply(_)) => {
                tracing::warn!("Checked request {} produced a reply", request);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// Block until an event (or unchecked error) is available.
    pub fn wait_for_event(&self) -> Result<Packet> {
        let mut guard = self.io.lock();
        let outcome = loop {
            if let Some(event) = guard.input.take_event() {
                break Ok(event);
            }
            if let Err(e) = self.conn_wait(&mut guard, &self.event_cond, None) {
                break Err(e);
            }
        };
        guard.input.wake_up_next_reader(&self.event_cond);
        outcome
    }

    /// Return the next event if one is queued or can be read without
    /// blocking.
    pub fn poll_for_event(&self) -> Result<Option<Packet>> {
        let mut guard = self.io.lock();
        guard.check()?;
        if let Some(event) = guard.input.take_event() {
            return Ok(Some(event));
        }
        if guard.duty.reading == 0 {
            self.read_available(&mut guard)?;
            return Ok(guard.input.take_event());
        }
        Ok(None)
    }

    /// Like [`poll_for_event`](Self::poll_for_event) for callers with no
    /// error path: an I/O failure aborts the process.
    pub fn poll_for_event_or_abort(&self) -> Option<Packet> {
        match self.poll_for_event() {
            Ok(event) => event,
            Err(e) => {
                tracing::error!("Event poll failed, aborting: {}", e);
                std::process::abort()
            }
        }
    }

    /// Return the next already queued event without touching the socket.
    ///
    /// Still drains the queue after the connection has shut down.
    pub fn poll_for_queued_event(&self) -> Option<Packet> {
        self.io.lock().input.take_event()
    }

    /// Sequence number of the last packet read, after draining whatever
    /// can be read without blocking.
    pub fn last_request_read(&self) -> Result<u32> {
        let mut guard = self.io.lock();
        guard.check()?;
        if guard.duty.reading == 0 {
            self.read_available(&mut guard)?;
        }
        Ok(guard.input.request_read)
    }

    /// Largest request length in 4-byte units, enabling BIG-REQUESTS on
    /// first use when the server supports it.
    pub fn maximum_request_length(&self) -> Result<u32> {
        let mut state = self.max_request_length.lock();
        self.prefetch_maximum_request_length_locked(&mut state)?;

        let maximum = match *state {
            RequestLength::Known(maximum) => maximum,
            RequestLength::Pending(request) => {
                let maximum = match self.wait_for_reply(request)? {
                    Some(Response::Reply(reply)) => requests::parse_big_requests_enable(&reply)?,
                    _ => u32::from(self.setup.maximum_request_length),
                };
                tracing::debug!("BIG-REQUESTS enabled, maximum request length {}", maximum);
                *state = RequestLength::Known(maximum);
                maximum
            }
            RequestLength::Unknown => u32::from(self.setup.maximum_request_length),
        };
        Ok(maximum)
    }

    /// Send the BIG-REQUESTS Enable request without waiting for its reply.
    pub fn prefetch_maximum_request_length(&self) -> Result<()> {
        let mut state = self.max_request_length.lock();
        self.prefetch_maximum_request_length_locked(&mut state)
    }

    fn prefetch_maximum_request_length_locked(&self, state: &mut RequestLength) -> Result<()> {
        if *state != RequestLength::Unknown {
            return Ok(());
        }
        let data = self
            .extension_data(&BIG_REQUESTS)?
            .filter(|data| data.present);
        if let Some(data) = data {
            let (mut fixed, info) = requests::big_requests_enable();
            requests::frame_short(&mut fixed, data.major_opcode, info.opcode, &[])?;
            let request = self.send_request(flags::RAW, &info, &mut fixed, &[])?;
            *state = RequestLength::Pending(request);
        } else {
            tracing::debug!("BIG-REQUESTS not available");
            *state = RequestLength::Known(u32::from(self.setup.maximum_request_length));
        }
        Ok(())
    }
}

impl AsRawFd for Connection {
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("fd", &self.stream.as_raw_fd())
            .field("vendor", &self.setup.vendor)
            .finish_non_exhaustive()
    }
}
