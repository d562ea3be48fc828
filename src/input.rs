//! Input engine: packet framing and routing.
//!
//! Uses `bytes::BytesMut` to accumulate socket reads. Each complete packet
//! is matched against the outstanding requests by sequence number and
//! routed:
//!
//! ```text
//!                         ┌─► reply / checked error ─► current reply ─► replies map (by sequence)
//! socket ─► BytesMut ─► plan ─► discard ─► dropped
//!                         └─► event / unchecked error ─► event queue
//! ```
//!
//! A packet is planned from its header without touching any state, and the
//! plan is only committed once every byte of the packet is buffered. A short
//! read therefore never advances the watermarks for a packet that cannot be
//! delivered yet.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::Condvar;

use crate::error::ShutdownReason;
use crate::protocol::sequence::{widen, wrapping_gt, wrapping_le, wrapping_lt};
use crate::protocol::{
    flags, read_word, GenericHeader, Packet, ReplyStatus, Response, HEADER_SIZE,
};
use crate::transport::Stream;

/// Default size of a single socket read.
pub const DEFAULT_READ_CHUNK_SIZE: usize = 16384;

/// Server bugs the input engine compensates for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Workaround {
    None,
    /// GLX GetFBConfigs replies declare a length that is too small; the real
    /// length is `words[2] * words[3] * 2`.
    GlxGetFbConfigs,
}

/// A request that needs special handling of its responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PendingReply {
    pub first_request: u32,
    pub last_request: u32,
    pub workaround: Workaround,
    pub flags: u32,
}

/// A thread blocked waiting for the responses to `request`.
#[derive(Debug)]
pub(crate) struct Reader {
    request: u32,
    cond: Arc<Condvar>,
}

/// What committing the packet at the front of the buffer will do.
#[derive(Debug)]
struct PacketPlan {
    sequenced: bool,
    read: u32,
    expected: u32,
    completed: u32,
    retire: usize,
    pending: Option<PendingReply>,
    unexpected_reply: bool,
    len: usize,
}

/// Input-side bookkeeping, guarded by the connection lock.
#[derive(Debug)]
pub(crate) struct InputState {
    buffer: BytesMut,
    scratch: Vec<u8>,
    /// Sequence number of the last packet read.
    pub request_read: u32,
    /// Last request that expects a reply.
    pub request_expected: u32,
    /// Highest request known to have received all of its responses.
    pub request_completed: u32,
    current_reply: VecDeque<Packet>,
    replies: HashMap<u32, VecDeque<Packet>>,
    events: VecDeque<Packet>,
    pending_replies: VecDeque<PendingReply>,
    readers: VecDeque<Reader>,
}

impl InputState {
    pub fn new(read_chunk_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(read_chunk_size),
            scratch: vec![0u8; read_chunk_size.max(HEADER_SIZE)],
            request_read: 0,
            request_expected: 0,
            request_completed: 0,
            current_reply: VecDeque::new(),
            replies: HashMap::new(),
            events: VecDeque::new(),
            pending_replies: VecDeque::new(),
            readers: VecDeque::new(),
        }
    }

    /// Register special handling for the responses to `request`.
    pub fn expect_reply(&mut self, request: u32, workaround: Workaround, flags: u32) {
        self.pending_replies.push_back(PendingReply {
            first_request: request,
            last_request: request,
            workaround,
            flags,
        });
    }

    /// Register a blocked reader, keeping the list ordered by sequence.
    pub fn insert_reader(&mut self, request: u32, cond: Arc<Condvar>) {
        let at = self
            .readers
            .iter()
            .position(|r| wrapping_gt(r.request, request))
            .unwrap_or(self.readers.len());
        self.readers.insert(at, Reader { request, cond });
    }

    pub fn remove_reader(&mut self, cond: &Arc<Condvar>) {
        self.readers.retain(|r| !Arc::ptr_eq(&r.cond, cond));
    }

    /// Pass the read duty on: to the earliest reader, else to an event waiter.
    pub fn wake_up_next_reader(&self, event_cond: &Condvar) {
        match self.readers.front() {
            Some(reader) => {
                reader.cond.notify_one();
            }
            None => {
                event_cond.notify_one();
            }
        }
    }

    pub fn notify_all_readers(&self) {
        for reader in &self.readers {
            reader.cond.notify_all();
        }
    }

    fn remove_finished_readers(&mut self) {
        while let Some(reader) = self.readers.front() {
            if !wrapping_le(reader.request, self.request_completed) {
                break;
            }
            reader.cond.notify_one();
            self.readers.pop_front();
        }
    }

    /// Check for a response to `request` without reading the socket.
    pub fn poll_for_reply(&mut self, request: u32) -> ReplyStatus {
        if wrapping_lt(request, self.request_read) {
            // Everything for an older request is already in the map.
            let packet = match self.replies.get_mut(&request) {
                Some(queue) => {
                    let packet = queue.pop_front();
                    if queue.is_empty() {
                        self.replies.remove(&request);
                    }
                    packet
                }
                None => None,
            };
            ReplyStatus::Ready(packet.map(Response::from_packet))
        } else if request == self.request_read && !self.current_reply.is_empty() {
            ReplyStatus::Ready(self.current_reply.pop_front().map(Response::from_packet))
        } else if request == self.request_completed {
            ReplyStatus::Ready(None)
        } else {
            ReplyStatus::Pending
        }
    }

    /// Drop queued responses to `request` and mark later ones for discarding.
    pub fn discard_reply(&mut self, request: u32) {
        while let ReplyStatus::Ready(Some(_)) = self.poll_for_reply(request) {}

        if wrapping_le(request, self.request_completed) {
            return;
        }

        let mut at = self.pending_replies.len();
        for (i, pending) in self.pending_replies.iter_mut().enumerate() {
            if wrapping_gt(pending.first_request, request) {
                at = i;
                break;
            }
            if pending.first_request == request {
                pending.flags |= flags::DISCARD_REPLY;
                return;
            }
        }
        self.pending_replies.insert(
            at,
            PendingReply {
                first_request: request,
                last_request: request,
                workaround: Workaround::None,
                flags: flags::DISCARD_REPLY,
            },
        );
    }

    /// Dequeue the oldest event.
    pub fn take_event(&mut self) -> Option<Packet> {
        self.events.pop_front()
    }

    /// One non-blocking read from `stream`, then route every complete packet.
    pub fn read_from(&mut self, stream: &Stream, event_cond: &Condvar) -> Result<(), ShutdownReason> {
        loop {
            match stream.read(&mut self.scratch) {
                Ok(0) => {
                    tracing::debug!("Server closed the connection");
                    return Err(ShutdownReason::Closed);
                }
                Ok(n) => {
                    self.buffer.extend_from_slice(&self.scratch[..n]);
                    break;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    tracing::error!("Socket read failed: {}", e);
                    return Err(ShutdownReason::SocketError);
                }
            }
        }
        self.process_buffered(event_cond)
    }

    /// Append raw bytes and route every complete packet.
    #[cfg(test)]
    pub fn push(&mut self, data: &[u8], event_cond: &Condvar) -> Result<(), ShutdownReason> {
        self.buffer.extend_from_slice(data);
        self.process_buffered(event_cond)
    }

    fn process_buffered(&mut self, event_cond: &Condvar) -> Result<(), ShutdownReason> {
        while let Some(plan) = self.plan()? {
            self.commit(plan, event_cond);
        }
        Ok(())
    }

    /// Work out what the packet at the front of the buffer means, without
    /// changing anything. `None` until the whole packet is buffered.
    fn plan(&self) -> Result<Option<PacketPlan>, ShutdownReason> {
        if self.buffer.len() < HEADER_SIZE {
            return Ok(None);
        }
        let header = match GenericHeader::decode(&self.buffer) {
            Some(header) => header,
            None => return Ok(None),
        };

        let sequenced = header.has_sequence();
        let mut read = self.request_read;
        let mut expected = self.request_expected;
        let mut completed = self.request_completed;
        let mut retire = 0;

        if sequenced {
            read = widen(self.request_read, header.sequence);
            if wrapping_gt(read, expected) {
                expected = read;
            }
            if read != self.request_read {
                completed = read.wrapping_sub(1);
            }
            retire = self
                .pending_replies
                .iter()
                .take_while(|p| wrapping_le(p.last_request, completed))
                .count();
            if header.is_error() {
                completed = read;
            }
        }

        let pending = if header.is_reply() || header.is_error() {
            self.pending_replies
                .get(retire)
                .copied()
                .filter(|p| wrapping_le(p.first_request, read) && wrapping_le(read, p.last_request))
        } else {
            None
        };

        let extra_words = match pending {
            Some(p) if header.is_reply() && p.workaround == Workaround::GlxGetFbConfigs => {
                let w2 = u64::from(read_word(&self.buffer, 2));
                let w3 = u64::from(read_word(&self.buffer, 3));
                w2.checked_mul(w3).and_then(|n| n.checked_mul(2))
            }
            _ => Some(header.declared_extra_words()),
        };

        let len = extra_words
            .filter(|&w| w <= u64::from(u32::MAX))
            .and_then(|w| usize::try_from(w * 4).ok())
            .and_then(|bytes| bytes.checked_add(HEADER_SIZE))
            .ok_or_else(|| {
                tracing::error!("Packet length overflow at sequence {}", read);
                ShutdownReason::Desynchronized
            })?;

        if self.buffer.len() < len {
            return Ok(None);
        }

        Ok(Some(PacketPlan {
            sequenced,
            read,
            expected,
            completed,
            retire,
            pending,
            unexpected_reply: header.is_reply() && wrapping_gt(read, self.request_expected),
            len,
        }))
    }

    fn commit(&mut self, plan: PacketPlan, event_cond: &Condvar) {
        if plan.sequenced {
            if plan.read != self.request_read && !self.current_reply.is_empty() {
                let previous = self.request_read;
                let moved = std::mem::take(&mut self.current_reply);
                self.replies.entry(previous).or_default().extend(moved);
            }
            self.request_read = plan.read;
            self.request_expected = plan.expected;
            self.request_completed = plan.completed;
            self.pending_replies.drain(..plan.retire);
            self.remove_finished_readers();
        }

        let data = self.buffer.split_to(plan.len).freeze();
        let packet = Packet::framed(data, self.request_read);

        if plan.unexpected_reply {
            tracing::warn!(
                "Reply for sequence {} which expects no reply",
                packet.sequence()
            );
        }

        let pending_flags = plan.pending.map_or(0, |p| p.flags);
        if flags::has_flag(pending_flags, flags::DISCARD_REPLY) {
            tracing::trace!("Discarding response for sequence {}", packet.sequence());
            return;
        }

        let checked_error = packet.is_error() && flags::has_flag(pending_flags, flags::CHECKED);
        if packet.is_reply() || checked_error {
            tracing::trace!(
                "Queued {} for sequence {}",
                if checked_error { "checked error" } else { "reply" },
                packet.sequence()
            );
            let read = self.request_read;
            self.current_reply.push_back(packet);
            for reader in &self.readers {
                if wrapping_gt(reader.request, read) {
                    break;
                }
                if reader.request == read {
                    reader.cond.notify_one();
                    break;
                }
            }
            return;
        }

        tracing::trace!(
            "Queued event type {} at sequence {}",
            packet.response_type(),
            packet.sequence()
        );
        self.events.push_back(packet);
        event_cond.notify_one();
    }

    #[cfg(test)]
    fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{build_packet, PacketKind, ERROR, GE_GENERIC, KEYMAP_NOTIFY, REPLY};

    fn state() -> (InputState, Condvar) {
        (InputState::new(DEFAULT_READ_CHUNK_SIZE), Condvar::new())
    }

    fn reply_bytes(sequence: u16, body: &[u8]) -> Vec<u8> {
        build_packet(REPLY, 0, sequence, body)
    }

    #[test]
    fn test_reply_goes_to_current_reply() {
        let (mut input, cond) = state();
        input.request_expected = 1;
        input.push(&reply_bytes(1, b"data"), &cond).unwrap();

        assert_eq!(input.request_read, 1);
        assert_eq!(input.request_completed, 0);
        match input.poll_for_reply(1) {
            ReplyStatus::Ready(Some(Response::Reply(p))) => {
                assert_eq!(p.sequence(), 1);
                assert_eq!(&p.as_bytes()[8..12], b"data");
            }
            other => panic!("unexpected status: {:?}", other),
        }
        // More replies may still follow for the same request.
        assert_eq!(input.poll_for_reply(1), ReplyStatus::Pending);
    }

    #[test]
    fn test_later_packet_moves_replies_to_map() {
        let (mut input, cond) = state();
        input.request_expected = 2;
        input.push(&reply_bytes(1, b"one"), &cond).unwrap();
        input.push(&build_packet(12, 0, 2, &[]), &cond).unwrap();

        assert_eq!(input.request_read, 2);
        assert_eq!(input.request_completed, 1);
        assert!(matches!(
            input.poll_for_reply(1),
            ReplyStatus::Ready(Some(Response::Reply(_)))
        ));
        assert_eq!(input.poll_for_reply(1), ReplyStatus::Ready(None));
        assert_eq!(input.take_event().map(|e| e.kind()), Some(PacketKind::Event(12)));
    }

    #[test]
    fn test_checked_and_unchecked_errors() {
        let (mut input, cond) = state();
        input.expect_reply(2, Workaround::None, flags::CHECKED);
        input.push(&build_packet(ERROR, 3, 2, &[]), &cond).unwrap();

        assert_eq!(input.request_completed, 2);
        match input.poll_for_reply(2) {
            ReplyStatus::Ready(Some(Response::Error(p))) => assert_eq!(p.error_code(), Some(3)),
            other => panic!("unexpected status: {:?}", other),
        }
        assert_eq!(input.poll_for_reply(2), ReplyStatus::Ready(None));

        input.push(&build_packet(ERROR, 8, 3, &[]), &cond).unwrap();
        assert_eq!(input.poll_for_reply(3), ReplyStatus::Ready(None));
        let event = input.take_event().unwrap();
        assert!(event.is_error());
        assert_eq!(event.sequence(), 3);
    }

    #[test]
    fn test_discard_flag_drops_reply() {
        let (mut input, cond) = state();
        input.request_expected = 1;
        input.expect_reply(1, Workaround::None, flags::DISCARD_REPLY);
        input.push(&reply_bytes(1, b"gone"), &cond).unwrap();

        assert_eq!(input.request_read, 1);
        assert_eq!(input.poll_for_reply(1), ReplyStatus::Pending);
        assert!(input.take_event().is_none());
        assert_eq!(input.buffered(), 0);
    }

    #[test]
    fn test_partial_packet_commits_nothing() {
        let (mut input, cond) = state();
        input.request_expected = 1;
        let bytes = reply_bytes(1, &[7u8; 40]);

        input.push(&bytes[..20], &cond).unwrap();
        assert_eq!(input.request_read, 0);
        input.push(&bytes[20..36], &cond).unwrap();
        assert_eq!(input.request_read, 0);
        assert_eq!(input.poll_for_reply(1), ReplyStatus::Pending);

        input.push(&bytes[36..], &cond).unwrap();
        assert_eq!(input.request_read, 1);
        assert!(matches!(
            input.poll_for_reply(1),
            ReplyStatus::Ready(Some(Response::Reply(p))) if p.len() == 48
        ));
    }

    #[test]
    fn test_glx_length_workaround_frames_next_packet() {
        let (mut input, cond) = state();
        input.request_expected = 1;
        input.expect_reply(1, Workaround::GlxGetFbConfigs, 0);

        // Declared length 0, real length words[2] * words[3] * 2 = 1 * 2 * 2 words.
        let mut reply = build_packet(REPLY, 0, 1, &[]);
        reply[8..12].copy_from_slice(&1u32.to_ne_bytes());
        reply[12..16].copy_from_slice(&2u32.to_ne_bytes());
        reply.extend_from_slice(&[0xEE; 16]);
        let mut stream = reply;
        stream.extend_from_slice(&build_packet(12, 0, 1, &[]));

        input.push(&stream, &cond).unwrap();
        assert!(matches!(
            input.poll_for_reply(1),
            ReplyStatus::Ready(Some(Response::Reply(p))) if p.len() == 48
        ));
        let event = input.take_event().unwrap();
        assert_eq!(event.kind(), PacketKind::Event(12));
        assert_eq!(input.buffered(), 0);
    }

    #[test]
    fn test_generic_event_extra_length() {
        let (mut input, cond) = state();
        let event = build_packet(GE_GENERIC, 0, 0, &[1u8; 36]);
        assert_eq!(event.len(), 44);

        input.push(&event, &cond).unwrap();
        let packet = input.take_event().unwrap();
        assert!(packet.is_generic_event());
        assert_eq!(packet.len(), 44);
    }

    #[test]
    fn test_keymap_notify_keeps_sequence() {
        let (mut input, cond) = state();
        input.request_read = 5;
        input.request_completed = 4;
        input.push(&build_packet(KEYMAP_NOTIFY, 0, 0xFFFF, &[]), &cond).unwrap();

        assert_eq!(input.request_read, 5);
        assert_eq!(input.request_completed, 4);
        assert_eq!(input.take_event().unwrap().sequence(), 5);
    }

    #[test]
    fn test_sequence_widening_across_16_bits() {
        let (mut input, cond) = state();
        input.request_read = 0xFFFE;
        input.request_completed = 0xFFFD;
        input.request_expected = 0x1_0001;
        input.push(&reply_bytes(0x0001, &[]), &cond).unwrap();

        assert_eq!(input.request_read, 0x1_0001);
        assert_eq!(input.request_completed, 0x1_0000);
        assert!(matches!(
            input.poll_for_reply(0x1_0001),
            ReplyStatus::Ready(Some(Response::Reply(_)))
        ));
    }

    #[test]
    fn test_pending_records_retire() {
        let (mut input, cond) = state();
        input.expect_reply(1, Workaround::None, flags::CHECKED);
        input.expect_reply(3, Workaround::None, flags::CHECKED);
        input.push(&build_packet(12, 0, 3, &[]), &cond).unwrap();

        assert_eq!(input.pending_replies.len(), 1);
        assert_eq!(input.pending_replies[0].first_request, 3);
    }

    #[test]
    fn test_finished_readers_are_removed_in_order() {
        let (mut input, cond) = state();
        let a = Arc::new(Condvar::new());
        let b = Arc::new(Condvar::new());
        let c = Arc::new(Condvar::new());
        input.insert_reader(5, b.clone());
        input.insert_reader(2, a.clone());
        input.insert_reader(9, c.clone());
        assert_eq!(
            input.readers.iter().map(|r| r.request).collect::<Vec<_>>(),
            vec![2, 5, 9]
        );

        input.push(&build_packet(12, 0, 6, &[]), &cond).unwrap();
        assert_eq!(input.readers.len(), 1);
        assert_eq!(input.readers[0].request, 9);

        input.remove_reader(&c);
        assert!(input.readers.is_empty());
    }

    #[test]
    fn test_discard_reply_queued_and_future() {
        let (mut input, cond) = state();
        input.request_expected = 3;
        input.push(&reply_bytes(1, b"a"), &cond).unwrap();
        input.push(&reply_bytes(2, b"b"), &cond).unwrap();

        input.discard_reply(1);
        assert_eq!(input.poll_for_reply(1), ReplyStatus::Ready(None));

        input.discard_reply(3);
        input.push(&reply_bytes(3, b"c"), &cond).unwrap();
        assert_eq!(input.poll_for_reply(3), ReplyStatus::Pending);
        assert!(input.take_event().is_none());
    }

    #[test]
    fn test_overflowing_workaround_length_desynchronizes() {
        let (mut input, cond) = state();
        input.request_expected = 1;
        input.expect_reply(1, Workaround::GlxGetFbConfigs, 0);
        let mut reply = build_packet(REPLY, 0, 1, &[]);
        reply[8..12].copy_from_slice(&u32::MAX.to_ne_bytes());
        reply[12..16].copy_from_slice(&u32::MAX.to_ne_bytes());

        assert_eq!(input.push(&reply, &cond), Err(ShutdownReason::Desynchronized));
    }
}
