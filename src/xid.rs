//! Resource id allocation.
//!
//! Ids are `base | n * inc` where `inc` is the lowest set bit of the mask
//! the server handed out at setup, starting with `base` itself. Once the
//! counter reaches the top of its range, XC-MISC GetXIDRange asks the
//! server for ids that were freed. The top id of a range is never issued.

use crate::connection::Connection;
use crate::error::{Result, XwireError};
use crate::protocol::{requests, Response, XidRange};

/// Allocator state, guarded by its own lock on the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct XidState {
    base: u32,
    inc: u32,
    last: u32,
    max: u32,
}

impl XidState {
    pub fn new(base: u32, mask: u32) -> Self {
        Self {
            base,
            inc: mask & mask.wrapping_neg(),
            last: 0,
            max: mask,
        }
    }

    /// Next id from the current range, if any is left.
    pub fn take(&mut self) -> Option<u32> {
        if self.inc == 0 || self.last >= self.max {
            return None;
        }
        Some(self.advance())
    }

    fn advance(&mut self) -> u32 {
        let id = self.last | self.base;
        self.last = self.last.saturating_add(self.inc);
        id
    }

    /// Switch to a range from the server and return its first id.
    pub fn refill(&mut self, range: XidRange) -> Option<u32> {
        if range.count == 0 || self.inc == 0 {
            return None;
        }
        let span = u64::from(range.count - 1) * u64::from(self.inc);
        let max = u64::from(range.start_id) + span;
        self.last = range.start_id;
        self.max = u32::try_from(max).unwrap_or(u32::MAX);
        Some(self.advance())
    }
}

impl Connection {
    /// Allocate a resource id for a new window, pixmap, or similar.
    pub fn generate_id(&self) -> Result<u32> {
        let mut xid = self.xid.lock();
        if let Some(id) = xid.take() {
            return Ok(id);
        }

        let present = self
            .extension_data(&crate::ext::XC_MISC)?
            .map_or(false, |data| data.present);
        if !present {
            return Err(XwireError::XidExhausted);
        }

        let (mut fixed, info) = requests::xc_misc_get_xid_range();
        let request = self.send_request(0, &info, &mut fixed, &[])?;
        let range = match self.wait_for_reply(request)? {
            Some(Response::Reply(reply)) => XidRange::parse(&reply)?,
            _ => return Err(XwireError::XidExhausted),
        };
        tracing::debug!(
            "XID range refilled: start {:#x}, count {}",
            range.start_id,
            range.count
        );
        xid.refill(range).ok_or(XwireError::XidExhausted)
    }
}
