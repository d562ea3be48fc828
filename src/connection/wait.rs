//! Readiness wait and I/O duty arbitration.
//!
//! Only one thread at a time blocks in the readiness syscall for a given
//! direction. That thread holds the duty: it polls with the lock released,
//! then reads and writes for everyone with the lock held again. Every other
//! thread waits on its own condition variable and re-checks its completion
//! condition when woken.
//!
//! ```text
//!  lock ─► duty busy? ──yes──► cond.wait ─► return (caller re-checks)
//!              │
//!              no
//!              ▼
//!         claim duty ─► unlock ─► poll(POLLIN [| POLLOUT]) ─► lock
//!                                                              │
//!              release duty ◄─ write batch ◄─ read packets ◄───┘
//! ```

use parking_lot::{Condvar, MutexGuard};

use super::{Connection, IoState};
use crate::error::{Result, ShutdownReason, XwireError};
use crate::output::{write_batch, WriteBatch};
use crate::protocol::sequence::wrapping_le;

/// Who currently owns the socket directions.
///
/// `reading` counts threads blocked in the readiness wait with read
/// interest: a writer always polls for input too, so a reader and a writer
/// can hold it at the same time.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DutyToken {
    pub reading: usize,
    pub writing: bool,
}

impl IoState {
    /// Fail if the connection has been shut down.
    #[inline]
    pub(crate) fn check(&self) -> Result<()> {
        match self.shutdown {
            Some(reason) => Err(XwireError::ConnectionShutdown(reason)),
            None => Ok(()),
        }
    }

    fn watermarks_in_order(&self) -> bool {
        let ordered = wrapping_le(self.out.request_written, self.out.request)
            && wrapping_le(self.input.request_read, self.out.request);
        // While a batch is in flight the server may answer requests whose
        // bytes went out before `request_written` catches up.
        ordered && (self.duty.writing || wrapping_le(self.input.request_read, self.out.request_written))
    }
}

impl Connection {
    /// Wait for I/O progress on behalf of the caller.
    ///
    /// If the needed duty is taken, waits on `cond` and returns. Otherwise
    /// claims it, blocks in the readiness wait with the lock released, then
    /// reads whatever arrived and writes as much of `batch` as the socket
    /// takes. Transport failures shut the connection down.
    pub(crate) fn conn_wait(
        &self,
        guard: &mut MutexGuard<'_, IoState>,
        cond: &Condvar,
        batch: Option<&mut WriteBatch<'_>>,
    ) -> Result<()> {
        guard.check()?;
        debug_assert!(guard.watermarks_in_order(), "sequence watermarks out of order");

        let want_write = batch.is_some();
        let busy = if want_write {
            guard.duty.writing
        } else {
            guard.duty.reading > 0
        };
        if busy {
            cond.wait(guard);
            return Ok(());
        }

        guard.duty.reading += 1;
        if want_write {
            guard.duty.writing = true;
        }

        let ready = MutexGuard::unlocked(guard, || self.stream.poll_ready(true, want_write));

        let result = match ready {
            Ok(ready) => {
                let mut result = Ok(());
                if ready.readable {
                    result = guard.input.read_from(&self.stream, &self.event_cond);
                }
                if result.is_ok() && ready.writable {
                    if let Some(batch) = batch {
                        if let Err(e) = write_batch(&self.stream, batch) {
                            tracing::error!("Socket write failed: {}", e);
                            result = Err(ShutdownReason::SocketError);
                        }
                    }
                }
                result
            }
            Err(e) => {
                tracing::error!("Readiness wait failed: {}", e);
                Err(ShutdownReason::SocketError)
            }
        };

        if want_write {
            guard.duty.writing = false;
        }
        guard.duty.reading -= 1;

        result.map_err(|reason| self.shutdown(guard, reason))
    }

    /// Non-blocking read under the lock, for callers that found no duty
    /// holder.
    pub(crate) fn read_available(&self, guard: &mut IoState) -> Result<()> {
        guard
            .input
            .read_from(&self.stream, &self.event_cond)
            .map_err(|reason| self.shutdown(guard, reason))
    }

    /// Wait until no other thread is writing.
    pub(crate) fn wait_for_writer(&self, guard: &mut MutexGuard<'_, IoState>) -> Result<()> {
        loop {
            guard.check()?;
            if !guard.duty.writing {
                return Ok(());
            }
            self.out_cond.wait(guard);
        }
    }

    /// Record `reason` (first failure wins) and wake every blocked thread.
    pub(crate) fn shutdown(&self, guard: &mut IoState, reason: ShutdownReason) -> XwireError {
        if guard.shutdown.is_none() {
            tracing::error!("Connection shut down: {}", reason);
            guard.shutdown = Some(reason);
        }
        self.event_cond.notify_all();
        self.out_cond.notify_all();
        guard.input.notify_all_readers();
        XwireError::ConnectionShutdown(guard.shutdown.unwrap_or(reason))
    }
}
