//! Client sessions
//!
//! A [`Client`] is one open session on a device. Each `write` submits one
//! request, which goes out to the SBE framed by a single end-of-transfer, and
//! subsequent `read`s return that request's response in order.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::{
    buf::{check_aligned, Rings},
    device::Shared,
    error::Error,
    xfr::{ClientId, XfrState},
};

/// How a client's calls behave when they cannot complete right away.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum Mode {
    /// Park the calling thread until the poller makes progress.
    #[default]
    Blocking,
    /// Fail with [`Error::WouldBlock`] instead of parking.
    NonBlocking,
}

mycelium_bitfield::bitfield! {
    /// A snapshot of what a client could do without blocking.
    #[derive(Eq, PartialEq)]
    pub struct Readiness<u8> {
        /// Response data is waiting in the read ring.
        pub const READABLE: bool;
        /// The write ring has room for at least one word.
        pub const WRITABLE: bool;
        /// The device is dead.
        pub const ERROR: bool;
    }
}

impl Readiness {
    pub fn is_readable(self) -> bool {
        self.get(Self::READABLE)
    }

    pub fn is_writable(self) -> bool {
        self.get(Self::WRITABLE)
    }

    pub fn is_error(self) -> bool {
        self.get(Self::ERROR)
    }
}

/// One open session on a [`Device`](crate::Device).
///
/// Dropping a client closes it. If one of its transfers is still at the
/// device, the poller finishes that round trip on its own and throws the
/// response away.
pub struct Client {
    shared: Arc<Shared>,
    id: ClientId,
    rings: Arc<Rings>,
    mode: Mode,
}

impl Client {
    pub(crate) fn new(shared: Arc<Shared>, id: ClientId, rings: Arc<Rings>, mode: Mode) -> Self {
        Self {
            shared,
            id,
            rings,
            mode,
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
    }

    /// Submits `data` as one request.
    ///
    /// The length must be a whole number of words. All of `data` is taken
    /// before this returns `Ok`; the end-of-transfer is raised once the last
    /// word reached the device. The response to a previous request must have
    /// been read out before a new request is queued.
    ///
    /// In [`Mode::NonBlocking`], this fails with [`Error::WouldBlock`] if the
    /// previous response is still unread, or if another client's transfer is
    /// being serviced and `data` does not fit in the write ring. Otherwise it
    /// waits for room like a blocking write, since its transfer is the one
    /// at the device.
    pub fn write(&self, data: &[u8]) -> Result<usize, Error> {
        check_aligned(data.len())?;
        if data.is_empty() {
            return Ok(0);
        }
        let shared = &*self.shared;
        let nonblocking = self.mode == Mode::NonBlocking;
        let mut state = shared.state.lock();
        state.check()?;

        if nonblocking {
            let busy = state.xfrs.head_client().map_or(false, |c| c != self.id);
            if busy && self.rings.wbuf.writable_bytes() < data.len() {
                return Err(Error::WouldBlock);
            }
        }

        while state.xfrs.oldest(self.id).is_some() {
            if nonblocking {
                return Err(Error::WouldBlock);
            }
            shared.wait.wait(&mut state);
            state.check()?;
        }

        let id = state.xfrs.enqueue(self.id, self.rings.clone());
        trace!(client = self.id.0, xfr = ?id, len = data.len(), "write queued");

        // The ring starts out empty, so a non-blocking write that does not
        // fit in one go belongs to the transfer being serviced.
        let mut written = 0;
        while written < data.len() {
            while self.rings.wbuf.writable_words() == 0 {
                shared.wait.wait(&mut state);
                // a dead device has already dropped the transfer
                state.check()?;
            }

            written += self.rings.wbuf.fill_from(&data[written..])?;
            if written == data.len() {
                state.xfrs.finish_write(id);
            }
            shared.alarm.kick();
        }
        Ok(written)
    }

    /// Reads response data.
    ///
    /// Blocks until response words arrive or the current request finished.
    /// The read that empties the ring after the response is complete retires
    /// the request, so a response with no words at all reads as `Ok(0)`.
    /// Fails with [`Error::Timeout`] if the device never answered.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, Error> {
        check_aligned(buf.len())?;
        let shared = &*self.shared;
        let nonblocking = self.mode == Mode::NonBlocking;
        let mut state = shared.state.lock();
        state.check()?;

        let responding = state
            .xfrs
            .oldest_state(self.id)
            .map_or(false, |s| s.has_response());
        if nonblocking && !responding {
            return Err(Error::WouldBlock);
        }

        loop {
            state.check()?;
            let finished = state
                .xfrs
                .oldest_state(self.id)
                .map_or(false, |s| s.is_finished());
            if finished || !self.rings.rbuf.is_empty() {
                break;
            }
            if nonblocking {
                return Err(Error::WouldBlock);
            }
            shared.wait.wait(&mut state);
        }

        let Some(id) = state.xfrs.oldest(self.id) else {
            return Err(Error::Protocol("response data without a transfer"));
        };
        let (n, empty) = self.rings.rbuf.drain_into(buf)?;
        match state.xfrs.get(id).map(|xfr| xfr.state) {
            Some(XfrState::Complete) if empty => {
                state.xfrs.consume(id);
                shared.wait.notify_all();
            }
            Some(XfrState::TimedOut) if empty && n == 0 => {
                state.xfrs.consume(id);
                shared.wait.notify_all();
                return Err(Error::Timeout);
            }
            Some(xfr_state) if !xfr_state.is_finished() && n > 0 => {
                // room to refill
                shared.alarm.kick();
            }
            _ => {}
        }
        Ok(n)
    }

    /// Lock-free snapshot of this client's readiness.
    pub fn readiness(&self) -> Readiness {
        Readiness::new()
            .with(Readiness::READABLE, !self.rings.rbuf.is_empty())
            .with(Readiness::WRITABLE, !self.rings.wbuf.is_full())
            .with(Readiness::ERROR, self.shared.failed.load(Ordering::Acquire))
    }

    /// Closes the session, reporting the device's latched error, if any.
    pub fn close(self) -> Result<(), Error> {
        let fatal = self.shared.state.lock().fatal.clone();
        drop(self);
        match fatal {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn release(&mut self) {
        let mut state = self.shared.state.lock();
        let pending = state.xfrs.release_client(self.id);
        debug!(dev = %self.shared.name, client = self.id.0, pending, "close");
        if pending {
            self.shared.alarm.kick();
        }
        self.shared.wait.notify_all();
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.release();
    }
}
