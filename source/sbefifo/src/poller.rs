//! # The poller
//!
//! The SBEFIFO cannot interrupt us, so all progress is made by a poller that
//! looks at the device whenever a client kicks it or a reschedule deadline
//! passes. Each [`Poller::tick`] does a bounded amount of work against the
//! transfer at the head of the queue and then decides when it wants to run
//! again.
//!
//! Only the poller touches the register backend. It holds the device lock for
//! the whole tick, so a client never observes a transfer halfway between two
//! states.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info_span, trace, warn};

use crate::{
    buf::Rings,
    device::{Shared, State},
    error::Error,
    regs::{Bank, Reg, RegisterBackend, EOT_MAGIC, RESET_REQUEST, WORD_SIZE},
    xfr::XfrState,
};

/// What a tick left behind.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Tick {
    /// Nothing to do until a client kicks the poller.
    Idle,
    /// The device is not ready. Look again after this long.
    Reschedule(Duration),
    /// A transfer finished and the next one can start right away.
    Again,
}

////////////////////////////////////////////////////////////////////////////////
// Alarm
////////////////////////////////////////////////////////////////////////////////

/// A one-shot timer with at most one pending deadline.
pub(crate) struct Alarm {
    state: Mutex<AlarmState>,
    cond: Condvar,
}

struct AlarmState {
    deadline: Option<Instant>,
    stopped: bool,
}

impl Alarm {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(AlarmState {
                deadline: None,
                stopped: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Fire as soon as possible.
    pub(crate) fn kick(&self) {
        self.arm(Instant::now());
    }

    /// Fire at `at`, unless an earlier deadline is already pending.
    pub(crate) fn arm(&self, at: Instant) {
        let mut state = self.state.lock();
        state.deadline = Some(match state.deadline {
            Some(pending) => pending.min(at),
            None => at,
        });
        self.cond.notify_one();
    }

    pub(crate) fn stop(&self) {
        self.state.lock().stopped = true;
        self.cond.notify_all();
    }

    /// Blocks until the alarm fires. Returns `false` once stopped.
    pub(crate) fn wait(&self) -> bool {
        let mut state = self.state.lock();
        loop {
            if state.stopped {
                return false;
            }
            match state.deadline {
                Some(deadline) if deadline <= Instant::now() => {
                    state.deadline = None;
                    return true;
                }
                Some(deadline) => {
                    self.cond.wait_until(&mut state, deadline);
                }
                None => self.cond.wait(&mut state),
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn pending(&self) -> Option<Instant> {
        self.state.lock().deadline
    }
}

////////////////////////////////////////////////////////////////////////////////
// Poller
////////////////////////////////////////////////////////////////////////////////

/// Drives transfers through the device.
///
/// Obtained from [`Device::attach`](crate::Device::attach). Either call
/// [`tick`](Self::tick) by hand, or hand the poller to a thread running
/// [`run`](Self::run).
pub struct Poller<B> {
    shared: Arc<Shared>,
    backend: B,
}

impl<B: RegisterBackend> Poller<B> {
    pub(crate) fn new(shared: Arc<Shared>, backend: B) -> Self {
        Self { shared, backend }
    }

    /// Runs until the device is removed.
    pub fn run(mut self) {
        let span = info_span!("poller", dev = %self.shared.name);
        let _enter = span.enter();
        debug!("poller running");
        while self.shared.alarm.wait() {
            self.tick();
        }
        debug!("poller stopped");
    }

    /// Services the head of the queue once.
    ///
    /// The poller's alarm is armed according to the result, so a caller
    /// driving ticks by hand may use the return value to pace itself.
    pub fn tick(&mut self) -> Tick {
        let shared = self.shared.clone();
        let mut state = shared.state.lock();
        let mut progress = false;
        let tick = match self.service(&mut state, &mut progress) {
            Ok(tick) => tick,
            Err(err) => {
                error!(dev = %shared.name, %err, "device disabled");
                shared.latch(&mut state, err);
                return Tick::Idle;
            }
        };
        if progress {
            shared.wait.notify_all();
        }
        drop(state);

        match tick {
            Tick::Idle => {}
            Tick::Reschedule(delay) => shared.alarm.arm(Instant::now() + delay),
            Tick::Again => shared.alarm.kick(),
        }
        tick
    }

    fn service(&mut self, state: &mut State, progress: &mut bool) -> Result<Tick, Error> {
        let settings = self.shared.settings;
        if state.fatal.is_some() {
            return Ok(Tick::Idle);
        }

        // Nothing starts until an outstanding reset is done.
        if let Some(deadline) = state.reset_deadline {
            if self.backend.status(Bank::Up)?.reset_pending() {
                if Instant::now() >= deadline {
                    return Err(Error::ResetTimeout);
                }
                return Ok(Tick::Reschedule(settings.reset_poll()));
            }
            debug!("fifo reset complete");
            state.reset_deadline = None;
        }

        let Some(id) = state.xfrs.next_xfr() else {
            return Ok(Tick::Idle);
        };
        let xfr = state
            .xfrs
            .get_mut(id)
            .ok_or(Error::Protocol("queued transfer has no state"))?;

        if let XfrState::Queued { .. } = xfr.state {
            xfr.state.start();
            trace!(xfr = ?id, state = ?xfr.state, "transfer started");
            *progress = true;
        }

        if xfr.cancelled && !xfr.scratch {
            // The owner is gone. Whatever was staged is dropped, and the rest
            // of the round trip runs against rings nobody reads.
            xfr.rings.rbuf.reset();
            xfr.rings.wbuf.reset();
            xfr.rings = Arc::new(Rings::default());
            xfr.scratch = true;
            xfr.state.finish_write();
            trace!(xfr = ?id, "draining cancelled transfer");
        }

        // Write side.
        if let XfrState::WriteDraining | XfrState::WriteDone = xfr.state {
            while !xfr.rings.wbuf.is_empty() {
                let room = self.backend.status(Bank::Up)?.writable_words();
                if room == 0 {
                    return Ok(Tick::Reschedule(settings.poll_interval()));
                }
                let words = room.min(xfr.rings.wbuf.readable_words());
                for _ in 0..words {
                    let word = xfr
                        .rings
                        .wbuf
                        .front()
                        .ok_or(Error::Protocol("write ring emptied under the poller"))?;
                    self.backend.write_word(Bank::Up.reg(Reg::Fifo), word)?;
                    xfr.rings.wbuf.commit_read(WORD_SIZE)?;
                }
                trace!(xfr = ?id, words, "wrote upstream");
                *progress = true;
            }

            if xfr.state != XfrState::WriteDone {
                // the writer will kick us when it has more
                return Ok(Tick::Idle);
            }
            self.backend.write_word(Bank::Up.reg(Reg::EotRaise), EOT_MAGIC)?;
            xfr.state = XfrState::ResponsePending {
                wait_deadline: None,
            };
            debug!(xfr = ?id, "eot raised");
            *progress = true;
        }

        // Read side.
        let XfrState::ResponsePending { mut wait_deadline } = xfr.state else {
            return Ok(Tick::Idle);
        };
        loop {
            let room = xfr.rings.rbuf.writable_words();
            if room == 0 {
                // the reader will kick us once it has made room
                xfr.state = XfrState::ResponsePending { wait_deadline };
                return Ok(Tick::Idle);
            }

            let sts = self.backend.status(Bank::Down)?;
            let avail = sts.readable_words();
            if avail == 0 {
                let now = Instant::now();
                let deadline = *wait_deadline.get_or_insert(now + settings.max_data_wait());
                if now >= deadline {
                    warn!(
                        xfr = ?id,
                        wait = ?settings.max_data_wait(),
                        "no response data, resetting fifos"
                    );
                    xfr.state = XfrState::TimedOut;
                    state.xfrs.finish(id);
                    self.backend.write_word(Bank::Up.reg(Reg::ReqReset), RESET_REQUEST)?;
                    state.reset_deadline = Some(now + settings.reset_timeout());
                    *progress = true;
                    return Ok(Tick::Reschedule(settings.reset_poll()));
                }
                xfr.state = XfrState::ResponsePending { wait_deadline };
                let delay = settings.poll_interval().min(deadline - now);
                return Ok(Tick::Reschedule(delay));
            }
            wait_deadline = None;

            // Only swallow the marker once every word ahead of it has a home.
            let ack = sts.eot() && avail - 1 <= room;
            let words = if ack { avail - 1 } else { avail.min(room) };
            for _ in 0..words {
                let word = self.backend.read_word(Bank::Down.reg(Reg::Fifo))?;
                if !xfr.cancelled && !xfr.rings.rbuf.push(word) {
                    return Err(Error::Protocol("read ring overflowed"));
                }
            }
            trace!(xfr = ?id, words, "read downstream");
            *progress = true;

            if ack {
                let _marker = self.backend.read_word(Bank::Down.reg(Reg::Fifo))?;
                self.backend.write_word(Bank::Down.reg(Reg::EotAck), EOT_MAGIC)?;
                xfr.state = XfrState::Complete;
                debug!(xfr = ?id, cancelled = xfr.cancelled, "transfer complete");
                state.xfrs.finish(id);
                return Ok(if state.xfrs.next_xfr().is_some() {
                    Tick::Again
                } else {
                    Tick::Idle
                });
            }
        }
    }
}
