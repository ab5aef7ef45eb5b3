//! # A simulated SBE
//!
//! [`SimSbe`] models both FIFOs of an SBEFIFO and an SBE sitting behind them,
//! well enough to run the transport on a host without hardware. Handles are
//! cheap to clone and share one simulated device, so a test can keep one
//! handle for assertions while the poller owns another.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::{
    error::BusError,
    regs::{Bank, Reg, RegisterBackend, Status, FIFO_DEPTH},
};

/// Produces the response to one request. `None` means the SBE never answers.
pub type Responder = Box<dyn FnMut(&[u32]) -> Option<Vec<u32>> + Send>;

/// Register traffic counters.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct SimStats {
    /// Data words written to the upstream FIFO.
    pub words_up: usize,
    /// Words read from the downstream FIFO, markers included.
    pub words_down: usize,
    pub status_reads: usize,
    pub eot_raised: usize,
    pub eot_acked: usize,
    pub resets: usize,
}

#[derive(Clone)]
pub struct SimSbe {
    inner: Arc<Mutex<SimState>>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Reset {
    Idle,
    Pending { reads_left: usize },
    Stuck,
}

/// A downstream FIFO entry.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Entry {
    Data(u32),
    Eot,
}

struct SimState {
    up: VecDeque<u32>,
    /// Words the SBE has already taken from the upstream FIFO.
    request: Vec<u32>,
    down: VecDeque<Entry>,
    upstream_slots: usize,
    responding: bool,
    responder: Responder,
    reset: Reset,
    reset_latency: Option<usize>,
    requests: Vec<Vec<u32>>,
    fail_after: Option<(usize, BusError)>,
    failed: Option<BusError>,
    stats: SimStats,
}

impl SimSbe {
    /// A healthy SBE that echoes every request back.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(SimState {
                up: VecDeque::new(),
                request: Vec::new(),
                down: VecDeque::new(),
                upstream_slots: FIFO_DEPTH,
                responding: true,
                responder: Box::new(|req| Some(req.to_vec())),
                reset: Reset::Idle,
                reset_latency: Some(0),
                requests: Vec::new(),
                fail_after: None,
                failed: None,
                stats: SimStats::default(),
            })),
        }
    }

    /// Only `slots` upstream entries are free whenever the host looks.
    #[must_use]
    pub fn with_upstream_slots(self, slots: usize) -> Self {
        self.inner.lock().upstream_slots = slots.min(FIFO_DEPTH);
        self
    }

    #[must_use]
    pub fn with_responder(
        self,
        responder: impl FnMut(&[u32]) -> Option<Vec<u32>> + Send + 'static,
    ) -> Self {
        self.inner.lock().responder = Box::new(responder);
        self
    }

    /// An SBE that takes requests but never answers them.
    #[must_use]
    pub fn silent(self) -> Self {
        self.set_responding(false);
        self
    }

    /// A reset stays pending for this many upstream status reads.
    #[must_use]
    pub fn with_reset_latency(self, reads: usize) -> Self {
        self.inner.lock().reset_latency = Some(reads);
        self
    }

    /// A reset never completes.
    #[must_use]
    pub fn with_stuck_reset(self) -> Self {
        self.inner.lock().reset_latency = None;
        self
    }

    pub fn set_responding(&self, responding: bool) {
        self.inner.lock().responding = responding;
    }

    /// Leaves words in the downstream FIFO, as a previous owner might have.
    pub fn preload_downstream(&self, words: &[u32]) {
        let mut state = self.inner.lock();
        state.down.extend(words.iter().copied().map(Entry::Data));
    }

    /// After `accesses` more register accesses succeed, every access fails
    /// with `err`.
    pub fn fail_after(&self, accesses: usize, err: BusError) {
        self.inner.lock().fail_after = Some((accesses, err));
    }

    /// Every request the SBE has received, in order.
    pub fn requests(&self) -> Vec<Vec<u32>> {
        self.inner.lock().requests.clone()
    }

    pub fn stats(&self) -> SimStats {
        self.inner.lock().stats
    }

    pub fn upstream_len(&self) -> usize {
        self.inner.lock().up.len()
    }

    pub fn downstream_len(&self) -> usize {
        self.inner.lock().down.len()
    }
}

impl Default for SimSbe {
    fn default() -> Self {
        Self::new()
    }
}

impl SimState {
    fn access(&mut self) -> Result<(), BusError> {
        if let Some(err) = &self.failed {
            return Err(err.clone());
        }
        match self.fail_after.take() {
            Some((0, err)) => {
                debug!(%err, "simulated bus fault");
                self.failed = Some(err.clone());
                Err(err)
            }
            Some((n, err)) => {
                self.fail_after = Some((n - 1, err));
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn upstream_status(&mut self) -> Status {
        let busy = FIFO_DEPTH - self.upstream_slots;
        let entries = (self.up.len() + busy).min(FIFO_DEPTH);
        let reset_pending = match self.reset {
            Reset::Idle => false,
            Reset::Stuck => true,
            Reset::Pending { reads_left: 0 } => {
                self.reset = Reset::Idle;
                false
            }
            Reset::Pending { reads_left } => {
                self.reset = Reset::Pending {
                    reads_left: reads_left - 1,
                };
                true
            }
        };
        let sts = Status::new()
            .with(Status::ENTRIES, entries as u32)
            .with(Status::EMPTY, self.up.is_empty())
            .with(Status::RESET_REQUESTED, reset_pending);
        // the SBE drains the upstream FIFO between two looks by the host
        self.request.extend(self.up.drain(..));
        sts
    }

    fn downstream_status(&self) -> Status {
        let visible = self.down.len().min(FIFO_DEPTH);
        let eot = self
            .down
            .iter()
            .take(visible)
            .position(|entry| *entry == Entry::Eot)
            .map_or(0, |slot| 1u8 << slot);
        Status::new()
            .with(Status::ENTRIES, visible as u32)
            .with(Status::EOT_SLOTS, eot)
            .with(Status::EMPTY, self.down.is_empty())
    }

    fn raise_eot(&mut self) {
        self.stats.eot_raised += 1;
        self.request.extend(self.up.drain(..));
        let request = std::mem::take(&mut self.request);
        trace!(words = request.len(), "sim request");
        if self.responding {
            if let Some(response) = (self.responder)(&request) {
                self.down.extend(response.into_iter().map(Entry::Data));
                self.down.push_back(Entry::Eot);
            }
        }
        self.requests.push(request);
    }

    fn reset(&mut self) {
        debug!("sim fifo reset");
        self.stats.resets += 1;
        self.up.clear();
        self.request.clear();
        self.down.clear();
        self.reset = match self.reset_latency {
            Some(reads_left) => Reset::Pending { reads_left },
            None => Reset::Stuck,
        };
    }
}

impl RegisterBackend for SimSbe {
    fn read_word(&mut self, offset: u32) -> Result<u32, BusError> {
        let mut state = self.inner.lock();
        state.access()?;
        match Reg::decode(offset) {
            Some((Bank::Up, Reg::Status)) => {
                state.stats.status_reads += 1;
                Ok(state.upstream_status().bits())
            }
            Some((Bank::Down, Reg::Status)) => {
                state.stats.status_reads += 1;
                Ok(state.downstream_status().bits())
            }
            Some((Bank::Down, Reg::Fifo)) => match state.down.pop_front() {
                Some(entry) => {
                    state.stats.words_down += 1;
                    Ok(match entry {
                        Entry::Data(word) => word,
                        Entry::Eot => 0,
                    })
                }
                None => Err(BusError::Backend("read from empty downstream fifo".into())),
            },
            _ => Err(BusError::Backend(format!("read from {offset:#04x}"))),
        }
    }

    fn write_word(&mut self, offset: u32, value: u32) -> Result<(), BusError> {
        let mut state = self.inner.lock();
        state.access()?;
        match Reg::decode(offset) {
            Some((Bank::Up, Reg::Fifo)) => {
                let busy = FIFO_DEPTH - state.upstream_slots;
                if state.up.len() + busy >= FIFO_DEPTH {
                    return Err(BusError::Backend("upstream fifo overflow".into()));
                }
                state.up.push_back(value);
                state.stats.words_up += 1;
                Ok(())
            }
            Some((Bank::Up, Reg::EotRaise)) => {
                state.raise_eot();
                Ok(())
            }
            Some((Bank::Down, Reg::EotAck)) => {
                state.stats.eot_acked += 1;
                Ok(())
            }
            Some((_, Reg::ReqReset)) => {
                state.reset();
                Ok(())
            }
            _ => Err(BusError::Backend(format!("write to {offset:#04x}"))),
        }
    }
}
