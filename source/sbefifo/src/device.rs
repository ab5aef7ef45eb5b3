//! The device: attach, shared state and teardown.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn, Level};

use crate::{
    buf::Rings,
    client::{Client, Mode},
    error::Error,
    poller::{Alarm, Poller},
    regs::{Bank, Reg, RegisterBackend, RESET_REQUEST},
    settings::SbefifoSettings,
    xfr::{ClientId, Transfers},
};

static NEXT_INDEX: AtomicUsize = AtomicUsize::new(1);

/// Everything guarded by the device lock.
pub(crate) struct State {
    /// Set once, never cleared.
    pub(crate) fatal: Option<Error>,
    pub(crate) xfrs: Transfers,
    /// A FIFO reset is in flight and must complete by this deadline before
    /// the next transfer may start.
    pub(crate) reset_deadline: Option<Instant>,
}

impl State {
    pub(crate) fn check(&self) -> Result<(), Error> {
        match &self.fatal {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

pub(crate) struct Shared {
    pub(crate) state: Mutex<State>,
    /// Blocked clients park here, and are woken whenever the poller makes
    /// progress.
    pub(crate) wait: Condvar,
    pub(crate) alarm: Alarm,
    /// Mirrors `state.fatal.is_some()` for lock-free readiness checks.
    pub(crate) failed: AtomicBool,
    pub(crate) settings: SbefifoSettings,
    pub(crate) name: String,
    index: usize,
    next_client: AtomicU64,
}

impl Shared {
    /// Latches a fatal error: every queued transfer is thrown away and all
    /// waiters are woken to observe it. The first error sticks.
    pub(crate) fn latch(&self, state: &mut State, err: Error) {
        if state.fatal.is_none() {
            state.fatal = Some(err);
        }
        state.xfrs.clear();
        state.reset_deadline = None;
        self.failed.store(true, Ordering::Release);
        self.wait.notify_all();
    }
}

/// One attached SBEFIFO.
///
/// Dropping the `Device` tears it down: outstanding and future calls on its
/// clients fail with [`Error::Removed`], and the poller stops.
pub struct Device {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl Device {
    /// Attaches to an SBEFIFO without starting a poller thread.
    ///
    /// If either FIFO holds leftovers from a previous owner, a reset is
    /// requested first. The returned [`Poller`] must be driven by the caller,
    /// either by calling [`Poller::tick`] or by handing it to a thread that
    /// calls [`Poller::run`].
    #[tracing::instrument(
        name = "Device::attach",
        level = Level::DEBUG,
        skip(backend),
        err(Display),
    )]
    pub fn attach<B: RegisterBackend>(
        mut backend: B,
        settings: SbefifoSettings,
    ) -> Result<(Self, Poller<B>), Error> {
        let up = backend.status(Bank::Up)?;
        let down = backend.status(Bank::Down)?;
        if !up.is_empty() || !down.is_empty() {
            warn!(?up, ?down, "fifos not empty, requesting reset");
            request_reset(&mut backend, &settings)?;
        }

        let index = NEXT_INDEX.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                fatal: None,
                xfrs: Transfers::default(),
                reset_deadline: None,
            }),
            wait: Condvar::new(),
            alarm: Alarm::new(),
            failed: AtomicBool::new(false),
            settings,
            name: format!("sbefifo{index}"),
            index,
            next_client: AtomicU64::new(0),
        });
        info!(dev = %shared.name, "attached");

        let poller = Poller::new(shared.clone(), backend);
        Ok((
            Self {
                shared,
                worker: None,
            },
            poller,
        ))
    }

    /// Attaches to an SBEFIFO and starts a poller thread for it.
    pub fn spawn<B>(backend: B, settings: SbefifoSettings) -> Result<Self, Error>
    where
        B: RegisterBackend + 'static,
    {
        let (mut dev, poller) = Self::attach(backend, settings)?;
        let worker = thread::Builder::new()
            .name(dev.shared.name.clone())
            .spawn(move || poller.run())
            .map_err(|err| Error::Spawn(err.to_string()))?;
        dev.worker = Some(worker);
        Ok(dev)
    }

    /// Opens a new client session.
    pub fn open(&self, mode: Mode) -> Result<Client, Error> {
        let mut state = self.shared.state.lock();
        state.check()?;
        let id = ClientId(self.shared.next_client.fetch_add(1, Ordering::Relaxed));
        state.xfrs.register_client(id);
        debug!(dev = %self.shared.name, client = id.0, ?mode, "open");
        Ok(Client::new(
            self.shared.clone(),
            id,
            Arc::new(Rings::default()),
            mode,
        ))
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn index(&self) -> usize {
        self.shared.index
    }

    pub fn settings(&self) -> &SbefifoSettings {
        &self.shared.settings
    }

    /// The error that disabled this device, if any.
    pub fn fatal_error(&self) -> Option<Error> {
        self.shared.state.lock().fatal.clone()
    }

    /// Transfers waiting for, or receiving, service.
    pub fn queued_transfers(&self) -> usize {
        self.shared.state.lock().xfrs.queued()
    }

    /// Tears the device down. Idempotent.
    pub fn remove(&mut self) {
        {
            let mut state = self.shared.state.lock();
            if state.fatal.is_none() {
                info!(dev = %self.shared.name, "removing");
            }
            self.shared.latch(&mut state, Error::Removed);
        }
        self.shared.alarm.stop();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!(dev = %self.shared.name, "poller thread panicked");
            }
        }
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.remove();
    }
}

/// Requests a FIFO reset and waits, bounded, for it to complete.
fn request_reset<B: RegisterBackend>(
    backend: &mut B,
    settings: &SbefifoSettings,
) -> Result<(), Error> {
    backend.write_word(Bank::Up.reg(Reg::ReqReset), RESET_REQUEST)?;
    let start = Instant::now();
    loop {
        if !backend.status(Bank::Up)?.reset_pending() {
            debug!(elapsed = ?start.elapsed(), "reset complete");
            return Ok(());
        }
        if start.elapsed() >= settings.reset_timeout() {
            return Err(Error::ResetTimeout);
        }
        thread::sleep(settings.reset_poll());
    }
}
