//! # SBEFIFO transport
//!
//! The SBEFIFO is a narrow pipe to the self boot engine (SBE): two banks of
//! 32-bit registers, one per direction, each fronting an eight-entry hardware
//! FIFO. It never raises an interrupt. Everything the host learns about it,
//! it learns by reading a status register.
//!
//! This crate turns that pipe into a character-stream transport shared by any
//! number of clients.
//!
//! ## Transfers
//!
//! Every [`Client::write`] submits one request. The request is queued as a
//! *transfer* on a single device-wide queue, and transfers are serviced
//! strictly in the order they were submitted. Only the transfer at the head
//! of the queue talks to the device: its words are pushed upstream, an
//! end-of-transfer (EOT) is raised once the writer is done, and response
//! words are pulled downstream until the SBE's own EOT marker shows up.
//! [`Client::read`] hands the response to the caller.
//!
//! ## The poller
//!
//! All register traffic happens in [`Poller::tick`]. A tick does a bounded
//! amount of work and then either goes idle until a client kicks it, or asks
//! to be run again after a delay when the device had no room or no data.
//! [`Device::spawn`] runs the poller on its own thread; [`Device::attach`]
//! hands it to the caller instead, which is how the tests drive it one tick
//! at a time.
//!
//! ## Failure
//!
//! Any failed register access disables the device for good: queued transfers
//! are dropped and every call on every client fails with the same error from
//! then on. A request that never gets an answer only fails its own read with
//! [`Error::Timeout`], after which the FIFOs are reset before the next
//! transfer starts. The Linux `fsi-sbefifo` driver disables the whole device
//! on a data timeout instead.

pub mod buf;
pub mod client;
pub mod device;
pub mod error;
pub mod poller;
pub mod regs;
pub mod settings;
pub mod sim;
mod xfr;

#[cfg(test)]
pub(crate) mod test_util;

pub use self::{
    buf::{FifoBuf, BUF_BYTES, BUF_WORDS},
    client::{Client, Mode, Readiness},
    device::Device,
    error::{BusError, Error},
    poller::{Poller, Tick},
    regs::{Bank, Reg, RegisterBackend, Status, EOT_MAGIC, FIFO_DEPTH, WORD_SIZE},
    settings::SbefifoSettings,
};
