//! Error types
//!
//! Two layers: [`BusError`] is whatever the register backend reports for a
//! failed access, and [`Error`] is what clients of the transport see.

/// A failed register access on the bus that reaches the SBEFIFO.
///
/// The variants mirror the error responses a serial FSI master can observe.
/// The transport never retries any of them: the first `BusError` disables the
/// device for good.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum BusError {
    /// The slave stayed busy for longer than the master was willing to wait.
    #[error("slave stuck in busy state")]
    Busy,
    /// The slave answered with a generic error response.
    #[error("slave returned an error response")]
    ErrorResponse,
    /// The slave reported a CRC error on the command it received.
    #[error("slave reported a master CRC error")]
    SlaveCrc,
    /// The master saw no response at all.
    #[error("master timed out waiting for a response")]
    MasterTimeout,
    /// The master computed a bad CRC over the slave's response.
    #[error("master detected a slave CRC error")]
    MasterCrc,
    /// Any other backend failure.
    #[error("backend failure: {0}")]
    Backend(String),
}

/// Errors returned by [`Client`](crate::Client) and [`Device`](crate::Device)
/// operations.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum Error {
    /// A buffer length was not a whole number of 4-byte words.
    #[error("length {0} is not a multiple of the 4-byte word size")]
    Unaligned(usize),
    /// A non-blocking call could not make progress right now.
    #[error("operation would block")]
    WouldBlock,
    /// The device accepted a request but never produced response data.
    #[error("timed out waiting for response data")]
    Timeout,
    /// A register access failed. Latched: the device is unusable afterwards.
    #[error("fatal bus access failure: {0}")]
    Bus(#[from] BusError),
    /// The device has been torn down.
    #[error("device removed")]
    Removed,
    /// A FIFO reset request did not complete in time.
    #[error("fifo reset did not complete")]
    ResetTimeout,
    /// The poller thread could not be started.
    #[error("failed to start the poller thread: {0}")]
    Spawn(String),
    /// Internal bookkeeping ended up somewhere it never should.
    #[error("transfer protocol error: {0}")]
    Protocol(&'static str),
}

impl Error {
    /// Returns `true` for errors that are latched on the device and shut it
    /// down permanently.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Bus(_) | Error::Removed | Error::ResetTimeout)
    }
}
