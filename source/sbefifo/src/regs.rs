//! SBEFIFO register map
//!
//! The SBEFIFO exposes two identical register banks, one per direction. The
//! upstream bank carries requests from the host to the SBE, the downstream
//! bank carries responses back. Every register is one 32-bit word.

use crate::error::BusError;

/// Size of every register and of every FIFO entry, in bytes.
pub const WORD_SIZE: usize = 4;

/// Number of entries the hardware FIFO holds in each direction.
pub const FIFO_DEPTH: usize = 8;

/// The sentinel written to raise an end-of-transfer, and to acknowledge one.
pub const EOT_MAGIC: u32 = 0xffff_ffff;

/// Value written to [`Reg::ReqReset`] to request a FIFO reset.
pub const RESET_REQUEST: u32 = 1;

/// One direction of the pipe.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Bank {
    /// Host to SBE.
    Up,
    /// SBE to host.
    Down,
}

/// A register within a [`Bank`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Reg {
    Fifo,
    Status,
    EotRaise,
    ReqReset,
    EotAck,
}

impl Bank {
    pub const fn base(self) -> u32 {
        match self {
            Bank::Up => 0x00,
            Bank::Down => 0x40,
        }
    }

    /// Byte offset of `reg` in this bank.
    pub const fn reg(self, reg: Reg) -> u32 {
        self.base() | reg.offset()
    }
}

impl Reg {
    pub const fn offset(self) -> u32 {
        match self {
            Reg::Fifo => 0x00,
            Reg::Status => 0x04,
            Reg::EotRaise => 0x08,
            Reg::ReqReset => 0x0C,
            Reg::EotAck => 0x14,
        }
    }

    /// Splits a raw byte offset back into its bank and register.
    pub fn decode(offset: u32) -> Option<(Bank, Reg)> {
        let bank = match offset & !0x3f {
            0x00 => Bank::Up,
            0x40 => Bank::Down,
            _ => return None,
        };
        let reg = match offset & 0x3f {
            0x00 => Reg::Fifo,
            0x04 => Reg::Status,
            0x08 => Reg::EotRaise,
            0x0C => Reg::ReqReset,
            0x14 => Reg::EotAck,
            _ => return None,
        };
        Some((bank, reg))
    }
}

mycelium_bitfield::bitfield! {
    /// The per-bank status register.
    #[derive(Eq, PartialEq)]
    pub struct Status<u32> {
        /// One bit per visible FIFO entry that holds an end-of-transfer marker.
        pub const EOT_SLOTS: u8;

        const _RESERVED_0 = 8;

        /// Number of valid entries currently held in the FIFO.
        pub const ENTRIES = 4;

        /// The FIFO holds nothing at all.
        pub const EMPTY: bool;

        const _RESERVED_1 = 4;

        /// A reset was requested and has not completed yet.
        pub const RESET_REQUESTED: bool;
    }
}

impl Status {
    /// Words the host may read from a downstream FIFO right now, including a
    /// trailing EOT marker.
    pub fn readable_words(self) -> usize {
        self.get(Self::ENTRIES) as usize
    }

    /// Free slots the host may fill in an upstream FIFO right now.
    pub fn writable_words(self) -> usize {
        FIFO_DEPTH.saturating_sub(self.readable_words())
    }

    /// The end-of-transfer marker is among the visible entries.
    pub fn eot(self) -> bool {
        self.get(Self::EOT_SLOTS) != 0
    }

    pub fn is_empty(self) -> bool {
        self.get(Self::EMPTY)
    }

    pub fn reset_pending(self) -> bool {
        self.get(Self::RESET_REQUESTED)
    }
}

/// Word-sized register access to one SBEFIFO.
///
/// This is the only way the transport touches hardware. Implementations are
/// expected to be slow, and any error they return is treated as fatal.
///
/// Words read from or written to [`Reg::Fifo`] are passed through as-is;
/// every other register carries a host-order value.
pub trait RegisterBackend: Send {
    fn read_word(&mut self, offset: u32) -> Result<u32, BusError>;
    fn write_word(&mut self, offset: u32, value: u32) -> Result<(), BusError>;

    fn status(&mut self, bank: Bank) -> Result<Status, BusError> {
        self.read_word(bank.reg(Reg::Status)).map(Status::from_bits)
    }
}

impl<B: RegisterBackend + ?Sized> RegisterBackend for Box<B> {
    fn read_word(&mut self, offset: u32) -> Result<u32, BusError> {
        (**self).read_word(offset)
    }

    fn write_word(&mut self, offset: u32, value: u32) -> Result<(), BusError> {
        (**self).write_word(offset, value)
    }
}
