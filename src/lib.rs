//! STM32-class serial bootloader, device side.
//!
//! A second-stage bootloader command core in the AN3155 family: one command
//! frame at a time over a UART, a CRC32 integrity trailer, an ACK/NACK byte,
//! then a command-specific response. The crate owns the protocol state
//! machine and the flash-safety logic; everything that touches hardware
//! (byte transport, flash programming, option bytes, chip id) sits behind
//! the traits below, so the whole pipeline runs against in-memory fakes on a
//! host. See [`ram::RamDevice`] and the `util` feature's simulator binary.

use core::fmt::Debug;

#[macro_use]
extern crate log;

#[macro_use(block)]
extern crate nb;

extern crate embedded_hal;
use embedded_hal::serial::{Read, Write};

pub mod bootloader;
pub mod flash;
pub mod info;
pub mod launcher;
pub mod memory_map;
pub mod protection;
pub mod protocol;
pub mod ram;

#[cfg(feature = "linux")]
extern crate linux_embedded_hal;

#[cfg(feature = "linux")]
pub mod linux;

pub use crate::bootloader::{Bootloader, Exit, Poll};
pub use crate::info::BootContext;
pub use crate::launcher::Handoff;
pub use crate::memory_map::{MemoryMap, Region};
pub use crate::protection::RdpLevel;

/// Serial transport the command loop runs over.
pub trait SerialPort<E>: Write<u8, Error = E> + Read<u8, Error = E> {}

impl<T, E> SerialPort<E> for T where T: Write<u8, Error = E> + Read<u8, Error = E> {}

/// Register-level flash programming primitive.
///
/// The core validates every request before calling in here, so
/// implementations may assume ranges are in bounds; they still report their
/// own hardware failures, which the core surfaces without retrying.
pub trait Flash {
    type Error: Debug;

    /// Erase one sector.
    fn erase_sector(&mut self, sector: u8) -> Result<(), Self::Error>;

    /// Erase every application sector. The bootloader's resident region is
    /// write-protected in hardware and survives.
    fn mass_erase(&mut self) -> Result<(), Self::Error>;

    /// Program `data` at `address`. The length is a multiple of the
    /// programming granularity.
    fn program(&mut self, address: u32, data: &[u8]) -> Result<(), Self::Error>;

    /// Copy `buf.len()` bytes of flash starting at `address` into `buf`.
    fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<(), Self::Error>;
}

/// Non-volatile option-byte store holding the read-protection level.
pub trait OptionBytes {
    type Error: Debug;

    fn read_protection(&self) -> RdpLevel;

    /// Persist a new protection level; it takes effect after the next reset.
    /// Regressing from level 1 to none mass-erases application flash as a
    /// hardware side effect.
    fn write_protection(&mut self, level: RdpLevel) -> Result<(), Self::Error>;

    /// Request a system reset. Called only after the current response has
    /// been flushed; on hardware this does not return.
    fn trigger_reset(&mut self);
}

/// Chip identifier source.
pub trait DeviceId {
    /// Fill `buf` with the identifier, returning its length.
    fn read_id(&mut self, buf: &mut [u8]) -> usize;
}

/// Fatal command-loop errors. Command-level failures are responses, not
/// errors; only the transport itself can take the loop down.
#[derive(Clone, PartialEq, Debug)]
pub enum Error<SerialError> {
    Serial(SerialError),
}

impl<SerialError> From<SerialError> for Error<SerialError> {
    fn from(e: SerialError) -> Self {
        Self::Serial(e)
    }
}

/// Command-loop tuning.
#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(structopt::StructOpt))]
pub struct Options {
    /// Timeout for each in-frame byte; expiry abandons the frame
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "500"))]
    pub byte_timeout_ms: u32,

    /// Period to poll the transport for received bytes
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "1"))]
    pub poll_delay_ms: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self { byte_timeout_ms: 500, poll_delay_ms: 1 }
    }
}
