//! Wire-level protocol definitions.
//!
//! Everything a host needs in order to talk to this bootloader is pinned
//! here: acknowledgement bytes, command identifiers, frame bounds and the
//! CRC32 parameters. All multi-byte integers on the wire are little-endian.

use crc::{Crc, CRC_32_ISO_HDLC};

/// Sent once a frame's CRC32 trailer checks out, before any response body.
pub const UART_ACK: u8 = 0x79;

/// Sent when a frame's CRC32 trailer does not match; nothing else follows.
pub const UART_NACK: u8 = 0x1F;

/// Frame integrity code: CRC32 (ISO-HDLC parameters) over
/// `command_id || payload`, transmitted little-endian after the payload.
pub const FRAME_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Value of erased flash; also pads the final partial programming chunk.
pub const ERASED_BYTE: u8 = 0xFF;

/// Erase-command sector count requesting a mass erase (no indices follow).
pub const MASS_ERASE_MARKER: u8 = 0xFF;

/// Largest payload any command carries: MEMORY WRITE with a full 255-byte
/// data block (4 address bytes + 1 length byte + 255 data bytes).
pub const MAX_PAYLOAD: usize = 4 + 1 + 255;

/// Upper bound on a single flash-engine read request.
pub const MAX_READ_CHUNK: usize = 256;

/// Protocol version reported by GET VERSION, major.minor packed in one byte.
pub const PROTOCOL_VERSION: u8 = 0x10;

/// The closed set of commands this bootloader answers.
///
/// The dispatcher matches on this exhaustively; adding a command means adding
/// a variant and letting the compiler point at every site that must learn
/// about it.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// List the supported command ids.
    Get = 0x00,

    /// Bootloader version triple plus the protocol version byte.
    GetVersion = 0x01,

    /// Fixed descriptive text summarising the command set.
    GetHelp = 0x02,

    /// Chip identifier read from the device at boot.
    GetChipId = 0x03,

    /// Current read-protection level.
    GetProtectionStatus = 0x04,

    /// Validate a vector-table address and hand control to the application.
    Go = 0x05,

    /// Erase a list of flash sectors, or everything with the 0xFF marker.
    Erase = 0x06,

    /// Program a block of bytes at a flash address.
    Write = 0x07,

    /// Enable read-protection level 1. Takes effect after the pending reset.
    EnableProtection = 0x08,

    /// Remove read protection. Mass-erases application flash as a hardware
    /// side effect, then resets.
    DisableProtection = 0x09,
}

impl Command {
    /// Every command, in the order GET reports them.
    pub const ALL: [Command; 10] = [
        Command::Get,
        Command::GetVersion,
        Command::GetHelp,
        Command::GetChipId,
        Command::GetProtectionStatus,
        Command::Go,
        Command::Erase,
        Command::Write,
        Command::EnableProtection,
        Command::DisableProtection,
    ];

    pub fn from_id(id: u8) -> Option<Command> {
        match id {
            0x00 => Some(Command::Get),
            0x01 => Some(Command::GetVersion),
            0x02 => Some(Command::GetHelp),
            0x03 => Some(Command::GetChipId),
            0x04 => Some(Command::GetProtectionStatus),
            0x05 => Some(Command::Go),
            0x06 => Some(Command::Erase),
            0x07 => Some(Command::Write),
            0x08 => Some(Command::EnableProtection),
            0x09 => Some(Command::DisableProtection),
            _ => None,
        }
    }

    pub fn id(self) -> u8 {
        self as u8
    }
}

/// Command-level status byte, sent after the integrity ACK.
///
/// Distinct from ACK/NACK: a frame can be acknowledged (integrity fine) and
/// still report a failure here.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    /// Operation completed.
    Success = 0x00,
    /// Integrity was fine but the command id is not one of ours.
    UnknownCommand = 0x01,
    /// Address range falls outside device flash.
    AddressOutOfBounds = 0x02,
    /// Address range overlaps the bootloader's resident region.
    OverlapsBootloader = 0x03,
    /// Write address not aligned to the programming granularity.
    Misaligned = 0x04,
    /// Sector index outside the device sector range.
    SectorOutOfRange = 0x05,
    /// Zero or over-long length field.
    LengthInvalid = 0x06,
    /// The flash or option-byte hardware reported a failure.
    HardwareFault = 0x07,
    /// Protection already in the requested state; nothing was done.
    AlreadyInState = 0x08,
    /// Jump target does not hold a plausible stack-pointer/entry pair.
    InvalidVector = 0x09,
    /// Accepted; the change takes effect after the scheduled reset.
    ResetPending = 0x0A,
    /// Permanent protection can never be changed by this system.
    ProtectionLocked = 0x0B,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_ids_round_trip() {
        for cmd in &Command::ALL {
            assert_eq!(Command::from_id(cmd.id()), Some(*cmd));
        }
    }

    #[test]
    fn command_list_is_dense_and_ordered() {
        for (i, cmd) in Command::ALL.iter().enumerate() {
            assert_eq!(cmd.id(), i as u8);
        }
        assert!(Command::from_id(0x0A).is_none());
    }

    #[test]
    fn frame_crc_uses_documented_parameters() {
        // ISO-HDLC CRC32 of "123456789" is the classic check value.
        assert_eq!(FRAME_CRC.checksum(b"123456789"), 0xCBF4_3926);
    }
}
