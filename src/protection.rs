//! Read-protection (RDP) state management.
//!
//! The protection level lives in non-volatile option bytes and only takes
//! effect after a reset, so both mutating operations report "accepted, reset
//! pending" rather than pretending the change is live.

use thiserror::Error;

use crate::OptionBytes;

/// Read-protection level as persisted in the option bytes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum RdpLevel {
    /// Flash readable by debug tooling.
    None = 0x00,
    /// External read access blocked; reversible through a mass erase.
    Level1 = 0x01,
    /// Irreversible lock. This system can report it but never set or clear
    /// it.
    Permanent = 0x02,
}

impl RdpLevel {
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ProtectionError {
    #[error("read protection is already enabled")]
    AlreadySet,
    #[error("read protection is already disabled")]
    AlreadyNone,
    #[error("permanent protection cannot be changed")]
    PermanentlyLocked,
    #[error("the option-byte write was rejected by the hardware")]
    OptionByteFault,
}

/// Borrows the option-byte store for the duration of one command.
pub struct ProtectionManager<'a, O> {
    options: &'a mut O,
}

impl<'a, O: OptionBytes> ProtectionManager<'a, O> {
    pub fn new(options: &'a mut O) -> Self {
        Self { options }
    }

    pub fn status(&self) -> RdpLevel {
        self.options.read_protection()
    }

    /// Persist level 1. The caller still owes the device a reset before the
    /// new level is live.
    pub fn enable_level1(&mut self) -> Result<(), ProtectionError> {
        match self.status() {
            RdpLevel::Level1 | RdpLevel::Permanent => Err(ProtectionError::AlreadySet),
            RdpLevel::None => {
                self.options.write_protection(RdpLevel::Level1).map_err(|e| {
                    error!("option-byte write fault: {:?}", e);
                    ProtectionError::OptionByteFault
                })?;
                info!("read protection level 1 set, reset pending");
                Ok(())
            }
        }
    }

    /// Regress to no protection. The hardware mass-erases application flash
    /// on the way, which is why the idempotent case must not reach the
    /// option bytes at all.
    pub fn disable(&mut self) -> Result<(), ProtectionError> {
        match self.status() {
            RdpLevel::None => Err(ProtectionError::AlreadyNone),
            RdpLevel::Permanent => Err(ProtectionError::PermanentlyLocked),
            RdpLevel::Level1 => {
                warn!("removing read protection; application flash will be mass-erased");
                self.options.write_protection(RdpLevel::None).map_err(|e| {
                    error!("option-byte write fault: {:?}", e);
                    ProtectionError::OptionByteFault
                })?;
                info!("read protection removed, reset pending");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_map::{MemoryMap, Region};
    use crate::ram::RamDevice;

    fn device() -> RamDevice {
        let map = MemoryMap::new(
            Region::new(0x0800_0000, 0x0802_0000),
            Region::new(0x0800_0000, 0x0800_4000),
            Region::new(0x2000_0000, 0x2000_8000),
            0x800,
            8,
        );
        RamDevice::new(map, &[0x04, 0x60])
    }

    #[test]
    fn enable_then_disable_walks_the_allowed_transitions() {
        let mut device = device();
        assert_eq!(ProtectionManager::new(&mut device).enable_level1(), Ok(()));
        assert_eq!(ProtectionManager::new(&mut device).status(), RdpLevel::Level1);
        assert_eq!(ProtectionManager::new(&mut device).disable(), Ok(()));
        assert_eq!(ProtectionManager::new(&mut device).status(), RdpLevel::None);
    }

    #[test]
    fn disable_when_already_none_is_a_distinct_no_op() {
        let mut device = device();
        assert_eq!(
            ProtectionManager::new(&mut device).disable(),
            Err(ProtectionError::AlreadyNone)
        );
        // No mass erase happened: the option bytes were never touched.
        assert_eq!(device.mass_erase_count, 0);
    }

    #[test]
    fn permanent_level_is_terminal() {
        let mut device = device().with_protection(RdpLevel::Permanent);
        assert_eq!(
            ProtectionManager::new(&mut device).enable_level1(),
            Err(ProtectionError::AlreadySet)
        );
        assert_eq!(
            ProtectionManager::new(&mut device).disable(),
            Err(ProtectionError::PermanentlyLocked)
        );
    }
}
