//! Application hand-off ("go to address").
//!
//! Validation is as deep as the core can go without assuming how the target
//! was linked: the address must be a word-aligned vector-table base inside
//! application flash, and the first two words it holds must look like an
//! initial stack pointer and a Thumb entry point. The register-level jump
//! itself (interrupt masking, vector-table rebase, stack load, branch)
//! belongs to the embedding firmware; the core's job ends at a validated
//! [`Handoff`].

use thiserror::Error;

use crate::memory_map::MemoryMap;
use crate::Flash;

/// A validated jump target. Producing one is the command loop's terminal
/// transition: once the response is flushed, control never returns here.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Handoff {
    /// Vector-table base the target was validated at.
    pub vector_base: u32,
    /// The target's initial stack pointer (first vector-table word).
    pub stack_pointer: u32,
    /// The target's entry point, Thumb bit included (second word).
    pub entry: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum LaunchError {
    #[error("jump target is outside device flash")]
    AddressOutOfBounds,
    #[error("jump target is inside the bootloader's resident region")]
    InsideBootloader,
    #[error("jump target is not word-aligned")]
    Misaligned,
    #[error("initial stack pointer does not land in RAM")]
    BadStackPointer,
    #[error("reset vector is not a Thumb entry into application flash")]
    BadResetVector,
    #[error("unable to read the target vector table")]
    ReadFault,
}

/// Borrows the map and the flash primitive for the duration of one command.
pub struct Launcher<'a, F> {
    map: &'a MemoryMap,
    flash: &'a mut F,
}

impl<'a, F: Flash> Launcher<'a, F> {
    pub fn new(map: &'a MemoryMap, flash: &'a mut F) -> Self {
        Self { map, flash }
    }

    /// Validate `target` as a vector-table base and build the hand-off
    /// record.
    pub fn prepare(&mut self, target: u32) -> Result<Handoff, LaunchError> {
        if target % 4 != 0 {
            return Err(LaunchError::Misaligned);
        }
        let end = target.checked_add(8).ok_or(LaunchError::AddressOutOfBounds)?;
        if !self.map.flash.contains(target) || end > self.map.flash.end {
            return Err(LaunchError::AddressOutOfBounds);
        }
        if self.map.bootloader.overlaps(target, end) {
            return Err(LaunchError::InsideBootloader);
        }

        let mut table = [0u8; 8];
        self.flash.read(target, &mut table).map_err(|e| {
            error!("vector-table read fault at {:#010x}: {:?}", target, e);
            LaunchError::ReadFault
        })?;
        let stack_pointer = u32::from_le_bytes([table[0], table[1], table[2], table[3]]);
        let entry = u32::from_le_bytes([table[4], table[5], table[6], table[7]]);

        // A full descending stack may legitimately start one past the end of
        // RAM.
        let sp_ok = stack_pointer % 4 == 0
            && stack_pointer > self.map.ram.start
            && stack_pointer <= self.map.ram.end;
        if !sp_ok {
            warn!("implausible stack pointer {:#010x} at {:#010x}", stack_pointer, target);
            return Err(LaunchError::BadStackPointer);
        }

        // Cortex-M entry points carry the Thumb bit and must point back into
        // application flash.
        let entry_addr = entry & !1;
        let entry_ok = entry & 1 == 1
            && self.map.flash.contains(entry_addr)
            && !self.map.bootloader.contains(entry_addr);
        if !entry_ok {
            warn!("implausible reset vector {:#010x} at {:#010x}", entry, target);
            return Err(LaunchError::BadResetVector);
        }

        Ok(Handoff { vector_base: target, stack_pointer, entry })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_map::Region;
    use crate::ram::RamDevice;

    const APP_BASE: u32 = 0x0800_8000;

    fn map() -> MemoryMap {
        MemoryMap::new(
            Region::new(0x0800_0000, 0x0802_0000),
            Region::new(0x0800_0000, 0x0800_4000),
            Region::new(0x2000_0000, 0x2000_8000),
            0x800,
            8,
        )
    }

    fn device_with_vectors(sp: u32, entry: u32) -> RamDevice {
        let mut device = RamDevice::new(map(), &[0x04, 0x60]);
        let mut table = [0u8; 8];
        table[..4].copy_from_slice(&sp.to_le_bytes());
        table[4..].copy_from_slice(&entry.to_le_bytes());
        device.program(APP_BASE, &table).unwrap();
        device
    }

    #[test]
    fn valid_vector_table_produces_a_handoff() {
        let map = map();
        let mut device = device_with_vectors(0x2000_8000, 0x0800_8101);
        let handoff = Launcher::new(&map, &mut device).prepare(APP_BASE).unwrap();
        assert_eq!(
            handoff,
            Handoff { vector_base: APP_BASE, stack_pointer: 0x2000_8000, entry: 0x0800_8101 }
        );
    }

    #[test]
    fn bootloader_region_is_not_a_jump_target() {
        let map = map();
        let mut device = RamDevice::new(map, &[0x04, 0x60]);
        assert_eq!(
            Launcher::new(&map, &mut device).prepare(0x0800_0000),
            Err(LaunchError::InsideBootloader)
        );
    }

    #[test]
    fn address_outside_flash_is_rejected() {
        let map = map();
        let mut device = RamDevice::new(map, &[0x04, 0x60]);
        assert_eq!(
            Launcher::new(&map, &mut device).prepare(0x2000_0000),
            Err(LaunchError::AddressOutOfBounds)
        );
        assert_eq!(
            Launcher::new(&map, &mut device).prepare(0x0801_FFFC),
            Err(LaunchError::AddressOutOfBounds)
        );
    }

    #[test]
    fn stack_pointer_outside_ram_is_rejected() {
        let map = map();
        let mut device = device_with_vectors(0x0800_9000, 0x0800_8101);
        assert_eq!(
            Launcher::new(&map, &mut device).prepare(APP_BASE),
            Err(LaunchError::BadStackPointer)
        );
    }

    #[test]
    fn reset_vector_without_thumb_bit_is_rejected() {
        let map = map();
        let mut device = device_with_vectors(0x2000_8000, 0x0800_8100);
        assert_eq!(
            Launcher::new(&map, &mut device).prepare(APP_BASE),
            Err(LaunchError::BadResetVector)
        );
    }

    #[test]
    fn erased_flash_never_validates() {
        let map = map();
        let mut device = RamDevice::new(map, &[0x04, 0x60]);
        assert_eq!(
            Launcher::new(&map, &mut device).prepare(APP_BASE),
            Err(LaunchError::BadStackPointer)
        );
    }
}
