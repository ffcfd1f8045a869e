//! Flash operation engine: erase, write and read orchestration over the
//! hardware programming primitive.
//!
//! Validation happens in full before the first destructive call, so a bad
//! request never leaves flash partially touched. Hardware faults are
//! reported with their position and never retried; flash failure is rarely
//! transient, and the host recovers by re-erasing.

use thiserror::Error;

use crate::memory_map::{Access, MemoryMap, MAX_WRITE_ALIGN};
use crate::protocol::{ERASED_BYTE, MAX_READ_CHUNK};
use crate::Flash;

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum FlashError {
    #[error("address range falls outside device flash")]
    AddressOutOfBounds,
    #[error("address range overlaps the bootloader's resident region")]
    OverlapsBootloader,
    #[error("write address is not aligned to the programming granularity")]
    Misaligned,
    #[error("sector index is outside the device sector range")]
    SectorOutOfRange,
    #[error("length is zero or exceeds the allowed transfer size")]
    LengthInvalid,
    #[error("hardware fault while erasing sector {sector}")]
    EraseFault { sector: u8 },
    #[error("hardware fault during mass erase")]
    MassEraseFault,
    #[error("hardware fault while programming address {address:#010x}")]
    ProgramFault { address: u32 },
    #[error("hardware fault while reading address {address:#010x}")]
    ReadFault { address: u32 },
}

/// An erase request as it arrives off the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EraseRequest<'a> {
    /// Erase every application sector.
    Mass,
    /// Erase exactly these sectors, in order.
    Sectors(&'a [u8]),
}

/// Borrows the map and the programming primitive for the duration of one
/// command.
pub struct FlashEngine<'a, F> {
    map: &'a MemoryMap,
    flash: &'a mut F,
}

impl<'a, F: Flash> FlashEngine<'a, F> {
    pub fn new(map: &'a MemoryMap, flash: &'a mut F) -> Self {
        Self { map, flash }
    }

    /// Erase sectors, or everything. Sector lists are validated in full
    /// before the first erase; one bad index aborts the whole request.
    pub fn erase(&mut self, request: EraseRequest) -> Result<(), FlashError> {
        match request {
            EraseRequest::Mass => {
                debug!("mass erasing application flash");
                self.flash.mass_erase().map_err(|e| {
                    error!("mass erase fault: {:?}", e);
                    FlashError::MassEraseFault
                })
            }
            EraseRequest::Sectors(sectors) => {
                self.map.validate_sectors(sectors)?;
                for &sector in sectors {
                    debug!("erasing sector {}", sector);
                    self.flash.erase_sector(sector).map_err(|e| {
                        error!("erase fault on sector {}: {:?}", sector, e);
                        FlashError::EraseFault { sector }
                    })?;
                }
                Ok(())
            }
        }
    }

    /// Program `data` at `address` in granularity-sized chunks. The final
    /// partial chunk is padded with the erased value, so the bytes past the
    /// end of `data` are deterministic and read back stably.
    pub fn write(&mut self, address: u32, data: &[u8]) -> Result<(), FlashError> {
        let align = self.map.write_align as usize;
        // The padded tail is programmed too, so validate the rounded length.
        let padded_len = (data.len() + align - 1) / align * align;
        self.map.validate_range(address, padded_len, Access::Write)?;

        let mut addr = address;
        for chunk in data.chunks(align) {
            if chunk.len() == align {
                self.flash.program(addr, chunk)
            } else {
                let mut padded = [ERASED_BYTE; MAX_WRITE_ALIGN];
                padded[..chunk.len()].copy_from_slice(chunk);
                self.flash.program(addr, &padded[..align])
            }
            .map_err(|e| {
                error!("program fault at {:#010x}: {:?}", addr, e);
                FlashError::ProgramFault { address: addr }
            })?;
            addr += align as u32;
        }
        Ok(())
    }

    /// Read a bounded block. The resident region is readable; only device
    /// bounds apply.
    pub fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        if buf.len() > MAX_READ_CHUNK {
            return Err(FlashError::LengthInvalid);
        }
        self.map.validate_range(address, buf.len(), Access::Read)?;
        self.flash.read(address, buf).map_err(|e| {
            error!("read fault at {:#010x}: {:?}", address, e);
            FlashError::ReadFault { address }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_map::Region;
    use crate::ram::RamDevice;

    fn map() -> MemoryMap {
        MemoryMap::new(
            Region::new(0x0800_0000, 0x0802_0000),
            Region::new(0x0800_0000, 0x0800_4000),
            Region::new(0x2000_0000, 0x2000_8000),
            0x800,
            8,
        )
    }

    #[test]
    fn partial_final_chunk_is_padded_with_erased_value() {
        let map = map();
        let mut device = RamDevice::new(map, &[0x04, 0x60]);
        let mut engine = FlashEngine::new(&map, &mut device);

        engine.write(0x0800_4000, &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11]).unwrap();

        let mut back = [0u8; 16];
        engine.read(0x0800_4000, &mut back).unwrap();
        assert_eq!(&back[..11], &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11]);
        assert_eq!(&back[11..], &[0xFF; 5]);

        // Padding is stable across repeated reads.
        let mut again = [0u8; 16];
        engine.read(0x0800_4000, &mut again).unwrap();
        assert_eq!(back, again);
    }

    #[test]
    fn padded_tail_cannot_cross_the_flash_end() {
        let map = map();
        let mut device = RamDevice::new(map, &[0x04, 0x60]);
        let mut engine = FlashEngine::new(&map, &mut device);

        // 4 data bytes, but the 8-byte padded chunk would run past the end.
        assert_eq!(
            engine.write(0x0801_FFFC, &[1, 2, 3, 4]),
            Err(FlashError::AddressOutOfBounds)
        );
        assert_eq!(device.program_count, 0);
    }

    #[test]
    fn invalid_sector_aborts_before_any_erase() {
        let map = map();
        let mut device = RamDevice::new(map, &[0x04, 0x60]);
        let mut engine = FlashEngine::new(&map, &mut device);

        assert_eq!(
            engine.erase(EraseRequest::Sectors(&[8, 9, 64])),
            Err(FlashError::SectorOutOfRange)
        );
        assert_eq!(device.erase_count, 0);
    }

    #[test]
    fn program_fault_reports_the_failing_address() {
        let map = map();
        let mut device = RamDevice::new(map, &[0x04, 0x60]);
        device.fail_program_at = Some(0x0800_4008);
        let mut engine = FlashEngine::new(&map, &mut device);

        assert_eq!(
            engine.write(0x0800_4000, &[0u8; 24]),
            Err(FlashError::ProgramFault { address: 0x0800_4008 })
        );
    }

    #[test]
    fn oversized_read_is_rejected() {
        let map = map();
        let mut device = RamDevice::new(map, &[0x04, 0x60]);
        let mut engine = FlashEngine::new(&map, &mut device);

        let mut buf = [0u8; 257];
        assert_eq!(
            engine.read(0x0800_0000, &mut buf),
            Err(FlashError::LengthInvalid)
        );
    }
}
