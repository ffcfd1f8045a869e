//! An in-memory device model: flash, option bytes and chip id backed by RAM.
//!
//! This is what the simulator utility serves the protocol against, and what
//! the crate's tests use as a recording fake: the operation counters let a
//! test assert not just that a request was rejected, but that the hardware
//! primitive was never reached.

use crate::memory_map::MemoryMap;
use crate::protection::RdpLevel;
use crate::protocol::ERASED_BYTE;
use crate::{DeviceId, Flash, OptionBytes};

/// Simulated hardware fault, injected via [`RamDevice::fail_program_at`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RamFault;

pub struct RamDevice {
    map: MemoryMap,
    flash: Vec<u8>,
    rdp: RdpLevel,
    chip_id: Vec<u8>,
    /// When set, `program` reports a fault at exactly this address.
    pub fail_program_at: Option<u32>,
    pub erase_count: usize,
    pub mass_erase_count: usize,
    pub program_count: usize,
    pub reset_count: usize,
}

impl RamDevice {
    pub fn new(map: MemoryMap, chip_id: &[u8]) -> Self {
        Self {
            map,
            flash: vec![ERASED_BYTE; map.flash.len() as usize],
            rdp: RdpLevel::None,
            chip_id: chip_id.to_vec(),
            fail_program_at: None,
            erase_count: 0,
            mass_erase_count: 0,
            program_count: 0,
            reset_count: 0,
        }
    }

    pub fn with_protection(mut self, level: RdpLevel) -> Self {
        self.rdp = level;
        self
    }

    /// Direct view of simulated flash contents, for assertions.
    pub fn flash_bytes(&self, address: u32, len: usize) -> &[u8] {
        let offset = self.offset(address);
        &self.flash[offset..offset + len]
    }

    fn offset(&self, address: u32) -> usize {
        (address - self.map.flash.start) as usize
    }

    fn erase_application(&mut self) {
        let resident_start = self.offset(self.map.bootloader.start);
        let resident_end = self.offset(self.map.bootloader.end);
        for (i, byte) in self.flash.iter_mut().enumerate() {
            if i < resident_start || i >= resident_end {
                *byte = ERASED_BYTE;
            }
        }
    }
}

impl Flash for RamDevice {
    type Error = RamFault;

    fn erase_sector(&mut self, sector: u8) -> Result<(), RamFault> {
        self.erase_count += 1;
        let region = self.map.sector_region(sector);
        let (start, end) = (self.offset(region.start), self.offset(region.end));
        for byte in &mut self.flash[start..end] {
            *byte = ERASED_BYTE;
        }
        Ok(())
    }

    fn mass_erase(&mut self) -> Result<(), RamFault> {
        self.mass_erase_count += 1;
        self.erase_application();
        Ok(())
    }

    fn program(&mut self, address: u32, data: &[u8]) -> Result<(), RamFault> {
        if self.fail_program_at == Some(address) {
            return Err(RamFault);
        }
        self.program_count += 1;
        let offset = self.offset(address);
        self.flash[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<(), RamFault> {
        let offset = self.offset(address);
        buf.copy_from_slice(&self.flash[offset..offset + buf.len()]);
        Ok(())
    }
}

impl OptionBytes for RamDevice {
    type Error = RamFault;

    fn read_protection(&self) -> RdpLevel {
        self.rdp
    }

    fn write_protection(&mut self, level: RdpLevel) -> Result<(), RamFault> {
        // The hardware only regresses from level 1 by erasing the
        // application.
        if self.rdp == RdpLevel::Level1 && level == RdpLevel::None {
            self.mass_erase_count += 1;
            self.erase_application();
        }
        self.rdp = level;
        Ok(())
    }

    fn trigger_reset(&mut self) {
        self.reset_count += 1;
    }
}

impl DeviceId for RamDevice {
    fn read_id(&mut self, buf: &mut [u8]) -> usize {
        let len = self.chip_id.len().min(buf.len());
        buf[..len].copy_from_slice(&self.chip_id[..len]);
        len
    }
}
