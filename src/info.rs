//! Bootloader identity: version, help text and the immutable boot context.

use crate::memory_map::MemoryMap;
use crate::protocol::PROTOCOL_VERSION;
use crate::DeviceId;

/// Bootloader firmware version reported by GET VERSION. Kept in step with
/// the crate version.
pub const VERSION: [u8; 3] = [0, 1, 0];

/// Longest chip identifier the boot context can hold.
pub const MAX_CHIP_ID: usize = 16;

/// Fixed descriptive text returned by GET HELP.
pub const HELP_TEXT: &[u8] = b"GET 00 | VERSION 01 | HELP 02 | CHIP-ID 03 | RDP-STATUS 04 | \
GO 05 <addr:4> | ERASE 06 <count|FF> <sectors> | WRITE 07 <addr:4> <len> <data> | \
RDP-ON 08 | RDP-OFF 09";

/// Read-only identity and layout, built once at boot before the command loop
/// starts and never mutated afterwards.
#[derive(Clone, Debug)]
pub struct BootContext {
    pub map: MemoryMap,
    pub version: [u8; 3],
    pub protocol_version: u8,
    chip_id: [u8; MAX_CHIP_ID],
    chip_id_len: usize,
}

impl BootContext {
    pub fn new<I: DeviceId>(map: MemoryMap, id_source: &mut I) -> Self {
        let mut chip_id = [0u8; MAX_CHIP_ID];
        let chip_id_len = id_source.read_id(&mut chip_id);
        Self {
            map,
            version: VERSION,
            protocol_version: PROTOCOL_VERSION,
            chip_id,
            chip_id_len,
        }
    }

    /// Identifier bytes captured from the device at construction.
    pub fn chip_id(&self) -> &[u8] {
        &self.chip_id[..self.chip_id_len]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn help_text_fits_a_length_prefixed_response() {
        assert!(HELP_TEXT.len() <= 255);
    }

    #[test]
    fn context_captures_the_chip_id_once() {
        struct Id;
        impl DeviceId for Id {
            fn read_id(&mut self, buf: &mut [u8]) -> usize {
                buf[..2].copy_from_slice(&[0x04, 0x60]);
                2
            }
        }

        let map = MemoryMap::new(
            crate::memory_map::Region::new(0x0800_0000, 0x0802_0000),
            crate::memory_map::Region::new(0x0800_0000, 0x0800_4000),
            crate::memory_map::Region::new(0x2000_0000, 0x2000_8000),
            0x800,
            8,
        );
        let context = BootContext::new(map, &mut Id);
        assert_eq!(context.chip_id(), &[0x04, 0x60]);
        assert_eq!(context.protocol_version, PROTOCOL_VERSION);
    }
}
