use std::io::ErrorKind as IoErrorKind;
use std::path::Path;

use linux_embedded_hal::serial_core::{
    BaudRate, CharSize, Error as SerialError, FlowControl, Parity, SerialDevice as _,
    SerialPortSettings as _, StopBits,
};
use linux_embedded_hal::{Delay, Serial};

use crate::memory_map::MemoryMap;
use crate::{Bootloader, DeviceId, Flash, OptionBytes, Options};

impl<F> Bootloader<Serial, F, Delay, IoErrorKind>
where
    F: Flash + OptionBytes + DeviceId,
{
    /// Serve the bootloader on a linux serial port (8E1, matching the
    /// STM32 factory bootloader line settings).
    pub fn linux<P: AsRef<Path>>(
        port: P,
        baud: usize,
        device: F,
        map: MemoryMap,
        options: Options,
    ) -> Result<Self, SerialError> {
        // Open port
        let mut port = Serial::open(port.as_ref())?;

        // Apply settings
        let mut settings = port.0.read_settings()?;

        settings.set_char_size(CharSize::Bits8);
        settings.set_stop_bits(StopBits::Stop1);
        settings.set_baud_rate(BaudRate::from_speed(baud))?;
        settings.set_flow_control(FlowControl::FlowNone);
        settings.set_parity(Parity::ParityEven);

        port.0.write_settings(&settings)?;

        // Return instance
        Ok(Self::new(port, device, Delay {}, map, options))
    }
}
