//! The command loop: frame reception, integrity checking, dispatch and
//! response.
//!
//! Strictly sequential: one frame is received, checked, dispatched and fully
//! answered before the next one is read. The only suspension points are the
//! timeout-bounded byte reads; a timeout abandons the frame in progress and
//! re-arms the reader with nothing mutated downstream.

use core::marker::PhantomData;

use embedded_hal::blocking::delay::DelayMs;

use crate::flash::{EraseRequest, FlashEngine, FlashError};
use crate::info::{BootContext, HELP_TEXT, MAX_CHIP_ID};
use crate::launcher::{Handoff, LaunchError, Launcher};
use crate::memory_map::MemoryMap;
use crate::protection::{ProtectionError, ProtectionManager};
use crate::protocol::{
    Command, Status, FRAME_CRC, MASS_ERASE_MARKER, MAX_PAYLOAD, UART_ACK, UART_NACK,
};
use crate::{DeviceId, Error, Flash, OptionBytes, Options, SerialPort};

/// Outcome of receiving and processing at most one frame.
#[derive(Clone, Debug, PartialEq)]
pub enum Poll {
    /// No frame started within the timeout window.
    Idle,
    /// A frame was abandoned mid-reception or failed its integrity check.
    Rejected,
    /// A frame was accepted and its response sent.
    Handled,
    /// Terminal transition; the command loop is done.
    Exit(Exit),
}

/// The two ways control leaves the command loop for good.
#[derive(Clone, Debug, PartialEq)]
pub enum Exit {
    /// A validated hand-off to application firmware. The embedder performs
    /// the actual jump; nothing of the bootloader survives it.
    Jump(Handoff),
    /// A protection change was accepted and a reset is pending. Observable
    /// only off-hardware, where `trigger_reset` returns.
    Reset,
}

enum Received {
    Byte(u8),
    TimedOut,
}

/// The bootloader command machine, generic over the serial transport, the
/// device hardware (flash + option bytes + chip id) and a delay source for
/// timeout polling.
pub struct Bootloader<P, F, D, E> {
    port: P,
    device: F,
    delay: D,
    options: Options,
    context: BootContext,
    payload: [u8; MAX_PAYLOAD],
    _err: PhantomData<E>,
}

impl<P, F, D, E> Bootloader<P, F, D, E>
where
    P: SerialPort<E>,
    F: Flash + OptionBytes + DeviceId,
    D: DelayMs<u32>,
    E: core::fmt::Debug,
{
    /// Create a new bootloader instance. The chip id is read once here;
    /// the context never changes afterwards.
    pub fn new(port: P, mut device: F, delay: D, map: MemoryMap, options: Options) -> Self {
        let context = BootContext::new(map, &mut device);
        Self {
            port,
            device,
            delay,
            options,
            context,
            payload: [0u8; MAX_PAYLOAD],
            _err: PhantomData,
        }
    }

    pub fn context(&self) -> &BootContext {
        &self.context
    }

    /// Serve commands until control leaves the bootloader, either through a
    /// validated jump or a pending reset.
    pub fn run(&mut self) -> Result<Exit, Error<E>> {
        loop {
            if let Poll::Exit(exit) = self.poll()? {
                return Ok(exit);
            }
        }
    }

    /// Receive and process at most one frame.
    pub fn poll(&mut self) -> Result<Poll, Error<E>> {
        let id = match self.read_byte()? {
            Received::Byte(id) => id,
            Received::TimedOut => return Ok(Poll::Idle),
        };

        let payload_len = match self.read_payload(id)? {
            Some(len) => len,
            None => {
                warn!("frame {:#04x} abandoned: receive timeout", id);
                return Ok(Poll::Rejected);
            }
        };
        let received_crc = match self.read_u32()? {
            Some(crc) => crc,
            None => {
                warn!("frame {:#04x} abandoned: receive timeout in trailer", id);
                return Ok(Poll::Rejected);
            }
        };

        let mut digest = FRAME_CRC.digest();
        digest.update(&[id]);
        digest.update(&self.payload[..payload_len]);
        let computed_crc = digest.finalize();
        if computed_crc != received_crc {
            debug!(
                "integrity mismatch on {:#04x}: received {:#010x}, computed {:#010x}",
                id, received_crc, computed_crc
            );
            self.send_byte(UART_NACK)?;
            self.flush()?;
            return Ok(Poll::Rejected);
        }

        // The ACK acknowledges integrity only; a failing command still gets
        // one, followed by its error status.
        self.send_byte(UART_ACK)?;

        let poll = match Command::from_id(id) {
            Some(command) => self.dispatch(command)?,
            None => {
                warn!("unknown command {:#04x}", id);
                self.send_status(Status::UnknownCommand)?;
                Poll::Handled
            }
        };

        self.flush()?;
        if let Poll::Exit(Exit::Reset) = poll {
            // The response is on the wire; the option-byte change takes
            // effect on the way back up. On hardware this does not return.
            self.device.trigger_reset();
        }
        Ok(poll)
    }

    fn dispatch(&mut self, command: Command) -> Result<Poll, Error<E>> {
        debug!("dispatching {:?}", command);
        match command {
            Command::Get => {
                self.send_byte(Command::ALL.len() as u8)?;
                for c in &Command::ALL {
                    self.send_byte(c.id())?;
                }
                Ok(Poll::Handled)
            }

            Command::GetVersion => {
                let version = self.context.version;
                let protocol = self.context.protocol_version;
                self.send_block(&version)?;
                self.send_byte(protocol)?;
                Ok(Poll::Handled)
            }

            Command::GetHelp => {
                self.send_byte(HELP_TEXT.len() as u8)?;
                self.send_block(HELP_TEXT)?;
                Ok(Poll::Handled)
            }

            Command::GetChipId => {
                let mut id = [0u8; MAX_CHIP_ID];
                let len = self.context.chip_id().len();
                id[..len].copy_from_slice(self.context.chip_id());
                self.send_byte(len as u8)?;
                self.send_block(&id[..len])?;
                Ok(Poll::Handled)
            }

            Command::GetProtectionStatus => {
                let level = ProtectionManager::new(&mut self.device).status();
                self.send_byte(level.as_byte())?;
                Ok(Poll::Handled)
            }

            Command::Go => {
                let target = u32::from_le_bytes([
                    self.payload[0],
                    self.payload[1],
                    self.payload[2],
                    self.payload[3],
                ]);
                let prepared =
                    Launcher::new(&self.context.map, &mut self.device).prepare(target);
                match prepared {
                    Ok(handoff) => {
                        // The ACK is the last thing on the wire: a successful
                        // hand-off returns no status because control is gone.
                        info!("handing off to application at {:#010x}", target);
                        Ok(Poll::Exit(Exit::Jump(handoff)))
                    }
                    Err(e) => {
                        warn!("go to {:#010x} rejected: {}", target, e);
                        self.send_status(launch_status(&e))?;
                        Ok(Poll::Handled)
                    }
                }
            }

            Command::Erase => {
                let count = self.payload[0];
                let outcome = {
                    let mut engine = FlashEngine::new(&self.context.map, &mut self.device);
                    if count == MASS_ERASE_MARKER {
                        engine.erase(EraseRequest::Mass)
                    } else {
                        engine.erase(EraseRequest::Sectors(
                            &self.payload[1..1 + count as usize],
                        ))
                    }
                };
                if let Err(e) = &outcome {
                    warn!("erase rejected: {}", e);
                }
                self.send_status(flash_status(outcome))?;
                Ok(Poll::Handled)
            }

            Command::Write => {
                let address = u32::from_le_bytes([
                    self.payload[0],
                    self.payload[1],
                    self.payload[2],
                    self.payload[3],
                ]);
                let len = self.payload[4] as usize;
                let outcome = if len == 0 {
                    Err(FlashError::LengthInvalid)
                } else {
                    FlashEngine::new(&self.context.map, &mut self.device)
                        .write(address, &self.payload[5..5 + len])
                };
                if let Err(e) = &outcome {
                    warn!("write to {:#010x} rejected: {}", address, e);
                }
                self.send_status(flash_status(outcome))?;
                Ok(Poll::Handled)
            }

            Command::EnableProtection => {
                match ProtectionManager::new(&mut self.device).enable_level1() {
                    Ok(()) => {
                        self.send_status(Status::ResetPending)?;
                        Ok(Poll::Exit(Exit::Reset))
                    }
                    Err(e) => {
                        warn!("enable protection rejected: {}", e);
                        self.send_status(protection_status(&e))?;
                        Ok(Poll::Handled)
                    }
                }
            }

            Command::DisableProtection => {
                match ProtectionManager::new(&mut self.device).disable() {
                    Ok(()) => {
                        self.send_status(Status::ResetPending)?;
                        Ok(Poll::Exit(Exit::Reset))
                    }
                    Err(e) => {
                        warn!("disable protection rejected: {}", e);
                        self.send_status(protection_status(&e))?;
                        Ok(Poll::Handled)
                    }
                }
            }
        }
    }

    /// Read the id-determined payload into the frame buffer. Returns its
    /// length, or `None` if the frame was abandoned on a timeout.
    fn read_payload(&mut self, id: u8) -> Result<Option<usize>, Error<E>> {
        match Command::from_id(id) {
            Some(Command::Go) => self.read_exact(0, 4),
            Some(Command::Erase) => {
                if self.read_exact(0, 1)?.is_none() {
                    return Ok(None);
                }
                let count = self.payload[0];
                let indices = if count == MASS_ERASE_MARKER { 0 } else { count as usize };
                self.read_exact(1, indices)
            }
            Some(Command::Write) => {
                if self.read_exact(0, 5)?.is_none() {
                    return Ok(None);
                }
                let data = self.payload[4] as usize;
                self.read_exact(5, data)
            }
            // Fixed zero-length payloads; also the minimum-length assumption
            // for unknown ids, whose CRC trailer is still consumed so the
            // channel stays synchronized.
            _ => Ok(Some(0)),
        }
    }

    fn read_exact(&mut self, offset: usize, len: usize) -> Result<Option<usize>, Error<E>> {
        for i in 0..len {
            match self.read_byte()? {
                Received::Byte(b) => self.payload[offset + i] = b,
                Received::TimedOut => return Ok(None),
            }
        }
        Ok(Some(offset + len))
    }

    fn read_u32(&mut self) -> Result<Option<u32>, Error<E>> {
        let mut bytes = [0u8; 4];
        for slot in bytes.iter_mut() {
            match self.read_byte()? {
                Received::Byte(b) => *slot = b,
                Received::TimedOut => return Ok(None),
            }
        }
        Ok(Some(u32::from_le_bytes(bytes)))
    }

    fn read_byte(&mut self) -> Result<Received, Error<E>> {
        let mut waited = 0;

        loop {
            match self.port.read() {
                Ok(b) => return Ok(Received::Byte(b)),
                Err(nb::Error::WouldBlock) => (),
                Err(nb::Error::Other(e)) => return Err(e.into()),
            }

            self.delay.delay_ms(self.options.poll_delay_ms);
            waited += self.options.poll_delay_ms;

            if waited > self.options.byte_timeout_ms {
                return Ok(Received::TimedOut);
            }
        }
    }

    fn send_byte(&mut self, byte: u8) -> Result<(), Error<E>> {
        block!(self.port.write(byte))?;
        Ok(())
    }

    fn send_block(&mut self, data: &[u8]) -> Result<(), Error<E>> {
        for &byte in data {
            block!(self.port.write(byte))?;
        }
        Ok(())
    }

    fn send_status(&mut self, status: Status) -> Result<(), Error<E>> {
        debug!("responding {:?}", status);
        self.send_byte(status as u8)
    }

    fn flush(&mut self) -> Result<(), Error<E>> {
        block!(self.port.flush())?;
        Ok(())
    }
}

fn flash_status(result: Result<(), FlashError>) -> Status {
    match result {
        Ok(()) => Status::Success,
        Err(FlashError::AddressOutOfBounds) => Status::AddressOutOfBounds,
        Err(FlashError::OverlapsBootloader) => Status::OverlapsBootloader,
        Err(FlashError::Misaligned) => Status::Misaligned,
        Err(FlashError::SectorOutOfRange) => Status::SectorOutOfRange,
        Err(FlashError::LengthInvalid) => Status::LengthInvalid,
        Err(FlashError::EraseFault { .. })
        | Err(FlashError::MassEraseFault)
        | Err(FlashError::ProgramFault { .. })
        | Err(FlashError::ReadFault { .. }) => Status::HardwareFault,
    }
}

fn protection_status(error: &ProtectionError) -> Status {
    match error {
        ProtectionError::AlreadySet | ProtectionError::AlreadyNone => Status::AlreadyInState,
        ProtectionError::PermanentlyLocked => Status::ProtectionLocked,
        ProtectionError::OptionByteFault => Status::HardwareFault,
    }
}

fn launch_status(error: &LaunchError) -> Status {
    match error {
        LaunchError::AddressOutOfBounds => Status::AddressOutOfBounds,
        LaunchError::InsideBootloader => Status::OverlapsBootloader,
        LaunchError::Misaligned => Status::Misaligned,
        LaunchError::BadStackPointer | LaunchError::BadResetVector => Status::InvalidVector,
        LaunchError::ReadFault => Status::HardwareFault,
    }
}
