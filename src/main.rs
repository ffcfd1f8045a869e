#[macro_use]
extern crate log;

extern crate structopt;
use structopt::StructOpt;

extern crate simplelog;
use simplelog::{Config, LevelFilter, SimpleLogger};

use anyhow::Context;

use stm32_uart_bootloader::memory_map::{MemoryMap, Region};
use stm32_uart_bootloader::ram::RamDevice;
use stm32_uart_bootloader::{Bootloader, Exit, Options};

/// Serve the bootloader protocol on a serial port against an in-memory
/// device model, so host tooling can be developed without target hardware.
#[derive(Clone, Debug, StructOpt)]
pub struct Args {
    /// Serial port to serve on
    #[structopt(long, default_value = "/dev/ttyUSB0")]
    port: String,

    /// Serial port baud rate
    #[structopt(long, default_value = "57600")]
    baud: usize,

    #[structopt(flatten)]
    options: Options,

    /// Log level for console output
    #[structopt(long, default_value = "debug")]
    log_level: LevelFilter,
}

// Simulated layout: 128 KiB of flash in 2 KiB sectors with the first 16 KiB
// resident, 32 KiB of RAM, a G0-series chip id.
const FLASH: Region = Region::new(0x0800_0000, 0x0802_0000);
const BOOTLOADER: Region = Region::new(0x0800_0000, 0x0800_4000);
const RAM: Region = Region::new(0x2000_0000, 0x2000_8000);
const CHIP_ID: [u8; 2] = [0x04, 0x60];

fn main() -> anyhow::Result<()> {
    // Parse out arguments
    let o = Args::from_args();

    // Configure logger
    let _ = SimpleLogger::init(o.log_level, Config::default());

    let map = MemoryMap::new(FLASH, BOOTLOADER, RAM, 0x800, 8);
    let device = RamDevice::new(map, &CHIP_ID);

    info!("Opening serial port");

    let mut b = Bootloader::linux(&o.port, o.baud, device, map, o.options.clone())
        .map_err(|e| anyhow::anyhow!("{}", e))
        .with_context(|| format!("opening serial port {}", o.port))?;

    info!("Serving bootloader commands");

    loop {
        match b.run() {
            Ok(Exit::Reset) => {
                info!("Reset requested; restarting command loop");
            }
            Ok(Exit::Jump(handoff)) => {
                info!(
                    "Hand-off requested: sp {:#010x}, entry {:#010x}",
                    handoff.stack_pointer, handoff.entry
                );
                break;
            }
            Err(e) => {
                error!("Serial failure: {:?}", e);
                break;
            }
        }
    }

    Ok(())
}
