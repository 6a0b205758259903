//! fwflash - Firmware-managed flash access
//!
//! Exposes flash chips owned by firmware as ordinary storage devices.
//!
//! # Architecture
//!
//! Firmware executes flash requests out-of-band and signals completion
//! later, tagged with an async token. fwflash turns that into plain
//! synchronous calls:
//!
//! - **fwflash-core** - token pool, completion channel, the async bridge and
//!   the `FirmwareFlash` storage device
//! - **fwflash-mtd** - device registry with argument checking, fixed
//!   partitions and the driver that binds description-tree nodes
//! - **fwflash-dummy** - in-memory firmware used by this tool and the tests

mod cli;
mod commands;
mod session;

use clap::Parser;
use cli::{Cli, Commands};
use session::Session;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    // Set log level based on verbosity
    match cli.verbose {
        0 => {} // default (info)
        1 => log::set_max_level(log::LevelFilter::Debug),
        _ => log::set_max_level(log::LevelFilter::Trace),
    }

    let session = Session::open(&cli)?;

    let (result, modified) = match &cli.command {
        Commands::List => {
            commands::run_list(session.registry());
            (Ok(()), false)
        }
        Commands::Info { device } => {
            let result = session.device(device.as_deref()).map(|mtd| commands::run_info(&mtd));
            (result, false)
        }
        Commands::Read {
            device,
            output,
            offset,
            length,
        } => {
            let result = session
                .device(device.as_deref())
                .and_then(|mtd| commands::run_read(&mtd, output, *offset, *length));
            (result, false)
        }
        Commands::Write {
            device,
            input,
            offset,
            no_verify,
        } => {
            let result = session
                .device(device.as_deref())
                .and_then(|mtd| commands::run_write(&mtd, input, *offset, !no_verify));
            (result, true)
        }
        Commands::Erase {
            device,
            offset,
            length,
        } => {
            let result = session
                .device(device.as_deref())
                .and_then(|mtd| commands::run_erase(&mtd, *offset, *length));
            (result, true)
        }
    };

    // Save whatever reached the chip, even after a partial failure
    session.close(modified)?;
    result
}
