//! CLI argument parsing

use clap::{Parser, Subcommand};
use fwflash_core::token::DEFAULT_TOKEN_COUNT;
use fwflash_mtd::Partition;
use std::path::PathBuf;

/// Parse a string as a hex or decimal u64
fn parse_hex_u64(s: &str) -> Result<u64, String> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).map_err(|e| format!("Invalid hex value: {}", e))
    } else {
        s.parse::<u64>().map_err(|e| format!("Invalid number: {}", e))
    }
}

/// Parse a partition as `NAME:OFFSET:SIZE`, optionally suffixed with `:ro`
fn parse_partition(s: &str) -> Result<Partition, String> {
    let fields: Vec<&str> = s.split(':').collect();
    let (name, offset, size, read_only) = match fields.as_slice() {
        [name, offset, size] => (name, offset, size, false),
        [name, offset, size, "ro"] => (name, offset, size, true),
        _ => {
            return Err(format!(
                "Invalid partition '{}' (expected NAME:OFFSET:SIZE[:ro])",
                s
            ))
        }
    };
    if name.is_empty() {
        return Err("Partition name must not be empty".into());
    }

    let part = Partition::new(*name, parse_hex_u64(offset)?, parse_hex_u64(size)?);
    Ok(if read_only { part.read_only() } else { part })
}

#[derive(Parser)]
#[command(name = "fwflash")]
#[command(author, version, about = "Firmware-managed flash access", long_about = None)]
pub struct Cli {
    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Hardware description tree (TOML)
    /// Defaults to a single 64 MiB flash named "pnor"
    #[arg(short, long, global = true)]
    pub tree: Option<PathBuf>,

    /// Image file backing the first flash device; updated after
    /// write and erase
    #[arg(long, global = true)]
    pub image: Option<PathBuf>,

    /// Number of async tokens
    #[arg(long, global = true, default_value_t = DEFAULT_TOKEN_COUNT)]
    pub tokens: usize,

    /// Firmware worker threads
    #[arg(long, global = true, default_value_t = 4)]
    pub workers: usize,

    /// Fixed partition of the first flash device (NAME:OFFSET:SIZE[:ro]),
    /// may be repeated
    #[arg(long = "partition", global = true, value_parser = parse_partition)]
    pub partitions: Vec<Partition>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List registered devices
    List,

    /// Show device details
    Info {
        /// Device name or number (default: first device)
        #[arg(short, long)]
        device: Option<String>,
    },

    /// Read device contents to a file
    Read {
        /// Device name or number (default: first device)
        #[arg(short, long)]
        device: Option<String>,

        /// Output file path
        #[arg(short, long)]
        output: PathBuf,

        /// Start offset (hex with 0x prefix, or decimal)
        #[arg(long, default_value = "0", value_parser = parse_hex_u64)]
        offset: u64,

        /// Number of bytes (default: to the end of the device)
        #[arg(long, value_parser = parse_hex_u64)]
        length: Option<u64>,
    },

    /// Write a file to the device
    Write {
        /// Device name or number (default: first device)
        #[arg(short, long)]
        device: Option<String>,

        /// Input file path
        #[arg(short, long)]
        input: PathBuf,

        /// Start offset (hex with 0x prefix, or decimal)
        #[arg(long, default_value = "0", value_parser = parse_hex_u64)]
        offset: u64,

        /// Skip read-back verification
        #[arg(long)]
        no_verify: bool,
    },

    /// Erase a range of the device
    Erase {
        /// Device name or number (default: first device)
        #[arg(short, long)]
        device: Option<String>,

        /// Start offset, erase block aligned
        #[arg(long, default_value = "0", value_parser = parse_hex_u64)]
        offset: u64,

        /// Number of bytes, erase block aligned (default: to the end)
        #[arg(long, value_parser = parse_hex_u64)]
        length: Option<u64>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hex_u64() {
        assert_eq!(parse_hex_u64("0x1000"), Ok(0x1000));
        assert_eq!(parse_hex_u64("0X10"), Ok(0x10));
        assert_eq!(parse_hex_u64("4096"), Ok(4096));
        assert!(parse_hex_u64("0xZZ").is_err());
    }

    #[test]
    fn test_parse_partition() {
        let part = parse_partition("nvram:0x8000:0x4000").unwrap();
        assert_eq!(part, Partition::new("nvram", 0x8000, 0x4000));
        assert!(parse_partition("boot:0:0x1000:ro").unwrap().read_only);
        assert!(parse_partition("boot:0").is_err());
        assert!(parse_partition(":0:0x1000").is_err());
        assert!(parse_partition("boot:0:0x1000:rw").is_err());
    }

    #[test]
    fn test_cli_parses() {
        let cli = Cli::try_parse_from([
            "fwflash",
            "-vv",
            "--partition",
            "boot:0:0x10000",
            "read",
            "-o",
            "out.bin",
            "--offset",
            "0x1000",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.partitions.len(), 1);
        assert!(matches!(
            cli.command,
            Commands::Read {
                offset: 0x1000,
                length: None,
                ..
            }
        ));
    }
}
