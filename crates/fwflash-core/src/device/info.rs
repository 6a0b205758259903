//! Device metadata
//!
//! Everything here is fixed when the device is registered and never
//! changes afterwards.

use bitflags::bitflags;
use core::fmt;

/// Flash layout of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceGeometry {
    /// Total addressable size in bytes
    pub size: u64,
    /// Erase block size in bytes
    pub erase_size: u32,
}

impl DeviceGeometry {
    /// Check that the geometry describes a usable device
    ///
    /// Returns a short reason on failure.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.size == 0 {
            return Err("total size is zero");
        }
        if self.erase_size == 0 {
            return Err("erase block size is zero");
        }
        if !self.erase_size.is_power_of_two() {
            return Err("erase block size is not a power of 2");
        }
        if u64::from(self.erase_size) > self.size {
            return Err("erase block size exceeds total size");
        }
        Ok(())
    }

    /// Number of whole erase blocks
    pub fn erase_blocks(&self) -> u64 {
        self.size / u64::from(self.erase_size)
    }

    /// Whether `addr` lies on an erase block boundary
    pub fn is_erase_aligned(&self, addr: u64) -> bool {
        addr % u64::from(self.erase_size) == 0
    }
}

/// Kind of memory device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    /// RAM-backed device
    Ram,
    /// Read-only memory
    Rom,
    /// NOR flash
    NorFlash,
    /// NAND flash
    NandFlash,
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ram => write!(f, "ram"),
            Self::Rom => write!(f, "rom"),
            Self::NorFlash => write!(f, "nor"),
            Self::NandFlash => write!(f, "nand"),
        }
    }
}

bitflags! {
    /// Device capability flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DeviceFlags: u32 {
        /// Device can be written
        const WRITEABLE     = 0x400;
        /// Single bits can be flipped
        const BIT_WRITEABLE = 0x800;
        /// No erase needed before writing
        const NO_ERASE      = 0x1000;
        /// Always locked after reset
        const POWERUP_LOCK  = 0x2000;

        /// Capabilities of a ROM
        const CAP_ROM       = 0;
        /// Capabilities of a RAM device
        const CAP_RAM       = Self::WRITEABLE.bits() | Self::BIT_WRITEABLE.bits() | Self::NO_ERASE.bits();
        /// Capabilities of NOR flash
        const CAP_NORFLASH  = Self::WRITEABLE.bits() | Self::BIT_WRITEABLE.bits();
        /// Capabilities of NAND flash
        const CAP_NANDFLASH = Self::WRITEABLE.bits();
    }
}

impl Default for DeviceFlags {
    fn default() -> Self {
        DeviceFlags::empty()
    }
}

/// Static description of a registered storage device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Human-readable name
    pub name: String,
    /// Device type
    pub device_type: DeviceType,
    /// Capability flags
    pub flags: DeviceFlags,
    /// Total size in bytes
    pub size: u64,
    /// Erase block size in bytes
    pub erase_size: u32,
    /// Minimal writable unit in bytes
    pub write_size: u32,
    /// Size of the write buffer in bytes
    pub write_buf_size: u32,
}

impl DeviceInfo {
    /// Geometry part of the info
    pub fn geometry(&self) -> DeviceGeometry {
        DeviceGeometry {
            size: self.size,
            erase_size: self.erase_size,
        }
    }

    /// Whether the device accepts writes
    pub fn is_writeable(&self) -> bool {
        self.flags.contains(DeviceFlags::WRITEABLE)
    }

    /// Whether the device needs erase before write
    pub fn requires_erase(&self) -> bool {
        !self.flags.contains(DeviceFlags::NO_ERASE)
    }
}
