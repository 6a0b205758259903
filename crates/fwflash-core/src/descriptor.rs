//! Hardware description loading
//!
//! Flash chips are described by nodes of a hardware description tree,
//! written as TOML:
//!
//! ```toml
//! [[node]]
//! path = "/ibm,opal/flash@0"
//! name = "flash"
//! compatible = ["ibm,opal-flash"]
//! "ibm,opal-id" = [0]
//! reg = [0x0, 0x4000000]
//! "ibm,flash-block-size" = [0x1000]
//! ```
//!
//! Numeric properties are lists of 32-bit cells, most significant cell
//! first. `reg` holds exactly two cells forming the 64-bit total size.
//!
//! A node that lacks the firmware id, the block size or a well-formed `reg`
//! yields an error; such a device must not be registered at all.

use crate::device::DeviceGeometry;
use crate::firmware::DeviceHandle;
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

/// Compatible string of firmware-managed flash nodes
pub const FIRMWARE_FLASH_COMPATIBLE: &str = "ibm,opal-flash";

/// Property holding the firmware device identifier
pub const PROP_FIRMWARE_ID: &str = "ibm,opal-id";

/// Property holding the erase block size
pub const PROP_BLOCK_SIZE: &str = "ibm,flash-block-size";

/// Property holding the total size
pub const PROP_REG: &str = "reg";

/// Errors while loading device descriptions
#[derive(Debug, Error)]
pub enum DescriptorError {
    /// Reading the description file failed
    #[error("Failed to read description '{path}': {source}")]
    Io {
        /// File path
        path: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// The description is not valid TOML or has the wrong shape
    #[error("Failed to parse description: {0}")]
    Parse(#[from] toml::de::Error),

    /// A required property is absent
    #[error("{node}: no device property '{property}'")]
    MissingProperty {
        /// Node path
        node: String,
        /// Property name
        property: &'static str,
    },

    /// `reg` does not have exactly two cells
    #[error("{node}: couldn't get resource information (reg has {cells} cells, expected 2)")]
    BadReg {
        /// Node path
        node: String,
        /// Number of cells found
        cells: usize,
    },

    /// The described geometry is unusable
    #[error("{node}: invalid geometry: {reason}")]
    InvalidGeometry {
        /// Node path
        node: String,
        /// What is wrong
        reason: &'static str,
    },
}

/// Result type for description loading
pub type Result<T> = std::result::Result<T, DescriptorError>;

/// A parsed hardware description tree
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DescriptionTree {
    /// All nodes, in file order
    #[serde(default, rename = "node")]
    pub nodes: Vec<DeviceNode>,
}

impl DescriptionTree {
    /// Parse a tree from a TOML string
    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Load a tree from a TOML file
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| DescriptorError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::from_toml_str(&content)
    }

    /// Nodes whose `compatible` list contains `compatible`
    pub fn compatible<'a>(&'a self, compatible: &'a str) -> impl Iterator<Item = &'a DeviceNode> {
        self.nodes
            .iter()
            .filter(move |node| node.is_compatible(compatible))
    }
}

/// One node of the description tree
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeviceNode {
    /// Full node path
    pub path: String,
    /// Node name property
    #[serde(default)]
    pub name: Option<String>,
    /// Compatible strings
    #[serde(default)]
    pub compatible: Vec<String>,
    /// Firmware device identifier cells
    #[serde(default, rename = "ibm,opal-id")]
    pub firmware_id: Option<Vec<u32>>,
    /// Resource cells
    #[serde(default)]
    pub reg: Option<Vec<u32>>,
    /// Erase block size cells
    #[serde(default, rename = "ibm,flash-block-size")]
    pub block_size: Option<Vec<u32>>,
}

impl DeviceNode {
    /// Whether this node lists `compatible`
    pub fn is_compatible(&self, compatible: &str) -> bool {
        self.compatible.iter().any(|c| c == compatible)
    }

    /// Name to register the device under
    ///
    /// Falls back to the last path component when the node has no name.
    pub fn device_name(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => self
                .path
                .rsplit('/')
                .next()
                .filter(|s| !s.is_empty())
                .unwrap_or("flash")
                .to_string(),
        }
    }

    /// Extract the flash descriptor of this node
    ///
    /// # Errors
    /// * `MissingProperty` - no firmware id or no block size
    /// * `BadReg` - `reg` missing or not exactly two cells
    /// * `InvalidGeometry` - sizes present but unusable
    pub fn flash_descriptor(&self) -> Result<FlashDescriptor> {
        let id_cells = self
            .firmware_id
            .as_deref()
            .filter(|cells| !cells.is_empty())
            .ok_or_else(|| self.missing(PROP_FIRMWARE_ID))?;
        let handle = DeviceHandle(read_number(id_cells, 1));

        let block_cells = self
            .block_size
            .as_deref()
            .filter(|cells| !cells.is_empty())
            .ok_or_else(|| self.missing(PROP_BLOCK_SIZE))?;

        let reg = self.reg.as_deref().unwrap_or(&[]);
        if reg.len() != 2 {
            return Err(DescriptorError::BadReg {
                node: self.path.clone(),
                cells: reg.len(),
            });
        }

        let geometry = DeviceGeometry {
            size: read_number(reg, 2),
            erase_size: read_number(block_cells, 1) as u32,
        };
        geometry
            .validate()
            .map_err(|reason| DescriptorError::InvalidGeometry {
                node: self.path.clone(),
                reason,
            })?;

        Ok(FlashDescriptor {
            path: self.path.clone(),
            name: self.device_name(),
            handle,
            geometry,
        })
    }

    fn missing(&self, property: &'static str) -> DescriptorError {
        DescriptorError::MissingProperty {
            node: self.path.clone(),
            property,
        }
    }
}

/// Everything needed to bring up one firmware flash device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashDescriptor {
    /// Node path the descriptor came from
    pub path: String,
    /// Device name
    pub name: String,
    /// Firmware device identifier
    pub handle: DeviceHandle,
    /// Flash geometry
    pub geometry: DeviceGeometry,
}

/// Combine the first `count` cells into a number, most significant first
fn read_number(cells: &[u32], count: usize) -> u64 {
    cells
        .iter()
        .take(count)
        .fold(0u64, |acc, &cell| (acc << 32) | u64::from(cell))
}
