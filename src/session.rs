//! Bring-up and teardown of the flash stack
//!
//! The CLI runs everything in-process: the dummy firmware plays the
//! firmware service, and the registry holds the devices bound from the
//! description tree.

use crate::cli::Cli;
use fwflash_core::bridge::AsyncBridge;
use fwflash_core::context::{AcquirePolicy, AsyncContext, ContextConfig};
use fwflash_core::descriptor::{DescriptionTree, FlashDescriptor, FIRMWARE_FLASH_COMPATIBLE};
use fwflash_dummy::{DummyConfig, DummyFirmware};
use fwflash_mtd::{FirmwareFlashDriver, MtdHandle, StorageRegistry};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Description used when no tree is given
const DEFAULT_TREE: &str = r#"
[[node]]
path = "/ibm,opal/flash@0"
name = "pnor"
compatible = ["ibm,opal-flash"]
"ibm,opal-id" = [0]
reg = [0x0, 0x4000000]
"ibm,flash-block-size" = [0x1000]
"#;

/// Image file attached to one chip
struct Image {
    path: PathBuf,
    descriptor: FlashDescriptor,
}

/// A running flash stack
pub struct Session {
    ctx: Arc<AsyncContext>,
    firmware: Arc<DummyFirmware>,
    registry: Arc<StorageRegistry>,
    driver: FirmwareFlashDriver,
    image: Option<Image>,
}

impl Session {
    /// Start the stack described by the command line
    pub fn open(cli: &Cli) -> Result<Self, Box<dyn std::error::Error>> {
        let tree = match &cli.tree {
            Some(path) => DescriptionTree::from_toml_file(path)?,
            None => DescriptionTree::from_toml_str(DEFAULT_TREE)?,
        };

        if cli.tokens == 0 {
            return Err("At least one async token is required".into());
        }

        let ctx = AsyncContext::new(ContextConfig {
            tokens: cli.tokens,
            acquire: AcquirePolicy::Wait,
        });
        let firmware = Arc::new(DummyFirmware::new(
            DummyConfig {
                workers: cli.workers,
                latency: Duration::ZERO,
            },
            ctx.completion_sender(),
        ));

        // The first chip is backed by the image, if any
        let mut image = None;
        for node in tree.compatible(FIRMWARE_FLASH_COMPATIBLE) {
            let Ok(descriptor) = node.flash_descriptor() else {
                continue;
            };
            let size = descriptor.geometry.size as usize;
            let erase_size = descriptor.geometry.erase_size;

            match (&cli.image, image.is_none()) {
                (Some(path), true) => {
                    let data = load_image(path, size)?;
                    firmware.add_chip_with_data(descriptor.handle, erase_size, data);
                    image = Some(Image {
                        path: path.clone(),
                        descriptor,
                    });
                }
                _ => firmware.add_chip(descriptor.handle, size, erase_size),
            }
        }

        let bridge = Arc::new(AsyncBridge::new(Arc::clone(&ctx), firmware.clone()));
        let registry = Arc::new(StorageRegistry::new());
        let driver = FirmwareFlashDriver::new(bridge, Arc::clone(&registry));

        if !cli.partitions.is_empty() {
            let first = tree
                .compatible(FIRMWARE_FLASH_COMPATIBLE)
                .next()
                .ok_or("No flash node to partition")?;
            driver.set_partitions(first.path.clone(), cli.partitions.clone());
        }

        if driver.probe_tree(&tree) == 0 {
            return Err("No firmware flash devices found".into());
        }

        Ok(Self {
            ctx,
            firmware,
            registry,
            driver,
            image,
        })
    }

    /// The device registry
    pub fn registry(&self) -> &StorageRegistry {
        &self.registry
    }

    /// Look up a device by name or number, or the first device
    pub fn device(&self, name: Option<&str>) -> Result<MtdHandle, Box<dyn std::error::Error>> {
        let found = match name {
            None => self.registry.devices().into_iter().next(),
            Some(name) => self.registry.find(name).or_else(|| {
                name.trim_start_matches("mtd")
                    .parse::<usize>()
                    .ok()
                    .and_then(|index| self.registry.get(index))
            }),
        };
        found.ok_or_else(|| format!("No such device: {}", name.unwrap_or("(any)")).into())
    }

    /// Tear the stack down, saving the image if `save` is set
    pub fn close(self, save: bool) -> Result<(), Box<dyn std::error::Error>> {
        self.driver.remove_all();

        let saved = match (&self.image, save) {
            (Some(image), true) => save_image(&self.firmware, image),
            _ => Ok(()),
        };

        self.ctx.shutdown();
        self.firmware.shutdown();
        saved
    }
}

fn load_image(path: &Path, size: usize) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    let mut data = match std::fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            log::info!("{:?} does not exist, starting from an erased chip", path);
            Vec::new()
        }
        Err(e) => return Err(e.into()),
    };
    if data.len() > size {
        return Err(format!(
            "Image {:?} is {} bytes, larger than the {} byte chip",
            path,
            data.len(),
            size
        )
        .into());
    }
    data.resize(size, 0xFF);
    Ok(data)
}

fn save_image(firmware: &DummyFirmware, image: &Image) -> Result<(), Box<dyn std::error::Error>> {
    let data = firmware
        .chip_data(image.descriptor.handle)
        .ok_or("Image chip disappeared")?;
    std::fs::write(&image.path, &data)?;
    log::info!(
        "Saved {} ({} bytes) to {:?}",
        image.descriptor.name,
        data.len(),
        image.path
    );
    Ok(())
}
