//! Firmware flash driver binding
//!
//! Binds description-tree nodes compatible with
//! [`FIRMWARE_FLASH_COMPATIBLE`] to [`FirmwareFlash`] devices and registers
//! them. A node whose description is incomplete is not registered at all.

use crate::error::{RegistryError, Result};
use crate::partition::Partition;
use crate::registry::{RegistrationId, StorageRegistry};
use fwflash_core::bridge::AsyncBridge;
use fwflash_core::descriptor::{DescriptionTree, DeviceNode, FIRMWARE_FLASH_COMPATIBLE};
use fwflash_core::device::{EraseMode, FirmwareFlash};
use log::{error, info};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Driver for firmware-managed flash nodes
pub struct FirmwareFlashDriver {
    bridge: Arc<AsyncBridge>,
    registry: Arc<StorageRegistry>,
    erase_mode: EraseMode,
    partitions: Mutex<HashMap<String, Vec<Partition>>>,
    bound: Mutex<HashMap<String, RegistrationId>>,
}

impl FirmwareFlashDriver {
    /// Create a driver registering devices in `registry`
    pub fn new(bridge: Arc<AsyncBridge>, registry: Arc<StorageRegistry>) -> Self {
        Self {
            bridge,
            registry,
            erase_mode: EraseMode::default(),
            partitions: Mutex::new(HashMap::new()),
            bound: Mutex::new(HashMap::new()),
        }
    }

    /// Erase mode for devices created from now on
    pub fn with_erase_mode(mut self, mode: EraseMode) -> Self {
        self.erase_mode = mode;
        self
    }

    /// Whether this driver handles `node`
    pub fn matches(node: &DeviceNode) -> bool {
        node.is_compatible(FIRMWARE_FLASH_COMPATIBLE)
    }

    /// Register the device at `path` as these partitions when it is probed
    pub fn set_partitions(&self, path: impl Into<String>, partitions: Vec<Partition>) {
        lock(&self.partitions).insert(path.into(), partitions);
    }

    /// Bind one node
    ///
    /// # Errors
    /// * `NotCompatible` - the node is not a firmware flash node
    /// * `AlreadyBound` - the node was already probed
    /// * `Descriptor` - the firmware id, block size or `reg` is missing or bad
    /// * registry errors for names or partitions
    pub fn probe(&self, node: &DeviceNode) -> Result<RegistrationId> {
        if !Self::matches(node) {
            return Err(RegistryError::NotCompatible(node.path.clone()));
        }
        if lock(&self.bound).contains_key(&node.path) {
            return Err(RegistryError::AlreadyBound(node.path.clone()));
        }

        let descriptor = node.flash_descriptor()?;
        let flash = FirmwareFlash::new(&descriptor, Arc::clone(&self.bridge))
            .with_erase_mode(self.erase_mode);
        let partitions = lock(&self.partitions)
            .get(&node.path)
            .cloned()
            .unwrap_or_default();

        let id = self.registry.register(Arc::new(flash), &partitions)?;
        lock(&self.bound).insert(node.path.clone(), id);
        info!(
            "{}: firmware flash {} bound as {}",
            node.path, descriptor.handle, descriptor.name
        );
        Ok(id)
    }

    /// Bind every compatible node of `tree`
    ///
    /// Failing nodes are logged and skipped. Returns how many were bound.
    pub fn probe_tree(&self, tree: &DescriptionTree) -> usize {
        tree.compatible(FIRMWARE_FLASH_COMPATIBLE)
            .filter(|node| match self.probe(node) {
                Ok(_) => true,
                Err(e) => {
                    error!("{}: {}", node.path, e);
                    false
                }
            })
            .count()
    }

    /// Unbind the node at `path`, removing its devices
    pub fn remove(&self, path: &str) -> Result<()> {
        let id = lock(&self.bound)
            .remove(path)
            .ok_or_else(|| RegistryError::NotFound(path.to_string()))?;
        self.registry.unregister(id)?;
        info!("{}: unbound", path);
        Ok(())
    }

    /// Unbind every node
    pub fn remove_all(&self) {
        let bound: Vec<String> = lock(&self.bound).keys().cloned().collect();
        for path in bound {
            if let Err(e) = self.remove(&path) {
                error!("{}: {}", path, e);
            }
        }
    }

    /// Paths of bound nodes
    pub fn bound(&self) -> Vec<String> {
        let mut paths: Vec<String> = lock(&self.bound).keys().cloned().collect();
        paths.sort();
        paths
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fwflash_core::context::{AcquirePolicy, AsyncContext, ContextConfig};
    use fwflash_core::descriptor::DescriptorError;
    use fwflash_core::device::{DeviceFlags, DeviceType, EraseRequest, EraseState};
    use fwflash_core::firmware::{DeviceHandle, FirmwareStatus, OperationKind};
    use fwflash_core::StorageError;
    use fwflash_dummy::{DummyConfig, DummyFirmware, Fault};
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    const TREE: &str = r#"
[[node]]
path = "/ibm,opal/flash@0"
name = "pnor"
compatible = ["ibm,opal-flash"]
"ibm,opal-id" = [0]
reg = [0x0, 0x100000]
"ibm,flash-block-size" = [0x1000]

[[node]]
path = "/ibm,opal/flash@1"
compatible = ["ibm,opal-flash"]
reg = [0x0, 0x100000]
"ibm,flash-block-size" = [0x1000]

[[node]]
path = "/ibm,opal/flash@2"
compatible = ["ibm,opal-flash"]
"ibm,opal-id" = [2]
reg = [0x0, 0x10000]
"ibm,flash-block-size" = [0x1000]

[[node]]
path = "/ibm,opal/rtc"
compatible = ["ibm,opal-rtc"]
"#;

    struct Rig {
        ctx: Arc<AsyncContext>,
        firmware: Arc<DummyFirmware>,
        registry: Arc<StorageRegistry>,
        driver: FirmwareFlashDriver,
        tree: DescriptionTree,
    }

    fn rig_with(config: ContextConfig, dummy: DummyConfig) -> Rig {
        let ctx = AsyncContext::new(config);
        let firmware = Arc::new(DummyFirmware::new(dummy, ctx.completion_sender()));
        let pattern: Vec<u8> = (0..0x100000u32 / 4)
            .flat_map(|w| (w * 4).to_le_bytes())
            .collect();
        firmware.add_chip_with_data(DeviceHandle(0), 0x1000, pattern);
        firmware.add_chip(DeviceHandle(2), 0x10000, 0x1000);

        let bridge = Arc::new(AsyncBridge::new(Arc::clone(&ctx), firmware.clone()));
        let registry = Arc::new(StorageRegistry::new());
        let driver = FirmwareFlashDriver::new(bridge, Arc::clone(&registry));
        let tree = DescriptionTree::from_toml_str(TREE).unwrap();
        Rig {
            ctx,
            firmware,
            registry,
            driver,
            tree,
        }
    }

    fn rig() -> Rig {
        rig_with(ContextConfig::default(), DummyConfig::default())
    }

    fn assert_balanced(ctx: &AsyncContext) {
        let tokens = ctx.token_stats();
        assert_eq!(tokens.acquired, tokens.released);
        assert_eq!(tokens.outstanding, 0);
        assert_eq!(ctx.channel_stats().pending, 0);
    }

    #[test]
    fn test_probe_tree_skips_incomplete_nodes() {
        let rig = rig();
        assert_eq!(rig.driver.probe_tree(&rig.tree), 2);
        assert_eq!(rig.registry.len(), 2);
        assert_eq!(
            rig.driver.bound(),
            ["/ibm,opal/flash@0", "/ibm,opal/flash@2"]
        );

        let pnor = rig.registry.find("pnor").unwrap();
        let info = pnor.info();
        assert_eq!(info.device_type, DeviceType::NandFlash);
        assert_eq!(info.flags, DeviceFlags::CAP_NANDFLASH);
        assert_eq!(info.size, 0x100000);
        assert_eq!(info.write_size, 1);
        assert!(rig.registry.find("flash@2").is_some());
    }

    #[test]
    fn test_probe_missing_firmware_id() {
        let rig = rig();
        let err = rig.driver.probe(&rig.tree.nodes[1]).unwrap_err();
        assert!(matches!(
            err,
            RegistryError::Descriptor(DescriptorError::MissingProperty { .. })
        ));
        assert!(rig.registry.is_empty());
    }

    #[test]
    fn test_probe_incompatible_and_rebind() {
        let rig = rig();
        assert!(matches!(
            rig.driver.probe(&rig.tree.nodes[3]),
            Err(RegistryError::NotCompatible(_))
        ));
        rig.driver.probe(&rig.tree.nodes[0]).unwrap();
        assert!(matches!(
            rig.driver.probe(&rig.tree.nodes[0]),
            Err(RegistryError::AlreadyBound(_))
        ));
    }

    #[test]
    fn test_remove() {
        let rig = rig();
        rig.driver.probe_tree(&rig.tree);
        rig.driver.remove("/ibm,opal/flash@0").unwrap();
        assert!(rig.registry.find("pnor").is_none());
        assert!(matches!(
            rig.driver.remove("/ibm,opal/flash@0"),
            Err(RegistryError::NotFound(_))
        ));
        rig.driver.remove_all();
        assert!(rig.registry.is_empty());
    }

    #[test]
    fn test_partitions_through_firmware() {
        let rig = rig();
        rig.driver.set_partitions(
            "/ibm,opal/flash@0",
            vec![
                Partition::new("boot", 0, 0x8000),
                Partition::new("nvram", 0x8000, 0x8000),
            ],
        );
        rig.driver.probe(&rig.tree.nodes[0]).unwrap();
        assert!(rig.registry.find("pnor").is_none());

        let nvram = rig.registry.find("nvram").unwrap();
        assert_eq!(&nvram.read_to_vec(0, 4).unwrap(), &0x8000u32.to_le_bytes());

        nvram.erase_wait(0x1000, 0x1000).unwrap();
        nvram.write(0x1000, b"nvram").unwrap();
        let chip = rig.firmware.chip_data(DeviceHandle(0)).unwrap();
        assert_eq!(&chip[0x9000..0x9005], b"nvram");
        assert!(chip[0x9005..0xA000].iter().all(|&b| b == 0xFF));
        assert_balanced(&rig.ctx);
    }

    #[test]
    fn test_erase_failure_through_registry() {
        let rig = rig();
        rig.driver.probe_tree(&rig.tree);
        rig.firmware
            .inject(Fault::reject(FirmwareStatus::BUSY).on(OperationKind::Erase).times(1));

        let pnor = rig.registry.find("pnor").unwrap();
        let (tx, rx) = mpsc::channel();
        let request = EraseRequest::new(0x4000, 0x1000).with_callback(move |r| {
            tx.send((r.state(), r.fail_addr())).unwrap();
        });
        pnor.erase(request).unwrap();
        assert_eq!(rx.recv().unwrap(), (EraseState::Failed, Some(0x4000)));
        assert!(rx.try_recv().is_err());
        assert_eq!(pnor.erase_wait(0x4000, 0x1000), Ok(()));
        assert_balanced(&rig.ctx);
    }

    #[test]
    fn test_deferred_erase_through_registry() {
        let rig = rig();
        let driver = FirmwareFlashDriver::new(
            Arc::new(AsyncBridge::new(Arc::clone(&rig.ctx), rig.firmware.clone())),
            Arc::new(StorageRegistry::new()),
        )
        .with_erase_mode(EraseMode::Deferred);
        driver.probe(&rig.tree.nodes[2]).unwrap();
        let dev = driver.registry.find("flash@2").unwrap();

        dev.write(0, &[0u8; 16]).unwrap();
        assert_eq!(dev.erase_wait(0, 0x1000), Ok(()));
        dev.sync();
        assert_eq!(dev.read_to_vec(0, 16).unwrap(), vec![0xFF; 16]);
        assert_balanced(&rig.ctx);
    }

    #[test]
    fn test_hundred_concurrent_reads() {
        let rig = rig_with(
            ContextConfig {
                tokens: 16,
                acquire: AcquirePolicy::Wait,
            },
            DummyConfig {
                workers: 8,
                latency: Duration::from_micros(100),
            },
        );
        rig.driver.probe_tree(&rig.tree);
        let pnor = rig.registry.find("pnor").unwrap();

        let handles: Vec<_> = (0..100u64)
            .map(|i| {
                let pnor = pnor.clone();
                thread::spawn(move || {
                    let offset = i * 0x2000 + 0x40;
                    (offset, pnor.read_to_vec(offset, 512).unwrap())
                })
            })
            .collect();

        for handle in handles {
            let (offset, data) = handle.join().unwrap();
            assert_eq!(data.len(), 512);
            assert_eq!(&data[..4], &(offset as u32).to_le_bytes());
            assert_eq!(&data[508..], &(offset as u32 + 508).to_le_bytes());
        }
        assert_balanced(&rig.ctx);
    }

    #[test]
    fn test_no_wait_policy_reports_exhaustion() {
        let rig = rig_with(
            ContextConfig {
                tokens: 1,
                acquire: AcquirePolicy::NoWait,
            },
            DummyConfig::default(),
        );
        rig.driver.probe_tree(&rig.tree);
        rig.firmware.inject(Fault::lose().times(1));
        let pnor = rig.registry.find("pnor").unwrap();

        let stuck = {
            let pnor = pnor.clone();
            thread::spawn(move || pnor.read_to_vec(0, 16))
        };
        while rig.ctx.channel_stats().pending == 0 {
            thread::yield_now();
        }

        assert_eq!(pnor.read_to_vec(0, 16), Err(StorageError::NoMemory));

        rig.ctx.shutdown();
        assert_eq!(stuck.join().unwrap(), Err(StorageError::Io));
        assert_balanced(&rig.ctx);
    }
}
