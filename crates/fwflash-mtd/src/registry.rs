//! Device table
//!
//! Registered devices get the lowest free device number. Registering a
//! device together with a partition list registers only the partitions;
//! the master itself stays hidden and is reached through them.

use crate::error::{RegistryError, Result};
use crate::handle::MtdHandle;
use crate::partition::{validate_partitions, Partition, PartitionDevice};
use fwflash_core::device::StorageDevice;
use log::{debug, info};
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Identifies one registration: a device and the partitions carved from it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegistrationId(u64);

impl fmt::Display for RegistrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

pub(crate) struct Entry {
    pub(crate) index: usize,
    pub(crate) registration: RegistrationId,
    pub(crate) device: Arc<dyn StorageDevice>,
}

struct Table {
    slots: Vec<Option<Arc<Entry>>>,
    next_registration: u64,
}

impl Table {
    fn entries(&self) -> impl Iterator<Item = &Arc<Entry>> {
        self.slots.iter().flatten()
    }

    fn free_index(&self) -> usize {
        self.slots
            .iter()
            .position(Option::is_none)
            .unwrap_or(self.slots.len())
    }

    fn insert(&mut self, entry: Entry) {
        let index = entry.index;
        if index == self.slots.len() {
            self.slots.push(Some(Arc::new(entry)));
        } else {
            self.slots[index] = Some(Arc::new(entry));
        }
    }
}

/// Table of registered storage devices
pub struct StorageRegistry {
    table: RwLock<Table>,
}

impl StorageRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            table: RwLock::new(Table {
                slots: Vec::new(),
                next_registration: 0,
            }),
        }
    }

    /// Register `device`, or the given partitions of it
    ///
    /// With an empty partition list the device itself is registered.
    /// Otherwise each partition becomes a device of its own and the master
    /// is not listed.
    ///
    /// # Errors
    /// * `DuplicateName` - a device of the same name already exists
    /// * partition errors from [`validate_partitions`]
    pub fn register(
        &self,
        device: Arc<dyn StorageDevice>,
        partitions: &[Partition],
    ) -> Result<RegistrationId> {
        let devices: Vec<Arc<dyn StorageDevice>> = if partitions.is_empty() {
            vec![device]
        } else {
            validate_partitions(device.info(), partitions)?;
            partitions
                .iter()
                .map(|part| {
                    Arc::new(PartitionDevice::new(Arc::clone(&device), part))
                        as Arc<dyn StorageDevice>
                })
                .collect()
        };

        let mut table = self.write_table();
        let mut names: HashSet<&str> = table
            .entries()
            .map(|e| e.device.info().name.as_str())
            .collect();
        for dev in &devices {
            if !names.insert(dev.info().name.as_str()) {
                return Err(RegistryError::DuplicateName(dev.info().name.clone()));
            }
        }
        drop(names);

        let registration = RegistrationId(table.next_registration);
        table.next_registration += 1;

        for dev in devices {
            let index = table.free_index();
            let info = dev.info();
            info!(
                "mtd{}: {} \"{}\" (0x{:x} bytes, erase size 0x{:x})",
                index, info.device_type, info.name, info.size, info.erase_size
            );
            table.insert(Entry {
                index,
                registration,
                device: dev,
            });
        }
        Ok(registration)
    }

    /// Remove every device added by one registration
    ///
    /// Queued device work is waited for first. Returns the number of
    /// devices removed.
    pub fn unregister(&self, registration: RegistrationId) -> Result<usize> {
        let removed: Vec<Arc<Entry>> = {
            let mut table = self.write_table();
            table
                .slots
                .iter_mut()
                .filter(|slot| {
                    slot.as_ref()
                        .is_some_and(|e| e.registration == registration)
                })
                .filter_map(Option::take)
                .collect()
        };
        if removed.is_empty() {
            return Err(RegistryError::NotFound(registration.to_string()));
        }

        for entry in &removed {
            entry.device.sync();
            debug!("mtd{}: removed \"{}\"", entry.index, entry.device.info().name);
        }
        Ok(removed.len())
    }

    /// Device with number `index`
    pub fn get(&self, index: usize) -> Option<MtdHandle> {
        self.read_table()
            .slots
            .get(index)
            .and_then(Option::as_ref)
            .map(|entry| MtdHandle::new(Arc::clone(entry)))
    }

    /// Device named `name`
    pub fn find(&self, name: &str) -> Option<MtdHandle> {
        self.read_table()
            .entries()
            .find(|entry| entry.device.info().name == name)
            .map(|entry| MtdHandle::new(Arc::clone(entry)))
    }

    /// All devices, by number
    pub fn devices(&self) -> Vec<MtdHandle> {
        self.read_table()
            .entries()
            .map(|entry| MtdHandle::new(Arc::clone(entry)))
            .collect()
    }

    /// Registration a device belongs to
    pub fn registration_of(&self, index: usize) -> Option<RegistrationId> {
        self.read_table()
            .slots
            .get(index)
            .and_then(Option::as_ref)
            .map(|entry| entry.registration)
    }

    /// Number of registered devices
    pub fn len(&self) -> usize {
        self.read_table().entries().count()
    }

    /// Whether no device is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read_table(&self) -> RwLockReadGuard<'_, Table> {
        self.table.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_table(&self) -> RwLockWriteGuard<'_, Table> {
        self.table.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for StorageRegistry {
    fn default() -> Self {
        Self::new()
    }
}
