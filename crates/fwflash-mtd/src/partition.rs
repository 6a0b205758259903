//! Fixed partitions
//!
//! A partition is a window onto a master device. It has its own name and
//! size and shifts every address by its offset before handing the call to
//! the master. Partitions are supplied by the caller at registration time;
//! nothing here reads partition tables from flash.

use crate::error::{RegistryError, Result};
use fwflash_core::device::{
    DeviceFlags, DeviceInfo, EraseOutcome, EraseReport, EraseRequest, StorageDevice,
};
use fwflash_core::StorageResult;
use log::warn;
use std::sync::Arc;

/// A fixed partition of a master device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    /// Partition name
    pub name: String,
    /// Start offset in the master
    pub offset: u64,
    /// Size in bytes
    pub size: u64,
    /// Mask out write access
    pub read_only: bool,
}

impl Partition {
    /// Writeable partition
    pub fn new(name: impl Into<String>, offset: u64, size: u64) -> Self {
        Self {
            name: name.into(),
            offset,
            size,
            read_only: false,
        }
    }

    /// Mark the partition read-only
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// End offset in the master (exclusive)
    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.size)
    }
}

/// Check a partition list against the master it will be carved from
///
/// Partitions must be non-empty, inside the master and must not overlap.
pub fn validate_partitions(master: &DeviceInfo, partitions: &[Partition]) -> Result<()> {
    for part in partitions {
        if part.size == 0 {
            return Err(RegistryError::EmptyPartition(part.name.clone()));
        }
        if part.offset.checked_add(part.size).map_or(true, |end| end > master.size) {
            return Err(RegistryError::PartitionOutOfRange {
                name: part.name.clone(),
                offset: part.offset,
                size: part.size,
                master_size: master.size,
            });
        }
    }

    let mut sorted: Vec<&Partition> = partitions.iter().collect();
    sorted.sort_by_key(|part| part.offset);
    for pair in sorted.windows(2) {
        if pair[0].end() > pair[1].offset {
            return Err(RegistryError::PartitionOverlap {
                first: pair[0].name.clone(),
                second: pair[1].name.clone(),
            });
        }
    }
    Ok(())
}

/// Storage device presenting one partition of a master
pub struct PartitionDevice {
    master: Arc<dyn StorageDevice>,
    offset: u64,
    info: DeviceInfo,
}

impl PartitionDevice {
    /// Carve `part` out of `master`
    ///
    /// A partition that does not start and end on an erase block boundary
    /// is forced read-only.
    pub fn new(master: Arc<dyn StorageDevice>, part: &Partition) -> Self {
        let master_info = master.info();
        let mut flags = master_info.flags;
        if part.read_only {
            flags.remove(DeviceFlags::WRITEABLE);
        }

        let erase_size = u64::from(master_info.erase_size);
        if flags.contains(DeviceFlags::WRITEABLE)
            && (part.offset % erase_size != 0 || part.size % erase_size != 0)
        {
            warn!(
                "partition \"{}\" doesn't start or end on an erase block boundary -- force read-only",
                part.name
            );
            flags.remove(DeviceFlags::WRITEABLE);
        }

        let info = DeviceInfo {
            name: part.name.clone(),
            flags,
            size: part.size,
            ..master_info.clone()
        };
        Self {
            master,
            offset: part.offset,
            info,
        }
    }

    /// Offset of the partition in its master
    pub fn offset(&self) -> u64 {
        self.offset
    }
}

impl StorageDevice for PartitionDevice {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> StorageResult<usize> {
        self.master.read(offset + self.offset, buf)
    }

    fn write(&self, offset: u64, data: &[u8]) -> StorageResult<usize> {
        self.master.write(offset + self.offset, data)
    }

    fn erase(&self, mut request: EraseRequest) -> EraseReport {
        let base = self.offset;
        let mut forwarded = EraseRequest::new(request.addr() + base, request.len());
        if let Some(callback) = request.take_callback() {
            forwarded = forwarded.with_callback(move |master_request| {
                callback(&master_request.rebased(base));
            });
        }

        match self.master.erase(forwarded) {
            EraseReport::Completed(EraseOutcome::Failed { fail_addr }) => {
                EraseReport::Completed(EraseOutcome::Failed {
                    fail_addr: fail_addr.saturating_sub(base),
                })
            }
            report => report,
        }
    }

    fn sync(&self) {
        self.master.sync();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RamDevice;
    use fwflash_core::device::EraseState;
    use std::sync::mpsc;

    fn master() -> Arc<RamDevice> {
        Arc::new(RamDevice::new("master", 0x10000, 0x1000))
    }

    #[test]
    fn test_validate_partitions() {
        let m = master();
        let info = m.info();
        let ok = [
            Partition::new("boot", 0, 0x4000),
            Partition::new("data", 0x4000, 0xC000),
        ];
        assert!(validate_partitions(info, &ok).is_ok());

        let past_end = [Partition::new("big", 0x8000, 0x9000)];
        assert!(matches!(
            validate_partitions(info, &past_end),
            Err(RegistryError::PartitionOutOfRange { .. })
        ));

        let overlap = [
            Partition::new("b", 0x2000, 0x2000),
            Partition::new("a", 0, 0x3000),
        ];
        assert!(matches!(
            validate_partitions(info, &overlap),
            Err(RegistryError::PartitionOverlap { ref first, ref second })
                if first == "a" && second == "b"
        ));

        let empty = [Partition::new("nil", 0, 0)];
        assert!(matches!(
            validate_partitions(info, &empty),
            Err(RegistryError::EmptyPartition(_))
        ));
    }

    #[test]
    fn test_offsets_are_translated() {
        let m = master();
        let part = PartitionDevice::new(m.clone(), &Partition::new("data", 0x4000, 0x4000));
        assert_eq!(part.info().size, 0x4000);
        assert_eq!(part.info().name, "data");

        part.write(0x10, &[0xAA, 0xBB]).unwrap();
        assert_eq!(&m.contents()[0x4010..0x4012], &[0xAA, 0xBB]);

        let mut buf = [0u8; 2];
        part.read(0x10, &mut buf).unwrap();
        assert_eq!(buf, [0xAA, 0xBB]);
    }

    #[test]
    fn test_erase_reports_partition_addresses() {
        let m = master();
        m.fail_erases_at(0x5000);
        let part = PartitionDevice::new(m.clone(), &Partition::new("data", 0x4000, 0x4000));

        let (tx, rx) = mpsc::channel();
        let request = EraseRequest::new(0x1000, 0x1000).with_callback(move |r| {
            tx.send((r.addr(), r.state(), r.fail_addr())).unwrap();
        });
        let report = part.erase(request);

        assert_eq!(
            report,
            EraseReport::Completed(EraseOutcome::Failed { fail_addr: 0x1000 })
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            (0x1000, EraseState::Failed, Some(0x1000))
        );
    }

    #[test]
    fn test_misaligned_partition_is_read_only() {
        let m = master();
        let part = PartitionDevice::new(m.clone(), &Partition::new("odd", 0x100, 0x1000));
        assert!(!part.info().is_writeable());

        let masked = PartitionDevice::new(m, &Partition::new("ro", 0, 0x1000).read_only());
        assert!(!masked.info().is_writeable());
    }
}
