//! Sizing of the two partitions that share the device: the reserved PS2
//! partition at the front and the exFAT partition behind it.

use crate::apa::SECTOR_SIZE;
use crate::mbr::{MBRPartitionEntry, CHS};
use crate::{Error, Result};

/// Bytes in a gigabyte as the device size is reported and bounded.
pub const BINARY_GB: u64 = 1024 * 1024 * 1024;
/// Bytes in a gigabyte as the reserved partition is laid out.
pub const SI_GB: u64 = 1000 * 1000 * 1000;

const FIRST_USABLE_LBA: u32 = 1;

/// Bounds and type codes of the layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutLimits {
    /// Smallest device accepted, in GB
    pub min_device_gb: u64,
    /// Smallest reserved partition, in GB
    pub min_reserved_gb: u64,
    /// Largest reserved partition, in GB
    pub max_reserved_gb: u64,
    /// Sectors left unallocated at the end of the device
    pub tail_sectors: u64,
    /// Partition type of the reserved partition
    pub reserved_type: u8,
    /// Partition type of the general-purpose partition
    pub general_type: u8,
}

impl LayoutLimits {
    /// The layout of a PS2 disk shared with an exFAT partition.
    pub const PS2: LayoutLimits = LayoutLimits {
        min_device_gb: 15,
        min_reserved_gb: 15,
        max_reserved_gb: 128,
        tail_sectors: 34,
        reserved_type: 0x42,
        general_type: 0x07,
    };

    /// Device size in whole (binary) gigabytes.
    pub fn device_gb(total_sectors: u64) -> u64 {
        total_sectors / (BINARY_GB / SECTOR_SIZE as u64)
    }

    /// The reserved size proposed when the operator does not choose one.
    pub fn default_reserved_gb(&self, device_gb: u64) -> u64 {
        device_gb
            .saturating_sub(1)
            .clamp(self.min_reserved_gb, self.max_reserved_gb)
    }

    /// The largest reserved size the operator may choose.
    pub fn max_reserved_gb(&self, device_gb: u64) -> u64 {
        self.max_reserved_gb.min(device_gb.saturating_sub(1))
    }

    /// Fail if the device is below the minimum size.
    pub fn check_device(&self, device_gb: u64) -> Result<()> {
        if device_gb < self.min_device_gb {
            return Err(Error::DeviceTooSmall {
                size_gb: device_gb,
                minimum_gb: self.min_device_gb,
            });
        }

        Ok(())
    }

    /// Lay out a device of `total_sectors`. `reserved_gb` is the size the operator asked for,
    /// `None` takes the default.
    ///
    /// # Examples
    /// ```
    /// use apafix::layout::LayoutLimits;
    ///
    /// let total_sectors = 100 * 1024 * 1024 * 1024 / 512;
    /// let plan = LayoutLimits::PS2.plan(total_sectors, None).unwrap();
    ///
    /// assert_eq!(plan.reserved_gb, 99);
    /// assert_eq!(plan.general_gb, 1);
    /// assert_eq!(u64::from(plan.general.starting_lba), 99 * 1_000_000_000 / 512);
    /// ```
    pub fn plan(&self, total_sectors: u64, reserved_gb: Option<u64>) -> Result<PartitionPlan> {
        let device_gb = LayoutLimits::device_gb(total_sectors);
        self.check_device(device_gb)?;

        let reserved_gb = match reserved_gb {
            None => self.default_reserved_gb(device_gb),
            Some(requested) => {
                let max = self.max_reserved_gb(device_gb);
                if requested < self.min_reserved_gb || requested > max {
                    return Err(Error::ReservedSizeOutOfRange {
                        requested,
                        min: self.min_reserved_gb,
                        max,
                    });
                }
                requested
            }
        };

        // NOTE: the reserved partition is counted in SI gigabytes
        let reserved_lba = reserved_gb * SI_GB / SECTOR_SIZE as u64;
        let general_sectors = total_sectors
            .checked_sub(reserved_lba + self.tail_sectors)
            .ok_or(Error::DeviceTooSmall {
                size_gb: device_gb,
                minimum_gb: reserved_gb,
            })?;

        let reserved_lba = u32::try_from(reserved_lba).map_err(|_| Error::ExceedsMbrLimit)?;
        let general_sectors =
            u32::try_from(general_sectors).map_err(|_| Error::ExceedsMbrLimit)?;

        Ok(PartitionPlan {
            total_sectors,
            device_gb,
            reserved_gb,
            general_gb: device_gb.saturating_sub(reserved_gb),
            reserved: MBRPartitionEntry {
                boot: false,
                first_chs: CHS::new(0, 0, 2),
                sys: self.reserved_type,
                last_chs: CHS::maximum(),
                starting_lba: FIRST_USABLE_LBA,
                sectors: reserved_lba - FIRST_USABLE_LBA,
            },
            general: MBRPartitionEntry {
                boot: false,
                first_chs: CHS::empty(),
                sys: self.general_type,
                last_chs: CHS::empty(),
                starting_lba: reserved_lba,
                sectors: general_sectors,
            },
        })
    }
}

/// Where the two partitions go.
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionPlan {
    /// Device size in sectors
    pub total_sectors: u64,
    /// Device size in binary GB
    pub device_gb: u64,
    /// Reserved partition size in GB
    pub reserved_gb: u64,
    /// What is left for the general-purpose partition, in binary GB
    pub general_gb: u64,
    /// Entry of the reserved partition (slot 1)
    pub reserved: MBRPartitionEntry,
    /// Entry of the general-purpose partition (slot 2)
    pub general: MBRPartitionEntry,
}
