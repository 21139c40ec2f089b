//! The legacy MBR partition table found in the first sector of the device.
//!
//! A PS2 disk keeps its own APA header in sector 0, so this module never
//! rebuilds the sector from scratch: it reads the 512 bytes verbatim,
//! overwrites the partition entries it is told to and stamps the boot
//! signature. Everything else in the sector is written back untouched.

use bincode::serde::{decode_from_slice, encode_into_slice};
use bitvec::prelude::*;
use serde::de;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::io::{Read, Seek, SeekFrom, Write};
use tracing::{debug, warn};

use crate::apa::SECTOR_SIZE;
use crate::layout::PartitionPlan;
use crate::{codec, Error, Result};

const BOOTFLAG_ACTIVE: u8 = 0x80;
const BOOTFLAG_INACTIVE: u8 = 0x00;

/// Byte offset of the first partition entry in the boot sector.
pub const PARTITION_TABLE_OFFSET: usize = 446;
/// Size in bytes of one partition entry.
pub const PARTITION_ENTRY_SIZE: usize = 16;
/// Number of primary partition entries.
pub const PARTITION_ENTRIES: usize = 4;
/// Byte offset of the boot signature.
pub const BOOT_SIGNATURE_OFFSET: usize = 510;
/// The two bytes closing every MBR.
pub const BOOT_SIGNATURE: [u8; 2] = [0x55, 0xaa];

/// The first sector of a device, kept byte for byte.
///
/// # Examples
/// ```
/// let data = vec![0; 4 * 512];
/// let mut cur = std::io::Cursor::new(data);
///
/// let mut mbr = apafix::mbr::MbrSector::read_from(&mut cur)
///     .expect("could not read the boot sector");
/// assert!(!mbr.has_boot_signature());
///
/// mbr.set_boot_signature().unwrap();
/// mbr.write_into(&mut cur).unwrap();
/// assert_eq!(&cur.get_ref()[510..512], &[0x55, 0xaa]);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct MbrSector([u8; SECTOR_SIZE]);

impl MbrSector {
    /// Read the first sector of a device. This operation will seek at the
    /// correct location before reading.
    pub fn read_from<R>(reader: &mut R) -> Result<MbrSector>
    where
        R: Read + Seek,
    {
        let mut bytes = [0_u8; SECTOR_SIZE];
        reader.seek(SeekFrom::Start(0))?;
        reader.read_exact(&mut bytes)?;

        Ok(MbrSector(bytes))
    }

    /// Write the whole sector back to sector 0 in a single write.
    pub fn write_into<W>(&self, writer: &mut W) -> Result<()>
    where
        W: Write + Seek,
    {
        writer.seek(SeekFrom::Start(0))?;
        writer.write_all(&self.0)?;
        writer.flush()?;

        Ok(())
    }

    fn slot(i: usize) -> Result<std::ops::Range<usize>> {
        if !(1..=PARTITION_ENTRIES).contains(&i) {
            return Err(Error::PartitionNotFound);
        }
        let start = PARTITION_TABLE_OFFSET + (i - 1) * PARTITION_ENTRY_SIZE;

        Ok(start..start + PARTITION_ENTRY_SIZE)
    }

    /// Decode the primary partition entry `i`.
    ///
    /// # Remarks
    ///
    ///  -  The partitions start at index 1
    ///  -  Decoding fails if the slot does not hold a valid entry, which is common when the
    ///     sector is an APA header rather than a real MBR
    pub fn entry(&self, i: usize) -> Result<MBRPartitionEntry> {
        let (entry, _) = decode_from_slice(&self.0[MbrSector::slot(i)?], codec())?;

        Ok(entry)
    }

    /// Overwrite the primary partition entry `i`. The partitions start at index 1.
    pub fn set_entry(&mut self, i: usize, entry: &MBRPartitionEntry) -> Result<()> {
        let slot = MbrSector::slot(i)?;
        encode_into_slice(entry, &mut self.0[slot], codec())?;

        Ok(())
    }

    /// Get an iterator over the primary partition entries that decode and are in use. The
    /// index always starts at 1.
    pub fn used_entries(&self) -> impl Iterator<Item = (usize, MBRPartitionEntry)> + '_ {
        (1..=PARTITION_ENTRIES)
            .filter_map(move |i| self.entry(i).ok().map(|entry| (i, entry)))
            .filter(|(_, entry)| entry.is_used())
    }

    /// Returns `true` if the sector ends with `55 AA`.
    pub fn has_boot_signature(&self) -> bool {
        decode_from_slice::<Signature55AA, _>(&self.0[BOOT_SIGNATURE_OFFSET..], codec()).is_ok()
    }

    /// Stamp the boot signature at the end of the sector.
    pub fn set_boot_signature(&mut self) -> Result<()> {
        encode_into_slice(Signature55AA, &mut self.0[BOOT_SIGNATURE_OFFSET..], codec())?;

        Ok(())
    }

    /// Place the two partitions of a plan in slots 1 and 2 and set the boot signature.
    /// Slots 3 and 4 and the rest of the sector are left as they are.
    pub fn apply(&mut self, plan: &PartitionPlan) -> Result<()> {
        for (i, existing) in self.used_entries() {
            warn!(
                "replacing partition #{}: type {:#04x}, start LBA {}, {} sectors",
                i, existing.sys, existing.starting_lba, existing.sectors
            );
        }

        self.set_entry(1, &plan.reserved)?;
        self.set_entry(2, &plan.general)?;
        self.set_boot_signature()?;
        debug!("partition table entries 1 and 2 updated");

        Ok(())
    }
}

/// The `55 AA` boot signature.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Signature55AA;

impl Serialize for Signature55AA {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        BOOT_SIGNATURE.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Signature55AA {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes = <[u8; 2]>::deserialize(deserializer)?;
        if bytes != BOOT_SIGNATURE {
            return Err(de::Error::custom(format!(
                "invalid signature {:?}, expected: {:?}",
                bytes, BOOT_SIGNATURE
            )));
        }

        Ok(Signature55AA)
    }
}

/// An MBR partition entry
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct MBRPartitionEntry {
    /// Boot flag
    #[serde(
        deserialize_with = "bootflag_deserialize",
        serialize_with = "bootflag_serialize"
    )]
    pub boot: bool,
    /// CHS address of the first sector in the partition
    pub first_chs: CHS,
    /// Partition type (file system ID)
    pub sys: u8,
    /// CHS address of the last sector in the partition
    pub last_chs: CHS,
    /// Starting LBA of the partition
    pub starting_lba: u32,
    /// Number of sectors allocated to the partition
    pub sectors: u32,
}

impl MBRPartitionEntry {
    /// Creates an empty partition entry
    ///
    /// # Examples
    /// Basic usage:
    /// ```
    /// let entry = apafix::mbr::MBRPartitionEntry::empty();
    ///
    /// // NOTE: an empty partition entry is considered as not allocated
    /// assert!(entry.is_unused());
    /// ```
    pub fn empty() -> MBRPartitionEntry {
        MBRPartitionEntry {
            boot: false,
            first_chs: CHS::empty(),
            sys: 0,
            last_chs: CHS::empty(),
            starting_lba: 0,
            sectors: 0,
        }
    }

    /// Returns `true` if the partition entry is used (type (sys) != 0)
    pub fn is_used(&self) -> bool {
        self.sys > 0
    }

    /// Returns `true` if the partition entry is not used (type (sys) == 0)
    pub fn is_unused(&self) -> bool {
        !self.is_used()
    }

    /// LBA of the sector right after the partition.
    pub fn ending_lba(&self) -> u64 {
        u64::from(self.starting_lba) + u64::from(self.sectors)
    }
}

fn bootflag_deserialize<'de, D>(deserializer: D) -> std::result::Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let flag: u8 = Deserialize::deserialize(deserializer)?;
    match flag {
        BOOTFLAG_ACTIVE => Ok(true),
        BOOTFLAG_INACTIVE => Ok(false),
        _ => Err(serde::de::Error::custom(format!(
            "Invalid boot flag ({:#04x})",
            flag,
        ))),
    }
}

fn bootflag_serialize<S>(boot: &bool, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match *boot {
        true => serializer.serialize_u8(BOOTFLAG_ACTIVE),
        false => serializer.serialize_u8(BOOTFLAG_INACTIVE),
    }
}

/// A CHS address (cylinder/head/sector)
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct CHS {
    /// Cylinder
    pub cylinder: u16,
    /// Head
    pub head: u8,
    /// Sector
    pub sector: u8,
}

impl CHS {
    /// Creates a new CHS address based on input parameters.
    ///
    /// # Remark
    ///
    /// The values entered in input are not checked.
    pub fn new(cylinder: u16, head: u8, sector: u8) -> CHS {
        CHS {
            cylinder,
            head,
            sector,
        }
    }

    /// Creates an empty CHS addressing (0/0/0).
    ///
    /// # Remark
    ///
    /// This is what you need on recent hardware because CHS is never used.
    pub fn empty() -> CHS {
        CHS {
            cylinder: 0,
            head: 0,
            sector: 0,
        }
    }

    /// The largest address CHS can express (1023/255/63). LBA-only partitions
    /// that end beyond it carry this value.
    pub fn maximum() -> CHS {
        CHS {
            cylinder: 1023,
            head: 255,
            sector: 63,
        }
    }

    /// Check if the CHS address is empty
    pub fn is_empty(self) -> bool {
        self.cylinder == 0 && self.head == 0 && self.sector == 0
    }

    /// Unpack the on-disk form: head, then the two high cylinder bits above a
    /// 6-bit sector, then the low cylinder byte.
    pub fn from_bytes(raw: [u8; 3]) -> CHS {
        let bits = raw.view_bits::<Msb0>();
        let high: u16 = bits[8..10].load_be();
        let low: u16 = bits[16..24].load_be();

        CHS {
            cylinder: (high << 8) | low,
            head: bits[..8].load_be(),
            sector: bits[10..16].load_be(),
        }
    }

    /// Pack the address in its 3-byte on-disk form. Bits beyond the 10-bit
    /// cylinder and the 6-bit sector are dropped.
    pub fn to_bytes(self) -> [u8; 3] {
        let mut raw = [0_u8; 3];
        let bits = raw.view_bits_mut::<Msb0>();
        bits[..8].store_be(self.head);
        bits[8..10].store_be((self.cylinder >> 8) & 0b11);
        bits[10..16].store_be(self.sector & 0b11_1111);
        bits[16..24].store_be(self.cylinder & 0xff);

        raw
    }
}

impl<'de> Deserialize<'de> for CHS {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(CHS::from_bytes(<[u8; 3]>::deserialize(deserializer)?))
    }
}

impl Serialize for CHS {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.to_bytes().serialize(serializer)
    }
}
