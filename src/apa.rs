//! APA header sector pairs.
//!
//! Every APA partition starts with a 1024-byte header whose first word is a
//! checksum over the 255 words that follow it. The header at sector 0 also
//! describes the whole disk and carries the Sony marker at 0x100; the headers
//! of the other partitions carry `APA\0` right after the checksum.

use bincode::serde::{decode_from_slice, encode_into_slice, encode_into_std_write};
use serde::{Deserialize, Serialize};
use serde_big_array::BigArray;
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use tracing::{debug, info};

use crate::{codec, Error, Result};

/// Size of a sector in bytes.
pub const SECTOR_SIZE: usize = 512;
/// Size of an APA header: two sectors.
pub const HEADER_SIZE: usize = 2 * SECTOR_SIZE;
/// Number of 32-bit words in an APA header.
pub const HEADER_WORDS: usize = HEADER_SIZE / 4;
/// Marker of the disk-level header.
pub const DISK_MAGIC: &[u8; 31] = b"Sony Computer Entertainment Inc";
/// Byte offset of [`DISK_MAGIC`] in the disk-level header.
pub const DISK_MAGIC_OFFSET: usize = 0x100;
/// Marker of a partition header.
pub const PARTITION_MAGIC: &[u8; 4] = b"APA\0";
/// Byte offset of [`PARTITION_MAGIC`] in a partition header.
pub const PARTITION_MAGIC_OFFSET: usize = 4;
/// Byte offset of the sector pointer to the previous partition header.
pub const PREV_OFFSET: usize = 0x0c;
/// Byte offset of the jail field.
pub const JAIL_OFFSET: usize = 0x44;
/// Largest 28-bit value, written to the jail field.
pub const JAIL_MAX: u32 = (1 << 28) - 1;

/// Compute the checksum of a header: the wrapping sum of the little-endian words 1 to 255.
/// Word 0, where the checksum is stored, does not take part.
///
/// # Examples
/// ```
/// let mut header = [0_u8; apafix::apa::HEADER_SIZE];
/// header[7] = 1;
/// header[1020] = 2;
/// assert_eq!(apafix::apa::compute_checksum(&header), 0x0100_0002);
///
/// header[0] = 0xff;
/// assert_eq!(apafix::apa::compute_checksum(&header), 0x0100_0002);
/// ```
pub fn compute_checksum(header: &[u8; HEADER_SIZE]) -> u32 {
    header
        .chunks_exact(4)
        .skip(1)
        .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
        .fold(0, u32::wrapping_add)
}

/// What [`fix_checksum`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumOutcome {
    /// The stored checksum matched, nothing was written.
    AlreadyCorrect(u32),
    /// The stored checksum was replaced.
    Updated {
        /// Checksum found on the device
        old: u32,
        /// Checksum written to the device
        new: u32,
    },
}

/// A 1024-byte APA header decoded as 256 little-endian words.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ApaHeader {
    #[serde(with = "BigArray")]
    words: [u32; HEADER_WORDS],
}

impl ApaHeader {
    /// Decode a header. The input must be exactly [`HEADER_SIZE`] bytes long.
    pub fn from_bytes(bytes: &[u8]) -> Result<ApaHeader> {
        if bytes.len() != HEADER_SIZE {
            return Err(Error::InvalidHeaderLength {
                expected: HEADER_SIZE,
                actual: bytes.len(),
            });
        }
        let (header, _) = decode_from_slice(bytes, codec())?;

        Ok(header)
    }

    /// Read the header located at `offset` bytes. This operation will seek at the correct
    /// location before reading.
    pub fn read_from<R>(reader: &mut R, offset: u64) -> Result<ApaHeader>
    where
        R: Read + Seek,
    {
        let mut bytes = [0_u8; HEADER_SIZE];
        reader.seek(SeekFrom::Start(offset))?;
        reader.read_exact(&mut bytes).map_err(|err| match err.kind() {
            ErrorKind::UnexpectedEof => Error::TruncatedHeader { offset },
            _ => Error::Io(err),
        })?;
        debug!("read APA header at {:#x}", offset);

        ApaHeader::from_bytes(&bytes)
    }

    /// Encode the header back to its on-disk form.
    pub fn to_bytes(&self) -> Result<[u8; HEADER_SIZE]> {
        let mut bytes = [0_u8; HEADER_SIZE];
        encode_into_slice(self, &mut bytes, codec())?;

        Ok(bytes)
    }

    fn bytes(&self) -> impl Iterator<Item = u8> + '_ {
        self.words.iter().flat_map(|w| w.to_le_bytes())
    }

    fn word(&self, offset: usize) -> u32 {
        self.words[offset / 4]
    }

    /// The checksum stored in the header.
    pub fn checksum(&self) -> u32 {
        self.words[0]
    }

    /// The checksum the header should carry.
    pub fn compute_checksum(&self) -> u32 {
        self.words[1..].iter().fold(0, |sum, w| sum.wrapping_add(*w))
    }

    /// Returns `true` if the stored checksum matches the content.
    pub fn is_checksum_valid(&self) -> bool {
        self.checksum() == self.compute_checksum()
    }

    /// Sector of the previous partition header. In the disk-level header it points to the
    /// last partition of the disk.
    pub fn prev(&self) -> u32 {
        self.word(PREV_OFFSET)
    }

    /// The jail field.
    pub fn jail(&self) -> u32 {
        self.word(JAIL_OFFSET)
    }

    /// Returns `true` if the Sony marker is at 0x100.
    pub fn has_disk_magic(&self) -> bool {
        self.bytes()
            .skip(DISK_MAGIC_OFFSET)
            .take(DISK_MAGIC.len())
            .eq(DISK_MAGIC.iter().copied())
    }

    /// Returns `true` if `APA\0` follows the checksum.
    pub fn has_partition_magic(&self) -> bool {
        self.word(PARTITION_MAGIC_OFFSET) == u32::from_le_bytes(*PARTITION_MAGIC)
    }

    /// Check the marker expected for a header read at `offset`: the Sony marker for the
    /// disk-level header, `APA\0` everywhere else.
    pub fn validate(&self, offset: u64) -> Result<()> {
        if offset == 0 {
            if !self.has_disk_magic() {
                return Err(Error::MissingDiskMagic);
            }
        } else if !self.has_partition_magic() {
            return Err(Error::MissingPartitionMagic { offset });
        }

        Ok(())
    }
}

/// Recompute the checksum of the header at `offset` and write it if it differs from the
/// stored one. Only the 4 checksum bytes are written, and only after the header marker has
/// been validated.
///
/// # Examples
/// ```
/// use apafix::apa::{fix_checksum, ChecksumOutcome, HEADER_SIZE};
///
/// let mut data = vec![0; 2 * HEADER_SIZE];
/// data[HEADER_SIZE + 4..HEADER_SIZE + 8].copy_from_slice(b"APA\0");
/// let mut cur = std::io::Cursor::new(data);
///
/// let outcome = fix_checksum(&mut cur, HEADER_SIZE as u64).unwrap();
/// assert_eq!(outcome, ChecksumOutcome::Updated { old: 0, new: 0x0041_5041 });
///
/// let outcome = fix_checksum(&mut cur, HEADER_SIZE as u64).unwrap();
/// assert_eq!(outcome, ChecksumOutcome::AlreadyCorrect(0x0041_5041));
/// ```
pub fn fix_checksum<D>(device: &mut D, offset: u64) -> Result<ChecksumOutcome>
where
    D: Read + Write + Seek,
{
    let header = ApaHeader::read_from(device, offset)?;
    header.validate(offset)?;

    let old = header.checksum();
    let new = header.compute_checksum();
    if old == new {
        info!("APA checksum at {:#x} is already correct", offset);
        return Ok(ChecksumOutcome::AlreadyCorrect(old));
    }

    info!(
        "fixing APA checksum at {:#x}: {:#010x} -> {:#010x}",
        offset, old, new
    );
    device.seek(SeekFrom::Start(offset))?;
    encode_into_std_write(new, device, codec())?;
    device.flush()?;
    info!("APA checksum updated");

    Ok(ChecksumOutcome::Updated { old, new })
}

/// Find the partition header the disk-level header points to with its `prev` field. Both
/// headers are validated; the byte offset of the partition header is returned.
pub fn locate_jail<R>(device: &mut R) -> Result<u64>
where
    R: Read + Seek,
{
    let disk = ApaHeader::read_from(device, 0)?;
    disk.validate(0)?;

    let offset = u64::from(disk.prev()) * SECTOR_SIZE as u64;
    if offset == 0 {
        return Err(Error::InvalidPartitionPointer);
    }
    info!("jail offset: {:#010x}", offset);

    ApaHeader::read_from(device, offset)?.validate(offset)?;

    Ok(offset)
}

/// Set the jail field of the partition header at `offset` to [`JAIL_MAX`] and refresh the
/// header checksum.
pub fn patch_jail<D>(device: &mut D, offset: u64) -> Result<ChecksumOutcome>
where
    D: Read + Write + Seek,
{
    let header = ApaHeader::read_from(device, offset)?;
    header.validate(offset)?;
    debug!(
        "jail field at {:#x}: {:#010x} -> {:#010x}",
        offset,
        header.jail(),
        JAIL_MAX
    );

    device.seek(SeekFrom::Start(offset + JAIL_OFFSET as u64))?;
    encode_into_std_write(JAIL_MAX, device, codec())?;
    device.flush()?;

    fix_checksum(device, offset)
}
