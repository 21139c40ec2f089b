//! A library that repairs PS2 APA partition tables and shares a PS2 disk with
//! an exFAT partition.
//!
//! ## Features
//!
//!  *  Verify and fix the checksum of any APA header
//!  *  Lay out a reserved PS2 partition and an exFAT partition in the MBR of an
//!     APA disk, sized from the capacity of the device
//!  *  Raise the jail field of the last APA partition
//!
//! Every write is gated by a check of the APA marker of the header it touches.
//!
//! ## Examples
//!
//! ### Check the disk header of an image
//!
//! ```rust
//! let mut data = vec![0; 4 * 512];
//! data[0x100..0x11f].copy_from_slice(apafix::apa::DISK_MAGIC);
//! let mut cur = std::io::Cursor::new(data);
//!
//! let header = apafix::apa::ApaHeader::read_from(&mut cur, 0)
//!     .expect("could not read the APA header");
//! header.validate(0).expect("not an APA disk");
//!
//! println!("checksum valid: {}", header.is_checksum_valid());
//! ```
//!
//! ### Fix a checksum
//!
//! ```rust
//! let mut data = vec![0; 4 * 512];
//! data[0x100..0x11f].copy_from_slice(apafix::apa::DISK_MAGIC);
//! let mut cur = std::io::Cursor::new(data);
//!
//! // NOTE: only the 4 checksum bytes are written, and only if they are wrong
//! let outcome = apafix::apa::fix_checksum(&mut cur, 0)
//!     .expect("could not fix the checksum");
//! assert!(matches!(outcome, apafix::apa::ChecksumOutcome::Updated { .. }));
//! ```
//!
//! ### Plan and write the partitions
//!
//! ```rust
//! use apafix::layout::LayoutLimits;
//!
//! let mut data = vec![0; 4 * 512];
//! data[0x100..0x11f].copy_from_slice(apafix::apa::DISK_MAGIC);
//! let mut cur = std::io::Cursor::new(data);
//!
//! // a 20GB device, as reported by the disk backend
//! let plan = LayoutLimits::PS2.plan(20 * 1024 * 1024 * 1024 / 512, None)
//!     .expect("device too small");
//! assert_eq!(plan.reserved_gb, 19);
//!
//! apafix::action::write_partition_table(&mut cur, &plan)
//!     .expect("could not write the partition table");
//!
//! // NOTE: the new entries are covered by the disk header checksum
//! apafix::apa::fix_checksum(&mut cur, 0).unwrap();
//! ```

#![deny(missing_docs)]

use std::process::ExitStatus;
use thiserror::Error;

pub mod action;
pub mod apa;
pub mod backend;
pub mod layout;
pub mod mbr;

pub use action::{Action, Completion, Operator};
pub use apa::{compute_checksum, fix_checksum, ApaHeader, ChecksumOutcome};
pub use backend::{DiskBackend, FormatOptions, HostBackend};
pub use layout::{LayoutLimits, PartitionPlan};
pub use mbr::{MBRPartitionEntry, MbrSector, CHS};

/// The result of reading, writing or planning a disk.
pub type Result<T> = std::result::Result<T, Error>;

/// An error
#[derive(Debug, Error)]
pub enum Error {
    /// The operator typed something that could not be used.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// A header buffer is not exactly two sectors long.
    #[error("an APA header is {expected} bytes, got {actual}")]
    InvalidHeaderLength {
        /// Size of a header
        expected: usize,
        /// Size of the buffer
        actual: usize,
    },
    /// The device ends before the header does.
    #[error("the device ends before the APA header at {offset:#x}")]
    TruncatedHeader {
        /// Byte offset of the header
        offset: u64,
    },
    /// The disk-level header does not carry the Sony marker.
    #[error("magic string \"Sony Computer Entertainment Inc\" not found at 0x100")]
    MissingDiskMagic,
    /// A partition header does not carry `APA\0`.
    #[error("magic string \"APA\\0\" not found at {offset:#x} + 4")]
    MissingPartitionMagic {
        /// Byte offset of the header
        offset: u64,
    },
    /// The disk header does not point to another partition header.
    #[error("the disk header does not point to a partition header")]
    InvalidPartitionPointer,
    /// The device is too small for the layout.
    #[error("the device is {size_gb}GB, the minimum is {minimum_gb}GB")]
    DeviceTooSmall {
        /// Size of the device in GB
        size_gb: u64,
        /// Minimum size in GB
        minimum_gb: u64,
    },
    /// The reserved partition size asked for is out of bounds.
    #[error("a reserved partition of {requested}GB is not within {min}-{max}GB")]
    ReservedSizeOutOfRange {
        /// Size asked for in GB
        requested: u64,
        /// Smallest size allowed in GB
        min: u64,
        /// Largest size allowed in GB
        max: u64,
    },
    /// A partition does not fit the 32-bit fields of an MBR entry.
    #[error("exceeded the 32-bit LBA limit of MBR")]
    ExceedsMbrLimit,
    /// An operation that required to find a partition, was unable to find that partition.
    #[error("partition not found")]
    PartitionNotFound,
    /// Nothing could tell the size of the device.
    #[error("could not determine the size of {0}")]
    UnknownDiskSize(String),
    /// The host has no disk backend.
    #[error("unsupported platform: {0}")]
    UnsupportedPlatform(&'static str),
    /// An external tool could not be started.
    #[error("could not run {tool}")]
    ToolLaunch {
        /// Program name
        tool: String,
        /// Launch error
        source: std::io::Error,
    },
    /// An external tool exited with an error.
    #[error("{tool} failed ({status})")]
    ToolFailed {
        /// Program name
        tool: String,
        /// Exit status
        status: ExitStatus,
    },
    /// An external tool printed something unexpected.
    #[error("unexpected output from {tool}: {reason}")]
    ToolOutput {
        /// Program name
        tool: String,
        /// What was wrong with it
        reason: String,
    },
    /// Serialization errors.
    #[error("serialization failed")]
    Serialize(#[from] bincode::error::EncodeError),
    /// Deserialization errors.
    #[error("deserialization failed")]
    Deserialize(#[from] bincode::error::DecodeError),
    /// I/O errors.
    #[error("generic I/O error")]
    Io(#[from] std::io::Error),
}

/// Little-endian, fixed-width integers: the layout of every on-disk structure here.
pub(crate) fn codec() -> impl bincode::config::Config {
    bincode::config::legacy()
}
