//! The three operations offered to the operator.
//!
//! Questions go through [`Operator`] so the same code runs against a terminal
//! or against scripted answers.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, Write};
use std::path::Path;
use std::str::FromStr;
use tracing::info;

use crate::apa::{self, ApaHeader, ChecksumOutcome, SECTOR_SIZE};
use crate::backend::{DiskBackend, FormatOptions};
use crate::layout::{LayoutLimits, PartitionPlan};
use crate::mbr::MbrSector;
use crate::{Error, Result};

/// The literal answer that confirms partition creation.
pub const CONFIRMATION: &str = "YES";

/// Whoever answers the questions of an action.
pub trait Operator {
    /// Ask a question and return the answer without its line terminator.
    fn ask(&mut self, question: &str) -> io::Result<String>;

    /// Show a line of information.
    fn tell(&mut self, message: &str);
}

/// An action of the menu.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Recompute the checksum of an APA header
    FixChecksum,
    /// Write the two-partition MBR and format the exFAT partition
    CreatePartitions,
    /// Open the jail of the last partition
    UpdateJail,
}

impl Action {
    /// The menu shown to the operator.
    pub const MENU: &'static str =
        "Choose action: 1) Fix checksum 2) Create partitions 3) Update jail partition: ";
}

impl FromStr for Action {
    type Err = Error;

    fn from_str(s: &str) -> Result<Action> {
        match s.trim() {
            "1" => Ok(Action::FixChecksum),
            "2" => Ok(Action::CreatePartitions),
            "3" => Ok(Action::UpdateJail),
            other => Err(Error::InvalidInput(format!("invalid selection {:?}", other))),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Action::FixChecksum => "fix checksum",
            Action::CreatePartitions => "create partitions",
            Action::UpdateJail => "update jail partition",
        })
    }
}

/// How an action ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The action ran to the end
    Done,
    /// The operator declined and nothing was written
    Aborted,
}

/// Parse a sector offset typed in hexadecimal, with or without `0x`. An empty answer is 0.
pub fn parse_sector_offset(input: &str) -> Result<u64> {
    let input = input.trim();
    if input.is_empty() {
        return Ok(0);
    }
    let digits = input
        .strip_prefix("0x")
        .or_else(|| input.strip_prefix("0X"))
        .unwrap_or(input);

    u64::from_str_radix(digits, 16)
        .map_err(|_| Error::InvalidInput(format!("{:?} is not a hexadecimal sector offset", input)))
}

/// Parse a reserved partition size in GB. An empty answer keeps the default.
pub fn parse_reserved_size(input: &str) -> Result<Option<u64>> {
    let input = input.trim();
    if input.is_empty() {
        return Ok(None);
    }

    input
        .parse()
        .map(Some)
        .map_err(|_| Error::InvalidInput(format!("{:?} is not a size in GB", input)))
}

/// Open a device for reading and writing.
pub fn open_device(path: &Path) -> Result<File> {
    Ok(OpenOptions::new().read(true).write(true).open(path)?)
}

/// Run `action` on the device at `path`.
pub fn run<B, O>(action: Action, path: &Path, backend: &B, operator: &mut O) -> Result<Completion>
where
    B: DiskBackend + ?Sized,
    O: Operator + ?Sized,
{
    match action {
        Action::FixChecksum => {
            fix_checksum(&mut open_device(path)?, operator)?;
            Ok(Completion::Done)
        }
        Action::CreatePartitions => create_partitions(path, backend, operator),
        Action::UpdateJail => {
            update_jail(&mut open_device(path)?, operator)?;
            Ok(Completion::Done)
        }
    }
}

/// Ask for a header location and fix the checksum of the header found there.
pub fn fix_checksum<D, O>(device: &mut D, operator: &mut O) -> Result<ChecksumOutcome>
where
    D: Read + Write + Seek,
    O: Operator + ?Sized,
{
    let answer = operator.ask(
        "Enter LBA offset in 512-byte sectors (default is 0, hex format like 0x1400000): ",
    )?;
    let sectors = parse_sector_offset(&answer)?;
    let offset = sectors
        .checked_mul(SECTOR_SIZE as u64)
        .ok_or_else(|| Error::InvalidInput(format!("sector offset {:#x} is too large", sectors)))?;

    let outcome = apa::fix_checksum(device, offset)?;
    operator.tell(match outcome {
        ChecksumOutcome::AlreadyCorrect(_) => "APA Checksum is already correct.",
        ChecksumOutcome::Updated { .. } => "APA Checksum updated.",
    });

    Ok(outcome)
}

/// Ask for the size of the reserved partition and for confirmation, then build the plan.
/// `Ok(None)` means the operator did not confirm.
pub fn plan_partitions<O>(
    total_sectors: u64,
    limits: &LayoutLimits,
    operator: &mut O,
) -> Result<Option<PartitionPlan>>
where
    O: Operator + ?Sized,
{
    let device_gb = LayoutLimits::device_gb(total_sectors);
    operator.tell(&format!("Detected HDD size: {}GB", device_gb));
    limits.check_device(device_gb)?;

    let default = limits.plan(total_sectors, None)?;
    operator.tell(&format!(
        "Default PS2 Partition: {}GB (Type {:#04x})",
        default.reserved_gb, limits.reserved_type
    ));
    operator.tell(&format!(
        "Default ExFAT Partition: {}GB (Type {:#04x})",
        default.general_gb, limits.general_type
    ));

    let answer = operator.ask(&format!(
        "Enter PS2 partition size in GB ({}-{}), default is {}: ",
        limits.min_reserved_gb,
        limits.max_reserved_gb(device_gb),
        default.reserved_gb
    ))?;
    let plan = match parse_reserved_size(&answer)? {
        None => default,
        requested => limits.plan(total_sectors, requested)?,
    };

    operator.tell(&format!(
        "PS2 Partition: {}GB (Type {:#04x})",
        plan.reserved_gb, plan.reserved.sys
    ));
    operator.tell(&format!(
        "ExFAT Partition: {}GB (Type {:#04x})",
        plan.general_gb, plan.general.sys
    ));
    let answer = operator.ask(&format!(
        "Confirm partition creation? Type '{}' to proceed: ",
        CONFIRMATION
    ))?;
    if answer != CONFIRMATION {
        operator.tell("Operation aborted.");
        return Ok(None);
    }

    Ok(Some(plan))
}

/// Write the partitions of `plan` into the first sector of a device carrying an APA
/// disk header.
pub fn write_partition_table<D>(device: &mut D, plan: &PartitionPlan) -> Result<()>
where
    D: Read + Write + Seek,
{
    ApaHeader::read_from(device, 0)?.validate(0)?;

    let mut mbr = MbrSector::read_from(device)?;
    mbr.apply(plan)?;
    mbr.write_into(device)?;
    info!(
        "MBR partitions created: #1 LBA {}+{}, #2 LBA {}+{}",
        plan.reserved.starting_lba,
        plan.reserved.sectors,
        plan.general.starting_lba,
        plan.general.sectors
    );

    Ok(())
}

/// Lay out the device, write the MBR, format the exFAT partition and fix the disk
/// header checksum.
pub fn create_partitions<B, O>(path: &Path, backend: &B, operator: &mut O) -> Result<Completion>
where
    B: DiskBackend + ?Sized,
    O: Operator + ?Sized,
{
    let limits = LayoutLimits::PS2;
    {
        let mut device = open_device(path)?;
        ApaHeader::read_from(&mut device, 0)?.validate(0)?;

        let total_sectors = backend.probe_sectors(path)?;
        let plan = match plan_partitions(total_sectors, &limits, operator)? {
            Some(plan) => plan,
            None => return Ok(Completion::Aborted),
        };

        write_partition_table(&mut device, &plan)?;
        device.sync_all()?;
    }
    operator.tell("MBR partitions successfully created.");

    let partition = backend.partition_path(path, 2);
    backend.format_exfat(&partition, &FormatOptions::PS2_EXFAT)?;
    operator.tell("Second partition formatted as exFAT with 32KB cluster size.");

    let mut device = open_device(path)?;
    apa::fix_checksum(&mut device, 0)?;
    device.sync_all()?;

    Ok(Completion::Done)
}

/// Raise the jail field of the partition the disk header points to and fix its checksum.
/// The operator is asked before anything is written; any answer goes on.
pub fn update_jail<D, O>(device: &mut D, operator: &mut O) -> Result<ChecksumOutcome>
where
    D: Read + Write + Seek,
    O: Operator + ?Sized,
{
    let offset = apa::locate_jail(device)?;
    operator.tell(&format!("Jail offset: {:#010x}", offset));
    operator.ask("Continue? ")?;

    let outcome = apa::patch_jail(device, offset)?;
    operator.tell("Jail partition updated and checksum fixed.");

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    #[derive(Default)]
    struct Script {
        answers: VecDeque<&'static str>,
        questions: Vec<String>,
        output: Vec<String>,
    }

    impl Script {
        fn new(answers: &[&'static str]) -> Script {
            Script {
                answers: answers.iter().copied().collect(),
                ..Script::default()
            }
        }
    }

    impl Operator for Script {
        fn ask(&mut self, question: &str) -> io::Result<String> {
            self.questions.push(question.to_string());
            self.answers
                .pop_front()
                .map(str::to_string)
                .ok_or_else(|| io::Error::from(io::ErrorKind::UnexpectedEof))
        }

        fn tell(&mut self, message: &str) {
            self.output.push(message.to_string());
        }
    }

    const GIB: u64 = 1024 * 1024 * 1024 / 512;

    #[test]
    fn parse_actions() {
        assert_eq!("1".parse::<Action>().unwrap(), Action::FixChecksum);
        assert_eq!("2\n".parse::<Action>().unwrap(), Action::CreatePartitions);
        assert_eq!(" 3 ".parse::<Action>().unwrap(), Action::UpdateJail);
        assert!(matches!(
            "4".parse::<Action>(),
            Err(Error::InvalidInput(_))
        ));
        assert!("".parse::<Action>().is_err());
    }

    #[test]
    fn parse_offsets() {
        assert_eq!(parse_sector_offset("").unwrap(), 0);
        assert_eq!(parse_sector_offset("0x1400000").unwrap(), 0x140_0000);
        assert_eq!(parse_sector_offset("1400000\n").unwrap(), 0x140_0000);
        assert_eq!(parse_sector_offset("0XfF").unwrap(), 0xff);
        assert!(matches!(
            parse_sector_offset("0xZZ"),
            Err(Error::InvalidInput(_))
        ));
        assert!(parse_sector_offset("-1").is_err());
    }

    #[test]
    fn parse_sizes() {
        assert_eq!(parse_reserved_size("").unwrap(), None);
        assert_eq!(parse_reserved_size(" 40\n").unwrap(), Some(40));
        assert!(matches!(
            parse_reserved_size("forty"),
            Err(Error::InvalidInput(_))
        ));
        assert!(parse_reserved_size("-20").is_err());
    }

    #[test]
    fn plan_with_default_size() {
        let mut operator = Script::new(&["", "YES"]);
        let plan = plan_partitions(100 * GIB, &LayoutLimits::PS2, &mut operator)
            .unwrap()
            .unwrap();
        assert_eq!(plan.reserved_gb, 99);
        assert_eq!(
            operator.questions[0],
            "Enter PS2 partition size in GB (15-99), default is 99: "
        );
        assert_eq!(operator.output[0], "Detected HDD size: 100GB");
    }

    #[test]
    fn plan_with_chosen_size() {
        let mut operator = Script::new(&["40", "YES"]);
        let plan = plan_partitions(100 * GIB, &LayoutLimits::PS2, &mut operator)
            .unwrap()
            .unwrap();
        assert_eq!(plan.reserved_gb, 40);
        assert_eq!(plan.general_gb, 60);
        assert!(operator
            .output
            .contains(&"PS2 Partition: 40GB (Type 0x42)".to_string()));
    }

    #[test]
    fn plan_needs_literal_yes() {
        for answer in ["yes", "Y", "", "YES please", "YES ", " YES", "YES\t"] {
            let mut operator = Script::new(&["", answer]);
            assert_eq!(
                plan_partitions(100 * GIB, &LayoutLimits::PS2, &mut operator).unwrap(),
                None
            );
            assert_eq!(operator.output.last().unwrap(), "Operation aborted.");
        }

        let mut operator = Script::new(&["", "YES"]);
        assert!(plan_partitions(100 * GIB, &LayoutLimits::PS2, &mut operator)
            .unwrap()
            .is_some());
    }

    #[test]
    fn plan_rejects_bad_sizes() {
        let mut operator = Script::new(&["abc"]);
        assert!(matches!(
            plan_partitions(100 * GIB, &LayoutLimits::PS2, &mut operator),
            Err(Error::InvalidInput(_))
        ));

        let mut operator = Script::new(&["100"]);
        assert!(matches!(
            plan_partitions(100 * GIB, &LayoutLimits::PS2, &mut operator),
            Err(Error::ReservedSizeOutOfRange { .. })
        ));
        // NOTE: the confirmation is never asked
        assert_eq!(operator.questions.len(), 1);
    }

    #[test]
    fn plan_small_device_asks_nothing() {
        let mut operator = Script::new(&[]);
        assert!(matches!(
            plan_partitions(10 * GIB, &LayoutLimits::PS2, &mut operator),
            Err(Error::DeviceTooSmall { .. })
        ));
        assert!(operator.questions.is_empty());
    }
}
