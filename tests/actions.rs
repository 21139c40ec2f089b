use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs;
use std::io::{self, Cursor};
use std::path::{Path, PathBuf};

use apafix::action::{self, Action, Completion, Operator};
use apafix::apa::{self, ApaHeader, ChecksumOutcome, HEADER_SIZE, JAIL_MAX};
use apafix::backend::{DiskBackend, FormatOptions};
use apafix::mbr::{MbrSector, CHS};
use apafix::Error;
use tempfile::NamedTempFile;

const GIB_SECTORS: u64 = 1024 * 1024 * 1024 / 512;
const JAIL_SECTOR: u32 = 0x40;

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

/// Reports a fixed size and records what it was asked to format.
struct FakeBackend {
    sectors: u64,
    fail_format: bool,
    formatted: RefCell<Vec<(PathBuf, FormatOptions)>>,
}

impl FakeBackend {
    fn new(sectors: u64) -> FakeBackend {
        FakeBackend {
            sectors,
            fail_format: false,
            formatted: RefCell::new(Vec::new()),
        }
    }
}

impl DiskBackend for FakeBackend {
    fn probe_sectors(&self, _device: &Path) -> apafix::Result<u64> {
        Ok(self.sectors)
    }

    fn partition_path(&self, device: &Path, index: u32) -> PathBuf {
        PathBuf::from(format!("{}-part{}", device.display(), index))
    }

    fn format_exfat(&self, partition: &Path, options: &FormatOptions) -> apafix::Result<()> {
        if self.fail_format {
            return Err(Error::UnsupportedPlatform("fake"));
        }
        self.formatted
            .borrow_mut()
            .push((partition.to_path_buf(), *options));
        Ok(())
    }
}

/// An image with an APA disk header pointing to a partition header at sector 0x40.
fn apa_image() -> Vec<u8> {
    let mut data = vec![0; 0x40 * 512 + 2 * HEADER_SIZE];
    data[0x100..0x11f].copy_from_slice(apa::DISK_MAGIC);
    data[0x0c..0x10].copy_from_slice(&JAIL_SECTOR.to_le_bytes());

    let jail = JAIL_SECTOR as usize * 512;
    data[jail + 4..jail + 8].copy_from_slice(apa::PARTITION_MAGIC);
    data[jail + 0x44..jail + 0x48].copy_from_slice(&7u32.to_le_bytes());
    data
}

fn image_file(data: &[u8]) -> NamedTempFile {
    let file = NamedTempFile::new().unwrap();
    fs::write(file.path(), data).unwrap();
    file
}

fn header_at(data: &[u8], offset: usize) -> ApaHeader {
    ApaHeader::from_bytes(&data[offset..offset + HEADER_SIZE]).unwrap()
}

#[test]
fn create_partitions_on_image() {
    let image = image_file(&apa_image());
    let backend = FakeBackend::new(100 * GIB_SECTORS);
    let mut operator = Script::new(&["", "YES"]);

    let completion =
        action::run(Action::CreatePartitions, image.path(), &backend, &mut operator).unwrap();
    assert_eq!(completion, Completion::Done);

    let data = fs::read(image.path()).unwrap();
    let mbr = MbrSector::read_from(&mut Cursor::new(&data)).unwrap();
    assert!(mbr.has_boot_signature());

    let reserved = mbr.entry(1).unwrap();
    assert_eq!(reserved.sys, 0x42);
    assert_eq!(reserved.starting_lba, 1);
    assert_eq!(reserved.sectors, 193_359_374);
    assert_eq!(reserved.first_chs, CHS::new(0, 0, 2));
    assert_eq!(reserved.last_chs, CHS::maximum());

    let general = mbr.entry(2).unwrap();
    assert_eq!(general.sys, 0x07);
    assert_eq!(general.starting_lba, 193_359_375);
    assert_eq!(general.sectors, 16_355_791);

    assert!(mbr.entry(3).unwrap().is_unused());
    assert!(mbr.entry(4).unwrap().is_unused());

    let disk = header_at(&data, 0);
    assert!(disk.has_disk_magic());
    assert!(disk.is_checksum_valid());

    let formatted = backend.formatted.borrow();
    assert_eq!(formatted.len(), 1);
    assert_eq!(
        formatted[0].0,
        PathBuf::from(format!("{}-part2", image.path().display()))
    );
    assert_eq!(formatted[0].1, FormatOptions::PS2_EXFAT);
}

#[test]
fn declined_confirmation_writes_nothing() {
    let original = apa_image();
    let image = image_file(&original);
    let backend = FakeBackend::new(100 * GIB_SECTORS);
    let mut operator = Script::new(&["40", "no"]);

    let completion =
        action::run(Action::CreatePartitions, image.path(), &backend, &mut operator).unwrap();
    assert_eq!(completion, Completion::Aborted);
    assert_eq!(operator.output.last().unwrap(), "Operation aborted.");

    assert_eq!(fs::read(image.path()).unwrap(), original);
    assert!(backend.formatted.borrow().is_empty());
}

#[test]
fn failed_format_leaves_checksum_stale() {
    let image = image_file(&apa_image());
    let mut backend = FakeBackend::new(20 * GIB_SECTORS);
    backend.fail_format = true;
    let mut operator = Script::new(&["", "YES"]);

    let result = action::run(Action::CreatePartitions, image.path(), &backend, &mut operator);
    assert!(matches!(result, Err(Error::UnsupportedPlatform("fake"))));

    let data = fs::read(image.path()).unwrap();
    let mbr = MbrSector::read_from(&mut Cursor::new(&data)).unwrap();
    assert_eq!(mbr.entry(1).unwrap().sys, 0x42);
    assert!(!header_at(&data, 0).is_checksum_valid());
}

#[test]
fn create_partitions_needs_apa_disk() {
    let original = vec![0; 4 * HEADER_SIZE];
    let image = image_file(&original);
    let backend = FakeBackend::new(100 * GIB_SECTORS);
    let mut operator = Script::new(&["", "YES"]);

    let result = action::run(Action::CreatePartitions, image.path(), &backend, &mut operator);
    assert!(matches!(result, Err(Error::MissingDiskMagic)));
    assert!(operator.questions.is_empty());
    assert_eq!(fs::read(image.path()).unwrap(), original);
}

#[test]
fn fix_checksum_at_sector_offset() {
    let image = image_file(&apa_image());
    let backend = FakeBackend::new(0);
    let mut operator = Script::new(&["0x40"]);

    action::run(Action::FixChecksum, image.path(), &backend, &mut operator).unwrap();
    assert_eq!(operator.output, ["APA Checksum updated."]);

    let data = fs::read(image.path()).unwrap();
    assert!(header_at(&data, JAIL_SECTOR as usize * 512).is_checksum_valid());
    assert!(!header_at(&data, 0).is_checksum_valid());

    let mut operator = Script::new(&["40"]);
    action::run(Action::FixChecksum, image.path(), &backend, &mut operator).unwrap();
    assert_eq!(operator.output, ["APA Checksum is already correct."]);
}

#[test]
fn fix_checksum_rejects_bad_offset() {
    let original = apa_image();
    let image = image_file(&original);
    let backend = FakeBackend::new(0);

    let mut operator = Script::new(&["0xnope"]);
    let result = action::run(Action::FixChecksum, image.path(), &backend, &mut operator);
    assert!(matches!(result, Err(Error::InvalidInput(_))));

    // no APA marker at sector 1
    let mut operator = Script::new(&["1"]);
    let result = action::run(Action::FixChecksum, image.path(), &backend, &mut operator);
    assert!(matches!(
        result,
        Err(Error::MissingPartitionMagic { offset: 512 })
    ));

    assert_eq!(fs::read(image.path()).unwrap(), original);
}

#[test]
fn update_jail_on_image() {
    let image = image_file(&apa_image());
    let backend = FakeBackend::new(0);
    let mut operator = Script::new(&[""]);

    action::run(Action::UpdateJail, image.path(), &backend, &mut operator).unwrap();
    assert_eq!(operator.output[0], "Jail offset: 0x00008000");
    assert_eq!(operator.questions, ["Continue? "]);

    let data = fs::read(image.path()).unwrap();
    let jail = header_at(&data, JAIL_SECTOR as usize * 512);
    assert_eq!(jail.jail(), JAIL_MAX);
    assert!(jail.is_checksum_valid());

    let mut device = Cursor::new(data);
    assert!(matches!(
        action::update_jail(&mut device, &mut Script::new(&["y"])).unwrap(),
        ChecksumOutcome::AlreadyCorrect(_)
    ));
}

#[test]
fn update_jail_needs_partition_marker() {
    let mut original = apa_image();
    original[JAIL_SECTOR as usize * 512 + 4] = b'X';
    let image = image_file(&original);
    let backend = FakeBackend::new(0);
    let mut operator = Script::new(&[""]);

    let result = action::run(Action::UpdateJail, image.path(), &backend, &mut operator);
    assert!(matches!(
        result,
        Err(Error::MissingPartitionMagic { offset: 0x8000 })
    ));
    assert!(operator.questions.is_empty());
    assert_eq!(fs::read(image.path()).unwrap(), original);
}
