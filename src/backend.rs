//! Host-specific access to the device: how big it is, what its partitions are
//! called and how the exFAT partition gets formatted.
//!
//! The host is detected once, at startup, and everything that differs between
//! Linux, macOS and Windows goes through [`HostBackend`].

use std::fs::File;
use std::io::{ErrorKind, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info, warn};

use crate::apa::SECTOR_SIZE;
use crate::{Error, Result};

/// Options passed to the exFAT formatter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatOptions {
    /// Cluster size in bytes
    pub cluster_size: u32,
    /// Volume label
    pub label: &'static str,
}

impl FormatOptions {
    /// 32 KiB clusters, labelled `PS2EXFAT`.
    pub const PS2_EXFAT: FormatOptions = FormatOptions {
        cluster_size: 32 * 1024,
        label: "PS2EXFAT",
    };
}

/// Everything the partitioning action needs from the host.
pub trait DiskBackend {
    /// Size of the device in 512-byte sectors.
    fn probe_sectors(&self, device: &Path) -> Result<u64>;

    /// Device node of partition `index` (starting at 1) of `device`.
    fn partition_path(&self, device: &Path, index: u32) -> PathBuf;

    /// Format `partition` as exFAT. Blocks until the formatter exits.
    fn format_exfat(&self, partition: &Path, options: &FormatOptions) -> Result<()>;
}

/// The disk backend of a host platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostBackend {
    /// `blockdev` and `mkfs.exfat`
    Linux,
    /// `diskutil` and `newfs_exfat`
    MacOs,
    /// PowerShell and `format`
    Windows,
    /// Any other host: every operation fails
    Unsupported(&'static str),
}

impl HostBackend {
    /// The backend of the host the program runs on.
    pub fn detect() -> HostBackend {
        HostBackend::from_os(std::env::consts::OS)
    }

    /// The backend for an OS name as found in `std::env::consts::OS`.
    pub fn from_os(os: &'static str) -> HostBackend {
        match os {
            "linux" => HostBackend::Linux,
            "macos" => HostBackend::MacOs,
            "windows" => HostBackend::Windows,
            other => HostBackend::Unsupported(other),
        }
    }

    fn supported(self) -> Result<()> {
        match self {
            HostBackend::Unsupported(os) => Err(Error::UnsupportedPlatform(os)),
            _ => Ok(()),
        }
    }

    /// The command that reports the size of `device`.
    pub fn size_command(self, device: &Path) -> Result<Command> {
        self.supported()?;
        let command = match self {
            HostBackend::Linux => {
                let mut command = Command::new("blockdev");
                command.arg("--getsz").arg(device);
                command
            }
            HostBackend::MacOs => {
                let mut command = Command::new("diskutil");
                command.arg("info").arg(device);
                command
            }
            _ => {
                let mut command = Command::new("powershell");
                command.args(["-NoProfile", "-NonInteractive", "-Command"]).arg(format!(
                    "(Get-CimInstance Win32_DiskDrive | Where-Object DeviceID -eq '{}').Size",
                    device.display().to_string().replace('\'', "''")
                ));
                command
            }
        };

        Ok(command)
    }

    /// Extract the sector count from the output of [`HostBackend::size_command`].
    pub fn parse_size_output(self, output: &str) -> Result<u64> {
        self.supported()?;
        match self {
            HostBackend::Linux => parse_blockdev_output(output),
            HostBackend::MacOs => parse_diskutil_output(output),
            _ => parse_powershell_output(output),
        }
    }

    /// The command that formats `partition` as exFAT.
    pub fn format_command(self, partition: &Path, options: &FormatOptions) -> Result<Command> {
        self.supported()?;
        let command = match self {
            HostBackend::Linux => {
                let mut command = Command::new("mkfs.exfat");
                command
                    .arg("-c")
                    .arg(format!("{}K", options.cluster_size / 1024))
                    .arg("-L")
                    .arg(options.label)
                    .arg(partition);
                command
            }
            HostBackend::MacOs => {
                let mut command = Command::new("newfs_exfat");
                command
                    .arg("-b")
                    .arg(options.cluster_size.to_string())
                    .arg("-v")
                    .arg(options.label)
                    .arg(partition);
                command
            }
            _ => {
                let mut command = Command::new("format");
                command
                    .arg(partition)
                    .arg("/FS:exFAT")
                    .arg(format!("/A:{}K", options.cluster_size / 1024))
                    .arg(format!("/V:{}", options.label))
                    .args(["/Q", "/Y"]);
                command
            }
        };

        Ok(command)
    }
}

impl DiskBackend for HostBackend {
    fn probe_sectors(&self, device: &Path) -> Result<u64> {
        if let Some(sectors) = probe_direct(device)? {
            info!("sectors: {}", sectors);
            return Ok(sectors);
        }

        let mut command = self.size_command(device)?;
        let output = run_tool(&mut command)?;
        let sectors = self.parse_size_output(&output)?;
        if sectors == 0 {
            return Err(Error::UnknownDiskSize(device.display().to_string()));
        }
        info!("sectors: {}", sectors);

        Ok(sectors)
    }

    fn partition_path(&self, device: &Path, index: u32) -> PathBuf {
        let device = device.as_os_str().to_string_lossy();
        let name = match self {
            HostBackend::MacOs => format!("{}s{}", device, index),
            HostBackend::Linux if device.ends_with(|c: char| c.is_ascii_digit()) => {
                format!("{}p{}", device, index)
            }
            _ => format!("{}{}", device, index),
        };

        PathBuf::from(name)
    }

    fn format_exfat(&self, partition: &Path, options: &FormatOptions) -> Result<()> {
        let mut command = self.format_command(partition, options)?;
        let tool = tool_name(&command);
        info!("formatting {} as exFAT", partition.display());
        debug!("running {:?}", command);

        let status = command
            .status()
            .map_err(|source| Error::ToolLaunch {
                tool: tool.clone(),
                source,
            })?;
        if !status.success() {
            return Err(Error::ToolFailed { tool, status });
        }
        info!(
            "{} formatted as exFAT with a {} byte cluster size",
            partition.display(),
            options.cluster_size
        );

        Ok(())
    }
}

/// Size of a file-backed or mounted device without asking any external tool. `None` means
/// the size could not be read this way and an external tool should be asked.
pub fn probe_direct(device: &Path) -> Result<Option<u64>> {
    if device.is_dir() {
        return probe_mounted(device);
    }

    let bytes = match File::open(device).and_then(|mut f| f.seek(SeekFrom::End(0))) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == ErrorKind::NotFound => return Err(err.into()),
        Err(err) => {
            debug!("cannot size {} as a file: {}", device.display(), err);
            return Ok(None);
        }
    };

    let sectors = bytes / SECTOR_SIZE as u64;
    Ok((sectors > 0).then_some(sectors))
}

#[cfg(unix)]
fn probe_mounted(path: &Path) -> Result<Option<u64>> {
    let stat = rustix::fs::statvfs(path).map_err(std::io::Error::from)?;
    let sectors = filesystem_sectors(path, stat.f_frsize, stat.f_blocks)?;
    debug!("{} is mounted: {} sectors", path.display(), sectors);

    Ok((sectors > 0).then_some(sectors))
}

/// Sectors covered by `blocks` filesystem blocks of `block_size` bytes.
#[cfg(unix)]
fn filesystem_sectors(path: &Path, block_size: u64, blocks: u64) -> Result<u64> {
    block_size
        .checked_mul(blocks)
        .map(|bytes| bytes / SECTOR_SIZE as u64)
        .ok_or_else(|| Error::UnknownDiskSize(path.display().to_string()))
}

#[cfg(not(unix))]
fn probe_mounted(_path: &Path) -> Result<Option<u64>> {
    Ok(None)
}

fn tool_name(command: &Command) -> String {
    command.get_program().to_string_lossy().into_owned()
}

fn run_tool(command: &mut Command) -> Result<String> {
    let tool = tool_name(command);
    debug!("running {:?}", command);

    let output = command.output().map_err(|source| Error::ToolLaunch {
        tool: tool.clone(),
        source,
    })?;
    if !output.status.success() {
        warn!("{}: {}", tool, String::from_utf8_lossy(&output.stderr).trim());
        return Err(Error::ToolFailed {
            tool,
            status: output.status,
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn parse_count(tool: &str, text: &str) -> Result<u64> {
    text.trim().parse().map_err(|_| Error::ToolOutput {
        tool: tool.to_string(),
        reason: format!("{:?} is not a number", text.trim()),
    })
}

/// `blockdev --getsz` prints the size in 512-byte sectors.
pub fn parse_blockdev_output(output: &str) -> Result<u64> {
    parse_count("blockdev", output)
}

/// `diskutil info` prints the size on a line such as
/// `Disk Size: 500.3 GB (500277790720 Bytes) (exactly 977105060 512-Byte-Units)`.
pub fn parse_diskutil_output(output: &str) -> Result<u64> {
    let line = output
        .lines()
        .find(|line| line.contains("Disk Size:"))
        .ok_or_else(|| Error::ToolOutput {
            tool: "diskutil".to_string(),
            reason: "could not find total size".to_string(),
        })?;
    let units = line
        .split_once("exactly")
        .and_then(|(_, rest)| rest.split_once("512-Byte-Units"))
        .map(|(units, _)| units)
        .ok_or_else(|| Error::ToolOutput {
            tool: "diskutil".to_string(),
            reason: format!("no 512-Byte-Units in {:?}", line.trim()),
        })?;

    parse_count("diskutil", units)
}

/// The PowerShell query prints the size in bytes.
pub fn parse_powershell_output(output: &str) -> Result<u64> {
    Ok(parse_count("powershell", output)? / SECTOR_SIZE as u64)
}
