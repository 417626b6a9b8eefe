// Copyright 2026 The hardkey-installer Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Block-device façade: uniform access to raw disks, loop-mapped image
//! files and network-block images, partition-table reading and writing,
//! mounts, and hardware identity.

use anyhow::{anyhow, bail, Context, Result};
use gptman::{GPTPartitionEntry, GPT};
use lazy_static::lazy_static;
use mbrman::{MBRPartitionEntry, BOOT_ACTIVE, BOOT_INACTIVE, CHS, MBR};
use nix::{errno::Errno, mount};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs::{remove_dir, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::raw::c_int;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::str::FromStr;
use std::thread::sleep;
use std::time::Duration;
use uuid::Uuid;

use crate::errors::HardkeyError;
use crate::util::*;

use crate::{runcmd, runcmd_output};

/// Reserved space at the tail of the device, in decimal megabytes, for the
/// appended metadata and signature records.
pub const END_RESERVED_MB: u64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TableKind {
    Dos,
    Gpt,
    Hybrid,
}

impl FromStr for TableKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "dos" | "msdos" => Ok(TableKind::Dos),
            "gpt" => Ok(TableKind::Gpt),
            "hybrid" => Ok(TableKind::Hybrid),
            other => bail!("invalid partition table kind {:?}", other),
        }
    }
}

impl fmt::Display for TableKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TableKind::Dos => f.write_str("dos"),
            TableKind::Gpt => f.write_str("gpt"),
            TableKind::Hybrid => f.write_str("hybrid"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitionType {
    #[serde(rename = "BIOS")]
    Bios,
    #[serde(rename = "EFI")]
    Efi,
    #[serde(rename = "LINUX")]
    Linux,
}

impl PartitionType {
    /// GPT partition type GUID, in the mixed-endian on-disk byte order.
    pub fn gpt_guid(&self) -> [u8; 16] {
        let s = match self {
            // BIOS boot
            PartitionType::Bios => "21686148-6449-6e6f-744e-656564454649",
            // EFI system
            PartitionType::Efi => "c12a7328-f81f-11d2-ba4b-00a0c93ec93b",
            // Linux filesystem
            PartitionType::Linux => "0fc63daf-8483-4772-8e79-3d69d8477de4",
        };
        Uuid::parse_str(s).expect("parsing type GUID").to_bytes_le()
    }

    /// MBR system id; BIOS boot and EFI system have no DOS equivalent.
    pub fn mbr_sys(&self) -> Result<u8> {
        match self {
            PartitionType::Linux => Ok(0x83),
            _ => Err(anyhow!(HardkeyError::InvalidConfig)
                .context(format!("partition type {:?} needs a GPT table", self))),
        }
    }

    fn from_gpt_guid(guid: &[u8; 16]) -> Option<Self> {
        for t in [PartitionType::Bios, PartitionType::Efi, PartitionType::Linux] {
            if &t.gpt_guid() == guid {
                return Some(t);
            }
        }
        None
    }
}

/// Hardware identity embedded in the sealed metadata and the attestation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareId {
    pub model: String,
    pub serial: String,
    #[serde(rename = "size-bytes")]
    pub size_bytes: u64,
}

/// One partition as observed on the device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservedPartition {
    pub number: u32,
    #[serde(rename = "first-sector")]
    pub first_sector: u64,
    #[serde(rename = "last-sector")]
    pub last_sector: u64,
    #[serde(rename = "size-bytes")]
    pub size_bytes: u64,
    #[serde(rename = "type")]
    pub type_tag: Option<PartitionType>,
    pub label: Option<String>,
    pub filesystem: Option<String>,
}

/// The full observed layout of a device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservedLayout {
    pub table: TableKind,
    #[serde(rename = "sector-size")]
    pub sector_size: u64,
    #[serde(rename = "hw-id")]
    pub hardware: HardwareId,
    pub partitions: Vec<ObservedPartition>,
}

/// How the target was attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attachment {
    Direct,
    Loop,
    Nbd,
}

/// A block device under exclusive management.  Image files are transparently
/// mapped through a loop or network-block device at open and unmapped on
/// drop; any partition still mounted at that point is force-unmounted first.
pub struct Disk {
    devfile: PathBuf,
    attachment: Attachment,
    mounts: HashMap<u32, Mount>,
}

impl Disk {
    /// Open a target: a block device path, or a disk image file (raw images
    /// via loop, qcow2 via qemu-nbd).
    pub fn open(target: &Path) -> Result<Self> {
        let canon = target
            .canonicalize()
            .with_context(|| format!("canonicalizing {}", target.display()))?;

        if !canon.starts_with("/dev/") {
            if !canon.exists() {
                bail!("no such device or image file {}", canon.display());
            }
            let qcow = canon
                .extension()
                .map(|e| e == "qcow2")
                .unwrap_or(false);
            let (devfile, attachment) = if qcow {
                (nbd_attach(&canon)?, Attachment::Nbd)
            } else {
                (loop_attach(&canon)?, Attachment::Loop)
            };
            return Ok(Disk {
                devfile,
                attachment,
                mounts: HashMap::new(),
            });
        }

        let name = canon.to_string_lossy();
        let valid = (name.starts_with("/dev/sd") || name.starts_with("/dev/vd"))
            && !name.ends_with(|c: char| c.is_ascii_digit())
            || name.starts_with("/dev/nvme")
            || name.starts_with("/dev/nbd")
            || name.starts_with("/dev/loop")
            || name.starts_with("/dev/mmcblk");
        if !valid {
            return Err(anyhow!(HardkeyError::DeviceUnsupported)
                .context(format!("unsupported device {}", canon.display())));
        }
        if !canon.exists() {
            bail!("no such device {}", canon.display());
        }
        Ok(Disk {
            devfile: canon,
            attachment: Attachment::Direct,
            mounts: HashMap::new(),
        })
    }

    pub fn devfile(&self) -> &Path {
        &self.devfile
    }

    /// Device node of partition `number`, applying the kernel's naming
    /// rules (`/dev/sdb2` vs `/dev/nvme0n1p2` vs `/dev/loop0p2`).
    pub fn partition_path(&self, number: u32) -> PathBuf {
        partition_path(&self.devfile, number)
    }

    pub fn hardware_id(&self) -> Result<HardwareId> {
        let (size_bytes, _) = get_disk_sizes(&self.devfile)?;
        let (model, serial) = if self.attachment == Attachment::Direct {
            (device_model(&self.devfile)?, device_serial(&self.devfile)?)
        } else {
            ("VM image file".to_string(), String::new())
        };
        Ok(HardwareId {
            model,
            serial,
            size_bytes,
        })
    }

    /// Read the current layout: partition table, sector geometry, and
    /// per-partition filesystem info.
    pub fn observed_layout(&self) -> Result<ObservedLayout> {
        let (size_bytes, sector_size) = get_disk_sizes(&self.devfile)?;
        let table = detect_table_kind(&self.devfile)?
            .ok_or_else(|| anyhow!("no partition table on {}", self.devfile.display()))?;

        let mut partitions = Vec::new();
        let mut f = File::open(&self.devfile)
            .with_context(|| format!("opening {}", self.devfile.display()))?;
        match table {
            TableKind::Gpt | TableKind::Hybrid => {
                let gpt = GPT::find_from(&mut f).context("reading GPT")?;
                for (i, p) in gpt.iter().filter(|(_, p)| p.is_used()) {
                    partitions.push(ObservedPartition {
                        number: i,
                        first_sector: p.starting_lba,
                        last_sector: p.ending_lba,
                        size_bytes: (p.ending_lba - p.starting_lba + 1) * sector_size,
                        type_tag: PartitionType::from_gpt_guid(&p.partition_type_guid),
                        label: None,
                        filesystem: None,
                    });
                }
            }
            TableKind::Dos => {
                let mbr = MBR::read_from(&mut f, sector_size as u32).context("reading MBR")?;
                for (i, p) in mbr.iter().filter(|(_, p)| p.is_used()) {
                    partitions.push(ObservedPartition {
                        number: i as u32,
                        first_sector: p.starting_lba as u64,
                        last_sector: p.starting_lba as u64 + p.sectors as u64 - 1,
                        size_bytes: p.sectors as u64 * sector_size,
                        type_tag: match p.sys {
                            0x83 => Some(PartitionType::Linux),
                            _ => None,
                        },
                        label: None,
                        filesystem: None,
                    });
                }
            }
        }
        partitions.sort_by_key(|p| p.first_sector);

        // complement with filesystem types and labels from the kernel
        for part in &mut partitions {
            let path = self.partition_path(part.number);
            if path.exists() {
                let info = probe_block_device(&path)?;
                part.label = info.label;
                part.filesystem = info.fstype;
            }
        }

        Ok(ObservedLayout {
            table,
            sector_size,
            hardware: HardwareId {
                model: if self.attachment == Attachment::Direct {
                    device_model(&self.devfile)?
                } else {
                    "VM image file".to_string()
                },
                serial: if self.attachment == Attachment::Direct {
                    device_serial(&self.devfile)?
                } else {
                    String::new()
                },
                size_bytes,
            },
            partitions,
        })
    }

    /// Refuse to proceed while any partition of this device is mounted or
    /// held; the partition table must not change under a live filesystem.
    pub fn ensure_released(&self) -> Result<()> {
        for info in probe_block_devices(&self.devfile, true)? {
            if let Some(mp) = &info.mountpoint {
                return Err(anyhow!(HardkeyError::DeviceBusy)
                    .context(format!("{} is mounted on {}", info.name, mp)));
            }
        }
        Ok(())
    }

    /// Unmount every partition of the device and close any mapper device
    /// layered on it.  Idempotent: already-unmounted partitions are skipped.
    pub fn unmount_all(&mut self) -> Result<()> {
        self.mounts.clear();

        let mut last_part: Option<String> = None;
        for info in probe_block_devices(&self.devfile, true)? {
            if let Some(mp) = &info.mountpoint {
                if mp != "[SWAP]" {
                    umount_path(Path::new(mp))?;
                }
            }
            if let Some(stripped) = info.name.strip_prefix("/dev/mapper/") {
                if stripped.starts_with("luks") || stripped.starts_with("secluks") {
                    if let Some(part) = &last_part {
                        let vol = crate::encryption::LuksVolume::new(Path::new(part));
                        let _ = crate::encryption::EncryptedVolume::close(&vol);
                    }
                } else if stripped.starts_with("veracrypt") {
                    if let Some(part) = &last_part {
                        let vol = crate::encryption::VeracryptVolume::new(Path::new(part));
                        let _ = crate::encryption::EncryptedVolume::close(&vol);
                    }
                }
            } else {
                last_part = Some(info.name);
            }
        }
        Ok(())
    }

    /// Mount partition `number` (or a mapper device standing in for it).
    /// The mount is tracked and released when the Disk is dropped unless
    /// `persistent` is set.
    pub fn mount_partition(
        &mut self,
        number: u32,
        device_override: Option<&Path>,
        mountpoint: Option<&Path>,
        options: Option<&str>,
        persistent: bool,
    ) -> Result<PathBuf> {
        if let Some(m) = self.mounts.get(&number) {
            return Ok(m.mountpoint().to_path_buf());
        }
        let device = match device_override {
            Some(p) => p.to_path_buf(),
            None => self.partition_path(number),
        };
        crate::filesystem::wait_for_device(&device, Duration::from_secs(10))?;
        let mount = Mount::try_mount(&device, mountpoint, options)?;
        let path = mount.mountpoint().to_path_buf();
        if persistent {
            mount.leak();
        } else {
            self.mounts.insert(number, mount);
        }
        Ok(path)
    }

    pub fn unmount_partition(&mut self, number: u32) -> Result<()> {
        if let Some(mount) = self.mounts.remove(&number) {
            mount.unmount()?;
        }
        Ok(())
    }

    /// Write the ISO file over the leading bytes of the device.
    pub fn write_iso(&mut self, iso: &Path) -> Result<()> {
        self.unmount_all()?;
        let mut src =
            File::open(iso).with_context(|| format!("opening {}", iso.display()))?;
        let mut dest = OpenOptions::new()
            .write(true)
            .open(&self.devfile)
            .with_context(|| format!("opening {}", self.devfile.display()))?;
        let mut buf = vec![0u8; 4 * 1024 * 1024];
        loop {
            let n = src
                .read(&mut buf)
                .with_context(|| format!("reading {}", iso.display()))?;
            if n == 0 {
                break;
            }
            dest.write_all(&buf[..n])
                .with_context(|| format!("writing {}", self.devfile.display()))?;
        }
        dest.sync_all().context("syncing device")?;
        ensure_kernel_sync(&self.devfile)?;
        Ok(())
    }

    /// Install the signed UEFI boot binaries from an xz-compressed tar into
    /// `EFI/boot` of the (mounted) EFI partition.
    pub fn install_boot_loader_uefi(&self, efi_mountpoint: &Path, archive: &Path) -> Result<()> {
        let target = efi_mountpoint.join("EFI/boot");
        std::fs::create_dir_all(&target)
            .with_context(|| format!("creating {}", target.display()))?;
        runcmd!("tar", "-xJf", archive, "-C", &target)?;
        Ok(())
    }

    /// Install the legacy-BIOS boot loader into the (hybrid) MBR; its
    /// support files land on the EFI partition.
    pub fn install_boot_loader_legacy(&self, efi_mountpoint: &Path) -> Result<()> {
        runcmd!(
            "grub-install",
            format!("--root-directory={}", efi_mountpoint.display()),
            "--force",
            "--target=i386-pc",
            &self.devfile
        )?;
        Ok(())
    }

    /// Install the boot-loader configuration tar into both config
    /// directories and point the boot-params file at the live partition's
    /// filesystem UUID.  Returns the directories written.
    pub fn install_boot_loader_configuration(
        &self,
        efi_mountpoint: &Path,
        config_tar: &Path,
        live_partition: u32,
    ) -> Result<Vec<PathBuf>> {
        let live_path = self.partition_path(live_partition);
        let uuid = filesystem_uuid(&live_path)?;

        let dirs = vec![
            efi_mountpoint.join("EFI/debian"),
            efi_mountpoint.join("boot/grub"),
        ];
        for dir in &dirs {
            std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
            runcmd!("tar", "-xf", config_tar, "-C", dir)?;
            std::fs::write(
                dir.join("bootparams.cfg"),
                format!("set bootuuid={}\n", uuid),
            )
            .with_context(|| format!("writing boot params in {}", dir.display()))?;
        }
        Ok(dirs)
    }
}

impl Disk {
    fn detach(&mut self) -> Result<()> {
        match self.attachment {
            Attachment::Direct => Ok(()),
            Attachment::Loop => runcmd!("losetup", "-d", &self.devfile),
            Attachment::Nbd => runcmd!("qemu-nbd", "-d", &self.devfile),
        }
    }
}

impl Drop for Disk {
    fn drop(&mut self) {
        self.mounts.clear();
        if let Err(e) = self.detach() {
            eprintln!("detaching {}: {:#}", self.devfile.display(), e);
        }
    }
}

fn loop_attach(image: &Path) -> Result<PathBuf> {
    let out = runcmd_output!("losetup", "--show", "-f", image)?;
    Ok(PathBuf::from(out.trim()))
}

fn nbd_attach(image: &Path) -> Result<PathBuf> {
    runcmd!("modprobe", "nbd")?;
    // find a free /dev/nbdX by checking its advertised size
    for index in 0..8 {
        let size_path = format!("/sys/class/block/nbd{}/size", index);
        let size = match std::fs::read_to_string(&size_path) {
            Ok(s) => s.trim().parse::<u64>().unwrap_or(1),
            Err(_) => continue,
        };
        if size == 0 {
            let devfile = PathBuf::from(format!("/dev/nbd{}", index));
            runcmd!("qemu-nbd", "-c", &devfile, image)?;
            return Ok(devfile);
        }
    }
    Err(anyhow!(HardkeyError::DeviceBusy).context("no NBD device available"))
}

/// Apply the kernel's partition naming rules.
pub fn partition_path(devfile: &Path, number: u32) -> PathBuf {
    let name = devfile.to_string_lossy();
    if name.ends_with(|c: char| c.is_ascii_digit()) {
        PathBuf::from(format!("{}p{}", name, number))
    } else {
        PathBuf::from(format!("{}{}", name, number))
    }
}

/// Inverse of partition_path.
pub fn partition_number(devfile: &Path, partition: &Path) -> Result<u32> {
    let dev = devfile.to_string_lossy();
    let part = partition.to_string_lossy();
    let suffix = part
        .strip_prefix(dev.as_ref())
        .with_context(|| format!("{} is not a partition of {}", part, dev))?;
    suffix
        .strip_prefix('p')
        .unwrap_or(suffix)
        .parse()
        .with_context(|| format!("parsing partition number from {}", part))
}

/// One row of `lsblk --pairs` output, reduced to the fields this system
/// cares about.  Empty strings collapse to None.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockDevInfo {
    pub name: String,
    pub label: Option<String>,
    pub fstype: Option<String>,
    pub mountpoint: Option<String>,
    pub uuid: Option<String>,
}

impl BlockDevInfo {
    fn from_pairs(pairs: &[(String, String)]) -> Self {
        let mut info = BlockDevInfo::default();
        for (key, value) in pairs {
            let field = match key.as_str() {
                "NAME" => {
                    info.name = value.clone();
                    continue;
                }
                "LABEL" => &mut info.label,
                "FSTYPE" => &mut info.fstype,
                "MOUNTPOINT" => &mut info.mountpoint,
                "UUID" => &mut info.uuid,
                _ => continue,
            };
            if !value.is_empty() {
                *field = Some(value.clone());
            }
        }
        info
    }
}

/// Scan one `KEY="value" KEY="value"` line into pairs.  lsblk escapes any
/// embedded quote as \xNN, so a double quote always terminates the value.
fn scan_pairs(line: &str) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    let mut rest = line;
    while let Some(eq) = rest.find("=\"") {
        let key = rest[..eq].trim().to_string();
        let value_start = eq + 2;
        let len = match rest[value_start..].find('"') {
            Some(len) => len,
            None => break,
        };
        pairs.push((key, rest[value_start..value_start + len].to_string()));
        rest = &rest[value_start + len + 1..];
    }
    pairs
}

/// Query the kernel's view of a device (and, with `with_children`, of the
/// partitions and mapper devices stacked on it).
pub fn probe_block_devices(dev: &Path, with_children: bool) -> Result<Vec<BlockDevInfo>> {
    let mut cmd = Command::new("lsblk");
    cmd.arg("--pairs")
        .arg("--paths")
        .arg("--output")
        .arg("NAME,LABEL,FSTYPE,MOUNTPOINT,UUID");
    if !with_children {
        cmd.arg("--nodeps");
    }
    cmd.arg(dev);
    let out = cmd_output(&mut cmd)?;
    Ok(out
        .lines()
        .map(|line| BlockDevInfo::from_pairs(&scan_pairs(line)))
        .filter(|info| !info.name.is_empty())
        .collect())
}

/// The device itself, without its children.
pub fn probe_block_device(dev: &Path) -> Result<BlockDevInfo> {
    probe_block_devices(dev, false)?
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("lsblk reported nothing for {}", dev.display()))
}

pub fn filesystem_uuid(device: &Path) -> Result<String> {
    probe_block_device(device)?
        .uuid
        .with_context(|| format!("filesystem {} has no UUID", device.display()))
}

pub fn device_serial(devfile: &Path) -> Result<String> {
    let name = devfile.to_string_lossy();
    if name.starts_with("/dev/loop") || name.starts_with("/dev/nbd") {
        return Ok(String::new());
    }
    let out = runcmd_output!("lsblk", "-n", "-d", "-o", "SERIAL", devfile)?;
    Ok(out.trim().to_string())
}

pub fn device_model(devfile: &Path) -> Result<String> {
    let name = devfile.to_string_lossy();
    if name.starts_with("/dev/loop") || name.starts_with("/dev/nbd") {
        return Ok("VM image file".to_string());
    }
    let out = runcmd_output!("lsblk", "-n", "-d", "-P", "-o", "VENDOR,MODEL", devfile)?;
    let pairs = scan_pairs(&out);
    let field = |key: &str| {
        pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
            .unwrap_or("")
    };
    // normalize: distros disagree on padding and separators in these fields
    lazy_static! {
        static ref SEPS: Regex = Regex::new(r"[ _-]+").unwrap();
    }
    let norm = |s: &str| SEPS.replace_all(s.trim(), "").to_lowercase();
    Ok(format!("{} {}", norm(field("VENDOR")), norm(field("MODEL")))
        .trim()
        .to_string())
}

/// Disk size and logical sector size, in bytes.  Plain image files get an
/// imputed 512-byte sector.
pub fn get_disk_sizes(devfile: &Path) -> Result<(u64, u64)> {
    let dev = OpenOptions::new()
        .read(true)
        .open(devfile)
        .with_context(|| format!("opening {}", devfile.display()))?;
    let meta = dev
        .metadata()
        .with_context(|| format!("getting metadata for {}", devfile.display()))?;
    use std::os::unix::fs::FileTypeExt;
    if !meta.file_type().is_block_device() {
        return Ok((meta.len(), 512));
    }

    let fd = dev.as_raw_fd();
    let mut size: libc::size_t = 0;
    unsafe { ioctl::blkgetsize64(fd, &mut size) }
        .with_context(|| format!("querying size of {}", devfile.display()))?;
    let mut sector: c_int = 0;
    unsafe { ioctl::blksszget(fd, &mut sector) }
        .with_context(|| format!("querying sector size of {}", devfile.display()))?;
    if size == 0 || sector <= 0 {
        bail!(
            "kernel reports nonsense geometry for {}: {} bytes, {} per sector",
            devfile.display(),
            size,
            sector
        );
    }
    Ok((size as u64, sector as u64))
}

/// Determine the partition scheme on the device, looking at the MBR entries
/// to tell a plain GPT from a hybrid one.
pub fn detect_table_kind(devfile: &Path) -> Result<Option<TableKind>> {
    let mut f = File::open(devfile).with_context(|| format!("opening {}", devfile.display()))?;
    let gpt = GPT::find_from(&mut f);
    let mut g = File::open(devfile)?;
    let sector_size = match &gpt {
        Ok(gpt) => gpt.sector_size as u32,
        Err(_) => 512,
    };
    let mbr = MBR::read_from(&mut g, sector_size);

    match (gpt, mbr) {
        (Ok(_), Ok(mbr)) => {
            // protective MBR has a single 0xEE entry; anything else real
            // alongside a GPT makes the table hybrid
            let real = mbr
                .iter()
                .filter(|(_, p)| p.is_used() && p.sys != 0xee)
                .count();
            if real > 0 {
                Ok(Some(TableKind::Hybrid))
            } else {
                Ok(Some(TableKind::Gpt))
            }
        }
        (Ok(_), Err(_)) => Ok(Some(TableKind::Gpt)),
        (Err(_), Ok(mbr)) => {
            if mbr.iter().any(|(_, p)| p.is_used()) {
                Ok(Some(TableKind::Dos))
            } else {
                Ok(None)
            }
        }
        (Err(_), Err(_)) => Ok(None),
    }
}

/// A partition to create, in absolute LBA terms.
#[derive(Debug, Clone)]
pub struct PlannedPartition {
    pub first_lba: u64,
    pub last_lba: u64,
    pub type_tag: Option<PartitionType>,
    pub name: String,
}

/// Write a fresh partition table over the device.  DOS tables get at most 4
/// primary partitions; GPT and hybrid tables at most 128.  Updating the
/// kernel's view is the caller's responsibility.
pub fn write_partition_table(
    disk: &mut File,
    sector_size: u64,
    kind: TableKind,
    partitions: &[PlannedPartition],
) -> Result<()> {
    match kind {
        TableKind::Dos => {
            if partitions.len() > 4 {
                return Err(anyhow!(HardkeyError::InvalidConfig)
                    .context("can't create more than 4 primary partitions on a DOS device"));
            }
            let mut mbr = MBR::new_from(disk, sector_size as u32, rand::random())
                .context("creating new MBR")?;
            for (i, part) in partitions.iter().enumerate() {
                let sys = match part.type_tag {
                    Some(t) => t.mbr_sys()?,
                    None => 0x83,
                };
                mbr[i + 1] = MBRPartitionEntry {
                    boot: BOOT_INACTIVE,
                    first_chs: CHS::empty(),
                    sys,
                    last_chs: CHS::empty(),
                    starting_lba: part.first_lba.try_into().context("LBA exceeds MBR range")?,
                    sectors: (part.last_lba - part.first_lba + 1)
                        .try_into()
                        .context("partition size exceeds MBR range")?,
                };
            }
            mbr.write_into(disk).context("writing MBR")?;
        }
        TableKind::Gpt | TableKind::Hybrid => {
            if partitions.len() > 128 {
                return Err(anyhow!(HardkeyError::InvalidConfig)
                    .context("can't create more than 128 partitions on a GPT device"));
            }
            let mut gpt = GPT::new_from(disk, sector_size, *Uuid::new_v4().as_bytes())
                .context("creating new GPT")?;
            for (i, part) in partitions.iter().enumerate() {
                gpt[(i + 1) as u32] = GPTPartitionEntry {
                    partition_type_guid: part
                        .type_tag
                        .unwrap_or(PartitionType::Linux)
                        .gpt_guid(),
                    unique_partition_guid: *Uuid::new_v4().as_bytes(),
                    starting_lba: part.first_lba,
                    ending_lba: part.last_lba,
                    attribute_bits: 0,
                    partition_name: part.name.as_str().into(),
                };
            }
            gpt.write_into(disk).context("writing GPT")?;
            GPT::write_protective_mbr_into(disk, sector_size)
                .context("writing protective MBR")?;
        }
    }
    Ok(())
}

/// Append partitions to whatever table already exists on the disk (e.g.
/// the one an ISO image created), without disturbing existing entries.
pub fn append_partitions(
    disk: &mut File,
    sector_size: u64,
    partitions: &[(String, PlannedPartition)],
) -> Result<()> {
    if let Ok(mut gpt) = GPT::find_from(disk) {
        let mut next = gpt
            .iter()
            .fold(1, |prev, (i, e)| if e.is_used() { i + 1 } else { prev });
        for (_, part) in partitions {
            gpt[next] = GPTPartitionEntry {
                partition_type_guid: part
                    .type_tag
                    .unwrap_or(PartitionType::Linux)
                    .gpt_guid(),
                unique_partition_guid: *Uuid::new_v4().as_bytes(),
                starting_lba: part.first_lba,
                ending_lba: part.last_lba,
                attribute_bits: 0,
                partition_name: part.name.as_str().into(),
            };
            next += 1;
        }
        gpt.write_into(disk).context("writing extended GPT")?;
        return Ok(());
    }

    let mut mbr = MBR::read_from(disk, sector_size as u32)
        .context("device carries neither a GPT nor an MBR")?;
    for (_, part) in partitions {
        let slot = (1..=4)
            .find(|i| !mbr[*i].is_used())
            .ok_or_else(|| anyhow!(HardkeyError::InvalidConfig)
                .context("no free primary slot left in the MBR"))?;
        mbr[slot] = MBRPartitionEntry {
            boot: BOOT_INACTIVE,
            first_chs: CHS::empty(),
            sys: match part.type_tag {
                Some(t) => t.mbr_sys()?,
                None => 0x83,
            },
            last_chs: CHS::empty(),
            starting_lba: part.first_lba.try_into().context("LBA exceeds MBR range")?,
            sectors: (part.last_lba - part.first_lba + 1)
                .try_into()
                .context("partition size exceeds MBR range")?,
        };
    }
    mbr.write_into(disk).context("writing extended MBR")?;
    Ok(())
}

/// Rewrite the MBR of a GPT disk as a hybrid MBR naming exactly the listed
/// partitions.  The first listed partition becomes a bootable EFI (0xEF)
/// entry, the others 0x83; a protective 0xEE entry covers the GPT
/// structures.  At most 3 partitions can be hybridized.
pub fn make_hybrid_mbr(disk: &mut File, sector_size: u64, partitions: &[u32]) -> Result<()> {
    if partitions.is_empty() || partitions.len() > 3 {
        return Err(anyhow!(HardkeyError::InvalidConfig)
            .context("a hybrid MBR names between 1 and 3 partitions"));
    }
    let gpt = GPT::find_from(disk).context("reading GPT")?;
    let mut mbr = MBR::read_from(disk, sector_size as u32).context("reading protective MBR")?;

    let mut min_start = u64::MAX;
    for (slot, number) in partitions.iter().enumerate() {
        let entry = &gpt[*number];
        if !entry.is_used() {
            bail!("partition {} does not exist", number);
        }
        min_start = min_start.min(entry.starting_lba);
        mbr[slot + 1] = MBRPartitionEntry {
            boot: if slot == 0 {
                BOOT_ACTIVE
            } else {
                BOOT_INACTIVE
            },
            first_chs: CHS::empty(),
            sys: if slot == 0 { 0xef } else { 0x83 },
            last_chs: CHS::empty(),
            starting_lba: entry.starting_lba.try_into().context("LBA exceeds MBR range")?,
            sectors: (entry.ending_lba - entry.starting_lba + 1)
                .try_into()
                .context("partition size exceeds MBR range")?,
        };
    }

    // protective entry for the GPT structures, after the hybridized ones
    mbr[partitions.len() + 1] = MBRPartitionEntry {
        boot: BOOT_INACTIVE,
        first_chs: CHS::empty(),
        sys: 0xee,
        last_chs: CHS::empty(),
        starting_lba: 1,
        sectors: (min_start - 1).try_into().context("LBA exceeds MBR range")?,
    };
    // clear any remaining slots
    for slot in (partitions.len() + 2)..=4 {
        mbr[slot] = MBRPartitionEntry::empty();
    }

    mbr.write_into(disk).context("writing hybrid MBR")?;
    Ok(())
}

/// Zero the partition tables (both GPT copies), wipe filesystem signatures,
/// and erase the trailing 20 MiB so the appended metadata records cannot be
/// recovered.
pub fn wipe_tables(devfile: &Path) -> Result<()> {
    let mut f = OpenOptions::new()
        .write(true)
        .read(true)
        .open(devfile)
        .with_context(|| format!("opening {}", devfile.display()))?;
    let len = f.seek(SeekFrom::End(0)).context("getting device size")?;

    // primary MBR + GPT header + entries
    f.seek(SeekFrom::Start(0)).context("seeking to MBR")?;
    f.write_all(&[0u8; 512 * 34]).context("zeroing primary GPT")?;
    // backup GPT
    if len > 512 * 34 {
        f.seek(SeekFrom::End(-(512 * 34))).context("seeking to backup GPT")?;
        f.write_all(&[0u8; 512 * 34]).context("zeroing backup GPT")?;
    }
    f.sync_all().context("syncing device")?;
    drop(f);

    runcmd!("wipefs", "-a", devfile)?;
    ensure_kernel_sync(devfile)?;

    // remaining appended metadata
    let mut f = OpenOptions::new()
        .write(true)
        .open(devfile)
        .with_context(|| format!("opening {}", devfile.display()))?;
    let tail = (20 * 1024 * 1024).min(len);
    f.seek(SeekFrom::End(-(tail as i64)))
        .context("seeking to trailing region")?;
    let chunk = vec![0u8; 1024 * 1024];
    let mut remaining = tail;
    while remaining > 0 {
        let n = remaining.min(chunk.len() as u64) as usize;
        f.write_all(&chunk[..n]).context("zeroing trailing region")?;
        remaining -= n as u64;
    }
    f.sync_all().context("syncing device")?;
    Ok(())
}

/// Ask the kernel to reread the partition table, retrying while the device
/// is briefly busy, then wait for udev to settle.  Bounded; never loops
/// forever on a wedged device.
pub fn ensure_kernel_sync(devfile: &Path) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .open(devfile)
        .with_context(|| format!("opening {}", devfile.display()))?;
    use std::os::unix::fs::FileTypeExt;
    if !file
        .metadata()
        .context("getting device metadata")?
        .file_type()
        .is_block_device()
    {
        return Ok(());
    }
    reread_partition_table(&mut file)?;
    udev_settle()
}

/// BLKRRPART can transiently fail right after a table write; the retry
/// budget is bounded so a genuinely wedged device still errors out.
fn reread_partition_table(file: &mut File) -> Result<()> {
    let fd = file.as_raw_fd();
    let mut attempts = 20;
    loop {
        match unsafe { ioctl::blkrrpart(fd) } {
            Ok(_) => return Ok(()),
            Err(err) => {
                attempts -= 1;
                if attempts > 0 {
                    sleep(Duration::from_millis(100));
                    continue;
                }
                let kind = match err {
                    Errno::EINVAL => HardkeyError::DeviceUnsupported,
                    Errno::EBUSY => HardkeyError::DeviceBusy,
                    _ => HardkeyError::KernelSyncFailed,
                };
                return Err(anyhow!(kind)
                    .context(format!("rereading the partition table failed: {}", err)));
            }
        }
    }
}

pub fn udev_settle() -> Result<()> {
    // without the control socket, `udevadm settle` returns success while
    // doing nothing, and the partition nodes we wait for never appear;
    // refuse up front instead of timing out later
    if !Path::new("/run/udev/control").exists() {
        bail!("no udevd control socket; partition device nodes would never appear");
    }

    // settle only waits for events udevd has already queued; give the
    // kernel uevents from the table rewrite a moment to reach it first
    sleep(Duration::from_millis(200));

    runcmd!("udevadm", "settle")?;
    Ok(())
}

/// A mounted filesystem, released on drop with retries.
#[derive(Debug)]
pub struct Mount {
    device: PathBuf,
    mountpoint: PathBuf,
    owned: bool,
}

impl Mount {
    pub fn try_mount(
        device: &Path,
        mountpoint: Option<&Path>,
        options: Option<&str>,
    ) -> Result<Mount> {
        let mountpoint = match mountpoint {
            Some(p) => {
                std::fs::create_dir_all(p)
                    .with_context(|| format!("creating {}", p.display()))?;
                p.to_path_buf()
            }
            None => {
                let tempdir = tempfile::Builder::new()
                    .prefix("hardkey-")
                    .tempdir()
                    .context("creating temporary directory")?;
                // detach from TempDir: its recursive cleanup must never
                // run against a directory that still has a filesystem on it
                tempdir.into_path()
            }
        };

        mount::mount::<Path, Path, str, str>(
            Some(device),
            &mountpoint,
            None,
            mount::MsFlags::empty(),
            options,
        )
        .with_context(|| {
            format!(
                "mounting device {} on {}",
                device.display(),
                mountpoint.display()
            )
        })?;

        Ok(Mount {
            device: device.to_path_buf(),
            mountpoint,
            owned: true,
        })
    }

    pub fn try_mount_ro(device: &Path, options: Option<&str>) -> Result<Mount> {
        let opts = match options {
            Some(o) => format!("ro,{}", o),
            None => "ro".to_string(),
        };
        // loop images need the kernel to allocate a loop device; delegate
        // to mount(8) which handles -o loop natively
        let tempdir = tempfile::Builder::new()
            .prefix("hardkey-")
            .tempdir()
            .context("creating temporary directory")?;
        let mountpoint = tempdir.into_path();
        runcmd!("mount", "-o", &opts, device, &mountpoint)?;
        Ok(Mount {
            device: device.to_path_buf(),
            mountpoint,
            owned: true,
        })
    }

    pub fn device(&self) -> &Path {
        &self.device
    }

    pub fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }

    /// Release ownership: the mount stays in place after drop.
    pub fn leak(mut self) {
        self.owned = false;
    }

    pub fn unmount(mut self) -> Result<()> {
        self.owned = false;
        umount_path(&self.mountpoint)?;
        let _ = remove_dir(&self.mountpoint);
        Ok(())
    }
}

impl Drop for Mount {
    fn drop(&mut self) {
        if !self.owned {
            return;
        }

        // EBUSY right after the last file handle closed is normal; keep
        // retrying for a couple of seconds before reporting
        if let Err(err) = umount_path(&self.mountpoint) {
            eprintln!("releasing {}: {:#}", self.device.display(), err);
            return;
        }
        if let Err(err) = remove_dir(&self.mountpoint) {
            eprintln!("removing {}: {}", self.mountpoint.display(), err);
        }
    }
}

fn umount_path(mountpoint: &Path) -> Result<()> {
    for retries in (0..20).rev() {
        match mount::umount(mountpoint) {
            Ok(_) => return Ok(()),
            Err(nix::Error::EINVAL) => return Ok(()), // not mounted
            Err(err) => {
                if retries == 0 {
                    return Err(anyhow!(err)
                        .context(format!("unmounting {}", mountpoint.display())));
                }
                sleep(Duration::from_millis(100));
            }
        }
    }
    unreachable!();
}

// create unsafe ioctl wrappers
#[allow(clippy::missing_safety_doc)]
mod ioctl {
    use super::c_int;
    use nix::{ioctl_none, ioctl_read, ioctl_read_bad, request_code_none};
    ioctl_none!(blkrrpart, 0x12, 95);
    ioctl_read_bad!(blksszget, request_code_none!(0x12, 104), c_int);
    ioctl_read!(blkgetsize64, 0x12, 114, libc::size_t);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempfile;

    #[test]
    fn partition_naming() {
        assert_eq!(
            partition_path(Path::new("/dev/sdb"), 3),
            Path::new("/dev/sdb3")
        );
        assert_eq!(
            partition_path(Path::new("/dev/nvme0n1"), 2),
            Path::new("/dev/nvme0n1p2")
        );
        assert_eq!(
            partition_path(Path::new("/dev/loop0"), 1),
            Path::new("/dev/loop0p1")
        );
        assert_eq!(
            partition_number(Path::new("/dev/sdb"), Path::new("/dev/sdb3")).unwrap(),
            3
        );
        assert_eq!(
            partition_number(Path::new("/dev/nbd0"), Path::new("/dev/nbd0p12")).unwrap(),
            12
        );
        assert!(partition_number(Path::new("/dev/sdb"), Path::new("/dev/sdc1")).is_err());
    }

    #[test]
    fn lsblk_pair_scanning() {
        assert_eq!(
            scan_pairs(r#"VENDOR="Kingston " MODEL="DataTraveler 3.0""#),
            vec![
                ("VENDOR".to_string(), "Kingston ".to_string()),
                ("MODEL".to_string(), "DataTraveler 3.0".to_string()),
            ]
        );
        assert!(scan_pairs("not pairs at all").is_empty());
        // a truncated line yields only the complete pairs
        assert_eq!(
            scan_pairs(r#"NAME="sda" LABEL="unterminat"#),
            vec![("NAME".to_string(), "sda".to_string())]
        );

        // empty values collapse to None; names are kept verbatim
        let info = BlockDevInfo::from_pairs(&scan_pairs(
            r#"NAME="/dev/sda2" LABEL="boot" FSTYPE="ext4" MOUNTPOINT="" UUID="abcd-1234""#,
        ));
        assert_eq!(info.name, "/dev/sda2");
        assert_eq!(info.label.as_deref(), Some("boot"));
        assert_eq!(info.fstype.as_deref(), Some("ext4"));
        assert_eq!(info.mountpoint, None);
        assert_eq!(info.uuid.as_deref(), Some("abcd-1234"));

        let bare = BlockDevInfo::from_pairs(&scan_pairs(r#"NAME="/dev/sda" LABEL="""#));
        assert_eq!(bare.name, "/dev/sda");
        assert_eq!(bare.label, None);
    }

    fn make_disk(len: u64) -> File {
        let disk = tempfile().unwrap();
        disk.set_len(len).unwrap();
        disk
    }

    #[test]
    fn gpt_table_roundtrip() {
        let mut disk = make_disk(256 * 1024 * 1024);
        let parts = vec![
            PlannedPartition {
                first_lba: 2048,
                last_lba: 4095,
                type_tag: Some(PartitionType::Bios),
                name: "bios".into(),
            },
            PlannedPartition {
                first_lba: 4096,
                last_lba: 69631,
                type_tag: Some(PartitionType::Efi),
                name: "EFI".into(),
            },
            PlannedPartition {
                first_lba: 69632,
                last_lba: 102399,
                type_tag: Some(PartitionType::Linux),
                name: "data".into(),
            },
        ];
        write_partition_table(&mut disk, 512, TableKind::Gpt, &parts).unwrap();

        let gpt = GPT::find_from(&mut disk).unwrap();
        let used: Vec<_> = gpt.iter().filter(|(_, p)| p.is_used()).collect();
        assert_eq!(used.len(), 3);
        assert_eq!(used[0].1.starting_lba, 2048);
        assert_eq!(used[1].1.partition_name.as_str(), "EFI");
        assert_eq!(
            PartitionType::from_gpt_guid(&used[1].1.partition_type_guid),
            Some(PartitionType::Efi)
        );

        // protective MBR present
        let mbr = MBR::read_from(&mut disk, 512).unwrap();
        assert_eq!(
            mbr.iter().filter(|(_, p)| p.is_used() && p.sys == 0xee).count(),
            1
        );
    }

    #[test]
    fn dos_table_roundtrip() {
        let mut disk = make_disk(64 * 1024 * 1024);
        let parts = vec![PlannedPartition {
            first_lba: 2048,
            last_lba: 32767,
            type_tag: Some(PartitionType::Linux),
            name: "data".into(),
        }];
        write_partition_table(&mut disk, 512, TableKind::Dos, &parts).unwrap();
        let mbr = MBR::read_from(&mut disk, 512).unwrap();
        let used: Vec<_> = mbr.iter().filter(|(_, p)| p.is_used()).collect();
        assert_eq!(used.len(), 1);
        assert_eq!(used[0].1.sys, 0x83);
        assert_eq!(used[0].1.starting_lba, 2048);
        assert_eq!(used[0].1.sectors, 30720);
    }

    #[test]
    fn dos_table_rejects_efi_and_overflow() {
        let mut disk = make_disk(64 * 1024 * 1024);
        let part = |tag| PlannedPartition {
            first_lba: 2048,
            last_lba: 4095,
            type_tag: Some(tag),
            name: "x".into(),
        };
        assert!(
            write_partition_table(&mut disk, 512, TableKind::Dos, &[part(PartitionType::Efi)])
                .is_err()
        );
        let five = vec![part(PartitionType::Linux); 5];
        assert!(write_partition_table(&mut disk, 512, TableKind::Dos, &five).is_err());
    }

    #[test]
    fn hybrid_mbr_construction() {
        let mut disk = make_disk(256 * 1024 * 1024);
        let parts = vec![
            PlannedPartition {
                first_lba: 2048,
                last_lba: 4095,
                type_tag: Some(PartitionType::Bios),
                name: "bios".into(),
            },
            PlannedPartition {
                first_lba: 4096,
                last_lba: 69631,
                type_tag: Some(PartitionType::Efi),
                name: "EFI".into(),
            },
            PlannedPartition {
                first_lba: 69632,
                last_lba: 102399,
                type_tag: Some(PartitionType::Linux),
                name: "data".into(),
            },
        ];
        write_partition_table(&mut disk, 512, TableKind::Gpt, &parts).unwrap();
        make_hybrid_mbr(&mut disk, 512, &[2, 3]).unwrap();

        let mbr = MBR::read_from(&mut disk, 512).unwrap();
        let entries: Vec<_> = mbr.iter().filter(|(_, p)| p.is_used()).collect();
        assert_eq!(entries.len(), 3);
        // first hybridized partition: bootable EFI
        assert_eq!(entries[0].1.sys, 0xef);
        assert_eq!(entries[0].1.boot, BOOT_ACTIVE);
        assert_eq!(entries[0].1.starting_lba, 4096);
        // second: plain linux
        assert_eq!(entries[1].1.sys, 0x83);
        assert_eq!(entries[1].1.starting_lba, 69632);
        // protective entry covers up to the first hybridized partition
        assert_eq!(entries[2].1.sys, 0xee);
        assert_eq!(entries[2].1.starting_lba, 1);
        assert_eq!(entries[2].1.sectors, 4095);

        // and the disk now reads back as hybrid
        assert!(make_hybrid_mbr(&mut disk, 512, &[]).is_err());
        assert!(make_hybrid_mbr(&mut disk, 512, &[1, 2, 3, 1]).is_err());
    }
}
