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

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::process::Command;
use std::str::FromStr;
use std::thread::sleep;
use std::time::{Duration, Instant};

use crate::errors::HardkeyError;
use crate::util::*;
use crate::{runcmd_output};

/// Supported filesystem kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FsKind {
    Fat,
    Exfat,
    Ntfs,
    Ext4,
    Btrfs,
}

impl FromStr for FsKind {
    type Err = anyhow::Error;

    /// Accepts both our canonical names and the strings blkid/lsblk report
    /// (`vfat`, `ntfs3`, `ext4`, ...).
    fn from_str(s: &str) -> Result<Self> {
        let lower = s.to_lowercase();
        if lower.contains('\n') {
            bail!("invalid filesystem type {:?}", s);
        }
        if lower.starts_with("fat") || lower.starts_with("vfat") {
            Ok(FsKind::Fat)
        } else if lower.starts_with("exfat") {
            Ok(FsKind::Exfat)
        } else if lower.starts_with("ntfs") {
            Ok(FsKind::Ntfs)
        } else if lower.starts_with("ext") {
            Ok(FsKind::Ext4)
        } else if lower.starts_with("btrfs") {
            Ok(FsKind::Btrfs)
        } else {
            bail!("invalid filesystem type {:?}", s);
        }
    }
}

impl fmt::Display for FsKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            FsKind::Fat => "fat",
            FsKind::Exfat => "exfat",
            FsKind::Ntfs => "ntfs",
            FsKind::Ext4 => "ext4",
            FsKind::Btrfs => "btrfs",
        };
        f.write_str(s)
    }
}

/// Wait for a partition device node to appear.  udev can lag behind the
/// kernel on slow devices, and mkfs on a missing node is unrecoverable.
pub fn wait_for_device(path: &Path, timeout: Duration) -> Result<()> {
    let start = Instant::now();
    while !path.exists() {
        if start.elapsed() > timeout {
            return Err(anyhow!(HardkeyError::FilesystemError)
                .context(format!("device node {} never appeared", path.display())));
        }
        sleep(Duration::from_millis(200));
    }
    Ok(())
}

/// Create a filesystem on `device`.  `volume_id` is only accepted for
/// filesystems that carry one natively; NTFS rejects it.
pub fn create_filesystem(
    device: &Path,
    kind: FsKind,
    label: &str,
    volume_id: Option<&str>,
) -> Result<()> {
    wait_for_device(device, Duration::from_secs(10))?;

    let mut cmd;
    match kind {
        FsKind::Fat => {
            cmd = Command::new("mkfs.vfat");
            cmd.arg("-n").arg(label);
            if let Some(vol) = volume_id {
                cmd.arg("-i").arg(vol);
            }
        }
        FsKind::Exfat => {
            cmd = Command::new("mkfs.exfat");
            cmd.arg("-n").arg(label);
            if let Some(vol) = volume_id {
                cmd.arg("-i").arg(vol);
            }
        }
        FsKind::Ntfs => {
            if volume_id.is_some() {
                return Err(anyhow!(HardkeyError::InvalidParameter)
                    .context("NTFS does not support setting a volume ID"));
            }
            cmd = Command::new("mkfs.ntfs");
            cmd.arg("-f").arg("-L").arg(label);
        }
        FsKind::Ext4 => {
            cmd = Command::new("mkfs.ext4");
            cmd.arg("-F").arg("-L").arg(label);
            if let Some(vol) = volume_id {
                cmd.arg("-U").arg(vol);
            }
        }
        FsKind::Btrfs => {
            cmd = Command::new("mkfs.btrfs");
            cmd.arg("-f").arg("-L").arg(label);
            if let Some(vol) = volume_id {
                cmd.arg("-U").arg(vol);
            }
        }
    }
    cmd.arg(device);

    // feed a confirmation in case mkfs asks for one
    let result = cmd_run_stdin(&mut cmd, b"y\n")?;
    if result.success() {
        return Ok(());
    }

    // udev occasionally yanks the node out from under mkfs on slow USB
    // devices; wait for it to come back and retry once
    if result.stderr.contains("does not exist") {
        wait_for_device(device, Duration::from_secs(10))?;
        let retry = cmd_run_stdin(&mut cmd, b"y\n")?;
        if retry.success() {
            return Ok(());
        }
        eprint!("{}", retry.stderr);
    } else {
        eprint!("{}", result.stderr);
    }
    Err(anyhow!(HardkeyError::FilesystemError)
        .context(format!("formatting {} as {}", device.display(), kind)))
}

/// Identify the filesystem on a partition or mapper device.
pub fn probe(device: &Path) -> Result<FsKind> {
    let out = runcmd_output!("lsblk", "-n", "-l", "-o", "FSTYPE", device)
        .with_context(|| format!("probing filesystem on {}", device.display()))?;
    out.trim().parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_filesystem_names() {
        assert_eq!("FAT".parse::<FsKind>().unwrap(), FsKind::Fat);
        assert_eq!("vfat".parse::<FsKind>().unwrap(), FsKind::Fat);
        assert_eq!("ntfs3".parse::<FsKind>().unwrap(), FsKind::Ntfs);
        assert_eq!("ext4".parse::<FsKind>().unwrap(), FsKind::Ext4);
        assert_eq!("EXFAT".parse::<FsKind>().unwrap(), FsKind::Exfat);
        assert_eq!("btrfs".parse::<FsKind>().unwrap(), FsKind::Btrfs);
        assert!("squashfs".parse::<FsKind>().is_err());
        assert!("ext4\nvfat".parse::<FsKind>().is_err());
    }

    #[test]
    fn display_roundtrip() {
        for kind in [
            FsKind::Fat,
            FsKind::Exfat,
            FsKind::Ntfs,
            FsKind::Ext4,
            FsKind::Btrfs,
        ] {
            assert_eq!(kind.to_string().parse::<FsKind>().unwrap(), kind);
        }
    }

    #[test]
    fn missing_device_times_out() {
        let err =
            wait_for_device(Path::new("/nonexistent/path"), Duration::from_millis(10)).unwrap_err();
        assert_eq!(
            crate::errors::kind_of(&err),
            Some(HardkeyError::FilesystemError)
        );
    }
}
