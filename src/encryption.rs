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

//! Partition encryption engine: passphrase-derived LUKS2 volumes and
//! header-based Veracrypt volumes behind one contract.

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::str::FromStr;

use crate::errors::HardkeyError;
use crate::util::*;

/// LUKS2 PBKDF memory bound in KiB; without it cryptsetup happily sizes its
/// memory-hard KDF for the provisioning host and then fails on the key.
const LUKS_PBKDF_MEMORY_KIB: &str = "524288";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncryptionKind {
    Luks,
    Veracrypt,
}

impl FromStr for EncryptionKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "luks" => Ok(EncryptionKind::Luks),
            "veracrypt" => Ok(EncryptionKind::Veracrypt),
            other => bail!("invalid encryption type {:?}", other),
        }
    }
}

impl fmt::Display for EncryptionKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            EncryptionKind::Luks => f.write_str("luks"),
            EncryptionKind::Veracrypt => f.write_str("veracrypt"),
        }
    }
}

/// One encrypted partition.  Implementations shell out to the volume
/// tooling; passphrases travel over stdin, never argv.
pub trait EncryptedVolume {
    /// Format the partition, allocating a fresh volume key.
    fn create(&self, passphrase: &str) -> Result<()>;
    /// Open the volume and return the mapper device to mount or format.
    fn open(&self, passphrase: &str) -> Result<PathBuf>;
    fn close(&self) -> Result<()>;
    fn is_open(&self) -> Result<Option<PathBuf>>;
    /// Lossless header backup; importing it restores the exact passphrase
    /// set that existed at export time.
    fn export_header(&self, passphrase: &str) -> Result<Vec<u8>>;
    fn import_header(&self, passphrase: &str, header: &[u8]) -> Result<()>;
    fn add_passphrase(&self, current: &str, new: &str) -> Result<()>;
    fn remove_passphrase(&self, passphrase: &str) -> Result<()>;
    fn change_passphrase(&self, current: &str, new: &str) -> Result<()>;
    /// Destroy key material, then overwrite the header regions with zeros.
    fn erase(&self) -> Result<()>;
}

pub fn volume(kind: EncryptionKind, partition: &Path) -> Box<dyn EncryptedVolume> {
    match kind {
        EncryptionKind::Luks => Box::new(LuksVolume::new(partition)),
        EncryptionKind::Veracrypt => Box::new(VeracryptVolume::new(partition)),
    }
}

/// Overwrite `[offset, offset+len)` of a device with zeros.  Negative
/// offsets are relative to the end.
fn zero_region(path: &Path, offset: i64, len: usize) -> Result<()> {
    let mut f = OpenOptions::new()
        .write(true)
        .open(path)
        .with_context(|| format!("opening {}", path.display()))?;
    if offset >= 0 {
        f.seek(SeekFrom::Start(offset as u64))
    } else {
        f.seek(SeekFrom::End(offset))
    }
    .with_context(|| format!("seeking in {}", path.display()))?;
    let chunk = vec![0u8; 1024 * 1024];
    let mut remaining = len;
    while remaining > 0 {
        let n = remaining.min(chunk.len());
        f.write_all(&chunk[..n])
            .with_context(|| format!("zeroing {}", path.display()))?;
        remaining -= n;
    }
    f.sync_all()
        .with_context(|| format!("syncing {}", path.display()))?;
    Ok(())
}

pub struct LuksVolume {
    partition: PathBuf,
}

impl LuksVolume {
    pub fn new(partition: &Path) -> Self {
        Self {
            partition: partition.to_path_buf(),
        }
    }

    /// Stable mapper name derived from the partition path.
    fn mapper_name(&self) -> String {
        format!(
            "secluks-{}",
            self.partition.to_string_lossy().replace('/', "")
        )
    }

    fn mapper_path(&self) -> PathBuf {
        Path::new("/dev/mapper").join(self.mapper_name())
    }

    /// Translate a cryptsetup exit code into a typed error.
    fn map_error(&self, action: &str, result: &CmdResult) -> anyhow::Error {
        let kind = match result.code {
            Some(2) => HardkeyError::WrongPassphrase,
            Some(3) => HardkeyError::OutOfMemory,
            Some(4) => HardkeyError::DeviceUnsupported,
            Some(5) => HardkeyError::DeviceBusy,
            // killed by the OOM killer
            None | Some(-9) => HardkeyError::OutOfMemory,
            _ => HardkeyError::EncryptionError,
        };
        eprint!("{}", result.stderr);
        anyhow!(kind).context(format!("{} LUKS volume {}", action, self.partition.display()))
    }
}

impl EncryptedVolume for LuksVolume {
    fn create(&self, passphrase: &str) -> Result<()> {
        let mut cmd = Command::new("cryptsetup");
        cmd.arg("luksFormat")
            .arg(&self.partition)
            .arg("--type")
            .arg("luks2")
            .arg("--pbkdf-memory")
            .arg(LUKS_PBKDF_MEMORY_KIB)
            .arg("-d")
            .arg("-");
        let result = cmd_run_stdin(&mut cmd, passphrase.as_bytes())?;
        if !result.success() {
            return Err(self.map_error("formatting", &result));
        }
        Ok(())
    }

    fn open(&self, passphrase: &str) -> Result<PathBuf> {
        let mut cmd = Command::new("cryptsetup");
        cmd.arg("open")
            .arg(&self.partition)
            .arg(self.mapper_name())
            .arg("-d")
            .arg("-");
        let result = cmd_run_stdin(&mut cmd, passphrase.as_bytes())?;
        if !result.success() {
            return Err(self.map_error("opening", &result));
        }
        Ok(self.mapper_path())
    }

    fn close(&self) -> Result<()> {
        let mapped = self
            .is_open()?
            .ok_or_else(|| anyhow!("volume {} is not open", self.partition.display()))?;
        let mut cmd = Command::new("cryptsetup");
        cmd.arg("close").arg(&mapped);
        let result = cmd_run_stdin(&mut cmd, b"")?;
        if !result.success() {
            return Err(self.map_error("closing", &result));
        }
        Ok(())
    }

    fn is_open(&self) -> Result<Option<PathBuf>> {
        let path = self.mapper_path();
        if path.exists() {
            Ok(Some(path))
        } else {
            Ok(None)
        }
    }

    fn export_header(&self, _passphrase: &str) -> Result<Vec<u8>> {
        let dir = tempfile::Builder::new()
            .prefix("hardkey-")
            .tempdir()
            .context("creating temporary directory")?;
        let backup = dir.path().join("header");
        let mut cmd = Command::new("cryptsetup");
        cmd.arg("luksHeaderBackup")
            .arg(&self.partition)
            .arg("--header-backup-file")
            .arg(&backup);
        let result = cmd_run_stdin(&mut cmd, b"")?;
        if !result.success() {
            return Err(self.map_error("backing up header of", &result));
        }
        std::fs::read(&backup).context("reading exported header")
    }

    fn import_header(&self, _passphrase: &str, header: &[u8]) -> Result<()> {
        let dir = tempfile::Builder::new()
            .prefix("hardkey-")
            .tempdir()
            .context("creating temporary directory")?;
        let backup = dir.path().join("header");
        std::fs::write(&backup, header).context("writing header to restore")?;
        let mut cmd = Command::new("cryptsetup");
        cmd.arg("-q")
            .arg("luksHeaderRestore")
            .arg(&self.partition)
            .arg("--header-backup-file")
            .arg(&backup);
        let result = cmd_run_stdin(&mut cmd, b"")?;
        if !result.success() {
            return Err(self.map_error("restoring header of", &result));
        }
        Ok(())
    }

    fn add_passphrase(&self, current: &str, new: &str) -> Result<()> {
        // the current passphrase goes through a key file so the new one can
        // be fed on stdin
        let mut keyfile = tempfile::Builder::new()
            .prefix("hardkey-")
            .tempfile()
            .context("creating key file")?;
        keyfile
            .write_all(current.as_bytes())
            .context("writing key file")?;
        let mut cmd = Command::new("cryptsetup");
        cmd.arg("luksAddKey")
            .arg(&self.partition)
            .arg(format!("--key-file={}", keyfile.path().display()));
        let result = cmd_run_stdin(&mut cmd, new.as_bytes())?;
        if !result.success() {
            return Err(self.map_error("adding passphrase to", &result));
        }
        Ok(())
    }

    fn remove_passphrase(&self, passphrase: &str) -> Result<()> {
        let mut cmd = Command::new("cryptsetup");
        cmd.arg("luksRemoveKey").arg(&self.partition);
        let result = cmd_run_stdin(&mut cmd, passphrase.as_bytes())?;
        if !result.success() {
            return Err(self.map_error("removing passphrase from", &result));
        }
        Ok(())
    }

    fn change_passphrase(&self, current: &str, new: &str) -> Result<()> {
        let mut keyfile = tempfile::Builder::new()
            .prefix("hardkey-")
            .tempfile()
            .context("creating key file")?;
        keyfile
            .write_all(current.as_bytes())
            .context("writing key file")?;
        let mut cmd = Command::new("cryptsetup");
        cmd.arg("luksChangeKey")
            .arg(&self.partition)
            .arg(format!("--key-file={}", keyfile.path().display()));
        let result = cmd_run_stdin(&mut cmd, new.as_bytes())?;
        if !result.success() {
            return Err(self.map_error("changing passphrase of", &result));
        }
        Ok(())
    }

    fn erase(&self) -> Result<()> {
        // invalidate key slots first; fast, and makes the volume key
        // unrecoverable even if the zeroing below is interrupted
        let mut cmd = Command::new("cryptsetup");
        cmd.arg("-q").arg("luksErase").arg(&self.partition);
        let _ = cmd_run_stdin(&mut cmd, b"")?;

        zero_region(&self.partition, 0, 16 * 1024 * 1024)
            .context("overwriting LUKS header area")?;
        Ok(())
    }
}

pub struct VeracryptVolume {
    partition: PathBuf,
}

impl VeracryptVolume {
    pub fn new(partition: &Path) -> Self {
        Self {
            partition: partition.to_path_buf(),
        }
    }

    fn base_cmd(&self) -> Command {
        let mut cmd = Command::new("veracrypt");
        cmd.arg("-t").arg("--non-interactive");
        cmd
    }

    /// Find the lowest unused veracrypt mapper slot.
    fn free_slot(&self) -> Result<u32> {
        for slot in 1..=64 {
            if !Path::new(&format!("/dev/mapper/veracrypt{}", slot)).exists() {
                return Ok(slot);
            }
        }
        bail!("no free veracrypt slot");
    }

    fn mapped_slot(&self) -> Result<Option<u32>> {
        let list = self.base_cmd().arg("-l").output().context("listing veracrypt volumes")?;
        if !list.status.success() {
            // veracrypt -l fails when nothing is mapped
            return Ok(None);
        }
        let out = String::from_utf8_lossy(&list.stdout).into_owned();
        let needle = self.partition.to_string_lossy();
        for line in out.lines() {
            // e.g. "1: /dev/sdb5 /dev/mapper/veracrypt1 -"
            if line.contains(needle.as_ref()) {
                if let Some(slot) = line.split(':').next().and_then(|s| s.trim().parse().ok()) {
                    return Ok(Some(slot));
                }
            }
        }
        Ok(None)
    }
}

impl EncryptedVolume for VeracryptVolume {
    fn create(&self, passphrase: &str) -> Result<()> {
        let mut cmd = self.base_cmd();
        cmd.arg("-c")
            .arg("--quick")
            .arg("--stdin")
            .arg("--volume-type=normal")
            .arg("--encryption=AES")
            .arg("--hash=RIPEMD-160")
            .arg("--filesystem=none")
            .arg("-k")
            .arg("")
            .arg("--random-source=/dev/urandom")
            .arg(&self.partition);
        let result = cmd_run_stdin(&mut cmd, passphrase.as_bytes())?;
        if !result.success() {
            eprint!("{}", result.stderr);
            return Err(anyhow!(HardkeyError::EncryptionError)
                .context(format!("formatting {} as veracrypt", self.partition.display())));
        }
        Ok(())
    }

    fn open(&self, passphrase: &str) -> Result<PathBuf> {
        let slot = self.free_slot()?;
        let mut cmd = self.base_cmd();
        cmd.arg("--stdin")
            .arg("--protect-hidden=no")
            .arg("-k")
            .arg("")
            .arg("--filesystem=none")
            .arg(format!("--slot={}", slot))
            .arg(&self.partition);
        let result = cmd_run_stdin(&mut cmd, passphrase.as_bytes())?;
        if !result.success() {
            let kind = if result.stderr.contains("Incorrect password") {
                HardkeyError::WrongPassphrase
            } else {
                HardkeyError::EncryptionError
            };
            eprint!("{}", result.stderr);
            return Err(anyhow!(kind)
                .context(format!("opening veracrypt volume {}", self.partition.display())));
        }
        Ok(PathBuf::from(format!("/dev/mapper/veracrypt{}", slot)))
    }

    fn close(&self) -> Result<()> {
        let slot = self
            .mapped_slot()?
            .ok_or_else(|| anyhow!("volume {} is not open", self.partition.display()))?;
        let mut cmd = self.base_cmd();
        cmd.arg("-d").arg(format!("--slot={}", slot));
        let result = cmd_run_stdin(&mut cmd, b"")?;
        if !result.success() {
            eprint!("{}", result.stderr);
            return Err(anyhow!(HardkeyError::EncryptionError)
                .context(format!("closing veracrypt volume {}", self.partition.display())));
        }
        Ok(())
    }

    fn is_open(&self) -> Result<Option<PathBuf>> {
        Ok(self
            .mapped_slot()?
            .map(|slot| PathBuf::from(format!("/dev/mapper/veracrypt{}", slot))))
    }

    fn export_header(&self, passphrase: &str) -> Result<Vec<u8>> {
        let dir = tempfile::Builder::new()
            .prefix("hardkey-")
            .tempdir()
            .context("creating temporary directory")?;
        let backup = dir.path().join("header");
        let mut cmd = self.base_cmd();
        cmd.arg("--backup-headers").arg(&self.partition);
        // interactive prompt sequence: passphrase, PIM, keyfile, no hidden
        // volume, confirm, output file
        let responses = format!("{}\n\n\nn\ny\n{}\n", passphrase, backup.display());
        let result = cmd_run_stdin(&mut cmd, responses.as_bytes())?;
        if !result.success() {
            eprint!("{}", result.stderr);
            return Err(anyhow!(HardkeyError::EncryptionError).context(format!(
                "backing up veracrypt header of {}",
                self.partition.display()
            )));
        }
        std::fs::read(&backup).context("reading exported header")
    }

    fn import_header(&self, passphrase: &str, header: &[u8]) -> Result<()> {
        let dir = tempfile::Builder::new()
            .prefix("hardkey-")
            .tempdir()
            .context("creating temporary directory")?;
        let backup = dir.path().join("header");
        std::fs::write(&backup, header).context("writing header to restore")?;
        let entropy = crate::crypto::random_secret(350)?;
        let mut cmd = self.base_cmd();
        cmd.arg("--restore-headers").arg(&self.partition);
        let responses = format!("2\nYes\n{}\n{}\n\n{}\n", backup.display(), passphrase, entropy);
        let result = cmd_run_stdin(&mut cmd, responses.as_bytes())?;
        if !result.success() {
            eprint!("{}", result.stderr);
            return Err(anyhow!(HardkeyError::EncryptionError).context(format!(
                "restoring veracrypt header of {}",
                self.partition.display()
            )));
        }
        Ok(())
    }

    fn add_passphrase(&self, _current: &str, _new: &str) -> Result<()> {
        // a veracrypt volume has a single passphrase
        bail!("veracrypt volumes carry exactly one passphrase; use change_passphrase");
    }

    fn remove_passphrase(&self, _passphrase: &str) -> Result<()> {
        bail!("veracrypt volumes carry exactly one passphrase; use change_passphrase");
    }

    fn change_passphrase(&self, current: &str, new: &str) -> Result<()> {
        let mut cmd = self.base_cmd();
        cmd.arg("-C")
            .arg("-p")
            .arg(current)
            .arg(format!("--new-password={}", new))
            .arg(&self.partition);
        let result = cmd_run_stdin(&mut cmd, b"")?;
        if !result.success() {
            eprint!("{}", result.stderr);
            return Err(anyhow!(HardkeyError::EncryptionError).context(format!(
                "changing veracrypt passphrase of {}",
                self.partition.display()
            )));
        }
        Ok(())
    }

    fn erase(&self) -> Result<()> {
        // both header copies: 128 KiB leading, 128 KiB trailing
        zero_region(&self.partition, 0, 128 * 1024).context("overwriting veracrypt header")?;
        zero_region(&self.partition, -(128 * 1024), 128 * 1024)
            .context("overwriting veracrypt backup header")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_encryption_kinds() {
        assert_eq!("luks".parse::<EncryptionKind>().unwrap(), EncryptionKind::Luks);
        assert_eq!(
            "VeraCrypt".parse::<EncryptionKind>().unwrap(),
            EncryptionKind::Veracrypt
        );
        assert!("bitlocker".parse::<EncryptionKind>().is_err());
    }

    #[test]
    fn luks_mapper_name_is_stable() {
        let vol = LuksVolume::new(Path::new("/dev/sdb4"));
        assert_eq!(vol.mapper_name(), "secluks-devsdb4");
        assert_eq!(
            vol.mapper_path(),
            Path::new("/dev/mapper/secluks-devsdb4")
        );
    }

    #[test]
    fn zeroing_regions() {
        let f = tempfile::NamedTempFile::new().unwrap();
        f.as_file().set_len(1024 * 1024).unwrap();
        std::fs::write(f.path(), vec![0xaau8; 1024 * 1024]).unwrap();

        zero_region(f.path(), 0, 4096).unwrap();
        zero_region(f.path(), -4096, 4096).unwrap();

        let data = std::fs::read(f.path()).unwrap();
        assert!(data[..4096].iter().all(|b| *b == 0));
        assert!(data[data.len() - 4096..].iter().all(|b| *b == 0));
        assert_eq!(data[4096], 0xaa);
    }

    #[test]
    fn veracrypt_single_passphrase_contract() {
        let vol = VeracryptVolume::new(Path::new("/dev/sdb5"));
        assert!(vol.add_passphrase("a", "b").is_err());
        assert!(vol.remove_passphrase("a").is_err());
    }
}
