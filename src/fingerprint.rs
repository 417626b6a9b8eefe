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

//! Content-hashing primitives for the integrity fingerprint: file ranges,
//! deterministic directory trees, partition tables, and the chain composer.

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use crate::blockdev::{Mount, TableKind};
use crate::crypto;

const BUF_SIZE: usize = 512 * 1024;

/// Directories some host OSes inject into removable media behind the
/// user's back.  Tolerated only when their contents match a strict
/// allow-list; anything else poisons the hash.
const HOST_CRUD_DIRS: &[&str] = &[
    "$RECYCLE.BIN",
    "System Volume Information",
    "ClientRecoveryPasswordRotation",
    "AadRecoveryPasswordDelete",
];
const HOST_CRUD_ALLOWED_FILES: &[&str] = &["IndexerVolumeGuid", "WPSettings.dat", "desktop.ini"];
const HOST_CRUD_MAX_FILE_SIZE: u64 = 150;

/// One tagged checkpoint of the integrity chain: the first 5 hex digits of
/// the running hash after the step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub tag: String,
    pub value: String,
}

impl Checkpoint {
    pub fn new(tag: &str, hash: &str) -> Self {
        Self {
            tag: tag.to_string(),
            value: hash[..5].to_string(),
        }
    }
}

/// The ordered checkpoint log of one fingerprint computation.
pub type IntegrityLog = Vec<Checkpoint>;

/// Chain two hashes into a new one.  This is the sole composition
/// primitive of the boot-time chain.
pub fn chain(h0: &str, h1: &str) -> String {
    crypto::sha256_hex(format!("{}/{}", h0, h1).as_bytes())
}

/// SHA-256 over the half-open byte range `[start, end)` of a file,
/// streaming in fixed-size chunks.  `end` of None means the end of file.
pub fn hash_file_range(path: &Path, start: u64, end: Option<u64>) -> Result<String> {
    if let Some(end) = end {
        if end < start {
            bail!("range end {} is lower than start {}", end, start);
        }
    }
    let mut f = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    f.seek(SeekFrom::Start(start))
        .with_context(|| format!("seeking in {}", path.display()))?;

    let mut hasher = openssl::sha::Sha256::new();
    let mut buf = vec![0u8; BUF_SIZE];
    let mut read_so_far = 0u64;
    loop {
        let want = match end {
            Some(end) => {
                let remaining = end - start - read_so_far;
                if remaining == 0 {
                    break;
                }
                remaining.min(BUF_SIZE as u64) as usize
            }
            None => BUF_SIZE,
        };
        let n = f
            .read(&mut buf[..want])
            .with_context(|| format!("reading {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        read_so_far += n as u64;
    }
    Ok(hex::encode(hasher.finish()))
}

/// Hash of a whole (supposedly immutable) partition.
pub fn partition_hash(partfile: &Path) -> Result<String> {
    Ok(format!("sha256|{}", hash_file_range(partfile, 0, None)?))
}

/// Hash of the partition table: bytes [0, 440) and [444, 512), skipping the
/// 4-byte MBR disk signature some host OSes rewrite on sight, and for
/// GPT/hybrid tables also the GPT header and entry sectors.
pub fn partition_table_hash(devfile: &Path, kind: TableKind) -> Result<String> {
    let mut f = File::open(devfile).with_context(|| format!("opening {}", devfile.display()))?;
    let mut sector = [0u8; 512];
    f.read_exact(&mut sector)
        .with_context(|| format!("reading MBR of {}", devfile.display()))?;

    let mut hasher = openssl::sha::Sha256::new();
    hasher.update(&sector[..440]);
    hasher.update(&sector[444..]);
    if matches!(kind, TableKind::Gpt | TableKind::Hybrid) {
        let mut gpt = vec![0u8; 33 * 512];
        f.read_exact(&mut gpt)
            .with_context(|| format!("reading GPT of {}", devfile.display()))?;
        hasher.update(&gpt);
    }
    Ok(format!("sha256|{}", hex::encode(hasher.finish())))
}

/// What the ignore predicate decided for one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreDecision {
    /// Hash the entry normally.
    Include,
    /// Pretend the entry does not exist.
    Skip,
    /// Feed junk into the hash so verification cannot succeed.
    Poison,
}

pub type IgnorePredicate<'a> = &'a dyn Fn(&Path, &str) -> IgnoreDecision;

/// Deterministic hash of a directory tree.  Each entry feeds the hasher a
/// type tag plus its path relative to `root` (`D`+rel, `L`+rel then the
/// link target, `F`+rel then the contents); entries are visited in byte
/// order per level.  Embedded `efi.img` filesystem images are mounted
/// read-only and hashed inline, since host OSes modify them in place when
/// they mount the partition.
pub fn directory_hash(root: &Path, ignore: Option<IgnorePredicate>) -> Result<String> {
    let mut hasher = openssl::sha::Sha256::new();
    update_directory_hash(root, "", &mut hasher, ignore)?;
    Ok(hex::encode(hasher.finish()))
}

fn sorted_entries(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in
        std::fs::read_dir(dir).with_context(|| format!("reading directory {}", dir.display()))?
    {
        let entry = entry.with_context(|| format!("reading {} entry", dir.display()))?;
        names.push(
            entry
                .file_name()
                .into_string()
                .map_err(|n| anyhow!("non-UTF-8 file name {:?} in {}", n, dir.display()))?,
        );
    }
    names.sort();
    Ok(names)
}

fn update_directory_hash(
    root: &Path,
    rel: &str,
    hasher: &mut openssl::sha::Sha256,
    ignore: Option<IgnorePredicate>,
) -> Result<()> {
    let path = if rel.is_empty() {
        root.to_path_buf()
    } else {
        root.join(rel)
    };
    let basename = rel.rsplit('/').next().unwrap_or(rel);

    if HOST_CRUD_DIRS.contains(&basename) {
        update_host_crud_hash(&path, hasher);
        return Ok(());
    }
    if let Some(pred) = ignore {
        match pred(root, rel) {
            IgnoreDecision::Include => (),
            IgnoreDecision::Skip => return Ok(()),
            IgnoreDecision::Poison => {
                hasher.update(crypto::random_bytes(32)?.as_slice());
                return Ok(());
            }
        }
    }

    let meta = std::fs::symlink_metadata(&path)
        .with_context(|| format!("reading metadata of {}", path.display()))?;
    if meta.file_type().is_symlink() {
        hasher.update(format!("L{}", rel).as_bytes());
        let target = std::fs::read_link(&path)
            .with_context(|| format!("reading link {}", path.display()))?;
        hasher.update(target.to_string_lossy().as_bytes());
    } else if meta.is_dir() {
        hasher.update(format!("D{}", rel).as_bytes());
        for name in sorted_entries(&path)? {
            let child = if rel.is_empty() {
                name
            } else {
                format!("{}/{}", rel, name)
            };
            update_directory_hash(root, &child, hasher, ignore)?;
        }
    } else {
        hasher.update(format!("F{}", rel).as_bytes());
        if basename.to_lowercase() == "efi.img" {
            hash_embedded_image(&path, hasher)?;
        } else {
            let mut f =
                File::open(&path).with_context(|| format!("opening {}", path.display()))?;
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                let n = f
                    .read(&mut buf)
                    .with_context(|| format!("reading {}", path.display()))?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
        }
    }
    Ok(())
}

/// Mount an embedded filesystem image read-only and hash its tree inline.
fn hash_embedded_image(image: &Path, hasher: &mut openssl::sha::Sha256) -> Result<()> {
    let mount = Mount::try_mount_ro(image, Some("loop"))
        .with_context(|| format!("mounting embedded image {}", image.display()))?;
    let result = update_directory_hash(mount.mountpoint(), "", hasher, None);
    mount
        .unmount()
        .with_context(|| format!("unmounting embedded image {}", image.display()))?;
    result
}

/// Either ignore the whole host-injected directory (as if it did not
/// exist), or, if its contents stray from the allow-list, poison the hash
/// so the verification fails.
fn update_host_crud_hash(path: &Path, hasher: &mut openssl::sha::Sha256) {
    let entries = match sorted_entries(path) {
        Ok(e) => e,
        Err(_) => {
            // unreadable media region; treat as absent
            return;
        }
    };
    for name in entries {
        let sub = path.join(&name);
        if HOST_CRUD_DIRS.contains(&name.as_str()) {
            update_host_crud_hash(&sub, hasher);
            continue;
        }
        if !HOST_CRUD_ALLOWED_FILES.contains(&name.as_str()) {
            eprintln!("unexpected host file {}", sub.display());
            hasher.update(b"FAILED");
            continue;
        }
        match std::fs::metadata(&sub) {
            Ok(meta) if meta.is_file() && meta.len() <= HOST_CRUD_MAX_FILE_SIZE => (),
            _ => {
                eprintln!("host file {} too big or wrong type", sub.display());
                hasher.update(b"FAILED");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    fn write(dir: &TempDir, rel: &str, data: &[u8]) {
        let path = dir.path().join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, data).unwrap();
    }

    #[test]
    fn chain_values() {
        let a = chain("aa", "bb");
        assert_eq!(a.len(), 64);
        assert_eq!(a, crypto::sha256_hex(b"aa/bb"));
        // not commutative
        assert_ne!(chain("aa", "bb"), chain("bb", "aa"));
    }

    #[test]
    fn file_range_hashing() {
        let dir = TempDir::new().unwrap();
        write(&dir, "f", b"0123456789");
        let path = dir.path().join("f");

        assert_eq!(
            hash_file_range(&path, 0, None).unwrap(),
            crypto::sha256_hex(b"0123456789")
        );
        assert_eq!(
            hash_file_range(&path, 2, Some(6)).unwrap(),
            crypto::sha256_hex(b"2345")
        );
        assert_eq!(
            hash_file_range(&path, 10, None).unwrap(),
            crypto::sha256_hex(b"")
        );
        assert!(hash_file_range(&path, 6, Some(2)).is_err());
    }

    #[test]
    fn directory_hash_is_deterministic_and_tagged() {
        let dir = TempDir::new().unwrap();
        write(&dir, "a/x", b"one");
        write(&dir, "b", b"two");
        symlink("a/x", dir.path().join("c")).unwrap();

        let h1 = directory_hash(dir.path(), None).unwrap();
        let h2 = directory_hash(dir.path(), None).unwrap();
        assert_eq!(h1, h2);

        // renaming a file changes the hash even with identical contents
        fs::rename(dir.path().join("b"), dir.path().join("b2")).unwrap();
        assert_ne!(directory_hash(dir.path(), None).unwrap(), h1);
        fs::rename(dir.path().join("b2"), dir.path().join("b")).unwrap();
        assert_eq!(directory_hash(dir.path(), None).unwrap(), h1);

        // changing a symlink target changes the hash
        fs::remove_file(dir.path().join("c")).unwrap();
        symlink("b", dir.path().join("c")).unwrap();
        assert_ne!(directory_hash(dir.path(), None).unwrap(), h1);
    }

    #[test]
    fn ignore_predicate_skip_and_poison() {
        let dir = TempDir::new().unwrap();
        write(&dir, "stable", b"data");
        write(&dir, "volatile", b"changes all the time");

        let skip_volatile = |_root: &Path, rel: &str| {
            if rel == "volatile" {
                IgnoreDecision::Skip
            } else {
                IgnoreDecision::Include
            }
        };
        let h1 = directory_hash(dir.path(), Some(&skip_volatile)).unwrap();
        write(&dir, "volatile", b"something else");
        assert_eq!(directory_hash(dir.path(), Some(&skip_volatile)).unwrap(), h1);

        // poison: two runs over identical content disagree
        let poison = |_root: &Path, rel: &str| {
            if rel == "volatile" {
                IgnoreDecision::Poison
            } else {
                IgnoreDecision::Include
            }
        };
        let p1 = directory_hash(dir.path(), Some(&poison)).unwrap();
        let p2 = directory_hash(dir.path(), Some(&poison)).unwrap();
        assert_ne!(p1, p2);
    }

    #[test]
    fn host_crud_directories() {
        let dir = TempDir::new().unwrap();
        write(&dir, "f", b"content");
        let h_base = directory_hash(dir.path(), None).unwrap();

        // a well-behaved crud dir is invisible
        write(&dir, "System Volume Information/WPSettings.dat", b"\x0c\0\0\0");
        assert_eq!(directory_hash(dir.path(), None).unwrap(), h_base);

        // an unexpected file inside it poisons the hash
        write(&dir, "System Volume Information/evil.exe", b"x");
        assert_ne!(directory_hash(dir.path(), None).unwrap(), h_base);
    }

    #[test]
    fn table_hash_skips_disk_signature() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("disk");
        let mut data = vec![0u8; 512 + 33 * 512];
        for (i, b) in data.iter_mut().enumerate() {
            *b = (i % 256) as u8;
        }
        fs::write(&path, &data).unwrap();
        let h1 = partition_table_hash(&path, TableKind::Dos).unwrap();
        assert!(h1.starts_with("sha256|"));

        // the 4-byte MBR disk signature is excluded
        data[441] ^= 0xff;
        fs::write(&path, &data).unwrap();
        assert_eq!(partition_table_hash(&path, TableKind::Dos).unwrap(), h1);

        // boot code is not
        data[10] ^= 0xff;
        fs::write(&path, &data).unwrap();
        assert_ne!(partition_table_hash(&path, TableKind::Dos).unwrap(), h1);

        // GPT hash extends over the header and entry sectors
        data[10] ^= 0xff;
        fs::write(&path, &data).unwrap();
        let g1 = partition_table_hash(&path, TableKind::Gpt).unwrap();
        assert_ne!(g1, h1);
        data[512 + 100] ^= 0xff;
        fs::write(&path, &data).unwrap();
        assert_ne!(partition_table_hash(&path, TableKind::Gpt).unwrap(), g1);
        assert_eq!(partition_table_hash(&path, TableKind::Dos).unwrap(), h1);
    }

    #[test]
    fn checkpoints() {
        let cp = Checkpoint::new("mbr", "abcdef0123456789");
        assert_eq!(cp.tag, "mbr");
        assert_eq!(cp.value, "abcde");
    }
}
