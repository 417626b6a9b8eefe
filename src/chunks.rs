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

//! Sampled-chunk hashing of the live partition.  Hashing a multi-gigabyte
//! squashfs in full at every boot is too slow; instead provisioning draws a
//! random but recorded set of small byte ranges per file, and boot replays
//! exactly those ranges.  An attacker cannot know which ranges are covered
//! without blob1, so patching around them is a lottery.

use anyhow::{anyhow, Context, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use crate::crypto;
use crate::errors::HardkeyError;
use crate::fingerprint::{Checkpoint, IntegrityLog};

const CHUNK_MIN: u64 = 1024;
const CHUNK_MAX: u64 = 2048;
const MAX_GAP: u64 = 768 * 1024;
const MIN_GAP: u64 = MAX_GAP * 2 / 3;

/// One file's sampling record.  `chunks` is None for symlinks, whose hash
/// covers the link target instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkEntry {
    #[serde(rename = "n")]
    pub name: String,
    #[serde(rename = "c")]
    pub chunks: Option<Vec<(u64, u64)>>,
    #[serde(rename = "s")]
    pub size: u64,
    /// First 5 hex digits of the running hash after folding this file in.
    #[serde(rename = "l")]
    pub checkpoint: String,
}

pub type ChunksMap = Vec<ChunkEntry>;

/// Draw a random set of `(position, length)` chunks covering `total` bytes.
fn generate_chunks(total: u64) -> Vec<(u64, u64)> {
    let mut rng = rand::thread_rng();
    let mut segments = Vec::new();
    let mut index = 0u64;
    while index < total {
        let pos = if index == 0 {
            0
        } else {
            index + rng.gen_range(MIN_GAP..MAX_GAP)
        };
        if pos >= total {
            break;
        }
        let length = rng.gen_range(CHUNK_MIN..CHUNK_MAX).min(total - pos);
        segments.push((pos, length));
        index = pos + length;
    }
    segments
}

/// Hash only the recorded chunks of one file.
fn chunked_file_hash(path: &Path, chunks: &[(u64, u64)]) -> Result<String> {
    let mut f = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut hasher = openssl::sha::Sha256::new();
    let mut buf = vec![0u8; CHUNK_MAX as usize];
    for (pos, len) in chunks {
        f.seek(SeekFrom::Start(*pos))
            .with_context(|| format!("seeking in {}", path.display()))?;
        let buf = &mut buf[..*len as usize];
        f.read_exact(buf)
            .with_context(|| format!("reading {}", path.display()))?;
        hasher.update(buf);
    }
    Ok(hex::encode(hasher.finish()))
}

fn link_target_hash(path: &Path) -> Result<String> {
    let target =
        std::fs::read_link(path).with_context(|| format!("reading link {}", path.display()))?;
    Ok(crypto::sha256_hex(target.to_string_lossy().as_bytes()))
}

/// Recursive sorted walk collecting every file and symlink under `root`,
/// as root-relative paths.
fn walk_sorted(root: &Path, rel: &str, out: &mut Vec<String>) -> Result<()> {
    let dir = if rel.is_empty() {
        root.to_path_buf()
    } else {
        root.join(rel)
    };
    let mut names = Vec::new();
    for entry in
        std::fs::read_dir(&dir).with_context(|| format!("reading directory {}", dir.display()))?
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
    for name in names {
        let child_rel = if rel.is_empty() {
            name.clone()
        } else {
            format!("{}/{}", rel, name)
        };
        let child = root.join(&child_rel);
        let meta = std::fs::symlink_metadata(&child)
            .with_context(|| format!("reading metadata of {}", child.display()))?;
        if meta.is_dir() && !meta.file_type().is_symlink() {
            walk_sorted(root, &child_rel, out)?;
        } else {
            out.push(child_rel);
        }
    }
    Ok(())
}

/// Running hash folding one `(name, file_hash)` pair at a time; the 5-hex
/// prefix after each fold is the file's checkpoint.
struct RunningHash {
    hasher: openssl::sha::Sha256,
}

impl RunningHash {
    fn new() -> Self {
        Self {
            hasher: openssl::sha::Sha256::new(),
        }
    }

    fn fold(&mut self, name: &str, file_hash: &str) -> String {
        self.hasher.update(name.as_bytes());
        self.hasher.update(b"/");
        self.hasher.update(file_hash.as_bytes());
        self.hasher.update(b"/");
        self.current()[..5].to_string()
    }

    fn current(&self) -> String {
        hex::encode(self.hasher.clone().finish())
    }
}

/// Sample every file under `root` and produce the chunks map, the final
/// hash, and the per-file checkpoint log.
pub fn create(root: &Path) -> Result<(ChunksMap, String, IntegrityLog)> {
    let mut files = Vec::new();
    walk_sorted(root, "", &mut files)?;

    let mut map = Vec::new();
    let mut log = Vec::new();
    let mut running = RunningHash::new();
    for rel in files {
        let path = root.join(&rel);
        let meta = std::fs::symlink_metadata(&path)
            .with_context(|| format!("reading metadata of {}", path.display()))?;
        let (chunks, size, file_hash) = if meta.file_type().is_symlink() {
            (None, 0, link_target_hash(&path)?)
        } else {
            let chunks = generate_chunks(meta.len());
            let hash = chunked_file_hash(&path, &chunks)?;
            (Some(chunks), meta.len(), hash)
        };
        let checkpoint = running.fold(&rel, &file_hash);
        log.push(Checkpoint {
            tag: rel.clone(),
            value: checkpoint.clone(),
        });
        map.push(ChunkEntry {
            name: rel,
            chunks,
            size,
            checkpoint,
        });
    }
    Ok((map, running.current(), log))
}

fn mismatch(context: String) -> anyhow::Error {
    anyhow!(HardkeyError::IntegrityMismatch).context(context)
}

/// Replay a chunks map against the tree at `root`.  Fails if any recorded
/// file is missing, changed size, has different sampled bytes, a symlink
/// target moved, or any file on disk is absent from the map.
pub fn verify(root: &Path, map: &[ChunkEntry]) -> Result<(String, IntegrityLog)> {
    let mut log = Vec::new();
    let mut running = RunningHash::new();

    for entry in map {
        let path = root.join(&entry.name);
        let meta = std::fs::symlink_metadata(&path)
            .map_err(|_| mismatch(format!("file {} not found", entry.name)))?;

        let file_hash = if meta.file_type().is_symlink() {
            if entry.chunks.is_some() {
                return Err(mismatch(format!("{} is now a symlink", entry.name)));
            }
            link_target_hash(&path)?
        } else {
            let chunks = entry
                .chunks
                .as_ref()
                .ok_or_else(|| mismatch(format!("{} should be a symlink", entry.name)))?;
            if meta.len() != entry.size {
                return Err(mismatch(format!(
                    "size of {} changed from {} to {}",
                    entry.name,
                    entry.size,
                    meta.len()
                )));
            }
            chunked_file_hash(&path, chunks)?
        };

        let checkpoint = running.fold(&entry.name, &file_hash);
        log.push(Checkpoint {
            tag: entry.name.clone(),
            value: checkpoint.clone(),
        });
        if checkpoint != entry.checkpoint {
            return Err(mismatch(format!("file {} has been modified", entry.name)));
        }
    }

    // no file may have been added
    let mut on_disk = Vec::new();
    walk_sorted(root, "", &mut on_disk)?;
    for rel in on_disk {
        if !map.iter().any(|e| e.name == rel) {
            return Err(mismatch(format!("file {} has been added", rel)));
        }
    }

    Ok((running.current(), log))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::kind_of;
    use std::fs;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    fn populate(dir: &TempDir) {
        fs::create_dir_all(dir.path().join("live0")).unwrap();
        // a file larger than the max gap so several chunks get drawn
        let mut big = vec![0u8; 3 * 1024 * 1024];
        for (i, b) in big.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        fs::write(dir.path().join("live0/filesystem.squashfs"), &big).unwrap();
        fs::write(dir.path().join("live0/vmlinuz"), b"tiny kernel").unwrap();
        fs::write(dir.path().join("valid-from-ts"), b"1700000000").unwrap();
        symlink("live0", dir.path().join("live")).unwrap();
    }

    #[test]
    fn create_then_verify() {
        let dir = TempDir::new().unwrap();
        populate(&dir);
        let (map, hash, log) = create(dir.path()).unwrap();
        assert_eq!(map.len(), 4);
        assert_eq!(log.len(), 4);

        let (vhash, vlog) = verify(dir.path(), &map).unwrap();
        assert_eq!(vhash, hash);
        assert_eq!(vlog, log);
    }

    #[test]
    fn single_byte_change_is_caught() {
        let dir = TempDir::new().unwrap();
        populate(&dir);
        let (map, _, _) = create(dir.path()).unwrap();

        // flip a byte inside a sampled chunk of the big file
        let path = dir.path().join("live0/filesystem.squashfs");
        let mut data = fs::read(&path).unwrap();
        let entry = map
            .iter()
            .find(|e| e.name == "live0/filesystem.squashfs")
            .unwrap();
        let (pos, _) = entry.chunks.as_ref().unwrap()[0];
        data[pos as usize] ^= 0xff;
        fs::write(&path, &data).unwrap();

        let err = verify(dir.path(), &map).unwrap_err();
        assert_eq!(kind_of(&err), Some(HardkeyError::IntegrityMismatch));
    }

    #[test]
    fn size_change_is_caught() {
        let dir = TempDir::new().unwrap();
        populate(&dir);
        let (map, _, _) = create(dir.path()).unwrap();

        fs::write(dir.path().join("live0/vmlinuz"), b"tiny kernel++").unwrap();
        let err = verify(dir.path(), &map).unwrap_err();
        assert_eq!(kind_of(&err), Some(HardkeyError::IntegrityMismatch));
    }

    #[test]
    fn added_and_removed_files_are_caught() {
        let dir = TempDir::new().unwrap();
        populate(&dir);
        let (map, _, _) = create(dir.path()).unwrap();

        fs::write(dir.path().join("live0/extra"), b"sneaky").unwrap();
        let err = verify(dir.path(), &map).unwrap_err();
        assert_eq!(kind_of(&err), Some(HardkeyError::IntegrityMismatch));
        fs::remove_file(dir.path().join("live0/extra")).unwrap();

        fs::remove_file(dir.path().join("live0/vmlinuz")).unwrap();
        let err = verify(dir.path(), &map).unwrap_err();
        assert_eq!(kind_of(&err), Some(HardkeyError::IntegrityMismatch));
    }

    #[test]
    fn symlink_target_change_is_caught() {
        let dir = TempDir::new().unwrap();
        populate(&dir);
        let (map, _, _) = create(dir.path()).unwrap();

        fs::remove_file(dir.path().join("live")).unwrap();
        symlink("live1", dir.path().join("live")).unwrap();
        let err = verify(dir.path(), &map).unwrap_err();
        assert_eq!(kind_of(&err), Some(HardkeyError::IntegrityMismatch));
    }

    #[test]
    fn chunk_geometry() {
        let chunks = generate_chunks(10 * 1024 * 1024);
        assert!(chunks.len() >= 10);
        assert_eq!(chunks[0].0, 0);
        let mut prev_end = 0;
        for (i, (pos, len)) in chunks.iter().enumerate() {
            if i > 0 {
                let gap = pos - prev_end;
                assert!((MIN_GAP..MAX_GAP).contains(&gap), "gap {}", gap);
            }
            assert!(*len >= 1 && *len < CHUNK_MAX);
            prev_end = pos + len;
        }

        // tiny files are fully covered by one chunk
        let small = generate_chunks(100);
        assert_eq!(small, vec![(0, 100)]);
        assert!(generate_chunks(0).is_empty());
    }

    #[test]
    fn map_serialization_format() {
        let entry = ChunkEntry {
            name: "live0/vmlinuz".into(),
            chunks: Some(vec![(0, 1608), (2300, 234)]),
            size: 3340,
            checkpoint: "f090c".into(),
        };
        let json = serde_json::to_string(&entry).unwrap();
        assert_eq!(
            json,
            r#"{"n":"live0/vmlinuz","c":[[0,1608],[2300,234]],"s":3340,"l":"f090c"}"#
        );
        let back: ChunkEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back, entry);
    }
}
