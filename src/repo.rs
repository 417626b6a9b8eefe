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

//! Repository engine: a content-addressed, deduplicating, encrypted
//! archive store backed by Borg.  Archives hold live-image payloads and
//! configuration snapshots; segment-level dedup keeps repeated publishes
//! cheap.

use anyhow::{anyhow, bail, Context, Result};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::sleep;
use std::time::Duration;
use uuid::Uuid;
use walkdir::WalkDir;

use crate::crypto;
use crate::errors::HardkeyError;
use crate::util::*;

/// Segment size written into a fresh repository's config; bounds local
/// cache pressure when mirroring.
const MAX_SEGMENT_SIZE: u64 = 32 * 1024 * 1024;

pub struct Repo {
    repo_dir: PathBuf,
    passphrase: String,
    /// Borg keeps per-repository state under BORG_CONFIG_DIR/BORG_CACHE_DIR;
    /// scoped here so concurrent repositories never share it.
    state_dir: tempfile::TempDir,
    /// archive name -> (mountpoint, FUSE helper process)
    mounts: HashMap<String, (PathBuf, Child)>,
}

impl Repo {
    pub fn at(repo_dir: &Path, passphrase: &str) -> Result<Self> {
        let state_dir = tempfile::Builder::new()
            .prefix("hardkey-repo-")
            .tempdir()
            .context("creating repository state directory")?;
        std::fs::create_dir_all(state_dir.path().join("config"))
            .context("creating borg config dir")?;
        std::fs::create_dir_all(state_dir.path().join("cache"))
            .context("creating borg cache dir")?;
        Ok(Repo {
            repo_dir: repo_dir.to_path_buf(),
            passphrase: passphrase.to_string(),
            state_dir,
            mounts: HashMap::new(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.repo_dir
    }

    fn borg_cmd(&self) -> Command {
        let mut cmd = Command::new("borg");
        cmd.env("BORG_PASSPHRASE", &self.passphrase)
            .env("BORG_REPO", &self.repo_dir)
            .env("BORG_RELOCATED_REPO_ACCESS_IS_OK", "yes")
            .env("BORG_CONFIG_DIR", self.state_dir.path().join("config"))
            .env("BORG_CACHE_DIR", self.state_dir.path().join("cache"));
        cmd
    }

    /// Run borg, classifying failures into typed error kinds.
    fn borg_run(&self, cmd: &mut Command, context: &str) -> Result<String> {
        let result = cmd_run_stdin(cmd, b"Y")?;
        if result.success() {
            return result.stdout_string();
        }
        Err(classify_borg_error(context, &result.stderr))
    }

    /// Create a new empty repository keyed by the passphrase.
    pub fn init(&self) -> Result<()> {
        std::fs::create_dir_all(&self.repo_dir)
            .with_context(|| format!("creating {}", self.repo_dir.display()))?;
        self.borg_run(
            self.borg_cmd()
                .arg("init")
                .arg("--encryption=repokey")
                .arg(&self.repo_dir),
            "initializing repository",
        )?;
        // bound the segment size so a partial mirror is recoverable in
        // small pieces
        rewrite_config_line(
            &self.repo_dir.join("config"),
            "max_segment_size",
            &format!("max_segment_size = {}", MAX_SEGMENT_SIZE),
        )?;
        Ok(())
    }

    /// Atomically snapshot a directory tree under a fresh UUID name.
    pub fn create_archive(&self, source_dir: &Path, compress: bool) -> Result<String> {
        let name = Uuid::new_v4().to_string();
        let mut cmd = self.borg_cmd();
        cmd.arg("create")
            .arg("-C")
            .arg(if compress { "lzma,9" } else { "none" })
            .arg(format!("::{}", name))
            .arg(".")
            .current_dir(source_dir);
        self.borg_run(&mut cmd, "creating archive")?;
        Ok(name)
    }

    /// All archives, keyed by creation timestamp (`YYYY-MM-DD HH:MM:SS`,
    /// which orders chronologically); ties broken by name.
    pub fn list_archives(&self) -> Result<BTreeMap<String, String>> {
        let out = self.borg_run(self.borg_cmd().arg("list"), "listing archives")?;
        parse_archive_list(&out)
    }

    pub fn latest_archive(&self) -> Result<Option<(String, String)>> {
        Ok(self
            .list_archives()?
            .into_iter()
            .next_back()
            .map(|(ts, name)| (ts, name)))
    }

    pub fn archive_exists(&self, name: &str) -> Result<bool> {
        if self.mounts.contains_key(name) {
            return Ok(true);
        }
        Ok(self.list_archives()?.values().any(|n| n == name))
    }

    /// Restore an archive (or a subset of its entries) into `dest_dir`.
    pub fn extract(&self, name: &str, dest_dir: &Path, subset: Option<&[&str]>) -> Result<()> {
        if !dest_dir.is_dir() {
            return Err(anyhow!(HardkeyError::ArchiveMissing)
                .context(format!("destination {} is not a directory", dest_dir.display())));
        }
        let mut cmd = self.borg_cmd();
        cmd.arg("extract")
            .arg("--sparse")
            .arg(format!("::{}", name))
            .current_dir(dest_dir);
        if let Some(files) = subset {
            for f in files {
                cmd.arg(f);
            }
        }
        self.borg_run(&mut cmd, "extracting archive")
            .with_context(|| format!("extracting archive {}", name))?;
        Ok(())
    }

    pub fn list_archive_contents(&self, name: &str) -> Result<String> {
        self.borg_run(
            self.borg_cmd().arg("list").arg(format!("::{}", name)),
            "listing archive contents",
        )
    }

    pub fn delete_archive(&self, name: &str) -> Result<()> {
        self.borg_run(
            self.borg_cmd().arg("delete").arg(format!("::{}", name)),
            "deleting archive",
        )?;
        Ok(())
    }

    /// Compact orphaned segments.
    pub fn vacuum(&self) -> Result<()> {
        self.borg_run(self.borg_cmd().arg("compact"), "compacting repository")?;
        Ok(())
    }

    /// Mount an archive read-only through the FUSE helper and return the
    /// mountpoint.  The helper runs foreground as a managed child.
    pub fn mount(&mut self, name: &str) -> Result<PathBuf> {
        if let Some((mp, _)) = self.mounts.get(name) {
            return Ok(mp.clone());
        }
        let mountpoint = tempfile::Builder::new()
            .prefix("hardkey-ar-")
            .tempdir()
            .context("creating archive mountpoint")?
            .into_path();

        let mut cmd = self.borg_cmd();
        cmd.arg("mount")
            .arg("-f")
            .arg(format!("::{}", name))
            .arg(&mountpoint)
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        let mut child = cmd
            .spawn()
            .with_context(|| format!("mounting archive {}", name))?;

        // give the helper a moment; an immediate exit is an error
        sleep(Duration::from_millis(500));
        if let Some(status) = child.try_wait().context("checking FUSE helper")? {
            let mut stderr = String::new();
            if let Some(mut err) = child.stderr.take() {
                use std::io::Read;
                let _ = err.read_to_string(&mut stderr);
            }
            let _ = std::fs::remove_dir(&mountpoint);
            if !status.success() {
                return Err(classify_borg_error("mounting archive", &stderr));
            }
        }

        // wait until the archive contents are actually visible
        for _ in 0..6 {
            if std::fs::read_dir(&mountpoint)
                .map(|mut d| d.next().is_some())
                .unwrap_or(false)
            {
                break;
            }
            sleep(Duration::from_millis(500));
        }

        self.mounts
            .insert(name.to_string(), (mountpoint.clone(), child));
        Ok(mountpoint)
    }

    pub fn unmount(&mut self, name: &str) -> Result<()> {
        let (mountpoint, mut child) = match self.mounts.remove(name) {
            Some(m) => m,
            None => return Ok(()),
        };
        // ask the FUSE helper to exit, then clean up the mount
        stop_child(&mut child, Duration::from_secs(10))
            .context("stopping FUSE helper")?;
        let _ = self.borg_run(
            self.borg_cmd().arg("umount").arg(&mountpoint),
            "unmounting archive",
        );
        let _ = std::fs::remove_dir(&mountpoint);
        Ok(())
    }

    pub fn unmount_all(&mut self) -> Result<()> {
        let names: Vec<String> = self.mounts.keys().cloned().collect();
        for name in names {
            self.unmount(&name)?;
        }
        Ok(())
    }

    /// Self-verify the repository.  Returns None when healthy, or the list
    /// of corrupted on-disk segment files so the caller can rewind their
    /// modification times and request a resynchronization.
    pub fn check(&self) -> Result<Option<Vec<PathBuf>>> {
        let result = cmd_run_stdin(self.borg_cmd().arg("check"), b"")?;
        if result.success() {
            if self.repo_dir.join("lock.roster").exists() {
                return Err(anyhow!(HardkeyError::RepositoryLocked)
                    .context("repository is already being used, try again later"));
            }
            return Ok(None);
        }

        let segments = broken_segments(&result.stderr);
        if segments.is_empty() {
            return Err(classify_borg_error("checking repository", &result.stderr));
        }
        let mut paths = Vec::new();
        for segment in segments {
            for entry in WalkDir::new(self.repo_dir.join("data"))
                .into_iter()
                .filter_map(|e| e.ok())
            {
                if entry.file_type().is_file()
                    && entry.file_name().to_string_lossy() == segment
                {
                    paths.push(entry.path().to_path_buf());
                }
            }
        }
        Ok(Some(paths))
    }

    /// Rotate access without rewriting archive content.
    pub fn change_passphrase(&mut self, new_passphrase: &str) -> Result<()> {
        let mut cmd = self.borg_cmd();
        cmd.arg("key")
            .arg("change-passphrase")
            .env("BORG_NEW_PASSPHRASE", new_passphrase);
        self.borg_run(&mut cmd, "changing repository passphrase")?;
        self.passphrase = new_passphrase.to_string();
        Ok(())
    }

    /// Give the repository a fresh identity; mirrors treat it as a new
    /// repository without any data being rewritten.
    pub fn rotate_id(&self) -> Result<()> {
        let id = crypto::generate_password(64, Some("abcdef0123456789"))?;
        rewrite_config_line(
            &self.repo_dir.join("config"),
            "id =",
            &format!("id = {}", id),
        )
    }
}

impl Drop for Repo {
    fn drop(&mut self) {
        if let Err(e) = self.unmount_all() {
            eprintln!("unmounting archives of {}: {:#}", self.repo_dir.display(), e);
        }
    }
}

/// Map borg stderr to a typed error.
fn classify_borg_error(context: &str, stderr: &str) -> anyhow::Error {
    eprint!("{}", stderr);
    let kind = if stderr.contains("Data integrity error") {
        HardkeyError::RepositoryCorrupt
    } else if stderr.contains("MemoryError") {
        HardkeyError::OutOfMemory
    } else if stderr.contains("Failed to create/acquire the lock") {
        HardkeyError::RepositoryLocked
    } else if stderr.contains("does not exist") {
        HardkeyError::ArchiveMissing
    } else {
        return anyhow!("{}: borg failed", context);
    };
    anyhow!(kind).context(context.to_string())
}

/// Parse `borg list` output, e.g.
/// `b7760356-7e2c-11ea-be7b-5703d69f8bcb Tue, 2020-04-14 10:48:34`.
fn parse_archive_list(out: &str) -> Result<BTreeMap<String, String>> {
    let mut archives = BTreeMap::new();
    for line in out.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 4 {
            bail!("could not parse archive list line {:?}", line);
        }
        archives.insert(format!("{} {}", parts[2], parts[3]), parts[0].to_string());
    }
    Ok(archives)
}

/// Extract segment numbers from check errors like
/// `Data integrity error: Segment entry checksum mismatch [segment 739, offset 1224]`.
fn broken_segments(stderr: &str) -> Vec<String> {
    let mut segments = Vec::new();
    for line in stderr.lines() {
        if let Some(rest) = line.split("[segment ").nth(1) {
            if let Some(num) = rest.split(',').next() {
                segments.push(num.trim().to_string());
            }
        }
    }
    segments
}

/// Replace the config line starting with `prefix`; error if absent, since
/// that means the on-disk format changed under us.
fn rewrite_config_line(config: &Path, prefix: &str, replacement: &str) -> Result<()> {
    let contents = std::fs::read_to_string(config)
        .with_context(|| format!("reading {}", config.display()))?;
    let mut replaced = false;
    let lines: Vec<String> = contents
        .lines()
        .map(|line| {
            if line.starts_with(prefix) {
                replaced = true;
                replacement.to_string()
            } else {
                line.to_string()
            }
        })
        .collect();
    if !replaced {
        bail!(
            "could not find {:?} in {}; repository format changed?",
            prefix,
            config.display()
        );
    }
    std::fs::write(config, lines.join("\n"))
        .with_context(|| format!("writing {}", config.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::kind_of;

    #[test]
    fn archive_list_parsing() {
        let out = "b7760356-7e2c-11ea-be7b-5703d69f8bcb Tue, 2020-04-14 10:48:34\n\
                   11111111-2222-3333-4444-555555555555 Wed, 2020-04-15 09:00:00\n";
        let archives = parse_archive_list(out).unwrap();
        assert_eq!(archives.len(), 2);
        assert_eq!(
            archives["2020-04-14 10:48:34"],
            "b7760356-7e2c-11ea-be7b-5703d69f8bcb"
        );
        // BTreeMap orders chronologically, so the newest comes last
        assert_eq!(
            archives.iter().next_back().unwrap().1,
            "11111111-2222-3333-4444-555555555555"
        );
        assert!(parse_archive_list("garbage line\n").is_err());
        assert!(parse_archive_list("").unwrap().is_empty());
    }

    #[test]
    fn segment_extraction() {
        let stderr = "Data integrity error: Segment entry checksum mismatch \
                      [segment 739, offset 1224]\nsome other line\n\
                      Data integrity error: bad [segment 42, offset 0]\n";
        assert_eq!(broken_segments(stderr), vec!["739", "42"]);
        assert!(broken_segments("all good").is_empty());
    }

    #[test]
    fn error_classification() {
        assert_eq!(
            kind_of(&classify_borg_error("x", "Data integrity error: ...")),
            Some(HardkeyError::RepositoryCorrupt)
        );
        assert_eq!(
            kind_of(&classify_borg_error("x", "MemoryError")),
            Some(HardkeyError::OutOfMemory)
        );
        assert_eq!(
            kind_of(&classify_borg_error(
                "x",
                "Failed to create/acquire the lock"
            )),
            Some(HardkeyError::RepositoryLocked)
        );
        assert_eq!(kind_of(&classify_borg_error("x", "weird failure")), None);
    }

    #[test]
    fn config_rewrite() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = dir.path().join("config");
        std::fs::write(
            &config,
            "[repository]\nversion = 1\nid = aabbcc\nmax_segment_size = 524288000\n",
        )
        .unwrap();

        rewrite_config_line(&config, "max_segment_size", "max_segment_size = 33554432")
            .unwrap();
        let contents = std::fs::read_to_string(&config).unwrap();
        assert!(contents.contains("max_segment_size = 33554432"));
        assert!(contents.contains("id = aabbcc"));

        rewrite_config_line(&config, "id =", "id = ddeeff").unwrap();
        let contents = std::fs::read_to_string(&config).unwrap();
        assert!(contents.contains("id = ddeeff"));

        assert!(rewrite_config_line(&config, "no_such_key", "x").is_err());
    }
}
