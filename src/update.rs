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

//! Live-image rotation on a running, unlocked key.  The replacement image
//! lands in the inactive slot and the boot-loader configuration is staged
//! to it; the active-slot pointer only moves at the next boot, so a
//! failure at any step leaves the old slot bootable.

use anyhow::{anyhow, bail, Context, Result};
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::blockdev::Mount;
use crate::chunks;
use crate::crypto::{KeyCipher, PassphraseCipher, Plain};
use crate::install::{verify_published_file, write_file};
use crate::live;

/// Everything the caller must already hold: an update only runs on an
/// unlocked key.
pub struct Updater<'a> {
    pub devfile: &'a Path,
    pub blob0: &'a str,
    /// Public key the published images are signed with.
    pub signing_pubkey: Option<&'a Path>,
    pub dummy_mountpoint: &'a Path,
    pub live_mountpoint: &'a Path,
    pub internal_mountpoint: &'a Path,
    pub efi_mountpoint: &'a Path,
    pub internal_pass: &'a str,
    pub data_pass: &'a str,
    /// (partition id, first sector, last sector) of the sealed layout.
    pub partitions: &'a [(String, u64, u64)],
    pub table: crate::blockdev::TableKind,
    pub sector_size: u64,
}

impl<'a> Updater<'a> {
    /// Apply a new live image.  Steps run in strict order; the active-slot
    /// pointer is never rewritten, so an interruption is harmless.
    pub fn update(&self, live_iso: &Path) -> Result<()> {
        if !live_iso.exists() {
            bail!("missing live image {}", live_iso.display());
        }
        let live_iso = live_iso
            .canonicalize()
            .with_context(|| format!("canonicalizing {}", live_iso.display()))?;

        // 1. the replacement image must carry a valid detached signature
        verify_published_file(&live_iso, self.signing_pubkey)?;
        if let Some(dir) = live_iso.parent() {
            for companion in ["infos.json", "live-linux.userdata-specs"] {
                let path = dir.join(companion);
                if path.exists() {
                    verify_published_file(&path, self.signing_pubkey)?;
                }
            }
        }

        // 2. write the inactive slot and stage the boot-loader switch
        let current = live::current_slot(self.live_mountpoint)?;
        let new_slot = 1 - current;
        eprintln!("Using live slot {}", new_slot);

        let iso_mount = Mount::try_mount_ro(&live_iso, Some("loop"))?;
        let result = (|| -> Result<()> {
            live::install_live_files(
                &live::slot_dir(self.live_mountpoint, new_slot),
                iso_mount.mountpoint(),
            )?;
            live::set_staged_slot(self.live_mountpoint, new_slot)?;
            self.stage_boot_params(new_slot)?;

            // 5. (from the same mounted image) refresh the UEFI binaries
            let binaries = iso_mount.mountpoint().join("boot-binaries.tar.xz");
            if binaries.exists() {
                let target = self.efi_mountpoint.join("EFI/boot");
                std::fs::create_dir_all(&target)
                    .with_context(|| format!("creating {}", target.display()))?;
                crate::runcmd!("tar", "-xJf", &binaries, "-C", &target)?;
            }
            Ok(())
        })();
        iso_mount.unmount()?;
        result?;

        // 3 and 4: chunks, fingerprint, passphrase blobs
        self.reseal()?;
        Ok(())
    }

    /// Recompute the chunks map over the live tree and rewrite the chain
    /// log and both encrypted-passphrase blobs under the resulting
    /// fingerprint.  Also the final step of applying a staged slot at boot.
    pub fn reseal(&self) -> Result<()> {
        let blob1_pub = std::fs::read(self.dummy_mountpoint.join(live::BLOB1_PUB_FILE))
            .context("reading blob1 public key")?;
        let blob1_priv = self.unwrap_blob1()?;
        let (map, live_hash, chunk_log) = chunks::create(self.live_mountpoint)?;
        let enc_chunks = KeyCipher::from_public_pem(&blob1_pub)?.encrypt(&Plain::Text(
            serde_json::to_string(&map).context("encoding chunks map")?,
        ))?;
        write_file(
            &self.dummy_mountpoint.join(live::CHUNKS_FILE),
            enc_chunks.as_bytes(),
            0o400,
        )?;

        let (fingerprint, mut log) = live::compute_integrity_fingerprint(
            &live::FingerprintInputs {
                devfile: self.devfile,
                table: self.table,
                sector_size: self.sector_size,
                partitions: self.partitions,
                dummy_mountpoint: self.dummy_mountpoint,
                efi_mountpoint: self.efi_mountpoint,
            },
            &blob1_priv,
            &live_hash,
        )?;
        log.extend(chunk_log);
        write_file(
            &self.internal_mountpoint.join(live::FINGERPRINT_LOG_FILE),
            serde_json::to_string(&log)
                .context("encoding chain log")?
                .as_bytes(),
            0o400,
        )?;

        let cipher = PassphraseCipher::new(&fingerprint);
        let enc_internal = cipher.encrypt(&Plain::Text(self.internal_pass.to_string()))?;
        write_file(
            &self.dummy_mountpoint.join(live::INTERNAL_PASS_FILE),
            enc_internal.as_bytes(),
            0o400,
        )?;
        let enc_data = cipher.encrypt(&Plain::Text(self.data_pass.to_string()))?;
        write_file(
            &self.internal_mountpoint.join(live::DATA_PASS_FILE),
            enc_data.as_bytes(),
            0o400,
        )?;

        nix::unistd::sync();
        Ok(())
    }

    fn unwrap_blob1(&self) -> Result<String> {
        let enc = std::fs::read_to_string(self.dummy_mountpoint.join(live::BLOB1_PRIV_FILE))
            .context("reading wrapped blob1 private key")?;
        PassphraseCipher::new(self.blob0)
            .decrypt(&enc)
            .context("unwrapping blob1 private key")?
            .into_string()
    }

    /// Point the active boot-params file at the new slot's canonical copy
    /// in every boot-loader configuration directory.
    fn stage_boot_params(&self, new_slot: u32) -> Result<()> {
        for dir in self.boot_config_dirs() {
            let slot_file = dir.join(format!("bootparams{}.cfg", new_slot));
            if !slot_file.exists() {
                bail!("missing canonical boot params {}", slot_file.display());
            }
            let contents = std::fs::read(&slot_file)
                .with_context(|| format!("reading {}", slot_file.display()))?;
            std::fs::write(dir.join("bootparams.cfg"), contents)
                .with_context(|| format!("staging boot params in {}", dir.display()))?;
        }
        Ok(())
    }

    fn boot_config_dirs(&self) -> Vec<PathBuf> {
        [
            self.efi_mountpoint.join("EFI/debian"),
            self.efi_mountpoint.join("boot/grub"),
        ]
        .into_iter()
        .filter(|d| d.exists())
        .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{kind_of, HardkeyError};
    use std::fs;
    use tempfile::TempDir;

    fn grub_dirs(efi: &Path) -> Vec<PathBuf> {
        vec![efi.join("EFI/debian"), efi.join("boot/grub")]
    }

    fn setup_efi(efi: &Path) {
        for dir in grub_dirs(efi) {
            fs::create_dir_all(&dir).unwrap();
            fs::write(
                dir.join("bootparams0.cfg"),
                "set bootuuid=AAAA\nset bootslot=live0\n",
            )
            .unwrap();
            fs::write(
                dir.join("bootparams1.cfg"),
                "set bootuuid=AAAA\nset bootslot=live1\n",
            )
            .unwrap();
            fs::write(
                dir.join("bootparams.cfg"),
                "set bootuuid=AAAA\nset bootslot=live0\n",
            )
            .unwrap();
        }
    }

    fn dummy_updater<'a>(
        devfile: &'a Path,
        dummy: &'a Path,
        live: &'a Path,
        internal: &'a Path,
        efi: &'a Path,
        partitions: &'a [(String, u64, u64)],
    ) -> Updater<'a> {
        Updater {
            devfile,
            blob0: "blob0-secret",
            signing_pubkey: None,
            dummy_mountpoint: dummy,
            live_mountpoint: live,
            internal_mountpoint: internal,
            efi_mountpoint: efi,
            internal_pass: "int-pass",
            data_pass: "data-pass",
            partitions,
            table: crate::blockdev::TableKind::Gpt,
            sector_size: 512,
        }
    }

    #[test]
    fn boot_params_staging() {
        let dir = TempDir::new().unwrap();
        let efi = dir.path().join("efi");
        setup_efi(&efi);
        let partitions: Vec<(String, u64, u64)> = Vec::new();
        let updater = dummy_updater(
            dir.path(),
            dir.path(),
            dir.path(),
            dir.path(),
            &efi,
            &partitions,
        );

        updater.stage_boot_params(1).unwrap();
        for gdir in grub_dirs(&efi) {
            assert_eq!(
                fs::read_to_string(gdir.join("bootparams.cfg")).unwrap(),
                "set bootuuid=AAAA\nset bootslot=live1\n"
            );
        }
        // the staged file matches a canonical slot file, so the EFI ignore
        // predicate keeps accepting the tree
        assert_eq!(
            live::efi_ignore(&efi, "boot/grub/bootparams.cfg"),
            crate::fingerprint::IgnoreDecision::Skip
        );

        // a missing canonical file refuses to stage
        for gdir in grub_dirs(&efi) {
            let _ = fs::remove_file(gdir.join("bootparams1.cfg"));
        }
        assert!(updater.stage_boot_params(1).is_err());
    }

    #[test]
    fn unsigned_image_is_refused_when_key_configured() {
        let dir = TempDir::new().unwrap();
        let iso = dir.path().join("v2.iso");
        fs::write(&iso, b"new image").unwrap();
        let (_, public) = crate::crypto::generate_rsa_keypair().unwrap();
        let pubfile = dir.path().join("signing.pub");
        fs::write(&pubfile, public).unwrap();

        let live = dir.path().join("live");
        fs::create_dir_all(live.join("live0")).unwrap();
        live::set_current_slot(&live, 0).unwrap();
        let efi = dir.path().join("efi");
        setup_efi(&efi);

        let partitions: Vec<(String, u64, u64)> = Vec::new();
        let mut updater = dummy_updater(
            dir.path(),
            dir.path(),
            &live,
            dir.path(),
            &efi,
            &partitions,
        );
        updater.signing_pubkey = Some(&pubfile);

        let err = updater.update(&iso).unwrap_err();
        assert_eq!(kind_of(&err), Some(HardkeyError::SignatureInvalid));
        // the inactive slot was left untouched
        assert!(!live.join("live1").exists());
        assert_eq!(live::staged_slot(&live).unwrap(), None);
    }
}
