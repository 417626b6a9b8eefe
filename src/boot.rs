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

//! Boot process: runs on the key itself after the live system is up.
//! Recomputes the integrity chain, unlocks the operational partitions only
//! when the device is intact, applies a staged live-image update, and runs
//! the per-component setup scripts.

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::blockdev::{self, Disk};
use crate::chunks;
use crate::crypto::{CryptoEngine, KeyCipher, PassphraseCipher, Plain};
use crate::encryption::{volume, EncryptionKind};
use crate::errors::HardkeyError;
use crate::live;
use crate::metadata;
use crate::update::Updater;
use crate::util::*;
use crate::{runcmd, runcmd_output};

const RUN_DIR: &str = "/run/hardkey";
const INTERNAL_MOUNT: &str = "/internal";
const EVENTS_FILE: &str = "events.jsonl";

/// Secrets and mountpoints of an unlocked key.  The session holds the
/// exclusive mounts of the internal and data partitions for its lifetime;
/// it can be saved to a root-only file so later invocations on the same
/// boot can pick it up.
#[derive(Serialize, Deserialize)]
pub struct BootSession {
    pub blob0: String,
    pub internal_pass: String,
    pub data_pass: String,
    pub user_slot: String,
    pub cn: String,
    pub dummy_mountpoint: PathBuf,
    pub live_mountpoint: PathBuf,
    pub efi_mountpoint: PathBuf,
    pub internal_mountpoint: PathBuf,
    pub data_mountpoint: PathBuf,
    /// Sealed layout excerpts needed to reseal after a staged update.
    pub partitions: Vec<(String, u64, u64)>,
    pub table: blockdev::TableKind,
    pub sector_size: u64,
    pub devfile: PathBuf,
    pub signing_pubkey: Option<PathBuf>,
}

/// Where the live image carries the administrator's metadata-verification
/// public key.  The key is baked into the published (signed) image at
/// build time, so it predates anything read off the device under test.
pub const PRELOADED_VERIFY_KEY: &str = "/etc/hardkey/meta-sign.pub";

pub struct BootProcess {
    disk: Disk,
    /// The preloaded administrator public key.  Never sourced from the
    /// key device itself: the signature check exists to catch tampering
    /// on that device, so a key read back from it would authenticate
    /// whatever an attacker planted alongside their own records.
    verify_key: Vec<u8>,
    /// Where the user's data partition lands.
    data_mount_target: PathBuf,
    data_mount_options: Option<String>,
}

impl BootProcess {
    pub fn new(
        devfile: &Path,
        verify_key: &Path,
        data_mount_target: &Path,
        data_mount_options: Option<&str>,
    ) -> Result<Self> {
        let verify_key = std::fs::read(verify_key).with_context(|| {
            format!(
                "reading preloaded verification key {}",
                verify_key.display()
            )
        })?;
        Ok(BootProcess {
            disk: Disk::open(devfile)?,
            verify_key,
            data_mount_target: data_mount_target.to_path_buf(),
            data_mount_options: data_mount_options.map(String::from),
        })
    }

    /// The whole unlock sequence.  Any failure aborts with its originating
    /// kind; no partition is left opened on the way out.
    pub fn unlock(&mut self, user_secret: &str) -> Result<BootSession> {
        // (a) authenticate the device with the preloaded administrator
        // key before acting on anything the records claim
        let mut meta = metadata::read_records(self.disk.devfile())?;
        meta.verify_with_engines(&admin_verifiers(&self.verify_key)?)
            .context("device metadata does not authenticate")?;
        let layout = meta.observed_layout()?.clone();
        let numbers = partition_numbers(&layout);

        let dummy_number = *numbers.get(live::PARTID_DUMMY).ok_or_else(|| {
            anyhow!(HardkeyError::MetadataCorrupt).context("no dummy partition recorded")
        })?;
        let dummy_mp = self
            .disk
            .mount_partition(dummy_number, None, None, None, false)?;

        // (b) recover blob0 from the user's slot
        let (blob0, user_slot, cn) = live::unlock_blob0(&dummy_mp, user_secret)?;

        // (c) blob0 releases blob1's private half
        let enc_blob1 = std::fs::read_to_string(dummy_mp.join(live::BLOB1_PRIV_FILE))
            .context("reading wrapped blob1 private key")?;
        let blob1_priv = PassphraseCipher::new(&blob0)
            .decrypt(&enc_blob1)
            .context("unwrapping blob1 private key")?
            .into_string()?;

        // (d) blob1 releases the chunks map
        let enc_chunks = std::fs::read_to_string(dummy_mp.join(live::CHUNKS_FILE))
            .context("reading encrypted chunks map")?;
        let chunks_map: chunks::ChunksMap = serde_json::from_str(
            &KeyCipher::from_private_pem(blob1_priv.as_bytes())?
                .decrypt(&enc_chunks)
                .context("decrypting chunks map")?
                .into_string()?,
        )
        .map_err(|_| anyhow!(HardkeyError::MetadataCorrupt).context("chunks map is malformed"))?;

        // (e) replay the chunks over the live partition
        let live_number = *numbers.get(live::PARTID_LIVE).ok_or_else(|| {
            anyhow!(HardkeyError::MetadataCorrupt).context("no live partition recorded")
        })?;
        let live_mp = self
            .disk
            .mount_partition(live_number, None, None, None, false)?;
        live::check_valid_from(&live_mp)?;
        let (live_hash, live_log) = chunks::verify(&live_mp, &chunks_map)
            .context("live partition failed chunk verification")?;

        // (f) the rest of the chain
        let efi_number = *numbers.get(live::PARTID_EFI).ok_or_else(|| {
            anyhow!(HardkeyError::MetadataCorrupt).context("no EFI partition recorded")
        })?;
        let efi_mp = self
            .disk
            .mount_partition(efi_number, None, None, None, false)?;
        let partitions: Vec<(String, u64, u64)> = layout
            .partitions
            .iter()
            .map(|p| {
                (
                    p.id.clone().unwrap_or_else(|| format!("p{}", p.number)),
                    p.sector_start,
                    p.sector_end,
                )
            })
            .collect();
        let (fingerprint, mut log) = live::compute_integrity_fingerprint(
            &live::FingerprintInputs {
                devfile: self.disk.devfile(),
                table: layout.table,
                sector_size: layout.sector_size,
                partitions: &partitions,
                dummy_mountpoint: &dummy_mp,
                efi_mountpoint: &efi_mp,
            },
            &blob1_priv,
            &live_hash,
        )?;
        log.extend(live_log);
        write_boot_log(&log)?;

        // (g) the fingerprint releases the internal partition
        let enc_internal = std::fs::read_to_string(dummy_mp.join(live::INTERNAL_PASS_FILE))
            .context("reading encrypted internal passphrase")?;
        let cipher = PassphraseCipher::new(&fingerprint);
        let internal_pass = cipher
            .decrypt(&enc_internal)
            .map_err(|_| {
                anyhow!(HardkeyError::IntegrityMismatch)
                    .context("the integrity fingerprint does not release the internal partition")
            })?
            .into_string()?;

        let internal_number = *numbers.get(live::PARTID_INTERNAL).ok_or_else(|| {
            anyhow!(HardkeyError::MetadataCorrupt).context("no internal partition recorded")
        })?;
        let internal_part = self.disk.partition_path(internal_number);
        let internal_vol = volume(EncryptionKind::Luks, &internal_part);
        let mapped = match internal_vol.is_open()? {
            Some(m) => m,
            None => internal_vol.open(&internal_pass)?,
        };
        let internal_mp = self.disk.mount_partition(
            internal_number,
            Some(&mapped),
            Some(Path::new(INTERNAL_MOUNT)),
            Some("nodev"),
            true,
        )?;

        // (h) the internal partition releases the data partition
        let enc_data = std::fs::read_to_string(internal_mp.join(live::DATA_PASS_FILE))
            .context("reading encrypted data passphrase")?;
        let data_pass = cipher
            .decrypt(&enc_data)
            .map_err(|_| {
                anyhow!(HardkeyError::IntegrityMismatch)
                    .context("the integrity fingerprint does not release the data partition")
            })?
            .into_string()?;

        let data_number = *numbers.get(live::PARTID_DATA).ok_or_else(|| {
            anyhow!(HardkeyError::MetadataCorrupt).context("no data partition recorded")
        })?;
        let data_enc = layout
            .partitions
            .iter()
            .find(|p| p.id.as_deref() == Some(live::PARTID_DATA))
            .and_then(|p| p.encryption)
            .unwrap_or(EncryptionKind::Luks);
        let data_part = self.disk.partition_path(data_number);
        let data_vol = volume(data_enc, &data_part);
        let data_mapped = match data_vol.is_open()? {
            Some(m) => m,
            None => data_vol.open(&data_pass)?,
        };
        let data_mp = self.disk.mount_partition(
            data_number,
            Some(&data_mapped),
            Some(&self.data_mount_target),
            self.data_mount_options.as_deref(),
            true,
        )?;

        let session = BootSession {
            blob0,
            internal_pass,
            data_pass,
            user_slot,
            cn,
            dummy_mountpoint: dummy_mp,
            live_mountpoint: live_mp,
            efi_mountpoint: efi_mp,
            internal_mountpoint: internal_mp,
            data_mountpoint: data_mp,
            partitions,
            table: layout.table,
            sector_size: layout.sector_size,
            devfile: self.disk.devfile().to_path_buf(),
            signing_pubkey: None,
        };
        session.record_event("booted", serde_json::json!({}))?;
        Ok(session)
    }
}

fn partition_numbers(layout: &metadata::SealedLayout) -> BTreeMap<String, u32> {
    let mut numbers = BTreeMap::new();
    for part in &layout.partitions {
        if let Some(id) = &part.id {
            numbers.insert(id.clone(), part.number);
        }
    }
    numbers
}

/// Every record must carry the administrator's signature, verified with
/// the preloaded key only.
fn admin_verifiers(pem: &[u8]) -> Result<BTreeMap<String, CryptoEngine>> {
    let mut verifiers = BTreeMap::new();
    verifiers.insert(
        "Admin".to_string(),
        CryptoEngine::Key(KeyCipher::from_public_pem(pem)?),
    );
    Ok(verifiers)
}

fn write_boot_log(log: &[crate::fingerprint::Checkpoint]) -> Result<()> {
    std::fs::create_dir_all(RUN_DIR).context("creating run directory")?;
    std::fs::write(
        Path::new(RUN_DIR).join("integrity-fingerprint-log.json"),
        serde_json::to_string(log).context("encoding boot log")?,
    )
    .context("writing boot log")?;
    Ok(())
}

#[derive(Serialize)]
struct Event<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    ts: u64,
    data: serde_json::Value,
}

impl BootSession {
    /// Persist the session for later invocations on the same boot.  The
    /// file holds live secrets; it is root-only and lives on a tmpfs.
    pub fn save(&self) -> Result<()> {
        std::fs::create_dir_all(RUN_DIR).context("creating run directory")?;
        let path = Path::new(RUN_DIR).join("session.json");
        let data = serde_json::to_string(self).context("encoding session")?;
        std::fs::write(&path, data).with_context(|| format!("writing {}", path.display()))?;
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
            .context("restricting session file")?;
        Ok(())
    }

    pub fn load() -> Result<Self> {
        let path = Path::new(RUN_DIR).join("session.json");
        let data = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}; is the key unlocked?", path.display()))?;
        serde_json::from_str(&data).context("parsing session file")
    }

    /// Append an event to the key's on-device event log.
    pub fn record_event(&self, kind: &str, data: serde_json::Value) -> Result<()> {
        let event = Event {
            kind,
            ts: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .context("reading system clock")?
                .as_secs(),
            data,
        };
        let path = self.internal_mountpoint.join(EVENTS_FILE);
        let mut line = serde_json::to_string(&event).context("encoding event")?;
        line.push('\n');
        use std::io::Write;
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening {}", path.display()))?
            .write_all(line.as_bytes())
            .with_context(|| format!("appending to {}", path.display()))?;
        Ok(())
    }

    fn updater(&self) -> Updater {
        Updater {
            devfile: &self.devfile,
            blob0: &self.blob0,
            signing_pubkey: self.signing_pubkey.as_deref(),
            dummy_mountpoint: &self.dummy_mountpoint,
            live_mountpoint: &self.live_mountpoint,
            internal_mountpoint: &self.internal_mountpoint,
            efi_mountpoint: &self.efi_mountpoint,
            internal_pass: &self.internal_pass,
            data_pass: &self.data_pass,
            partitions: &self.partitions,
            table: self.table,
            sector_size: self.sector_size,
        }
    }

    /// If an update was staged, move the active-slot pointer to it and
    /// reseal the integrity material.  The verification that just passed
    /// covered the staged state, so this is the first safe moment to flip.
    pub fn apply_staged_update(&self) -> Result<()> {
        let staged = match live::staged_slot(&self.live_mountpoint)? {
            Some(s) => s,
            None => return Ok(()),
        };
        if staged == live::current_slot(&self.live_mountpoint)? {
            live::clear_staged_slot(&self.live_mountpoint)?;
            return Ok(());
        }
        live::set_current_slot(&self.live_mountpoint, staged)?;
        live::clear_staged_slot(&self.live_mountpoint)?;
        self.updater().reseal()?;
        self.record_event("update-applied", serde_json::json!({ "slot": staged }))?;
        Ok(())
    }

    /// Rotate the live image from a freshly published ISO.
    pub fn update(&mut self, live_iso: &Path, signing_pubkey: Option<&Path>) -> Result<()> {
        self.signing_pubkey = signing_pubkey.map(Path::to_path_buf);
        self.updater().update(live_iso)?;
        self.record_event(
            "update-staged",
            serde_json::json!({ "image": live_iso.to_string_lossy() }),
        )?;
        Ok(())
    }

    /// Post-unlock component setup: extract PRIVDATA bundles, run the
    /// two-stage configuration scripts, regenerate host SSH keys on first
    /// boot.
    pub fn post_unlock(&self, live_root: &Path) -> Result<()> {
        self.extract_privdata(live_root)?;
        for stage in 0..=1 {
            self.run_component_scripts(live_root, &format!("configure{}", stage), true)?;
        }
        self.setup_ssh_keys()?;
        Ok(())
    }

    /// Best-effort session teardown: shutdown scripts may fail without
    /// blocking power-off.
    pub fn session_end(&self, live_root: &Path) {
        if let Err(e) = self.run_component_scripts(live_root, "shutdown", false) {
            eprintln!("session-end scripts: {:#}", e);
        }
        let _ = self.record_event("shutdown", serde_json::json!({}));
    }

    /// Decrypt and unpack each component's PRIVDATA bundle into the live
    /// root.
    fn extract_privdata(&self, live_root: &Path) -> Result<()> {
        let components_dir = live_root.join("resources/components");
        if !components_dir.exists() {
            return Ok(());
        }
        let privdata_key = std::fs::read(self.internal_mountpoint.join(live::PRIVDATA_KEY_FILE))
            .context("reading PRIVDATA private key")?;
        let cipher = KeyCipher::from_private_pem(&privdata_key)?;

        for entry in std::fs::read_dir(&components_dir)
            .with_context(|| format!("reading {}", components_dir.display()))?
        {
            let entry = entry?;
            let bundle = entry.path().join("privdata.tar.enc");
            if !bundle.exists() {
                continue;
            }
            let envelope = std::fs::read_to_string(&bundle)
                .with_context(|| format!("reading {}", bundle.display()))?;
            let tarball = cipher
                .decrypt(envelope.trim())
                .with_context(|| format!("decrypting {}", bundle.display()))?;
            let mut tmp = tempfile::Builder::new()
                .prefix("hardkey-privdata-")
                .suffix(".tar")
                .tempfile()
                .context("creating scratch tarball")?;
            use std::io::Write;
            tmp.write_all(tarball.as_bytes())
                .context("writing scratch tarball")?;
            runcmd!("tar", "-xf", tmp.path(), "-C", live_root)?;
        }
        Ok(())
    }

    /// Run one named script of every component, stage by stage, with the
    /// documented environment.  With `propagate` unset, failures are
    /// logged and swallowed.
    fn run_component_scripts(
        &self,
        live_root: &Path,
        script_name: &str,
        propagate: bool,
    ) -> Result<()> {
        let components_dir = live_root.join("resources/components");
        if !components_dir.exists() {
            return Ok(());
        }
        let mut component_dirs: Vec<PathBuf> = std::fs::read_dir(&components_dir)
            .with_context(|| format!("reading {}", components_dir.display()))?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect();
        component_dirs.sort();

        for dir in component_dirs {
            let script = dir.join(script_name);
            if !script.exists() {
                continue;
            }
            let component = dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let conf_dir = self.internal_mountpoint.join("components").join(&component);

            let mut cmd = Command::new(&script);
            cmd.env("CONF_DIR", &conf_dir)
                .env("CONF_DATA_FILE", conf_dir.join("userdata.json"))
                .env("LIVE_DIR", live_root)
                .env("PRIVDATA_DIR", dir.join("privdata"))
                .env("USERDATA_DIR", &conf_dir)
                .env("BUILD_DIR", &dir)
                .env("BUILD_DATA_FILE", dir.join("build.json"));
            for (name, value) in self.l10n_env() {
                cmd.env(name, value);
            }

            let status = cmd
                .status()
                .with_context(|| format!("running {}", script.display()));
            match status {
                Ok(s) if s.success() => (),
                Ok(s) => {
                    let msg = format!("{} failed with {}", script.display(), s);
                    if propagate {
                        bail!(msg);
                    }
                    eprintln!("{}", msg);
                    let _ = self.record_event(
                        "script-failure",
                        serde_json::json!({ "script": script.to_string_lossy() }),
                    );
                }
                Err(e) => {
                    if propagate {
                        return Err(e);
                    }
                    eprintln!("{:#}", e);
                }
            }
        }
        Ok(())
    }

    fn l10n_env(&self) -> Vec<(String, String)> {
        // the build's localisation descriptor travels with the key config
        let path = self.internal_mountpoint.join(live::KEY_CONFIG_FILE);
        let l10n = std::fs::read_to_string(path)
            .ok()
            .and_then(|data| serde_json::from_str::<serde_json::Value>(&data).ok())
            .and_then(|v| {
                serde_json::from_value::<crate::config::L10n>(v.get("l10n")?.clone()).ok()
            })
            .unwrap_or_default();
        l10n.env_vars()
    }

    /// Generate per-host SSH keys on first boot only, and deploy them over
    /// whatever the image shipped.
    fn setup_ssh_keys(&self) -> Result<()> {
        let keys_dir = self.internal_mountpoint.join("ssh-keys");
        std::fs::create_dir_all(&keys_dir)
            .with_context(|| format!("creating {}", keys_dir.display()))?;
        let privkey = keys_dir.join("ssh_host_ed25519_key");
        let pubkey = keys_dir.join("ssh_host_ed25519_key.pub");

        if !privkey.exists() {
            runcmd!("ssh-keygen", "-q", "-N", "", "-t", "ed25519", "-f", &privkey)?;
            let public = runcmd_output!("ssh-keygen", "-y", "-f", &privkey)?;
            std::fs::write(&pubkey, public).context("writing host public key")?;
        }

        let etc_ssh = Path::new("/etc/ssh");
        if etc_ssh.exists() {
            for entry in std::fs::read_dir(etc_ssh).context("reading /etc/ssh")? {
                let entry = entry?;
                if entry
                    .file_name()
                    .to_string_lossy()
                    .starts_with("ssh_host_")
                {
                    std::fs::remove_file(entry.path())
                        .with_context(|| format!("removing {}", entry.path().display()))?;
                }
            }
            std::fs::copy(&privkey, etc_ssh.join("ssh_host_ed25519_key"))
                .context("deploying host private key")?;
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(
                etc_ssh.join("ssh_host_ed25519_key"),
                std::fs::Permissions::from_mode(0o400),
            )
            .context("restricting host private key")?;
            std::fs::copy(&pubkey, etc_ssh.join("ssh_host_ed25519_key.pub"))
                .context("deploying host public key")?;
            runcmd!("systemctl", "restart", "sshd")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn fake_session(dir: &TempDir) -> BootSession {
        BootSession {
            blob0: "blob0".into(),
            internal_pass: "int".into(),
            data_pass: "data".into(),
            user_slot: "slot".into(),
            cn: "Tester".into(),
            dummy_mountpoint: dir.path().join("dummy"),
            live_mountpoint: dir.path().join("live"),
            efi_mountpoint: dir.path().join("efi"),
            internal_mountpoint: dir.path().join("internal"),
            data_mountpoint: dir.path().join("data"),
            partitions: Vec::new(),
            table: blockdev::TableKind::Gpt,
            sector_size: 512,
            devfile: dir.path().join("device.img"),
            signing_pubkey: None,
        }
    }

    #[test]
    fn event_log_appends() {
        let dir = TempDir::new().unwrap();
        let session = fake_session(&dir);
        fs::create_dir_all(&session.internal_mountpoint).unwrap();

        session.record_event("booted", serde_json::json!({})).unwrap();
        session
            .record_event("update-staged", serde_json::json!({"image": "v2.iso"}))
            .unwrap();

        let log = fs::read_to_string(session.internal_mountpoint.join(EVENTS_FILE)).unwrap();
        let lines: Vec<&str> = log.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains(r#""type":"booted""#));
        assert!(lines[1].contains("v2.iso"));
    }

    #[test]
    fn component_scripts_env_and_failure_policy() {
        let dir = TempDir::new().unwrap();
        let session = fake_session(&dir);
        fs::create_dir_all(&session.internal_mountpoint).unwrap();

        let live_root = dir.path().join("root");
        let comp = live_root.join("resources/components/netcfg");
        fs::create_dir_all(&comp).unwrap();
        let marker = dir.path().join("ran");
        fs::write(
            comp.join("configure0"),
            format!("#!/bin/sh\necho \"$CONF_DIR\" > {}\n", marker.display()),
        )
        .unwrap();
        fs::set_permissions(comp.join("configure0"), fs::Permissions::from_mode(0o755)).unwrap();

        session
            .run_component_scripts(&live_root, "configure0", true)
            .unwrap();
        let recorded = fs::read_to_string(&marker).unwrap();
        assert!(recorded.trim().ends_with("components/netcfg"));

        // a failing script propagates in strict mode
        fs::write(comp.join("configure1"), "#!/bin/sh\nexit 3\n").unwrap();
        fs::set_permissions(comp.join("configure1"), fs::Permissions::from_mode(0o755)).unwrap();
        assert!(session
            .run_component_scripts(&live_root, "configure1", true)
            .is_err());

        // shutdown scripts never block session end
        session
            .run_component_scripts(&live_root, "shutdown", false)
            .unwrap();
        fs::write(comp.join("shutdown"), "#!/bin/sh\nexit 1\n").unwrap();
        fs::set_permissions(comp.join("shutdown"), fs::Permissions::from_mode(0o755)).unwrap();
        session
            .run_component_scripts(&live_root, "shutdown", false)
            .unwrap();
    }

    #[test]
    fn staged_update_clears_marker_for_noop() {
        let dir = TempDir::new().unwrap();
        let session = fake_session(&dir);
        fs::create_dir_all(&session.internal_mountpoint).unwrap();
        fs::create_dir_all(session.live_mountpoint.join("live0")).unwrap();
        live::set_current_slot(&session.live_mountpoint, 0).unwrap();

        // nothing staged
        session.apply_staged_update().unwrap();

        // staged slot equal to the current one is just cleared
        live::set_staged_slot(&session.live_mountpoint, 0).unwrap();
        session.apply_staged_update().unwrap();
        assert_eq!(live::staged_slot(&session.live_mountpoint).unwrap(), None);
        assert_eq!(live::current_slot(&session.live_mountpoint).unwrap(), 0);
    }
}
