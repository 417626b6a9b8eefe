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

//! Installer and formatter: provisions a bootable key from an install
//! configuration, or a data-only key from a format configuration.  The
//! phases run strictly in order and the metadata is never signed until the
//! layout and data are fully in place, so an interrupted run leaves the
//! device unusable but not misleading.

use anyhow::{anyhow, bail, Context, Result};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::blockdev::{
    self, Disk, PlannedPartition, TableKind, END_RESERVED_MB,
};
use crate::chunks;
use crate::config::{ConfigRoot, InstallConfig, RepoSubtype};
use crate::crypto::{self, KeyCipher, PassphraseCipher, Plain};
use crate::encryption::{volume, EncryptionKind};
use crate::errors::HardkeyError;
use crate::filesystem;
use crate::live;
use crate::metadata::{self, MetaRecord, SealedLayout, SealedPartition};
use crate::spec::{Builder, DeviceSpec, ParameterKind, PartitionEntry, PartitionSpec};

/// Default minimum entropy of a user secret, in bits.
pub const MIN_PASSWORD_ENTROPY: f64 = 75.0;

fn align_up(sector: u64) -> u64 {
    ((sector.saturating_sub(1)) / 2048 + 1) * 2048
}

fn align_down(sector: u64) -> u64 {
    sector / 2048 * 2048
}

fn mb_to_sectors(mb: u64, sector_size: u64) -> u64 {
    mb * 1_000_000 / sector_size
}

/// Compute absolute sector ranges for the regular partition descriptors of
/// a grounded specification.  `min_start` is the first usable sector
/// (past whatever an ISO or preserved prefix occupies).
pub fn plan_partitions(
    spec: &DeviceSpec,
    disk_size: u64,
    sector_size: u64,
    mut min_start: u64,
) -> Result<Vec<(String, PlannedPartition)>> {
    let max_end = (disk_size - END_RESERVED_MB * 1_000_000) / sector_size;
    let mut planned = Vec::new();

    for entry in &spec.partitions {
        let part = match entry {
            PartitionEntry::Partition(p) => p,
            // pseudo-partitions were consumed before planning
            _ => continue,
        };
        if matches!(spec.table, TableKind::Gpt | TableKind::Hybrid) && min_start < 65535 {
            min_start = 65535;
        }
        let start = align_up(min_start);

        let end = match part.size_mb {
            Some(mb) if mb > 0 => {
                (start + mb_to_sectors(mb as u64, sector_size)).min(max_end)
            }
            Some(mb) if mb < 0 => {
                let reserve = mb_to_sectors((-mb) as u64, sector_size);
                max_end.checked_sub(reserve).unwrap_or(0)
            }
            _ => max_end,
        };
        // grow to alignment, but never into the reserved trailing area
        let end = align_up(end).min(align_down(max_end));
        if end <= start {
            return Err(anyhow!(HardkeyError::InvalidConfig).context(format!(
                "no space left on device to create partition {:?}",
                part.id
            )));
        }

        planned.push((
            part.id.clone(),
            PlannedPartition {
                first_lba: start,
                last_lba: end - 1,
                type_tag: part.type_tag,
                name: part.label.clone(),
            },
        ));
        min_start = end;
    }
    Ok(planned)
}

/// Values for the declared parameters of an install or format
/// configuration, plus per-component user data.
pub struct ParamsSet {
    pub values: BTreeMap<String, Value>,
    pub components: BTreeMap<String, BTreeMap<String, Value>>,
}

impl ParamsSet {
    /// Check that a value is supplied for every declared parameter, that
    /// user-data `file` parameters resolve to archives in USERDATA
    /// repositories, and that passwords meet the entropy floor.
    pub fn validate(
        &self,
        root: &ConfigRoot,
        parameters: &BTreeMap<String, crate::spec::ParameterSpec>,
        userdata: &BTreeMap<String, BTreeMap<String, String>>,
        config_dir: &Path,
    ) -> Result<()> {
        for (name, spec) in parameters {
            let value = self.values.get(name).ok_or_else(|| {
                anyhow!(HardkeyError::InvalidParameter)
                    .context(format!("missing value for parameter {:?}", name))
            })?;
            crate::spec::validate_parameter_value(spec.kind, value, Some(config_dir))
                .with_context(|| format!("invalid value for parameter {:?}", name))?;
            if spec.kind == ParameterKind::Password {
                let password = value.as_str().unwrap_or_default();
                crypto::validate_password(password, MIN_PASSWORD_ENTROPY)
                    .with_context(|| format!("parameter {:?}", name))?;
            }
        }

        for (component, params) in userdata {
            for (param, repo_id) in params {
                let repo = root.get_repo(repo_id).with_context(|| {
                    format!(
                        "user-data parameter {:?} of component {:?}",
                        param, component
                    )
                })?;
                if repo.subtype != RepoSubtype::Userdata {
                    return Err(anyhow!(HardkeyError::InvalidConfig).context(format!(
                        "repository {:?} for user-data parameter {:?} has subtype {:?}",
                        repo_id, param, repo.subtype
                    )));
                }
                if self
                    .components
                    .get(component)
                    .and_then(|c| c.get(param))
                    .is_none()
                {
                    return Err(anyhow!(HardkeyError::InvalidParameter).context(format!(
                        "missing user-data value for component {:?} parameter {:?}",
                        component, param
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Verify a published file against its detached `.sign` signature.  A
/// missing signature is as fatal as a wrong one when a signing key is
/// configured.
pub fn verify_published_file(path: &Path, signing_pubkey: Option<&Path>) -> Result<()> {
    let pubkey = match signing_pubkey {
        Some(k) => k,
        None => {
            eprintln!(
                "NOT verifying signature of {} (no signing key configured)",
                path.display()
            );
            return Ok(());
        }
    };
    let sigfile = PathBuf::from(format!("{}.sign", path.display()));
    if !sigfile.exists() {
        return Err(anyhow!(HardkeyError::SignatureInvalid)
            .context(format!("missing signature file {}", sigfile.display())));
    }
    let pem = std::fs::read(pubkey)
        .with_context(|| format!("reading {}", pubkey.display()))?;
    crypto::verify_detached_file_signature(path, &sigfile, &pem)
}

/// Per-key secrets generated at provisioning.
struct FreshSecrets {
    blob0: String,
    blob1_priv: Vec<u8>,
    blob1_pub: Vec<u8>,
}

impl FreshSecrets {
    fn generate() -> Result<Self> {
        let (blob1_priv, blob1_pub) = crypto::generate_rsa_keypair()?;
        Ok(FreshSecrets {
            blob0: crypto::random_secret(64)?,
            blob1_priv,
            blob1_pub,
        })
    }
}

pub struct Installer<'a> {
    root: &'a ConfigRoot,
    conf: &'a InstallConfig,
    live_iso: PathBuf,
    params: ParamsSet,
}

impl<'a> Installer<'a> {
    pub fn new(
        root: &'a ConfigRoot,
        config_id: &str,
        live_iso: &Path,
        params: ParamsSet,
    ) -> Result<Self> {
        let conf = root.get_install(config_id)?;
        if !live_iso.exists() {
            bail!("missing live image {}", live_iso.display());
        }
        Ok(Installer {
            root,
            conf,
            live_iso: live_iso.to_path_buf(),
            params,
        })
    }

    fn config_dir(&self) -> &Path {
        self.conf
            .config_file
            .parent()
            .unwrap_or_else(|| Path::new("."))
    }

    fn key_file(&self, rel: &str) -> PathBuf {
        if Path::new(rel).is_absolute() {
            PathBuf::from(rel)
        } else {
            self.config_dir().join(rel)
        }
    }

    fn signing_pubkey(&self) -> Option<PathBuf> {
        let build = self.root.get_build(&self.conf.build_id).ok()?;
        build
            .signing_pubkey_file
            .as_ref()
            .map(|f| {
                let p = Path::new(f);
                if p.is_absolute() {
                    p.to_path_buf()
                } else {
                    build
                        .config_file
                        .parent()
                        .unwrap_or_else(|| Path::new("."))
                        .join(f)
                }
            })
            .filter(|p| p.exists())
    }

    /// Provision a key end to end.  The token is observed between phases;
    /// a provisioning abandoned there leaves the key unusable but never
    /// signed.
    pub fn install(&self, target: &Path, cancel: &crate::util::CancelToken) -> Result<()> {
        self.params.validate(
            self.root,
            &self.conf.parameters,
            &self.conf.userdata,
            self.config_dir(),
        )?;

        let secrets = FreshSecrets::generate()?;
        let mut disk = Disk::open(target)?;

        // ground the layout template
        let template = serde_json::json!({
            "descr": self.conf.descr,
            "parameters": self.conf.parameters,
            "dev-format": self.conf.dev_format,
        });
        let mut builder = Builder::for_disk(&disk, &template.to_string())?;
        for (name, value) in &self.params.values {
            builder.set_parameter(name, value, Some(self.config_dir()))?;
        }
        if builder.parameters().contains_key("blob0") {
            builder.set_parameter("blob0", &Value::String(secrets.blob0.clone()), None)?;
        }
        let mut spec = builder.specifications()?;
        for required in [
            live::PARTID_DUMMY,
            live::PARTID_EFI,
            live::PARTID_LIVE,
            live::PARTID_INTERNAL,
            live::PARTID_DATA,
        ] {
            spec.partition(required).with_context(|| {
                format!("required partition {:?} not present in specifications", required)
            })?;
        }

        // the published image must verify before anything is written
        let signing_pubkey = self.signing_pubkey();
        verify_published_file(&self.live_iso, signing_pubkey.as_deref())?;

        // phase 1: low-level format
        let numbers = format_device(&mut disk, &mut spec)?;
        cancel.check()?;

        // phase 2: live image
        self.install_live_image(&mut disk, &numbers)?;
        cancel.check()?;

        // phase 3: boot loaders
        self.install_boot_loaders(&mut disk, &spec, &numbers)?;
        cancel.check()?;

        // phase 4: per-partition artifacts
        self.place_artifacts(&mut disk, &secrets, &numbers)?;
        cancel.check()?;

        // phase 5: seal
        self.seal(&mut disk, &spec, &secrets, &numbers)?;

        disk.unmount_all()?;
        Ok(())
    }

    fn install_live_image(
        &self,
        disk: &mut Disk,
        numbers: &BTreeMap<String, u32>,
    ) -> Result<()> {
        let live_number = numbers[live::PARTID_LIVE];
        let live_mp = disk.mount_partition(live_number, None, None, None, false)?;

        let iso_mount = blockdev::Mount::try_mount_ro(&self.live_iso, Some("loop"))?;
        let result = (|| -> Result<()> {
            std::fs::create_dir_all(live::slot_dir(&live_mp, 0))?;
            std::fs::create_dir_all(live::slot_dir(&live_mp, 1))?;
            live::install_live_files(&live::slot_dir(&live_mp, 0), iso_mount.mountpoint())?;
            live::set_current_slot(&live_mp, 0)?;

            let build = self.root.get_build(&self.conf.build_id)?;
            live::write_valid_from(&live_mp, build_valid_from(&build.version)?)?;
            Ok(())
        })();
        iso_mount.unmount()?;
        result
    }

    fn install_boot_loaders(
        &self,
        disk: &mut Disk,
        spec: &DeviceSpec,
        numbers: &BTreeMap<String, u32>,
    ) -> Result<()> {
        let grub_dir = match &self.conf.install.grub_dir {
            Some(d) => self.key_file(d),
            None => bail!("install configuration has no boot-loader assets"),
        };
        let efi_number = numbers[live::PARTID_EFI];
        let efi_mp = disk.mount_partition(efi_number, None, None, None, false)?;

        if spec.table != TableKind::Dos {
            disk.install_boot_loader_uefi(&efi_mp, &grub_dir.join("boot-binaries.tar.xz"))?;
        }
        if spec.table != TableKind::Gpt {
            disk.install_boot_loader_legacy(&efi_mp)?;
        }

        let dirs = disk.install_boot_loader_configuration(
            &efi_mp,
            &grub_dir.join("grub-config.tar"),
            numbers[live::PARTID_LIVE],
        )?;

        // bake the build's localisation into the boot menu
        let build = self.root.get_build(&self.conf.build_id)?;
        let l10n_args = l10n_kernel_args(&build.l10n);
        for dir in &dirs {
            let cfg = dir.join("grub.cfg");
            if cfg.exists() {
                let contents = std::fs::read_to_string(&cfg)
                    .with_context(|| format!("reading {}", cfg.display()))?;
                std::fs::write(&cfg, contents.replace("{l10n}", &l10n_args))
                    .with_context(|| format!("writing {}", cfg.display()))?;
            }
        }

        // one canonical boot-params file per slot; the active file starts
        // out as the slot-0 copy
        for dir in dirs {
            let base = std::fs::read_to_string(dir.join("bootparams.cfg"))
                .context("reading fresh boot params")?;
            let slot0 = format!("{}set bootslot=live0\n", base);
            let slot1 = format!("{}set bootslot=live1\n", base);
            std::fs::write(dir.join("bootparams0.cfg"), &slot0)
                .context("writing slot-0 boot params")?;
            std::fs::write(dir.join("bootparams1.cfg"), &slot1)
                .context("writing slot-1 boot params")?;
            std::fs::write(dir.join("bootparams.cfg"), &slot0)
                .context("writing active boot params")?;
        }
        Ok(())
    }

    fn place_artifacts(
        &self,
        disk: &mut Disk,
        secrets: &FreshSecrets,
        numbers: &BTreeMap<String, u32>,
    ) -> Result<()> {
        let dummy_mp = disk.mount_partition(numbers[live::PARTID_DUMMY], None, None, None, false)?;

        // the user's slot releasing blob0
        let user_secret = self
            .params
            .values
            .get("password-user")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                anyhow!(HardkeyError::InvalidParameter)
                    .context("missing \"password-user\" parameter")
            })?;
        let cn = self
            .params
            .values
            .get("owner")
            .and_then(Value::as_str)
            .unwrap_or("Live user");
        live::declare_user(&dummy_mp, cn, user_secret, &secrets.blob0)?;

        // blob1, private half wrapped under blob0
        let enc_priv = PassphraseCipher::new(&secrets.blob0)
            .encrypt(&Plain::Bytes(secrets.blob1_priv.clone()))?;
        write_file(&dummy_mp.join(live::BLOB1_PRIV_FILE), enc_priv.as_bytes(), 0o400)?;
        write_file(&dummy_mp.join(live::BLOB1_PUB_FILE), &secrets.blob1_pub, 0o400)?;

        // convenience copy of the metadata verification key for admin
        // tooling; the boot process only trusts the key preloaded into the
        // live image, never this one
        let meta_pub = std::fs::read(self.key_file(&self.conf.install.devicemeta_pubkey_file))
            .context("reading device-metadata public key")?;
        write_file(&dummy_mp.join(live::META_VERIFY_KEY_FILE), &meta_pub, 0o444)?;

        // internal partition: opened with the format-time passphrase
        let internal_mp = self.mount_encrypted(disk, numbers, live::PARTID_INTERNAL)?;

        let key_id = uuid::Uuid::new_v4().to_string();
        self.write_key_config(&internal_mp, &key_id)?;
        self.write_attestation(disk, &internal_mp, &key_id)?;

        let privdata_priv = self.privdata_privkey()?;
        write_file(
            &internal_mp.join(live::PRIVDATA_KEY_FILE),
            &privdata_priv,
            0o400,
        )?;

        self.place_userdata(&internal_mp)?;
        nix::unistd::sync();
        Ok(())
    }

    fn mount_encrypted(
        &self,
        disk: &mut Disk,
        numbers: &BTreeMap<String, u32>,
        partition_id: &str,
    ) -> Result<PathBuf> {
        let number = numbers[partition_id];
        let partfile = disk.partition_path(number);
        let password = PART_PASSWORDS.with(|p| {
            p.borrow()
                .get(partition_id)
                .cloned()
                .ok_or_else(|| anyhow!("no passphrase recorded for partition {:?}", partition_id))
        })?;
        let vol = volume(EncryptionKind::Luks, &partfile);
        let mapped = match vol.is_open()? {
            Some(m) => m,
            None => vol.open(&password)?,
        };
        disk.mount_partition(number, Some(&mapped), None, None, false)
    }

    fn write_key_config(&self, internal_mp: &Path, key_id: &str) -> Result<()> {
        let build = self.root.get_build(&self.conf.build_id)?;
        let repo = self.root.get_repo(&build.repo_id)?;
        let mut storage_sources = BTreeMap::new();
        for (name, target) in &self.root.settings.sync_targets {
            storage_sources.insert(name.clone(), target.root.clone());
            if let Some(conf_file) = &target.conf_file {
                let src = self.root.path().join("storage-credentials").join(conf_file);
                if src.exists() {
                    let dest = internal_mp.join("credentials/storage").join(name);
                    copy_file(&src, &dest, 0o644)?;
                }
            }
        }
        if storage_sources.is_empty() {
            bail!("no sync target configured; updates would never be available");
        }

        let config = serde_json::json!({
            "device-id": key_id,
            "install-config-id": self.conf.id,
            "build-repo-config": {
                "id": repo.id,
                "password": repo.password,
                "compress": repo.compress,
            },
            "storage-sources": storage_sources,
            "l10n": build.l10n,
        });
        write_file(
            &internal_mp.join(live::KEY_CONFIG_FILE),
            config.to_string().as_bytes(),
            0o400,
        )
    }

    fn write_attestation(&self, disk: &Disk, internal_mp: &Path, key_id: &str) -> Result<()> {
        let mut attested = serde_json::Map::new();
        attested.insert("device-id".into(), key_id.into());
        attested.insert("install-config-id".into(), self.conf.id.clone().into());
        attested.insert("install-config-descr".into(), self.conf.descr.clone().into());
        for (name, spec) in &self.conf.parameters {
            if spec.attest {
                if let Some(value) = self.params.values.get(name) {
                    attested.insert(name.clone(), value.clone());
                }
            }
        }
        attested.insert(
            "hardware-id".into(),
            serde_json::to_value(disk.hardware_id()?).context("encoding hardware id")?,
        );
        let payload = Value::Object(attested);
        let canonical = payload.to_string();

        let signature = match &self.conf.install.attestation_privkey_file {
            Some(file) => {
                let pem = std::fs::read(self.key_file(file))
                    .context("reading attestation private key")?;
                Some(KeyCipher::from_private_pem(&pem)?.sign(canonical.as_bytes())?)
            }
            None => None,
        };
        let record = serde_json::json!({
            "attestation": payload,
            "signature": signature,
        });
        write_file(
            &internal_mp.join(live::ATTESTATION_FILE),
            record.to_string().as_bytes(),
            0o400,
        )
    }

    fn privdata_privkey(&self) -> Result<Vec<u8>> {
        let build = self.root.get_build(&self.conf.build_id)?;
        let dir = build
            .config_file
            .parent()
            .unwrap_or_else(|| Path::new("."));
        let path = Path::new(&build.privdata_privkey_file);
        let path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            dir.join(path)
        };
        std::fs::read(&path).with_context(|| format!("reading {}", path.display()))
    }

    fn place_userdata(&self, internal_mp: &Path) -> Result<()> {
        for (component, params) in &self.params.components {
            let component_dir = internal_mp.join("components").join(component);
            std::fs::create_dir_all(&component_dir)
                .with_context(|| format!("creating {}", component_dir.display()))?;

            let mut resolved = serde_json::Map::new();
            let mut trace = serde_json::Map::new();
            for (param, value) in params {
                let is_file = self
                    .conf
                    .userdata
                    .get(component)
                    .map(|c| c.contains_key(param))
                    .unwrap_or(false);
                if is_file {
                    if let Some(path) = value.as_str() {
                        let src = self.resolve_userdata_file(component, param, path)?;
                        let fname = uuid::Uuid::new_v4().to_string();
                        copy_file(&src, &component_dir.join(&fname), 0o644)?;
                        resolved.insert(param.clone(), fname.into());
                        trace.insert(param.clone(), path.into());
                        continue;
                    }
                }
                resolved.insert(param.clone(), value.clone());
            }
            write_file(
                &component_dir.join("userdata.json"),
                Value::Object(resolved).to_string().as_bytes(),
                0o644,
            )?;
            write_file(
                &component_dir.join("userdata-trace.json"),
                Value::Object(trace).to_string().as_bytes(),
                0o644,
            )?;
        }
        Ok(())
    }

    /// A relative user-data path names a file inside the latest archive of
    /// the bound USERDATA repository.
    fn resolve_userdata_file(&self, component: &str, param: &str, value: &str) -> Result<PathBuf> {
        if Path::new(value).is_absolute() {
            let path = PathBuf::from(value);
            if !path.exists() {
                return Err(anyhow!(HardkeyError::InvalidParameter)
                    .context(format!("missing user-data file {}", value)));
            }
            return Ok(path);
        }
        let repo_id = self
            .conf
            .userdata
            .get(component)
            .and_then(|c| c.get(param))
            .ok_or_else(|| {
                anyhow!(HardkeyError::InvalidConfig).context(format!(
                    "no user-data repository bound for component {:?} parameter {:?}",
                    component, param
                ))
            })?;
        let rconf = self.root.get_repo(repo_id)?;
        let mut repo = rconf.open(self.root.path())?;
        let (_, archive) = repo
            .latest_archive()?
            .ok_or_else(|| anyhow!(HardkeyError::ArchiveMissing).context(format!(
                "no archive available in repository {:?}",
                repo_id
            )))?;
        let mp = repo.mount(&archive)?;
        let path = mp.join(value);
        if !path.exists() {
            return Err(anyhow!(HardkeyError::InvalidParameter).context(format!(
                "no file named {:?} in the latest archive of repository {:?}",
                value, repo_id
            )));
        }
        // copy out before the archive is unmounted on drop
        let scratch = tempfile::Builder::new()
            .prefix("hardkey-ud-")
            .tempdir()
            .context("creating scratch directory")?
            .into_path();
        let fname = Path::new(value)
            .file_name()
            .ok_or_else(|| anyhow!("user-data path {:?} has no file name", value))?;
        let dest = scratch.join(fname);
        std::fs::copy(&path, &dest).with_context(|| format!("copying {}", path.display()))?;
        repo.unmount(&archive)?;
        Ok(dest)
    }

    fn seal(
        &self,
        disk: &mut Disk,
        spec: &DeviceSpec,
        secrets: &FreshSecrets,
        numbers: &BTreeMap<String, u32>,
    ) -> Result<()> {
        // chunks over the live tree, wrapped under blob1
        let live_number = numbers[live::PARTID_LIVE];
        let live_mp = disk.mount_partition(live_number, None, None, None, false)?;
        let (map, live_hash, chunk_log) = chunks::create(&live_mp)?;
        disk.unmount_partition(live_number)?;

        let dummy_mp = disk.mount_partition(numbers[live::PARTID_DUMMY], None, None, None, false)?;
        let enc_chunks = KeyCipher::from_public_pem(&secrets.blob1_pub)?.encrypt(&Plain::Text(
            serde_json::to_string(&map).context("encoding chunks map")?,
        ))?;
        write_file(&dummy_mp.join(live::CHUNKS_FILE), enc_chunks.as_bytes(), 0o400)?;

        // fresh operational passphrases, never the format-time ones
        let internal_pass = crypto::random_secret(64)?;
        let data_pass = crypto::random_secret(64)?;
        let internal_part = disk.partition_path(numbers[live::PARTID_INTERNAL]);
        let format_pass = PART_PASSWORDS.with(|p| {
            p.borrow()
                .get(live::PARTID_INTERNAL)
                .cloned()
                .ok_or_else(|| anyhow!("no passphrase recorded for the internal partition"))
        })?;
        volume(EncryptionKind::Luks, &internal_part).add_passphrase(&format_pass, &internal_pass)?;

        // the fingerprint covers everything written so far
        let efi_mp = disk.mount_partition(numbers[live::PARTID_EFI], None, None, None, false)?;
        let layout = disk.observed_layout()?;
        let parts: Vec<(String, u64, u64)> = layout
            .partitions
            .iter()
            .map(|p| {
                let id = numbers
                    .iter()
                    .find(|(_, n)| **n == p.number)
                    .map(|(id, _)| id.clone())
                    .unwrap_or_else(|| format!("p{}", p.number));
                (id, p.first_sector, p.last_sector)
            })
            .collect();
        let blob1_priv_pem = String::from_utf8(secrets.blob1_priv.clone())
            .context("blob1 private key is not valid PEM text")?;

        // beyond this point nothing covered by the chain may be written
        let (fingerprint, mut log) = live::compute_integrity_fingerprint(
            &live::FingerprintInputs {
                devfile: disk.devfile(),
                table: layout.table,
                sector_size: layout.sector_size,
                partitions: &parts,
                dummy_mountpoint: &dummy_mp,
                efi_mountpoint: &efi_mp,
            },
            &blob1_priv_pem,
            &live_hash,
        )?;
        // the per-file chunk checkpoints follow the chain checkpoints in
        // the diagnostic log
        log.extend(chunk_log);

        // the chain log and passphrase blobs land outside the hashed
        // regions (internal partition, or inside the dummy ignore bounds)
        let cipher = PassphraseCipher::new(&fingerprint);
        let enc_internal = cipher.encrypt(&Plain::Text(internal_pass.clone()))?;
        write_file(
            &dummy_mp.join(live::INTERNAL_PASS_FILE),
            enc_internal.as_bytes(),
            0o400,
        )?;

        let internal_mp = self.mount_encrypted(disk, numbers, live::PARTID_INTERNAL)?;
        write_file(
            &internal_mp.join(live::FINGERPRINT_LOG_FILE),
            serde_json::to_string(&log).context("encoding chain log")?.as_bytes(),
            0o400,
        )?;
        let enc_data = cipher.encrypt(&Plain::Text(data_pass.clone()))?;
        write_file(&internal_mp.join(live::DATA_PASS_FILE), enc_data.as_bytes(), 0o400)?;

        let data_part = disk.partition_path(numbers[live::PARTID_DATA]);
        let data_format_pass = PART_PASSWORDS.with(|p| {
            p.borrow()
                .get(live::PARTID_DATA)
                .cloned()
                .ok_or_else(|| anyhow!("no passphrase recorded for the data partition"))
        })?;
        let data_enc = spec
            .partition(live::PARTID_DATA)?
            .encryption
            .unwrap_or(EncryptionKind::Luks);
        match data_enc {
            EncryptionKind::Luks => volume(data_enc, &data_part)
                .add_passphrase(&data_format_pass, &data_pass)?,
            EncryptionKind::Veracrypt => {
                // a single-passphrase volume: the rotation replaces the
                // format-time passphrase outright
                volume(data_enc, &data_part).change_passphrase(&data_format_pass, &data_pass)?;
                PART_PASSWORDS.with(|p| {
                    p.borrow_mut()
                        .insert(live::PARTID_DATA.to_string(), data_pass.clone());
                });
            }
        }

        // finally, the appended metadata
        nix::unistd::sync();
        let signers = effective_signers(spec, &self.conf.install.devicemeta_privkey_file);
        seal_metadata(disk, spec, numbers, self.config_dir(), &signers)?;
        Ok(())
    }
}

/// Kernel arguments carrying the build's localisation descriptor.
fn l10n_kernel_args(l10n: &crate::config::L10n) -> String {
    let mut args = format!(
        "timezone={} lang={} locales={}",
        l10n.timezone.as_deref().unwrap_or("UTC"),
        l10n.locale.as_deref().unwrap_or("en_US.UTF-8"),
        l10n.locale.as_deref().unwrap_or("en_US.UTF-8"),
    );
    if let Some(layout) = &l10n.keyboard_layout {
        args.push_str(&format!(" keyboard-layouts={}", layout));
    }
    if let Some(model) = &l10n.keyboard_model {
        args.push_str(&format!(" keyboard-model={}", model));
    }
    if let Some(variant) = &l10n.keyboard_variant {
        args.push_str(&format!(" keyboard-variants={}", variant));
    }
    if let Some(option) = &l10n.keyboard_option {
        args.push_str(&format!(" keyboard-options={}", option));
    }
    args
}

/// The template's declared signers, or the configuration's device-metadata
/// key when the template declares none.
fn effective_signers(
    spec: &DeviceSpec,
    devicemeta_privkey_file: &str,
) -> BTreeMap<String, crate::spec::CryptoSpec> {
    if !spec.signatures.is_empty() {
        return spec.signatures.clone();
    }
    let mut signers = BTreeMap::new();
    signers.insert(
        "Admin".to_string(),
        crate::spec::CryptoSpec {
            kind: crate::spec::CryptoSpecKind::Key,
            password: None,
            public_key_file: None,
            private_key_file: Some(devicemeta_privkey_file.to_string()),
            cert_file: None,
        },
    );
    signers
}

/// Format-time passphrases per partition id, shared between the formatting
/// pass and the sealing pass of one provisioning.  Session-scoped: cleared
/// when formatting starts.
thread_local! {
    static PART_PASSWORDS: std::cell::RefCell<BTreeMap<String, String>> =
        std::cell::RefCell::new(BTreeMap::new());
}

/// Phase 1: wipe, partition, encrypt, and format the device according to
/// the specification.  Returns the partition-id to partition-number map.
pub fn format_device(disk: &mut Disk, spec: &mut DeviceSpec) -> Result<BTreeMap<String, u32>> {
    disk.ensure_released()
        .context("partition operations need exclusive access")?;
    disk.unmount_all()?;
    PART_PASSWORDS.with(|p| p.borrow_mut().clear());

    let (disk_size, sector_size) = blockdev::get_disk_sizes(disk.devfile())?;

    // a leading ISO or preserved prefix shifts everything that follows
    let mut number_offset = 0u32;
    let mut min_start = 1u64;
    match spec.partitions.first() {
        Some(PartitionEntry::IsoFile { iso_file, size_mb }) => {
            let iso = PathBuf::from(iso_file);
            disk.write_iso(&iso)?;
            let layout = disk.observed_layout()?;
            if layout.partitions.is_empty() {
                bail!("the ISO image did not create any partition");
            }
            number_offset = layout.partitions.len() as u32;
            min_start = layout
                .partitions
                .iter()
                .map(|p| p.last_sector + 1)
                .max()
                .unwrap();
            if let Some(mb) = size_mb {
                let reserved = mb_to_sectors(*mb as u64, sector_size);
                if min_start > reserved {
                    bail!("the ISO image is too big for its reserved {} MB", mb);
                }
                min_start = reserved;
            }
        }
        Some(PartitionEntry::LeaveExisting { .. }) => {
            let layout = disk.observed_layout()?;
            number_offset = layout.partitions.len() as u32;
            min_start = layout
                .partitions
                .iter()
                .map(|p| p.last_sector + 1)
                .max()
                .unwrap_or(1);
        }
        _ => {
            blockdev::wipe_tables(disk.devfile())?;
        }
    }

    let planned = plan_partitions(spec, disk_size, sector_size, min_start)?;
    let fresh_table = number_offset == 0;
    if fresh_table {
        let mut f = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(disk.devfile())
            .with_context(|| format!("opening {}", disk.devfile().display()))?;
        let entries: Vec<PlannedPartition> = planned.iter().map(|(_, p)| p.clone()).collect();
        blockdev::write_partition_table(&mut f, sector_size, spec.table, &entries)?;
    } else {
        // extend the table the ISO created
        let mut f = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(disk.devfile())
            .with_context(|| format!("opening {}", disk.devfile().display()))?;
        blockdev::append_partitions(&mut f, sector_size, &planned)?;
    }
    blockdev::ensure_kernel_sync(disk.devfile())?;

    // id -> partition number
    let mut numbers = BTreeMap::new();
    for (i, (id, _)) in planned.iter().enumerate() {
        numbers.insert(id.clone(), number_offset + i as u32 + 1);
    }

    // encryption layers and filesystems
    for entry in &mut spec.partitions {
        let part = match entry {
            PartitionEntry::Partition(p) => p,
            _ => continue,
        };
        format_partition(disk, part, numbers[&part.id])?;
    }

    // hybridize after the GPT partitions exist
    if spec.table == TableKind::Hybrid {
        let hybrid = spec
            .hybrid_partitions
            .as_ref()
            .expect("validated hybrid spec");
        let hybrid_numbers: Vec<u32> = hybrid.iter().map(|id| numbers[id]).collect();
        let mut f = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(disk.devfile())
            .with_context(|| format!("opening {}", disk.devfile().display()))?;
        blockdev::make_hybrid_mbr(&mut f, sector_size, &hybrid_numbers)?;
        blockdev::ensure_kernel_sync(disk.devfile())?;
    }

    Ok(numbers)
}

fn format_partition(disk: &Disk, part: &mut PartitionSpec, number: u32) -> Result<()> {
    let partfile = disk.partition_path(number);
    filesystem::wait_for_device(&partfile, std::time::Duration::from_secs(10))?;

    if let Some(enc) = part.encryption {
        let password = match &part.password {
            Some(p) => p.clone(),
            None => crypto::generate_password(
                12,
                Some("ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789"),
            )?,
        };
        part.password = Some(password.clone());
        PART_PASSWORDS.with(|p| {
            p.borrow_mut().insert(part.id.clone(), password.clone());
        });

        let vol = volume(enc, &partfile);
        vol.create(&password)?;
        if let Some(fs) = part.filesystem {
            let mapped = vol.open(&password)?;
            let result = filesystem::create_filesystem(
                &mapped,
                fs,
                &part.label,
                part.volume_id.as_deref(),
            );
            vol.close()?;
            result?;
        }
    } else if let Some(fs) = part.filesystem {
        filesystem::create_filesystem(&partfile, fs, &part.label, part.volume_id.as_deref())?;
    }
    Ok(())
}

/// Phase 2 of sealing: observe the final layout, fingerprint the immutable
/// partitions, and write the appended metadata signed by `signers`.
pub fn seal_metadata(
    disk: &mut Disk,
    spec: &DeviceSpec,
    numbers: &BTreeMap<String, u32>,
    config_dir: &Path,
    signers: &BTreeMap<String, crate::spec::CryptoSpec>,
) -> Result<()> {
    let layout = disk.observed_layout()?;
    let mut sealed_parts = Vec::new();

    for observed in &layout.partitions {
        let id = numbers
            .iter()
            .find(|(_, n)| **n == observed.number)
            .map(|(id, _)| id.clone());
        let part_spec = id.as_deref().and_then(|id| spec.partition(id).ok());
        let partfile = disk.partition_path(observed.number);

        let (immutable, encryption) = match part_spec {
            Some(p) => (p.immutable, p.encryption),
            // partitions created by the ISO are immutable by definition
            None => (true, None),
        };

        let mut hash = None;
        let mut files_hash = None;
        if immutable {
            disk.unmount_partition(observed.number)?;
            let fs_is_rewritten_by_hosts = matches!(
                observed.filesystem.as_deref(),
                Some("vfat") | Some("fat") | Some("ntfs") | Some("ntfs3")
            );
            if encryption.is_none() && fs_is_rewritten_by_hosts {
                let mount = blockdev::Mount::try_mount_ro(&partfile, None)?;
                let dir_hash = crate::fingerprint::directory_hash(mount.mountpoint(), None);
                mount.unmount()?;
                files_hash = Some(format!("sha256|{}", dir_hash?));
            } else {
                hash = Some(crate::fingerprint::partition_hash(&partfile)?);
            }
        }

        // the passphrase may have been rotated since formatting; the
        // session record is authoritative
        let password = id
            .as_deref()
            .and_then(|id| PART_PASSWORDS.with(|p| p.borrow().get(id).cloned()))
            .or_else(|| part_spec.and_then(|p| p.password.clone()));
        let header = match (encryption, password) {
            (Some(enc), Some(password)) => {
                let exported = volume(enc, &partfile).export_header(&password)?;
                Some(crypto::ascii_encode(&Plain::Bytes(exported))?)
            }
            _ => None,
        };

        sealed_parts.push(SealedPartition {
            id,
            number: observed.number,
            sector_start: observed.first_sector,
            sector_end: observed.last_sector,
            size_bytes: observed.size_bytes,
            type_tag: observed.type_tag,
            label: observed.label.clone(),
            filesystem: observed.filesystem.clone(),
            immutable,
            encryption,
            hash,
            files_hash,
            header,
        });
    }

    let table_hash = crate::fingerprint::partition_table_hash(disk.devfile(), layout.table)?;

    // protected sections, with @partition/field references resolved
    let resolve = |reference: &str| -> Result<String> {
        let (part_id, what) = reference
            .split_once('/')
            .ok_or_else(|| anyhow!("invalid protected reference {:?}", reference))?;
        match what {
            "password" => PART_PASSWORDS.with(|p| {
                p.borrow().get(part_id).cloned().ok_or_else(|| {
                    anyhow!("no passphrase recorded for partition {:?}", part_id)
                })
            }),
            "header" => {
                let sealed = sealed_parts
                    .iter()
                    .find(|p| p.id.as_deref() == Some(part_id))
                    .and_then(|p| p.header.clone());
                sealed.ok_or_else(|| anyhow!("no header captured for partition {:?}", part_id))
            }
            other => bail!("invalid protected reference field {:?}", other),
        }
    };
    let protected = metadata::protect_sections(
        &spec.protected,
        &spec.decryptors,
        Some(config_dir),
        &resolve,
    )?;

    let record = MetaRecord {
        format: 1,
        hardware: disk.hardware_id()?,
        verif: SealedLayout {
            table: layout.table,
            sector_size: layout.sector_size,
            table_hash,
            partitions: sealed_parts,
        },
        unprotected: spec.unprotected.clone(),
        protected,
    };
    metadata::write_records(disk.devfile(), &record, signers, Some(config_dir))?;
    Ok(())
}

/// Provision a data-only key from a format configuration: declared
/// partitions, encryption and filesystems, sealed metadata, no live system.
pub fn format_only(
    root: &ConfigRoot,
    config_id: &str,
    target: &Path,
    params: ParamsSet,
) -> Result<()> {
    let conf = root.get_format(config_id)?;
    let config_dir = conf.config_file.parent().unwrap_or_else(|| Path::new("."));
    params.validate(root, &conf.parameters, &BTreeMap::new(), config_dir)?;

    let mut disk = Disk::open(target)?;
    let template = serde_json::json!({
        "descr": conf.descr,
        "parameters": conf.parameters,
        "dev-format": conf.dev_format,
    });
    let mut builder = Builder::for_disk(&disk, &template.to_string())?;
    for (name, value) in &params.values {
        builder.set_parameter(name, value, Some(config_dir))?;
    }
    let mut spec = builder.specifications()?;

    let numbers = format_device(&mut disk, &mut spec)?;
    let signers = effective_signers(&spec, &conf.devicemeta_privkey_file);
    seal_metadata(&mut disk, &spec, &numbers, config_dir, &signers)?;
    disk.unmount_all()?;
    Ok(())
}

/// Destroy a key: erase encryption headers where declared, then zero the
/// tables and the appended metadata area.
pub fn wipe(target: &Path) -> Result<()> {
    let mut disk = Disk::open(target)?;
    disk.unmount_all()?;
    if let Ok(layout) = disk.observed_layout() {
        for part in &layout.partitions {
            // best effort; a mangled table must not stop the wipe
            let partfile = disk.partition_path(part.number);
            let _ = volume(EncryptionKind::Luks, &partfile).erase();
        }
    }
    blockdev::wipe_tables(disk.devfile())?;
    Ok(())
}

/// Parse a build version like `2024-06` into the validity start timestamp.
/// Versions are `YYYY-MM` or a raw epoch value.
fn build_valid_from(version: &str) -> Result<i64> {
    if let Ok(ts) = version.parse::<i64>() {
        return Ok(ts);
    }
    let (year, month) = version
        .split_once('-')
        .ok_or_else(|| anyhow!("unparseable build version {:?}", version))?;
    let year: i64 = year.parse().context("parsing version year")?;
    let month: i64 = month.parse().context("parsing version month")?;
    if !(1..=12).contains(&month) {
        bail!("unparseable build version {:?}", version);
    }
    // days since epoch of the first of the month, civil calendar
    let days = days_from_civil(year, month, 1);
    Ok(days * 86_400)
}

/// Days between 1970-01-01 and y-m-d in the proleptic Gregorian calendar.
fn days_from_civil(y: i64, m: i64, d: i64) -> i64 {
    let y = if m <= 2 { y - 1 } else { y };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = y - era * 400;
    let doy = (153 * (if m > 2 { m - 3 } else { m + 9 }) + 2) / 5 + d - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}

pub fn write_file(path: &Path, data: &[u8], mode: u32) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    std::fs::write(path, data).with_context(|| format!("writing {}", path.display()))?;
    use std::os::unix::fs::PermissionsExt;
    // FAT mounts have no permission bits; ignore the failure there
    let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode));
    Ok(())
}

fn copy_file(src: &Path, dest: &Path, mode: u32) -> Result<()> {
    let data = std::fs::read(src).with_context(|| format!("reading {}", src.display()))?;
    write_file(dest, &data, mode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::kind_of;

    fn spec_with_sizes(sizes: &[(&str, Option<i64>)]) -> DeviceSpec {
        let partitions: Vec<Value> = sizes
            .iter()
            .map(|(id, size)| {
                serde_json::json!({
                    "id": id, "type": "LINUX", "label": id, "volume-id": null,
                    "encryption": null, "immutable": false, "filesystem": "ext4",
                    "password": null, "size-mb": size,
                })
            })
            .collect();
        serde_json::from_value(serde_json::json!({
            "device": "/dev/sdz",
            "type": "gpt",
            "partitions": partitions,
            "unprotected": {},
            "protected": {},
            "decryptors": {},
            "signatures": {}
        }))
        .unwrap()
    }

    #[test]
    fn alignment() {
        assert_eq!(align_up(1), 2048);
        assert_eq!(align_up(2048), 2048);
        assert_eq!(align_up(2049), 4096);
        assert_eq!(align_up(65535), 65536);
        assert_eq!(align_down(65535), 63488);
        assert_eq!(align_down(65536), 65536);
    }

    #[test]
    fn partition_planning() {
        let spec = spec_with_sizes(&[
            ("a", Some(100)),
            ("b", Some(200)),
            ("c", None), // all remaining
        ]);
        let disk_size: u64 = 8 * 1_000_000_000;
        let planned = plan_partitions(&spec, disk_size, 512, 1).unwrap();
        assert_eq!(planned.len(), 3);

        // GPT start floor and alignment
        let (_, a) = &planned[0];
        assert_eq!(a.first_lba, align_up(65535));
        assert_eq!(a.first_lba % 2048, 0);
        assert_eq!((a.last_lba + 1) % 2048, 0);
        // 100 decimal MB
        assert!(
            (a.last_lba + 1 - a.first_lba) * 512 >= 100 * 1_000_000
                && (a.last_lba + 1 - a.first_lba) * 512 < 100 * 1_000_000 + 2048 * 512
        );

        // partitions do not overlap and stay in order
        let (_, b) = &planned[1];
        let (_, c) = &planned[2];
        assert!(b.first_lba > a.last_lba);
        assert!(c.first_lba > b.last_lba);

        // the last partition leaves the reserved trailing area alone
        let max_end = (disk_size - END_RESERVED_MB * 1_000_000) / 512;
        assert!(c.last_lba < max_end);
        assert!((max_end - c.last_lba) as u64 * 512 <= 2048 * 512);
    }

    #[test]
    fn negative_size_reserves_space() {
        let spec = spec_with_sizes(&[("a", Some(-1000))]);
        let disk_size: u64 = 8 * 1_000_000_000;
        let planned = plan_partitions(&spec, disk_size, 512, 1).unwrap();
        let (_, a) = &planned[0];
        let max_end = (disk_size - END_RESERVED_MB * 1_000_000) / 512;
        // roughly 1000 MB left unallocated before the reserved tail
        let left = (max_end - (a.last_lba + 1)) * 512;
        assert!(left >= 999 * 1_000_000 && left <= 1001 * 1_000_000);
    }

    #[test]
    fn oversized_partition_fails() {
        let spec = spec_with_sizes(&[("a", Some(100)), ("b", Some(-20_000))]);
        // device too small for a 20 GB reservation
        let err = plan_partitions(&spec, 1_000_000_000, 512, 1).unwrap_err();
        assert_eq!(kind_of(&err), Some(HardkeyError::InvalidConfig));
    }

    #[test]
    fn valid_from_parsing() {
        assert_eq!(build_valid_from("1700000000").unwrap(), 1_700_000_000);
        // 2024-01-01
        assert_eq!(build_valid_from("2024-01").unwrap(), 1_704_067_200);
        // 1970-01-01
        assert_eq!(build_valid_from("1970-01").unwrap(), 0);
        assert!(build_valid_from("2024-13").is_err());
        assert!(build_valid_from("next tuesday").is_err());
    }

    #[test]
    fn civil_days() {
        assert_eq!(days_from_civil(1970, 1, 1), 0);
        assert_eq!(days_from_civil(1970, 1, 2), 1);
        assert_eq!(days_from_civil(2000, 3, 1), 11_017);
        assert_eq!(days_from_civil(1969, 12, 31), -1);
    }

    #[test]
    fn l10n_arguments() {
        let l10n = crate::config::L10n {
            timezone: Some("Europe/Paris".into()),
            locale: Some("fr_FR.UTF-8".into()),
            keyboard_layout: Some("fr".into()),
            keyboard_model: Some("pc105".into()),
            ..Default::default()
        };
        assert_eq!(
            l10n_kernel_args(&l10n),
            "timezone=Europe/Paris lang=fr_FR.UTF-8 locales=fr_FR.UTF-8 \
             keyboard-layouts=fr keyboard-model=pc105"
        );
        assert_eq!(
            l10n_kernel_args(&Default::default()),
            "timezone=UTC lang=en_US.UTF-8 locales=en_US.UTF-8"
        );
    }

    #[test]
    fn published_file_verification() {
        let dir = tempfile::TempDir::new().unwrap();
        let payload = dir.path().join("image.iso");
        std::fs::write(&payload, b"live image bytes").unwrap();

        // no signing key configured: accepted with a warning
        verify_published_file(&payload, None).unwrap();

        // signing key configured but signature file missing: refused
        let (private, public) = crypto::generate_rsa_keypair().unwrap();
        let pubfile = dir.path().join("signing.pub");
        std::fs::write(&pubfile, &public).unwrap();
        let err = verify_published_file(&payload, Some(&pubfile)).unwrap_err();
        assert_eq!(kind_of(&err), Some(HardkeyError::SignatureInvalid));

        // correct detached signature: accepted
        let key = openssl::pkey::PKey::private_key_from_pem(&private).unwrap();
        let mut signer =
            openssl::sign::Signer::new(openssl::hash::MessageDigest::sha256(), &key).unwrap();
        signer.update(b"live image bytes").unwrap();
        std::fs::write(
            dir.path().join("image.iso.sign"),
            signer.sign_to_vec().unwrap(),
        )
        .unwrap();
        verify_published_file(&payload, Some(&pubfile)).unwrap();

        // tampered payload: refused
        std::fs::write(&payload, b"live image bytes!").unwrap();
        let err = verify_published_file(&payload, Some(&pubfile)).unwrap_err();
        assert_eq!(kind_of(&err), Some(HardkeyError::SignatureInvalid));
    }
}
