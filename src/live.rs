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

//! Live-key layout and the integrity-fingerprint chain: partition roles,
//! A/B live slots, the user-slot file protecting blob0, and the ordered
//! hash chain that gates the operational partitions.

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use crate::blockdev::TableKind;
use crate::crypto::{self, PassphraseCipher, Plain};
use crate::errors::HardkeyError;
use crate::fingerprint::{self, Checkpoint, IgnoreDecision, IntegrityLog};

/// Canonical partition ids of a provisioned key.
pub const PARTID_DUMMY: &str = "dummy";
pub const PARTID_EFI: &str = "EFI";
pub const PARTID_LIVE: &str = "live";
pub const PARTID_INTERNAL: &str = "internal";
pub const PARTID_DATA: &str = "data";

/// Files on the dummy partition.
pub const USER_BLOB_FILE: &str = "resources/blob0.json";
pub const BLOB1_PRIV_FILE: &str = "resources/blob1.priv.enc";
pub const BLOB1_PUB_FILE: &str = "resources/blob1.pub";
/// Convenience copy of the metadata-verification public key for admin
/// tooling.  Boot verification uses only the key preloaded into the live
/// image; a key read off the device could vouch for planted records.
pub const META_VERIFY_KEY_FILE: &str = "resources/meta-sign.pub";
pub const CHUNKS_FILE: &str = "resources/chunks.enc";
pub const INTERNAL_PASS_FILE: &str = "resources/internal-pass.enc";

/// Files on the internal partition.
pub const KEY_CONFIG_FILE: &str = "resources/config.json";
pub const FINGERPRINT_LOG_FILE: &str = "resources/integrity-fingerprint-log.json";
pub const DATA_PASS_FILE: &str = "credentials/data-pass.enc";
pub const ATTESTATION_FILE: &str = "credentials/attestation.json";
pub const PRIVDATA_KEY_FILE: &str = "credentials/privdata-ekey.priv";

/// Files on the live partition.
pub const CURRENT_SLOT_LINK: &str = "live";
pub const VALID_FROM_FILE: &str = "valid-from-ts";
/// Marker naming a freshly written slot that becomes active at next boot.
pub const STAGED_SLOT_FILE: &str = "staged-slot";
const LIVE_PAYLOAD_FILES: &[&str] = &["vmlinuz", "initrd.img", "filesystem.squashfs"];

/// Seed of the inter-partition hash chain.
const CHAIN_SEED: &str = "Let's not start at zero!";

//
// ignore predicates for the directory-hash steps
//

/// On the dummy partition, the two rewritable blobs are excluded from the
/// directory hash as long as they stay below a hard size bound; everything
/// else must be byte-stable.
pub fn dummy_ignore(root: &Path, rel: &str) -> IgnoreDecision {
    let bound = match rel {
        INTERNAL_PASS_FILE => 500,
        USER_BLOB_FILE => 10_000,
        _ => return IgnoreDecision::Include,
    };
    match std::fs::metadata(root.join(rel)) {
        Ok(meta) if meta.len() < bound => IgnoreDecision::Skip,
        _ => IgnoreDecision::Include,
    }
}

/// On the EFI partition, the active boot-params file must byte-match one of
/// the two canonical slot files; anything else poisons the hash.
pub fn efi_ignore(root: &Path, rel: &str) -> IgnoreDecision {
    if rel != "boot/grub/bootparams.cfg" {
        return IgnoreDecision::Include;
    }
    let dir = root.join("boot/grub");
    let active = std::fs::read(root.join(rel));
    let slot0 = std::fs::read(dir.join("bootparams0.cfg"));
    let slot1 = std::fs::read(dir.join("bootparams1.cfg"));
    match (active, slot0, slot1) {
        (Ok(active), Ok(slot0), Ok(slot1)) if active == slot0 || active == slot1 => {
            IgnoreDecision::Skip
        }
        _ => IgnoreDecision::Poison,
    }
}

//
// live slots
//

/// Read the active slot index from the `live` symlink.
pub fn current_slot(live_mountpoint: &Path) -> Result<u32> {
    let target = std::fs::read_link(live_mountpoint.join(CURRENT_SLOT_LINK))
        .context("reading active-slot link")?;
    match target.to_string_lossy().as_ref() {
        "live0" => Ok(0),
        "live1" => Ok(1),
        other => bail!("active-slot link points to invalid target {:?}", other),
    }
}

/// Point the `live` symlink at a slot.
pub fn set_current_slot(live_mountpoint: &Path, slot: u32) -> Result<()> {
    let link = live_mountpoint.join(CURRENT_SLOT_LINK);
    if link.exists() || std::fs::symlink_metadata(&link).is_ok() {
        std::fs::remove_file(&link).context("removing active-slot link")?;
    }
    std::os::unix::fs::symlink(format!("live{}", slot), &link)
        .context("creating active-slot link")?;
    Ok(())
}

pub fn slot_dir(live_mountpoint: &Path, slot: u32) -> std::path::PathBuf {
    live_mountpoint.join(format!("live{}", slot))
}

/// Read the staged-slot marker, if an update is pending.
pub fn staged_slot(live_mountpoint: &Path) -> Result<Option<u32>> {
    let path = live_mountpoint.join(STAGED_SLOT_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let slot: u32 = std::fs::read_to_string(&path)
        .with_context(|| format!("reading {}", path.display()))?
        .trim()
        .parse()
        .context("parsing staged-slot marker")?;
    if slot > 1 {
        bail!("staged-slot marker names invalid slot {}", slot);
    }
    Ok(Some(slot))
}

pub fn set_staged_slot(live_mountpoint: &Path, slot: u32) -> Result<()> {
    std::fs::write(
        live_mountpoint.join(STAGED_SLOT_FILE),
        format!("{}", slot),
    )
    .context("writing staged-slot marker")
}

pub fn clear_staged_slot(live_mountpoint: &Path) -> Result<()> {
    let path = live_mountpoint.join(STAGED_SLOT_FILE);
    if path.exists() {
        std::fs::remove_file(&path).context("removing staged-slot marker")?;
    }
    Ok(())
}

/// Install the live payload (kernel, initrd, squashfs) from a mounted ISO
/// into a slot directory, replacing whatever was there.
pub fn install_live_files(slot_dir: &Path, iso_mountpoint: &Path) -> Result<()> {
    std::fs::create_dir_all(slot_dir)
        .with_context(|| format!("creating {}", slot_dir.display()))?;
    let mut perms = std::fs::metadata(slot_dir)?.permissions();
    use std::os::unix::fs::PermissionsExt;
    perms.set_mode(0o700);
    std::fs::set_permissions(slot_dir, perms).context("restricting slot directory")?;

    for entry in std::fs::read_dir(slot_dir)
        .with_context(|| format!("reading {}", slot_dir.display()))?
    {
        let entry = entry?;
        std::fs::remove_file(entry.path())
            .with_context(|| format!("removing {}", entry.path().display()))?;
    }
    for name in LIVE_PAYLOAD_FILES {
        let src = iso_mountpoint.join("live").join(name);
        std::fs::copy(&src, slot_dir.join(name))
            .with_context(|| format!("copying {}", src.display()))?;
    }
    Ok(())
}

/// Record the start of the image's validity window beside the slots.
pub fn write_valid_from(live_mountpoint: &Path, timestamp: i64) -> Result<()> {
    let slot = current_slot(live_mountpoint)?;
    std::fs::write(
        slot_dir(live_mountpoint, slot).join(VALID_FROM_FILE),
        format!("{}", timestamp),
    )
    .context("writing validity timestamp")?;
    Ok(())
}

/// Refuse to run an image before its validity start: a rolled-back clock
/// must not resurrect an expired system.
pub fn check_valid_from(live_mountpoint: &Path) -> Result<()> {
    let slot = current_slot(live_mountpoint)?;
    let path = slot_dir(live_mountpoint, slot).join(VALID_FROM_FILE);
    let ts: i64 = std::fs::read_to_string(&path)
        .with_context(|| format!("reading {}", path.display()))?
        .trim()
        .parse()
        .context("parsing validity timestamp")?;
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("reading system clock")?
        .as_secs() as i64;
    if now < ts {
        return Err(anyhow!(HardkeyError::IntegrityMismatch).context(format!(
            "system clock {} predates the image validity start {}",
            now, ts
        )));
    }
    Ok(())
}

//
// user slots (the blob0 file)
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserSlot {
    pub mode: String,
    pub salt: String,
    #[serde(rename = "enc-blob")]
    pub enc_blob: String,
    /// Display name of the slot's owner.
    pub cn: String,
}

pub type UserSlots = BTreeMap<String, UserSlot>;

pub fn load_user_slots(dummy_mountpoint: &Path) -> Result<UserSlots> {
    let path = dummy_mountpoint.join(USER_BLOB_FILE);
    let data = std::fs::read_to_string(&path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data)
        .map_err(|_| anyhow!(HardkeyError::MetadataCorrupt).context("user-slot file is malformed"))
}

fn save_user_slots(dummy_mountpoint: &Path, slots: &UserSlots) -> Result<()> {
    if slots.is_empty() {
        bail!("refusing to write an empty user-slot file");
    }
    let path = dummy_mountpoint.join(USER_BLOB_FILE);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    std::fs::write(&path, serde_json::to_string(slots).context("encoding user slots")?)
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

fn encrypt_slot(user_secret: &str, cn: &str, blob0: &str) -> Result<UserSlot> {
    let salt = crypto::generate_salt()?;
    let hardened = crypto::harden_user_secret(user_secret, &salt)?;
    let enc_blob =
        PassphraseCipher::new(&hardened).encrypt(&Plain::Text(blob0.to_string()))?;
    Ok(UserSlot {
        mode: "password".into(),
        salt,
        enc_blob,
        cn: cn.to_string(),
    })
}

/// Add a user slot releasing `blob0` under `user_secret`.
/// Returns the new slot's id.
pub fn declare_user(
    dummy_mountpoint: &Path,
    cn: &str,
    user_secret: &str,
    blob0: &str,
) -> Result<String> {
    let mut slots = match load_user_slots(dummy_mountpoint) {
        Ok(slots) => slots,
        Err(_) if !dummy_mountpoint.join(USER_BLOB_FILE).exists() => BTreeMap::new(),
        Err(e) => return Err(e),
    };
    let slot_id = Uuid::new_v4().to_string();
    slots.insert(slot_id.clone(), encrypt_slot(user_secret, cn, blob0)?);
    save_user_slots(dummy_mountpoint, &slots)?;
    Ok(slot_id)
}

/// Remove a slot.  The last remaining slot can never be removed: that would
/// orphan blob0 and with it the whole key.
pub fn delete_user(dummy_mountpoint: &Path, slot_id: &str) -> Result<()> {
    let mut slots = load_user_slots(dummy_mountpoint)?;
    if slots.remove(slot_id).is_none() {
        bail!("no user slot {:?}", slot_id);
    }
    if slots.is_empty() {
        bail!("refusing to remove the last user slot");
    }
    save_user_slots(dummy_mountpoint, &slots)
}

/// Recover blob0 by trying every slot with the supplied secret.  Every
/// slot's derivation is attempted regardless of where a match is found, so
/// the attempt count does not depend on slot ordering.
pub fn unlock_blob0(
    dummy_mountpoint: &Path,
    user_secret: &str,
) -> Result<(String, String, String)> {
    let slots = load_user_slots(dummy_mountpoint)?;
    let mut unlocked: Option<(String, String, String)> = None;
    for (slot_id, slot) in &slots {
        let hardened = crypto::harden_user_secret(user_secret, &slot.salt)?;
        let attempt = PassphraseCipher::new(&hardened)
            .decrypt(&slot.enc_blob)
            .and_then(Plain::into_string);
        if let (Ok(blob0), None) = (attempt, &unlocked) {
            unlocked = Some((blob0, slot_id.clone(), slot.cn.clone()));
        }
    }
    unlocked.ok_or_else(|| anyhow!(HardkeyError::WrongPassphrase).context("no user slot matches"))
}

/// Rewrite the matching user's slot under a new secret.  blob0 itself is
/// untouched; only its wrapping changes.
pub fn change_user_password(
    dummy_mountpoint: &Path,
    current_secret: &str,
    new_secret: &str,
) -> Result<()> {
    let (blob0, slot_id, cn) = unlock_blob0(dummy_mountpoint, current_secret)?;
    let mut slots = load_user_slots(dummy_mountpoint)?;
    slots.insert(slot_id, encrypt_slot(new_secret, &cn, &blob0)?);
    save_user_slots(dummy_mountpoint, &slots)
}

/// Administrative reset: rewrap blob0 (held by the administrator) into an
/// existing slot under a new secret.
pub fn reset_user_password(
    dummy_mountpoint: &Path,
    slot_id: &str,
    new_secret: &str,
    blob0: &str,
) -> Result<()> {
    let mut slots = load_user_slots(dummy_mountpoint)?;
    let slot = slots
        .get(slot_id)
        .ok_or_else(|| anyhow!("no user slot {:?}", slot_id))?;
    let cn = slot.cn.clone();
    slots.insert(slot_id.to_string(), encrypt_slot(new_secret, &cn, blob0)?);
    save_user_slots(dummy_mountpoint, &slots)
}

//
// the integrity fingerprint
//

/// Everything the chain needs to see of the device.
pub struct FingerprintInputs<'a> {
    pub devfile: &'a Path,
    pub table: TableKind,
    pub sector_size: u64,
    /// (partition id, first sector, last sector), in layout order.
    pub partitions: &'a [(String, u64, u64)],
    pub dummy_mountpoint: &'a Path,
    pub efi_mountpoint: &'a Path,
}

/// Compute the integrity fingerprint: the ordered chain over the
/// inter-partition gaps, blob1's private key, the partition table, the
/// dummy and EFI partition trees, and the (precomputed) live-partition
/// hash.  Returns the final 64-hex fingerprint and the checkpoint log.
pub fn compute_integrity_fingerprint(
    inputs: &FingerprintInputs,
    blob1_priv_pem: &str,
    live_hash: &str,
) -> Result<(String, IntegrityLog)> {
    let mut log: IntegrityLog = Vec::new();

    // inter-partition gaps
    let mut hash = CHAIN_SEED.to_string();
    let mut gap_start: u64 = match inputs.table {
        TableKind::Dos => 1,
        TableKind::Gpt | TableKind::Hybrid => 34,
    };
    for (id, first_sector, last_sector) in inputs.partitions {
        // adjacent partitions leave an empty gap; the chain step still runs
        let gap_end = (first_sector - 1).max(gap_start);
        let gap_hash = fingerprint::hash_file_range(
            inputs.devfile,
            gap_start * inputs.sector_size,
            Some(gap_end * inputs.sector_size),
        )
        .with_context(|| format!("hashing the gap before partition {:?}", id))?;
        hash = fingerprint::chain(&hash, &gap_hash);
        log.push(Checkpoint::new(&format!("<{}", id), &hash));
        gap_start = last_sector + 1;
    }

    // blob1's private key: physical integrity alone is not enough to
    // reach the operational passphrases
    hash = fingerprint::chain(&hash, blob1_priv_pem);
    log.push(Checkpoint::new("blob1", &hash));

    // partition table
    let table_hash = fingerprint::partition_table_hash(inputs.devfile, inputs.table)?;
    hash = fingerprint::chain(&hash, &table_hash);
    log.push(Checkpoint::new("mbr", &hash));

    // dummy partition tree
    let dummy_hash = fingerprint::directory_hash(inputs.dummy_mountpoint, Some(&dummy_ignore))?;
    hash = fingerprint::chain(&hash, &dummy_hash);
    log.push(Checkpoint::new("dummy", &hash));

    // EFI partition tree
    let efi_hash = fingerprint::directory_hash(inputs.efi_mountpoint, Some(&efi_ignore))?;
    hash = fingerprint::chain(&hash, &efi_hash);
    log.push(Checkpoint::new("efi-data", &hash));

    // live partition, via the chunk verification already performed
    hash = fingerprint::chain(&hash, live_hash);
    log.push(Checkpoint::new("live", &hash));

    Ok((hash, log))
}

/// Compare a boot-time log against the sealed one and name the first chain
/// step that diverged.
pub fn first_divergent_checkpoint<'a>(
    sealed: &'a [Checkpoint],
    observed: &[Checkpoint],
) -> Option<&'a Checkpoint> {
    for (s, o) in sealed.iter().zip(observed.iter()) {
        if s != o {
            return Some(s);
        }
    }
    if observed.len() < sealed.len() {
        return sealed.get(observed.len());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn slot_link_management() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("live0")).unwrap();
        fs::create_dir(dir.path().join("live1")).unwrap();

        set_current_slot(dir.path(), 0).unwrap();
        assert_eq!(current_slot(dir.path()).unwrap(), 0);
        set_current_slot(dir.path(), 1).unwrap();
        assert_eq!(current_slot(dir.path()).unwrap(), 1);

        fs::remove_file(dir.path().join("live")).unwrap();
        std::os::unix::fs::symlink("junk", dir.path().join("live")).unwrap();
        assert!(current_slot(dir.path()).is_err());
    }

    #[test]
    fn live_file_installation() {
        let dir = TempDir::new().unwrap();
        let iso = dir.path().join("iso");
        fs::create_dir_all(iso.join("live")).unwrap();
        for name in LIVE_PAYLOAD_FILES {
            fs::write(iso.join("live").join(name), name.as_bytes()).unwrap();
        }

        let slot = dir.path().join("live0");
        fs::create_dir(&slot).unwrap();
        fs::write(slot.join("stale"), b"old payload").unwrap();

        install_live_files(&slot, &iso).unwrap();
        assert!(!slot.join("stale").exists());
        for name in LIVE_PAYLOAD_FILES {
            assert_eq!(fs::read(slot.join(name)).unwrap(), name.as_bytes());
        }
    }

    #[test]
    fn validity_window() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("live0")).unwrap();
        set_current_slot(dir.path(), 0).unwrap();

        write_valid_from(dir.path(), 1_000_000).unwrap();
        check_valid_from(dir.path()).unwrap();

        // a validity start in the far future means the clock was rolled
        // back
        write_valid_from(dir.path(), i64::MAX / 2).unwrap();
        let err = check_valid_from(dir.path()).unwrap_err();
        assert_eq!(
            crate::errors::kind_of(&err),
            Some(HardkeyError::IntegrityMismatch)
        );
    }

    #[test]
    fn dummy_ignore_bounds() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("resources")).unwrap();

        fs::write(dir.path().join(INTERNAL_PASS_FILE), vec![b'x'; 100]).unwrap();
        assert_eq!(
            dummy_ignore(dir.path(), INTERNAL_PASS_FILE),
            IgnoreDecision::Skip
        );
        fs::write(dir.path().join(INTERNAL_PASS_FILE), vec![b'x'; 600]).unwrap();
        assert_eq!(
            dummy_ignore(dir.path(), INTERNAL_PASS_FILE),
            IgnoreDecision::Include
        );
        assert_eq!(
            dummy_ignore(dir.path(), "resources/blob1.pub"),
            IgnoreDecision::Include
        );
    }

    #[test]
    fn efi_ignore_slots() {
        let dir = TempDir::new().unwrap();
        let grub = dir.path().join("boot/grub");
        fs::create_dir_all(&grub).unwrap();
        fs::write(grub.join("bootparams0.cfg"), "set bootuuid=AAAA\n").unwrap();
        fs::write(grub.join("bootparams1.cfg"), "set bootuuid=BBBB\n").unwrap();

        fs::write(grub.join("bootparams.cfg"), "set bootuuid=AAAA\n").unwrap();
        assert_eq!(
            efi_ignore(dir.path(), "boot/grub/bootparams.cfg"),
            IgnoreDecision::Skip
        );
        fs::write(grub.join("bootparams.cfg"), "set bootuuid=BBBB\n").unwrap();
        assert_eq!(
            efi_ignore(dir.path(), "boot/grub/bootparams.cfg"),
            IgnoreDecision::Skip
        );
        fs::write(grub.join("bootparams.cfg"), "set bootuuid=EVIL\n").unwrap();
        assert_eq!(
            efi_ignore(dir.path(), "boot/grub/bootparams.cfg"),
            IgnoreDecision::Poison
        );
        assert_eq!(
            efi_ignore(dir.path(), "boot/grub/grub.cfg"),
            IgnoreDecision::Include
        );
    }

    fn fake_device(dir: &TempDir) -> std::path::PathBuf {
        let path = dir.path().join("device.img");
        let mut data = vec![0u8; 4 * 1024 * 1024];
        for (i, b) in data.iter_mut().enumerate() {
            *b = (i % 253) as u8;
        }
        fs::write(&path, data).unwrap();
        path
    }

    #[test]
    fn fingerprint_chain_is_reproducible_and_ordered() {
        let dir = TempDir::new().unwrap();
        let device = fake_device(&dir);

        let dummy = dir.path().join("dummy");
        fs::create_dir_all(dummy.join("resources")).unwrap();
        fs::write(dummy.join("resources/blob1.pub"), b"PEM").unwrap();
        let efi = dir.path().join("efi");
        fs::create_dir_all(efi.join("EFI/boot")).unwrap();
        fs::write(efi.join("EFI/boot/bootx64.efi"), b"binary").unwrap();

        let partitions = vec![
            ("dummy".to_string(), 64u64, 127u64),
            ("live".to_string(), 256u64, 1023u64),
        ];
        let inputs = FingerprintInputs {
            devfile: &device,
            table: TableKind::Gpt,
            sector_size: 512,
            partitions: &partitions,
            dummy_mountpoint: &dummy,
            efi_mountpoint: &efi,
        };

        let (fp1, log1) = compute_integrity_fingerprint(&inputs, "PRIVATE PEM", "livehash").unwrap();
        let (fp2, log2) = compute_integrity_fingerprint(&inputs, "PRIVATE PEM", "livehash").unwrap();
        assert_eq!(fp1, fp2);
        assert_eq!(log1, log2);
        assert_eq!(fp1.len(), 64);

        let tags: Vec<&str> = log1.iter().map(|c| c.tag.as_str()).collect();
        assert_eq!(
            tags,
            vec!["<dummy", "<live", "blob1", "mbr", "dummy", "efi-data", "live"]
        );

        // a different blob1 diverges from the blob1 step onward
        let (fp3, log3) = compute_integrity_fingerprint(&inputs, "OTHER PEM", "livehash").unwrap();
        assert_ne!(fp3, fp1);
        assert_eq!(log3[0], log1[0]);
        assert_eq!(log3[1], log1[1]);
        assert_eq!(
            first_divergent_checkpoint(&log1, &log3).unwrap().tag,
            "blob1"
        );

        // flipping a byte in an inter-partition gap diverges from that
        // gap's checkpoint
        let mut data = fs::read(&device).unwrap();
        data[130 * 512] ^= 0xff;
        fs::write(&device, &data).unwrap();
        let (fp4, log4) = compute_integrity_fingerprint(&inputs, "PRIVATE PEM", "livehash").unwrap();
        assert_ne!(fp4, fp1);
        assert_eq!(
            first_divergent_checkpoint(&log1, &log4).unwrap().tag,
            "<live"
        );

        // a different live hash only changes the final step
        let (fp5, log5) =
            compute_integrity_fingerprint(&inputs, "PRIVATE PEM", "otherhash").unwrap();
        assert_ne!(fp5, fp4);
        assert_eq!(
            first_divergent_checkpoint(&log4, &log5).unwrap().tag,
            "live"
        );
    }

    #[test]
    fn user_slot_lifecycle() {
        let dir = TempDir::new().unwrap();
        let blob0 = "the-blob0-secret";

        let alice = declare_user(dir.path(), "Alice", "Correct-horse-42", blob0).unwrap();
        let bob = declare_user(dir.path(), "Bob", "Other-Secret-77", blob0).unwrap();
        assert_eq!(load_user_slots(dir.path()).unwrap().len(), 2);

        let (recovered, slot_id, cn) = unlock_blob0(dir.path(), "Correct-horse-42").unwrap();
        assert_eq!(recovered, blob0);
        assert_eq!(slot_id, alice);
        assert_eq!(cn, "Alice");

        let err = unlock_blob0(dir.path(), "wrong").unwrap_err();
        assert_eq!(
            crate::errors::kind_of(&err),
            Some(HardkeyError::WrongPassphrase)
        );

        // password change keeps blob0 and the other slot intact
        change_user_password(dir.path(), "Other-Secret-77", "Brand-New-88").unwrap();
        let (recovered, slot_id, _) = unlock_blob0(dir.path(), "Brand-New-88").unwrap();
        assert_eq!(recovered, blob0);
        assert_eq!(slot_id, bob);
        assert!(unlock_blob0(dir.path(), "Other-Secret-77").is_err());

        // deletion refuses to orphan the key
        delete_user(dir.path(), &alice).unwrap();
        assert!(delete_user(dir.path(), &bob).is_err());

        // administrative reset with blob0 in hand
        reset_user_password(dir.path(), &bob, "Reset-Value-99", blob0).unwrap();
        let (recovered, _, cn) = unlock_blob0(dir.path(), "Reset-Value-99").unwrap();
        assert_eq!(recovered, blob0);
        assert_eq!(cn, "Bob");
    }
}
