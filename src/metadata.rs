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

//! Appended metadata codec: the signed metadata record and the signature
//! record written at fixed trailing offsets of a provisioned device.
//!
//! Each record is canonical JSON (UTF-8, sorted keys, no insignificant
//! whitespace) prefixed by an 8-byte little-endian length.  The metadata
//! record sits 5 MiB before the end of the device, the signature record
//! 1 MiB before the end.

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::blockdev::{HardwareId, PartitionType, TableKind};
use crate::crypto::{CryptoEngine, Plain};
use crate::encryption::EncryptionKind;
use crate::errors::HardkeyError;
use crate::spec::CryptoSpec;

const META_OFFSET_FROM_END: u64 = 5 * 1024 * 1024;
const SIG_OFFSET_FROM_END: u64 = 1024 * 1024;
/// Upper bound on a record's length field; anything bigger means we are
/// reading garbage, not a record.
const MAX_RECORD_LEN: u64 = 2 * 1024 * 1024;

/// One partition as recorded at sealing time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SealedPartition {
    pub id: Option<String>,
    pub number: u32,
    #[serde(rename = "sector-start")]
    pub sector_start: u64,
    #[serde(rename = "sector-end")]
    pub sector_end: u64,
    #[serde(rename = "size-bytes")]
    pub size_bytes: u64,
    #[serde(rename = "type")]
    pub type_tag: Option<PartitionType>,
    pub label: Option<String>,
    pub filesystem: Option<String>,
    pub immutable: bool,
    pub encryption: Option<EncryptionKind>,
    /// `sha256|...` over the raw partition, for immutable partitions.
    #[serde(rename = "analysed-hash", default)]
    pub hash: Option<String>,
    /// Directory hash for immutable FAT/NTFS partitions, where host OSes
    /// rewrite filesystem structures without touching file contents.
    #[serde(rename = "analysed-files-hash", default)]
    pub files_hash: Option<String>,
    /// Armored copy of the encryption header, for encrypted partitions.
    #[serde(default)]
    pub header: Option<String>,
}

/// Observed layout section of the metadata record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SealedLayout {
    #[serde(rename = "type")]
    pub table: TableKind,
    #[serde(rename = "sector-size")]
    pub sector_size: u64,
    #[serde(rename = "table-hash")]
    pub table_hash: String,
    pub partitions: Vec<SealedPartition>,
}

/// The metadata record.  Created once at provisioning, rewritten only by an
/// explicit reseal, read-only at boot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetaRecord {
    pub format: u32,
    #[serde(rename = "hw-id")]
    pub hardware: HardwareId,
    pub verif: SealedLayout,
    pub unprotected: BTreeMap<String, String>,
    /// decryptor id -> envelope over a canonical JSON map of fields
    pub protected: BTreeMap<String, String>,
}

impl MetaRecord {
    /// Canonical JSON: serde_json maps are sorted, and compact encoding
    /// has no insignificant whitespace.
    pub fn canonical_json(&self) -> Result<String> {
        serde_json::to_string(self).context("encoding metadata record")
    }
}

/// Both trailing records, as read from a device.
#[derive(Debug)]
pub struct AppendedMetadata {
    meta: MetaRecord,
    canonical: String,
    signatures: BTreeMap<String, String>,
    verified: bool,
}

fn corrupt(msg: &str) -> anyhow::Error {
    anyhow!(HardkeyError::MetadataCorrupt).context(msg.to_string())
}

fn write_record(f: &mut std::fs::File, end: u64, offset_from_end: u64, json: &str) -> Result<()> {
    if json.len() as u64 + 8 > MAX_RECORD_LEN {
        bail!("record of {} bytes exceeds the reserved area", json.len());
    }
    f.seek(SeekFrom::Start(end - offset_from_end))
        .context("seeking to record offset")?;
    f.write_all(&(json.len() as u64).to_le_bytes())
        .context("writing record length")?;
    f.write_all(json.as_bytes()).context("writing record")?;
    Ok(())
}

fn read_record(f: &mut std::fs::File, end: u64, offset_from_end: u64) -> Result<String> {
    f.seek(SeekFrom::Start(end - offset_from_end))
        .context("seeking to record offset")?;
    let mut lenbuf = [0u8; 8];
    f.read_exact(&mut lenbuf).context("reading record length")?;
    let len = u64::from_le_bytes(lenbuf);
    if len == 0 || len > MAX_RECORD_LEN {
        return Err(corrupt("record length out of range"));
    }
    let mut buf = vec![0u8; len as usize];
    f.read_exact(&mut buf).context("reading record")?;
    String::from_utf8(buf).map_err(|_| corrupt("record is not UTF-8"))
}

fn device_end(f: &mut std::fs::File) -> Result<u64> {
    f.seek(SeekFrom::End(0)).context("getting device size")
}

/// Seal a metadata record: write it and a signature record produced by
/// every declared signer.
pub fn write_records(
    devfile: &Path,
    meta: &MetaRecord,
    signers: &BTreeMap<String, CryptoSpec>,
    base_dir: Option<&Path>,
) -> Result<()> {
    let canonical = meta.canonical_json()?;

    let mut signatures = BTreeMap::new();
    for (id, spec) in signers {
        let engine = CryptoEngine::from_spec(spec, base_dir)
            .with_context(|| format!("loading signer {:?}", id))?;
        signatures.insert(
            id.clone(),
            engine
                .sign(canonical.as_bytes())
                .with_context(|| format!("signing metadata with {:?}", id))?,
        );
    }
    let sig_json = serde_json::to_string(&signatures).context("encoding signature record")?;

    let mut f = OpenOptions::new()
        .read(true)
        .write(true)
        .open(devfile)
        .with_context(|| format!("opening {}", devfile.display()))?;
    let end = device_end(&mut f)?;
    write_record(&mut f, end, META_OFFSET_FROM_END, &canonical)?;
    write_record(&mut f, end, SIG_OFFSET_FROM_END, &sig_json)?;
    f.sync_all().context("syncing metadata records")?;
    Ok(())
}

/// Read both trailing records.  The result is unverified; call `verify`
/// before trusting any field.
pub fn read_records(devfile: &Path) -> Result<AppendedMetadata> {
    let mut f = OpenOptions::new()
        .read(true)
        .open(devfile)
        .with_context(|| format!("opening {}", devfile.display()))?;
    let end = device_end(&mut f)?;
    if end < META_OFFSET_FROM_END {
        return Err(corrupt("device is smaller than the metadata area"));
    }

    let canonical = read_record(&mut f, end, META_OFFSET_FROM_END)
        .context("reading metadata record")?;
    let meta: MetaRecord =
        serde_json::from_str(&canonical).map_err(|_| corrupt("metadata record is malformed"))?;

    let sig_json =
        read_record(&mut f, end, SIG_OFFSET_FROM_END).context("reading signature record")?;
    let signatures: BTreeMap<String, String> =
        serde_json::from_str(&sig_json).map_err(|_| corrupt("signature record is malformed"))?;

    Ok(AppendedMetadata {
        meta,
        canonical,
        signatures,
        verified: false,
    })
}

impl AppendedMetadata {
    /// Verify every listed verifier's signature.  All must succeed; a
    /// missing signature is as fatal as a wrong one.
    pub fn verify(&mut self, verifiers: &BTreeMap<String, CryptoSpec>, base_dir: Option<&Path>) -> Result<()> {
        let mut engines = BTreeMap::new();
        for (id, spec) in verifiers {
            engines.insert(
                id.clone(),
                CryptoEngine::from_spec(spec, base_dir)
                    .with_context(|| format!("loading verifier {:?}", id))?,
            );
        }
        self.verify_with_engines(&engines)
    }

    /// Like `verify`, for callers that already hold the key material
    /// (e.g. the boot process with its preloaded administrator key).
    pub fn verify_with_engines(&mut self, verifiers: &BTreeMap<String, CryptoEngine>) -> Result<()> {
        if verifiers.is_empty() {
            bail!("no verifiers provided");
        }
        for (id, engine) in verifiers {
            let signature = self.signatures.get(id).ok_or_else(|| {
                anyhow!(HardkeyError::SignatureInvalid)
                    .context(format!("no signature from signer {:?}", id))
            })?;
            engine
                .verify(self.canonical.as_bytes(), signature)
                .with_context(|| format!("verifying signature from {:?}", id))?;
        }
        self.verified = true;
        Ok(())
    }

    pub fn is_verified(&self) -> bool {
        self.verified
    }

    fn require_verified(&self) -> Result<()> {
        if !self.verified {
            bail!("metadata has not been verified");
        }
        Ok(())
    }

    pub fn signer_ids(&self) -> BTreeSet<String> {
        self.signatures.keys().cloned().collect()
    }

    pub fn decryptor_ids(&self) -> BTreeSet<String> {
        self.meta.protected.keys().cloned().collect()
    }

    pub fn hardware_id(&self) -> Result<&HardwareId> {
        self.require_verified()?;
        Ok(&self.meta.hardware)
    }

    pub fn observed_layout(&self) -> Result<&SealedLayout> {
        self.require_verified()?;
        Ok(&self.meta.verif)
    }

    pub fn unprotected_fields(&self) -> Result<&BTreeMap<String, String>> {
        self.require_verified()?;
        Ok(&self.meta.unprotected)
    }

    /// Unprotected fields without signature verification; callers get the
    /// verification status alongside and must not act on these.
    pub fn unverified_unprotected_fields(&self) -> &BTreeMap<String, String> {
        &self.meta.unprotected
    }

    /// Decrypt the protected sections matching the provided decryptors and
    /// merge their fields.  Fails if no decryptor matches.
    pub fn protected_fields(
        &self,
        decryptors: &BTreeMap<String, CryptoSpec>,
        base_dir: Option<&Path>,
    ) -> Result<BTreeMap<String, String>> {
        self.require_verified()?;
        let mut fields = BTreeMap::new();
        let mut matched = false;
        for (id, envelope) in &self.meta.protected {
            let spec = match decryptors.get(id) {
                Some(s) => s,
                None => continue,
            };
            let engine = CryptoEngine::from_spec(spec, base_dir)
                .with_context(|| format!("loading decryptor {:?}", id))?;
            let plain = engine
                .decrypt(envelope)
                .with_context(|| format!("decrypting protected section {:?}", id))?;
            let section: BTreeMap<String, String> = serde_json::from_str(&plain.into_string()?)
                .map_err(|_| corrupt("protected section is malformed"))?;
            fields.extend(section);
            matched = true;
        }
        if !matched {
            bail!("no matching decryptor provided");
        }
        Ok(fields)
    }

    pub fn record(&self) -> Result<&MetaRecord> {
        self.require_verified()?;
        Ok(&self.meta)
    }
}

/// Encrypt the per-decryptor protected sections of a grounded
/// specification.  `resolve` supplies the value of `@partition/field`
/// references.
pub fn protect_sections(
    protected: &BTreeMap<String, BTreeMap<String, Option<String>>>,
    decryptors: &BTreeMap<String, CryptoSpec>,
    base_dir: Option<&Path>,
    resolve: &dyn Fn(&str) -> Result<String>,
) -> Result<BTreeMap<String, String>> {
    let mut out = BTreeMap::new();
    for (id, fields) in protected {
        let spec = decryptors.get(id).ok_or_else(|| {
            anyhow!(HardkeyError::MissingReference)
                .context(format!("protected section references unknown decryptor {:?}", id))
        })?;
        let mut section: BTreeMap<String, String> = BTreeMap::new();
        for (field, value) in fields {
            let value = match (field.strip_prefix('@'), value) {
                (Some(reference), _) => resolve(reference)
                    .with_context(|| format!("resolving protected reference {:?}", field))?,
                (None, Some(v)) => v.clone(),
                (None, None) => continue,
            };
            section.insert(field.clone(), value);
        }
        let engine = CryptoEngine::from_spec(spec, base_dir)
            .with_context(|| format!("loading decryptor {:?}", id))?;
        let json = serde_json::to_string(&section).context("encoding protected section")?;
        out.insert(id.clone(), engine.encrypt(&Plain::Text(json))?);
    }
    Ok(out)
}
