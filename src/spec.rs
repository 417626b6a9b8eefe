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

//! Specification builder: turns a declarative layout template plus
//! parameter values into a fully-ground device layout specification.

use anyhow::{anyhow, bail, Context, Result};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::blockdev::{self, Disk, PartitionType, TableKind};
use crate::encryption::EncryptionKind;
use crate::errors::HardkeyError;
use crate::filesystem::FsKind;

/// Parameter types accepted in a template's `parameters` section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParameterKind {
    #[serde(rename = "str")]
    Str,
    #[serde(rename = "int")]
    Int,
    #[serde(rename = "password")]
    Password,
    #[serde(rename = "filesystem")]
    Filesystem,
    #[serde(rename = "encryptiontype")]
    EncryptionType,
    #[serde(rename = "size-mb")]
    SizeMb,
    #[serde(rename = "file")]
    File,
    #[serde(rename = "timestamp")]
    Timestamp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub descr: String,
    #[serde(rename = "type")]
    pub kind: ParameterKind,
    #[serde(default)]
    pub default: Option<Value>,
    /// Parameter values flagged here are included in the signed attestation.
    #[serde(default)]
    pub attest: bool,
}

/// A validated parameter value: strings, or integers for int/size types.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Str(String),
    Int(i64),
}

impl ParamValue {
    fn to_json(&self) -> Value {
        match self {
            ParamValue::Str(s) => Value::String(s.clone()),
            ParamValue::Int(i) => Value::Number((*i).into()),
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ParamValue::Str(s) => f.write_str(s),
            ParamValue::Int(i) => write!(f, "{}", i),
        }
    }
}

fn invalid(msg: String) -> anyhow::Error {
    anyhow!(HardkeyError::InvalidParameter).context(msg)
}

fn validate_timestamp(value: &str) -> Result<()> {
    lazy_static! {
        static ref TS: Regex =
            Regex::new(r"^(\d{4})-(\d{2})-(\d{2}) (\d{2}):(\d{2}):(\d{2})$").unwrap();
    }
    let caps = TS
        .captures(value)
        .ok_or_else(|| invalid(format!("invalid timestamp {:?}", value)))?;
    let field = |i: usize| caps[i].parse::<u32>().unwrap();
    if !(1..=12).contains(&field(2))
        || !(1..=31).contains(&field(3))
        || field(4) > 23
        || field(5) > 59
        || field(6) > 59
    {
        return Err(invalid(format!("invalid timestamp {:?}", value)));
    }
    Ok(())
}

/// Check a raw value against a parameter type, resolving `file` parameters
/// against `config_dir` when relative.
pub fn validate_parameter_value(
    kind: ParameterKind,
    value: &Value,
    config_dir: Option<&Path>,
) -> Result<ParamValue> {
    match kind {
        ParameterKind::Str | ParameterKind::Password => match value {
            Value::String(s) => Ok(ParamValue::Str(s.clone())),
            other => Err(invalid(format!("expected a string, got {}", other))),
        },
        ParameterKind::Int | ParameterKind::SizeMb => {
            let n = match value {
                Value::Number(n) => n.as_i64(),
                Value::String(s) => s.parse().ok(),
                _ => None,
            }
            .ok_or_else(|| invalid(format!("expected an integer, got {}", value)))?;
            if n < 0 {
                return Err(invalid(format!("expected a non-negative integer, got {}", n)));
            }
            Ok(ParamValue::Int(n))
        }
        ParameterKind::Filesystem => {
            let s = value
                .as_str()
                .ok_or_else(|| invalid(format!("expected a filesystem name, got {}", value)))?;
            s.parse::<FsKind>()
                .map_err(|e| invalid(format!("{:#}", e)))?;
            Ok(ParamValue::Str(s.to_string()))
        }
        ParameterKind::EncryptionType => {
            let s = value
                .as_str()
                .ok_or_else(|| invalid(format!("expected an encryption type, got {}", value)))?;
            s.parse::<EncryptionKind>()
                .map_err(|e| invalid(format!("{:#}", e)))?;
            Ok(ParamValue::Str(s.to_string()))
        }
        ParameterKind::Timestamp => {
            let s = value
                .as_str()
                .ok_or_else(|| invalid(format!("expected a timestamp, got {}", value)))?;
            validate_timestamp(s)?;
            Ok(ParamValue::Str(s.to_string()))
        }
        ParameterKind::File => {
            let s = value
                .as_str()
                .ok_or_else(|| invalid(format!("expected a file path, got {}", value)))?;
            let path = if Path::new(s).is_absolute() {
                PathBuf::from(s)
            } else if let Some(dir) = config_dir {
                dir.join(s)
            } else {
                PathBuf::from(s)
            };
            if !path.exists() {
                return Err(invalid(format!("missing file {}", path.display())));
            }
            Ok(ParamValue::Str(path.to_string_lossy().into_owned()))
        }
    }
}

//
// placeholder substitution
//

lazy_static! {
    static ref VAR: Regex = Regex::new(r#"\{!?[a-zA-Z0-9_-]+(?:=[^"'=}]*)?\}"#).unwrap();
}

/// List the `{name}` placeholders in a string, including escapes.
pub fn variables_in_string(s: &str) -> Vec<String> {
    VAR.find_iter(s).map(|m| m.as_str().to_string()).collect()
}

/// Expand placeholders in one string.  `{name}` substitutes the value;
/// `{name=default}` falls back to the default when no value is set;
/// `{!name}` is a literal `{name}`.  An integer value standing alone
/// replaces the whole string by a number.
fn expand_string(s: &str, values: &BTreeMap<String, ParamValue>) -> Result<Value> {
    let mut out = s.to_string();
    for var in variables_in_string(s) {
        let inner = &var[1..var.len() - 1];
        if let Some(stripped) = inner.strip_prefix('!') {
            out = out.replace(&var, &format!("{{{}}}", stripped));
            continue;
        }
        let (name, default) = match inner.split_once('=') {
            Some((n, d)) => (n, Some(d)),
            None => (inner, None),
        };
        match values.get(name) {
            Some(ParamValue::Int(n)) if out == var => {
                // a lone integer placeholder grounds to a JSON number
                return Ok(Value::Number((*n).into()));
            }
            Some(v) => out = out.replace(&var, &v.to_string()),
            None => match default {
                Some(d) => out = out.replace(&var, d),
                None => {
                    return Err(invalid(format!("can't expand unknown variable {:?}", name)))
                }
            },
        }
    }
    Ok(Value::String(out))
}

/// Recursively expand placeholders through a JSON document.
pub fn substitute(data: &Value, values: &BTreeMap<String, ParamValue>) -> Result<Value> {
    match data {
        Value::String(s) => expand_string(s, values),
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (k, v) in map {
                out.insert(k.clone(), substitute(v, values)?);
            }
            Ok(Value::Object(out))
        }
        Value::Array(items) => Ok(Value::Array(
            items
                .iter()
                .map(|v| substitute(v, values))
                .collect::<Result<_>>()?,
        )),
        other => Ok(other.clone()),
    }
}

//
// the grounded device layout specification
//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionSpec {
    pub id: String,
    #[serde(rename = "type")]
    pub type_tag: Option<PartitionType>,
    pub label: String,
    #[serde(rename = "volume-id")]
    pub volume_id: Option<String>,
    pub encryption: Option<EncryptionKind>,
    pub immutable: bool,
    pub filesystem: Option<FsKind>,
    /// Transient; never serialized into sealed metadata.
    pub password: Option<String>,
    /// Positive: exact size.  Negative: all but that much reserved.
    /// Zero or absent: all remaining space.
    #[serde(rename = "size-mb")]
    pub size_mb: Option<i64>,
}

/// First-position pseudo-partitions plus regular descriptors.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PartitionEntry {
    LeaveExisting {
        #[serde(rename = "leave-existing")]
        leave_existing: String,
        #[serde(rename = "size-mb", default)]
        size_mb: Option<i64>,
    },
    IsoFile {
        #[serde(rename = "iso-file")]
        iso_file: String,
        #[serde(rename = "size-mb", default)]
        size_mb: Option<i64>,
    },
    Partition(PartitionSpec),
}

impl PartitionEntry {
    pub fn as_partition(&self) -> Option<&PartitionSpec> {
        match self {
            PartitionEntry::Partition(p) => Some(p),
            _ => None,
        }
    }
}

/// How a protected field or a signature can be produced/consumed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CryptoSpec {
    #[serde(rename = "type")]
    pub kind: CryptoSpecKind,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(rename = "public-key-file", default)]
    pub public_key_file: Option<String>,
    #[serde(rename = "private-key-file", default)]
    pub private_key_file: Option<String>,
    #[serde(rename = "cert-file", default)]
    pub cert_file: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CryptoSpecKind {
    Password,
    Key,
    Certificate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSpec {
    pub device: String,
    #[serde(rename = "type")]
    pub table: TableKind,
    pub partitions: Vec<PartitionEntry>,
    #[serde(rename = "hybrid-partitions", default)]
    pub hybrid_partitions: Option<Vec<String>>,
    pub unprotected: BTreeMap<String, String>,
    /// decryptor id -> field name -> value; `@{partition}/{field}`
    /// references are resolved by the installer.
    pub protected: BTreeMap<String, BTreeMap<String, Option<String>>>,
    pub decryptors: BTreeMap<String, CryptoSpec>,
    pub signatures: BTreeMap<String, CryptoSpec>,
}

impl DeviceSpec {
    pub fn partition(&self, id: &str) -> Result<&PartitionSpec> {
        self.partitions
            .iter()
            .filter_map(|e| e.as_partition())
            .find(|p| p.id == id)
            .ok_or_else(|| anyhow!("no partition with id {:?}", id))
    }

    pub fn partition_mut(&mut self, id: &str) -> Result<&mut PartitionSpec> {
        self.partitions
            .iter_mut()
            .filter_map(|e| match e {
                PartitionEntry::Partition(p) => Some(p),
                _ => None,
            })
            .find(|p| p.id == id)
            .ok_or_else(|| anyhow!("no partition with id {:?}", id))
    }

    /// Structural validation of a grounded specification.
    pub fn validate(&self) -> Result<()> {
        let bad = |msg: String| anyhow!(HardkeyError::InvalidConfig).context(msg);

        // pseudo-partitions only in first position
        for entry in &self.partitions[1.min(self.partitions.len())..] {
            if !matches!(entry, PartitionEntry::Partition(_)) {
                return Err(bad(
                    "leave-existing and iso-file are only accepted as the first descriptor"
                        .to_string(),
                ));
            }
        }

        // unique partition ids
        let ids: Vec<&str> = self
            .partitions
            .iter()
            .filter_map(|e| e.as_partition())
            .map(|p| p.id.as_str())
            .collect();
        for (i, id) in ids.iter().enumerate() {
            if ids[..i].contains(id) {
                return Err(anyhow!(HardkeyError::DuplicateId)
                    .context(format!("duplicate partition id {:?}", id)));
            }
        }

        // hybrid MBR references
        match (&self.table, &self.hybrid_partitions) {
            (TableKind::Hybrid, Some(hybrid)) => {
                if hybrid.is_empty() || hybrid.len() > 3 {
                    return Err(bad(format!(
                        "a hybrid MBR names between 1 and 3 partitions, not {}",
                        hybrid.len()
                    )));
                }
                for id in hybrid {
                    if !ids.contains(&id.as_str()) {
                        return Err(bad(format!(
                            "unknown partition {:?} referenced in the hybrid MBR",
                            id
                        )));
                    }
                }
            }
            (TableKind::Hybrid, None) => {
                return Err(bad("missing hybrid-partitions information".to_string()))
            }
            (_, Some(_)) => {
                return Err(bad("useless hybrid-partitions information".to_string()))
            }
            (_, None) => (),
        }

        // protected sections reference declared decryptors and valid
        // partition fields
        for (decryptor, fields) in &self.protected {
            if !self.decryptors.contains_key(decryptor) {
                return Err(anyhow!(HardkeyError::MissingReference)
                    .context(format!("protected section references unknown decryptor {:?}", decryptor)));
            }
            for (field, value) in fields {
                if let Some(reference) = field.strip_prefix('@') {
                    let (part_id, what) = reference.split_once('/').ok_or_else(|| {
                        bad(format!("invalid protected reference {:?}", field))
                    })?;
                    if !ids.contains(&part_id) {
                        return Err(bad(format!(
                            "invalid partition reference {:?}",
                            part_id
                        )));
                    }
                    if !matches!(what, "password" | "header") {
                        return Err(bad(format!(
                            "invalid protected reference {:?}",
                            field
                        )));
                    }
                    if value.is_some() {
                        return Err(bad(format!(
                            "protected reference {:?} must not carry a value",
                            field
                        )));
                    }
                }
            }
        }

        Ok(())
    }
}

//
// the template and its builder
//

#[derive(Debug, Clone, Deserialize)]
pub struct LayoutTemplate {
    pub descr: String,
    pub parameters: BTreeMap<String, ParameterSpec>,
    #[serde(rename = "dev-format")]
    pub dev_format: Value,
}

/// Parameters populated by the builder itself before substitution.
const AUTO_PARAMETERS: &[&str] = &["_dev", "_serial", "_model"];

/// Builds a grounded specification from a template and parameter values.
#[derive(Debug)]
pub struct Builder {
    template: LayoutTemplate,
    values: BTreeMap<String, ParamValue>,
}

impl Builder {
    /// Parse and validate a template, and auto-populate the target device
    /// path, hardware serial, and hardware model.
    pub fn new(target: &Path, template_json: &str) -> Result<Self> {
        let template: LayoutTemplate = serde_json::from_str(template_json)
            .map_err(|e| anyhow!(HardkeyError::InvalidConfig).context(format!("parsing template: {}", e)))?;
        Self::validate_template(&template)?;

        let mut builder = Builder {
            template,
            values: BTreeMap::new(),
        };
        builder
            .values
            .insert("_dev".into(), ParamValue::Str(target.to_string_lossy().into_owned()));
        if target.starts_with("/dev/") {
            builder.values.insert(
                "_serial".into(),
                ParamValue::Str(blockdev::device_serial(target)?),
            );
            builder.values.insert(
                "_model".into(),
                ParamValue::Str(blockdev::device_model(target)?),
            );
        } else {
            builder
                .values
                .insert("_serial".into(), ParamValue::Str(String::new()));
            builder
                .values
                .insert("_model".into(), ParamValue::Str("VM image file".into()));
        }
        Ok(builder)
    }

    /// Like `new`, but taking the hardware identity from an opened disk.
    pub fn for_disk(disk: &Disk, template_json: &str) -> Result<Self> {
        let mut builder = Self::new(disk.devfile(), template_json)?;
        let hw = disk.hardware_id()?;
        builder
            .values
            .insert("_serial".into(), ParamValue::Str(hw.serial));
        builder
            .values
            .insert("_model".into(), ParamValue::Str(hw.model));
        Ok(builder)
    }

    fn validate_template(template: &LayoutTemplate) -> Result<()> {
        let specs = &template.dev_format;
        for key in [
            "device",
            "type",
            "partitions",
            "unprotected",
            "protected",
            "decryptors",
            "signatures",
        ] {
            if specs.get(key).is_none() {
                return Err(anyhow!(HardkeyError::InvalidConfig)
                    .context(format!("missing key {:?} in specifications", key)));
            }
        }

        // every placeholder must correspond to a declared parameter
        let mut known: Vec<&str> = template.parameters.keys().map(String::as_str).collect();
        known.extend_from_slice(AUTO_PARAMETERS);
        check_variables_known(specs, &known)?;
        Ok(())
    }

    pub fn parameters(&self) -> &BTreeMap<String, ParameterSpec> {
        &self.template.parameters
    }

    /// Validate and record a parameter value.  Unknown names are an error;
    /// the template is the contract.
    pub fn set_parameter(&mut self, name: &str, value: &Value, config_dir: Option<&Path>) -> Result<()> {
        let spec = self
            .template
            .parameters
            .get(name)
            .ok_or_else(|| invalid(format!("unknown parameter {:?}", name)))?;
        let validated = validate_parameter_value(spec.kind, value, config_dir)
            .with_context(|| format!("invalid value for parameter {:?}", name))?;
        self.values.insert(name.to_string(), validated);
        Ok(())
    }

    /// Ground the template into a concrete, validated specification.
    pub fn specifications(&self) -> Result<DeviceSpec> {
        for auto in AUTO_PARAMETERS {
            if !self.values.contains_key(*auto) {
                bail!("parameter {:?} has not been defined", auto);
            }
        }
        let grounded = substitute(&self.template.dev_format, &self.values)?;
        let spec: DeviceSpec = serde_json::from_value(grounded)
            .map_err(|e| anyhow!(HardkeyError::InvalidConfig).context(format!("grounded specification is malformed: {}", e)))?;
        spec.validate()?;
        Ok(spec)
    }
}

fn check_variables_known(data: &Value, known: &[&str]) -> Result<()> {
    match data {
        Value::String(s) => {
            for var in variables_in_string(s) {
                let inner = &var[1..var.len() - 1];
                if inner.starts_with('!') {
                    continue;
                }
                let name = inner.split('=').next().unwrap();
                if !known.contains(&name) {
                    return Err(anyhow!(HardkeyError::InvalidConfig)
                        .context(format!("no parameter defined for variable {:?}", name)));
                }
            }
            Ok(())
        }
        Value::Object(map) => {
            for v in map.values() {
                check_variables_known(v, known)?;
            }
            Ok(())
        }
        Value::Array(items) => {
            for v in items {
                check_variables_known(v, known)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::kind_of;
    use maplit::btreemap;

    const TEMPLATE: &str = r#"{
        "descr": "workstation key",
        "parameters": {
            "password-user": {"descr": "user password", "type": "password", "attest": false},
            "data-size": {"descr": "data partition size", "type": "size-mb", "attest": false},
            "data-fs": {"descr": "data filesystem", "type": "filesystem", "attest": false},
            "owner": {"descr": "key owner", "type": "str", "attest": true}
        },
        "dev-format": {
            "device": "{_dev}",
            "type": "gpt",
            "partitions": [
                {"id": "dummy", "type": "EFI", "label": "KEY", "volume-id": null,
                 "encryption": null, "immutable": true, "filesystem": "fat",
                 "password": null, "size-mb": 200},
                {"id": "internal", "type": "LINUX", "label": "internal", "volume-id": null,
                 "encryption": "luks", "immutable": false, "filesystem": "ext4",
                 "password": null, "size-mb": 1000},
                {"id": "data", "type": "LINUX", "label": "{owner=nobody}", "volume-id": null,
                 "encryption": "luks", "immutable": false, "filesystem": "{data-fs}",
                 "password": null, "size-mb": "{data-size}"}
            ],
            "unprotected": {"owner": "{owner}"},
            "protected": {"admin": {"@data/password": null, "note": "{!data-size}"}},
            "decryptors": {"admin": {"type": "password", "password": "adminpw1234"}},
            "signatures": {}
        }
    }"#;

    fn values() -> BTreeMap<String, ParamValue> {
        btreemap! {
            "name".to_string() => ParamValue::Str("alice".into()),
            "size".to_string() => ParamValue::Int(2048),
        }
    }

    #[test]
    fn variable_listing() {
        assert_eq!(
            variables_in_string("a {x} b {y=3} c {!z}"),
            vec!["{x}", "{y=3}", "{!z}"]
        );
        assert!(variables_in_string("nothing here").is_empty());
    }

    #[test]
    fn string_expansion() {
        let vals = values();
        assert_eq!(
            expand_string("hello {name}", &vals).unwrap(),
            Value::String("hello alice".into())
        );
        // lone integer placeholder becomes a number
        assert_eq!(expand_string("{size}", &vals).unwrap(), Value::Number(2048.into()));
        // embedded integer stays textual
        assert_eq!(
            expand_string("{size} MB", &vals).unwrap(),
            Value::String("2048 MB".into())
        );
        // defaults and escapes
        assert_eq!(
            expand_string("{missing=fallback}", &vals).unwrap(),
            Value::String("fallback".into())
        );
        assert_eq!(
            expand_string("{!name}", &vals).unwrap(),
            Value::String("{name}".into())
        );
        assert!(expand_string("{missing}", &vals).is_err());
    }

    #[test]
    fn parameter_validation() {
        let ok = |k, v: Value| validate_parameter_value(k, &v, None).unwrap();
        let err = |k, v: Value| validate_parameter_value(k, &v, None).unwrap_err();

        assert_eq!(ok(ParameterKind::Str, "x".into()), ParamValue::Str("x".into()));
        assert_eq!(ok(ParameterKind::Int, 7.into()), ParamValue::Int(7));
        assert_eq!(ok(ParameterKind::SizeMb, "512".into()), ParamValue::Int(512));
        assert_eq!(
            kind_of(&err(ParameterKind::Int, (-1).into())),
            Some(HardkeyError::InvalidParameter)
        );
        ok(ParameterKind::Filesystem, "ext4".into());
        err(ParameterKind::Filesystem, "squashfs".into());
        ok(ParameterKind::EncryptionType, "luks".into());
        err(ParameterKind::EncryptionType, "rot13".into());
        ok(ParameterKind::Timestamp, "2024-02-29 23:59:59".into());
        err(ParameterKind::Timestamp, "2024-13-01 00:00:00".into());
        err(ParameterKind::Timestamp, "yesterday".into());
        err(ParameterKind::File, "/nonexistent/file".into());
    }

    #[test]
    fn file_parameter_resolves_against_config_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("payload.bin"), b"x").unwrap();
        let v = validate_parameter_value(
            ParameterKind::File,
            &"payload.bin".into(),
            Some(dir.path()),
        )
        .unwrap();
        assert_eq!(
            v,
            ParamValue::Str(dir.path().join("payload.bin").to_string_lossy().into_owned())
        );
    }

    #[test]
    fn build_grounded_spec() {
        let mut builder = Builder::new(Path::new("/tmp/image.img"), TEMPLATE).unwrap();
        builder
            .set_parameter("password-user", &"Correct-horse-42".into(), None)
            .unwrap();
        builder.set_parameter("data-size", &4096.into(), None).unwrap();
        builder.set_parameter("data-fs", &"exfat".into(), None).unwrap();
        builder.set_parameter("owner", &"alice".into(), None).unwrap();

        let spec = builder.specifications().unwrap();
        assert_eq!(spec.device, "/tmp/image.img");
        assert_eq!(spec.table, TableKind::Gpt);
        assert_eq!(spec.partitions.len(), 3);

        let data = spec.partition("data").unwrap();
        assert_eq!(data.label, "alice");
        assert_eq!(data.size_mb, Some(4096));
        assert_eq!(data.filesystem, Some(FsKind::Exfat));
        assert_eq!(data.encryption, Some(EncryptionKind::Luks));
        assert_eq!(spec.unprotected["owner"], "alice");
        // escape survived as a literal placeholder
        assert_eq!(
            spec.protected["admin"]["note"].as_deref(),
            Some("{data-size}")
        );
    }

    #[test]
    fn unknown_parameter_rejected() {
        let mut builder = Builder::new(Path::new("/tmp/image.img"), TEMPLATE).unwrap();
        let err = builder
            .set_parameter("no-such-param", &"x".into(), None)
            .unwrap_err();
        assert_eq!(kind_of(&err), Some(HardkeyError::InvalidParameter));
    }

    #[test]
    fn template_with_undeclared_variable_rejected() {
        let bad = TEMPLATE.replace("{owner}", "{undeclared}");
        let err = Builder::new(Path::new("/tmp/image.img"), &bad).unwrap_err();
        assert_eq!(kind_of(&err), Some(HardkeyError::InvalidConfig));
    }

    #[test]
    fn missing_value_without_default_fails_at_grounding() {
        let mut builder = Builder::new(Path::new("/tmp/image.img"), TEMPLATE).unwrap();
        builder.set_parameter("data-size", &4096.into(), None).unwrap();
        builder.set_parameter("data-fs", &"ext4".into(), None).unwrap();
        // "owner" has a default inside the label but not in "unprotected"
        let err = builder.specifications().unwrap_err();
        assert_eq!(kind_of(&err), Some(HardkeyError::InvalidParameter));
    }

    fn minimal_spec() -> DeviceSpec {
        serde_json::from_value(serde_json::json!({
            "device": "/dev/sdz",
            "type": "gpt",
            "partitions": [
                {"id": "a", "type": "EFI", "label": "A", "volume-id": null,
                 "encryption": null, "immutable": false, "filesystem": "fat",
                 "password": null, "size-mb": 100},
                {"id": "b", "type": "LINUX", "label": "B", "volume-id": null,
                 "encryption": "luks", "immutable": false, "filesystem": "ext4",
                 "password": null, "size-mb": null}
            ],
            "unprotected": {},
            "protected": {},
            "decryptors": {},
            "signatures": {}
        }))
        .unwrap()
    }

    #[test]
    fn structural_validation() {
        minimal_spec().validate().unwrap();

        // duplicate ids
        let mut spec = minimal_spec();
        spec.partition_mut("b").unwrap().id = "a".into();
        assert_eq!(
            kind_of(&spec.validate().unwrap_err()),
            Some(HardkeyError::DuplicateId)
        );

        // hybrid references
        let mut spec = minimal_spec();
        spec.table = TableKind::Hybrid;
        assert!(spec.validate().is_err());
        spec.hybrid_partitions = Some(vec!["a".into(), "nope".into()]);
        assert!(spec.validate().is_err());
        spec.hybrid_partitions = Some(vec!["a".into()]);
        spec.validate().unwrap();

        // protected reference to an undeclared decryptor
        let mut spec = minimal_spec();
        spec.protected
            .insert("ghost".into(), BTreeMap::new());
        assert_eq!(
            kind_of(&spec.validate().unwrap_err()),
            Some(HardkeyError::MissingReference)
        );

        // invalid partition reference in protected section
        let mut spec = minimal_spec();
        spec.decryptors.insert(
            "admin".into(),
            CryptoSpec {
                kind: CryptoSpecKind::Password,
                password: Some("pw".into()),
                public_key_file: None,
                private_key_file: None,
                cert_file: None,
            },
        );
        spec.protected.insert(
            "admin".into(),
            btreemap! { "@zzz/password".to_string() => None },
        );
        assert!(spec.validate().is_err());

        let mut spec = minimal_spec();
        spec.decryptors.insert(
            "admin".into(),
            CryptoSpec {
                kind: CryptoSpecKind::Password,
                password: Some("pw".into()),
                public_key_file: None,
                private_key_file: None,
                cert_file: None,
            },
        );
        spec.protected.insert(
            "admin".into(),
            btreemap! { "@b/password".to_string() => None },
        );
        spec.validate().unwrap();
    }
}
