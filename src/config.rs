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

//! Configuration model: the typed, cross-referenced collection of build,
//! install, format, domain and repository configurations under one
//! self-describing root.  The loaded model is an explicit context passed
//! into every operation; the only process-wide state is the lock files the
//! repository engine keeps on disk.

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use url::Url;
use uuid::Uuid;
use walkdir::WalkDir;

use crate::crypto;
use crate::errors::HardkeyError;
use crate::repo::Repo;
use crate::spec::ParameterSpec;

const GLOBAL_SETTINGS_FILE: &str = "inseca.json";
const BUILD_DIR: &str = "build-configurations";
const INSTALL_DIR: &str = "install-configurations";
const FORMAT_DIR: &str = "format-configurations";
const DOMAIN_DIR: &str = "domain-configurations";
const REPO_DIR: &str = "repo-configurations";
const REPOS_DATA_DIR: &str = "repos";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigKind {
    Build,
    Install,
    Format,
    Domain,
    Repo,
}

/// What kind of payload a repository distributes; must match the kind of
/// the configuration referencing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepoSubtype {
    Build,
    Install,
    Format,
    Domain,
    Userdata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BuildType {
    #[serde(rename = "wks")]
    Workstation,
    #[serde(rename = "server")]
    Server,
    #[serde(rename = "admin")]
    Admin,
}

/// Outcome of a configuration's coherence analysis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigStatus {
    Valid,
    Warnings(Vec<String>),
    Errors(Vec<String>),
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct L10n {
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub locale: Option<String>,
    #[serde(rename = "keyboard-layout", default)]
    pub keyboard_layout: Option<String>,
    #[serde(rename = "keyboard-model", default)]
    pub keyboard_model: Option<String>,
    #[serde(rename = "keyboard-variant", default)]
    pub keyboard_variant: Option<String>,
    #[serde(rename = "keyboard-option", default)]
    pub keyboard_option: Option<String>,
}

impl L10n {
    /// The six `L10N_*` variables handed to component scripts.
    pub fn env_vars(&self) -> Vec<(String, String)> {
        let get = |v: &Option<String>| v.clone().unwrap_or_default();
        vec![
            ("L10N_TIMEZONE".into(), get(&self.timezone)),
            ("L10N_LOCALE".into(), get(&self.locale)),
            ("L10N_KB_LAYOUT".into(), get(&self.keyboard_layout)),
            ("L10N_KB_MODEL".into(), get(&self.keyboard_model)),
            ("L10N_KB_VARIANT".into(), get(&self.keyboard_variant)),
            ("L10N_KB_OPTION".into(), get(&self.keyboard_option)),
        ]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfig {
    pub id: String,
    pub descr: String,
    #[serde(rename = "build-type")]
    pub build_type: BuildType,
    #[serde(rename = "repo-id")]
    pub repo_id: String,
    /// Where the produced live images land.
    #[serde(rename = "image-dir")]
    pub image_dir: String,
    pub version: String,
    #[serde(rename = "validity-months")]
    pub validity_months: u32,
    #[serde(rename = "privdata-pubkey-file")]
    pub privdata_pubkey_file: String,
    #[serde(rename = "privdata-privkey-file")]
    pub privdata_privkey_file: String,
    #[serde(rename = "signing-pubkey-file", default)]
    pub signing_pubkey_file: Option<String>,
    #[serde(rename = "signing-privkey-file", default)]
    pub signing_privkey_file: Option<String>,
    /// Ordered component name -> per-component parameters.
    pub components: BTreeMap<String, Value>,
    #[serde(default)]
    pub l10n: L10n,
    #[serde(skip)]
    pub config_file: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSection {
    #[serde(rename = "devicemeta-pubkey-file")]
    pub devicemeta_pubkey_file: String,
    #[serde(rename = "devicemeta-privkey-file")]
    pub devicemeta_privkey_file: String,
    #[serde(rename = "attestation-privkey-file", default)]
    pub attestation_privkey_file: Option<String>,
    #[serde(rename = "password-rescue", default)]
    pub password_rescue: Option<String>,
    /// Boot-loader assets specific to this install configuration.
    #[serde(rename = "grub-dir", default)]
    pub grub_dir: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallConfig {
    pub id: String,
    pub descr: String,
    #[serde(rename = "repo-id")]
    pub repo_id: String,
    #[serde(rename = "build-id")]
    pub build_id: String,
    pub parameters: BTreeMap<String, ParameterSpec>,
    #[serde(rename = "dev-format")]
    pub dev_format: Value,
    pub install: InstallSection,
    /// component -> parameter -> USERDATA repository id.
    #[serde(default)]
    pub userdata: BTreeMap<String, BTreeMap<String, String>>,
    #[serde(skip)]
    pub config_file: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormatConfig {
    pub id: String,
    pub descr: String,
    #[serde(rename = "repo-id", default)]
    pub repo_id: Option<String>,
    pub parameters: BTreeMap<String, ParameterSpec>,
    #[serde(rename = "dev-format")]
    pub dev_format: Value,
    #[serde(rename = "devicemeta-pubkey-file")]
    pub devicemeta_pubkey_file: String,
    #[serde(rename = "devicemeta-privkey-file")]
    pub devicemeta_privkey_file: String,
    #[serde(skip)]
    pub config_file: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainConfig {
    pub id: String,
    pub descr: String,
    #[serde(rename = "install-configs", default)]
    pub install_configs: Vec<String>,
    #[serde(rename = "format-configs", default)]
    pub format_configs: Vec<String>,
    #[serde(skip)]
    pub config_file: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoConfig {
    pub id: String,
    pub descr: String,
    pub subtype: RepoSubtype,
    pub password: String,
    #[serde(default)]
    pub compress: bool,
    /// Data directory; defaults to `<root>/repos/<id>`.
    #[serde(default)]
    pub path: Option<String>,
    #[serde(skip)]
    pub config_file: PathBuf,
}

impl RepoConfig {
    pub fn data_dir(&self, root: &Path) -> PathBuf {
        match &self.path {
            Some(p) if Path::new(p).is_absolute() => PathBuf::from(p),
            Some(p) => root.join(p),
            None => root.join(REPOS_DATA_DIR).join(&self.id),
        }
    }

    pub fn open(&self, root: &Path) -> Result<Repo> {
        Repo::at(&self.data_dir(root), &self.password)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncTarget {
    pub root: String,
    #[serde(rename = "conf-file", default)]
    pub conf_file: Option<String>,
}

impl SyncTarget {
    /// A target is either a local path or a URL understood by the external
    /// mirroring tool.
    pub fn is_local(&self) -> bool {
        Url::parse(&self.root).is_err()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GlobalSettings {
    #[serde(rename = "is-master", default)]
    pub is_master: bool,
    #[serde(rename = "sync-targets", default)]
    pub sync_targets: BTreeMap<String, SyncTarget>,
    #[serde(rename = "archives-cache-dir", default)]
    pub archives_cache_dir: Option<String>,
}

/// A reference to any configuration, for uniform traversal.
#[derive(Debug, Clone)]
pub enum AnyConfig {
    Build(BuildConfig),
    Install(InstallConfig),
    Format(FormatConfig),
    Domain(DomainConfig),
    Repo(RepoConfig),
}

impl AnyConfig {
    pub fn id(&self) -> &str {
        match self {
            AnyConfig::Build(c) => &c.id,
            AnyConfig::Install(c) => &c.id,
            AnyConfig::Format(c) => &c.id,
            AnyConfig::Domain(c) => &c.id,
            AnyConfig::Repo(c) => &c.id,
        }
    }

    pub fn descr(&self) -> &str {
        match self {
            AnyConfig::Build(c) => &c.descr,
            AnyConfig::Install(c) => &c.descr,
            AnyConfig::Format(c) => &c.descr,
            AnyConfig::Domain(c) => &c.descr,
            AnyConfig::Repo(c) => &c.descr,
        }
    }

    pub fn kind(&self) -> ConfigKind {
        match self {
            AnyConfig::Build(_) => ConfigKind::Build,
            AnyConfig::Install(_) => ConfigKind::Install,
            AnyConfig::Format(_) => ConfigKind::Format,
            AnyConfig::Domain(_) => ConfigKind::Domain,
            AnyConfig::Repo(_) => ConfigKind::Repo,
        }
    }

    pub fn config_file(&self) -> &Path {
        match self {
            AnyConfig::Build(c) => &c.config_file,
            AnyConfig::Install(c) => &c.config_file,
            AnyConfig::Format(c) => &c.config_file,
            AnyConfig::Domain(c) => &c.config_file,
            AnyConfig::Repo(c) => &c.config_file,
        }
    }

    /// Directory holding the configuration file; relative key-file paths
    /// resolve against it.
    pub fn config_dir(&self) -> &Path {
        self.config_file().parent().unwrap_or_else(|| Path::new("."))
    }

    /// Ids of configurations this one references.
    pub fn references(&self) -> Vec<String> {
        match self {
            AnyConfig::Build(c) => vec![c.repo_id.clone()],
            AnyConfig::Install(c) => {
                let mut refs = vec![c.repo_id.clone(), c.build_id.clone()];
                for params in c.userdata.values() {
                    refs.extend(params.values().cloned());
                }
                refs
            }
            AnyConfig::Format(c) => c.repo_id.clone().into_iter().collect(),
            AnyConfig::Domain(c) => {
                let mut refs = c.install_configs.clone();
                refs.extend(c.format_configs.clone());
                refs
            }
            AnyConfig::Repo(_) => Vec::new(),
        }
    }
}

/// The whole configuration root, loaded eagerly with bidirectional
/// references.
#[derive(Debug)]
pub struct ConfigRoot {
    path: PathBuf,
    pub settings: GlobalSettings,
    configs: BTreeMap<String, AnyConfig>,
    referenced_by: BTreeMap<String, BTreeSet<String>>,
}

fn load_json_file<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).map_err(|e| {
        anyhow!(HardkeyError::InvalidConfig).context(format!("parsing {}: {}", path.display(), e))
    })
}

fn save_json_file<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let data = serde_json::to_string_pretty(value).context("encoding configuration")?;
    std::fs::write(path, data).with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

impl ConfigRoot {
    /// Load the root.  Any identifier collision is fatal.
    pub fn load(path: &Path) -> Result<Self> {
        let settings: GlobalSettings = {
            let file = path.join(GLOBAL_SETTINGS_FILE);
            if file.exists() {
                load_json_file(&file)?
            } else {
                GlobalSettings::default()
            }
        };

        let mut root = ConfigRoot {
            path: path.to_path_buf(),
            settings,
            configs: BTreeMap::new(),
            referenced_by: BTreeMap::new(),
        };

        for dir_entry in sorted_subdirs(&path.join(BUILD_DIR))? {
            let file = dir_entry.join("build-configuration.json");
            let mut conf: BuildConfig = load_json_file(&file)?;
            conf.config_file = file;
            root.insert(AnyConfig::Build(conf))?;
        }
        for dir_entry in sorted_subdirs(&path.join(INSTALL_DIR))? {
            let file = dir_entry.join("install-configuration.json");
            let mut conf: InstallConfig = load_json_file(&file)?;
            conf.config_file = file;
            root.insert(AnyConfig::Install(conf))?;
        }
        for dir_entry in sorted_subdirs(&path.join(FORMAT_DIR))? {
            let file = dir_entry.join("format-configuration.json");
            let mut conf: FormatConfig = load_json_file(&file)?;
            conf.config_file = file;
            root.insert(AnyConfig::Format(conf))?;
        }
        for file in sorted_json_files(&path.join(DOMAIN_DIR))? {
            let mut conf: DomainConfig = load_json_file(&file)?;
            conf.config_file = file;
            root.insert(AnyConfig::Domain(conf))?;
        }
        for file in sorted_json_files_recursive(&path.join(REPO_DIR))? {
            let mut conf: RepoConfig = load_json_file(&file)?;
            conf.config_file = file;
            root.insert(AnyConfig::Repo(conf))?;
        }

        root.index_references();
        Ok(root)
    }

    fn insert(&mut self, conf: AnyConfig) -> Result<()> {
        let id = conf.id().to_string();
        if self.configs.contains_key(&id) {
            return Err(anyhow!(HardkeyError::DuplicateId)
                .context(format!("duplicate configuration id {:?}", id)));
        }
        self.configs.insert(id, conf);
        Ok(())
    }

    fn index_references(&mut self) {
        self.referenced_by.clear();
        for conf in self.configs.values() {
            for referenced in conf.references() {
                self.referenced_by
                    .entry(referenced)
                    .or_default()
                    .insert(conf.id().to_string());
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn ids(&self) -> Vec<&str> {
        self.configs.keys().map(String::as_str).collect()
    }

    pub fn get(&self, id: &str) -> Result<&AnyConfig> {
        self.configs.get(id).ok_or_else(|| {
            anyhow!(HardkeyError::MissingReference)
                .context(format!("no configuration with id {:?}", id))
        })
    }

    pub fn get_build(&self, id: &str) -> Result<&BuildConfig> {
        match self.get(id)? {
            AnyConfig::Build(c) => Ok(c),
            other => Err(anyhow!(HardkeyError::InvalidConfig).context(format!(
                "configuration {:?} is a {:?}, not a build configuration",
                id,
                other.kind()
            ))),
        }
    }

    pub fn get_install(&self, id: &str) -> Result<&InstallConfig> {
        match self.get(id)? {
            AnyConfig::Install(c) => Ok(c),
            other => Err(anyhow!(HardkeyError::InvalidConfig).context(format!(
                "configuration {:?} is a {:?}, not an install configuration",
                id,
                other.kind()
            ))),
        }
    }

    pub fn get_format(&self, id: &str) -> Result<&FormatConfig> {
        match self.get(id)? {
            AnyConfig::Format(c) => Ok(c),
            other => Err(anyhow!(HardkeyError::InvalidConfig).context(format!(
                "configuration {:?} is a {:?}, not a format configuration",
                id,
                other.kind()
            ))),
        }
    }

    pub fn get_domain(&self, id: &str) -> Result<&DomainConfig> {
        match self.get(id)? {
            AnyConfig::Domain(c) => Ok(c),
            other => Err(anyhow!(HardkeyError::InvalidConfig).context(format!(
                "configuration {:?} is a {:?}, not a domain configuration",
                id,
                other.kind()
            ))),
        }
    }

    pub fn get_repo(&self, id: &str) -> Result<&RepoConfig> {
        match self.get(id)? {
            AnyConfig::Repo(c) => Ok(c),
            other => Err(anyhow!(HardkeyError::InvalidConfig).context(format!(
                "configuration {:?} is a {:?}, not a repository configuration",
                id,
                other.kind()
            ))),
        }
    }

    pub fn configs_of_kind(&self, kind: ConfigKind) -> Vec<&AnyConfig> {
        self.configs
            .values()
            .filter(|c| c.kind() == kind)
            .collect()
    }

    pub fn referenced_by(&self, id: &str) -> Vec<&str> {
        self.referenced_by
            .get(id)
            .map(|set| set.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// Coherence analysis of one configuration: dangling references,
    /// repository subtype mismatches, install/build subtype rules.
    pub fn status(&self, id: &str) -> Result<ConfigStatus> {
        let conf = self.get(id)?;
        let mut errors = Vec::new();
        let warnings = Vec::new();

        for referenced in conf.references() {
            match self.configs.get(&referenced) {
                None => errors.push(format!("reference to unknown configuration {:?}", referenced)),
                Some(target) => {
                    // repository subtype must match the referencing kind
                    if let AnyConfig::Repo(repo) = target {
                        let expected = match conf.kind() {
                            ConfigKind::Build => Some(RepoSubtype::Build),
                            ConfigKind::Install => None, // checked below
                            ConfigKind::Format => Some(RepoSubtype::Format),
                            ConfigKind::Domain => Some(RepoSubtype::Domain),
                            ConfigKind::Repo => None,
                        };
                        if let Some(expected) = expected {
                            if repo.subtype != expected {
                                errors.push(format!(
                                    "repository {:?} has subtype {:?}, expected {:?}",
                                    referenced, repo.subtype, expected
                                ));
                            }
                        }
                    }
                }
            }
        }

        match conf {
            AnyConfig::Build(c) => {
                // exactly one component must provide the base OS and one
                // the component-init machinery
                for capability in ["base-os", "components-init"] {
                    let count = c
                        .components
                        .iter()
                        .filter(|(name, params)| {
                            params
                                .get("capability")
                                .and_then(Value::as_str)
                                .map(|cap| cap == capability)
                                .unwrap_or(name.as_str() == capability)
                        })
                        .count();
                    if count != 1 {
                        errors.push(format!(
                            "expected exactly one component with the {:?} capability, found {}",
                            capability, count
                        ));
                    }
                }
            }
            AnyConfig::Install(c) => {
                if let Ok(AnyConfig::Repo(repo)) = self.get(&c.repo_id) {
                    if repo.subtype != RepoSubtype::Install {
                        errors.push(format!(
                            "repository {:?} has subtype {:?}, expected Install",
                            c.repo_id, repo.subtype
                        ));
                    }
                }
                for params in c.userdata.values() {
                    for repo_id in params.values() {
                        if let Ok(AnyConfig::Repo(repo)) = self.get(repo_id) {
                            if repo.subtype != RepoSubtype::Userdata {
                                errors.push(format!(
                                    "repository {:?} has subtype {:?}, expected Userdata",
                                    repo_id, repo.subtype
                                ));
                            }
                        }
                    }
                }
                // the associated build must produce a bootable workstation
                // or server image
                if let Ok(build) = self.get_build(&c.build_id) {
                    if !matches!(build.build_type, BuildType::Workstation | BuildType::Server) {
                        errors.push(format!(
                            "build configuration {:?} has type {:?}; an install needs a \
                             workstation or server build",
                            c.build_id, build.build_type
                        ));
                    }
                }
            }
            AnyConfig::Format(_) | AnyConfig::Domain(_) | AnyConfig::Repo(_) => (),
        }

        Ok(if !errors.is_empty() {
            ConfigStatus::Errors(errors)
        } else if !warnings.is_empty() {
            ConfigStatus::Warnings(warnings)
        } else {
            ConfigStatus::Valid
        })
    }

    /// Clone a configuration (transitively through its references) into
    /// another root.  Every cloned configuration gets a fresh id; cloned
    /// repositories additionally get a fresh passphrase and identity.
    /// Returns the new id of the requested configuration.
    pub fn clone_into(
        &self,
        id: &str,
        target: &mut ConfigRoot,
        new_descr: &str,
    ) -> Result<String> {
        let mut remap: BTreeMap<String, String> = BTreeMap::new();
        self.clone_recursive(id, target, Some(new_descr), &mut remap)?;
        target.index_references();
        Ok(remap[id].clone())
    }

    fn clone_recursive(
        &self,
        id: &str,
        target: &mut ConfigRoot,
        new_descr: Option<&str>,
        remap: &mut BTreeMap<String, String>,
    ) -> Result<String> {
        if let Some(new_id) = remap.get(id) {
            return Ok(new_id.clone());
        }
        let conf = self.get(id)?;
        let new_id = Uuid::new_v4().to_string();
        remap.insert(id.to_string(), new_id.clone());

        // clone references first so ids can be rewritten below
        for referenced in conf.references() {
            self.clone_recursive(&referenced, target, None, remap)?;
        }

        let cloned = match conf {
            AnyConfig::Build(c) => {
                let mut c = c.clone();
                c.id = new_id.clone();
                if let Some(d) = new_descr {
                    c.descr = d.to_string();
                }
                c.repo_id = remap[&c.repo_id].clone();
                c.config_file = target
                    .path
                    .join(BUILD_DIR)
                    .join(&new_id)
                    .join("build-configuration.json");
                copy_config_dir(conf.config_dir(), c.config_file.parent().unwrap())?;
                save_json_file(&c.config_file, &c)?;
                AnyConfig::Build(c)
            }
            AnyConfig::Install(c) => {
                let mut c = c.clone();
                c.id = new_id.clone();
                if let Some(d) = new_descr {
                    c.descr = d.to_string();
                }
                c.repo_id = remap[&c.repo_id].clone();
                c.build_id = remap[&c.build_id].clone();
                for params in c.userdata.values_mut() {
                    for repo_id in params.values_mut() {
                        *repo_id = remap[repo_id.as_str()].clone();
                    }
                }
                c.config_file = target
                    .path
                    .join(INSTALL_DIR)
                    .join(&new_id)
                    .join("install-configuration.json");
                copy_config_dir(conf.config_dir(), c.config_file.parent().unwrap())?;
                save_json_file(&c.config_file, &c)?;
                AnyConfig::Install(c)
            }
            AnyConfig::Format(c) => {
                let mut c = c.clone();
                c.id = new_id.clone();
                if let Some(d) = new_descr {
                    c.descr = d.to_string();
                }
                if let Some(repo_id) = &c.repo_id {
                    c.repo_id = Some(remap[repo_id.as_str()].clone());
                }
                c.config_file = target
                    .path
                    .join(FORMAT_DIR)
                    .join(&new_id)
                    .join("format-configuration.json");
                copy_config_dir(conf.config_dir(), c.config_file.parent().unwrap())?;
                save_json_file(&c.config_file, &c)?;
                AnyConfig::Format(c)
            }
            AnyConfig::Domain(c) => {
                let mut c = c.clone();
                c.id = new_id.clone();
                if let Some(d) = new_descr {
                    c.descr = d.to_string();
                }
                for id in c.install_configs.iter_mut().chain(c.format_configs.iter_mut()) {
                    *id = remap[id.as_str()].clone();
                }
                c.config_file = target
                    .path
                    .join(DOMAIN_DIR)
                    .join(format!("{}.json", new_id));
                save_json_file(&c.config_file, &c)?;
                AnyConfig::Domain(c)
            }
            AnyConfig::Repo(c) => {
                let mut cloned = c.clone();
                cloned.id = new_id.clone();
                if let Some(d) = new_descr {
                    cloned.descr = d.to_string();
                }
                cloned.password = crypto::generate_password(25, None)?;
                cloned.path = None;
                cloned.config_file = target
                    .path
                    .join(REPO_DIR)
                    .join(format!("{}.json", new_id));

                // duplicate the repository data, then rotate its access
                let src_data = c.data_dir(&self.path);
                if src_data.exists() {
                    let dest_data = cloned.data_dir(&target.path);
                    copy_config_dir(&src_data, &dest_data)?;
                    let mut repo = Repo::at(&dest_data, &c.password)?;
                    repo.change_passphrase(&cloned.password)
                        .context("rotating cloned repository passphrase")?;
                    repo.rotate_id().context("rotating cloned repository id")?;
                }
                save_json_file(&cloned.config_file, &cloned)?;
                AnyConfig::Repo(cloned)
            }
        };
        target.insert(cloned)?;
        Ok(new_id)
    }

    /// Remove a configuration.  Refused while another configuration still
    /// references it, unless every such referrer is in `keep_set` (being
    /// removed alongside).
    pub fn remove(&mut self, id: &str, keep_set: &[&str]) -> Result<()> {
        let conf = self.get(id)?;
        let referrers: Vec<String> = self
            .referenced_by(id)
            .into_iter()
            .filter(|r| !keep_set.contains(r))
            .map(String::from)
            .collect();
        if !referrers.is_empty() {
            return Err(anyhow!(HardkeyError::InvalidConfig).context(format!(
                "configuration {:?} is still referenced by {:?}",
                id, referrers
            )));
        }

        let file = conf.config_file().to_path_buf();
        match conf.kind() {
            // per-directory kinds own their directory
            ConfigKind::Build | ConfigKind::Install | ConfigKind::Format => {
                if let Some(dir) = file.parent() {
                    std::fs::remove_dir_all(dir)
                        .with_context(|| format!("removing {}", dir.display()))?;
                }
            }
            ConfigKind::Domain => {
                std::fs::remove_file(&file)
                    .with_context(|| format!("removing {}", file.display()))?;
            }
            ConfigKind::Repo => {
                let data = match self.get(id)? {
                    AnyConfig::Repo(c) => c.data_dir(&self.path),
                    _ => unreachable!(),
                };
                if data.exists() {
                    std::fs::remove_dir_all(&data)
                        .with_context(|| format!("removing {}", data.display()))?;
                }
                std::fs::remove_file(&file)
                    .with_context(|| format!("removing {}", file.display()))?;
            }
        }
        self.configs.remove(id);
        self.index_references();
        Ok(())
    }

    /// Persist a new repository configuration and initialize its store.
    pub fn create_repo(&mut self, descr: &str, subtype: RepoSubtype, compress: bool) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let conf = RepoConfig {
            id: id.clone(),
            descr: descr.to_string(),
            subtype,
            password: crypto::generate_password(25, None)?,
            compress,
            path: None,
            config_file: self.path.join(REPO_DIR).join(format!("{}.json", id)),
        };
        save_json_file(&conf.config_file, &conf)?;
        conf.open(&self.path)?.init()?;
        self.insert(AnyConfig::Repo(conf))?;
        self.index_references();
        Ok(id)
    }
}

fn sorted_subdirs(path: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    if !path.exists() {
        return Ok(dirs);
    }
    for entry in
        std::fs::read_dir(path).with_context(|| format!("reading {}", path.display()))?
    {
        let entry = entry.with_context(|| format!("reading {} entry", path.display()))?;
        if entry.path().is_dir() {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    Ok(dirs)
}

fn sorted_json_files(path: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    if !path.exists() {
        return Ok(files);
    }
    for entry in
        std::fs::read_dir(path).with_context(|| format!("reading {}", path.display()))?
    {
        let entry = entry.with_context(|| format!("reading {} entry", path.display()))?;
        if entry.path().extension().map(|e| e == "json").unwrap_or(false) {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

/// Repository configurations may be organized in subdirectories.
fn sorted_json_files_recursive(path: &Path) -> Result<Vec<PathBuf>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let pattern = format!("{}/**/*.json", path.display());
    let mut files: Vec<PathBuf> = glob::glob(&pattern)
        .with_context(|| format!("globbing {}", pattern))?
        .collect::<std::result::Result<_, _>>()
        .with_context(|| format!("walking {}", path.display()))?;
    files.sort();
    Ok(files)
}

/// Copy a directory tree, preserving symlinks.
fn copy_config_dir(src: &Path, dest: &Path) -> Result<()> {
    for entry in WalkDir::new(src) {
        let entry = entry.with_context(|| format!("walking {}", src.display()))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .expect("walkdir stays under its root");
        let target = dest.join(rel);
        let ftype = entry.file_type();
        if ftype.is_dir() {
            std::fs::create_dir_all(&target)
                .with_context(|| format!("creating {}", target.display()))?;
        } else if ftype.is_symlink() {
            let link = std::fs::read_link(entry.path())
                .with_context(|| format!("reading link {}", entry.path().display()))?;
            std::os::unix::fs::symlink(link, &target)
                .with_context(|| format!("creating link {}", target.display()))?;
        } else {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
            std::fs::copy(entry.path(), &target)
                .with_context(|| format!("copying {}", entry.path().display()))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::kind_of;
    use tempfile::TempDir;

    fn write_repo_conf(root: &Path, id: &str, subtype: &str) {
        let dir = root.join(REPO_DIR);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join(format!("{}.json", id)),
            format!(
                r#"{{"id": "{}", "descr": "repo {}", "subtype": "{}",
                     "password": "repopassword1", "compress": false}}"#,
                id, id, subtype
            ),
        )
        .unwrap();
    }

    fn write_build_conf(root: &Path, id: &str, repo: &str, build_type: &str) {
        let dir = root.join(BUILD_DIR).join(id);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("build-configuration.json"),
            format!(
                r#"{{"id": "{}", "descr": "build", "build-type": "{}",
                     "repo-id": "{}", "image-dir": "/tmp/images",
                     "version": "2024.1", "validity-months": 12,
                     "privdata-pubkey-file": "privdata.pub",
                     "privdata-privkey-file": "privdata.priv",
                     "components": {{"base-os": {{}}, "components-init": {{}}}}}}"#,
                id, build_type, repo
            ),
        )
        .unwrap();
        std::fs::write(dir.join("privdata.pub"), "x").unwrap();
        std::fs::write(dir.join("privdata.priv"), "x").unwrap();
    }

    fn write_install_conf(root: &Path, id: &str, repo: &str, build: &str) {
        let dir = root.join(INSTALL_DIR).join(id);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("install-configuration.json"),
            format!(
                r#"{{"id": "{}", "descr": "install", "repo-id": "{}",
                     "build-id": "{}", "parameters": {{}},
                     "dev-format": {{}},
                     "install": {{
                        "devicemeta-pubkey-file": "meta.pub",
                        "devicemeta-privkey-file": "meta.priv"
                     }}}}"#,
                id, repo, build
            ),
        )
        .unwrap();
    }

    fn basic_root() -> (TempDir, PathBuf) {
        let dir = TempDir::new().unwrap();
        let root = dir.path().to_path_buf();
        write_repo_conf(&root, "repo-build", "build");
        write_repo_conf(&root, "repo-install", "install");
        write_build_conf(&root, "build-1", "repo-build", "wks");
        write_install_conf(&root, "install-1", "repo-install", "build-1");
        (dir, root)
    }

    #[test]
    fn load_and_cross_reference() {
        let (_dir, root) = basic_root();
        let model = ConfigRoot::load(&root).unwrap();
        assert_eq!(model.ids().len(), 4);

        let install = model.get_install("install-1").unwrap();
        assert_eq!(install.build_id, "build-1");
        assert_eq!(model.referenced_by("build-1"), vec!["install-1"]);
        assert_eq!(model.referenced_by("repo-build"), vec!["build-1"]);
        assert!(model.referenced_by("install-1").is_empty());

        assert_eq!(model.status("install-1").unwrap(), ConfigStatus::Valid);
        assert_eq!(model.status("build-1").unwrap(), ConfigStatus::Valid);
    }

    #[test]
    fn load_is_idempotent() {
        let (_dir, root) = basic_root();
        let a = ConfigRoot::load(&root).unwrap();
        let b = ConfigRoot::load(&root).unwrap();
        assert_eq!(a.ids(), b.ids());
        for id in a.ids() {
            assert_eq!(a.status(id).unwrap(), b.status(id).unwrap());
            assert_eq!(a.referenced_by(id), b.referenced_by(id));
        }
    }

    #[test]
    fn duplicate_id_is_fatal() {
        let (_dir, root) = basic_root();
        // a second configuration with an already-used id
        write_build_conf(&root, "other", "repo-build", "wks");
        let conf = root
            .join(BUILD_DIR)
            .join("other/build-configuration.json");
        let data = std::fs::read_to_string(&conf)
            .unwrap()
            .replace(r#""id": "other""#, r#""id": "build-1""#);
        std::fs::write(&conf, data).unwrap();

        let err = ConfigRoot::load(&root).unwrap_err();
        assert_eq!(kind_of(&err), Some(HardkeyError::DuplicateId));
    }

    #[test]
    fn dangling_reference_is_an_error_status() {
        let (_dir, root) = basic_root();
        write_install_conf(&root, "install-2", "repo-install", "no-such-build");
        let model = ConfigRoot::load(&root).unwrap();
        match model.status("install-2").unwrap() {
            ConfigStatus::Errors(errors) => {
                assert!(errors.iter().any(|e| e.contains("no-such-build")));
            }
            other => panic!("expected errors, got {:?}", other),
        }
    }

    #[test]
    fn repo_subtype_mismatch_is_an_error_status() {
        let (_dir, root) = basic_root();
        // point the build configuration at an install-subtype repository
        let conf = root
            .join(BUILD_DIR)
            .join("build-1/build-configuration.json");
        let data = std::fs::read_to_string(&conf)
            .unwrap()
            .replace("repo-build", "repo-install");
        std::fs::write(&conf, data).unwrap();

        let model = ConfigRoot::load(&root).unwrap();
        match model.status("build-1").unwrap() {
            ConfigStatus::Errors(errors) => {
                assert!(errors.iter().any(|e| e.contains("subtype")));
            }
            other => panic!("expected errors, got {:?}", other),
        }
    }

    #[test]
    fn install_requires_workstation_or_server_build() {
        let (_dir, root) = basic_root();
        let conf = root
            .join(BUILD_DIR)
            .join("build-1/build-configuration.json");
        let data = std::fs::read_to_string(&conf)
            .unwrap()
            .replace(r#""build-type": "wks""#, r#""build-type": "admin""#);
        std::fs::write(&conf, data).unwrap();

        let model = ConfigRoot::load(&root).unwrap();
        match model.status("install-1").unwrap() {
            ConfigStatus::Errors(errors) => {
                assert!(errors.iter().any(|e| e.contains("workstation or server")));
            }
            other => panic!("expected errors, got {:?}", other),
        }
    }

    #[test]
    fn build_component_capabilities() {
        let (_dir, root) = basic_root();
        let conf = root
            .join(BUILD_DIR)
            .join("build-1/build-configuration.json");
        // a capability declared on an arbitrarily named component counts
        let data = std::fs::read_to_string(&conf)
            .unwrap()
            .replace(
                r#""base-os": {}"#,
                r#""debian-13": {"capability": "base-os"}"#,
            );
        std::fs::write(&conf, &data).unwrap();
        let model = ConfigRoot::load(&root).unwrap();
        assert_eq!(model.status("build-1").unwrap(), ConfigStatus::Valid);

        // dropping the base OS component is an error
        let data = data.replace(r#""debian-13": {"capability": "base-os"}, "#, "");
        std::fs::write(&conf, data).unwrap();
        let model = ConfigRoot::load(&root).unwrap();
        match model.status("build-1").unwrap() {
            ConfigStatus::Errors(errors) => {
                assert!(errors.iter().any(|e| e.contains("base-os")));
            }
            other => panic!("expected errors, got {:?}", other),
        }
    }

    #[test]
    fn removal_respects_references() {
        let (_dir, root) = basic_root();
        let mut model = ConfigRoot::load(&root).unwrap();

        // build-1 is referenced by install-1
        let err = model.remove("build-1", &[]).unwrap_err();
        assert_eq!(kind_of(&err), Some(HardkeyError::InvalidConfig));

        // removing it together with its referrer is fine
        model.remove("install-1", &[]).unwrap();
        model.remove("build-1", &[]).unwrap();
        assert!(model.get("build-1").is_err());
        assert!(!root.join(BUILD_DIR).join("build-1").exists());

        // and the root reloads cleanly
        let reloaded = ConfigRoot::load(&root).unwrap();
        assert_eq!(reloaded.ids().len(), 2);
    }

    #[test]
    fn remove_with_keep_set() {
        let (_dir, root) = basic_root();
        let mut model = ConfigRoot::load(&root).unwrap();
        model.remove("build-1", &["install-1"]).unwrap();
        assert!(model.get("build-1").is_err());
    }

    #[test]
    fn cross_root_clone() {
        let (_dir_a, root_a) = basic_root();
        let dir_b = TempDir::new().unwrap();

        let model_a = ConfigRoot::load(&root_a).unwrap();
        let mut model_b = ConfigRoot::load(dir_b.path()).unwrap();

        let new_id = model_a
            .clone_into("install-1", &mut model_b, "cloned install")
            .unwrap();
        assert_ne!(new_id, "install-1");

        let cloned = model_b.get_install(&new_id).unwrap();
        assert_eq!(cloned.descr, "cloned install");
        // referenced configurations were cloned with fresh ids and
        // references rewritten
        assert_ne!(cloned.build_id, "build-1");
        assert_ne!(cloned.repo_id, "repo-install");
        let cloned_build = model_b.get_build(&cloned.build_id).unwrap();
        assert_ne!(cloned_build.repo_id, "repo-build");

        // the cloned repository got a fresh passphrase
        let old_repo = model_a.get_repo("repo-install").unwrap();
        let new_repo = model_b.get_repo(&cloned.repo_id).unwrap();
        assert_ne!(old_repo.password, new_repo.password);

        // no id collisions between the roots
        for id in model_b.ids() {
            assert!(model_a.get(id).is_err(), "id {} collides", id);
        }
        assert_eq!(model_b.status(&new_id).unwrap(), ConfigStatus::Valid);

        // the clone is on disk, not just in memory
        let reloaded = ConfigRoot::load(dir_b.path()).unwrap();
        assert!(reloaded.get(&new_id).is_ok());
    }

    #[test]
    fn sync_target_locality() {
        let local = SyncTarget {
            root: "/mnt/usb-mirror".into(),
            conf_file: None,
        };
        assert!(local.is_local());
        let remote = SyncTarget {
            root: "https://mirror.example.com/archives".into(),
            conf_file: Some("creds".into()),
        };
        assert!(!remote.is_local());
    }

    #[test]
    fn l10n_env_vars() {
        let l10n = L10n {
            timezone: Some("Europe/Paris".into()),
            locale: Some("fr_FR.UTF-8".into()),
            keyboard_layout: Some("fr".into()),
            ..Default::default()
        };
        let vars = l10n.env_vars();
        assert_eq!(vars.len(), 6);
        assert!(vars.contains(&("L10N_TIMEZONE".into(), "Europe/Paris".into())));
        assert!(vars.contains(&("L10N_KB_MODEL".into(), String::new())));
    }
}
