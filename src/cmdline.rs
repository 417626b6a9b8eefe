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

// We don't care about the size of enum variants and don't want to box them
#![allow(clippy::large_enum_variant)]

use anyhow::{bail, Result};
use clap::{AppSettings, Parser};
use std::path::PathBuf;

// Args are listed in --help in the order declared in these structs/enums.
// Please keep the entire help text to 80 columns.

#[derive(Debug, Parser)]
#[clap(version)]
#[clap(global_setting(AppSettings::DeriveDisplayOrder))]
#[clap(args_conflicts_with_subcommands = true)]
#[clap(disable_help_subcommand = true)]
#[clap(help_expected = true)]
pub enum Cmd {
    /// Provision a bootable key from an install configuration
    Install(InstallCmdConfig),
    /// Provision a data-only key from a format configuration
    Format(FormatCmdConfig),
    /// Erase a key, including its appended metadata
    Wipe(WipeCmdConfig),
    /// Inspect the sealed metadata of a key
    Inspect(InspectCmdConfig),
    /// Commands to manage archive repositories
    #[clap(subcommand)]
    Repo(RepoCmd),
    /// Commands to manage the configuration root
    #[clap(subcommand)]
    Config(ConfigCmd),
}

#[derive(Debug, Parser)]
pub struct InstallCmdConfig {
    /// Configuration root directory
    #[clap(long, value_name = "dir")]
    pub config_root: PathBuf,
    /// Install configuration id
    #[clap(long, value_name = "id")]
    pub config: String,
    /// Live image to install
    #[clap(long, value_name = "path")]
    pub iso: PathBuf,
    /// Parameter value, as name=value (repeatable)
    #[clap(long = "param", value_name = "name=value")]
    pub params: Vec<String>,
    /// Component user-data value, as component/name=value (repeatable)
    #[clap(long = "userdata", value_name = "component/name=value")]
    pub userdata: Vec<String>,
    /// Destination device or image file
    #[clap(value_name = "dest-device")]
    pub dest_device: PathBuf,
}

#[derive(Debug, Parser)]
pub struct FormatCmdConfig {
    /// Configuration root directory
    #[clap(long, value_name = "dir")]
    pub config_root: PathBuf,
    /// Format configuration id
    #[clap(long, value_name = "id")]
    pub config: String,
    /// Parameter value, as name=value (repeatable)
    #[clap(long = "param", value_name = "name=value")]
    pub params: Vec<String>,
    /// Destination device or image file
    #[clap(value_name = "dest-device")]
    pub dest_device: PathBuf,
}

#[derive(Debug, Parser)]
pub struct WipeCmdConfig {
    /// Device or image file to erase
    #[clap(value_name = "device")]
    pub device: PathBuf,
}

#[derive(Debug, Parser)]
pub struct InspectCmdConfig {
    /// Public key file to verify the metadata signature with
    #[clap(long, value_name = "path")]
    pub verify_key: Option<PathBuf>,
    /// Decryptor password or private key file for protected fields
    #[clap(long, value_name = "secret")]
    pub decryptor: Option<String>,
    /// Device or image file to inspect
    #[clap(value_name = "device")]
    pub device: PathBuf,
}

#[derive(Debug, Parser)]
pub enum RepoCmd {
    /// Create a new repository
    Create(RepoCreateConfig),
    /// List the archives of a repository
    List(RepoTargetConfig),
    /// Snapshot a directory into a new archive
    Archive(RepoArchiveConfig),
    /// Extract an archive
    Extract(RepoExtractConfig),
    /// Verify the repository and list broken segment files
    Check(RepoTargetConfig),
    /// Change the repository passphrase
    ChangePassword(RepoChangePasswordConfig),
    /// Give the repository a fresh identity
    RotateId(RepoTargetConfig),
    /// Compact orphaned segments
    Vacuum(RepoTargetConfig),
}

#[derive(Debug, Parser)]
pub struct RepoCreateConfig {
    /// Configuration root directory
    #[clap(long, value_name = "dir")]
    pub config_root: PathBuf,
    /// Repository payload kind
    #[clap(long, value_name = "build|install|format|domain|userdata")]
    pub subtype: String,
    /// Compress archive contents
    #[clap(long)]
    pub compress: bool,
    /// Human description
    #[clap(value_name = "description")]
    pub descr: String,
}

#[derive(Debug, Parser)]
pub struct RepoTargetConfig {
    /// Configuration root directory
    #[clap(long, value_name = "dir")]
    pub config_root: PathBuf,
    /// Repository configuration id
    #[clap(value_name = "repo-id")]
    pub repo: String,
}

#[derive(Debug, Parser)]
pub struct RepoArchiveConfig {
    #[clap(flatten)]
    pub target: RepoTargetConfig,
    /// Directory tree to snapshot
    #[clap(value_name = "source-dir")]
    pub source_dir: PathBuf,
}

#[derive(Debug, Parser)]
pub struct RepoExtractConfig {
    #[clap(flatten)]
    pub target: RepoTargetConfig,
    /// Archive name; defaults to the most recent one
    #[clap(long, value_name = "name")]
    pub archive: Option<String>,
    /// Destination directory
    #[clap(value_name = "dest-dir")]
    pub dest_dir: PathBuf,
}

#[derive(Debug, Parser)]
pub struct RepoChangePasswordConfig {
    #[clap(flatten)]
    pub target: RepoTargetConfig,
    /// New passphrase; generated when absent
    #[clap(long, value_name = "passphrase")]
    pub new_password: Option<String>,
}

#[derive(Debug, Parser)]
pub enum ConfigCmd {
    /// List every configuration with its status
    List(ConfigListConfig),
    /// Clone a configuration (and its references) into another root
    Clone(ConfigCloneConfig),
    /// Remove a configuration
    Remove(ConfigRemoveConfig),
}

#[derive(Debug, Parser)]
pub struct ConfigListConfig {
    /// Configuration root directory
    #[clap(long, value_name = "dir")]
    pub config_root: PathBuf,
}

#[derive(Debug, Parser)]
pub struct ConfigCloneConfig {
    /// Source configuration root
    #[clap(long, value_name = "dir")]
    pub config_root: PathBuf,
    /// Destination configuration root
    #[clap(long, value_name = "dir")]
    pub target_root: PathBuf,
    /// Description of the clone
    #[clap(long, value_name = "text")]
    pub descr: String,
    /// Configuration id to clone
    #[clap(value_name = "id")]
    pub id: String,
}

#[derive(Debug, Parser)]
pub struct ConfigRemoveConfig {
    /// Configuration root directory
    #[clap(long, value_name = "dir")]
    pub config_root: PathBuf,
    /// Also-removed ids whose references must not block removal
    #[clap(long = "keep", value_name = "id")]
    pub keep: Vec<String>,
    /// Configuration id to remove
    #[clap(value_name = "id")]
    pub id: String,
}

/// Split a `name=value` argument.
pub fn parse_assignment(arg: &str) -> Result<(&str, &str)> {
    match arg.split_once('=') {
        Some((name, value)) if !name.is_empty() => Ok((name, value)),
        _ => bail!("expected name=value, got {:?}", arg),
    }
}

/// Split a `component/name=value` argument.
pub fn parse_userdata_assignment(arg: &str) -> Result<(&str, &str, &str)> {
    let (path, value) = parse_assignment(arg)?;
    match path.split_once('/') {
        Some((component, name)) if !component.is_empty() && !name.is_empty() => {
            Ok((component, name, value))
        }
        _ => bail!("expected component/name=value, got {:?}", arg),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::IntoApp;

    #[test]
    fn clap_app() {
        Cmd::into_app().debug_assert()
    }

    #[test]
    fn assignments() {
        assert_eq!(parse_assignment("a=b").unwrap(), ("a", "b"));
        assert_eq!(parse_assignment("size=4=096").unwrap(), ("size", "4=096"));
        assert!(parse_assignment("novalue").is_err());
        assert!(parse_assignment("=x").is_err());

        assert_eq!(
            parse_userdata_assignment("vpn/config-file=client.ovpn").unwrap(),
            ("vpn", "config-file", "client.ovpn")
        );
        assert!(parse_userdata_assignment("vpn=x").is_err());
        assert!(parse_userdata_assignment("/x=y").is_err());
    }

    #[test]
    fn install_parsing() {
        let cmd = Cmd::parse_from([
            "hardkey-installer",
            "install",
            "--config-root",
            "/srv/hardkey",
            "--config",
            "wks-install",
            "--iso",
            "/tmp/live.iso",
            "--param",
            "password-user=Correct-horse-42",
            "--param",
            "owner=alice",
            "--userdata",
            "vpn/config-file=client.ovpn",
            "/dev/sdb",
        ]);
        match cmd {
            Cmd::Install(c) => {
                assert_eq!(c.config, "wks-install");
                assert_eq!(c.params.len(), 2);
                assert_eq!(c.userdata.len(), 1);
                assert_eq!(c.dest_device, PathBuf::from("/dev/sdb"));
            }
            other => panic!("parsed {:?}", other),
        }
    }
}
