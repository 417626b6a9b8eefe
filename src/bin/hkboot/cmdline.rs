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

use clap::{AppSettings, Parser};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[clap(version)]
#[clap(global_setting(AppSettings::DeriveDisplayOrder))]
#[clap(disable_help_subcommand = true)]
#[clap(help_expected = true)]
pub enum Cmd {
    /// Verify the key and unlock its operational partitions
    Unlock(UnlockConfig),
    /// Run the per-component setup after a successful unlock
    PostUnlock(PostUnlockConfig),
    /// Stage a new live image onto the inactive slot
    Update(UpdateConfig),
    /// Change the current user's secret
    ChangePassword,
    /// Run the component shutdown hooks and record the session end
    SessionEnd(SessionEndConfig),
}

#[derive(Debug, Parser)]
pub struct UnlockConfig {
    /// Key block device
    #[clap(long, value_name = "device")]
    pub device: PathBuf,
    /// Preloaded administrator public key (part of the live image, never
    /// read from the key device)
    #[clap(long, value_name = "path", default_value = "/etc/hardkey/meta-sign.pub")]
    pub verify_key: PathBuf,
    /// Where to mount the user data partition
    #[clap(long, value_name = "dir", default_value = "/home/user/Documents")]
    pub data_mount: PathBuf,
    /// Mount options for the data partition
    #[clap(long, value_name = "options")]
    pub data_mount_options: Option<String>,
}

#[derive(Debug, Parser)]
pub struct PostUnlockConfig {
    /// Root of the running live system
    #[clap(long, value_name = "dir", default_value = "/")]
    pub live_root: PathBuf,
}

#[derive(Debug, Parser)]
pub struct UpdateConfig {
    /// Replacement live image
    #[clap(long, value_name = "path")]
    pub iso: PathBuf,
    /// Public key the image must be signed with
    #[clap(long, value_name = "path")]
    pub signing_pubkey: Option<PathBuf>,
}

#[derive(Debug, Parser)]
pub struct SessionEndConfig {
    /// Root of the running live system
    #[clap(long, value_name = "dir", default_value = "/")]
    pub live_root: PathBuf,
}
