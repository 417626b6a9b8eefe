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

// library stub for the hardkey-installer and hkboot binaries

pub mod blockdev;
pub mod boot;
pub mod chunks;
pub mod cmdline;
pub mod config;
pub mod crypto;
pub mod encryption;
pub mod errors;
pub mod filesystem;
pub mod fingerprint;
pub mod install;
pub mod live;
pub mod metadata;
pub mod repo;
pub mod spec;
pub mod update;
pub mod util;
