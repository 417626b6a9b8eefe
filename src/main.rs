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

use anyhow::Result;
use clap::Parser;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::process::exit;

use libhardkey::cmdline::*;
use libhardkey::config::{ConfigRoot, RepoSubtype};
use libhardkey::errors::kind_of;
use libhardkey::install::{self, Installer, ParamsSet};
use libhardkey::metadata;
use libhardkey::spec::{CryptoSpec, CryptoSpecKind};
use libhardkey::{crypto, repo};

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {:#}", e);
        exit(kind_of(&e).map(|k| k.exit_code()).unwrap_or(1));
    }
}

fn run() -> Result<()> {
    match Cmd::parse() {
        Cmd::Install(c) => cmd_install(c),
        Cmd::Format(c) => cmd_format(c),
        Cmd::Wipe(c) => install::wipe(&c.device),
        Cmd::Inspect(c) => cmd_inspect(c),
        Cmd::Repo(c) => cmd_repo(c),
        Cmd::Config(c) => cmd_config(c),
    }
}

fn collect_params(args: &[String]) -> Result<BTreeMap<String, Value>> {
    let mut values = BTreeMap::new();
    for arg in args {
        let (name, value) = parse_assignment(arg)?;
        // integers stay integers so size parameters validate
        let value = match value.parse::<i64>() {
            Ok(n) => Value::Number(n.into()),
            Err(_) => Value::String(value.to_string()),
        };
        values.insert(name.to_string(), value);
    }
    Ok(values)
}

fn collect_userdata(args: &[String]) -> Result<BTreeMap<String, BTreeMap<String, Value>>> {
    let mut components: BTreeMap<String, BTreeMap<String, Value>> = BTreeMap::new();
    for arg in args {
        let (component, name, value) = parse_userdata_assignment(arg)?;
        components
            .entry(component.to_string())
            .or_default()
            .insert(name.to_string(), Value::String(value.to_string()));
    }
    Ok(components)
}

fn cmd_install(c: InstallCmdConfig) -> Result<()> {
    let root = ConfigRoot::load(&c.config_root)?;
    let params = ParamsSet {
        values: collect_params(&c.params)?,
        components: collect_userdata(&c.userdata)?,
    };
    let installer = Installer::new(&root, &c.config, &c.iso, params)?;
    installer.install(&c.dest_device, &libhardkey::util::CancelToken::new())?;
    println!("Provisioned {}", c.dest_device.display());
    Ok(())
}

fn cmd_format(c: FormatCmdConfig) -> Result<()> {
    let root = ConfigRoot::load(&c.config_root)?;
    let params = ParamsSet {
        values: collect_params(&c.params)?,
        components: BTreeMap::new(),
    };
    install::format_only(&root, &c.config, &c.dest_device, params)?;
    println!("Formatted {}", c.dest_device.display());
    Ok(())
}

fn cmd_inspect(c: InspectCmdConfig) -> Result<()> {
    let mut meta = metadata::read_records(&c.device)?;
    println!("signers:    {:?}", meta.signer_ids());
    println!("decryptors: {:?}", meta.decryptor_ids());

    if let Some(key) = &c.verify_key {
        let mut verifiers = BTreeMap::new();
        for id in meta.signer_ids() {
            verifiers.insert(
                id,
                CryptoSpec {
                    kind: CryptoSpecKind::Key,
                    password: None,
                    public_key_file: Some(key.to_string_lossy().into_owned()),
                    private_key_file: None,
                    cert_file: None,
                },
            );
        }
        meta.verify(&verifiers, None)?;
        println!("signature:  OK");
        println!("hardware:   {:?}", meta.hardware_id()?);
        for (name, value) in meta.unprotected_fields()? {
            println!("unprotected {}: {}", name, value);
        }

        if let Some(secret) = &c.decryptor {
            // a path means a private key, anything else a password
            let spec = if Path::new(secret).exists() {
                CryptoSpec {
                    kind: CryptoSpecKind::Key,
                    password: None,
                    public_key_file: None,
                    private_key_file: Some(secret.clone()),
                    cert_file: None,
                }
            } else {
                CryptoSpec {
                    kind: CryptoSpecKind::Password,
                    password: Some(secret.clone()),
                    public_key_file: None,
                    private_key_file: None,
                    cert_file: None,
                }
            };
            let mut decryptors = BTreeMap::new();
            for id in meta.decryptor_ids() {
                decryptors.insert(id, spec.clone());
            }
            // try each declared decryptor with the one provided secret
            let mut matched = false;
            for (id, one) in &decryptors {
                let mut single = BTreeMap::new();
                single.insert(id.clone(), one.clone());
                if let Ok(fields) = meta.protected_fields(&single, None) {
                    matched = true;
                    for (name, value) in fields {
                        println!("protected [{}] {}: {}", id, name, value);
                    }
                }
            }
            if !matched {
                anyhow::bail!("provided secret matches no decryptor");
            }
        }
    } else {
        for (name, value) in meta.unverified_unprotected_fields() {
            println!("unprotected (UNVERIFIED) {}: {}", name, value);
        }
    }
    Ok(())
}

fn cmd_repo(c: RepoCmd) -> Result<()> {
    let open = |target: &RepoTargetConfig| -> Result<(ConfigRoot, repo::Repo)> {
        let root = ConfigRoot::load(&target.config_root)?;
        let conf = root.get_repo(&target.repo)?;
        let repo = conf.open(root.path())?;
        Ok((root, repo))
    };

    match c {
        RepoCmd::Create(c) => {
            let subtype: RepoSubtype =
                serde_json::from_value(Value::String(c.subtype.clone()))
                    .map_err(|_| anyhow::anyhow!("invalid repository subtype {:?}", c.subtype))?;
            let mut root = ConfigRoot::load(&c.config_root)?;
            let id = root.create_repo(&c.descr, subtype, c.compress)?;
            println!("{}", id);
        }
        RepoCmd::List(c) => {
            let (_root, repo) = open(&c)?;
            for (ts, name) in repo.list_archives()? {
                println!("{}  {}", ts, name);
            }
        }
        RepoCmd::Archive(c) => {
            let (root, repo) = open(&c.target)?;
            let compress = root.get_repo(&c.target.repo)?.compress;
            let name = repo.create_archive(&c.source_dir, compress)?;
            println!("{}", name);
        }
        RepoCmd::Extract(c) => {
            let (_root, repo) = open(&c.target)?;
            let name = match c.archive {
                Some(name) => name,
                None => {
                    repo.latest_archive()?
                        .ok_or_else(|| anyhow::anyhow!("repository has no archive"))?
                        .1
                }
            };
            std::fs::create_dir_all(&c.dest_dir)?;
            repo.extract(&name, &c.dest_dir, None)?;
        }
        RepoCmd::Check(c) => {
            let (_root, repo) = open(&c)?;
            match repo.check()? {
                None => println!("OK"),
                Some(broken) => {
                    for path in broken {
                        println!("{}", path.display());
                    }
                }
            }
        }
        RepoCmd::ChangePassword(c) => {
            let (_root, mut repo) = open(&c.target)?;
            let new = match c.new_password {
                Some(p) => p,
                None => crypto::generate_password(25, None)?,
            };
            repo.change_passphrase(&new)?;
            println!("{}", new);
        }
        RepoCmd::RotateId(c) => {
            let (_root, repo) = open(&c)?;
            repo.rotate_id()?;
        }
        RepoCmd::Vacuum(c) => {
            let (_root, repo) = open(&c)?;
            repo.vacuum()?;
        }
    }
    Ok(())
}

fn cmd_config(c: ConfigCmd) -> Result<()> {
    match c {
        ConfigCmd::List(c) => {
            let root = ConfigRoot::load(&c.config_root)?;
            for id in root.ids() {
                let conf = root.get(id)?;
                println!(
                    "{:?} {}  {}  [{:?}]",
                    conf.kind(),
                    id,
                    conf.descr(),
                    root.status(id)?
                );
            }
        }
        ConfigCmd::Clone(c) => {
            let source = ConfigRoot::load(&c.config_root)?;
            let mut target = ConfigRoot::load(&c.target_root)?;
            let new_id = source.clone_into(&c.id, &mut target, &c.descr)?;
            println!("{}", new_id);
        }
        ConfigCmd::Remove(c) => {
            let mut root = ConfigRoot::load(&c.config_root)?;
            let keep: Vec<&str> = c.keep.iter().map(String::as_str).collect();
            root.remove(&c.id, &keep)?;
        }
    }
    Ok(())
}
