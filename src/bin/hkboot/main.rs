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

mod cmdline;

use anyhow::{Context, Result};
use clap::Parser;
use std::io::{BufRead, Write};
use std::process::exit;

use libhardkey::boot::{BootProcess, BootSession};
use libhardkey::errors::kind_of;
use libhardkey::live;

use crate::cmdline::*;

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {:#}", e);
        exit(kind_of(&e).map(|k| k.exit_code()).unwrap_or(1));
    }
}

fn run() -> Result<()> {
    match Cmd::parse() {
        Cmd::Unlock(c) => unlock(c),
        Cmd::PostUnlock(c) => post_unlock(c),
        Cmd::Update(c) => update(c),
        Cmd::ChangePassword => change_password(),
        Cmd::SessionEnd(c) => session_end(c),
    }
}

/// Read one secret from stdin, trimming the trailing newline.  Secrets
/// never appear on the command line.
fn read_secret(prompt: &str) -> Result<String> {
    eprint!("{}: ", prompt);
    std::io::stderr().flush().ok();
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("reading secret from stdin")?;
    Ok(line.trim_end_matches('\n').to_string())
}

fn unlock(c: UnlockConfig) -> Result<()> {
    let secret = read_secret("User secret")?;
    let mut process = BootProcess::new(
        &c.device,
        &c.verify_key,
        &c.data_mount,
        c.data_mount_options.as_deref(),
    )?;
    let session = process.unlock(&secret)?;
    // the verification just passed covers the staged state, so this is the
    // moment to flip the slot pointer
    session.apply_staged_update()?;
    session.save()?;
    eprintln!("Key unlocked for {}", session.cn);
    Ok(())
}

fn post_unlock(c: PostUnlockConfig) -> Result<()> {
    let session = BootSession::load()?;
    session.post_unlock(&c.live_root)
}

fn update(c: UpdateConfig) -> Result<()> {
    let mut session = BootSession::load()?;
    session.update(&c.iso, c.signing_pubkey.as_deref())?;
    eprintln!("Update staged; it becomes active at the next boot");
    Ok(())
}

fn change_password() -> Result<()> {
    let session = BootSession::load()?;
    let current = read_secret("Current secret")?;
    let new = read_secret("New secret")?;
    libhardkey::crypto::validate_password(&new, libhardkey::install::MIN_PASSWORD_ENTROPY)?;
    live::change_user_password(&session.dummy_mountpoint, &current, &new)?;
    eprintln!("Secret changed");
    Ok(())
}

fn session_end(c: SessionEndConfig) -> Result<()> {
    let session = BootSession::load()?;
    session.session_end(&c.live_root);
    Ok(())
}
