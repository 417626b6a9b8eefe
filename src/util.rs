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

use anyhow::{anyhow, bail, Context, Result};
use std::io::Write;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::sleep;
use std::time::Duration;

use crate::errors::HardkeyError;

/// Runs the provided command. The first macro argument is the executable, and following arguments
/// are passed to the command. Returns a Result<()> describing whether the command failed. Errors
/// are adequately prefixed with the full command.
#[macro_export]
macro_rules! runcmd {
    ($cmd:expr) => (runcmd!($cmd,));
    ($cmd:expr, $($args:expr),*) => {{
        let mut cmd = Command::new($cmd);
        $( cmd.arg($args); )*
        let status = cmd.status().with_context(|| format!("running {:#?}", cmd))?;
        if !status.success() {
            Result::Err(anyhow!("{:#?} failed with {}", cmd, status))
        } else {
            Result::Ok(())
        }
    }}
}

/// Runs the provided command, captures its stdout, and swallows its stderr except on failure.
/// The first macro argument is the executable, and following arguments are passed to the command.
/// Returns a Result<String> describing whether the command failed, and if not, its standard
/// output. Output is assumed to be UTF-8. Errors are adequately prefixed with the full command.
#[macro_export]
macro_rules! runcmd_output {
    ($cmd:expr) => (runcmd_output!($cmd,));
    ($cmd:expr, $($args:expr),*) => {{
        let mut cmd = Command::new($cmd);
        $( cmd.arg($args); )*
        // NB: cmd_output already prefixes with cmd in all error paths
        cmd_output(&mut cmd)
    }}
}

/// Runs the provided Command object, captures its stdout, and swallows its stderr except on
/// failure. Returns a Result<String> describing whether the command failed, and if not, its
/// standard output. Output is assumed to be UTF-8. Errors are adequately prefixed with the full
/// command.
pub fn cmd_output(cmd: &mut Command) -> Result<String> {
    let result = cmd
        .output()
        .with_context(|| format!("running {:#?}", cmd))?;
    if !result.status.success() {
        eprint!("{}", String::from_utf8_lossy(&result.stderr));
        bail!("{:#?} failed with {}", cmd, result.status);
    }
    String::from_utf8(result.stdout)
        .with_context(|| format!("decoding as UTF-8 output of `{:#?}`", cmd))
}

/// Output of a command that was fed data on stdin.  Unlike cmd_output, the
/// caller sees the exit code and stderr so it can map tool-specific codes
/// (cryptsetup, borg) to error kinds instead of a generic failure.
pub struct CmdResult {
    pub code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: String,
}

impl CmdResult {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn stdout_string(&self) -> Result<String> {
        String::from_utf8(self.stdout.clone()).context("decoding command output as UTF-8")
    }
}

/// Runs the provided Command object, writing `input` to its stdin, and captures stdout and
/// stderr.  A non-zero exit status is NOT an error here; the caller decides.
pub fn cmd_run_stdin(cmd: &mut Command, input: &[u8]) -> Result<CmdResult> {
    let mut child = cmd
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("running {:#?}", cmd))?;
    child
        .stdin
        .as_mut()
        .expect("stdin requested")
        .write_all(input)
        .with_context(|| format!("writing stdin of {:#?}", cmd))?;
    let out = child
        .wait_with_output()
        .with_context(|| format!("waiting for {:#?}", cmd))?;
    Ok(CmdResult {
        code: out.status.code(),
        stdout: out.stdout,
        stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
    })
}

/// Like cmd_run_stdin, but a non-zero exit status is an error carrying stderr.
pub fn cmd_output_stdin(cmd: &mut Command, input: &[u8]) -> Result<String> {
    let result = cmd_run_stdin(cmd, input)?;
    if !result.success() {
        eprint!("{}", result.stderr);
        bail!("{:#?} failed with code {:?}", cmd, result.code);
    }
    result.stdout_string()
}

/// Cooperative cancellation, threaded through long-running operations and
/// observed at their suspension points.  Cloned handles share one flag, so
/// a signal handler can cancel from another thread.
#[derive(Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Error out at a cooperative point if cancellation was requested.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(anyhow!(HardkeyError::Cancelled))
        } else {
            Ok(())
        }
    }
}

/// Stop an external tool: SIGTERM, a bounded grace window, then SIGKILL.
pub fn stop_child(child: &mut Child, grace: Duration) -> Result<()> {
    let pid = nix::unistd::Pid::from_raw(child.id() as i32);
    let _ = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGTERM);
    let deadline = std::time::Instant::now() + grace;
    while std::time::Instant::now() < deadline {
        if child.try_wait().context("waiting for child")?.is_some() {
            return Ok(());
        }
        sleep(Duration::from_millis(100));
    }
    child.kill().context("killing child")?;
    child.wait().context("reaping child")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_token() {
        let token = CancelToken::new();
        token.check().unwrap();
        let clone = token.clone();
        clone.cancel();
        let err = token.check().unwrap_err();
        assert_eq!(
            crate::errors::kind_of(&err),
            Some(HardkeyError::Cancelled)
        );
    }

    #[test]
    fn child_grace_window() {
        let mut child = Command::new("sleep").arg("60").spawn().unwrap();
        let start = std::time::Instant::now();
        stop_child(&mut child, Duration::from_secs(5)).unwrap();
        // sleep dies on SIGTERM, long before the grace window ends
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn stdin_roundtrip() {
        let out = cmd_output_stdin(&mut Command::new("cat"), b"secret\n").unwrap();
        assert_eq!(out, "secret\n");
    }

    #[test]
    fn nonzero_status_reported() {
        let result = cmd_run_stdin(&mut Command::new("false"), b"").unwrap();
        assert!(!result.success());
        assert_eq!(result.code, Some(1));
    }
}
