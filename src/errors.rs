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

use thiserror::Error;

/// Typed failure kinds.  Most code propagates anyhow errors with context;
/// operations whose callers must branch on the outcome (wrong passphrase vs
/// busy device, integrity mismatch vs signature failure) attach one of these
/// to the chain so it can be recovered with `kind_of()`.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum HardkeyError {
    #[error("invalid configuration")]
    InvalidConfig,
    #[error("reference to an unknown configuration")]
    MissingReference,
    #[error("duplicate identifier")]
    DuplicateId,
    #[error("invalid parameter value")]
    InvalidParameter,
    #[error("wrong passphrase")]
    WrongPassphrase,
    #[error("device is busy")]
    DeviceBusy,
    #[error("unsupported device")]
    DeviceUnsupported,
    #[error("kernel did not pick up the new partition table")]
    KernelSyncFailed,
    #[error("filesystem operation failed")]
    FilesystemError,
    #[error("encryption operation failed")]
    EncryptionError,
    #[error("out of memory")]
    OutOfMemory,
    #[error("device metadata is corrupt")]
    MetadataCorrupt,
    #[error("signature verification failed")]
    SignatureInvalid,
    #[error("integrity fingerprint mismatch")]
    IntegrityMismatch,
    #[error("repository is locked")]
    RepositoryLocked,
    #[error("repository is corrupt")]
    RepositoryCorrupt,
    #[error("archive not found")]
    ArchiveMissing,
    #[error("network unreachable")]
    NetworkUnreachable,
    #[error("synchronization timed out")]
    SyncTimeout,
    #[error("operation cancelled")]
    Cancelled,
}

impl HardkeyError {
    /// Process exit code for the CLI surface.
    pub fn exit_code(&self) -> i32 {
        use HardkeyError::*;
        match self {
            InvalidConfig | MissingReference | DuplicateId | InvalidParameter => 1,
            DeviceBusy | DeviceUnsupported | KernelSyncFailed | FilesystemError
            | EncryptionError | OutOfMemory => 2,
            WrongPassphrase | MetadataCorrupt | SignatureInvalid | IntegrityMismatch => 3,
            RepositoryLocked | RepositoryCorrupt | ArchiveMissing => 2,
            NetworkUnreachable => 2,
            Cancelled => 126,
            SyncTimeout => 250,
        }
    }
}

/// Walk an anyhow chain and return the first typed kind, if any.
pub fn kind_of(err: &anyhow::Error) -> Option<HardkeyError> {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<HardkeyError>())
        .copied()
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{anyhow, Context};

    #[test]
    fn kind_survives_context() {
        let err = anyhow!(HardkeyError::WrongPassphrase)
            .context("opening volume /dev/sdb4")
            .context("unlocking key");
        assert_eq!(kind_of(&err), Some(HardkeyError::WrongPassphrase));
        assert_eq!(kind_of(&err).unwrap().exit_code(), 3);
    }

    #[test]
    fn untyped_chain_has_no_kind() {
        let err = anyhow!("plain failure").context("outer");
        assert_eq!(kind_of(&err), None);
    }

    #[test]
    fn exit_codes() {
        assert_eq!(HardkeyError::InvalidConfig.exit_code(), 1);
        assert_eq!(HardkeyError::DeviceBusy.exit_code(), 2);
        assert_eq!(HardkeyError::SignatureInvalid.exit_code(), 3);
        assert_eq!(HardkeyError::Cancelled.exit_code(), 126);
        assert_eq!(HardkeyError::SyncTimeout.exit_code(), 250);
    }
}
