//! Uploads: copy bytes to the remote host, then apply the mode with a remote `chmod`.
//!
//! The copy primitive is not trusted to carry permissions, so the mode is
//! always set by a separate command after the transfer completes.

use std::io::Write;
use std::path::Path;

use tempfile::NamedTempFile;

use crate::error::{Error, Result, TransferFailedDetails};
use crate::executor::RemoteExecutor;
use crate::ssh::{RemoteTarget, Transport};
use crate::utils::shell;

/// Remote command that applies `mode` (unix permission bits) to `path`.
pub fn chmod_command(mode: u32, path: &str) -> String {
    format!("chmod {:o} {}", mode, shell::quote_path(path))
}

pub struct ContentTransfer<'a, T> {
    executor: &'a RemoteExecutor<T>,
}

impl<'a, T: Transport> ContentTransfer<'a, T> {
    pub fn new(executor: &'a RemoteExecutor<T>) -> Self {
        Self { executor }
    }

    /// Upload in-memory content through a scoped local temp file.
    pub fn upload_content(
        &self,
        target: &RemoteTarget,
        content: &[u8],
        remote_path: &str,
        mode: u32,
    ) -> Result<()> {
        let failed = |local: &str, error: std::io::Error| {
            Error::transfer_failed(TransferFailedDetails {
                local_path: local.to_string(),
                remote_path: remote_path.to_string(),
                error: error.to_string(),
                target: target.details(),
            })
        };

        // Removed when `staged` drops, including on every error path below.
        let mut staged = NamedTempFile::new().map_err(|e| failed("<temp file>", e))?;
        let staged_path = staged.path().display().to_string();
        staged
            .write_all(content)
            .and_then(|_| staged.flush())
            .map_err(|e| failed(&staged_path, e))?;

        self.upload_file(target, staged.path(), remote_path, mode)
    }

    /// Copy a local file to `remote_path`, then `chmod` it to `mode`.
    pub fn upload_file(
        &self,
        target: &RemoteTarget,
        local_path: &Path,
        remote_path: &str,
        mode: u32,
    ) -> Result<()> {
        let readable = std::fs::metadata(local_path)
            .map_err(|e| e.to_string())
            .and_then(|meta| {
                if meta.is_file() {
                    Ok(())
                } else {
                    Err("not a regular file".to_string())
                }
            });
        if let Err(error) = readable {
            return Err(Error::transfer_failed(TransferFailedDetails {
                local_path: local_path.display().to_string(),
                remote_path: remote_path.to_string(),
                error,
                target: target.details(),
            }));
        }

        self.executor
            .transport()
            .copy(target, local_path, remote_path)?;
        self.executor
            .execute(target, &chmod_command(mode, remote_path))?;
        Ok(())
    }
}
