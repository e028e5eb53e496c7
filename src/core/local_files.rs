use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::error::Result;
use crate::utils::io;

pub const MASTER_KEY_FILE: &str = "config/master.key";
pub const CREDENTIALS_FILE: &str = "config/credentials.yml.enc";

/// Local application root holding the secrets that get shipped to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppDir {
    root: PathBuf,
}

impl AppDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn master_key_path(&self) -> PathBuf {
        self.root.join(MASTER_KEY_FILE)
    }

    pub fn credentials_path(&self) -> PathBuf {
        self.root.join(CREDENTIALS_FILE)
    }

    /// The encrypted-secrets artifact uploaded to the host, when present locally.
    pub fn secrets_artifact(&self) -> Option<PathBuf> {
        let path = self.master_key_path();
        path.is_file().then_some(path)
    }
}

/// Lowercase hex SHA-256, the format `sha256sum` prints.
pub fn sha256_hex(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}

pub fn file_digest(path: &Path) -> Result<String> {
    let content = io::read_bytes(path, &format!("read {}", path.display()))?;
    Ok(sha256_hex(&content))
}
