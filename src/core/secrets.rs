//! Local encrypted credentials: recovers the database triple used by the bootstrap step.
//!
//! The store is a Rails `credentials.yml.enc` file:
//! `base64(ciphertext)--base64(iv)--base64(auth_tag)`, AES-128-GCM under the
//! hex-encoded master key. The plaintext is a Marshal-dumped YAML string.

use std::fmt;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes128Gcm, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::{Error, Result};
use crate::local_files::AppDir;
use crate::utils::io;

pub const MASTER_KEY_ENV: &str = "RAILS_MASTER_KEY";

const KEY_LEN: usize = 16;
const IV_LEN: usize = 12;
const TAG_LEN: usize = 16;
const MARSHAL_VERSION: [u8; 2] = [0x04, 0x08];

/// Database name, user and password recovered from the local store.
#[derive(Clone, PartialEq, Eq)]
pub struct DatabaseCredentials {
    pub database: String,
    pub username: String,
    pub password: String,
}

impl fmt::Debug for DatabaseCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseCredentials")
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

impl Drop for DatabaseCredentials {
    fn drop(&mut self) {
        self.password.zeroize();
    }
}

/// Where the database bootstrap step gets its credentials from.
pub trait SecretsSource {
    fn database_credentials(&self) -> Result<DatabaseCredentials>;
}

/// Symmetric key for the credentials store, wiped on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MasterKey {
    bytes: Vec<u8>,
}

impl MasterKey {
    pub fn from_hex(encoded: &str) -> Result<Self> {
        let bytes = hex::decode(encoded.trim())
            .map_err(|e| Error::secrets_undecryptable(format!("Master key is not valid hex: {}", e)))?;
        if bytes.len() != KEY_LEN {
            return Err(Error::secrets_undecryptable(format!(
                "Master key must be {} bytes, got {}",
                KEY_LEN,
                bytes.len()
            )));
        }
        Ok(Self { bytes })
    }

    fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterKey([REDACTED])")
    }
}

/// Decrypt a `data--iv--tag` message into its raw plaintext.
pub fn decrypt(message: &str, key: &MasterKey) -> Result<Zeroizing<Vec<u8>>> {
    let mut parts = message.trim().split("--");
    let (Some(data), Some(iv), Some(tag), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(Error::secrets_undecryptable(
            "Encrypted credentials are not in data--iv--tag form",
        ));
    };

    let decode = |part: &str, what: &str| {
        STANDARD.decode(part).map_err(|e| {
            Error::secrets_undecryptable(format!("Invalid {} in encrypted credentials: {}", what, e))
        })
    };
    let mut sealed = decode(data, "ciphertext")?;
    let iv = decode(iv, "iv")?;
    let tag = decode(tag, "auth tag")?;
    if iv.len() != IV_LEN || tag.len() != TAG_LEN {
        return Err(Error::secrets_undecryptable(format!(
            "Expected a {}-byte iv and {}-byte auth tag, got {} and {}",
            IV_LEN,
            TAG_LEN,
            iv.len(),
            tag.len()
        )));
    }
    sealed.extend_from_slice(&tag);

    let cipher = Aes128Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| Error::secrets_undecryptable(format!("Invalid master key: {}", e)))?;
    cipher
        .decrypt(Nonce::from_slice(&iv), sealed.as_slice())
        .map(Zeroizing::new)
        .map_err(|_| {
            Error::secrets_undecryptable(
                "Could not decrypt credentials: wrong master key or corrupted file",
            )
        })
}

/// Text of a Marshal-dumped string; plaintext that is not a Marshal
/// stream is taken as a JSON string or as raw UTF-8.
pub fn unmarshal_string(payload: &[u8]) -> Result<String> {
    let Some(stream) = payload.strip_prefix(&MARSHAL_VERSION[..]) else {
        if payload.first() == Some(&b'"') {
            if let Ok(text) = serde_json::from_slice::<String>(payload) {
                return Ok(text);
            }
        }
        return utf8(payload.to_vec());
    };

    let mut reader = MarshalReader { bytes: stream };
    let mut tag = reader.byte()?;
    // 'I' wraps an object carrying instance variables (the string encoding).
    if tag == b'I' {
        tag = reader.byte()?;
    }
    if tag != b'"' {
        return Err(Error::secrets_undecryptable(
            "Decrypted credentials are not a marshalled string",
        ));
    }

    let len = usize::try_from(reader.long()?)
        .map_err(|_| Error::secrets_undecryptable("Negative string length in credentials"))?;
    utf8(reader.take(len)?.to_vec())
}

fn utf8(bytes: Vec<u8>) -> Result<String> {
    String::from_utf8(bytes)
        .map_err(|_| Error::secrets_undecryptable("Decrypted credentials are not UTF-8"))
}

struct MarshalReader<'a> {
    bytes: &'a [u8],
}

impl<'a> MarshalReader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.bytes.len() < n {
            return Err(Error::secrets_undecryptable(
                "Truncated marshal data in credentials",
            ));
        }
        let (head, rest) = self.bytes.split_at(n);
        self.bytes = rest;
        Ok(head)
    }

    fn byte(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    /// Marshal's variable-length integer.
    fn long(&mut self) -> Result<i64> {
        let c = self.byte()? as i8;
        let value = match c {
            0 => 0,
            5..=127 => i64::from(c) - 5,
            -128..=-5 => i64::from(c) + 5,
            1..=4 => self
                .take(c as usize)?
                .iter()
                .enumerate()
                .fold(0i64, |acc, (i, b)| acc | (i64::from(*b) << (8 * i))),
            -4..=-1 => {
                let bytes = self.take(c.unsigned_abs() as usize)?;
                bytes.iter().enumerate().fold(-1i64, |acc, (i, b)| {
                    (acc & !(0xffi64 << (8 * i))) | (i64::from(*b) << (8 * i))
                })
            }
        };
        Ok(value)
    }
}

/// Read `mysql.database`, `mysql.username` and `mysql.password` from decrypted YAML.
pub fn database_credentials_from_yaml(yaml: &str) -> Result<DatabaseCredentials> {
    let doc: serde_yml::Value = serde_yml::from_str(yaml).map_err(|e| {
        Error::secrets_undecryptable(format!("Decrypted credentials are not valid YAML: {}", e))
    })?;

    let field = |name: &str, allow_empty: bool| -> Result<String> {
        doc.get("mysql")
            .and_then(|mysql| mysql.get(name))
            .and_then(scalar)
            .filter(|value| allow_empty || !value.is_empty())
            .ok_or_else(|| {
                Error::secrets_unavailable(format!("Credentials have no mysql.{} entry", name))
                    .with_hint("Add a mysql section with database, username and password to the credentials")
            })
    };

    Ok(DatabaseCredentials {
        database: field("database", false)?,
        username: field("username", false)?,
        password: field("password", true)?,
    })
}

fn scalar(value: &serde_yml::Value) -> Option<String> {
    match value {
        serde_yml::Value::String(s) => Some(s.clone()),
        serde_yml::Value::Number(n) => Some(n.to_string()),
        serde_yml::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Credentials from `<app-dir>/config/credentials.yml.enc`.
///
/// The master key comes from `RAILS_MASTER_KEY` when set, otherwise from
/// `<app-dir>/config/master.key`.
pub struct RailsCredentials {
    app_dir: AppDir,
    env_key: Option<Zeroizing<String>>,
}

impl RailsCredentials {
    pub fn new(app_dir: AppDir) -> Self {
        let env_key = std::env::var(MASTER_KEY_ENV)
            .ok()
            .filter(|value| !value.trim().is_empty())
            .map(Zeroizing::new);
        Self { app_dir, env_key }
    }

    /// Replace the key read from the environment.
    pub fn with_env_key(mut self, key: Option<String>) -> Self {
        self.env_key = key.map(Zeroizing::new);
        self
    }

    fn master_key(&self) -> Result<MasterKey> {
        if let Some(encoded) = &self.env_key {
            log_status!("secrets", "Using master key from {}", MASTER_KEY_ENV);
            return MasterKey::from_hex(encoded);
        }

        let path = self.app_dir.master_key_path();
        if path.is_file() {
            log_status!("secrets", "Using master key from {}", path.display());
            let encoded = Zeroizing::new(io::read_file(&path, "read master key")?);
            return MasterKey::from_hex(&encoded);
        }

        Err(Error::secrets_unavailable(format!(
            "Master key not found in {} or {}",
            MASTER_KEY_ENV,
            path.display()
        ))
        .with_hint(format!(
            "Export {} or run from the application directory (--app-dir)",
            MASTER_KEY_ENV
        )))
    }
}

impl SecretsSource for RailsCredentials {
    fn database_credentials(&self) -> Result<DatabaseCredentials> {
        let key = self.master_key()?;

        let path = self.app_dir.credentials_path();
        if !path.is_file() {
            return Err(Error::secrets_unavailable(format!(
                "Encrypted credentials not found at {}",
                path.display()
            )));
        }
        let message = io::read_file(&path, "read encrypted credentials")?;

        let plaintext = decrypt(&message, &key)?;
        let yaml = Zeroizing::new(unmarshal_string(&plaintext)?);
        database_credentials_from_yaml(&yaml)
    }
}
