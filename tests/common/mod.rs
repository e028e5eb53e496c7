//! Recording transport and fixtures shared by the integration tests.
#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::path::Path;

use caput::config::{ProvisioningConfig, Settings};
use caput::local_files::AppDir;
use caput::secrets::{DatabaseCredentials, SecretsSource};
use caput::error::TransferFailedDetails;
use caput::ssh::{ChannelClose, ChannelOutcome, RemoteTarget, Transport};
use caput::{Error, Result};
use tempfile::TempDir;

pub const MASTER_KEY: &str = "00112233445566778899aabbccddeeff";

/// Directory `mktemp -d` hands out on the first run against a fake host.
pub const STAGING_DIR: &str = "/tmp/caput.run1";

/// Where an upload named `name` is staged during the first run.
pub fn staged(name: &str) -> String {
    format!("{}/{}", STAGING_DIR, name)
}

/// Probe results of a host where nothing has been provisioned yet.
/// Patterns are matched as substrings of the script, first match wins.
pub const FRESH_HOST: &[(&str, i32)] = &[
    ("getent passwd deploy >/dev/null", 2),
    ("sudo test -s", 1),
    ("test -d", 1),
    ("sha256sum --check", 1),
    ("readlink", 1),
    ("is-enabled", 1),
    ("mysql -N", 1),
    ("rbenv versions", 1),
    ("\"$(rbenv global)\"", 1),
    ("grep -q 'rbenv init'", 1),
    ("gem list", 1),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Exec {
        target: String,
        script: String,
    },
    Copy {
        target: String,
        remote_path: String,
        content: Vec<u8>,
    },
}

/// Transport that records every call and answers from a closure over the script.
///
/// A successful `mktemp -d` prints a new directory each time. Copying onto a
/// path an earlier copy already wrote fails, as a leftover read-only file would.
pub struct FakeTransport {
    calls: RefCell<Vec<Call>>,
    respond: Box<dyn Fn(&str) -> ChannelOutcome>,
    staging_dirs: Cell<usize>,
}

impl FakeTransport {
    pub fn new(respond: impl Fn(&str) -> ChannelOutcome + 'static) -> Self {
        Self {
            calls: RefCell::new(Vec::new()),
            respond: Box::new(respond),
            staging_dirs: Cell::new(0),
        }
    }

    /// Every command exits 0: a fully provisioned host.
    pub fn provisioned_host() -> Self {
        Self::new(|_| ChannelOutcome::exited(0))
    }

    pub fn with_rules(rules: &[(&'static str, i32)]) -> Self {
        let rules = rules.to_vec();
        Self::new(move |script| {
            let code = rules
                .iter()
                .find(|(pattern, _)| script.contains(pattern))
                .map(|(_, code)| *code)
                .unwrap_or(0);
            ChannelOutcome::exited(code)
        })
    }

    /// A fresh host, with `overrides` taking precedence over its probe results.
    pub fn fresh_host_with(overrides: &[(&'static str, i32)]) -> Self {
        let rules: Vec<(&'static str, i32)> =
            overrides.iter().chain(FRESH_HOST.iter()).copied().collect();
        Self::with_rules(&rules)
    }

    pub fn fresh_host() -> Self {
        Self::fresh_host_with(&[])
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.borrow().clone()
    }

    pub fn scripts(&self) -> Vec<String> {
        self.calls
            .borrow()
            .iter()
            .filter_map(|call| match call {
                Call::Exec { script, .. } => Some(script.clone()),
                Call::Copy { .. } => None,
            })
            .collect()
    }

    pub fn copies(&self) -> Vec<(String, Vec<u8>)> {
        self.calls
            .borrow()
            .iter()
            .filter_map(|call| match call {
                Call::Copy {
                    remote_path,
                    content,
                    ..
                } => Some((remote_path.clone(), content.clone())),
                Call::Exec { .. } => None,
            })
            .collect()
    }

    pub fn copied(&self, remote_path: &str) -> Option<String> {
        self.copies()
            .into_iter()
            .find(|(path, _)| path == remote_path)
            .map(|(_, content)| String::from_utf8_lossy(&content).to_string())
    }

    /// Index of the first call whose script contains `needle`, or that copies to it.
    pub fn position(&self, needle: &str) -> Option<usize> {
        self.calls.borrow().iter().position(|call| match call {
            Call::Exec { script, .. } => script.contains(needle),
            Call::Copy { remote_path, .. } => remote_path == needle,
        })
    }

    pub fn ran(&self, needle: &str) -> bool {
        self.scripts().iter().any(|script| script.contains(needle))
    }

    pub fn target_of(&self, needle: &str) -> Option<String> {
        self.calls.borrow().iter().find_map(|call| match call {
            Call::Exec { target, script } if script.contains(needle) => Some(target.clone()),
            _ => None,
        })
    }
}

impl Transport for FakeTransport {
    fn exec(&self, target: &RemoteTarget, script: &str) -> Result<ChannelOutcome> {
        self.calls.borrow_mut().push(Call::Exec {
            target: target.to_string(),
            script: script.to_string(),
        });
        let outcome = (self.respond)(script);
        if script.starts_with("mktemp -d")
            && outcome.close == ChannelClose::Exited(0)
            && outcome.stdout.is_empty()
        {
            let n = self.staging_dirs.get() + 1;
            self.staging_dirs.set(n);
            return Ok(outcome.with_stdout(format!("/tmp/caput.run{}\n", n)));
        }
        Ok(outcome)
    }

    fn copy(&self, target: &RemoteTarget, local_path: &Path, remote_path: &str) -> Result<()> {
        let content = std::fs::read(local_path)
            .map_err(|e| Error::internal_io(e.to_string(), Some("read upload".to_string())))?;
        if self.copied(remote_path).is_some() {
            return Err(Error::transfer_failed(TransferFailedDetails {
                local_path: local_path.display().to_string(),
                remote_path: remote_path.to_string(),
                error: format!("scp: {}: Permission denied", remote_path),
                target: target.details(),
            }));
        }
        self.calls.borrow_mut().push(Call::Copy {
            target: target.to_string(),
            remote_path: remote_path.to_string(),
            content,
        });
        Ok(())
    }
}

pub struct StaticSecrets(pub DatabaseCredentials);

impl StaticSecrets {
    pub fn new(database: &str, username: &str, password: &str) -> Self {
        Self(DatabaseCredentials {
            database: database.to_string(),
            username: username.to_string(),
            password: password.to_string(),
        })
    }
}

impl SecretsSource for StaticSecrets {
    fn database_credentials(&self) -> Result<DatabaseCredentials> {
        Ok(self.0.clone())
    }
}

pub struct NoSecrets;

impl SecretsSource for NoSecrets {
    fn database_credentials(&self) -> Result<DatabaseCredentials> {
        Err(Error::secrets_unavailable(
            "Master key not found in RAILS_MASTER_KEY or config/master.key",
        ))
    }
}

pub fn blog_config() -> ProvisioningConfig {
    ProvisioningConfig::resolve(&Settings::from_pairs([
        ("APP_NAME", "blog"),
        ("SETUP_USER", "setup"),
        ("DEPLOY_USER", "deploy"),
        ("SERVER", "203.0.113.7"),
        ("DOMAIN", "blog.example.com"),
        ("DEPLOY_PATH", "/var/www/blog"),
        ("RUNTIME_VERSION", "3.2.2"),
    ]))
    .expect("blog config resolves")
}

/// Local app directory containing `config/master.key`.
pub fn app_dir_with_master_key() -> (TempDir, AppDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::create_dir_all(dir.path().join("config")).expect("config dir");
    std::fs::write(dir.path().join("config/master.key"), MASTER_KEY).expect("master key");
    let app_dir = AppDir::new(dir.path());
    (dir, app_dir)
}

pub fn empty_app_dir() -> (TempDir, AppDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let app_dir = AppDir::new(dir.path());
    (dir, app_dir)
}
