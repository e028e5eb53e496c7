//! Flat `KEY="value"` configuration file and the resolved provisioning settings.

use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::OnceLock;

use crate::error::{Error, Result};
use crate::ssh::RemoteTarget;
use crate::utils::io;

pub const CONFIG_FILE: &str = "caput.conf";

pub mod keys {
    pub const APP_NAME: &str = "APP_NAME";
    pub const SETUP_USER: &str = "SETUP_USER";
    pub const DEPLOY_USER: &str = "DEPLOY_USER";
    pub const SERVER: &str = "SERVER";
    pub const DOMAIN: &str = "DOMAIN";
    pub const RUNTIME_VERSION: &str = "RUNTIME_VERSION";
    pub const LEGACY_RUNTIME_VERSION: &str = "RUBY_VERSION";
    pub const DEPLOY_PATH: &str = "DEPLOY_PATH";
    pub const REPO_URL: &str = "REPO_URL";
    pub const SSH_PORT: &str = "SSH_PORT";
    pub const SSH_IDENTITY_FILE: &str = "SSH_IDENTITY_FILE";

    pub const REQUIRED: [&str; 4] = [SETUP_USER, DEPLOY_USER, SERVER, APP_NAME];

    pub const RECOGNIZED: [&str; 11] = [
        APP_NAME,
        SETUP_USER,
        DEPLOY_USER,
        SERVER,
        DOMAIN,
        RUNTIME_VERSION,
        LEGACY_RUNTIME_VERSION,
        DEPLOY_PATH,
        REPO_URL,
        SSH_PORT,
        SSH_IDENTITY_FILE,
    ];
}

const SAMPLE_CONFIG: &str = r#"# Sample configuration for caput deployment

# Name of the application. This name will be used for the nginx site as well
# as for the Puma service definition.
APP_NAME="myapp"

# Setup user on the server. Note that this user should have passwordless sudo
# access on the server. This user is only used while setting up the application.
SETUP_USER="setup"

# Deploy user on the server. This is the user that will own the application and also
# run the Puma process. If this user does not exist it will be created.
DEPLOY_USER="deploy"

# Target server hostname or IP. This is the address the application is deployed to.
SERVER="example.com"

# Domain for the nginx site. This is the hostname users enter in their browsers.
# DNS is assumed to be configured already.
DOMAIN="www.example.com"

# Ruby version installed with rbenv for the deploy user. It must match the version
# used by the application being deployed.
RUNTIME_VERSION="3.2.2"

# Path on the server where the app will be deployed.
DEPLOY_PATH="/var/www/myapp"

# Git repository URL of the application.
REPO_URL="git@example.com:username/myapp.git"

# Optional SSH settings.
# SSH_PORT="22"
# SSH_IDENTITY_FILE="~/.ssh/id_ed25519"
"#;

fn line_pattern() -> &'static Regex {
    static LINE: OnceLock<Regex> = OnceLock::new();
    LINE.get_or_init(|| {
        Regex::new(r#"^(\w+)=(?:"(.*)"|'(.*)'|(.*))$"#).expect("static config line pattern")
    })
}

fn app_name_pattern() -> &'static Regex {
    static APP: OnceLock<Regex> = OnceLock::new();
    APP.get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]*$").expect("static app name pattern"))
}

fn deploy_path_pattern() -> &'static Regex {
    static PATH: OnceLock<Regex> = OnceLock::new();
    PATH.get_or_init(|| Regex::new(r"^(/[A-Za-z0-9._-]+)+$").expect("static deploy path pattern"))
}

fn domain_pattern() -> &'static Regex {
    static DOMAIN: OnceLock<Regex> = OnceLock::new();
    DOMAIN.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9*_~.:\[\]-]+( [A-Za-z0-9*_~.:\[\]-]+)*$").expect("static domain pattern")
    })
}

fn account_pattern() -> &'static Regex {
    static ACCOUNT: OnceLock<Regex> = OnceLock::new();
    ACCOUNT.get_or_init(|| Regex::new(r"^[a-z_][a-z0-9_-]*$").expect("static account pattern"))
}

/// Every key read from the configuration file, recognized or not.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    entries: BTreeMap<String, String>,
    source: Option<String>,
}

impl Settings {
    pub fn parse(content: &str) -> Self {
        let mut entries = BTreeMap::new();

        for line in content.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            if let Some(caps) = line_pattern().captures(trimmed) {
                let value = caps
                    .get(2)
                    .or_else(|| caps.get(3))
                    .or_else(|| caps.get(4))
                    .map(|m| m.as_str())
                    .unwrap_or_default();
                entries.insert(caps[1].to_string(), value.to_string());
            }
        }

        Self {
            entries,
            source: None,
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::config_file_not_found(path.display().to_string()));
        }

        let content = io::read_file(path, &format!("read {}", path.display()))?;
        let mut settings = Self::parse(&content);
        settings.source = Some(path.display().to_string());
        Ok(settings)
    }

    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        Self {
            entries: pairs
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            source: None,
        }
    }

    /// Value for `key`, treating empty or whitespace-only values as absent.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    /// Keys the provisioner does not interpret, kept for reporting.
    pub fn unrecognized(&self) -> BTreeMap<String, String> {
        self.entries
            .iter()
            .filter(|(k, _)| !keys::RECOGNIZED.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// Resolved, validated settings threaded through every provisioning step.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisioningConfig {
    pub app_name: String,
    pub setup_user: String,
    pub deploy_user: String,
    pub server: String,
    pub domain: String,
    pub deploy_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repo_url: Option<String>,
    pub ssh_port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssh_identity_file: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

impl ProvisioningConfig {
    pub fn resolve(settings: &Settings) -> Result<Self> {
        let missing: Vec<String> = keys::REQUIRED
            .iter()
            .filter(|key| settings.get(key).is_none())
            .map(|key| key.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(Error::config_missing_keys(
                missing,
                settings.source().map(str::to_string),
            ));
        }

        let required = |key: &str| settings.get(key).unwrap_or_default().to_string();
        let app_name = required(keys::APP_NAME);
        let setup_user = required(keys::SETUP_USER);
        let deploy_user = required(keys::DEPLOY_USER);
        let server = required(keys::SERVER);

        if !app_name_pattern().is_match(&app_name) {
            return Err(Error::config_invalid_value(
                keys::APP_NAME,
                Some(app_name),
                "must start with a letter or digit and contain only letters, digits, '.', '_' or '-'",
            ));
        }
        for (key, user) in [(keys::SETUP_USER, &setup_user), (keys::DEPLOY_USER, &deploy_user)] {
            if !account_pattern().is_match(user) {
                return Err(Error::config_invalid_value(
                    key,
                    Some(user.clone()),
                    "must be a valid lowercase account name",
                ));
            }
        }

        let deploy_path = settings
            .get(keys::DEPLOY_PATH)
            .map(|p| p.trim_end_matches('/').to_string())
            .unwrap_or_else(|| format!("/var/www/{}", app_name));
        if !deploy_path_pattern().is_match(&deploy_path) {
            return Err(Error::config_invalid_value(
                keys::DEPLOY_PATH,
                Some(deploy_path),
                "must be an absolute path below / made of letters, digits, '.', '_' or '-'",
            ));
        }

        let domain = settings
            .get(keys::DOMAIN)
            .map(str::to_string)
            .unwrap_or_else(|| server.clone());
        if !domain_pattern().is_match(&domain) {
            return Err(Error::config_invalid_value(
                keys::DOMAIN,
                Some(domain),
                "must be one or more space-separated host names",
            ));
        }

        let ssh_port = match settings.get(keys::SSH_PORT) {
            Some(raw) => raw.parse::<u16>().ok().filter(|port| *port != 0).ok_or_else(|| {
                Error::config_invalid_value(
                    keys::SSH_PORT,
                    Some(raw.to_string()),
                    "must be a port number between 1 and 65535",
                )
            })?,
            None => 22,
        };

        Ok(Self {
            domain,
            runtime_version: settings
                .get(keys::RUNTIME_VERSION)
                .or_else(|| settings.get(keys::LEGACY_RUNTIME_VERSION))
                .map(str::to_string),
            repo_url: settings.get(keys::REPO_URL).map(str::to_string),
            ssh_identity_file: settings
                .get(keys::SSH_IDENTITY_FILE)
                .map(|path| shellexpand::tilde(path).to_string()),
            extra: settings.unrecognized(),
            app_name,
            setup_user,
            deploy_user,
            server,
            deploy_path,
            ssh_port,
        })
    }

    /// Privileged account used only while provisioning.
    pub fn setup_target(&self) -> RemoteTarget {
        self.target_for(&self.setup_user)
    }

    /// Unprivileged account that owns and runs the application.
    pub fn deploy_target(&self) -> RemoteTarget {
        self.target_for(&self.deploy_user)
    }

    fn target_for(&self, user: &str) -> RemoteTarget {
        let mut target = RemoteTarget::new(user, &self.server).with_port(self.ssh_port);
        if let Some(identity) = &self.ssh_identity_file {
            target = target.with_identity_file(identity);
        }
        target
    }

    pub fn shared_dir(&self) -> String {
        format!("{}/shared", self.deploy_path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InitOutcome {
    Created,
    AlreadyExists,
}

/// Write the commented sample configuration unless one already exists.
pub fn init_config(path: &Path) -> Result<InitOutcome> {
    if io::create_new(path, SAMPLE_CONFIG, &format!("write {}", path.display()))? {
        Ok(InitOutcome::Created)
    } else {
        Ok(InitOutcome::AlreadyExists)
    }
}
