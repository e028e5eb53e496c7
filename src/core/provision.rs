//! Provisioning: the ordered, individually idempotent steps that prepare a host.
//!
//! Every step runs only after the previous one succeeded. A fatal failure
//! aborts the run with no rollback; re-running is the recovery path, which
//! is why each mutation is guarded by a probe for its effect.

use std::cell::OnceCell;

use chrono::Utc;
use serde::Serialize;

use crate::config::ProvisioningConfig;
use crate::db;
use crate::error::{DependencyMissingDetails, Error, Result};
use crate::executor::{FailurePolicy, RemoteExecutor};
use crate::local_files::{self, AppDir, MASTER_KEY_FILE};
use crate::script::{Line, Script};
use crate::secrets::SecretsSource;
use crate::ssh::{RemoteTarget, Transport};
use crate::templates::{self, ServiceLayout, PROCESS};
use crate::transfer::ContentTransfer;

const MYSQL_CHECK: &str = r#"if ! command -v mysql >/dev/null 2>&1; then
  echo "ERROR: MySQL client/server not installed" >&2
  exit 1
fi
if ! systemctl is-active --quiet mysql && ! systemctl is-active --quiet mariadb; then
  echo "ERROR: MySQL/MariaDB service is not running" >&2
  exit 1
fi
"#;

const NGINX_CHECK: &str = r#"if ! command -v nginx >/dev/null 2>&1; then
  echo "ERROR: nginx not installed" >&2
  exit 1
fi
if ! systemctl is-active --quiet nginx; then
  echo "ERROR: nginx service is not running" >&2
  exit 1
fi
"#;

const SUDO_CHECK: &str = "sudo -n true";

const APT_UPDATE: &str = "sudo apt-get update";
const APT_INSTALL: &str = "sudo DEBIAN_FRONTEND=noninteractive apt-get install -y git curl \
build-essential libssl-dev libreadline-dev zlib1g-dev libffi-dev libyaml-dev libgdbm-dev \
libncurses-dev libdb-dev libsqlite3-dev libgmp-dev libbz2-dev autoconf bison pkg-config \
liblzma-dev libxml2-dev libxslt1-dev libcurl4-openssl-dev nginx";

const SETUP_KEYS_PRESENT: &str = "test -s \"$HOME/.ssh/authorized_keys\"";

const NGINX_VALIDATE: &str = "sudo nginx -t";
const NGINX_RELOAD: &str = "sudo systemctl reload nginx";
const SYSTEMD_RELOAD: &str = "sudo systemctl daemon-reload";

const RBENV_ENV: &str = r#"export RBENV_ROOT="$HOME/.rbenv"
export PATH="$RBENV_ROOT/bin:$PATH"
eval "$(rbenv init -)"
"#;
const RBENV_PRESENT: &str = "test -d \"$HOME/.rbenv\"";
const RBENV_CLONE: &str = "git clone https://github.com/rbenv/rbenv.git \"$HOME/.rbenv\"";
const RUBY_BUILD_PRESENT: &str = "test -d \"$HOME/.rbenv/plugins/ruby-build\"";
const RUBY_BUILD_CLONE: &str = r#"set -e
mkdir -p "$HOME/.rbenv/plugins"
git clone https://github.com/rbenv/ruby-build.git "$HOME/.rbenv/plugins/ruby-build"
"#;
const PROFILE_PRESENT: &str = "grep -q 'rbenv init' ~/.bashrc";
const PROFILE_APPEND: &str = r#"set -e
echo 'export RBENV_ROOT="$HOME/.rbenv"' >> ~/.bashrc
echo 'export PATH="$RBENV_ROOT/bin:$PATH"' >> ~/.bashrc
echo 'eval "$(rbenv init -)"' >> ~/.bashrc
"#;
const BUNDLER_PRESENT: &str = "gem list -i '^bundler$' >/dev/null";
const BUNDLER_INSTALL: &str = "gem install bundler --no-document\nrbenv rehash\n";

/// Fresh private directory (0700, owned by the setup account) for staged uploads.
const STAGING_CREATE: &str = "mktemp -d /tmp/caput.XXXXXXXXXX";

const REDACTED_BOOTSTRAP: &str = "sudo mysql -e \"[REDACTED]\"";

/// Provisioning steps in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Preconditions,
    Dependencies,
    Privileges,
    SystemPackages,
    DeployAccount,
    DeployKeys,
    DirectoryLayout,
    Secrets,
    Database,
    ProxySite,
    SupervisorUnit,
    ProcessManager,
    Runtime,
}

impl Step {
    pub fn describe(self) -> &'static str {
        match self {
            Step::Preconditions => "Checking configuration",
            Step::Dependencies => "Validating server dependencies",
            Step::Privileges => "Checking passwordless sudo",
            Step::SystemPackages => "Installing system packages",
            Step::DeployAccount => "Verifying deploy user account",
            Step::DeployKeys => "Ensuring deploy authorized_keys",
            Step::DirectoryLayout => "Creating deploy directories",
            Step::Secrets => "Uploading master key",
            Step::Database => "Creating MySQL database and user",
            Step::ProxySite => "Installing nginx site",
            Step::SupervisorUnit => "Installing systemd unit",
            Step::ProcessManager => "Installing puma config and launcher",
            Step::Runtime => "Installing rbenv and Ruby for the deploy user",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    /// A check ran and found nothing wrong.
    Passed,
    Applied,
    AlreadyPresent,
    Skipped,
    /// A best-effort command failed and the run continued.
    Tolerated,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRecord<S> {
    pub step: S,
    pub outcome: StepOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

struct Completed {
    outcome: StepOutcome,
    note: Option<String>,
}

impl Completed {
    fn changed(changed: bool) -> Self {
        if changed {
            StepOutcome::Applied.into()
        } else {
            StepOutcome::AlreadyPresent.into()
        }
    }

    fn skipped(note: impl Into<String>) -> Self {
        Self {
            outcome: StepOutcome::Skipped,
            note: Some(note.into()),
        }
    }
}

impl From<StepOutcome> for Completed {
    fn from(outcome: StepOutcome) -> Self {
        Self {
            outcome,
            note: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionReport {
    pub app_name: String,
    pub target: String,
    pub steps: Vec<StepRecord<Step>>,
    pub started_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
}

impl ProvisionReport {
    fn start(config: &ProvisioningConfig, target: &RemoteTarget) -> Self {
        Self {
            app_name: config.app_name.clone(),
            target: target.to_string(),
            steps: Vec::new(),
            started_at: Utc::now().to_rfc3339(),
            finished_at: None,
        }
    }

    fn record(&mut self, step: Step, completed: Completed) {
        self.steps.push(StepRecord {
            step,
            outcome: completed.outcome,
            note: completed.note,
        });
    }

    fn finish(mut self) -> Self {
        self.finished_at = Some(Utc::now().to_rfc3339());
        self
    }

    pub fn outcome_of(&self, step: Step) -> Option<StepOutcome> {
        self.steps
            .iter()
            .find(|record| record.step == step)
            .map(|record| record.outcome)
    }
}

/// Runs the provisioning steps against one host.
pub struct Provisioner<'a, T> {
    config: &'a ProvisioningConfig,
    executor: RemoteExecutor<T>,
    secrets: &'a dyn SecretsSource,
    app_dir: &'a AppDir,
    layout: ServiceLayout,
    setup: RemoteTarget,
    deploy: RemoteTarget,
    staging: OnceCell<String>,
}

impl<'a, T: Transport> Provisioner<'a, T> {
    pub fn new(
        config: &'a ProvisioningConfig,
        transport: T,
        secrets: &'a dyn SecretsSource,
        app_dir: &'a AppDir,
    ) -> Self {
        Self {
            executor: RemoteExecutor::new(transport),
            layout: ServiceLayout::new(config),
            setup: config.setup_target(),
            deploy: config.deploy_target(),
            staging: OnceCell::new(),
            config,
            secrets,
            app_dir,
        }
    }

    /// Preflight only: configuration, dependencies and sudo. Changes nothing.
    pub fn check(&self) -> Result<ProvisionReport> {
        let mut report = ProvisionReport::start(self.config, &self.setup);
        self.preflight(&mut report)?;
        Ok(report.finish())
    }

    /// Runs every step in order, stopping at the first fatal failure.
    ///
    /// The staging directory is removed whether or not the steps succeeded.
    pub fn run(&self) -> Result<ProvisionReport> {
        let result = self.run_steps();
        self.remove_staging();
        result
    }

    fn run_steps(&self) -> Result<ProvisionReport> {
        let mut report = ProvisionReport::start(self.config, &self.setup);
        self.preflight(&mut report)?;

        self.step(&mut report, Step::SystemPackages, || self.install_system_packages())?;
        self.step(&mut report, Step::DeployAccount, || self.ensure_deploy_account())?;
        self.step(&mut report, Step::DeployKeys, || self.ensure_deploy_keys())?;
        self.step(&mut report, Step::DirectoryLayout, || self.ensure_directory_layout())?;
        self.step(&mut report, Step::Secrets, || self.upload_secrets())?;
        self.step(&mut report, Step::Database, || self.bootstrap_database())?;
        self.step(&mut report, Step::ProxySite, || self.install_proxy_site())?;
        self.step(&mut report, Step::SupervisorUnit, || self.install_supervisor_unit())?;
        self.step(&mut report, Step::ProcessManager, || self.install_process_manager())?;
        self.step(&mut report, Step::Runtime, || self.install_runtime())?;

        log_status!("provision", "Server preparation complete for {}", self.config.app_name);
        Ok(report.finish())
    }

    fn preflight(&self, report: &mut ProvisionReport) -> Result<()> {
        // The config was resolved and validated before the provisioner existed.
        report.record(Step::Preconditions, StepOutcome::Passed.into());
        self.step(report, Step::Dependencies, || self.check_dependencies())?;
        self.step(report, Step::Privileges, || self.check_privileges())
    }

    fn step(
        &self,
        report: &mut ProvisionReport,
        step: Step,
        action: impl FnOnce() -> Result<Completed>,
    ) -> Result<()> {
        log_status!("provision", "{}...", step.describe());
        let completed = action()?;
        report.record(step, completed);
        Ok(())
    }

    fn transfer(&self) -> ContentTransfer<'_, T> {
        ContentTransfer::new(&self.executor)
    }

    /// Run `action` unless `probe` shows its effect already exists.
    fn ensure(&self, target: &RemoteTarget, probe: &str, action: &str) -> Result<bool> {
        if self.executor.probe(target, probe)? {
            return Ok(false);
        }
        self.executor.execute(target, action)?;
        Ok(true)
    }

    fn check_dependencies(&self) -> Result<Completed> {
        for (dependency, script) in [("MySQL/MariaDB", MYSQL_CHECK), ("nginx", NGINX_CHECK)] {
            let result = self.executor.run(&self.setup, script)?;
            if !result.success() {
                return Err(Error::dependency_missing(DependencyMissingDetails {
                    dependency: dependency.to_string(),
                    exit_code: result.exit_code,
                    target: self.setup.details(),
                }));
            }
        }
        Ok(StepOutcome::Passed.into())
    }

    fn check_privileges(&self) -> Result<Completed> {
        if !self.executor.probe(&self.setup, SUDO_CHECK)? {
            return Err(Error::privilege_unavailable(self.setup.details()));
        }
        Ok(StepOutcome::Passed.into())
    }

    fn install_system_packages(&self) -> Result<Completed> {
        let mut tolerated = false;
        for script in [APT_UPDATE, APT_INSTALL] {
            let result = self
                .executor
                .execute_with(&self.setup, script, FailurePolicy::BestEffort)?;
            tolerated |= !result.success();
        }

        Ok(if tolerated {
            StepOutcome::Tolerated.into()
        } else {
            StepOutcome::Applied.into()
        })
    }

    fn ensure_deploy_account(&self) -> Result<Completed> {
        let user = &self.config.deploy_user;
        let exists = Line::new("getent passwd ").arg(user).lit(" >/dev/null 2>&1");
        let create = Line::new("sudo adduser --disabled-password --gecos \"\" ").arg(user);

        let changed = self.ensure(&self.setup, &exists.build(), &create.build())?;
        Ok(Completed::changed(changed))
    }

    fn ensure_deploy_keys(&self) -> Result<Completed> {
        let user = &self.config.deploy_user;
        let home = Line::new("DEPLOY_HOME=\"$(getent passwd ")
            .arg(user)
            .lit(" | cut -d: -f6)\"");

        let present = Script::new()
            .line(home.clone())
            .text("test -n \"$DEPLOY_HOME\" && sudo test -s \"$DEPLOY_HOME/.ssh/authorized_keys\"")
            .build();
        if self.executor.probe(&self.setup, &present)? {
            return Ok(StepOutcome::AlreadyPresent.into());
        }

        if !self.executor.probe(&self.setup, SETUP_KEYS_PRESENT)? {
            eprintln!(
                "warning: {} has no authorized_keys to copy; add a key for {} before deploying",
                self.setup, user
            );
            return Ok(Completed::skipped("setup account has no authorized_keys"));
        }

        let copy = Script::new()
            .text("set -e")
            .line(home)
            .text("test -n \"$DEPLOY_HOME\"")
            .line(
                Line::new("sudo install -d -m 700 -o ")
                    .arg(user)
                    .lit(" -g ")
                    .arg(user)
                    .lit(" \"$DEPLOY_HOME/.ssh\""),
            )
            .line(
                Line::new("sudo install -m 600 -o ")
                    .arg(user)
                    .lit(" -g ")
                    .arg(user)
                    .lit(" \"$HOME/.ssh/authorized_keys\" \"$DEPLOY_HOME/.ssh/authorized_keys\""),
            )
            .build();
        self.executor.execute(&self.setup, &copy)?;
        Ok(StepOutcome::Applied.into())
    }

    fn ensure_directory_layout(&self) -> Result<Completed> {
        let root = &self.layout.deploy_path;
        let exists = Line::new("test -d ").path(root);

        let mut mkdir = Line::new("sudo mkdir -p");
        for dir in self.layout.shared_subdirs() {
            mkdir = mkdir.lit(" ").path(&dir);
        }
        let create = Script::new()
            .text("set -e")
            .line(mkdir)
            .line(
                Line::new("sudo chown -R ")
                    .arg(&owner(&self.config.deploy_user))
                    .lit(" ")
                    .path(root),
            )
            .build();

        let changed = self.ensure(&self.setup, &exists.build(), &create)?;
        Ok(Completed::changed(changed))
    }

    fn upload_secrets(&self) -> Result<Completed> {
        let Some(local) = self.app_dir.secrets_artifact() else {
            eprintln!(
                "warning: no {} in {}; skipping master key upload",
                MASTER_KEY_FILE,
                self.app_dir.root().display()
            );
            return Ok(Completed::skipped(format!("{} not found locally", MASTER_KEY_FILE)));
        };

        let destination = format!("{}/master.key", self.layout.secrets_dir);
        let digest = local_files::file_digest(&local)?;
        if self
            .executor
            .probe(&self.setup, &content_matches(&destination, &digest))?
        {
            return Ok(StepOutcome::AlreadyPresent.into());
        }

        let staged = self.staged_path(".master.key")?;
        self.transfer().upload_file(&self.setup, &local, &staged, 0o400)?;
        self.move_into_place(&staged, &destination, &self.config.deploy_user)?;
        Ok(StepOutcome::Applied.into())
    }

    fn bootstrap_database(&self) -> Result<Completed> {
        let creds = self.secrets.database_credentials()?;

        if self
            .executor
            .probe(&self.setup, &db::provisioned_probe(&creds))?
        {
            return Ok(StepOutcome::AlreadyPresent.into());
        }

        self.executor
            .execute(&self.setup, &db::bootstrap_command(&creds))
            .map_err(|e| e.redact_command(REDACTED_BOOTSTRAP))?;
        Ok(StepOutcome::Applied.into())
    }

    fn install_proxy_site(&self) -> Result<Completed> {
        let site = templates::nginx_site(self.config, &self.layout);
        let available = &self.layout.site_available;
        let enabled = &self.layout.site_enabled;

        let mut changed = self.install_rendered(&site, ".nginx", available, 0o644, "root")?;

        let linked = Line::new("test \"$(readlink ")
            .path(enabled)
            .lit(")\" = ")
            .path(available);
        let link = Line::new("sudo ln -sf ").path(available).lit(" ").path(enabled);
        changed |= self.ensure(&self.setup, &linked.build(), &link.build())?;

        // Validate even when unchanged so a broken site left by an earlier run is caught.
        self.executor.execute(&self.setup, NGINX_VALIDATE)?;
        if changed {
            self.executor.execute(&self.setup, NGINX_RELOAD)?;
        }
        Ok(Completed::changed(changed))
    }

    fn install_supervisor_unit(&self) -> Result<Completed> {
        let unit = templates::systemd_unit(self.config, &self.layout);
        let suffix = format!("-{}.service", PROCESS);

        let mut changed =
            self.install_rendered(&unit, &suffix, &self.layout.unit_path, 0o644, "root")?;
        if changed {
            self.executor.execute(&self.setup, SYSTEMD_RELOAD)?;
        }

        let unit_name = &self.layout.unit_name;
        let enabled = Line::new("systemctl is-enabled --quiet ").arg(unit_name);
        let enable = Line::new("sudo systemctl enable ").arg(unit_name);
        changed |= self.ensure(&self.setup, &enabled.build(), &enable.build())?;

        Ok(Completed::changed(changed))
    }

    fn install_process_manager(&self) -> Result<Completed> {
        let user = &self.config.deploy_user;
        let bin_dir = &self.layout.bin_dir;

        let exists = Line::new("test -d ").path(bin_dir);
        let create = Line::new("sudo install -d -m 755 -o ")
            .arg(user)
            .lit(" -g ")
            .arg(user)
            .lit(" ")
            .path(bin_dir);
        let mut changed = self.ensure(&self.setup, &exists.build(), &create.build())?;

        let puma = templates::puma_config(self.config, &self.layout);
        changed |= self.install_rendered(
            &puma,
            &format!("-{}.rb", PROCESS),
            &self.layout.process_config_path,
            0o644,
            user,
        )?;

        let launcher = templates::launcher_script(self.config, &self.layout);
        changed |= self.install_rendered(
            &launcher,
            &format!("-start_{}.sh", PROCESS),
            &self.layout.launcher_path,
            0o755,
            user,
        )?;

        Ok(Completed::changed(changed))
    }

    fn install_runtime(&self) -> Result<Completed> {
        let Some(version) = self.config.runtime_version.as_deref() else {
            eprintln!("warning: RUNTIME_VERSION is not set; skipping Ruby installation");
            return Ok(Completed::skipped("RUNTIME_VERSION not set"));
        };
        let target = &self.deploy;
        let with_rbenv = |line: Line| Script::new().text(RBENV_ENV).line(line).build();

        let mut changed = self.ensure(target, RBENV_PRESENT, RBENV_CLONE)?;
        changed |= self.ensure(target, RUBY_BUILD_PRESENT, RUBY_BUILD_CLONE)?;

        changed |= self.ensure(
            target,
            &with_rbenv(Line::new("rbenv versions --bare | grep -Fqx ").arg(version)),
            &with_rbenv(Line::new("rbenv install ").arg(version)),
        )?;

        let select = Script::new()
            .text("set -e")
            .text(RBENV_ENV)
            .line(Line::new("rbenv global ").arg(version))
            .text("rbenv rehash")
            .build();
        changed |= self.ensure(
            target,
            &with_rbenv(Line::new("test \"$(rbenv global)\" = ").arg(version)),
            &select,
        )?;

        changed |= self.ensure(target, PROFILE_PRESENT, PROFILE_APPEND)?;

        let bundler = Script::new()
            .text("set -e")
            .text(RBENV_ENV)
            .text(BUNDLER_INSTALL)
            .build();
        let bundler_present = Script::new().text(RBENV_ENV).text(BUNDLER_PRESENT).build();
        changed |= self.ensure(target, &bundler_present, &bundler)?;

        Ok(Completed::changed(changed))
    }

    /// Upload rendered content unless the installed copy already matches.
    ///
    /// Returns whether anything was installed.
    fn install_rendered(
        &self,
        content: &str,
        staging_suffix: &str,
        destination: &str,
        mode: u32,
        owner_user: &str,
    ) -> Result<bool> {
        let digest = local_files::sha256_hex(content.as_bytes());
        if self
            .executor
            .probe(&self.setup, &content_matches(destination, &digest))?
        {
            return Ok(false);
        }

        let staged = self.staged_path(staging_suffix)?;
        self.transfer()
            .upload_content(&self.setup, content.as_bytes(), &staged, mode)?;
        self.move_into_place(&staged, destination, owner_user)?;
        Ok(true)
    }

    /// Created on first use so runs that upload nothing leave no trace.
    fn staging_dir(&self) -> Result<&str> {
        if let Some(dir) = self.staging.get() {
            return Ok(dir);
        }

        let output = self.executor.execute(&self.setup, STAGING_CREATE)?.stdout_text();
        // Login shells may print a banner first; mktemp's path is the last line.
        let dir = output.lines().last().unwrap_or_default().trim().to_string();
        if !dir.starts_with('/') {
            return Err(Error::internal_unexpected(format!(
                "mktemp on {} did not print a staging directory (got {:?})",
                self.setup, output
            )));
        }
        Ok(self.staging.get_or_init(|| dir))
    }

    fn staged_path(&self, suffix: &str) -> Result<String> {
        let dir = self.staging_dir()?;
        Ok(format!("{}/{}", dir, self.layout.staged_name(suffix)))
    }

    fn remove_staging(&self) {
        let Some(dir) = self.staging.get() else {
            return;
        };
        let remove = Line::new("rm -rf ").path(dir).build();
        if let Err(err) = self
            .executor
            .execute_with(&self.setup, &remove, FailurePolicy::BestEffort)
        {
            eprintln!("warning: could not remove staging directory {}: {}", dir, err.message);
        }
    }

    fn move_into_place(&self, staged: &str, destination: &str, owner_user: &str) -> Result<()> {
        let install = Script::new()
            .text("set -e")
            .line(Line::new("sudo mv -f ").path(staged).lit(" ").path(destination))
            .line(
                Line::new("sudo chown ")
                    .arg(&owner(owner_user))
                    .lit(" ")
                    .path(destination),
            )
            .build();
        self.executor.execute(&self.setup, &install)?;
        Ok(())
    }
}

fn owner(user: &str) -> String {
    format!("{0}:{0}", user)
}

/// Probe: `path` exists and its SHA-256 equals `digest`.
fn content_matches(path: &str, digest: &str) -> String {
    Line::new("printf '%s  %s\\n' ")
        .arg(digest)
        .lit(" ")
        .path(path)
        .lit(" | sudo sha256sum --check --status")
        .build()
}
