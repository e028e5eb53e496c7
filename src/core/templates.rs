//! Documents installed on the host: nginx site, systemd unit, puma config and launcher.
//!
//! Content is byte-for-byte what downstream tooling (Capistrano's puma tasks,
//! nginx includes) expects, so changes here are deployment-visible.

use crate::config::ProvisioningConfig;
use crate::utils::template::{render, TemplateVars};

/// Application server process managed by the unit.
pub const PROCESS: &str = "puma";

pub const NGINX_SITES_AVAILABLE: &str = "/etc/nginx/sites-available";
pub const NGINX_SITES_ENABLED: &str = "/etc/nginx/sites-enabled";
pub const SYSTEMD_UNIT_DIR: &str = "/etc/systemd/system";

/// Shared-state subdirectories created under `<deploy_path>/shared`.
pub const SHARED_SUBDIRS: [&str; 5] = ["tmp/pids", "tmp/sockets", "log", "storage", "config"];

const NGINX_SITE: &str = r#"server {
    listen 80;
    server_name {{domain}};

    root {{deploy_path}}/current/public;

    location / {
        try_files $uri @{{process}};
    }

    location @{{process}} {
        proxy_pass http://unix:{{socket_path}};
        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;
        proxy_set_header Host $http_host;
        proxy_redirect off;
    }

    error_page 500 502 503 504 /500.html;
}
"#;

const SYSTEMD_UNIT: &str = r#"[Unit]
Description=Puma HTTP Server for {{app_name}}
After=network.target

[Service]
Type=simple
User={{deploy_user}}
WorkingDirectory={{deploy_path}}/current
Environment="RAILS_ENV=production"
Environment="RACK_ENV=production"
ExecStart={{launcher_path}}
Restart=always

[Install]
WantedBy=multi-user.target
"#;

// `#{shared_dir}` is Ruby interpolation evaluated by puma, not a placeholder.
const PUMA_CONFIG: &str = r##"threads 0,16
workers 1
app_dir = "{{deploy_path}}/current"
shared_dir = "{{shared_dir}}"
bind "unix://#{shared_dir}/tmp/sockets/puma.sock"
pidfile "#{shared_dir}/tmp/pids/puma.pid"
stdout_redirect "#{shared_dir}/log/puma.stdout.log", "#{shared_dir}/log/puma.stderr.log", true
"##;

const LAUNCHER: &str = r#"#!/bin/bash
export RBENV_ROOT="$HOME/.rbenv"
export PATH="$RBENV_ROOT/bin:$PATH"
eval "$(rbenv init -)"
cd {{deploy_path}}/current || exit 1
exec $RBENV_ROOT/shims/bundle exec puma -C {{process_config_path}}
"#;

/// Remote paths derived from the app name and deploy path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceLayout {
    pub app_name: String,
    pub deploy_path: String,
    pub shared_dir: String,
    pub secrets_dir: String,
    pub socket_path: String,
    pub pid_path: String,
    pub log_dir: String,
    pub bin_dir: String,
    pub launcher_path: String,
    pub process_config_path: String,
    pub unit_name: String,
    pub unit_path: String,
    pub site_available: String,
    pub site_enabled: String,
}

impl ServiceLayout {
    pub fn new(config: &ProvisioningConfig) -> Self {
        let shared_dir = config.shared_dir();
        let unit_name = format!("{}-{}", config.app_name, PROCESS);

        Self {
            app_name: config.app_name.clone(),
            deploy_path: config.deploy_path.clone(),
            secrets_dir: format!("{}/config", shared_dir),
            socket_path: format!("{}/tmp/sockets/{}.sock", shared_dir, PROCESS),
            pid_path: format!("{}/tmp/pids/{}.pid", shared_dir, PROCESS),
            log_dir: format!("{}/log", shared_dir),
            bin_dir: format!("{}/bin", shared_dir),
            launcher_path: format!("{}/bin/start_{}.sh", shared_dir, PROCESS),
            process_config_path: format!("{}/{}.rb", shared_dir, PROCESS),
            unit_path: format!("{}/{}.service", SYSTEMD_UNIT_DIR, unit_name),
            site_available: format!("{}/{}", NGINX_SITES_AVAILABLE, config.app_name),
            site_enabled: format!("{}/{}", NGINX_SITES_ENABLED, config.app_name),
            shared_dir,
            unit_name,
        }
    }

    pub fn shared_subdirs(&self) -> Vec<String> {
        SHARED_SUBDIRS
            .iter()
            .map(|sub| format!("{}/{}", self.shared_dir, sub))
            .collect()
    }

    /// File name an upload is staged under before a privileged move into place.
    pub fn staged_name(&self, suffix: &str) -> String {
        format!("{}{}", self.app_name, suffix)
    }
}

fn variables<'a>(config: &'a ProvisioningConfig, layout: &'a ServiceLayout) -> [(&'static str, &'a str); 11] {
    [
        (TemplateVars::APP_NAME, config.app_name.as_str()),
        (TemplateVars::DOMAIN, config.domain.as_str()),
        (TemplateVars::DEPLOY_PATH, config.deploy_path.as_str()),
        (TemplateVars::DEPLOY_USER, config.deploy_user.as_str()),
        (TemplateVars::SHARED_DIR, layout.shared_dir.as_str()),
        (TemplateVars::SOCKET_PATH, layout.socket_path.as_str()),
        (TemplateVars::PID_PATH, layout.pid_path.as_str()),
        (TemplateVars::LOG_DIR, layout.log_dir.as_str()),
        (TemplateVars::LAUNCHER_PATH, layout.launcher_path.as_str()),
        (TemplateVars::PROCESS_CONFIG_PATH, layout.process_config_path.as_str()),
        (TemplateVars::PROCESS, PROCESS),
    ]
}

pub fn nginx_site(config: &ProvisioningConfig, layout: &ServiceLayout) -> String {
    render(NGINX_SITE, &variables(config, layout))
}

pub fn systemd_unit(config: &ProvisioningConfig, layout: &ServiceLayout) -> String {
    render(SYSTEMD_UNIT, &variables(config, layout))
}

pub fn puma_config(config: &ProvisioningConfig, layout: &ServiceLayout) -> String {
    render(PUMA_CONFIG, &variables(config, layout))
}

pub fn launcher_script(config: &ProvisioningConfig, layout: &ServiceLayout) -> String {
    render(LAUNCHER, &variables(config, layout))
}
