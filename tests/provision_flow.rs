mod common;

use std::cell::Cell;

use caput::provision::{Provisioner, Step, StepOutcome};
use caput::ssh::ChannelOutcome;
use caput::ErrorCode;
use common::{
    app_dir_with_master_key, blog_config, empty_app_dir, Call, FakeTransport, NoSecrets,
    staged, StaticSecrets, FRESH_HOST, MASTER_KEY, STAGING_DIR,
};

fn blog_secrets() -> StaticSecrets {
    StaticSecrets::new("blog_production", "blog", "s3cret")
}

#[test]
fn fresh_host_runs_every_step_in_order() {
    let config = blog_config();
    let (_dir, app_dir) = app_dir_with_master_key();
    let secrets = blog_secrets();
    let host = FakeTransport::fresh_host();

    let report = Provisioner::new(&config, &host, &secrets, &app_dir)
        .run()
        .expect("provisioning succeeds");

    let master_key = staged("blog.master.key");
    let site = staged("blog.nginx");
    let unit = staged("blog-puma.service");
    let puma = staged("blog-puma.rb");
    let start = staged("blog-start_puma.sh");
    let milestones = [
        "sudo apt-get update",
        "sudo adduser",
        "sudo install -m 600",
        "sudo mkdir -p",
        master_key.as_str(),
        "CREATE DATABASE",
        site.as_str(),
        "sudo ln -sf",
        "sudo nginx -t",
        "sudo systemctl reload nginx",
        unit.as_str(),
        "sudo systemctl daemon-reload",
        "sudo systemctl enable",
        "sudo install -d -m 755",
        puma.as_str(),
        start.as_str(),
        "git clone https://github.com/rbenv/rbenv.git",
        "rbenv install 3.2.2",
        "rbenv global 3.2.2",
        ">> ~/.bashrc",
        "gem install bundler",
    ];
    let positions: Vec<usize> = milestones
        .iter()
        .map(|needle| {
            host.position(needle)
                .unwrap_or_else(|| panic!("never ran: {}", needle))
        })
        .collect();
    for (pair, names) in positions.windows(2).zip(milestones.windows(2)) {
        assert!(pair[0] < pair[1], "{} ran after {}", names[0], names[1]);
    }

    for step in [
        Step::DeployAccount,
        Step::DeployKeys,
        Step::DirectoryLayout,
        Step::Secrets,
        Step::Database,
        Step::ProxySite,
        Step::SupervisorUnit,
        Step::ProcessManager,
        Step::Runtime,
    ] {
        assert_eq!(report.outcome_of(step), Some(StepOutcome::Applied), "{:?}", step);
    }
    assert_eq!(report.outcome_of(Step::Dependencies), Some(StepOutcome::Passed));
    assert_eq!(report.outcome_of(Step::Privileges), Some(StepOutcome::Passed));
    assert_eq!(report.steps.len(), 13);
    assert!(report.finished_at.is_some());
}

#[test]
fn every_upload_is_followed_by_its_chmod() {
    let config = blog_config();
    let (_dir, app_dir) = app_dir_with_master_key();
    let secrets = blog_secrets();
    let host = FakeTransport::fresh_host();

    Provisioner::new(&config, &host, &secrets, &app_dir)
        .run()
        .expect("provisioning succeeds");

    let calls = host.calls();
    let mut uploads = 0;
    for (index, call) in calls.iter().enumerate() {
        if let Call::Copy { remote_path, .. } = call {
            uploads += 1;
            match calls.get(index + 1) {
                Some(Call::Exec { script, .. }) => {
                    assert!(script.starts_with("chmod "), "{}", script);
                    assert!(script.ends_with(&format!("'{}'", remote_path)), "{}", script);
                }
                other => panic!("upload of {} followed by {:?}", remote_path, other),
            }
        }
    }
    assert_eq!(uploads, 5);
    assert!(host.ran(&format!("chmod 400 '{}'", staged("blog.master.key"))));
    assert!(host.ran(&format!("chmod 755 '{}'", staged("blog-start_puma.sh"))));
}

#[test]
fn uploaded_documents_are_rendered_for_the_app() {
    let config = blog_config();
    let (_dir, app_dir) = app_dir_with_master_key();
    let secrets = blog_secrets();
    let host = FakeTransport::fresh_host();

    Provisioner::new(&config, &host, &secrets, &app_dir)
        .run()
        .expect("provisioning succeeds");

    let site = host.copied(&staged("blog.nginx")).expect("nginx site uploaded");
    assert!(site.contains("server_name blog.example.com;"));
    assert!(site.contains("proxy_pass http://unix:/var/www/blog/shared/tmp/sockets/puma.sock;"));

    let unit = host.copied(&staged("blog-puma.service")).expect("unit uploaded");
    assert!(unit.contains("WorkingDirectory=/var/www/blog/current\n"));
    assert!(unit.contains("User=deploy\n"));

    assert_eq!(host.copied(&staged("blog.master.key")).as_deref(), Some(MASTER_KEY));

    assert!(host.ran(&format!(
        "sudo mv -f '{}' '/etc/nginx/sites-available/blog'\nsudo chown root:root '/etc/nginx/sites-available/blog'",
        staged("blog.nginx")
    )));
    assert!(host.ran("sudo chown deploy:deploy '/var/www/blog/shared/config/master.key'"));
}

#[test]
fn runtime_is_installed_as_the_deploy_user() {
    let config = blog_config();
    let (_dir, app_dir) = app_dir_with_master_key();
    let secrets = blog_secrets();
    let host = FakeTransport::fresh_host();

    Provisioner::new(&config, &host, &secrets, &app_dir)
        .run()
        .expect("provisioning succeeds");

    assert_eq!(host.target_of("rbenv install 3.2.2").as_deref(), Some("deploy@203.0.113.7"));
    assert_eq!(host.target_of("gem install bundler").as_deref(), Some("deploy@203.0.113.7"));
    assert_eq!(host.target_of("sudo adduser").as_deref(), Some("setup@203.0.113.7"));
}

#[test]
fn second_run_changes_nothing() {
    let config = blog_config();
    let (_dir, app_dir) = app_dir_with_master_key();
    let secrets = blog_secrets();
    let host = FakeTransport::provisioned_host();

    let report = Provisioner::new(&config, &host, &secrets, &app_dir)
        .run()
        .expect("provisioning succeeds");

    assert!(host.copies().is_empty());
    assert!(!host.ran("mktemp"));
    for mutation in [
        "sudo adduser",
        "sudo install",
        "sudo mkdir",
        "CREATE DATABASE",
        "sudo ln -sf",
        "sudo systemctl reload nginx",
        "daemon-reload",
        "sudo systemctl enable",
        "git clone",
        "rbenv install",
        ">> ~/.bashrc",
        "gem install",
    ] {
        assert!(!host.ran(mutation), "re-ran {}", mutation);
    }
    // The proxy configuration is still validated on every run.
    assert!(host.ran("sudo nginx -t"));
    assert_eq!(report.outcome_of(Step::ProxySite), Some(StepOutcome::AlreadyPresent));
    assert_eq!(report.outcome_of(Step::Runtime), Some(StepOutcome::AlreadyPresent));
}

#[test]
fn failed_account_creation_stops_the_run() {
    let config = blog_config();
    let (_dir, app_dir) = app_dir_with_master_key();
    let secrets = blog_secrets();
    let host = FakeTransport::fresh_host_with(&[("sudo adduser", 1)]);

    let err = Provisioner::new(&config, &host, &secrets, &app_dir)
        .run()
        .unwrap_err();

    assert_eq!(err.code, ErrorCode::RemoteCommandFailed);
    assert_eq!(err.details["exitCode"], 1);
    assert!(err.message.contains("sudo adduser --disabled-password"));
    match host.calls().last() {
        Some(Call::Exec { script, .. }) => assert!(script.starts_with("sudo adduser")),
        other => panic!("unexpected last call {:?}", other),
    }
}

#[test]
fn package_install_failure_is_tolerated() {
    let config = blog_config();
    let (_dir, app_dir) = app_dir_with_master_key();
    let secrets = blog_secrets();
    let host = FakeTransport::fresh_host_with(&[("apt-get install", 100)]);

    let report = Provisioner::new(&config, &host, &secrets, &app_dir)
        .run()
        .expect("provisioning continues past package failures");

    assert_eq!(report.outcome_of(Step::SystemPackages), Some(StepOutcome::Tolerated));
    assert!(host.ran("sudo adduser"));
}

#[test]
fn dropped_connection_is_never_tolerated() {
    let config = blog_config();
    let (_dir, app_dir) = app_dir_with_master_key();
    let secrets = blog_secrets();
    let host = FakeTransport::new(|script| {
        if script.contains("apt-get install") {
            ChannelOutcome::dropped("Connection reset by peer")
        } else {
            fresh_outcome(script)
        }
    });

    let err = Provisioner::new(&config, &host, &secrets, &app_dir)
        .run()
        .unwrap_err();

    assert_eq!(err.code, ErrorCode::RemoteChannelClosed);
    assert_eq!(err.details["reason"], "Connection reset by peer");
    assert!(!host.ran("sudo adduser"));
}

fn fresh_outcome(script: &str) -> ChannelOutcome {
    let code = FRESH_HOST
        .iter()
        .find(|(pattern, _)| script.contains(pattern))
        .map(|(_, code)| *code)
        .unwrap_or(0);
    ChannelOutcome::exited(code)
}

#[test]
fn missing_database_server_fails_preflight() {
    let config = blog_config();
    let (_dir, app_dir) = app_dir_with_master_key();
    let secrets = blog_secrets();
    let host = FakeTransport::fresh_host_with(&[("command -v mysql", 1)]);

    let err = Provisioner::new(&config, &host, &secrets, &app_dir)
        .run()
        .unwrap_err();

    assert_eq!(err.code, ErrorCode::DependencyMissing);
    assert_eq!(err.details["dependency"], "MySQL/MariaDB");
    assert_eq!(host.calls().len(), 1);
}

#[test]
fn missing_passwordless_sudo_suggests_sudoers_entry() {
    let config = blog_config();
    let (_dir, app_dir) = app_dir_with_master_key();
    let secrets = blog_secrets();
    let host = FakeTransport::fresh_host_with(&[("sudo -n true", 1)]);

    let err = Provisioner::new(&config, &host, &secrets, &app_dir)
        .run()
        .unwrap_err();

    assert_eq!(err.code, ErrorCode::PrivilegeEscalationUnavailable);
    assert!(err.hints[0].message.contains("setup ALL=(ALL) NOPASSWD:ALL"));
    assert!(!host.ran("apt-get"));
}

#[test]
fn database_password_is_escaped_for_sql_and_shell() {
    let config = blog_config();
    let (_dir, app_dir) = app_dir_with_master_key();
    let secrets = StaticSecrets::new("blog_production", "blog", "p\"$1");
    let host = FakeTransport::fresh_host();

    Provisioner::new(&config, &host, &secrets, &app_dir)
        .run()
        .expect("provisioning succeeds");

    let bootstrap = host
        .scripts()
        .into_iter()
        .find(|script| script.starts_with("sudo mysql -e "))
        .expect("bootstrap ran");
    assert!(bootstrap.contains("IDENTIFIED BY 'p\\\"\\$1';"), "{}", bootstrap);
    assert!(bootstrap.contains("CREATE DATABASE IF NOT EXISTS \\`blog_production\\`;"));
}

#[test]
fn failed_bootstrap_does_not_report_the_password() {
    let config = blog_config();
    let (_dir, app_dir) = app_dir_with_master_key();
    let secrets = blog_secrets();
    let host = FakeTransport::fresh_host_with(&[("sudo mysql -e", 1)]);

    let err = Provisioner::new(&config, &host, &secrets, &app_dir)
        .run()
        .unwrap_err();

    assert_eq!(err.code, ErrorCode::RemoteCommandFailed);
    assert_eq!(err.details["command"], "sudo mysql -e \"[REDACTED]\"");
    assert!(!err.message.contains("s3cret"));
    assert!(!host.ran(&staged("blog.nginx")));
}

#[test]
fn unavailable_secrets_stop_before_the_proxy() {
    let config = blog_config();
    let (_dir, app_dir) = app_dir_with_master_key();
    let host = FakeTransport::fresh_host();

    let err = Provisioner::new(&config, &host, &NoSecrets, &app_dir)
        .run()
        .unwrap_err();

    assert_eq!(err.code, ErrorCode::SecretsUnavailable);
    assert!(host.copied(&staged("blog.nginx")).is_none());
}

#[test]
fn missing_master_key_skips_the_upload() {
    let config = blog_config();
    let (_dir, app_dir) = empty_app_dir();
    let secrets = blog_secrets();
    let host = FakeTransport::fresh_host();

    let report = Provisioner::new(&config, &host, &secrets, &app_dir)
        .run()
        .expect("provisioning succeeds");

    assert_eq!(report.outcome_of(Step::Secrets), Some(StepOutcome::Skipped));
    assert!(host.copied(&staged("blog.master.key")).is_none());
}

#[test]
fn invalid_proxy_configuration_is_not_reloaded() {
    let config = blog_config();
    let (_dir, app_dir) = app_dir_with_master_key();
    let secrets = blog_secrets();
    let host = FakeTransport::fresh_host_with(&[("sudo nginx -t", 1)]);

    let err = Provisioner::new(&config, &host, &secrets, &app_dir)
        .run()
        .unwrap_err();

    assert_eq!(err.code, ErrorCode::RemoteCommandFailed);
    assert!(!host.ran("sudo systemctl reload nginx"));
    assert!(!host.ran("daemon-reload"));
}

#[test]
fn check_only_runs_preflight() {
    let config = blog_config();
    let (_dir, app_dir) = app_dir_with_master_key();
    let secrets = blog_secrets();
    let host = FakeTransport::fresh_host();

    let report = Provisioner::new(&config, &host, &secrets, &app_dir)
        .check()
        .expect("preflight passes");

    assert_eq!(host.calls().len(), 3);
    assert!(host.copies().is_empty());
    assert_eq!(report.steps.len(), 3);
    assert_eq!(report.outcome_of(Step::Privileges), Some(StepOutcome::Passed));
}

#[test]
fn uploads_are_staged_in_a_private_directory() {
    let config = blog_config();
    let (_dir, app_dir) = app_dir_with_master_key();
    let secrets = blog_secrets();
    let host = FakeTransport::fresh_host();

    Provisioner::new(&config, &host, &secrets, &app_dir)
        .run()
        .expect("provisioning succeeds");

    let created = host.position("mktemp -d /tmp/caput.").expect("staging directory created");
    let first_copy = host
        .calls()
        .iter()
        .position(|call| matches!(call, Call::Copy { .. }))
        .expect("uploads happened");
    assert!(created < first_copy);
    assert_eq!(host.scripts().iter().filter(|s| s.contains("mktemp")).count(), 1);
    assert_eq!(host.target_of("mktemp").as_deref(), Some("setup@203.0.113.7"));
    for (remote_path, _) in host.copies() {
        assert!(remote_path.starts_with(&format!("{}/", STAGING_DIR)), "{}", remote_path);
    }
    match host.calls().last() {
        Some(Call::Exec { script, .. }) => {
            assert_eq!(script, &format!("rm -rf '{}'", STAGING_DIR))
        }
        other => panic!("unexpected last call {:?}", other),
    }
}

#[test]
fn staging_directory_is_removed_after_a_failed_install() {
    let config = blog_config();
    let (_dir, app_dir) = app_dir_with_master_key();
    let secrets = blog_secrets();
    let host = FakeTransport::fresh_host_with(&[("sudo mv -f", 1)]);

    let err = Provisioner::new(&config, &host, &secrets, &app_dir)
        .run()
        .unwrap_err();

    assert_eq!(err.code, ErrorCode::RemoteCommandFailed);
    assert!(host.copied(&staged("blog.master.key")).is_some());
    match host.calls().last() {
        Some(Call::Exec { script, .. }) => {
            assert_eq!(script, &format!("rm -rf '{}'", STAGING_DIR))
        }
        other => panic!("unexpected last call {:?}", other),
    }
}

#[test]
fn rerun_after_interrupted_install_is_not_blocked_by_leftover_upload() {
    let config = blog_config();
    let (_dir, app_dir) = app_dir_with_master_key();
    let secrets = blog_secrets();
    // The first move into place drops the connection, stranding the
    // read-only master key upload on the host.
    let interrupted = Cell::new(false);
    let host = FakeTransport::new(move |script| {
        if script.contains("sudo mv -f") && !interrupted.replace(true) {
            ChannelOutcome::dropped("Connection reset by peer")
        } else {
            fresh_outcome(script)
        }
    });

    let err = Provisioner::new(&config, &host, &secrets, &app_dir)
        .run()
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::RemoteChannelClosed);
    let leftover = staged("blog.master.key");
    assert!(host.copied(&leftover).is_some());

    let report = Provisioner::new(&config, &host, &secrets, &app_dir)
        .run()
        .expect("rerun succeeds despite the leftover upload");

    assert_eq!(report.outcome_of(Step::Secrets), Some(StepOutcome::Applied));
    assert_eq!(
        host.copied("/tmp/caput.run2/blog.master.key").as_deref(),
        Some(MASTER_KEY)
    );
    let leftover_copies = host
        .copies()
        .iter()
        .filter(|(path, _)| *path == leftover)
        .count();
    assert_eq!(leftover_copies, 1);
}

#[test]
fn unreadable_staging_directory_stops_before_uploading() {
    let config = blog_config();
    let (_dir, app_dir) = app_dir_with_master_key();
    let secrets = blog_secrets();
    let host = FakeTransport::new(|script| {
        if script.starts_with("mktemp -d") {
            ChannelOutcome::exited(0).with_stdout("mktemp: not a path\n")
        } else {
            fresh_outcome(script)
        }
    });

    let err = Provisioner::new(&config, &host, &secrets, &app_dir)
        .run()
        .unwrap_err();

    assert_eq!(err.code, ErrorCode::InternalUnexpected);
    assert!(host.copies().is_empty());
    assert!(!host.ran("rm -rf"));
}
