//! Teardown: remove the app's service and nginx site from the host.
//!
//! Every command is best-effort so the run succeeds against a host that was
//! only partly provisioned or already torn down. The proxy is reloaded only
//! when the remaining configuration still validates.

use chrono::Utc;
use serde::Serialize;

use crate::config::ProvisioningConfig;
use crate::error::Result;
use crate::executor::{FailurePolicy, RemoteExecutor};
use crate::provision::{StepOutcome, StepRecord};
use crate::script::Line;
use crate::ssh::{RemoteTarget, Transport};
use crate::templates::ServiceLayout;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TeardownAction {
    StopService,
    DisableService,
    RemoveUnit,
    ReloadSupervisor,
    RemoveSiteAvailable,
    RemoveSiteEnabled,
    ValidateProxy,
    ReloadProxy,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TeardownReport {
    pub app_name: String,
    pub target: String,
    pub steps: Vec<StepRecord<TeardownAction>>,
    pub started_at: String,
    pub finished_at: String,
}

impl TeardownReport {
    pub fn outcome_of(&self, action: TeardownAction) -> Option<StepOutcome> {
        self.steps
            .iter()
            .find(|record| record.step == action)
            .map(|record| record.outcome)
    }
}

pub struct Teardown<'a, T> {
    config: &'a ProvisioningConfig,
    executor: RemoteExecutor<T>,
    layout: ServiceLayout,
    setup: RemoteTarget,
}

impl<'a, T: Transport> Teardown<'a, T> {
    pub fn new(config: &'a ProvisioningConfig, transport: T) -> Self {
        Self {
            executor: RemoteExecutor::new(transport),
            layout: ServiceLayout::new(config),
            setup: config.setup_target(),
            config,
        }
    }

    fn commands(&self) -> [(TeardownAction, String); 8] {
        let unit = &self.layout.unit_name;
        [
            (
                TeardownAction::StopService,
                Line::new("sudo systemctl stop ").arg(unit).build(),
            ),
            (
                TeardownAction::DisableService,
                Line::new("sudo systemctl disable ").arg(unit).build(),
            ),
            (
                TeardownAction::RemoveUnit,
                Line::new("sudo rm -f ").path(&self.layout.unit_path).build(),
            ),
            (
                TeardownAction::ReloadSupervisor,
                "sudo systemctl daemon-reload".to_string(),
            ),
            (
                TeardownAction::RemoveSiteAvailable,
                Line::new("sudo rm -f ").path(&self.layout.site_available).build(),
            ),
            (
                TeardownAction::RemoveSiteEnabled,
                Line::new("sudo rm -f ").path(&self.layout.site_enabled).build(),
            ),
            (TeardownAction::ValidateProxy, "sudo nginx -t".to_string()),
            (
                TeardownAction::ReloadProxy,
                "sudo systemctl reload nginx".to_string(),
            ),
        ]
    }

    /// Runs every teardown command in order. Only a dropped connection is an error.
    pub fn run(&self) -> Result<TeardownReport> {
        let started_at = Utc::now().to_rfc3339();
        log_status!(
            "teardown",
            "Tearing down {} on {}",
            self.config.app_name,
            self.setup
        );

        let mut steps = Vec::new();
        let mut proxy_valid = true;

        for (action, script) in self.commands() {
            if action == TeardownAction::ReloadProxy && !proxy_valid {
                eprintln!("warning: nginx configuration does not validate; not reloading nginx");
                steps.push(StepRecord {
                    step: action,
                    outcome: StepOutcome::Skipped,
                    note: Some("nginx -t failed".to_string()),
                });
                continue;
            }

            let result = self
                .executor
                .execute_with(&self.setup, &script, FailurePolicy::BestEffort)?;
            if action == TeardownAction::ValidateProxy {
                proxy_valid = result.success();
            }

            steps.push(StepRecord {
                step: action,
                outcome: if result.success() {
                    StepOutcome::Applied
                } else {
                    StepOutcome::Tolerated
                },
                note: (!result.success()).then(|| format!("exit {}", result.exit_code)),
            });
        }

        log_status!("teardown", "Teardown complete");
        Ok(TeardownReport {
            app_name: self.config.app_name.clone(),
            target: self.setup.to_string(),
            steps,
            started_at,
            finished_at: Utc::now().to_rfc3339(),
        })
    }
}
