use clap::Args;
use serde::Serialize;

use caput::local_files::AppDir;
use caput::provision::{ProvisionReport, Provisioner};
use caput::secrets::RailsCredentials;
use caput::ssh::SshTransport;

use super::{load_config, CmdResult, GlobalArgs};

#[derive(Args)]
pub struct CheckArgs {}

#[derive(Debug, Serialize)]
pub struct CheckOutput {
    pub command: &'static str,
    pub report: ProvisionReport,
}

pub fn run(_args: CheckArgs, global: &GlobalArgs) -> CmdResult<CheckOutput> {
    let config = load_config(global)?;
    let app_dir = AppDir::new(&global.app_dir);
    let secrets = RailsCredentials::new(app_dir.clone());

    let report = Provisioner::new(&config, SshTransport::new(), &secrets, &app_dir).check()?;

    Ok((
        CheckOutput {
            command: "check",
            report,
        },
        0,
    ))
}
