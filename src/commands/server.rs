use clap::Args;
use serde::Serialize;

use caput::local_files::AppDir;
use caput::provision::{ProvisionReport, Provisioner};
use caput::secrets::RailsCredentials;
use caput::ssh::SshTransport;

use super::{load_config, CmdResult, GlobalArgs};

#[derive(Args)]
pub struct ServerArgs {}

#[derive(Debug, Serialize)]
pub struct ServerOutput {
    pub command: &'static str,
    pub report: ProvisionReport,
    pub next_steps: Vec<String>,
}

pub fn run(_args: ServerArgs, global: &GlobalArgs) -> CmdResult<ServerOutput> {
    let config = load_config(global)?;
    let app_dir = AppDir::new(&global.app_dir);
    let secrets = RailsCredentials::new(app_dir.clone());

    let report = Provisioner::new(&config, SshTransport::new(), &secrets, &app_dir).run()?;

    let repository = config
        .repo_url
        .as_deref()
        .unwrap_or("the application repository");
    let next_steps = vec![format!(
        "Verify that {}@{} can read {} before deploying",
        config.deploy_user, config.server, repository
    )];

    Ok((
        ServerOutput {
            command: "server",
            report,
            next_steps,
        },
        0,
    ))
}
