use clap::Args;
use serde::Serialize;

use caput::ssh::SshTransport;
use caput::teardown::{Teardown, TeardownReport};

use super::{load_config, CmdResult, GlobalArgs};

#[derive(Args)]
pub struct TeardownArgs {}

#[derive(Debug, Serialize)]
pub struct TeardownOutput {
    pub command: &'static str,
    pub report: TeardownReport,
}

pub fn run(_args: TeardownArgs, global: &GlobalArgs) -> CmdResult<TeardownOutput> {
    let config = load_config(global)?;
    let report = Teardown::new(&config, SshTransport::new()).run()?;

    Ok((
        TeardownOutput {
            command: "teardown",
            report,
        },
        0,
    ))
}
