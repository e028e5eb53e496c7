use clap::Args;
use serde::Serialize;

use caput::config::{self, InitOutcome};
use caput::log_status;

use super::{CmdResult, GlobalArgs};

#[derive(Args)]
pub struct InitArgs {}

#[derive(Debug, Serialize)]
pub struct InitOutput {
    pub command: &'static str,
    pub path: String,
    pub outcome: InitOutcome,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub next_steps: Vec<String>,
}

pub fn run(_args: InitArgs, global: &GlobalArgs) -> CmdResult<InitOutput> {
    let path = global.config.display().to_string();
    let outcome = config::init_config(&global.config)?;

    let next_steps = match outcome {
        InitOutcome::Created => {
            log_status!("init", "Wrote sample configuration to {}", path);
            vec![
                format!("Edit {} for your application and server", path),
                "Run 'caput check' to verify the server is ready".to_string(),
            ]
        }
        InitOutcome::AlreadyExists => {
            log_status!("init", "{} already exists, leaving it unchanged", path);
            Vec::new()
        }
    };

    Ok((
        InitOutput {
            command: "init",
            path,
            outcome,
            next_steps,
        },
        0,
    ))
}
