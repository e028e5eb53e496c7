use clap::Args;
use std::path::PathBuf;

use caput::config::{ProvisioningConfig, Settings, CONFIG_FILE};

pub type CmdResult<T> = caput::Result<(T, i32)>;

/// Options shared by every subcommand.
#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    /// Configuration file to read
    #[arg(long, global = true, value_name = "PATH", default_value = CONFIG_FILE)]
    pub config: PathBuf,

    /// Local application root holding config/master.key and config/credentials.yml.enc
    #[arg(long, global = true, value_name = "DIR", default_value = ".")]
    pub app_dir: PathBuf,
}

/// Read the configuration file and resolve it into provisioning settings.
pub(crate) fn load_config(global: &GlobalArgs) -> caput::Result<ProvisioningConfig> {
    let settings = Settings::load(&global.config)?;
    let config = ProvisioningConfig::resolve(&settings)?;

    for key in config.extra.keys() {
        eprintln!("warning: ignoring unrecognized key {} in {}", key, global.config.display());
    }
    Ok(config)
}

pub mod check;
pub mod init;
pub mod server;
pub mod teardown;

/// Dispatch a command to its handler and map result to JSON.
macro_rules! dispatch {
    ($args:expr, $global:expr, $module:ident) => {
        crate::output::map_cmd_result_to_json($module::run($args, $global))
    };
}

pub(crate) fn run_json(
    command: crate::Commands,
    global: &GlobalArgs,
) -> (caput::Result<serde_json::Value>, i32) {
    crate::tty::status("caput is working...");

    match command {
        crate::Commands::Init(args) => dispatch!(args, global, init),
        crate::Commands::Check(args) => dispatch!(args, global, check),
        crate::Commands::Server(args) => dispatch!(args, global, server),
        crate::Commands::Teardown(args) => dispatch!(args, global, teardown),
    }
}
