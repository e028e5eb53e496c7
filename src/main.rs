use clap::{Parser, Subcommand};

use commands::GlobalArgs;

mod commands;
mod output;
mod tty;

use commands::{check, init, server, teardown};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "caput")]
#[command(version = VERSION)]
#[command(about = "Provision and tear down a Rails application host over SSH")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a sample caput.conf
    Init(init::InitArgs),
    /// Check server dependencies and passwordless sudo without changing anything
    Check(check::CheckArgs),
    /// Prepare the server: packages, deploy user, nginx, systemd, database and Ruby
    Server(server::ServerArgs),
    /// Remove the app's systemd unit and nginx site from the server
    Teardown(teardown::TeardownArgs),
}

fn main() -> std::process::ExitCode {
    let cli = Cli::parse();

    let (json_result, exit_code) = commands::run_json(cli.command, &cli.global);

    if let Err(err) = output::print_json_result(json_result) {
        eprintln!("{}", err.diagnostic());
        return std::process::ExitCode::from(1);
    }

    std::process::ExitCode::from(exit_code_to_u8(exit_code))
}

fn exit_code_to_u8(code: i32) -> u8 {
    if code <= 0 {
        0
    } else if code >= 255 {
        255
    } else {
        code as u8
    }
}
