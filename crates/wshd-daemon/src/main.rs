use std::process::ExitCode;

use clap::Parser as _;
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _};

mod bootstrap;
mod cli;
mod exec;
mod hooks;
mod init;
mod mount;
mod reaper;
mod serve;
mod state;

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .try_init()
        .ok();

    // Re-entry in the container, after the pivot and exec: everything this
    // process needs rides in on the handoff descriptor.
    let args: Vec<String> = std::env::args().collect();
    if cli::is_continuation(&args) {
        // serve::run never returns; reaching here means a fatal setup error.
        let error = init::continue_daemon().unwrap_err();
        tracing::error!(?error, "container init failed");
        eprintln!("wshd: {error:#}");
        return ExitCode::FAILURE;
    }

    let cli = match cli::Cli::try_parse() {
        Ok(cli) => cli,
        Err(error)
            if matches!(
                error.kind(),
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion
            ) =>
        {
            print!("{error}");
            return ExitCode::SUCCESS;
        }
        Err(error) => {
            eprint!("{error}");
            return ExitCode::FAILURE;
        }
    };

    let config = match cli.validate() {
        Ok(config) => config,
        Err(error) => {
            eprintln!("wshd: {error}");
            return ExitCode::FAILURE;
        }
    };

    match bootstrap::run(&config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(?error, "bootstrap failed");
            eprintln!("wshd: {error:#}");
            ExitCode::FAILURE
        }
    }
}
