//! Reference job-ingest tool (§6): reads a job's start/end window and a
//! component-id file, then drives the `sos` library to build the
//! `CompTime` and `JobComp` compound indices.

use std::process::ExitCode;

use clap::Parser;

use sos::{cli, error::Error};

fn main() -> ExitCode {
    env_logger::init();

    let args = cli::Args::parse();
    match cli::run(&args) {
        Ok(()) => ExitCode::from(cli::exit_code::SUCCESS as u8),
        Err(err) => {
            log::error!("bwxjobadd failed: {}", err);
            let code = match &err {
                Error::InvalidArgument(msg) if msg.starts_with("index_open_failure") => {
                    cli::exit_code::INDEX_OPEN_FAILURE
                }
                _ => err.errno(),
            };
            ExitCode::from(code.clamp(0, 255) as u8)
        }
    }
}
