//! fmupool worker process
//!
//! Spawned by `SimulationPool`; speaks the frame protocol on stdin/stdout and
//! logs to stderr. Log verbosity comes from `FMUPOOL_LOG` (default `warn`).

use std::process::ExitCode;

use tracing_subscriber::EnvFilter;

use fmupool::reference::ReferenceLoader;
use fmupool::worker::serve_stdio;

const LOG_ENV: &str = "FMUPOOL_LOG";

fn parse_args() {
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--help" | "-h" => {
                println!("fmupool-worker - simulation worker process");
                println!();
                println!("USAGE:");
                println!("    fmupool-worker");
                println!();
                println!("Reads commands from stdin and writes replies to stdout.");
                println!("Not meant to be run by hand; SimulationPool spawns it.");
                println!();
                println!("ENVIRONMENT:");
                println!("    {LOG_ENV}    Log filter [default: warn]");
                std::process::exit(0);
            }
            other => {
                eprintln!("error: unknown argument: {other}");
                std::process::exit(2);
            }
        }
    }
}

fn main() -> ExitCode {
    parse_args();

    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    match serve_stdio(ReferenceLoader) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(%err, "worker stopped");
            ExitCode::FAILURE
        }
    }
}
