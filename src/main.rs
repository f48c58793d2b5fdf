#![forbid(unsafe_code)]

//! remedy: incident remediation policy CLI entry point.

use clap::Parser;

mod cli_app;

fn main() {
    let args = cli_app::Cli::parse();
    if let Err(e) = cli_app::run(&args) {
        eprintln!("remedy: {e}");
        std::process::exit(e.exit_code());
    }
}
