// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use clap::Parser;

use xidis_lib::commands::{self, Cli};

/// The xidis binary configures (or tears down) a storage fabric from its description.
fn main() {
    let args = Cli::parse();

    let default_filter = if args.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().filter_or("XIDIS_LOG", default_filter))
        .init();

    if let Err(e) = commands::main(&args) {
        std::process::exit(e.exit_code);
    }
}
