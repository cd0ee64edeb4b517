// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

pub mod run;
pub mod show;
pub mod validate;

use {run::RunArgs, show::ShowArgs};

use std::path::Path;

use clap::{Parser, Subcommand};

use crate::{config::Settings, error::DeployError, fabric::Fabric};

/// A `HandledError` represents an error that has already been handled. When you call a function
/// that returns a `HandledError` or `HandledResult`, you don't need to do anything with that error,
/// other than just be aware that it happened, and return it on to your caller.
///
/// `main()` has a special responsibility: since its "caller" is, in a certain sense, the operating
/// system, `main()` must exit with the `exit_code` carried by the `HandledError`.
///
/// The primary way to construct a `HandledError` is with the `handle_err()` function, which turns a
/// generic error into a `HandledError`, and also runs some caller-provided code to handle the
/// error. That provided code would normally do something like report the error to stderr.
///
/// Apart from the exit status, a `HandledError` intentionally has no data about what the specific
/// error was; handling the error "consumes" that information.
#[derive(Debug, PartialEq)]
pub struct HandledError {
    pub exit_code: i32,
}

pub type HandledResult<T> = std::result::Result<T, HandledError>;

pub fn handled_error<T>(exit_code: i32) -> HandledResult<T> {
    HandledResult::Err(HandledError { exit_code })
}

/// Report a fatal error to stderr and turn it into a `HandledError` with the matching exit status.
pub fn fatal<E: Into<DeployError>>(err: E) -> HandledError {
    let err = err.into();
    eprintln!("{err}");
    HandledError {
        exit_code: err.exit_code(),
    }
}

pub trait Handle<T, F> {
    fn handle_err(self, exit_code: i32, handler: F) -> HandledResult<T>;
}

impl<T, E, F: FnOnce(E)> Handle<T, F> for std::result::Result<T, E> {
    /// Handle an error by running the provided `handler` code, giving it the error.
    ///
    /// Then, return a `HandledResult`, so that transitive callers of this function know that they
    /// do not need to do anything further to handle the error.
    fn handle_err(self, exit_code: i32, handler: F) -> HandledResult<T> {
        self.map_err(|e| {
            handler(e);
            HandledError { exit_code }
        })
    }
}

#[derive(Parser, Debug)]
#[command(version, about = "Storage fabric deployment tool", long_about = None)]
pub struct Cli {
    /// Path to the fabric description (TOML, or JSON with a .json extension).
    #[arg(long, global = true)]
    pub config: Option<String>,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Apply (or tear down) the fabric configuration.
    Run(RunArgs),
    /// Check the fabric description and print a summary.
    Validate,
    /// Print a recorded run.
    Show(ShowArgs),
}

/// Load and validate the fabric named by `--config`, reporting any problems to stderr.
fn load_fabric(cli: &Cli) -> HandledResult<Fabric> {
    let path = match &cli.config {
        Some(path) => path,
        None => &crate::default_config_path(),
    };
    Fabric::load(Path::new(path)).map_err(fatal)
}

/// The run record directory: `--record-dir`, then the fabric's `[settings]`, then the default.
fn record_dir(flag: Option<&str>, settings: Option<&Settings>) -> String {
    flag.map(String::from)
        .or_else(|| settings.and_then(|s| s.record_dir.clone()))
        .unwrap_or_else(crate::default_record_dir)
}

pub fn main(cli: &Cli) -> HandledResult<()> {
    match &cli.command {
        Commands::Run(args) => run::run(cli, args),
        Commands::Validate => validate::validate(cli),
        Commands::Show(args) => show::show(cli, args),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_err_keeps_exit_code() {
        let mut seen = None;
        let res: Result<(), &str> = Err("boom");
        let handled = res.handle_err(3, |e| seen = Some(e));
        assert_eq!(handled, Err(HandledError { exit_code: 3 }));
        assert_eq!(seen, Some("boom"));
    }

    #[test]
    fn record_dir_precedence() {
        let settings = Settings {
            record_dir: Some("/srv/xidis/runs".to_string()),
            ..Default::default()
        };
        assert_eq!(record_dir(Some("/tmp/runs"), Some(&settings)), "/tmp/runs");
        assert_eq!(record_dir(None, Some(&settings)), "/srv/xidis/runs");
        assert_eq!(
            record_dir(None, Some(&Settings::default())),
            crate::default_record_dir()
        );
        assert_eq!(record_dir(None, None), crate::default_record_dir());
    }

    #[test]
    fn parses_run_flags() {
        let cli = Cli::parse_from([
            "xidis",
            "--config",
            "fabric.toml",
            "run",
            "--limit",
            "stor01,agg01",
            "--phase",
            "opus_raid",
            "--dry-run",
            "--teardown",
            "--workers",
            "4",
        ]);
        let Commands::Run(args) = cli.command else {
            panic!("expected run command");
        };
        assert_eq!(
            args.limit,
            Some(vec!["stor01".to_string(), "agg01".to_string()])
        );
        assert_eq!(args.phase.as_deref(), Some("opus_raid"));
        assert!(args.dry_run && args.teardown);
        assert_eq!(args.workers, Some(4));
        assert_eq!(cli.config.as_deref(), Some("fabric.toml"));
    }
}
