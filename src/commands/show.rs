// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::path::Path;

use clap::Args;

use crate::{
    commands::{fatal, record_dir, Cli, HandledResult},
    config::Config,
    record::{PhaseResult, RunLog},
};

#[derive(Args, Debug, Clone)]
pub struct ShowArgs {
    /// The run to print.
    run_id: u64,

    /// Directory holding run records.
    #[arg(long)]
    record_dir: Option<String>,

    /// Only print failed results.
    #[arg(short = 'x')]
    failures_only: bool,
}

pub fn show(cli: &Cli, args: &ShowArgs) -> HandledResult<()> {
    // Only the settings matter here, so the fabric itself need not be valid. Without --config
    // the default fabric file is consulted if there is one.
    let path = match &cli.config {
        Some(path) => Some(path.clone()),
        None => Some(crate::default_config_path()).filter(|p| Path::new(p).exists()),
    };
    let config = match path {
        Some(path) => Some(Config::from_file(Path::new(&path)).map_err(fatal)?),
        None => None,
    };
    let record_dir = record_dir(
        args.record_dir.as_deref(),
        config.as_ref().map(|c| &c.settings),
    );

    let log = RunLog::load(Path::new(&record_dir), args.run_id).map_err(fatal)?;

    match &log.header {
        Some(header) => println!(
            "Run {} started {}: {}{} over [{}] on [{}]{}",
            header.run_id,
            header.timestamp.format("%Y-%m-%dT%H:%M:%SZ"),
            header.direction,
            if header.dry_run { " (dry run)" } else { "" },
            header
                .phases
                .iter()
                .map(|p| p.to_string())
                .collect::<Vec<_>>()
                .join(", "),
            header.hosts.join(", "),
            match header.resumed_from {
                Some(prev) => format!(", resuming run {prev}"),
                None => String::new(),
            }
        ),
        None => println!("Run {}: no start entry", args.run_id),
    }

    for result in log.results.iter() {
        if args.failures_only && result.outcome != crate::record::Outcome::Failed {
            continue;
        }
        println!("  {}", result_line(result));
    }

    match &log.summary {
        Some(summary) => println!(
            "{:?} at {}: {} succeeded, {} skipped, {} failed{}",
            summary.outcome,
            summary.timestamp.format("%Y-%m-%dT%H:%M:%SZ"),
            summary.succeeded,
            summary.skipped,
            summary.failed,
            if summary.failed_hosts.is_empty() {
                String::new()
            } else {
                format!(" ({})", summary.failed_hosts.join(", "))
            }
        ),
        None => println!("No summary: the run did not finish."),
    }

    Ok(())
}

fn result_line(result: &PhaseResult) -> String {
    format!(
        "{} {:<18} {:<10} {:?}{}",
        result.timestamp.format("%H:%M:%S%.3f"),
        result.phase.to_string(),
        result.host.as_deref().unwrap_or("-"),
        result.outcome,
        match &result.message {
            Some(msg) => format!(": {msg}"),
            None => String::new(),
        }
    )
}
