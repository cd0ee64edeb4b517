// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::{path::Path, sync::Arc, time::Duration};

use clap::Args;

use crate::{
    commands::{fatal, handled_error, load_fabric, record_dir, Cli, Handle, HandledResult},
    engine::{EngineOptions, PipelineEngine},
    error::{EXIT_GENERAL, EXIT_VALIDATION},
    executor::ScriptExecutor,
    record::{Outcome, RunLog, RunOutcome, RunRecord, RunRecorder},
    scope::ScopeRequest,
};

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Comma separated list of hosts to limit the run to.
    #[arg(long, value_delimiter = ',')]
    pub limit: Option<Vec<String>>,

    /// Run only this phase.
    #[arg(long)]
    pub phase: Option<String>,

    /// Report what would be done without changing anything.
    #[arg(long)]
    pub dry_run: bool,

    /// Remove the configuration described by the fabric file.
    #[arg(long)]
    pub teardown: bool,

    /// Number of hosts to work on concurrently within a phase.
    #[arg(long)]
    pub workers: Option<usize>,

    /// Timeout, in seconds, for each operation on a host.
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Directory holding run records.
    #[arg(long)]
    pub record_dir: Option<String>,

    /// Skip hosts that completed every requested phase in this earlier run.
    #[arg(long)]
    pub resume: Option<u64>,
}

pub fn run(cli: &Cli, args: &RunArgs) -> HandledResult<()> {
    let fabric = load_fabric(cli)?;

    let mut options = EngineOptions::from_settings(&fabric.settings);
    if let Some(workers) = args.workers {
        options.workers = workers;
    }
    if let Some(secs) = args.timeout {
        options.operation_timeout = Duration::from_secs(secs);
    }
    if options.workers == 0 {
        eprintln!("--workers must be at least 1.");
        return handled_error(EXIT_VALIDATION);
    }

    let record_dir = record_dir(args.record_dir.as_deref(), Some(&fabric.settings));
    let record_dir = Path::new(&record_dir);

    let resume = match args.resume {
        Some(run_id) => Some(
            RunLog::load(record_dir, run_id).map_err(fatal)?,
        ),
        None => None,
    };

    let request = ScopeRequest {
        limit: args.limit.clone(),
        phase: args.phase.clone(),
        dry_run: args.dry_run,
        teardown: args.teardown,
        resume,
    };

    let executor = Arc::new(ScriptExecutor::from_settings(&fabric.settings));
    let engine = PipelineEngine::new(executor, options);

    // Resolve before allocating a record, so a rejected scope leaves nothing behind.
    let scope = engine.resolve(&fabric, &request).map_err(fatal)?;

    let recorder = RunRecorder::create(record_dir).map_err(fatal)?;

    let rt = tokio::runtime::Runtime::new()
        .handle_err(EXIT_GENERAL, |e| eprintln!("Error launching tokio runtime: {e}"))?;

    let record = rt.block_on(async {
        let token = engine.cancellation_token();
        let interrupt = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("Interrupted: waiting for running operations to finish...");
                token.cancel();
            }
        });

        let record = engine.execute(&fabric, &scope, &recorder).await;
        interrupt.abort();
        record
    });

    print_report(&record, recorder.path());
    if recorder.write_failures() > 0 {
        eprintln!(
            "Warning: {} entries could not be written to the run record.",
            recorder.write_failures()
        );
    }

    match record.outcome {
        RunOutcome::Succeeded => Ok(()),
        _ => handled_error(record.exit_code()),
    }
}

fn print_report(record: &RunRecord, path: Option<&Path>) {
    let verb = if record.dry_run { "Dry run" } else { "Run" };
    println!(
        "{verb} {} ({}): {:?}: {} succeeded, {} skipped, {} failed.",
        record.run_id,
        record.direction,
        record.outcome,
        record.count(Outcome::Succeeded),
        record.count(Outcome::Skipped),
        record.count(Outcome::Failed),
    );

    if record.dry_run {
        for result in record.results.iter() {
            if let (Some(host), Some(message)) = (&result.host, &result.message) {
                println!("  {} {host}: {message}", result.phase);
            }
        }
    }

    for result in record.results.iter().filter(|r| r.outcome == Outcome::Failed) {
        println!(
            "  FAILED {} {}: {}",
            result.phase,
            result.host.as_deref().unwrap_or("-"),
            result.message.as_deref().unwrap_or("")
        );
    }

    if let Some(path) = path {
        println!("Record: {}", path.display());
    }
    if record.outcome == RunOutcome::Interrupted {
        println!("Resume with: --resume {}", record.run_id);
    }
}
