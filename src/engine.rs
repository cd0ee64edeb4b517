// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use {
    chrono::Utc,
    futures::stream::{self, StreamExt},
    tokio_util::sync::CancellationToken,
};

use crate::{
    config::Settings,
    error::ScopeError,
    executor::FabricExecutor,
    fabric::{Fabric, HostTarget},
    phase::{Direction, Phase, PhaseContext, PhaseRegistry},
    record::{Outcome, PhaseResult, RunHeader, RunOutcome, RunRecord, RunRecorder, SkipReason},
    scope::{ExecutionScope, ScopeRequest},
};

#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// How many hosts may be worked on at once within a phase.
    pub workers: usize,
    /// Limit on every individual executor operation.
    pub operation_timeout: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        EngineOptions {
            workers: crate::DEFAULT_WORKERS,
            operation_timeout: Duration::from_secs(crate::DEFAULT_OPERATION_TIMEOUT_SECS),
        }
    }
}

impl EngineOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        let defaults = Self::default();
        EngineOptions {
            workers: settings.workers.unwrap_or(defaults.workers),
            operation_timeout: settings
                .operation_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.operation_timeout),
        }
    }
}

/// The PipelineEngine drives the configuration phases across the fabric.
///
/// Phases run strictly one after another: a phase is attempted on every eligible host before the
/// next one starts on any host. Within a phase, hosts are worked on concurrently, up to
/// `EngineOptions::workers` at a time.
///
/// A host that fails a phase is excluded from every later phase of the run, but the remaining
/// hosts carry on; a single host never aborts the run. The engine changes nothing on the fabric
/// itself: all changes are made by the executor, and everything that happens is appended to the
/// run's recorder.
pub struct PipelineEngine {
    executor: Arc<dyn FabricExecutor>,
    registry: PhaseRegistry,
    options: EngineOptions,
    cancel: CancellationToken,
}

impl PipelineEngine {
    pub fn new(executor: Arc<dyn FabricExecutor>, options: EngineOptions) -> Self {
        PipelineEngine {
            executor,
            registry: PhaseRegistry::standard(),
            options,
            cancel: CancellationToken::new(),
        }
    }

    /// A token that, when cancelled, stops the engine from starting any further host operations.
    /// Operations already running are allowed to finish or time out.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn resolve(
        &self,
        fabric: &Fabric,
        request: &ScopeRequest,
    ) -> Result<ExecutionScope, ScopeError> {
        ExecutionScope::resolve(request, fabric, &self.registry, self.executor.as_ref())
    }

    /// Resolve `request` and run it. Scope errors are returned before any host is touched.
    pub async fn run(
        &self,
        fabric: &Fabric,
        request: &ScopeRequest,
        recorder: &RunRecorder,
    ) -> Result<RunRecord, ScopeError> {
        let scope = self.resolve(fabric, request)?;
        Ok(self.execute(fabric, &scope, recorder).await)
    }

    /// Run an already-resolved scope to completion (or interruption).
    pub async fn execute(
        &self,
        fabric: &Fabric,
        scope: &ExecutionScope,
        recorder: &RunRecorder,
    ) -> RunRecord {
        recorder.begin(RunHeader {
            run_id: recorder.run_id(),
            timestamp: Utc::now(),
            direction: scope.direction,
            dry_run: scope.dry_run,
            phases: scope.phases().to_vec(),
            hosts: scope.hosts().to_vec(),
            resumed_from: scope.resumed_from(),
        });

        let targets: Vec<HostTarget> = scope
            .hosts()
            .iter()
            .filter_map(|id| fabric.target(id))
            .collect();

        let ctx = PhaseContext {
            executor: self.executor.as_ref(),
            recorder,
            dry_run: scope.dry_run,
            timeout: self.options.operation_timeout,
            cancel: self.cancel.clone(),
        };

        // Hosts that have failed, and the phase they failed in.
        let mut failed: BTreeMap<String, Phase> = BTreeMap::new();
        let mut interrupted = false;

        for &phase in scope.phases() {
            if self.cancel.is_cancelled() {
                log::warn!("run {} interrupted before {phase}", recorder.run_id());
                interrupted = true;
                break;
            }

            let active = self.admit(phase, scope, &targets, &failed, recorder);
            if active.is_empty() {
                recorder.append(PhaseResult::skipped(
                    phase,
                    None,
                    SkipReason::NoEligibleHosts,
                    "no eligible hosts".to_string(),
                ));
                continue;
            }

            log::info!(
                "run {}: {} {phase} on {} host(s){}",
                recorder.run_id(),
                match scope.direction {
                    Direction::Forward => "applying",
                    Direction::Teardown => "reverting",
                },
                active.len(),
                if scope.dry_run { " (dry run)" } else { "" }
            );

            let results: Vec<PhaseResult> = stream::iter(active)
                .map(|target| self.run_host(phase, scope.direction, &ctx, target))
                .buffer_unordered(self.options.workers.max(1))
                .collect()
                .await;

            for result in results {
                match (result.outcome, result.reason, result.host) {
                    (Outcome::Failed, _, Some(host)) => {
                        failed.insert(host, phase);
                    }
                    (Outcome::Skipped, Some(SkipReason::Interrupted), _) => interrupted = true,
                    _ => {}
                }
            }

            if interrupted {
                log::warn!("run {} interrupted during {phase}", recorder.run_id());
                break;
            }
        }

        let outcome = if interrupted {
            RunOutcome::Interrupted
        } else if !failed.is_empty() {
            RunOutcome::Failed
        } else {
            RunOutcome::Succeeded
        };

        recorder.finish(outcome)
    }

    /// Sort the hosts `phase` applies to into those that will run it and those that will not,
    /// recording why each of the latter is skipped.
    fn admit<'t>(
        &self,
        phase: Phase,
        scope: &ExecutionScope,
        targets: &'t [HostTarget],
        failed: &BTreeMap<String, Phase>,
        recorder: &RunRecorder,
    ) -> Vec<&'t HostTarget> {
        let mut active = Vec::new();

        for target in targets.iter().filter(|t| phase.applies_to(t)) {
            let host = Some(target.id().to_string());
            if let Some(&after) = failed.get(target.id()) {
                recorder.append(PhaseResult::skipped(
                    phase,
                    host,
                    SkipReason::Excluded { after },
                    format!("excluded after failing {after}"),
                ));
            } else if scope.already_completed(target.id()) {
                let run_id = scope.resumed_from().unwrap_or_default();
                recorder.append(PhaseResult::skipped(
                    phase,
                    host,
                    SkipReason::Resumed { run_id },
                    format!("completed in run {run_id}"),
                ));
            } else {
                active.push(target);
            }
        }

        active
    }

    async fn run_host(
        &self,
        phase: Phase,
        direction: Direction,
        ctx: &PhaseContext<'_>,
        target: &HostTarget,
    ) -> PhaseResult {
        if self.cancel.is_cancelled() {
            let result = PhaseResult::skipped(
                phase,
                Some(target.id().to_string()),
                SkipReason::Interrupted,
                "not started: run interrupted".to_string(),
            );
            ctx.recorder.append(result.clone());
            return result;
        }

        phase.invoke(direction, ctx, target).await
    }
}
