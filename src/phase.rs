// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! The ordered stages of fabric configuration.
//!
//! Each `Phase` is a tagged variant that knows which hosts it applies to, which executor
//! capabilities it needs, and how to apply or revert itself on one host. Both directions probe
//! the host first, so applying an already-configured phase, or reverting one that was never
//! applied, is a no-op recorded as `skipped`.

use std::{fmt, str::FromStr, time::Duration};

use {
    serde::{Deserialize, Serialize},
    tokio_util::sync::CancellationToken,
};

use crate::{
    error::PhaseExecutionError,
    executor::{FabricExecutor, ProbeState},
    fabric::HostTarget,
    record::{Outcome, PhaseResult, RunRecorder, SkipReason},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Forward,
    Teardown,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Direction::Forward => "forward",
                Direction::Teardown => "teardown",
            }
        )
    }
}

/// An operation a `FabricExecutor` may or may not be able to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Capability {
    /// Read-only inspection of a host's state.
    Probe,
    ExportStorage,
    ConnectNamespaces,
    AssembleRaid,
    ReexportArrays,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Capability::Probe => "probe host state",
                Capability::ExportStorage => "configure storage export",
                Capability::ConnectNamespaces => "connect namespaces",
                Capability::AssembleRaid => "assemble RAID groups",
                Capability::ReexportArrays => "re-export arrays",
            }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Precheck,
    StorageExport,
    AggregatorConnect,
    OpusRaid,
    Reexport,
    Verify,
}

impl Phase {
    /// Every phase, in forward order.
    pub const ALL: [Phase; 6] = [
        Phase::Precheck,
        Phase::StorageExport,
        Phase::AggregatorConnect,
        Phase::OpusRaid,
        Phase::Reexport,
        Phase::Verify,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Phase::Precheck => "precheck",
            Phase::StorageExport => "storage_export",
            Phase::AggregatorConnect => "aggregator_connect",
            Phase::OpusRaid => "opus_raid",
            Phase::Reexport => "reexport",
            Phase::Verify => "verify",
        }
    }

    /// Whether the phase changes fabric state. Checks (precheck, verify) only ever probe.
    pub fn mutates(&self) -> bool {
        !matches!(self, Phase::Precheck | Phase::Verify)
    }

    /// Whether the phase has a teardown action. Only mutating phases have an effect to undo.
    pub fn invertible(&self) -> bool {
        self.mutates()
    }

    /// Every phase detects its own prior effect, so re-running it after a partial run is safe.
    pub fn resumable(&self) -> bool {
        true
    }

    pub fn capabilities(&self) -> &'static [Capability] {
        match self {
            Phase::Precheck | Phase::Verify => &[Capability::Probe],
            Phase::StorageExport => &[Capability::Probe, Capability::ExportStorage],
            Phase::AggregatorConnect => &[Capability::Probe, Capability::ConnectNamespaces],
            Phase::OpusRaid => &[Capability::Probe, Capability::AssembleRaid],
            Phase::Reexport => &[Capability::Probe, Capability::ReexportArrays],
        }
    }

    /// Whether this phase has anything to do on the given host.
    pub fn applies_to(&self, target: &HostTarget) -> bool {
        match self {
            Phase::Precheck | Phase::Verify => true,
            Phase::StorageExport => target.role().serves_storage(),
            Phase::AggregatorConnect => target.role().serves_aggregation(),
            Phase::OpusRaid => !target.raid_groups.is_empty(),
            Phase::Reexport => target.reexported_groups().next().is_some(),
        }
    }

    /// Run this phase on one host in the given direction, record the result, and return it.
    pub async fn invoke(
        &self,
        direction: Direction,
        ctx: &PhaseContext<'_>,
        target: &HostTarget,
    ) -> PhaseResult {
        match direction {
            Direction::Forward => self.apply(ctx, target).await,
            Direction::Teardown => self.revert(ctx, target).await,
        }
    }

    pub async fn apply(&self, ctx: &PhaseContext<'_>, target: &HostTarget) -> PhaseResult {
        let result = match self.try_apply(ctx, target).await {
            Ok(result) => result,
            Err(e) => self.result(target, Outcome::Failed, Some(e.to_string())),
        };
        ctx.record(result)
    }

    pub async fn revert(&self, ctx: &PhaseContext<'_>, target: &HostTarget) -> PhaseResult {
        let result = match self.try_revert(ctx, target).await {
            Ok(result) => result,
            Err(e) => self.result(target, Outcome::Failed, Some(e.to_string())),
        };
        ctx.record(result)
    }

    async fn try_apply(
        &self,
        ctx: &PhaseContext<'_>,
        target: &HostTarget,
    ) -> Result<PhaseResult, PhaseExecutionError> {
        let state = ctx.probe(*self, target).await?;

        if !self.mutates() {
            return Ok(match state {
                ProbeState::Configured => self.result(target, Outcome::Succeeded, None),
                // Verification looks at the changes of earlier phases, which a dry run never makes.
                ProbeState::Absent if ctx.dry_run && *self == Phase::Verify => self.result(
                    target,
                    Outcome::Succeeded,
                    Some("dry-run: would verify after changes are applied".to_string()),
                ),
                ProbeState::Absent => self.result(
                    target,
                    Outcome::Failed,
                    Some(format!("{self} check did not pass")),
                ),
            });
        }

        if state == ProbeState::Configured {
            return Ok(self
                .result(target, Outcome::Skipped, Some("already configured".to_string()))
                .because(SkipReason::AlreadyInState));
        }

        if ctx.dry_run {
            return Ok(self.result(
                target,
                Outcome::Succeeded,
                Some(format!("dry-run: would apply {self}")),
            ));
        }

        if let Some(interrupted) = self.interrupted(ctx, target, "applied") {
            return Ok(interrupted);
        }

        ctx.apply(*self, target).await?;
        Ok(self.result(target, Outcome::Succeeded, None))
    }

    async fn try_revert(
        &self,
        ctx: &PhaseContext<'_>,
        target: &HostTarget,
    ) -> Result<PhaseResult, PhaseExecutionError> {
        if !self.invertible() {
            return Ok(self
                .result(target, Outcome::Skipped, Some("no teardown action".to_string()))
                .because(SkipReason::NoInverse));
        }

        if ctx.probe(*self, target).await? == ProbeState::Absent {
            return Ok(self
                .result(target, Outcome::Skipped, Some("nothing to revert".to_string()))
                .because(SkipReason::AlreadyInState));
        }

        if ctx.dry_run {
            return Ok(self.result(
                target,
                Outcome::Succeeded,
                Some(format!("dry-run: would revert {self}")),
            ));
        }

        if let Some(interrupted) = self.interrupted(ctx, target, "reverted") {
            return Ok(interrupted);
        }

        ctx.revert(*self, target).await?;
        Ok(self.result(target, Outcome::Succeeded, None))
    }

    /// An interrupt that arrived while the host was being probed stops the change itself.
    fn interrupted(
        &self,
        ctx: &PhaseContext<'_>,
        target: &HostTarget,
        verb: &str,
    ) -> Option<PhaseResult> {
        if !ctx.cancel.is_cancelled() {
            return None;
        }
        Some(PhaseResult::skipped(
            *self,
            Some(target.id().to_string()),
            SkipReason::Interrupted,
            format!("not {verb}: run interrupted"),
        ))
    }

    fn result(&self, target: &HostTarget, outcome: Outcome, message: Option<String>) -> PhaseResult {
        PhaseResult::new(*self, Some(target.id().to_string()), outcome, message)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for Phase {
    type Err = String;

    /// Parse a phase name. The short names used by earlier deploy scripts are also accepted.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "storage" => Ok(Phase::StorageExport),
            "agg" => Ok(Phase::AggregatorConnect),
            "raid" => Ok(Phase::OpusRaid),
            other => Phase::ALL
                .into_iter()
                .find(|phase| phase.name() == other)
                .ok_or_else(|| other.to_string()),
        }
    }
}

/// The catalog of phases and the order they run in.
#[derive(Debug, Clone)]
pub struct PhaseRegistry {
    forward: Vec<Phase>,
}

impl Default for PhaseRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

impl PhaseRegistry {
    pub fn standard() -> Self {
        PhaseRegistry {
            forward: Phase::ALL.to_vec(),
        }
    }

    /// The phases to run for `direction`. Teardown runs the invertible phases in reverse.
    pub fn ordered_phases(&self, direction: Direction) -> Vec<Phase> {
        match direction {
            Direction::Forward => self.forward.clone(),
            Direction::Teardown => self
                .forward
                .iter()
                .rev()
                .filter(|phase| phase.invertible())
                .copied()
                .collect(),
        }
    }

    pub fn lookup(&self, name: &str) -> Option<Phase> {
        name.parse::<Phase>()
            .ok()
            .filter(|phase| self.forward.contains(phase))
    }
}

/// Run-scoped state handed to every phase invocation.
pub struct PhaseContext<'a> {
    pub executor: &'a dyn FabricExecutor,
    pub recorder: &'a RunRecorder,
    pub dry_run: bool,
    /// Limit on each individual executor call.
    pub timeout: Duration,
    /// Once cancelled, no further change is started on any host.
    pub cancel: CancellationToken,
}

impl PhaseContext<'_> {
    async fn probe(
        &self,
        phase: Phase,
        target: &HostTarget,
    ) -> Result<ProbeState, PhaseExecutionError> {
        self.with_timeout("probe", phase, target, self.executor.probe(phase, target))
            .await
    }

    async fn apply(&self, phase: Phase, target: &HostTarget) -> Result<(), PhaseExecutionError> {
        self.with_timeout("apply", phase, target, self.executor.apply(phase, target))
            .await
    }

    async fn revert(&self, phase: Phase, target: &HostTarget) -> Result<(), PhaseExecutionError> {
        self.with_timeout("revert", phase, target, self.executor.revert(phase, target))
            .await
    }

    async fn with_timeout<T>(
        &self,
        action: &str,
        phase: Phase,
        target: &HostTarget,
        op: impl std::future::Future<Output = Result<T, PhaseExecutionError>>,
    ) -> Result<T, PhaseExecutionError> {
        match tokio::time::timeout(self.timeout, op).await {
            Ok(res) => res,
            Err(_) => Err(PhaseExecutionError::Timeout {
                host: target.id().to_string(),
                operation: format!("{action} {phase}"),
                timeout: self.timeout,
            }),
        }
    }

    fn record(&self, result: PhaseResult) -> PhaseResult {
        self.recorder.append(result.clone());
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_order_is_fixed() {
        let registry = PhaseRegistry::standard();
        assert_eq!(
            registry.ordered_phases(Direction::Forward),
            vec![
                Phase::Precheck,
                Phase::StorageExport,
                Phase::AggregatorConnect,
                Phase::OpusRaid,
                Phase::Reexport,
                Phase::Verify,
            ]
        );
    }

    #[test]
    fn teardown_reverses_mutating_phases() {
        let registry = PhaseRegistry::standard();
        assert_eq!(
            registry.ordered_phases(Direction::Teardown),
            vec![
                Phase::Reexport,
                Phase::OpusRaid,
                Phase::AggregatorConnect,
                Phase::StorageExport,
            ]
        );
    }

    #[test]
    fn parses_names_and_aliases() {
        for phase in Phase::ALL {
            assert_eq!(phase.name().parse::<Phase>(), Ok(phase));
        }
        assert_eq!("raid".parse::<Phase>(), Ok(Phase::OpusRaid));
        assert_eq!("agg".parse::<Phase>(), Ok(Phase::AggregatorConnect));
        assert_eq!("storage".parse::<Phase>(), Ok(Phase::StorageExport));
        assert_eq!("raid9".parse::<Phase>(), Err("raid9".to_string()));
    }

    #[test]
    fn eligibility_follows_roles_and_entities() {
        let fabric = crate::test_env::sample_fabric();
        let stor = fabric.target("stor01").unwrap();
        let agg = fabric.target("agg01").unwrap();

        assert!(Phase::StorageExport.applies_to(&stor));
        assert!(!Phase::AggregatorConnect.applies_to(&stor));
        assert!(!Phase::OpusRaid.applies_to(&stor));

        assert!(!Phase::StorageExport.applies_to(&agg));
        assert!(Phase::AggregatorConnect.applies_to(&agg));
        assert!(Phase::OpusRaid.applies_to(&agg));
        assert!(Phase::Reexport.applies_to(&agg));

        assert!(Phase::Precheck.applies_to(&stor) && Phase::Verify.applies_to(&agg));
    }

    #[test]
    fn every_phase_can_be_rerun() {
        assert!(Phase::ALL.iter().all(|phase| phase.resumable()));
    }

    #[test]
    fn checks_have_nothing_to_revert() {
        let fabric = crate::test_env::sample_fabric();
        let target = fabric.target("stor01").unwrap();
        let executor = crate::test_env::MockExecutor::new();
        let recorder = RunRecorder::in_memory(1);
        let ctx = PhaseContext {
            executor: &executor,
            recorder: &recorder,
            dry_run: false,
            timeout: Duration::from_secs(1),
            cancel: CancellationToken::new(),
        };

        let rt = tokio::runtime::Runtime::new().unwrap();
        let result = rt.block_on(Phase::Verify.revert(&ctx, &target));

        assert_eq!(result.outcome, Outcome::Skipped);
        assert_eq!(result.reason, Some(SkipReason::NoInverse));
        assert!(executor.calls().is_empty());
        assert_eq!(recorder.finish(crate::record::RunOutcome::Succeeded).results, vec![result]);
    }
}
