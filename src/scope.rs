// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::collections::BTreeSet;

use crate::{
    error::{ScopeError, ScopeViolation},
    executor::FabricExecutor,
    fabric::Fabric,
    phase::{Direction, Phase, PhaseRegistry},
    record::RunLog,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostFilter {
    All,
    Only(BTreeSet<String>),
}

/// The unvalidated scope of a run, as given on the command line.
#[derive(Debug, Clone, Default)]
pub struct ScopeRequest {
    /// Host ids to limit the run to. `None` means every host; a list naming no host is rejected.
    pub limit: Option<Vec<String>>,
    /// Name of the single phase to run.
    pub phase: Option<String>,
    pub dry_run: bool,
    pub teardown: bool,
    /// A previous run to resume. Hosts that completed every phase of this run's plan there are
    /// not touched again.
    pub resume: Option<RunLog>,
}

impl ScopeRequest {
    pub fn direction(&self) -> Direction {
        if self.teardown {
            Direction::Teardown
        } else {
            Direction::Forward
        }
    }
}

/// The resolved, immutable parameters of one run.
#[derive(Debug, Clone)]
pub struct ExecutionScope {
    pub host_filter: HostFilter,
    pub direction: Direction,
    pub dry_run: bool,
    pub phase_selector: Option<Phase>,
    phases: Vec<Phase>,
    hosts: Vec<String>,
    completed_hosts: BTreeSet<String>,
    resumed_from: Option<u64>,
}

impl ExecutionScope {
    /// Validate `request` against the fabric, the phase catalog and the executor.
    ///
    /// Every invalid entry is collected into a single `ScopeError`.
    pub fn resolve(
        request: &ScopeRequest,
        fabric: &Fabric,
        registry: &PhaseRegistry,
        executor: &dyn FabricExecutor,
    ) -> Result<Self, ScopeError> {
        let mut violations = Vec::new();
        let direction = request.direction();

        let host_filter = match &request.limit {
            Some(limit) => {
                let requested: BTreeSet<String> = limit
                    .iter()
                    .map(|h| h.trim())
                    .filter(|h| !h.is_empty())
                    .map(String::from)
                    .collect();
                for host in requested.iter() {
                    if !fabric.contains_host(host) {
                        violations.push(ScopeViolation::UnknownHost(host.clone()));
                    }
                }
                if requested.is_empty() {
                    violations.push(ScopeViolation::EmptyHostFilter);
                }
                HostFilter::Only(requested)
            }
            None => HostFilter::All,
        };

        let phase_selector = match &request.phase {
            Some(name) => match registry.lookup(name) {
                Some(phase) if direction == Direction::Teardown && !phase.invertible() => {
                    violations.push(ScopeViolation::NotInvertible(phase));
                    None
                }
                Some(phase) => Some(phase),
                None => {
                    violations.push(ScopeViolation::UnknownPhase(name.clone()));
                    None
                }
            },
            None => None,
        };

        let phases: Vec<Phase> = registry
            .ordered_phases(direction)
            .into_iter()
            .filter(|phase| match (&request.phase, phase_selector) {
                (None, _) => true,
                (Some(_), Some(selected)) => *phase == selected,
                // An invalid selector runs nothing; the violation is already recorded.
                (Some(_), None) => false,
            })
            .collect();

        for phase in phases.iter() {
            for capability in phase.capabilities() {
                if !executor.supports(*capability) {
                    violations.push(ScopeViolation::MissingCapability {
                        phase: *phase,
                        capability: *capability,
                    });
                }
            }
        }

        let hosts: Vec<String> = fabric
            .hosts()
            .map(|h| h.id.clone())
            .filter(|id| match &host_filter {
                HostFilter::All => true,
                HostFilter::Only(set) => set.contains(id),
            })
            .collect();

        let mut completed_hosts = BTreeSet::new();
        let mut resumed_from = None;
        if let Some(log) = &request.resume {
            match resume_violation(log, direction, &phases) {
                Some(violation) => violations.push(violation),
                None => {
                    resumed_from = log.run_id();
                    completed_hosts = hosts
                        .iter()
                        .filter(|id| {
                            let Some(target) = fabric.target(id) else {
                                return false;
                            };
                            phases
                                .iter()
                                .filter(|phase| phase.applies_to(&target))
                                .all(|phase| log.completed(*phase, id))
                        })
                        .cloned()
                        .collect();
                }
            }
        }

        if !violations.is_empty() {
            return Err(ScopeError { violations });
        }

        Ok(ExecutionScope {
            host_filter,
            direction,
            dry_run: request.dry_run,
            phase_selector,
            phases,
            hosts,
            completed_hosts,
            resumed_from,
        })
    }

    /// The phases this run executes, in execution order.
    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }

    /// Targeted host ids, in id order.
    pub fn hosts(&self) -> &[String] {
        &self.hosts
    }

    /// Whether `host` already completed this run's plan in the run being resumed.
    pub fn already_completed(&self, host: &str) -> bool {
        self.completed_hosts.contains(host)
    }

    pub fn resumed_from(&self) -> Option<u64> {
        self.resumed_from
    }
}

/// Why `log` cannot seed a run of `phases` in `direction`, if it cannot. Hosts left unfinished
/// by the earlier run repeat the whole plan, so every planned phase must be safe to re-run.
fn resume_violation(
    log: &RunLog,
    direction: Direction,
    phases: &[Phase],
) -> Option<ScopeViolation> {
    let Some(header) = &log.header else {
        return Some(ScopeViolation::Resume {
            run_id: 0,
            reason: "record has no start entry".to_string(),
        });
    };
    let reason = if header.dry_run {
        "it was a dry run".to_string()
    } else if header.direction != direction {
        format!("it was a {} run", header.direction)
    } else if let Some(phase) = phases.iter().find(|phase| !phase.resumable()) {
        format!("phase '{phase}' cannot be safely re-run")
    } else {
        return None;
    };
    Some(ScopeViolation::Resume {
        run_id: header.run_id,
        reason,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_env::{sample_fabric, MockExecutor};

    fn resolve(request: &ScopeRequest) -> Result<ExecutionScope, ScopeError> {
        let fabric = sample_fabric();
        ExecutionScope::resolve(
            request,
            &fabric,
            &PhaseRegistry::standard(),
            &MockExecutor::new(),
        )
    }

    #[test]
    fn defaults_to_every_host_and_phase() {
        let scope = resolve(&ScopeRequest::default()).unwrap();
        assert_eq!(scope.host_filter, HostFilter::All);
        assert_eq!(scope.phases(), Phase::ALL.as_slice());
        assert_eq!(scope.hosts(), &["agg01", "both01", "stor01", "stor02"]);
    }

    #[test]
    fn collects_every_invalid_entry() {
        let err = resolve(&ScopeRequest {
            limit: Some(vec![
                "stor01".to_string(),
                "hostX".to_string(),
                "hostY".to_string(),
            ]),
            phase: Some("raid9".to_string()),
            ..Default::default()
        })
        .unwrap_err();

        assert_eq!(
            err.violations,
            vec![
                ScopeViolation::UnknownHost("hostX".to_string()),
                ScopeViolation::UnknownHost("hostY".to_string()),
                ScopeViolation::UnknownPhase("raid9".to_string()),
            ]
        );
    }

    #[test]
    fn empty_limit_is_rejected() {
        for limit in [vec![], vec!["".to_string()], vec![" ".to_string(), "".to_string()]] {
            let err = resolve(&ScopeRequest {
                limit: Some(limit),
                teardown: true,
                ..Default::default()
            })
            .unwrap_err();
            assert_eq!(err.violations, vec![ScopeViolation::EmptyHostFilter]);
        }
    }

    #[test]
    fn verify_cannot_be_torn_down() {
        let err = resolve(&ScopeRequest {
            phase: Some("verify".to_string()),
            teardown: true,
            ..Default::default()
        })
        .unwrap_err();
        assert_eq!(
            err.violations,
            vec![ScopeViolation::NotInvertible(Phase::Verify)]
        );
    }

    #[test]
    fn selector_and_limit_narrow_the_plan() {
        let scope = resolve(&ScopeRequest {
            limit: Some(vec!["agg01".to_string(), " ".to_string()]),
            phase: Some("raid".to_string()),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(scope.phase_selector, Some(Phase::OpusRaid));
        assert_eq!(scope.phases(), &[Phase::OpusRaid]);
        assert_eq!(scope.hosts(), &["agg01"]);
    }

    #[test]
    fn missing_capabilities_are_reported() {
        let fabric = sample_fabric();
        let executor = MockExecutor::with_capabilities(vec![
            crate::phase::Capability::Probe,
            crate::phase::Capability::ExportStorage,
        ]);
        let err = ExecutionScope::resolve(
            &ScopeRequest {
                teardown: true,
                ..Default::default()
            },
            &fabric,
            &PhaseRegistry::standard(),
            &executor,
        )
        .unwrap_err();
        assert_eq!(err.violations.len(), 3);
        assert!(err
            .violations
            .iter()
            .all(|v| matches!(v, ScopeViolation::MissingCapability { .. })));
    }
}
