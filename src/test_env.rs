// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Test support: an in-memory executor and fabric fixtures.
//!
//! `MockExecutor` keeps a model of which phases are configured on which hosts, so that probes,
//! applies and reverts behave like a real fabric would, and records every call it receives so
//! that tests can assert exactly what the pipeline asked of it.

use std::{
    collections::{BTreeSet, HashMap},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
    time::Duration,
};

use {async_trait::async_trait, tokio_util::sync::CancellationToken};

use crate::{
    config,
    error::PhaseExecutionError,
    executor::{script::Operation, FabricExecutor, ProbeState},
    fabric::{Fabric, HostTarget},
    phase::{Capability, Phase},
};

/// The fabric used by most tests:
///
/// - `stor01`, `stor02`: storage hosts (`sn01`, `sn02`)
/// - `both01`: storage and aggregator (`sn03`, aggregator `a2`, RAID group `md1`)
/// - `agg01`: aggregator `a1` with the re-exported RAID group `md0`
pub fn sample_config() -> config::Config {
    let host = |id: &str, role: &str| config::Host {
        id: id.to_string(),
        role: role.to_string(),
        address: None,
        port: None,
        user: None,
        transport: None,
    };
    let node = |id: &str, host: &str| config::StorageNode {
        id: id.to_string(),
        host: host.to_string(),
        nqn: format!("nqn.2024-01.io.xidis:{id}"),
        devices: vec!["/dev/nvme0n1".to_string(), "/dev/nvme1n1".to_string()],
    };
    let ids = |ids: &[&str]| ids.iter().map(|s| s.to_string()).collect::<Vec<_>>();

    config::Config {
        settings: config::Settings::default(),
        hosts: vec![
            host("stor01", "storage"),
            host("stor02", "storage"),
            host("both01", "both"),
            host("agg01", "aggregator"),
        ],
        storage_nodes: vec![
            node("sn01", "stor01"),
            node("sn02", "stor02"),
            node("sn03", "both01"),
        ],
        aggregators: vec![
            config::Aggregator {
                id: "a1".to_string(),
                host: "agg01".to_string(),
                storage_nodes: ids(&["sn01", "sn02", "sn03"]),
            },
            config::Aggregator {
                id: "a2".to_string(),
                host: "both01".to_string(),
                storage_nodes: ids(&["sn01", "sn03"]),
            },
        ],
        raid_groups: vec![
            config::RaidGroup {
                id: "md0".to_string(),
                aggregator: "a1".to_string(),
                level: "raid5".to_string(),
                members: ids(&["sn01", "sn02", "sn03"]),
                reexport: true,
            },
            config::RaidGroup {
                id: "md1".to_string(),
                aggregator: "a2".to_string(),
                level: "raid1".to_string(),
                members: ids(&["sn01", "sn03"]),
                reexport: false,
            },
        ],
    }
}

pub fn sample_fabric() -> Fabric {
    Fabric::from_config(sample_config()).expect("sample fabric should be valid")
}

/// A failure to inject into the mock fabric.
#[derive(Debug, Clone, PartialEq)]
pub enum Fault {
    /// `apply` and `revert` of the phase fail on the host.
    Fail(String),
    /// Every operation of the phase on the host never completes.
    Hang,
    /// The host cannot be reached for any phase.
    Unreachable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub phase: Phase,
    pub host: String,
    pub op: Operation,
}

/// Decrements the in-flight gauge when an operation ends, including when it is dropped by a
/// timeout.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct MockExecutor {
    capabilities: Vec<Capability>,
    configured: Mutex<BTreeSet<(Phase, String)>>,
    phase_faults: Mutex<HashMap<(Phase, String), Fault>>,
    unreachable: Mutex<BTreeSet<String>>,
    calls: Mutex<Vec<Call>>,
    delay: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    cancel_after: Mutex<Option<(usize, CancellationToken)>>,
}

impl Default for MockExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl MockExecutor {
    pub fn new() -> Self {
        Self::with_capabilities(vec![
            Capability::Probe,
            Capability::ExportStorage,
            Capability::ConnectNamespaces,
            Capability::AssembleRaid,
            Capability::ReexportArrays,
        ])
    }

    pub fn with_capabilities(capabilities: Vec<Capability>) -> Self {
        MockExecutor {
            capabilities,
            configured: Mutex::new(BTreeSet::new()),
            phase_faults: Mutex::new(HashMap::new()),
            unreachable: Mutex::new(BTreeSet::new()),
            calls: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            cancel_after: Mutex::new(None),
        }
    }

    /// Make every operation take `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn inject(&self, phase: Phase, host: &str, fault: Fault) {
        if fault == Fault::Unreachable {
            self.unreachable.lock().unwrap().insert(host.to_string());
        } else {
            self.phase_faults
                .lock()
                .unwrap()
                .insert((phase, host.to_string()), fault);
        }
    }

    pub fn clear_faults(&self) {
        self.phase_faults.lock().unwrap().clear();
        self.unreachable.lock().unwrap().clear();
    }

    /// Mark `phase` as already applied on `host`.
    pub fn preconfigure(&self, phase: Phase, host: &str) {
        self.configured
            .lock()
            .unwrap()
            .insert((phase, host.to_string()));
    }

    pub fn is_configured(&self, phase: Phase, host: &str) -> bool {
        self.configured
            .lock()
            .unwrap()
            .contains(&(phase, host.to_string()))
    }

    /// Cancel `token` once `n` operations have been started.
    pub fn cancel_after(&self, n: usize, token: CancellationToken) {
        *self.cancel_after.lock().unwrap() = Some((n, token));
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    /// Calls that would have changed host state.
    pub fn mutating_calls(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| c.op != Operation::Probe)
            .collect()
    }

    pub fn calls_for(&self, host: &str) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| c.host == host)
            .collect()
    }

    /// The most operations that were ever running at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn reset_calls(&self) {
        self.calls.lock().unwrap().clear();
        self.max_in_flight.store(0, Ordering::SeqCst);
    }

    /// Common bookkeeping for every operation: log the call, apply delays and faults.
    async fn enter(
        &self,
        phase: Phase,
        target: &HostTarget,
        op: Operation,
    ) -> Result<(), PhaseExecutionError> {
        let started = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(Call {
                phase,
                host: target.id().to_string(),
                op,
            });
            calls.len()
        };
        if let Some((n, token)) = &*self.cancel_after.lock().unwrap() {
            if started >= *n {
                token.cancel();
            }
        }

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        if self.unreachable.lock().unwrap().contains(target.id()) {
            return Err(PhaseExecutionError::Connectivity {
                host: target.id().to_string(),
                reason: "no route to host".to_string(),
            });
        }

        let fault = self
            .phase_faults
            .lock()
            .unwrap()
            .get(&(phase, target.id().to_string()))
            .cloned();

        if fault == Some(Fault::Hang) {
            futures::future::pending::<()>().await;
        }

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        match fault {
            Some(Fault::Fail(reason)) if op != Operation::Probe => {
                Err(PhaseExecutionError::Failed(reason))
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl FabricExecutor for MockExecutor {
    fn capabilities(&self) -> &[Capability] {
        &self.capabilities
    }

    async fn probe(
        &self,
        phase: Phase,
        target: &HostTarget,
    ) -> Result<ProbeState, PhaseExecutionError> {
        self.enter(phase, target, Operation::Probe).await?;

        let configured = match phase {
            Phase::Precheck => true,
            // Verification passes once every mutating phase that applies to the host is in place.
            Phase::Verify => Phase::ALL
                .iter()
                .filter(|p| p.mutates() && p.applies_to(target))
                .all(|p| self.is_configured(*p, target.id())),
            _ => self.is_configured(phase, target.id()),
        };

        Ok(if configured {
            ProbeState::Configured
        } else {
            ProbeState::Absent
        })
    }

    async fn apply(&self, phase: Phase, target: &HostTarget) -> Result<(), PhaseExecutionError> {
        self.enter(phase, target, Operation::Apply).await?;
        self.preconfigure(phase, target.id());
        Ok(())
    }

    async fn revert(&self, phase: Phase, target: &HostTarget) -> Result<(), PhaseExecutionError> {
        self.enter(phase, target, Operation::Revert).await?;
        self.configured
            .lock()
            .unwrap()
            .remove(&(phase, target.id().to_string()));
        Ok(())
    }
}
