// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use async_trait::async_trait;

use crate::{
    error::PhaseExecutionError,
    fabric::HostTarget,
    phase::{Capability, Phase},
};

pub mod script;

pub use script::ScriptExecutor;

/// What a probe found on a host for a given phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeState {
    /// The host is in the state the phase produces (for checks: the check passes).
    Configured,
    /// The phase's effect is not present on the host.
    Absent,
}

/// The contract between the pipeline and the code that actually touches hosts.
///
/// `probe` must never change host state; the pipeline relies on that for dry runs and for
/// deciding whether `apply` or `revert` is needed at all. `apply` and `revert` are only called
/// after a probe showed that they have something to do.
#[async_trait]
pub trait FabricExecutor: Send + Sync {
    /// The operations this executor knows how to perform.
    fn capabilities(&self) -> &[Capability];

    fn supports(&self, capability: Capability) -> bool {
        self.capabilities().contains(&capability)
    }

    async fn probe(
        &self,
        phase: Phase,
        target: &HostTarget,
    ) -> Result<ProbeState, PhaseExecutionError>;

    async fn apply(&self, phase: Phase, target: &HostTarget) -> Result<(), PhaseExecutionError>;

    async fn revert(&self, phase: Phase, target: &HostTarget) -> Result<(), PhaseExecutionError>;
}
