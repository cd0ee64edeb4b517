// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Error taxonomy for the deployment pipeline.
//!
//! `ConfigError` and `ScopeError` are fatal: they are raised before any phase touches a host and
//! always carry every violation found. `PhaseExecutionError` is contained to a single host and
//! phase; the engine turns it into a failed `PhaseResult` and keeps going.

use std::{fmt, path::PathBuf, time::Duration};

use thiserror::Error;

use crate::phase::{Capability, Direction, Phase};

/// Exit status for configuration, validation and scope errors.
pub const EXIT_VALIDATION: i32 = 2;

/// Exit status for a run in which at least one host failed a phase.
pub const EXIT_HOST_FAILURE: i32 = 3;

/// Exit status for a run stopped by an operator interrupt.
pub const EXIT_INTERRUPTED: i32 = 130;

/// Exit status for anything else (unwritable record directory, runtime startup, ...).
pub const EXIT_GENERAL: i32 = 1;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("could not read config file '{}': {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("could not parse config file '{}': {message}", path.display())]
    Parse { path: PathBuf, message: String },

    /// The document parsed, but describes an inconsistent fabric.
    #[error("invalid fabric description:\n  {}", .0.join("\n  "))]
    Invalid(Vec<String>),
}

/// A single reason a requested scope cannot be run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeViolation {
    UnknownHost(String),
    /// `--limit` was given but named no host.
    EmptyHostFilter,
    UnknownPhase(String),
    /// The selected phase has no inverse and so cannot be selected for a teardown.
    NotInvertible(Phase),
    /// The executor cannot perform an operation the selected phases need.
    MissingCapability { phase: Phase, capability: Capability },
    /// The run named by `--resume` cannot seed this run.
    Resume { run_id: u64, reason: String },
}

impl fmt::Display for ScopeViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownHost(host) => write!(f, "unknown host '{host}'"),
            Self::EmptyHostFilter => write!(f, "host limit names no hosts"),
            Self::UnknownPhase(name) => write!(f, "unknown phase '{name}'"),
            Self::NotInvertible(phase) => {
                write!(f, "phase '{phase}' has no {} action", Direction::Teardown)
            }
            Self::MissingCapability { phase, capability } => write!(
                f,
                "executor cannot {capability}, which phase '{phase}' requires"
            ),
            Self::Resume { run_id, reason } => write!(f, "cannot resume run {run_id}: {reason}"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid scope: {}", join_violations(.violations))]
pub struct ScopeError {
    pub violations: Vec<ScopeViolation>,
}

fn join_violations(violations: &[ScopeViolation]) -> String {
    violations
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl ScopeError {
    pub fn unknown_hosts(&self) -> impl Iterator<Item = &str> {
        self.violations.iter().filter_map(|v| match v {
            ScopeViolation::UnknownHost(host) => Some(host.as_str()),
            _ => None,
        })
    }
}

/// Failure of one phase operation on one host.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PhaseExecutionError {
    #[error("{operation} on '{host}' timed out after {}s", timeout.as_secs_f64())]
    Timeout {
        host: String,
        operation: String,
        timeout: Duration,
    },

    #[error("could not reach '{host}': {reason}")]
    Connectivity { host: String, reason: String },

    /// The operation ran and reported failure.
    #[error("{0}")]
    Failed(String),
}

impl PhaseExecutionError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

#[derive(Error, Debug)]
pub enum RecordError {
    #[error("run record I/O error on '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("malformed run record '{}' line {line}: {source}", path.display())]
    Malformed {
        path: PathBuf,
        line: usize,
        source: serde_json::Error,
    },

    #[error("could not encode run record entry: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("no record for run {run_id} in '{}'", dir.display())]
    MissingRun { run_id: u64, dir: PathBuf },
}

/// Errors that stop a deployment before (or instead of) producing a run record.
#[derive(Error, Debug)]
pub enum DeployError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Scope(#[from] ScopeError),

    #[error(transparent)]
    Record(#[from] RecordError),
}

impl DeployError {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) | Self::Scope(_) => EXIT_VALIDATION,
            // Naming a run that does not exist is a usage error.
            Self::Record(RecordError::MissingRun { .. }) => EXIT_VALIDATION,
            Self::Record(_) => EXIT_GENERAL,
        }
    }
}
