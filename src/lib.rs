// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

pub mod commands;
pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod fabric;
pub mod phase;
pub mod record;
pub mod scope;
pub mod test_env;

pub use engine::{EngineOptions, PipelineEngine};
pub use error::{ConfigError, DeployError, PhaseExecutionError, RecordError, ScopeError};
pub use fabric::Fabric;
pub use phase::{Direction, Phase, PhaseRegistry};
pub use record::{Outcome, PhaseResult, RunOutcome, RunRecord, RunRecorder};
pub use scope::{ExecutionScope, ScopeRequest};

/// Number of hosts that may be worked on concurrently within a single phase.
pub const DEFAULT_WORKERS: usize = 8;

/// Upper bound, in seconds, on any single operation against a remote host.
pub const DEFAULT_OPERATION_TIMEOUT_SECS: u64 = 300;

pub fn default_config_path() -> String {
    match std::env::var("XIDIS_CONFIG") {
        Ok(conf) => conf,
        Err(_) => "/etc/xidis/fabric.toml".to_string(),
    }
}

pub fn default_record_dir() -> String {
    match std::env::var("XIDIS_RECORD_DIR") {
        Ok(dir) => dir,
        Err(_) => "/var/lib/xidis/runs".to_string(),
    }
}

pub fn default_phase_root() -> String {
    match std::env::var("XIDIS_PHASE_ROOT") {
        Ok(root) => root,
        Err(_) => "/usr/libexec/xidis/phase.d".to_string(),
    }
}
