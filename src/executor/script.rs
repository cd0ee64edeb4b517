// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! script.rs
//!
//! This module runs phase operations as external programs, one program per phase, either locally
//! or on the target host over ssh.
//!
//! A phase program is invoked as `<phase_root>/<phase> <probe|apply|revert>`. It learns which host
//! and entities it acts on from the environment:
//!
//! - `XIDIS_HOST`, `XIDIS_ROLE`, `XIDIS_ADDRESS`, `XIDIS_PHASE`
//! - `XIDIS_PARAMS`: JSON description of the host and the storage nodes, aggregators and RAID
//!   groups placed on it.
//!
//! For `probe`, exit status 0 means the phase's effect is present and `EXIT_NOT_CONFIGURED` means
//! it is absent. For `apply` and `revert`, 0 means success. Anything else is a failure.

use std::{fmt, process::Stdio};

use {async_trait::async_trait, tokio::process::Command};

use crate::{
    error::PhaseExecutionError,
    executor::{FabricExecutor, ProbeState},
    fabric::{HostTarget, Transport},
    phase::{Capability, Phase},
};

/// Probe exit status meaning "the phase has not been applied on this host".
pub const EXIT_NOT_CONFIGURED: i32 = 7;

/// ssh exits with this status when it could not reach or authenticate to the remote host.
const SSH_CONNECTION_FAILURE: i32 = 255;

/// Operations that can be requested of a phase program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Probe,
    Apply,
    Revert,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Operation::Probe => "probe",
                Operation::Apply => "apply",
                Operation::Revert => "revert",
            }
        )
    }
}

#[derive(Debug, Clone)]
pub struct ScriptExecutor {
    phase_root: String,
    remote_phase_root: String,
    ssh_program: String,
}

/// Quote `s` for a POSIX shell.
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

impl ScriptExecutor {
    pub fn new(phase_root: String, remote_phase_root: Option<String>) -> Self {
        ScriptExecutor {
            remote_phase_root: remote_phase_root.unwrap_or_else(|| phase_root.clone()),
            phase_root,
            ssh_program: "ssh".to_string(),
        }
    }

    /// Build an executor from the `[settings]` of a fabric, falling back to `XIDIS_PHASE_ROOT`.
    pub fn from_settings(settings: &crate::config::Settings) -> Self {
        Self::new(
            settings
                .phase_root
                .clone()
                .unwrap_or_else(crate::default_phase_root),
            settings.remote_phase_root.clone(),
        )
    }

    fn environment(
        &self,
        phase: Phase,
        target: &HostTarget,
    ) -> Result<Vec<(&'static str, String)>, PhaseExecutionError> {
        let params = serde_json::to_string(target).map_err(|e| {
            PhaseExecutionError::Failed(format!("could not encode parameters for {phase}: {e}"))
        })?;

        Ok(vec![
            ("XIDIS_HOST", target.id().to_string()),
            ("XIDIS_ROLE", target.role().to_string()),
            ("XIDIS_ADDRESS", target.host.connection.address.clone()),
            ("XIDIS_PHASE", phase.to_string()),
            ("XIDIS_PARAMS", params),
        ])
    }

    /// Build the command that performs `op` for `phase` on the target host.
    pub fn command(
        &self,
        phase: Phase,
        op: Operation,
        target: &HostTarget,
    ) -> Result<Command, PhaseExecutionError> {
        let env = self.environment(phase, target)?;
        let conn = &target.host.connection;

        let mut cmd = match conn.transport {
            Transport::Local => {
                let mut cmd = Command::new(format!("{}/{}", self.phase_root, phase));
                cmd.arg(op.to_string()).envs(env);
                cmd
            }
            Transport::Ssh => {
                let mut remote = String::from("env");
                for (key, value) in env.iter() {
                    remote.push_str(&format!(" {key}={}", shell_quote(value)));
                }
                remote.push_str(&format!(
                    " {} {op}",
                    shell_quote(&format!("{}/{}", self.remote_phase_root, phase))
                ));

                let mut cmd = Command::new(&self.ssh_program);
                cmd.args(["-o", "BatchMode=yes"]);
                if let Some(port) = conn.port {
                    cmd.arg("-p").arg(port.to_string());
                }
                cmd.arg(conn.destination()).arg(remote);
                cmd
            }
        };

        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        Ok(cmd)
    }

    /// Run `op` and return its exit code together with whatever it wrote to stderr.
    async fn run(
        &self,
        phase: Phase,
        op: Operation,
        target: &HostTarget,
    ) -> Result<(i32, String), PhaseExecutionError> {
        let mut cmd = self.command(phase, op, target)?;
        log::debug!("{op} {phase} on {}: {:?}", target.id(), cmd.as_std());

        let output = cmd.output().await.map_err(|e| match target.host.connection.transport {
            Transport::Ssh => PhaseExecutionError::Connectivity {
                host: target.id().to_string(),
                reason: format!("could not run {}: {e}", self.ssh_program),
            },
            Transport::Local => PhaseExecutionError::Failed(format!(
                "could not run {}/{phase}: {e}",
                self.phase_root
            )),
        })?;

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let Some(code) = output.status.code() else {
            return Err(PhaseExecutionError::Failed(format!(
                "{op} {phase} was terminated by a signal"
            )));
        };

        if code == SSH_CONNECTION_FAILURE && target.host.connection.transport == Transport::Ssh {
            return Err(PhaseExecutionError::Connectivity {
                host: target.id().to_string(),
                reason: stderr,
            });
        }

        Ok((code, stderr))
    }

    async fn mutate(
        &self,
        phase: Phase,
        op: Operation,
        target: &HostTarget,
    ) -> Result<(), PhaseExecutionError> {
        match self.run(phase, op, target).await? {
            (0, _) => Ok(()),
            (code, stderr) => Err(failure(phase, op, code, &stderr)),
        }
    }
}

fn failure(phase: Phase, op: Operation, code: i32, stderr: &str) -> PhaseExecutionError {
    if stderr.is_empty() {
        PhaseExecutionError::Failed(format!("{op} {phase} exited with status {code}"))
    } else {
        PhaseExecutionError::Failed(format!("{op} {phase} exited with status {code}: {stderr}"))
    }
}

#[async_trait]
impl FabricExecutor for ScriptExecutor {
    fn capabilities(&self) -> &[Capability] {
        &[
            Capability::Probe,
            Capability::ExportStorage,
            Capability::ConnectNamespaces,
            Capability::AssembleRaid,
            Capability::ReexportArrays,
        ]
    }

    async fn probe(
        &self,
        phase: Phase,
        target: &HostTarget,
    ) -> Result<ProbeState, PhaseExecutionError> {
        match self.run(phase, Operation::Probe, target).await? {
            (0, _) => Ok(ProbeState::Configured),
            (EXIT_NOT_CONFIGURED, _) => Ok(ProbeState::Absent),
            (code, stderr) => Err(failure(phase, Operation::Probe, code, &stderr)),
        }
    }

    async fn apply(&self, phase: Phase, target: &HostTarget) -> Result<(), PhaseExecutionError> {
        self.mutate(phase, Operation::Apply, target).await
    }

    async fn revert(&self, phase: Phase, target: &HostTarget) -> Result<(), PhaseExecutionError> {
        self.mutate(phase, Operation::Revert, target).await
    }
}
