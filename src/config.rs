// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Config, along with its children, is the on-disk model of a storage fabric. The config file is
/// deserialized into a Config object and then validated into a `fabric::Fabric`.
///
/// The document model is intentionally kept separate from the validated in-memory model: the
/// document only has to be deserializable, while the `Fabric` guarantees that every reference
/// between entities resolves.
#[derive(Serialize, Deserialize, Debug, Default, Clone)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub settings: Settings,
    pub hosts: Vec<Host>,
    #[serde(default)]
    pub storage_nodes: Vec<StorageNode>,
    #[serde(default)]
    pub aggregators: Vec<Aggregator>,
    #[serde(default)]
    pub raid_groups: Vec<RaidGroup>,
}

/// Tunables for a run. Every field can be overridden on the command line.
#[derive(Serialize, Deserialize, Debug, Default, Clone)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    pub workers: Option<usize>,
    pub operation_timeout_secs: Option<u64>,
    pub record_dir: Option<String>,
    /// Directory holding one executable per phase on the machine running the deployment.
    pub phase_root: Option<String>,
    /// Directory holding the phase executables on hosts reached over ssh. Defaults to
    /// `phase_root`.
    pub remote_phase_root: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct Host {
    pub id: String,
    pub role: String,
    /// Address used to reach the host. Defaults to the id.
    pub address: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    /// "ssh" (default) or "local".
    pub transport: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct StorageNode {
    pub id: String,
    pub host: String,
    pub nqn: String,
    #[serde(default)]
    pub devices: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct Aggregator {
    pub id: String,
    pub host: String,
    /// The storage nodes whose namespaces this aggregator attaches.
    pub storage_nodes: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct RaidGroup {
    pub id: String,
    pub aggregator: String,
    pub level: String,
    pub members: Vec<String>,
    #[serde(default)]
    pub reexport: bool,
}

impl Config {
    /// Read a config document from `path`. Files ending in `.json` are parsed as JSON, anything
    /// else as TOML.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

        let parse_err = |message: String| ConfigError::Parse {
            path: PathBuf::from(path),
            message,
        };

        if is_json {
            serde_json::from_str(&contents).map_err(|e| parse_err(e.to_string()))
        } else {
            toml::from_str(&contents).map_err(|e| parse_err(e.to_string()))
        }
    }
}
