// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    path::Path,
    str::FromStr,
};

use serde::Serialize;

use crate::{config, error::ConfigError};

/// What a host contributes to the fabric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Storage,
    Aggregator,
    Both,
}

impl Role {
    pub fn serves_storage(&self) -> bool {
        matches!(self, Role::Storage | Role::Both)
    }

    pub fn serves_aggregation(&self) -> bool {
        matches!(self, Role::Aggregator | Role::Both)
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "storage" => Ok(Role::Storage),
            "aggregator" => Ok(Role::Aggregator),
            "both" => Ok(Role::Both),
            other => Err(format!(
                "unknown role '{other}' (expected storage, aggregator or both)"
            )),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Role::Storage => "storage",
                Role::Aggregator => "aggregator",
                Role::Both => "both",
            }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    Ssh,
    /// Phase programs run directly on the machine running the deployment.
    Local,
}

impl FromStr for Transport {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ssh" => Ok(Transport::Ssh),
            "local" => Ok(Transport::Local),
            other => Err(format!("unknown transport '{other}' (expected ssh or local)")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Connection {
    pub address: String,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub transport: Transport,
}

impl Connection {
    /// The `user@address` form used as an ssh destination.
    pub fn destination(&self) -> String {
        match &self.user {
            Some(user) => format!("{user}@{}", self.address),
            None => self.address.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostSpec {
    pub id: String,
    pub role: Role,
    pub connection: Connection,
}

impl fmt::Display for HostSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

/// A host exporting NVMe namespaces to the fabric.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StorageNode {
    pub id: String,
    pub host: String,
    pub nqn: String,
    pub devices: Vec<String>,
}

/// A host attaching namespaces from storage nodes, over which RAID groups are assembled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Aggregator {
    pub id: String,
    pub host: String,
    pub storage_nodes: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RaidLevel {
    Raid0,
    Raid1,
    Raid5,
    Raid6,
    Raid10,
}

impl RaidLevel {
    pub fn min_members(&self) -> usize {
        match self {
            RaidLevel::Raid0 => 1,
            RaidLevel::Raid1 => 2,
            RaidLevel::Raid5 => 3,
            RaidLevel::Raid6 | RaidLevel::Raid10 => 4,
        }
    }
}

impl FromStr for RaidLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "raid0" => Ok(RaidLevel::Raid0),
            "raid1" => Ok(RaidLevel::Raid1),
            "raid5" => Ok(RaidLevel::Raid5),
            "raid6" => Ok(RaidLevel::Raid6),
            "raid10" => Ok(RaidLevel::Raid10),
            other => Err(format!("unsupported RAID level '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RaidGroup {
    pub id: String,
    pub aggregator: String,
    pub level: RaidLevel,
    pub members: Vec<String>,
    /// Whether the assembled array is exported back onto the fabric.
    pub reexport: bool,
}

/// Everything a phase needs to know about one host: the host itself and the fabric entities
/// that live on it.
#[derive(Debug, Clone, Serialize)]
pub struct HostTarget {
    pub host: HostSpec,
    pub storage_nodes: Vec<StorageNode>,
    pub aggregators: Vec<Aggregator>,
    pub raid_groups: Vec<RaidGroup>,
}

impl HostTarget {
    pub fn id(&self) -> &str {
        &self.host.id
    }

    pub fn role(&self) -> Role {
        self.host.role
    }

    pub fn reexported_groups(&self) -> impl Iterator<Item = &RaidGroup> {
        self.raid_groups.iter().filter(|group| group.reexport)
    }
}

/// Fabric is the validated, read-only model of a storage fabric for the duration of a run.
///
/// A Fabric can only be built through `from_config()`, which guarantees that every id is unique
/// within its collection and that every reference between entities resolves.
#[derive(Debug, Clone)]
pub struct Fabric {
    pub settings: config::Settings,
    hosts: BTreeMap<String, HostSpec>,
    storage_nodes: BTreeMap<String, StorageNode>,
    aggregators: BTreeMap<String, Aggregator>,
    raid_groups: BTreeMap<String, RaidGroup>,
}

/// Insert `value` under `id`, recording a violation if the id was already taken.
fn insert_unique<T>(
    map: &mut BTreeMap<String, T>,
    kind: &str,
    id: &str,
    value: T,
    errors: &mut Vec<String>,
) {
    if map.contains_key(id) {
        errors.push(format!("duplicate {kind} id '{id}'"));
    } else {
        map.insert(id.to_string(), value);
    }
}

impl Fabric {
    /// Load and validate the fabric described by the config file at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Self::from_config(config::Config::from_file(path)?)
    }

    /// Validate a config document, collecting every problem rather than stopping at the first.
    pub fn from_config(conf: config::Config) -> Result<Self, ConfigError> {
        let mut errors = Vec::new();

        if conf.hosts.is_empty() {
            errors.push("no hosts defined".to_string());
        }

        let mut hosts = BTreeMap::new();
        // Hosts already reported as invalid; references to them are not reported again.
        let mut invalid_hosts = BTreeSet::new();
        for host in conf.hosts {
            let role = match host.role.parse::<Role>() {
                Ok(role) => role,
                Err(e) => {
                    errors.push(format!("host '{}': {e}", host.id));
                    invalid_hosts.insert(host.id);
                    continue;
                }
            };
            let transport = match host.transport.as_deref().unwrap_or("ssh").parse() {
                Ok(t) => t,
                Err(e) => {
                    errors.push(format!("host '{}': {e}", host.id));
                    invalid_hosts.insert(host.id);
                    continue;
                }
            };
            let spec = HostSpec {
                connection: Connection {
                    address: host.address.unwrap_or_else(|| host.id.clone()),
                    port: host.port,
                    user: host.user,
                    transport,
                },
                id: host.id.clone(),
                role,
            };
            insert_unique(&mut hosts, "host", &host.id, spec, &mut errors);
        }

        let mut storage_nodes = BTreeMap::new();
        for node in conf.storage_nodes {
            match hosts.get(&node.host) {
                None if invalid_hosts.contains(&node.host) => {}
                None => errors.push(format!(
                    "storage node '{}' references unknown host '{}'",
                    node.id, node.host
                )),
                Some(host) if !host.role.serves_storage() => errors.push(format!(
                    "storage node '{}' is placed on host '{}' whose role is {}",
                    node.id, node.host, host.role
                )),
                Some(_) => {}
            }
            if node.nqn.trim().is_empty() {
                errors.push(format!("storage node '{}' has an empty nqn", node.id));
            }
            let id = node.id.clone();
            let node = StorageNode {
                id: node.id,
                host: node.host,
                nqn: node.nqn,
                devices: node.devices,
            };
            insert_unique(&mut storage_nodes, "storage node", &id, node, &mut errors);
        }

        let mut aggregators = BTreeMap::new();
        for agg in conf.aggregators {
            match hosts.get(&agg.host) {
                None if invalid_hosts.contains(&agg.host) => {}
                None => errors.push(format!(
                    "aggregator '{}' references unknown host '{}'",
                    agg.id, agg.host
                )),
                Some(host) if !host.role.serves_aggregation() => errors.push(format!(
                    "aggregator '{}' is placed on host '{}' whose role is {}",
                    agg.id, agg.host, host.role
                )),
                Some(_) => {}
            }
            for node in agg.storage_nodes.iter() {
                if !storage_nodes.contains_key(node) {
                    errors.push(format!(
                        "aggregator '{}' references unknown storage node '{node}'",
                        agg.id
                    ));
                }
            }
            let id = agg.id.clone();
            let agg = Aggregator {
                id: agg.id,
                host: agg.host,
                storage_nodes: agg.storage_nodes,
            };
            insert_unique(&mut aggregators, "aggregator", &id, agg, &mut errors);
        }

        let mut raid_groups = BTreeMap::new();
        for group in conf.raid_groups {
            let linked = match aggregators.get(&group.aggregator) {
                Some(agg) => Some(&agg.storage_nodes),
                None => {
                    errors.push(format!(
                        "RAID group '{}' references unknown aggregator '{}'",
                        group.id, group.aggregator
                    ));
                    None
                }
            };

            let mut seen = Vec::new();
            for member in group.members.iter() {
                if seen.contains(&member) {
                    errors.push(format!(
                        "RAID group '{}' lists member '{member}' more than once",
                        group.id
                    ));
                    continue;
                }
                seen.push(member);

                if !storage_nodes.contains_key(member) {
                    errors.push(format!(
                        "RAID group '{}' references unknown storage node '{member}'",
                        group.id
                    ));
                } else if let Some(linked) = linked {
                    if !linked.contains(member) {
                        errors.push(format!(
                            "RAID group '{}' member '{member}' is not attached to aggregator '{}'",
                            group.id, group.aggregator
                        ));
                    }
                }
            }

            let level = match group.level.parse::<RaidLevel>() {
                Ok(level) => level,
                Err(e) => {
                    errors.push(format!("RAID group '{}': {e}", group.id));
                    continue;
                }
            };
            if group.members.len() < level.min_members() {
                errors.push(format!(
                    "RAID group '{}' needs at least {} members for {}, has {}",
                    group.id,
                    level.min_members(),
                    group.level,
                    group.members.len()
                ));
            }

            let id = group.id.clone();
            let group = RaidGroup {
                id: group.id,
                aggregator: group.aggregator,
                level,
                members: group.members,
                reexport: group.reexport,
            };
            insert_unique(&mut raid_groups, "RAID group", &id, group, &mut errors);
        }

        if !errors.is_empty() {
            return Err(ConfigError::Invalid(errors));
        }

        Ok(Fabric {
            settings: conf.settings,
            hosts,
            storage_nodes,
            aggregators,
            raid_groups,
        })
    }

    pub fn host(&self, id: &str) -> Option<&HostSpec> {
        self.hosts.get(id)
    }

    pub fn contains_host(&self, id: &str) -> bool {
        self.hosts.contains_key(id)
    }

    /// Hosts in id order.
    pub fn hosts(&self) -> impl Iterator<Item = &HostSpec> {
        self.hosts.values()
    }

    pub fn storage_nodes(&self) -> impl Iterator<Item = &StorageNode> {
        self.storage_nodes.values()
    }

    pub fn aggregators(&self) -> impl Iterator<Item = &Aggregator> {
        self.aggregators.values()
    }

    pub fn raid_groups(&self) -> impl Iterator<Item = &RaidGroup> {
        self.raid_groups.values()
    }

    /// Collect the entities that live on host `id`.
    pub fn target(&self, id: &str) -> Option<HostTarget> {
        let host = self.hosts.get(id)?;
        let aggregators: Vec<Aggregator> = self
            .aggregators()
            .filter(|agg| agg.host == id)
            .cloned()
            .collect();
        let raid_groups = self
            .raid_groups()
            .filter(|group| aggregators.iter().any(|agg| agg.id == group.aggregator))
            .cloned()
            .collect();

        Some(HostTarget {
            host: host.clone(),
            storage_nodes: self
                .storage_nodes()
                .filter(|node| node.host == id)
                .cloned()
                .collect(),
            aggregators,
            raid_groups,
        })
    }

    pub fn print_summary(&self) {
        println!(
            "Fabric with {} hosts, {} storage nodes, {} aggregators, {} RAID groups.",
            self.hosts.len(),
            self.storage_nodes.len(),
            self.aggregators.len(),
            self.raid_groups.len()
        );
        for host in self.hosts() {
            println!(
                "  {} ({}, {})",
                host.id,
                host.role,
                host.connection.destination()
            );
        }
        for group in self.raid_groups() {
            println!(
                "  {} on {}: {:?} over [{}]{}",
                group.id,
                group.aggregator,
                group.level,
                group.members.join(", "),
                if group.reexport { ", re-exported" } else { "" }
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn host(id: &str, role: &str) -> config::Host {
        config::Host {
            id: id.to_string(),
            role: role.to_string(),
            address: None,
            port: None,
            user: None,
            transport: None,
        }
    }

    fn node(id: &str, host: &str) -> config::StorageNode {
        config::StorageNode {
            id: id.to_string(),
            host: host.to_string(),
            nqn: format!("nqn.2024-01.io.xidis:{id}"),
            devices: vec!["/dev/nvme0n1".to_string()],
        }
    }

    #[test]
    fn reports_every_dangling_reference() {
        let conf = Config {
            hosts: vec![host("stor01", "storage"), host("agg01", "aggregator")],
            storage_nodes: vec![node("sn01", "stor01"), node("sn02", "stor99")],
            aggregators: vec![config::Aggregator {
                id: "a1".to_string(),
                host: "agg01".to_string(),
                storage_nodes: vec!["sn01".to_string(), "sn07".to_string()],
            }],
            raid_groups: vec![config::RaidGroup {
                id: "md0".to_string(),
                aggregator: "a2".to_string(),
                level: "raid1".to_string(),
                members: vec!["sn01".to_string(), "sn08".to_string()],
                reexport: false,
            }],
            ..Default::default()
        };

        let ConfigError::Invalid(errors) = Fabric::from_config(conf).unwrap_err() else {
            panic!("expected validation errors");
        };
        assert_eq!(
            errors,
            vec![
                "storage node 'sn02' references unknown host 'stor99'",
                "aggregator 'a1' references unknown storage node 'sn07'",
                "RAID group 'md0' references unknown aggregator 'a2'",
                "RAID group 'md0' references unknown storage node 'sn08'",
            ]
        );
    }

    #[test]
    fn invalid_host_is_reported_once() {
        let mut remote = host("agg01", "aggregator");
        remote.transport = Some("telnet".to_string());
        let conf = Config {
            hosts: vec![host("stor01", "storag"), remote],
            storage_nodes: vec![node("sn01", "stor01")],
            aggregators: vec![config::Aggregator {
                id: "a1".to_string(),
                host: "agg01".to_string(),
                storage_nodes: vec!["sn01".to_string()],
            }],
            ..Default::default()
        };

        let ConfigError::Invalid(errors) = Fabric::from_config(conf).unwrap_err() else {
            panic!("expected validation errors");
        };
        assert_eq!(
            errors,
            vec![
                "host 'stor01': unknown role 'storag' (expected storage, aggregator or both)",
                "host 'agg01': unknown transport 'telnet' (expected ssh or local)",
            ]
        );
    }

    #[test]
    fn rejects_duplicates_and_bad_roles() {
        let conf = Config {
            hosts: vec![
                host("stor01", "storage"),
                host("stor01", "storage"),
                host("x", "compute"),
            ],
            aggregators: vec![config::Aggregator {
                id: "a1".to_string(),
                host: "stor01".to_string(),
                storage_nodes: vec![],
            }],
            ..Default::default()
        };

        let ConfigError::Invalid(errors) = Fabric::from_config(conf).unwrap_err() else {
            panic!("expected validation errors");
        };
        assert_eq!(errors.len(), 3);
        assert!(errors[0].contains("duplicate host id 'stor01'"));
        assert!(errors[1].contains("unknown role 'compute'"));
        assert!(errors[2].contains("whose role is storage"));
    }

    #[test]
    fn raid_members_must_be_linked_and_sufficient() {
        let conf = Config {
            hosts: vec![host("stor01", "storage"), host("agg01", "aggregator")],
            storage_nodes: vec![node("sn01", "stor01"), node("sn02", "stor01")],
            aggregators: vec![config::Aggregator {
                id: "a1".to_string(),
                host: "agg01".to_string(),
                storage_nodes: vec!["sn01".to_string()],
            }],
            raid_groups: vec![config::RaidGroup {
                id: "md0".to_string(),
                aggregator: "a1".to_string(),
                level: "raid5".to_string(),
                members: vec!["sn01".to_string(), "sn02".to_string()],
                reexport: true,
            }],
            ..Default::default()
        };

        let ConfigError::Invalid(errors) = Fabric::from_config(conf).unwrap_err() else {
            panic!("expected validation errors");
        };
        assert_eq!(
            errors,
            vec![
                "RAID group 'md0' member 'sn02' is not attached to aggregator 'a1'",
                "RAID group 'md0' needs at least 3 members for raid5, has 2",
            ]
        );
    }

    #[test]
    fn target_collects_entities_by_host() {
        let fabric = crate::test_env::sample_fabric();

        let agg = fabric.target("agg01").unwrap();
        assert_eq!(agg.aggregators.len(), 1);
        assert_eq!(agg.raid_groups.len(), 1);
        assert!(agg.storage_nodes.is_empty());

        let stor = fabric.target("stor01").unwrap();
        assert_eq!(stor.storage_nodes.len(), 1);
        assert!(stor.raid_groups.is_empty());

        assert!(fabric.target("nope").is_none());
    }
}
