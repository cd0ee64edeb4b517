// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

#[cfg(test)]
mod tests {
    use std::{fs, path::PathBuf};

    use xidis_lib::{
        error::ConfigError,
        fabric::{Fabric, RaidLevel, Role, Transport},
        phase::Phase,
    };

    fn fixture(name: &str) -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("tests")
            .join("fixtures")
            .join(name)
    }

    #[test]
    fn loads_toml_fabric() {
        let fabric = Fabric::load(&fixture("fabric.toml")).unwrap();

        assert_eq!(fabric.settings.workers, Some(4));
        assert_eq!(fabric.settings.operation_timeout_secs, Some(120));
        assert_eq!(
            fabric.hosts().map(|h| h.id.as_str()).collect::<Vec<_>>(),
            vec!["agg01", "stor01", "stor02"]
        );

        let agg = fabric.host("agg01").unwrap();
        assert_eq!(agg.role, Role::Aggregator);
        assert_eq!(agg.connection.transport, Transport::Ssh);
        assert_eq!(agg.connection.destination(), "root@10.20.1.1");

        let target = fabric.target("agg01").unwrap();
        assert_eq!(target.aggregators.len(), 1);
        assert_eq!(target.raid_groups[0].level, RaidLevel::Raid1);
        assert!(Phase::Reexport.applies_to(&target));

        let stor = fabric.target("stor02").unwrap();
        assert_eq!(stor.storage_nodes[0].devices.len(), 2);
        assert!(stor.raid_groups.is_empty());
    }

    #[test]
    fn loads_json_fabric() {
        let fabric = Fabric::load(&fixture("fabric.json")).unwrap();

        let both = fabric.host("both01").unwrap();
        assert_eq!(both.role, Role::Both);
        assert_eq!(both.connection.transport, Transport::Local);
        assert_eq!(both.connection.destination(), "both01");

        let target = fabric.target("both01").unwrap();
        assert!(Phase::StorageExport.applies_to(&target));
        assert!(Phase::OpusRaid.applies_to(&target));
        assert!(!Phase::Reexport.applies_to(&target));
    }

    #[test]
    fn reports_every_problem_in_a_broken_fabric() {
        let Err(ConfigError::Invalid(errors)) = Fabric::load(&fixture("broken.toml")) else {
            panic!("broken fabric should not validate");
        };

        assert_eq!(
            errors,
            vec![
                "storage node 'sn01' is placed on host 'agg01' whose role is aggregator",
                "aggregator 'a1' references unknown storage node 'sn09'",
                "RAID group 'md0' needs at least 3 members for raid5, has 1",
            ]
        );
    }

    #[test]
    fn unreadable_and_unparsable_files() {
        assert!(matches!(
            Fabric::load(&fixture("no-such-fabric.toml")),
            Err(ConfigError::Read { .. })
        ));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fabric.json");
        fs::write(&path, "[[hosts]]\nid = \"stor01\"\n").unwrap();
        assert!(matches!(
            Fabric::load(&path),
            Err(ConfigError::Parse { .. })
        ));
    }
}
