//! # Persistence Tests
//!
//! Snapshots on the filesystem and in redb: round trips, corruption,
//! retention and backups.

use sfm_core::{
    Graph, Node, PersistenceConfig, PersistenceManager, RedbBackend, Relationship,
    RelationshipKind, SfmError, StorageBackend,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

fn sample() -> Graph {
    let mut graph = Graph::new();
    let ministry = graph.add_node(Node::institution("Ministry")).expect("ministry");
    let subsidy = graph.add_node(Node::policy("Subsidy")).expect("policy");
    let farmers = graph.add_node(Node::actor("Farmers")).expect("actor");
    graph
        .add_relationship(Relationship::new(ministry, subsidy, RelationshipKind::Enacts))
        .expect("enacts");
    graph
        .add_relationship(Relationship::new(subsidy, farmers, RelationshipKind::Funds).with_weight(2.5))
        .expect("funds");
    graph
}

fn fs_manager(root: &std::path::Path) -> PersistenceManager {
    PersistenceManager::open(PersistenceConfig {
        storage_path: root.to_path_buf(),
        ..PersistenceConfig::default()
    })
    .expect("open")
}

#[test]
fn filesystem_round_trip_survives_reopen() {
    let dir = tempdir().expect("temp dir");
    let graph = sample();
    {
        let pm = fs_manager(dir.path());
        pm.save("policy", &graph).expect("v1");
        pm.save("policy", &graph).expect("v2");
    }
    assert!(dir.path().join("graphs/policy/v00000002.data").is_file());
    assert!(dir.path().join("graphs/policy/v00000002.meta").is_file());

    let pm = fs_manager(dir.path());
    assert_eq!(pm.list_versions("policy").expect("versions"), vec![1, 2]);
    let loaded = pm.load("policy", Some(1)).expect("load");
    assert_eq!(loaded.snapshot().expect("loaded"), graph.snapshot().expect("original"));
}

#[test]
fn metadata_sidecar_is_readable_json() {
    let dir = tempdir().expect("temp dir");
    let pm = fs_manager(dir.path());
    let meta = pm.save("policy", &sample()).expect("save");
    let raw = std::fs::read_to_string(dir.path().join("graphs/policy/v00000001.meta")).expect("read");
    let json: serde_json::Value = serde_json::from_str(&raw).expect("json");
    assert_eq!(json["graph_id"], "policy");
    assert_eq!(json["version"], 1);
    assert_eq!(json["node_count"], 3);
    assert_eq!(json["checksum"], meta.checksum.as_str());
}

#[test]
fn corrupted_file_fails_with_integrity() {
    let dir = tempdir().expect("temp dir");
    let pm = fs_manager(dir.path());
    pm.save("policy", &sample()).expect("save");

    let path = dir.path().join("graphs/policy/v00000001.data");
    let mut bytes = std::fs::read(&path).expect("read");
    let middle = bytes.len() / 2;
    bytes[middle] ^= 0x5A;
    std::fs::write(&path, bytes).expect("corrupt");

    assert!(!pm.verify("policy", None).expect("verify"));
    let err = pm.load("policy", None).expect_err("corrupted");
    assert!(matches!(err, SfmError::Integrity { ref graph_id, version: 1, .. } if graph_id == "policy"));
}

#[test]
fn uncommitted_data_is_not_a_version() {
    let dir = tempdir().expect("temp dir");
    let pm = fs_manager(dir.path());
    pm.save("policy", &sample()).expect("save");
    // Data without a sidecar, as left by a save that failed midway.
    std::fs::write(dir.path().join("graphs/policy/v00000002.data"), b"partial").expect("orphan");

    assert_eq!(pm.latest_version("policy").expect("latest"), Some(1));
    assert_eq!(pm.load("policy", None).expect("load").node_count(), 3);
}

#[test]
fn redb_backend_keeps_versions_and_backups() {
    let dir = tempdir().expect("temp dir");
    let backend: Arc<dyn StorageBackend> =
        Arc::new(RedbBackend::open(dir.path().join("snapshots.redb")).expect("redb"));
    let pm = PersistenceManager::new(backend, PersistenceConfig::default());
    let graph = sample();
    for _ in 0..4 {
        pm.save("policy", &graph).expect("save");
    }
    assert_eq!(pm.cleanup_old_versions("policy", Some(1)).expect("cleanup"), 3);

    let path = pm.create_backup("policy", None, "before-reform").expect("backup");
    pm.delete_graph("policy").expect("delete");
    assert!(pm.list_graphs().expect("graphs").is_empty());

    let meta = pm.restore_from_backup(&path, None).expect("restore");
    assert_eq!((meta.graph_id.as_str(), meta.version), ("policy", 1));
    assert_eq!(pm.load("policy", None).expect("load").relationship_count(), 2);

    let stats = pm.storage_statistics().expect("stats");
    assert_eq!((stats.graphs, stats.versions, stats.backups), (1, 1, 1));
    assert_eq!(pm.cleanup_old_backups(Duration::ZERO).expect("cleanup"), 1);
}

#[test]
fn default_retention_uses_configured_limit() {
    let dir = tempdir().expect("temp dir");
    let pm = PersistenceManager::open(PersistenceConfig {
        storage_path: dir.path().to_path_buf(),
        max_versions: 2,
        ..PersistenceConfig::default()
    })
    .expect("open");
    for _ in 0..5 {
        pm.save("policy", &sample()).expect("save");
    }
    assert_eq!(pm.cleanup_old_versions("policy", None).expect("cleanup"), 3);
    assert_eq!(pm.list_versions("policy").expect("versions"), vec![4, 5]);
}
