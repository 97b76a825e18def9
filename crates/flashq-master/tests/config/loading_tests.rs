//! Loading configuration and manifests from disk and seeding a master from them.

use flashq_master::{
    InMemoryMetadataStore, InMemoryOffsetStore, Master, MasterConfig, MasterError, MetadataStore,
    lifecycle::ManageStatus,
    manifest::ManifestLoader,
    types::BrokerId,
};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tempfile::Builder;
use test_log::test;

const MANIFEST_YAML: &str = r#"
brokers:
  - broker_id: 1
    host: 10.0.0.1
    port: 8123
    conf_id: 3
    topics:
      - topic: orders
        partition_count: 4
      - topic: audit
        partition_count: 1
        store_count: 2
        accept_publish: false
  - broker_id: 2
    host: 10.0.0.2
    port: 8123
    manage_status: offline
black_topics:
  analytics:
    - audit
"#;

#[test]
fn test_yaml_config_overrides_defaults() {
    let mut file = Builder::new().suffix(".yaml").tempfile().unwrap();
    write!(
        file,
        "host: master-1\nport: 9000\nbroker_heartbeat_timeout_ms: 2500\nfast_start_enabled: false\n"
    )
    .unwrap();

    let config = MasterConfig::from_path(file.path()).unwrap();
    assert_eq!(config.address(), "master-1:9000");
    assert_eq!(config.broker_heartbeat_timeout(), Duration::from_millis(2500));
    assert!(!config.fast_start_enabled);
    assert_eq!(config.rebalance_parallelism, MasterConfig::default().rebalance_parallelism);
}

#[test]
fn test_json_config_without_extension() {
    let mut file = Builder::new().suffix(".conf").tempfile().unwrap();
    file.write_all(br#"{"max_unfinished_balance_rounds": 3, "row_lock_wait_ms": 10}"#)
        .unwrap();

    let config = MasterConfig::from_path(file.path()).unwrap();
    assert_eq!(config.max_unfinished_balance_rounds, 3);
    assert_eq!(config.row_lock_wait(), Duration::from_millis(10));
}

#[test]
fn test_invalid_configs_are_rejected() {
    let mut file = Builder::new().suffix(".yml").tempfile().unwrap();
    writeln!(file, "heartbeat_check_interval_ms: 0").unwrap();
    assert!(matches!(
        MasterConfig::from_path(file.path()),
        Err(MasterError::InvalidConfig { .. })
    ));

    let config = MasterConfig {
        rebalance_parallelism: 0,
        ..MasterConfig::default()
    };
    let store = Arc::new(InMemoryMetadataStore::new());
    assert!(Master::new(config, store, Arc::new(InMemoryOffsetStore::new())).is_err());
}

#[test]
fn test_missing_config_file() {
    let err = MasterConfig::from_path("/nonexistent/master.yaml").unwrap_err();
    assert!(matches!(err, MasterError::ConfigIo { .. }));
}

#[test]
fn test_manifest_seeds_store() {
    let mut file = Builder::new().suffix(".yaml").tempfile().unwrap();
    file.write_all(MANIFEST_YAML.as_bytes()).unwrap();

    let manifest = ManifestLoader::from_path(file.path()).unwrap();
    let store = InMemoryMetadataStore::new_with_manifest(manifest).unwrap();

    let conf = store.broker_conf(BrokerId(1)).unwrap();
    assert_eq!(conf.conf_id, 3);
    assert_eq!(conf.manage_status, ManageStatus::Online);
    assert_eq!(conf.topics.len(), 2);
    assert_eq!(conf.topics[1].store_count, 2);
    assert!(!conf.topics[1].accept_publish);
    assert!(conf.topics[1].accept_subscribe);

    assert_eq!(
        store.broker_conf(BrokerId(2)).unwrap().manage_status,
        ManageStatus::Offline
    );
    assert!(store.black_topics("analytics").contains("audit"));
    assert!(store.black_topics("billing").is_empty());
}

#[test]
fn test_manifest_export_roundtrips_through_json() {
    let mut file = Builder::new().suffix(".yaml").tempfile().unwrap();
    file.write_all(MANIFEST_YAML.as_bytes()).unwrap();
    let store = InMemoryMetadataStore::new_with_manifest(ManifestLoader::from_path(file.path()).unwrap())
        .unwrap();
    store.set_manage_status(BrokerId(2), ManageStatus::Online).unwrap();

    let mut json = Builder::new().suffix(".json").tempfile().unwrap();
    json.write_all(serde_json::to_string(&store.export_to_manifest()).unwrap().as_bytes())
        .unwrap();
    let reloaded = InMemoryMetadataStore::new_with_manifest(ManifestLoader::from_path(json.path()).unwrap())
        .unwrap();

    assert_eq!(reloaded.broker_confs().len(), 2);
    assert_eq!(
        reloaded.broker_conf(BrokerId(2)).unwrap().manage_status,
        ManageStatus::Online
    );
    assert_eq!(
        reloaded.broker_conf(BrokerId(1)).unwrap().checksum(),
        store.broker_conf(BrokerId(1)).unwrap().checksum()
    );
}

#[test]
fn test_unknown_broker_in_manage_update() {
    let store = InMemoryMetadataStore::new();
    assert!(store.set_manage_status(BrokerId(9), ManageStatus::Offline).is_err());
}
