//! Heartbeat timeouts and the periodic tasks started by the master.

use crate::test_utilities::*;
use flashq_master::{
    ErrorCode, MasterConfig, MasterError,
    heartbeat::NodeClass,
    protocol::{ConsumerHeartbeatRequest, ProducerHeartbeatRequest, ProducerRegisterRequest},
    types::BrokerId,
};
use std::time::{Duration, Instant};

fn create_liveness_config() -> MasterConfig {
    MasterConfig {
        producer_heartbeat_timeout_ms: 100,
        consumer_heartbeat_timeout_ms: 100,
        broker_heartbeat_timeout_ms: 100,
        ..create_test_config()
    }
}

fn later() -> Instant {
    Instant::now() + Duration::from_millis(500)
}

#[tokio::test]
async fn test_consumer_timeout_releases_exactly_once() {
    let conf = create_test_broker_conf(1, &[("orders", 2)]);
    let (master, _store) = create_test_master(create_liveness_config(), vec![conf.clone()]);
    bring_broker_online(&master, &conf);
    register_consumer(&master, "c1", "g1", &["orders"]);
    master.rebalance_now().await;
    drain_events(&master, "c1", "g1");
    assert_eq!(held_keys(&master, "c1").len(), 2);

    let expired = master.heartbeat().expire_nodes(NodeClass::Consumer, later());
    assert_eq!(expired, vec!["c1@g1".to_string()]);
    assert!(!master.consumers().contains("c1"));
    assert!(master.current_subscription("c1").is_none());
    assert!(master.topics().subscribing_groups("orders").is_empty());

    assert!(master.heartbeat().expire_nodes(NodeClass::Consumer, later()).is_empty());

    let err = master
        .consumer_heartbeat(ConsumerHeartbeatRequest {
            consumer_id: "c1".to_string(),
            group: "g1".to_string(),
            ..ConsumerHeartbeatRequest::default()
        })
        .unwrap_err();
    assert!(matches!(err, MasterError::NoSuchNode { .. }));
    assert_eq!(err.code(), ErrorCode::HbNoNode);

    register_consumer(&master, "c1", "g1", &["orders"]);
    assert!(consumer_heartbeat(&master, "c1", "g1", 0).is_none());
}

#[test]
fn test_heartbeat_keeps_consumer_alive() {
    let (master, _store) = create_test_master(create_liveness_config(), Vec::new());
    register_consumer(&master, "c1", "g1", &["orders"]);

    let now = Instant::now();
    assert!(master.heartbeat().expire_nodes(NodeClass::Consumer, now).is_empty());
    assert!(master.consumers().contains("c1"));
}

#[test]
fn test_broker_timeout_withdraws_topics() {
    let conf = create_test_broker_conf(1, &[("orders", 2)]);
    let (master, _store) = create_test_master(create_liveness_config(), vec![conf.clone()]);
    bring_broker_online(&master, &conf);
    assert_eq!(master.topics().topic_infos("orders").len(), 1);

    let expired = master.heartbeat().expire_nodes(NodeClass::Broker, later());
    assert_eq!(expired, vec!["1".to_string()]);
    assert!(!master.brokers().contains(BrokerId(1)));
    assert!(master.topics().topic_infos("orders").is_empty());
}

#[test]
fn test_producer_timeout_unpublishes_topics() {
    let (master, _store) = create_test_master(create_liveness_config(), Vec::new());
    master
        .producer_register(ProducerRegisterRequest {
            producer_id: "p1".to_string(),
            host: "10.1.0.1".to_string(),
            topics: ["orders".to_string()].into_iter().collect(),
            ..ProducerRegisterRequest::default()
        })
        .unwrap();
    assert!(master.topics().publishing_producers("orders").contains("p1"));

    master.heartbeat().expire_nodes(NodeClass::Producer, later());
    assert!(master.topics().publishing_producers("orders").is_empty());
    assert!(!master.producers().contains("p1"));

    let err = master
        .producer_heartbeat(ProducerHeartbeatRequest {
            producer_id: "p1".to_string(),
            topics: ["orders".to_string()].into_iter().collect(),
            broker_checksum: 0,
        })
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::HbNoNode);
}

#[tokio::test]
async fn test_started_master_expires_silent_consumers() {
    let config = MasterConfig {
        consumer_heartbeat_timeout_ms: 50,
        heartbeat_check_interval_ms: 10,
        ..create_test_config()
    };
    let (master, _store) = create_test_master(config, Vec::new());
    master.start();
    register_consumer(&master, "c1", "g1", &["orders"]);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!master.consumers().contains("c1"));

    master.stop();
    assert!(master.is_stopped());
}

#[tokio::test]
async fn test_started_master_runs_balance_passes() {
    let config = MasterConfig {
        first_balance_delay_after_start_ms: 10,
        consumer_balance_period_ms: 20,
        ..create_test_config()
    };
    let conf = create_test_broker_conf(1, &[("orders", 2)]);
    let (master, _store) = create_test_master(config, vec![conf.clone()]);
    bring_broker_online(&master, &conf);
    register_consumer(&master, "c1", "g1", &["orders"]);
    master.start();

    tokio::time::sleep(Duration::from_millis(300)).await;
    master.stop();
    master.wait_for_rebalance().await;
    assert!(master.last_rebalance_id() >= 1);
    assert!(master.events().has_event("c1"));
}
