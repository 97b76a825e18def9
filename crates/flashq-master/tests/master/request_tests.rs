//! Request validation, leadership checks and response contents of the client handlers.

use crate::test_utilities::*;
use flashq_master::{
    ErrorCode, MasterError,
    protocol::{
        ConsumerCloseRequest, ConsumerHeartbeatRequest, ProducerHeartbeatRequest,
        ProducerRegisterRequest,
    },
    types::{BrokerId, BrokerInfo, Partition, SubscribeInfo},
};
use std::collections::BTreeSet;

fn producer_register_request(producer_id: &str, topics: &[&str], checksum: u64) -> ProducerRegisterRequest {
    ProducerRegisterRequest {
        producer_id: producer_id.to_string(),
        host: "10.1.0.1".to_string(),
        topics: topics.iter().map(|t| t.to_string()).collect(),
        over_tls: false,
        broker_checksum: checksum,
    }
}

fn held_info(consumer_id: &str, group: &str, topic: &str, partition_id: u32) -> SubscribeInfo {
    SubscribeInfo {
        consumer_id: consumer_id.to_string(),
        group: group.to_string(),
        over_tls: false,
        partition: Partition::new(
            BrokerInfo::new(BrokerId(1), "127.0.0.1", 8001),
            topic,
            partition_id,
        ),
    }
}

#[test]
fn test_standby_master_rejects_every_handler() {
    let conf = create_test_broker_conf(1, &[("orders", 2)]);
    let (master, store) = create_test_master(create_test_config(), vec![conf.clone()]);
    store.set_primary(false);

    let results = vec![
        master.broker_register(broker_register_request(&conf)).map(|_| ()),
        master.broker_heartbeat(broker_heartbeat_request(&conf)).map(|_| ()),
        master.broker_close(BrokerId(1)),
        master
            .producer_register(producer_register_request("p1", &["orders"], 0))
            .map(|_| ()),
        master.producer_close("p1"),
        master
            .consumer_register(consumer_register_request("c1", "g1", &["orders"]))
            .map(|_| ()),
        master
            .consumer_heartbeat(ConsumerHeartbeatRequest {
                consumer_id: "c1".to_string(),
                group: "g1".to_string(),
                ..ConsumerHeartbeatRequest::default()
            })
            .map(|_| ()),
    ];
    for result in results {
        let err = result.unwrap_err();
        assert!(matches!(err, MasterError::NotLeader { .. }), "unexpected {err:?}");
        assert_eq!(err.code(), ErrorCode::NotLeader);
        assert!(err.is_retryable());
    }
    assert!(master.brokers().is_empty());
    assert!(!master.consumers().contains("c1"));
}

#[test]
fn test_group_members_must_share_topics() {
    let (master, _store) = create_test_master(create_test_config(), Vec::new());
    register_consumer(&master, "c1", "g1", &["orders"]);

    let err = master
        .consumer_register(consumer_register_request("c2", "g1", &["orders", "payments"]))
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::BadRequest);
    assert!(err.is_client_error());
    assert!(!master.consumers().contains("c2"));

    // A sole member may change its own topics.
    register_consumer(&master, "c1", "g1", &["payments"]);
    assert!(master.topics().subscribing_groups("payments").contains("g1"));
}

#[test]
fn test_consumer_cannot_switch_groups() {
    let (master, _store) = create_test_master(create_test_config(), Vec::new());
    register_consumer(&master, "c1", "g1", &["orders"]);

    let err = master
        .consumer_register(consumer_register_request("c1", "g2", &["orders"]))
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::BadRequest);

    let err = master
        .consumer_close(ConsumerCloseRequest {
            consumer_id: "c1".to_string(),
            group: "g2".to_string(),
        })
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::BadRequest);
    assert!(master.consumers().contains("c1"));

    master
        .consumer_close(ConsumerCloseRequest {
            consumer_id: "c1".to_string(),
            group: "g1".to_string(),
        })
        .unwrap();
    assert!(!master.consumers().contains("c1"));
    assert!(master.topics().subscribing_groups("orders").is_empty());
}

#[test]
fn test_malformed_requests_are_rejected() {
    let (master, _store) = create_test_master(create_test_config(), Vec::new());

    let mut request = consumer_register_request("c1@x", "g1", &["orders"]);
    assert_eq!(master.consumer_register(request.clone()).unwrap_err().code(), ErrorCode::BadRequest);

    request = consumer_register_request("c1", "g1", &["orders"]);
    request.bound = true;
    assert_eq!(master.consumer_register(request.clone()).unwrap_err().code(), ErrorCode::BadRequest);

    request.session_key = "s1".to_string();
    request.source_count = 1;
    master.consumer_register(request).unwrap();

    let err = master
        .producer_register(producer_register_request("p1", &[], 0))
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::BadRequest);
    assert_eq!(master.producer_close("").unwrap_err().code(), ErrorCode::BadRequest);
}

#[test]
fn test_producer_sees_publishable_partitions() {
    let conf = create_test_broker_conf(1, &[("orders", 3), ("payments", 1)]);
    let (master, store) = create_test_master(create_test_config(), vec![conf.clone()]);

    let response = master
        .producer_register(producer_register_request("p1", &["orders"], u64::MAX))
        .unwrap();
    assert!(response.brokers.is_some());
    assert!(response.topic_partitions["orders"].is_empty());

    bring_broker_online(&master, &conf);
    let checksum = response.broker_checksum;
    let response = master
        .producer_heartbeat(ProducerHeartbeatRequest {
            producer_id: "p1".to_string(),
            topics: ["orders".to_string()].into_iter().collect(),
            broker_checksum: checksum,
        })
        .unwrap();
    assert!(response.brokers.is_none());
    assert_eq!(response.topic_partitions.len(), 1);
    let infos = &response.topic_partitions["orders"];
    assert_eq!(infos.len(), 1);
    assert_eq!(infos[0].broker_id, BrokerId(1));
    assert_eq!(infos[0].total_partitions(), 3);

    // A broker conf change bumps the checksum, so the list is resent.
    store
        .upsert_broker_conf(create_test_broker_conf(2, &[("orders", 1)]))
        .unwrap();
    let response = master
        .producer_heartbeat(ProducerHeartbeatRequest {
            producer_id: "p1".to_string(),
            topics: ["orders".to_string(), "payments".to_string()].into_iter().collect(),
            broker_checksum: checksum,
        })
        .unwrap();
    assert_ne!(response.broker_checksum, checksum);
    assert_eq!(response.brokers.map(|brokers| brokers.len()), Some(1));
    assert_eq!(response.topic_partitions["payments"].len(), 1);
    assert!(master.topics().publishing_producers("payments").contains("p1"));
}

#[tokio::test]
async fn test_allocation_flag_clears_after_first_ack() {
    let conf = create_test_broker_conf(1, &[("orders", 2)]);
    let (master, _store) = create_test_master(create_test_config(), vec![conf.clone()]);
    bring_broker_online(&master, &conf);

    let response = register_consumer(&master, "c1", "g1", &["orders"]);
    assert!(response.not_allocated);
    assert_eq!(response.brokers.len(), 1);

    master.rebalance_now().await;
    let response = master
        .consumer_heartbeat(ConsumerHeartbeatRequest {
            consumer_id: "c1".to_string(),
            group: "g1".to_string(),
            ..ConsumerHeartbeatRequest::default()
        })
        .unwrap();
    assert!(response.not_allocated);
    let event = response.event.unwrap();

    let response = master
        .consumer_heartbeat(ConsumerHeartbeatRequest {
            consumer_id: "c1".to_string(),
            group: "g1".to_string(),
            acked_rebalance_id: event.rebalance_id,
            reported_subscriptions: None,
        })
        .unwrap();
    assert!(!response.not_allocated);
    assert!(response.event.is_none());
    assert_eq!(held_keys(&master, "c1"), event_keys(&event));
}

#[test]
fn test_reported_subscription_replaces_master_view() {
    let conf = create_test_broker_conf(1, &[("orders", 2)]);
    let (master, _store) = create_test_master(create_test_config(), vec![conf.clone()]);
    bring_broker_online(&master, &conf);
    register_consumer(&master, "c1", "g1", &["orders"]);
    assert!(held_keys(&master, "c1").is_empty());

    master
        .consumer_heartbeat(ConsumerHeartbeatRequest {
            consumer_id: "c1".to_string(),
            group: "g1".to_string(),
            acked_rebalance_id: 0,
            reported_subscriptions: Some(vec![held_info("c1", "g1", "orders", 1)]),
        })
        .unwrap();
    let expected: BTreeSet<String> = ["1-orders-1".to_string()].into_iter().collect();
    assert_eq!(held_keys(&master, "c1"), expected);

    let err = master
        .consumer_heartbeat(ConsumerHeartbeatRequest {
            consumer_id: "c1".to_string(),
            group: "g1".to_string(),
            acked_rebalance_id: 0,
            reported_subscriptions: Some(vec![held_info("c2", "g1", "orders", 0)]),
        })
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::BadRequest);
    assert_eq!(held_keys(&master, "c1"), expected);
}

#[test]
fn test_register_with_holdings_seeds_subscription() {
    let (master, _store) = create_test_master(create_test_config(), Vec::new());
    let mut request = consumer_register_request("c1", "g1", &["orders"]);
    request.subscribed = vec![held_info("c1", "g1", "orders", 0)];

    let response = master.consumer_register(request).unwrap();
    assert!(!response.not_allocated);
    assert!(held_keys(&master, "c1").contains("1-orders-0"));
}

#[test]
fn test_concurrent_group_joins_keep_one_topic_set() {
    for round in 0..20 {
        let (master, _store) = create_test_master(create_test_config(), Vec::new());
        let group = format!("g{round}");
        let results: Vec<_> = std::thread::scope(|scope| {
            let joins: Vec<_> = [("c1", "orders"), ("c2", "audit")]
                .into_iter()
                .map(|(consumer_id, topic)| {
                    let master = &master;
                    let group = group.as_str();
                    scope.spawn(move || {
                        master.consumer_register(consumer_register_request(consumer_id, group, &[topic]))
                    })
                })
                .collect();
            joins.into_iter().map(|join| join.join().unwrap()).collect()
        });

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        let rejected = results.into_iter().find_map(Result::err).unwrap();
        assert_eq!(rejected.code(), ErrorCode::BadRequest);

        let members = master.consumers().consumers_of(&group);
        assert_eq!(members.len(), 1);
        let info = master.consumers().group_info(&group).unwrap();
        assert_eq!(info.topics, members[0].topics);
    }
}

#[test]
fn test_first_register_without_holdings_can_clear_allocation_flag() {
    let (master, _store) = create_test_master(create_test_config(), Vec::new());
    let mut request = consumer_register_request("c1", "g1", &["orders"]);
    request.not_allocated = false;

    let response = master.consumer_register(request).unwrap();
    assert!(!response.not_allocated);
}
