//! Rebalance passes observed through consumer heartbeats.

use crate::test_utilities::*;
use flashq_master::{
    MasterConfig,
    event::EventType,
    protocol::{ConsumerCloseRequest, ConsumerRegisterRequest},
    types::{BrokerId, BrokerInfo, Partition, SubscribeInfo},
};
use std::collections::BTreeSet;

#[tokio::test]
async fn test_orders_partitions_follow_group_membership() {
    let conf = create_test_broker_conf(1, &[("orders", 4)]);
    let (master, _store) = create_test_master(create_test_config(), vec![conf.clone()]);
    bring_broker_online(&master, &conf);
    register_consumer(&master, "c1", "g1", &["orders"]);
    register_consumer(&master, "c2", "g1", &["orders"]);

    master.rebalance_now().await;
    let c1_events = drain_events(&master, "c1", "g1");
    let c2_events = drain_events(&master, "c2", "g1");
    assert_eq!(c1_events.len(), 1);
    assert_eq!(c2_events.len(), 1);
    assert_eq!(c1_events[0].event_type, EventType::OnlyConnect);
    assert_eq!(c2_events[0].event_type, EventType::OnlyConnect);

    let c1_keys = held_keys(&master, "c1");
    let c2_keys = held_keys(&master, "c2");
    assert_eq!(c1_keys.len(), 2);
    assert_eq!(c2_keys.len(), 2);
    assert!(c1_keys.is_disjoint(&c2_keys));
    assert_eq!(c1_keys.union(&c2_keys).count(), 4);

    master
        .consumer_close(ConsumerCloseRequest {
            consumer_id: "c2".to_string(),
            group: "g1".to_string(),
        })
        .unwrap();
    assert!(master.current_subscription("c2").is_none());
    assert!(!master.events().has_event("c2"));
    assert!(!master.consumers().contains("c2"));

    master.rebalance_now().await;
    let survivor = drain_events(&master, "c1", "g1");
    assert_eq!(survivor.len(), 1);
    assert_eq!(survivor[0].event_type, EventType::OnlyConnect);
    assert_eq!(event_keys(&survivor[0]), c2_keys);
    assert_eq!(held_keys(&master, "c1").len(), 4);
}

#[tokio::test]
async fn test_unchanged_cluster_produces_no_events() {
    let conf = create_test_broker_conf(1, &[("orders", 5), ("audit", 3)]);
    let (master, _store) = create_test_master(create_test_config(), vec![conf.clone()]);
    bring_broker_online(&master, &conf);
    for consumer in ["c1", "c2", "c3"] {
        register_consumer(&master, consumer, "g1", &["orders", "audit"]);
    }

    master.rebalance_now().await;
    let mut all_keys = BTreeSet::new();
    for consumer in ["c1", "c2", "c3"] {
        drain_events(&master, consumer, "g1");
        let held = held_keys(&master, consumer);
        assert!(all_keys.is_disjoint(&held));
        all_keys.extend(held);
    }
    assert_eq!(all_keys.len(), 8);

    master.rebalance_now().await;
    for consumer in ["c1", "c2", "c3"] {
        assert!(!master.events().has_event(consumer), "{consumer} got an event");
    }
}

#[tokio::test]
async fn test_black_listed_topic_is_only_disconnected() {
    let conf = create_test_broker_conf(1, &[("orders", 4)]);
    let (master, store) = create_test_master(create_test_config(), vec![conf.clone()]);
    bring_broker_online(&master, &conf);
    register_consumer(&master, "c1", "g1", &["orders"]);
    register_consumer(&master, "c2", "g1", &["orders"]);
    master.rebalance_now().await;
    drain_events(&master, "c1", "g1");
    drain_events(&master, "c2", "g1");

    store.add_black_topic("g1", "orders");
    master.rebalance_now().await;
    for consumer in ["c1", "c2"] {
        let events = drain_events(&master, consumer, "g1");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::OnlyDisconnect);
        assert_eq!(events[0].subscribe_infos.len(), 2);
        assert!(held_keys(&master, consumer).is_empty());
    }
}

#[tokio::test]
async fn test_disconnect_is_delivered_before_connect() {
    let conf = create_test_broker_conf(1, &[("orders", 2)]);
    let (master, _store) = create_test_master(create_test_config(), vec![conf.clone()]);
    bring_broker_online(&master, &conf);

    // The consumer still holds a partition of a broker that is gone.
    let departed = BrokerInfo::new(BrokerId(9), "10.0.0.9", 8009);
    let mut request: ConsumerRegisterRequest = consumer_register_request("c1", "g1", &["orders"]);
    request.subscribed = vec![SubscribeInfo {
        consumer_id: "c1".to_string(),
        group: "g1".to_string(),
        over_tls: false,
        partition: Partition::new(departed, "orders", 0),
    }];
    let response = master.consumer_register(request).unwrap();
    assert!(!response.not_allocated);

    master.rebalance_now().await;
    let rebalance_id = master.last_rebalance_id();

    let first = consumer_heartbeat(&master, "c1", "g1", 0).unwrap();
    assert_eq!(first.event_type, EventType::Disconnect);
    assert_eq!(first.rebalance_id, rebalance_id);
    assert_eq!(event_keys(&first), BTreeSet::from(["9-orders-0".to_string()]));

    // Nothing new until the disconnect is acknowledged.
    assert!(consumer_heartbeat(&master, "c1", "g1", 0).is_none());

    let second = consumer_heartbeat(&master, "c1", "g1", rebalance_id).unwrap();
    assert_eq!(second.event_type, EventType::Connect);
    assert!(held_keys(&master, "c1").is_empty());

    assert!(consumer_heartbeat(&master, "c1", "g1", rebalance_id).is_none());
    assert_eq!(
        held_keys(&master, "c1"),
        BTreeSet::from(["1-orders-0".to_string(), "1-orders-1".to_string()])
    );
}

#[tokio::test]
async fn test_unacknowledged_backlog_is_dropped_after_max_rounds() {
    let config = MasterConfig {
        max_unfinished_balance_rounds: 2,
        ..create_test_config()
    };
    let conf = create_test_broker_conf(1, &[("orders", 2)]);
    let (master, _store) = create_test_master(config, vec![conf.clone()]);
    bring_broker_online(&master, &conf);
    register_consumer(&master, "c1", "g1", &["orders"]);

    master.rebalance_now().await;
    let first_id = master.last_rebalance_id();
    assert_eq!(master.events().peek("c1").unwrap().rebalance_id, first_id);

    // The group is left alone for two passes while its events are outstanding.
    for _ in 0..2 {
        master.rebalance_now().await;
        assert_eq!(master.events().pending_count("c1"), 1);
        assert_eq!(master.events().peek("c1").unwrap().rebalance_id, first_id);
    }
    assert_eq!(master.events().unfinished_count("g1"), 2);

    master.rebalance_now().await;
    let cleared_id = master.last_rebalance_id();
    let event = master.events().peek("c1").unwrap();
    assert_eq!(master.events().pending_count("c1"), 1);
    assert_eq!(event.rebalance_id, cleared_id);
    assert_eq!(event.event_type, EventType::OnlyConnect);
    assert_eq!(master.events().unfinished_count("g1"), 0);

    // The round count starts over, so the new backlog gets the full allowance again.
    for _ in 0..2 {
        master.rebalance_now().await;
        assert_eq!(master.events().peek("c1").unwrap().rebalance_id, cleared_id);
    }
    master.rebalance_now().await;
    assert_eq!(
        master.events().peek("c1").unwrap().rebalance_id,
        master.last_rebalance_id()
    );
}

#[tokio::test]
async fn test_bound_group_waits_for_all_members() {
    let conf = create_test_broker_conf(1, &[("orders", 3)]);
    let (master, _store) = create_test_master(create_test_config(), vec![conf.clone()]);
    bring_broker_online(&master, &conf);

    let bound = |consumer_id: &str, partitions: &[(&str, i64)]| {
        let mut request = consumer_register_request(consumer_id, "g1", &["orders"]);
        request.bound = true;
        request.session_key = "session-1".to_string();
        request.source_count = 2;
        request.required_partitions = partitions
            .iter()
            .map(|(key, offset)| (key.to_string(), *offset))
            .collect();
        request
    };
    master
        .consumer_register(bound("c1", &[("1-orders-0", 100)]))
        .unwrap();
    master.rebalance_now().await;
    assert!(!master.events().has_event("c1"));

    master
        .consumer_register(bound("c2", &[("1-orders-1", -1), ("1-orders-2", -1)]))
        .unwrap();
    master.rebalance_now().await;

    let c1_events = drain_events(&master, "c1", "g1");
    assert_eq!(c1_events.len(), 1);
    assert_eq!(c1_events[0].subscribe_infos[0].partition.reset_offset, Some(100));
    let c2_events = drain_events(&master, "c2", "g1");
    assert_eq!(event_keys(&c2_events[0]).len(), 2);
    assert!(
        c2_events[0]
            .subscribe_infos
            .iter()
            .all(|info| info.partition.reset_offset.is_none())
    );
}
