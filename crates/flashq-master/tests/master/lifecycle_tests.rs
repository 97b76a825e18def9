//! Broker lifecycle driven through register and heartbeat requests.

use crate::test_utilities::*;
use flashq_master::{
    ErrorCode, MasterConfig, MasterError,
    event::EventType,
    lifecycle::{ManageStatus, RunStatus},
    types::BrokerId,
};

#[test]
fn test_online_sequence_opens_subscribe_before_publish() {
    let conf = create_test_broker_conf(1, &[("orders", 2)]);
    let (master, _store) = create_test_master(create_test_config(), vec![conf.clone()]);

    let response = master.broker_register(broker_register_request(&conf)).unwrap();
    assert_eq!(response.manage_status, ManageStatus::Online);
    assert_eq!(response.run_status, RunStatus::WaitRegister);
    assert!(response.conf.is_none());
    let info = master.topics().topic_info("orders", BrokerId(1)).unwrap();
    assert!(!info.accept_publish && !info.accept_subscribe);

    let mut steps = Vec::new();
    for _ in 0..4 {
        let response = master
            .broker_heartbeat(broker_heartbeat_request(&conf))
            .unwrap();
        let info = master.topics().topic_info("orders", BrokerId(1)).unwrap();
        steps.push((response.run_status, info.accept_publish, info.accept_subscribe));
    }
    assert_eq!(
        steps,
        vec![
            (RunStatus::WaitOnline, false, false),
            (RunStatus::OnlyRead, false, true),
            (RunStatus::ReadAndWrite, true, true),
            (RunStatus::Undefined, true, true),
        ]
    );
}

#[test]
fn test_heartbeat_before_dwell_time_keeps_step() {
    let config = MasterConfig {
        step_change_wait_period_ms: 60_000,
        ..create_test_config()
    };
    let conf = create_test_broker_conf(1, &[("orders", 2)]);
    let (master, _store) = create_test_master(config, vec![conf.clone()]);
    master.broker_register(broker_register_request(&conf)).unwrap();

    for _ in 0..3 {
        let response = master
            .broker_heartbeat(broker_heartbeat_request(&conf))
            .unwrap();
        assert_eq!(response.run_status, RunStatus::WaitRegister);
    }
}

#[test]
fn test_fast_start_broker_without_topics_skips_dwell() {
    let config = MasterConfig {
        step_change_wait_period_ms: 60_000,
        fast_start_enabled: true,
        ..create_test_config()
    };
    let conf = create_test_broker_conf(1, &[]);
    let (master, _store) = create_test_master(config, vec![conf.clone()]);
    bring_broker_online(&master, &conf);
}

#[test]
fn test_stale_configuration_is_pushed_until_reported() {
    let conf = create_test_broker_conf(1, &[("orders", 2)]);
    let (master, _store) = create_test_master(create_test_config(), vec![conf.clone()]);

    let mut request = broker_register_request(&conf);
    request.conf_id = 0;
    request.conf_checksum = 0;
    let response = master.broker_register(request).unwrap();
    let push = response.conf.unwrap();
    assert!(response.need_report_data);
    assert_eq!(push.conf_id, conf.conf_id);
    assert_eq!(push.topics, conf.topics);

    let response = master
        .broker_heartbeat(broker_heartbeat_request(&conf))
        .unwrap();
    assert!(response.conf.is_none());
    assert!(!response.need_report_data);
}

#[tokio::test]
async fn test_offline_broker_disconnects_its_partitions() {
    let conf = create_test_broker_conf(1, &[("orders", 4)]);
    let (master, _store) = create_test_master(create_test_config(), vec![conf.clone()]);
    bring_broker_online(&master, &conf);
    register_consumer(&master, "c1", "g1", &["orders"]);
    master.rebalance_now().await;
    drain_events(&master, "c1", "g1");
    assert_eq!(held_keys(&master, "c1").len(), 4);

    master
        .set_broker_manage_status(BrokerId(1), ManageStatus::Offline)
        .unwrap();
    let response = master
        .broker_heartbeat(broker_heartbeat_request(&conf))
        .unwrap();
    assert_eq!(response.manage_status, ManageStatus::Offline);
    assert_eq!(response.run_status, RunStatus::NotReadWrite);
    let info = master.topics().topic_info("orders", BrokerId(1)).unwrap();
    assert!(!info.accept_publish && !info.accept_subscribe);

    master.rebalance_now().await;
    let events = drain_events(&master, "c1", "g1");
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, EventType::OnlyDisconnect);
    assert_eq!(events[0].subscribe_infos.len(), 4);
    assert!(held_keys(&master, "c1").is_empty());
}

#[test]
fn test_unreadable_report_hides_subscribe() {
    let conf = create_test_broker_conf(1, &[("orders", 2)]);
    let (master, _store) = create_test_master(create_test_config(), vec![conf.clone()]);
    bring_broker_online(&master, &conf);

    let mut request = broker_heartbeat_request(&conf);
    request.readable = false;
    master.broker_heartbeat(request).unwrap();
    let info = master.topics().topic_info("orders", BrokerId(1)).unwrap();
    assert!(info.accept_publish);
    assert!(!info.accept_subscribe);

    master
        .broker_heartbeat(broker_heartbeat_request(&conf))
        .unwrap();
    assert!(
        master
            .topics()
            .topic_info("orders", BrokerId(1))
            .unwrap()
            .accept_subscribe
    );
}

#[test]
fn test_register_is_checked_against_configuration() {
    let mut conf = create_test_broker_conf(1, &[("orders", 2)]);
    let (master, store) = create_test_master(create_test_config(), vec![conf.clone()]);

    let mut request = broker_register_request(&conf);
    request.port += 1;
    let err = master.broker_register(request).unwrap_err();
    assert_eq!(err.code(), ErrorCode::BadRequest);

    let mut request = broker_register_request(&conf);
    request.broker_id = BrokerId(7);
    let err = master.broker_register(request).unwrap_err();
    assert!(matches!(err, MasterError::BrokerNotConfigured { broker_id: 7 }));

    conf.manage_status = ManageStatus::Apply;
    store.upsert_broker_conf(conf.clone()).unwrap();
    let err = master.broker_register(broker_register_request(&conf)).unwrap_err();
    assert!(err.is_client_error());
    assert!(!master.brokers().contains(BrokerId(1)));
}

#[test]
fn test_broker_close_withdraws_topics() {
    let conf = create_test_broker_conf(1, &[("orders", 2), ("audit", 1)]);
    let (master, _store) = create_test_master(create_test_config(), vec![conf.clone()]);
    bring_broker_online(&master, &conf);
    assert_eq!(master.topics().topics_of_broker(BrokerId(1)).len(), 2);

    master.broker_close(BrokerId(1)).unwrap();
    assert!(master.topics().topics_of_broker(BrokerId(1)).is_empty());
    assert!(master.broker_runs().status(BrokerId(1)).is_none());

    let err = master
        .broker_heartbeat(broker_heartbeat_request(&conf))
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::HbNoNode);
}

#[test]
fn test_heartbeat_from_broker_moved_back_to_apply_releases_it() {
    let mut conf = create_test_broker_conf(1, &[("orders", 2), ("audit", 1)]);
    let (master, store) = create_test_master(create_test_config(), vec![conf.clone()]);
    bring_broker_online(&master, &conf);
    assert_eq!(master.topics().topics_of_broker(BrokerId(1)).len(), 2);

    conf.manage_status = ManageStatus::Apply;
    store.upsert_broker_conf(conf.clone()).unwrap();
    let err = master
        .broker_heartbeat(broker_heartbeat_request(&conf))
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::BadRequest);
    assert!(!master.brokers().contains(BrokerId(1)));
    assert!(master.broker_runs().status(BrokerId(1)).is_none());
    assert!(master.topics().topics_of_broker(BrokerId(1)).is_empty());

    let err = master
        .broker_heartbeat(broker_heartbeat_request(&conf))
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::HbNoNode);
}

#[test]
fn test_withdrawn_topics_keep_their_subscribers() {
    let conf = create_test_broker_conf(1, &[("orders", 2)]);
    let (master, _store) = create_test_master(create_test_config(), vec![conf.clone()]);
    bring_broker_online(&master, &conf);
    register_consumer(&master, "c1", "g1", &["orders"]);

    master.broker_close(BrokerId(1)).unwrap();
    assert!(master.topics().topic_infos("orders").is_empty());
    assert!(master.topics().subscribing_groups("orders").contains("g1"));

    bring_broker_online(&master, &conf);
    assert_eq!(master.topics().topic_infos("orders").len(), 1);
    assert!(master.topics().subscribing_groups("orders").contains("g1"));
}
