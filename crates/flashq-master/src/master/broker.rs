use super::{Master, broker_key};
use crate::MasterError;
use crate::heartbeat::NodeClass;
use crate::lifecycle::{BrokerSyncStatus, ManageStatus};
use crate::manifest::BrokerConf;
use crate::protocol::{BrokerConfPush, BrokerHeartbeatRequest, BrokerRegisterRequest, BrokerResponse};
use crate::types::{BrokerId, BrokerInfo};
use log::{info, warn};
use std::time::Instant;

fn broker_response(status: &BrokerSyncStatus, conf: &BrokerConf) -> BrokerResponse {
    let stale = status.needs_conf_push();
    BrokerResponse {
        manage_status: status.manage_status,
        run_status: status.run_status,
        conf: stale.then(|| BrokerConfPush {
            conf_id: conf.conf_id,
            conf_checksum: conf.checksum(),
            topics: conf.topics.clone(),
        }),
        need_report_data: stale,
    }
}

impl Master {
    /// Admit a broker whose address matches its configured record.
    pub fn broker_register(&self, request: BrokerRegisterRequest) -> Result<BrokerResponse, MasterError> {
        self.check_primary()?;
        request.validate()?;

        let broker_id = request.broker_id;
        let context = "broker register";
        let conf = self
            .metadata_store
            .broker_conf(broker_id)
            .ok_or(MasterError::BrokerNotConfigured {
                broker_id: broker_id.into(),
            })?;
        if conf.host != request.host || conf.port != request.port {
            return Err(MasterError::bad_request(
                context,
                format!(
                    "{broker_id} registered from {}:{} but is configured at {}:{}",
                    request.host, request.port, conf.host, conf.port
                ),
            ));
        }
        if request.tls_enabled && conf.tls_port != request.tls_port {
            return Err(MasterError::bad_request(
                context,
                format!(
                    "{broker_id} TLS port {} differs from configured {}",
                    request.tls_port, conf.tls_port
                ),
            ));
        }
        if conf.manage_status == ManageStatus::Apply {
            return Err(MasterError::bad_request(
                context,
                format!("{broker_id} is still in {}", conf.manage_status),
            ));
        }

        let mut info = BrokerInfo::new(broker_id, request.host, request.port);
        if request.tls_enabled {
            info = info.with_tls(request.tls_port);
        }
        if let Some(previous) = self.brokers.register(info.clone()) {
            if previous != info {
                warn!("[Broker Register] {broker_id} address changed: {previous:?} -> {info:?}");
            }
        }

        let mut status = BrokerSyncStatus::new(&conf, self.config.fast_start_enabled, Instant::now());
        status.record_report(&conf, request.conf_id, request.conf_checksum);
        let response = broker_response(&status, &conf);
        info!(
            "[Broker Register] {broker_id} at {}:{} manage={} run={:?} fast_start={} conf_loaded={}",
            info.host, info.port, status.manage_status, status.run_status, status.fast_start, status.loaded
        );
        self.broker_runs.register(status);
        self.heartbeat.register(NodeClass::Broker, &broker_key(broker_id));

        if let Err(err) = self.push_topology(broker_id) {
            warn!("[Broker Register] {broker_id} topology push deferred: {err}");
        }
        Ok(response)
    }

    /// Record liveness and reports, follow manage-status changes and advance the
    /// lifecycle by at most one step.
    pub fn broker_heartbeat(&self, request: BrokerHeartbeatRequest) -> Result<BrokerResponse, MasterError> {
        self.check_primary()?;

        let broker_id = request.broker_id;
        self.heartbeat
            .update(NodeClass::Broker, &broker_key(broker_id))?;
        let Some(conf) = self.metadata_store.broker_conf(broker_id) else {
            warn!("[Broker Heartbeat] {broker_id} lost its configuration, releasing");
            self.release_on_heartbeat(broker_id);
            return Err(MasterError::BrokerNotConfigured {
                broker_id: broker_id.into(),
            });
        };
        if conf.manage_status == ManageStatus::Apply {
            warn!("[Broker Heartbeat] {broker_id} went back to {}, releasing", conf.manage_status);
            self.release_on_heartbeat(broker_id);
            return Err(MasterError::bad_request(
                "broker heartbeat",
                format!("{broker_id} is in {} and must register again", conf.manage_status),
            ));
        }
        self.brokers
            .update_report(broker_id, request.readable, request.writable);

        let now = Instant::now();
        let status = self
            .broker_runs
            .update(broker_id, |status| {
                status.broker_online = request.online;
                status.record_report(&conf, request.conf_id, request.conf_checksum);
                if status.update_manage_status(conf.manage_status, now) {
                    info!(
                        "[Broker Manage] {broker_id} -> {}, restarting at {:?}",
                        status.manage_status, status.run_status
                    );
                }
                if let Some(step) = status.advance(now, &self.config) {
                    info!(
                        "[Broker Step] {broker_id} {} -> {step:?} publish={} subscribe={}",
                        status.manage_status,
                        status.visibility.accept_publish,
                        status.visibility.accept_subscribe
                    );
                }
                status.clone()
            })
            .ok_or_else(|| MasterError::NoSuchNode {
                node: format!("broker {broker_id}"),
            })?;

        if let Err(err) = self.push_topology(broker_id) {
            warn!("[Broker Heartbeat] {broker_id} topology push deferred: {err}");
        }
        Ok(broker_response(&status, &conf))
    }

    pub fn broker_close(&self, broker_id: BrokerId) -> Result<(), MasterError> {
        self.check_primary()?;
        self.release_broker(broker_id)?;
        info!("[Broker Close] {broker_id}");
        Ok(())
    }

    /// The broker's own heartbeat keeps it registered, so a failed release is
    /// retried on the next one.
    fn release_on_heartbeat(&self, broker_id: BrokerId) {
        if let Err(err) = self.release_broker(broker_id) {
            warn!("[Broker Heartbeat] release of {broker_id} deferred: {err}");
        }
    }

    /// Change a broker's operator intent. Takes effect on its next heartbeat.
    pub fn set_broker_manage_status(
        &self,
        broker_id: BrokerId,
        status: ManageStatus,
    ) -> Result<(), MasterError> {
        self.check_primary()?;
        self.metadata_store.set_manage_status(broker_id, status)?;
        info!("[Broker Manage] {broker_id} intent set to {status}");
        Ok(())
    }
}
