use super::Master;
use crate::MasterError;
use crate::heartbeat::NodeClass;
use crate::protocol::{ProducerHeartbeatRequest, ProducerRegisterRequest, ProducerResponse};
use crate::types::ProducerInfo;
use chrono::Utc;
use log::{debug, info};
use std::collections::{BTreeMap, BTreeSet};

impl Master {
    pub fn producer_register(
        &self,
        request: ProducerRegisterRequest,
    ) -> Result<ProducerResponse, MasterError> {
        self.check_primary()?;
        request.validate()?;

        let _guard = self.producer_lock.acquire(&request.producer_id)?;
        let info = ProducerInfo {
            producer_id: request.producer_id,
            host: request.host,
            topics: request.topics,
            over_tls: request.over_tls,
            registered_at: Utc::now(),
        };
        if let Some(previous) = self.producers.add(info.clone()) {
            self.topics
                .remove_producer_pub(&previous.producer_id, &previous.topics);
        }
        self.topics.add_producer_pub(&info.producer_id, &info.topics);
        self.heartbeat
            .register(NodeClass::Producer, &info.producer_id);

        info!(
            "[Producer Register] {} from {} publishing {:?}",
            info.producer_id, info.host, info.topics
        );
        Ok(self.producer_response(&info.topics, request.broker_checksum))
    }

    pub fn producer_heartbeat(
        &self,
        request: ProducerHeartbeatRequest,
    ) -> Result<ProducerResponse, MasterError> {
        self.check_primary()?;
        request.validate()?;

        let _guard = self.producer_lock.acquire(&request.producer_id)?;
        self.heartbeat
            .update(NodeClass::Producer, &request.producer_id)?;

        let Some(mut info) = self.producers.get(&request.producer_id) else {
            return Err(MasterError::NoSuchNode {
                node: format!("producer {}", request.producer_id),
            });
        };
        if info.topics != request.topics {
            debug!(
                "[Producer Heartbeat] {} topics {:?} -> {:?}",
                info.producer_id, info.topics, request.topics
            );
            self.topics
                .remove_producer_pub(&info.producer_id, &info.topics);
            self.topics
                .add_producer_pub(&info.producer_id, &request.topics);
            info.topics = request.topics;
            self.producers.add(info.clone());
        }
        Ok(self.producer_response(&info.topics, request.broker_checksum))
    }

    pub fn producer_close(&self, producer_id: &str) -> Result<(), MasterError> {
        self.check_primary()?;
        if producer_id.is_empty() {
            return Err(MasterError::bad_request(
                "producer close",
                "producer_id is required",
            ));
        }
        if self.release_producer(producer_id)? {
            info!("[Producer Close] {producer_id}");
        }
        Ok(())
    }

    /// Publish-visible topic infos of `topics`, plus the broker list when the
    /// producer's copy is stale.
    fn producer_response(&self, topics: &BTreeSet<String>, broker_checksum: u64) -> ProducerResponse {
        let current_checksum = self.metadata_store.broker_checksum();
        let brokers = (broker_checksum != current_checksum).then(|| self.brokers.all());
        let topic_partitions: BTreeMap<String, Vec<_>> = topics
            .iter()
            .map(|topic| {
                let infos = self
                    .topics
                    .topic_infos(topic)
                    .into_iter()
                    .filter(|info| info.accept_publish && self.brokers.contains(info.broker_id))
                    .collect();
                (topic.clone(), infos)
            })
            .collect();
        ProducerResponse {
            broker_checksum: current_checksum,
            brokers,
            topic_partitions,
        }
    }
}
