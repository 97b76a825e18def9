use super::Master;
use crate::MasterError;
use crate::balancer::SubscriptionMap;
use crate::event::ConsumerEvent;
use crate::heartbeat::NodeClass;
use crate::protocol::{
    ConsumerCloseRequest, ConsumerHeartbeatRequest, ConsumerHeartbeatResponse,
    ConsumerRegisterRequest, ConsumerRegisterResponse,
};
use crate::types::{ConsumerInfo, SubscribeInfo, consumer_heartbeat_key};
use chrono::Utc;
use log::{debug, info, warn};
use std::collections::BTreeSet;

/// Index reported subscriptions by topic and partition key.
fn subscription_map(infos: &[SubscribeInfo]) -> SubscriptionMap {
    let mut subs = SubscriptionMap::new();
    for info in infos {
        subs.entry(info.partition.topic.clone())
            .or_default()
            .insert(info.partition.key(), info.partition.clone());
    }
    subs
}

fn partition_keys(subs: &SubscriptionMap) -> BTreeSet<&str> {
    subs.values()
        .flat_map(|held| held.keys().map(String::as_str))
        .collect()
}

impl Master {
    pub fn consumer_register(
        &self,
        request: ConsumerRegisterRequest,
    ) -> Result<ConsumerRegisterResponse, MasterError> {
        self.check_primary()?;
        request.validate()?;

        let consumer = ConsumerInfo {
            consumer_id: request.consumer_id,
            group: request.group,
            host: request.host,
            topics: request.topics,
            topic_conditions: request.topic_conditions,
            over_tls: request.over_tls,
            bound: request.bound,
            required_partitions: request.required_partitions,
            session_key: request.session_key,
            source_count: request.source_count,
            select_big: request.select_big,
            registered_at: Utc::now(),
        };
        let consumer_id = consumer.consumer_id.clone();
        let group = consumer.group.clone();

        let _guard = self.consumer_lock.acquire(&consumer_id)?;
        self.consumers.add(consumer.clone())?;

        // A re-registering client starts over: whatever it was sent before is void.
        let stale = self.events.remove_all(&consumer_id);
        if stale > 0 {
            debug!("[Consumer Register] {consumer_id} dropped {stale} stale events");
        }
        if request.subscribed.is_empty() {
            self.current_sub.remove(&consumer_id);
            if !request.not_allocated {
                self.consumers.set_allocated(&group);
            }
        } else {
            self.current_sub
                .insert(consumer_id.clone(), subscription_map(&request.subscribed));
            self.consumers.set_allocated(&group);
        }

        self.topics.add_group_sub(&group, &consumer.topics);
        self.heartbeat
            .register(NodeClass::Consumer, &consumer.heartbeat_key());
        info!(
            "[Consumer Register] {consumer_id}@{group} from {} topics {:?} bound={} tls={} holding {}",
            consumer.host,
            consumer.topics,
            consumer.bound,
            consumer.over_tls,
            request.subscribed.len()
        );

        Ok(ConsumerRegisterResponse {
            not_allocated: self.consumers.is_not_allocated(&group),
            brokers: self.brokers.all(),
        })
    }

    /// Record liveness, apply an acknowledged event, reconcile a reported
    /// subscription, then hand out the next pending event.
    pub fn consumer_heartbeat(
        &self,
        request: ConsumerHeartbeatRequest,
    ) -> Result<ConsumerHeartbeatResponse, MasterError> {
        self.check_primary()?;
        request.validate()?;

        let consumer_id = request.consumer_id.as_str();
        let group = request.group.as_str();
        let _guard = self.consumer_lock.acquire(consumer_id)?;
        self.heartbeat.update(
            NodeClass::Consumer,
            &consumer_heartbeat_key(consumer_id, group),
        )?;

        let mut acknowledged = false;
        if request.acked_rebalance_id > 0 {
            self.consumers.set_allocated(group);
            if let Some(event) = self
                .events
                .acknowledge(consumer_id, request.acked_rebalance_id)
            {
                self.apply_event(consumer_id, &event);
                acknowledged = true;
            }
        }

        if let Some(reported) = &request.reported_subscriptions {
            let reported = subscription_map(reported);
            let consistent = self
                .current_sub
                .get(consumer_id)
                .is_some_and(|current| partition_keys(&current) == partition_keys(&reported))
                || (reported.is_empty() && !self.current_sub.contains_key(consumer_id));
            if !consistent {
                if !acknowledged {
                    warn!(
                        "[Subscription Mismatch] {consumer_id}@{group} reported {} partitions, replacing the master's view",
                        partition_keys(&reported).len()
                    );
                }
                if reported.is_empty() {
                    self.current_sub.remove(consumer_id);
                } else {
                    self.current_sub.insert(consumer_id.to_string(), reported);
                }
            }
        }

        Ok(ConsumerHeartbeatResponse {
            not_allocated: self.consumers.is_not_allocated(group),
            event: self.events.next_for_delivery(consumer_id),
        })
    }

    pub fn consumer_close(&self, request: ConsumerCloseRequest) -> Result<(), MasterError> {
        self.check_primary()?;
        if request.consumer_id.is_empty() || request.group.is_empty() {
            return Err(MasterError::bad_request(
                "consumer close",
                "consumer_id and group are required",
            ));
        }
        match self.consumers.group_of(&request.consumer_id) {
            Some(group) if group != request.group => Err(MasterError::bad_request(
                "consumer close",
                format!(
                    "consumer {} belongs to group {group}, not {}",
                    request.consumer_id, request.group
                ),
            )),
            _ => {
                if self.release_consumer(&request.consumer_id)?.is_some() {
                    info!("[Consumer Close] {}@{}", request.consumer_id, request.group);
                }
                Ok(())
            }
        }
    }

    /// Fold an acknowledged event into what the consumer holds.
    fn apply_event(&self, consumer_id: &str, event: &ConsumerEvent) {
        let mut subs = self.current_sub.entry(consumer_id.to_string()).or_default();
        for info in &event.subscribe_infos {
            let partition = &info.partition;
            if event.event_type.is_connect() {
                subs.entry(partition.topic.clone())
                    .or_default()
                    .insert(partition.key(), partition.clone());
            } else if let Some(held) = subs.get_mut(&partition.topic) {
                held.remove(&partition.key());
            }
        }
        subs.retain(|_, held| !held.is_empty());
        debug!(
            "[Apply Event] {consumer_id} rebalance_id={} type={} now holds {}",
            event.rebalance_id,
            event.event_type,
            partition_keys(&subs).len()
        );
    }
}
