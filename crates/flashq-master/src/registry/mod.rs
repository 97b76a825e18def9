//! In-memory registries of brokers, producers, consumers and topic topology.

pub mod broker;
pub mod consumer;
pub mod producer;
pub mod topic;

// Re-exports for ergonomics
pub use broker::{BrokerInfoHolder, BrokerReport};
pub use consumer::{ConsumerGroupInfo, ConsumerInfoHolder};
pub use producer::ProducerInfoHolder;
pub use topic::TopicPSInfoManager;
