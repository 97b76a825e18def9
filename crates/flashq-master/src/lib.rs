//! FlashQ master: coordination for a broker/producer/consumer pub-sub cluster.
//!
//! The master tracks registered brokers, producers and consumer groups, detects
//! dead nodes through heartbeats, walks brokers through their lifecycle and
//! periodically rebalances partitions across the members of each consumer
//! group. Consumers learn about their partitions through connect/disconnect
//! events delivered one at a time on their heartbeats.

pub mod balancer;
pub mod config;
pub mod error;
pub mod event;
pub mod heartbeat;
pub mod lifecycle;
pub mod manifest;
pub mod master;
pub mod metadata_store;
pub mod protocol;
pub mod registry;
pub mod row_lock;
pub mod telemetry;
pub mod types;

pub use config::MasterConfig;
pub use error::{ErrorCode, MasterError};
pub use master::Master;

// Re-export commonly used store types for ergonomics
pub use metadata_store::{InMemoryMetadataStore, InMemoryOffsetStore, MetadataStore, OffsetStore};

// Re-export logging macros for consistent usage across the crate
pub use log::{debug, error, info, trace, warn};
