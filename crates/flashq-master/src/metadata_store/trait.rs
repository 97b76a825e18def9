//! Metadata and offset store trait definitions.

use crate::{
    MasterError,
    lifecycle::ManageStatus,
    manifest::{BrokerConf, MasterManifest},
    types::BrokerId,
};
use std::collections::HashSet;

/// Read side of the durable configuration the master coordinates against.
///
/// Broker configuration, black lists and leadership are owned by an external
/// store; the master only reads them, except for the administrative setters.
pub trait MetadataStore: Send + Sync {
    /// Whether this master instance is the active primary.
    fn is_primary(&self) -> bool;

    fn broker_conf(&self, broker_id: BrokerId) -> Option<BrokerConf>;

    /// All configured brokers ordered by id.
    fn broker_confs(&self) -> Vec<BrokerConf>;

    /// Version of the configured broker set, compared against what producers hold.
    fn broker_checksum(&self) -> u64;

    /// Topics a group is administratively blocked from consuming.
    fn black_topics(&self, group: &str) -> HashSet<String>;

    fn set_manage_status(
        &self,
        broker_id: BrokerId,
        status: ManageStatus,
    ) -> Result<(), MasterError>;

    /// Load configuration from a manifest, replacing the current state.
    fn load_from_manifest(&self, manifest: MasterManifest) -> Result<(), MasterError>;

    /// Export the current configuration as a manifest.
    fn export_to_manifest(&self) -> MasterManifest;
}

/// Committed consumer offsets, consulted by the reset balance paths.
pub trait OffsetStore: Send + Sync {
    /// Last committed offset of `group` for the partition with `partition_key`.
    fn committed_offset(&self, group: &str, partition_key: &str) -> Option<i64>;

    fn commit_offset(&self, group: &str, partition_key: &str, offset: i64);
}
