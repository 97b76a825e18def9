//! Master manifest handling: broker configuration and black lists.

pub mod loader;
pub mod types;

// Re-exports for ergonomics
pub use loader::ManifestLoader;
pub use types::{BrokerConf, MasterManifest, TopicConf};
