//! Metadata and offset store implementations.

pub mod memory;
pub mod r#trait;

// Re-exports for ergonomics
pub use memory::{InMemoryMetadataStore, InMemoryOffsetStore};
pub use r#trait::{MetadataStore, OffsetStore};
