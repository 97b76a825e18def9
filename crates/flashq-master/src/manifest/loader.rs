//! Manifest and configuration file loading.

use super::types::MasterManifest;
use crate::MasterError;
use serde::de::DeserializeOwned;
use std::path::Path;

/// Manifest loader with file I/O operations.
pub struct ManifestLoader;

impl ManifestLoader {
    /// Load the metadata manifest from a file path.
    /// Supports both JSON (.json) and YAML (.yaml/.yml) formats based on file extension.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<MasterManifest, MasterError> {
        read_document(path.as_ref(), "manifest")
    }
}

/// Read a JSON or YAML document, picking the format from the extension.
pub(crate) fn read_document<T: DeserializeOwned>(
    path: &Path,
    what: &str,
) -> Result<T, MasterError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| MasterError::from_io_error(e, &format!("{what} loading")))?;

    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or("");

    match extension.to_lowercase().as_str() {
        "json" => serde_json::from_str(&content)
            .map_err(|e| MasterError::from_parse_error(e, &format!("JSON {what} parsing"))),
        "yaml" | "yml" => serde_yaml::from_str(&content)
            .map_err(|e| MasterError::from_parse_error(e, &format!("YAML {what} parsing"))),
        _ => serde_json::from_str(&content)
            .or_else(|_| serde_yaml::from_str(&content))
            .map_err(|e| {
                MasterError::from_parse_error(
                    e,
                    &format!("{what} parsing (tried both JSON and YAML)"),
                )
            }),
    }
}
