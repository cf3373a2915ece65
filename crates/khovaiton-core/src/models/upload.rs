//! Upload result model

use serde::{Deserialize, Serialize};

/// Outcome of a successful upload to the remote image store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResult {
    /// Stable remote object identifier.
    pub object_id: String,
    pub url: String,
    pub format: String,
    pub width: u32,
    pub height: u32,
    pub bytes: u64,
    /// RFC 3339 timestamp reported by the store.
    pub created_at: String,
}
