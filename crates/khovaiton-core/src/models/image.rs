//! Image record and mapping value models

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::FabricCode;
use crate::util::is_http_url;

/// Code-to-image table as held by the mapping store and the persisted cache.
pub type MappingTable = BTreeMap<FabricCode, MappingValue>;

/// Value side of a mapping entry: a remote object id or a literal URL.
///
/// Serialized as the bare string; anything starting with `http(s)://` is a
/// literal URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MappingValue {
    ObjectId(String),
    LiteralUrl(String),
}

impl MappingValue {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::ObjectId(value) | Self::LiteralUrl(value) => value,
        }
    }

    #[must_use]
    pub fn object_id(&self) -> Option<&str> {
        match self {
            Self::ObjectId(value) => Some(value),
            Self::LiteralUrl(_) => None,
        }
    }
}

impl From<String> for MappingValue {
    fn from(value: String) -> Self {
        let value = value.trim().to_string();
        if is_http_url(&value) {
            Self::LiteralUrl(value)
        } else {
            Self::ObjectId(value)
        }
    }
}

impl From<&str> for MappingValue {
    fn from(value: &str) -> Self {
        Self::from(value.to_string())
    }
}

impl From<MappingValue> for String {
    fn from(value: MappingValue) -> Self {
        match value {
            MappingValue::ObjectId(value) | MappingValue::LiteralUrl(value) => value,
        }
    }
}

impl fmt::Display for MappingValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a resolved image came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ImageSource {
    Runtime,
    Persisted,
    Mapping,
    RemoteProbe,
}

/// A resolved or recorded image for one fabric code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageRecord {
    pub fabric_code: FabricCode,
    pub url: String,
    /// Present only when the exact remote object is known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_id: Option<String>,
    pub source: ImageSource,
    /// Unix ms.
    pub timestamp: i64,
}
