//! Fabric code model

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Business identifier of one inventory item.
///
/// Case-sensitive and kept verbatim (spaces and punctuation included); only
/// blank codes are rejected.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FabricCode(String);

impl FabricCode {
    pub fn new(raw: impl Into<String>) -> Result<Self> {
        let raw = raw.into();
        if raw.trim().is_empty() {
            return Err(Error::InvalidInput(
                "Fabric code cannot be empty".to_string(),
            ));
        }
        Ok(Self(raw))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for FabricCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for FabricCode {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for FabricCode {
    type Error = Error;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<FabricCode> for String {
    fn from(value: FabricCode) -> Self {
        value.0
    }
}

impl AsRef<str> for FabricCode {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for FabricCode {
    fn borrow(&self) -> &str {
        &self.0
    }
}
