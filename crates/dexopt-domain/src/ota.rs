use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The partition slot that holds a staged OTA update.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OtaSlot {
    #[serde(rename = "_a")]
    A,
    #[serde(rename = "_b")]
    B,
}

impl OtaSlot {
    pub fn as_str(self) -> &'static str {
        match self {
            OtaSlot::A => "_a",
            OtaSlot::B => "_b",
        }
    }

    /// Parses an optional slot token; `None` denotes a Mainline update.
    pub fn parse_optional(value: Option<&str>) -> Result<Option<Self>, ParseOtaSlotError> {
        value.map(str::parse).transpose()
    }
}

impl fmt::Display for OtaSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid OTA slot '{0}' (expected \"_a\" or \"_b\")")]
pub struct ParseOtaSlotError(pub String);

impl FromStr for OtaSlot {
    type Err = ParseOtaSlotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "_a" => Ok(OtaSlot::A),
            "_b" => Ok(OtaSlot::B),
            other => Err(ParseOtaSlotError(other.to_string())),
        }
    }
}
