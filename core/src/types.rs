//! Shared primitive types used across the entire engine.

use serde::{Deserialize, Serialize};

/// USDOT registry number. The stable identity of a carrier.
pub type DotNumber = i64;

/// 16-hex-character address fingerprint (see `normalize::normalize_address`).
pub type AddressHash = String;

/// The canonical run identifier.
pub type RunId = String;

/// Qualitative bucket for how strongly a detected relationship is corroborated.
///
/// Ordered `Low < Medium < High` so rules can ask for a minimum tier.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

impl Confidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            _ => None,
        }
    }
}
