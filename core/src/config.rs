use crate::rules::RuleTable;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

// ── Chameleon detection ────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChameleonConfig {
    /// Maximum days between a deactivation and a candidate successor's grant.
    pub max_gap_days: i64,
    /// Jaro-Winkler similarity of normalized legal names for the `name` signal.
    pub name_similarity_threshold: f64,
}

impl Default for ChameleonConfig {
    fn default() -> Self {
        Self {
            max_gap_days: 730,
            name_similarity_threshold: 0.92,
        }
    }
}

// ── Fraud rings ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FraudRingConfig {
    /// Distinct resolved identities two carriers must share to be linked.
    pub min_shared_identities: usize,
    /// Components smaller than this are not rings.
    pub min_ring_size: usize,
    /// Share of corroborated edges for a `high` ring.
    pub high_corroboration: f64,
    /// Share of corroborated edges for a `medium` ring.
    pub medium_corroboration: f64,
}

impl Default for FraudRingConfig {
    fn default() -> Self {
        Self {
            min_shared_identities: 2,
            min_ring_size: 3,
            high_corroboration: 0.70,
            medium_corroboration: 0.40,
        }
    }
}

// ── Benchmarks ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BenchmarkConfig {
    /// Score at which an insured carrier counts as high risk.
    pub high_risk_score: u32,
    /// Peer percentile at which a carrier counts as an outlier.
    pub outlier_percentile: f64,
}

impl Default for BenchmarkConfig {
    fn default() -> Self {
        Self {
            high_risk_score: 50,
            outlier_percentile: 95.0,
        }
    }
}

// ── Engine ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    /// Reference date for recency rules ("authority granted recently").
    /// Fixed per run so reruns over the same snapshot score identically.
    pub as_of: NaiveDate,
    #[serde(default)]
    pub chameleon: ChameleonConfig,
    #[serde(default)]
    pub fraud_ring: FraudRingConfig,
    #[serde(default)]
    pub benchmarks: BenchmarkConfig,
    /// Optional override of the standard rule table.
    #[serde(default)]
    pub rules: Option<RuleTable>,
}

impl EngineConfig {
    pub fn new(as_of: NaiveDate) -> Self {
        Self {
            as_of,
            chameleon: ChameleonConfig::default(),
            fraud_ring: FraudRingConfig::default(),
            benchmarks: BenchmarkConfig::default(),
            rules: None,
        }
    }

    /// Load from a JSON file.
    /// In tests, use EngineConfig::default_test().
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Cannot read {path}: {e}"))?;
        let config: EngineConfig = serde_json::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Cannot parse {path}: {e}"))?;
        if let Some(table) = &config.rules {
            table.validate()?;
        }
        Ok(config)
    }

    /// The rule table this run scores with.
    pub fn rule_table(&self) -> RuleTable {
        self.rules.clone().unwrap_or_else(RuleTable::standard)
    }

    /// Config with fixed defaults for use in tests.
    pub fn default_test() -> Self {
        Self::new(NaiveDate::from_ymd_opt(2024, 6, 30).unwrap_or_default())
    }
}
