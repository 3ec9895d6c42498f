//! The risk rule table.
//!
//! RULE: rules are data. A rule is a flag id, a point value and a
//! `Predicate` over one carrier's joined profile. The scoring loop never
//! special-cases a flag; adding or re-weighting a rule is a table edit.
//!
//! Tiered families (address overlap, officer fan-out) use half-open
//! `[min, max)` ranges so exactly one tier of a family can fire.

use crate::{
    error::{EngineError, EngineResult, RuleError},
    normalize::looks_like_po_box,
    snapshot::Carrier,
    types::Confidence,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;

/// Diagnostic flag: at least one rule could not be evaluated.
pub const PARTIAL_EVALUATION: &str = "PARTIAL_EVALUATION";

pub const STANDARD_TABLE_VERSION: &str = "2024.1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuleTable {
    pub version: String,
    pub rules: Vec<RiskRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RiskRule {
    pub flag: String,
    pub points: u32,
    pub predicate: Predicate,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Predicate {
    AddressClusterSize {
        min: usize,
        #[serde(default)]
        max: Option<usize>,
    },
    OfficerClusterSize {
        min: usize,
        #[serde(default)]
        max: Option<usize>,
    },
    FatalCrashes {
        min: i64,
    },
    CrashCount {
        min: i64,
    },
    VehicleOosRate {
        min_rate: f64,
        min_inspections: i64,
    },
    DriverOosRate {
        min_rate: f64,
        min_inspections: i64,
    },
    EldViolations {
        min: i64,
    },
    RecentAuthority {
        within_days: i64,
    },
    AuthorityRevokedReissued,
    InactiveAtClusteredAddress {
        min_cluster_size: usize,
    },
    InsuranceLapsed,
    PppLoanReceived,
    PppLoanTotal {
        min_amount: f64,
    },
    PppForgivenAtSharedAddress {
        min_cluster_size: usize,
    },
    PoBoxAddress,
    MissingPhysicalAddress,
    ForeignMailing,
    ChameleonSuccessor {
        min_confidence: Confidence,
    },
    ChameleonPredecessor {
        min_confidence: Confidence,
    },
    FraudRingMember {
        min_confidence: Confidence,
    },
}

/// Everything a rule may look at for one carrier. Built once per carrier
/// from the snapshot and the earlier stages' outputs; read-only.
#[derive(Debug, Clone)]
pub struct CarrierProfile<'a> {
    pub carrier: &'a Carrier,
    /// Size of the address cluster the carrier belongs to (0 if none).
    pub address_cluster_size: usize,
    /// Largest resolved (non name-only) officer identity it is linked to.
    pub officer_cluster_size: usize,
    /// Strongest pair in which the carrier is the successor.
    pub chameleon_successor: Option<Confidence>,
    /// Strongest pair in which the carrier is the predecessor.
    pub chameleon_predecessor: Option<Confidence>,
    /// Confidence of the fraud ring the carrier belongs to.
    pub fraud_ring: Option<Confidence>,
    pub as_of: NaiveDate,
}

/// Result of folding a table over one profile.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RuleOutcome {
    pub score: u32,
    pub flags: Vec<String>,
    pub failures: Vec<(String, RuleError)>,
}

impl RuleOutcome {
    pub fn is_partial(&self) -> bool {
        !self.failures.is_empty()
    }
}

impl RuleTable {
    /// Parse a table from JSON and validate it.
    pub fn from_json(json: &str) -> EngineResult<Self> {
        let table: RuleTable = serde_json::from_str(json)?;
        table.validate()?;
        Ok(table)
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.version.trim().is_empty() {
            return Err(EngineError::InvalidRuleTable {
                reason: "version must not be empty".into(),
            });
        }
        let mut seen = HashSet::new();
        for rule in &self.rules {
            if rule.flag.trim().is_empty() {
                return Err(EngineError::InvalidRuleTable {
                    reason: "rule with empty flag".into(),
                });
            }
            if rule.flag == PARTIAL_EVALUATION {
                return Err(EngineError::InvalidRuleTable {
                    reason: format!("{PARTIAL_EVALUATION} is reserved"),
                });
            }
            if !seen.insert(rule.flag.as_str()) {
                return Err(EngineError::InvalidRuleTable {
                    reason: format!("duplicate flag {}", rule.flag),
                });
            }
        }
        Ok(())
    }

    /// SHA-256 of the canonical JSON form. Recorded with every run so a
    /// weight change is visible in the audit trail.
    pub fn fingerprint(&self) -> EngineResult<String> {
        let bytes = serde_json::to_vec(self)?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }

    /// Evaluate every rule independently and sum the points of those that
    /// fire. Flags come out in table order, each at most once.
    pub fn evaluate(&self, profile: &CarrierProfile<'_>) -> RuleOutcome {
        let mut outcome = RuleOutcome::default();
        for rule in &self.rules {
            match rule.predicate.evaluate(profile) {
                Ok(true) => {
                    outcome.score = outcome.score.saturating_add(rule.points);
                    outcome.flags.push(rule.flag.clone());
                }
                Ok(false) => {}
                Err(e) => outcome.failures.push((rule.flag.clone(), e)),
            }
        }
        if outcome.is_partial() {
            outcome.flags.push(PARTIAL_EVALUATION.to_string());
        }
        outcome
    }

    /// The production table.
    pub fn standard() -> Self {
        use Predicate::*;
        let rule = |flag: &str, points: u32, predicate: Predicate| RiskRule {
            flag: flag.to_string(),
            points,
            predicate,
        };
        Self {
            version: STANDARD_TABLE_VERSION.to_string(),
            rules: vec![
                rule("ADDRESS_OVERLAP_5+", 10, AddressClusterSize { min: 5, max: Some(10) }),
                rule("ADDRESS_OVERLAP_10+", 20, AddressClusterSize { min: 10, max: Some(25) }),
                rule("ADDRESS_OVERLAP_25+", 35, AddressClusterSize { min: 25, max: None }),
                rule("OFFICER_5_PLUS", 20, OfficerClusterSize { min: 5, max: Some(10) }),
                rule("OFFICER_10_PLUS", 35, OfficerClusterSize { min: 10, max: Some(25) }),
                rule("OFFICER_25_PLUS", 50, OfficerClusterSize { min: 25, max: None }),
                rule("FATAL_CRASHES", 25, FatalCrashes { min: 1 }),
                rule("HIGH_CRASH_COUNT", 15, CrashCount { min: 5 }),
                rule("HIGH_VEHICLE_OOS", 15, VehicleOosRate { min_rate: 0.30, min_inspections: 5 }),
                rule("HIGH_DRIVER_OOS", 10, DriverOosRate { min_rate: 0.15, min_inspections: 5 }),
                rule("ELD_VIOLATIONS_5_PLUS", 25, EldViolations { min: 5 }),
                rule("NEW_AUTHORITY", 10, RecentAuthority { within_days: 180 }),
                rule("AUTHORITY_REVOKED_REISSUED", 15, AuthorityRevokedReissued),
                rule("INACTIVE_AT_CLUSTERED_ADDRESS", 10, InactiveAtClusteredAddress { min_cluster_size: 2 }),
                rule("INSURANCE_LAPSE", 20, InsuranceLapsed),
                rule("PPP_LOAN", 5, PppLoanReceived),
                rule("PPP_LARGE_LOAN", 15, PppLoanTotal { min_amount: 150_000.0 }),
                rule("PPP_FORGIVEN_SHARED_ADDRESS", 15, PppForgivenAtSharedAddress { min_cluster_size: 2 }),
                rule("PO_BOX_ADDRESS", 10, PoBoxAddress),
                rule("NO_PHYSICAL_ADDRESS", 15, MissingPhysicalAddress),
                rule("FOREIGN_MAILING", 10, ForeignMailing),
                rule("CHAMELEON_SUCCESSOR", 30, ChameleonSuccessor { min_confidence: Confidence::Medium }),
                rule("CHAMELEON_PREDECESSOR", 20, ChameleonPredecessor { min_confidence: Confidence::Medium }),
                rule("FRAUD_RING", 25, FraudRingMember { min_confidence: Confidence::Medium }),
            ],
        }
    }
}

impl Predicate {
    /// Decide whether the predicate holds. Only the fields this predicate
    /// reads are validated, so one malformed aggregate fails one rule.
    pub fn evaluate(&self, p: &CarrierProfile<'_>) -> Result<bool, RuleError> {
        let c = p.carrier;
        let hit = match self {
            Self::AddressClusterSize { min, max } => in_range(p.address_cluster_size, *min, *max),
            Self::OfficerClusterSize { min, max } => in_range(p.officer_cluster_size, *min, *max),
            Self::FatalCrashes { min } => count("fatal_crashes", c.fatal_crashes)? >= *min,
            Self::CrashCount { min } => count("total_crashes", c.total_crashes)? >= *min,
            Self::VehicleOosRate {
                min_rate,
                min_inspections,
            } => {
                let inspections = count("total_inspections", c.total_inspections)?;
                rate("vehicle_oos_rate", c.vehicle_oos_rate)? >= *min_rate
                    && inspections >= *min_inspections
            }
            Self::DriverOosRate {
                min_rate,
                min_inspections,
            } => {
                let inspections = count("total_inspections", c.total_inspections)?;
                rate("driver_oos_rate", c.driver_oos_rate)? >= *min_rate
                    && inspections >= *min_inspections
            }
            Self::EldViolations { min } => count("eld_violations", c.eld_violations)? >= *min,
            Self::RecentAuthority { within_days } => c.authority_granted.is_some_and(|granted| {
                let age = (p.as_of - granted).num_days();
                (0..=*within_days).contains(&age)
            }),
            Self::AuthorityRevokedReissued => {
                c.revocation_pending
                    || matches!(
                        (c.authority_revoked, c.authority_granted),
                        (Some(revoked), Some(granted)) if revoked < granted
                    )
            }
            Self::InactiveAtClusteredAddress { min_cluster_size } => {
                !c.is_active() && p.address_cluster_size >= *min_cluster_size
            }
            Self::InsuranceLapsed => c.insurance_lapse_date.is_some_and(|d| d < p.as_of),
            Self::PppLoanReceived => count("ppp.loan_count", c.ppp.loan_count)? > 0,
            Self::PppLoanTotal { min_amount } => amount("ppp.loan_total", c.ppp.loan_total)? >= *min_amount,
            Self::PppForgivenAtSharedAddress { min_cluster_size } => {
                amount("ppp.forgiven_total", c.ppp.forgiven_total)? > 0.0
                    && p.address_cluster_size >= *min_cluster_size
            }
            Self::PoBoxAddress => c.physical_address.as_deref().is_some_and(looks_like_po_box),
            Self::MissingPhysicalAddress => c
                .physical_address
                .as_deref()
                .map_or(true, |a| a.trim().is_empty()),
            Self::ForeignMailing => c.mailing_country.as_deref().is_some_and(|country| {
                let country = country.trim().to_uppercase();
                !country.is_empty() && country != "US" && country != "USA"
            }),
            Self::ChameleonSuccessor { min_confidence } => {
                p.chameleon_successor.is_some_and(|tier| tier >= *min_confidence)
            }
            Self::ChameleonPredecessor { min_confidence } => {
                p.chameleon_predecessor.is_some_and(|tier| tier >= *min_confidence)
            }
            Self::FraudRingMember { min_confidence } => p.fraud_ring.is_some_and(|tier| tier >= *min_confidence),
        };
        Ok(hit)
    }
}

fn in_range(value: usize, min: usize, max: Option<usize>) -> bool {
    value >= min && max.map_or(true, |max| value < max)
}

fn count(field: &'static str, value: i64) -> Result<i64, RuleError> {
    if value < 0 {
        return Err(RuleError::NegativeCount { field, value });
    }
    Ok(value)
}

fn rate(field: &'static str, value: f64) -> Result<f64, RuleError> {
    if !value.is_finite() || !(0.0..=1.0).contains(&value) {
        return Err(RuleError::InvalidRate { field, value });
    }
    Ok(value)
}

fn amount(field: &'static str, value: f64) -> Result<f64, RuleError> {
    if !value.is_finite() || value < 0.0 {
        return Err(RuleError::InvalidAmount { field, value });
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn as_of() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 30).unwrap()
    }

    fn profile(carrier: &Carrier) -> CarrierProfile<'_> {
        CarrierProfile {
            carrier,
            address_cluster_size: 0,
            officer_cluster_size: 0,
            chameleon_successor: None,
            chameleon_predecessor: None,
            fraud_ring: None,
            as_of: as_of(),
        }
    }

    #[test]
    fn standard_table_is_valid() {
        RuleTable::standard().validate().unwrap();
    }

    #[test]
    fn duplicate_flags_rejected() {
        let mut table = RuleTable::standard();
        let dup = table.rules[0].clone();
        table.rules.push(dup);
        assert!(matches!(table.validate(), Err(EngineError::InvalidRuleTable { .. })));
    }

    #[test]
    fn reserved_flag_rejected() {
        let mut table = RuleTable::standard();
        table.rules[0].flag = PARTIAL_EVALUATION.into();
        assert!(table.validate().is_err());
    }

    #[test]
    fn address_tiers_are_exclusive() {
        let table = RuleTable::standard();
        let carrier = Carrier::new(1, "A").at("1 Main St", "X", "TX", "75001");
        for (size, expected) in [
            (4, None),
            (6, Some("ADDRESS_OVERLAP_5+")),
            (10, Some("ADDRESS_OVERLAP_10+")),
            (40, Some("ADDRESS_OVERLAP_25+")),
        ] {
            let mut p = profile(&carrier);
            p.address_cluster_size = size;
            let flags: Vec<_> = table
                .evaluate(&p)
                .flags
                .into_iter()
                .filter(|f| f.starts_with("ADDRESS_OVERLAP"))
                .collect();
            assert_eq!(flags, expected.into_iter().map(String::from).collect::<Vec<_>>(), "size {size}");
        }
    }

    #[test]
    fn malformed_rate_fails_only_its_rule() {
        let table = RuleTable::standard();
        let carrier = Carrier::new(1, "A")
            .at("1 Main St", "X", "TX", "75001")
            .with_crashes(0, 2)
            .with_inspections(10, f64::NAN, 0.5);
        let outcome = table.evaluate(&profile(&carrier));
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].0, "HIGH_VEHICLE_OOS");
        assert!(outcome.flags.contains(&"FATAL_CRASHES".to_string()));
        assert!(outcome.flags.contains(&"HIGH_DRIVER_OOS".to_string()));
        assert_eq!(outcome.flags.last().map(String::as_str), Some(PARTIAL_EVALUATION));
        assert_eq!(outcome.score, 25 + 10);
    }

    #[test]
    fn fingerprint_tracks_weights() {
        let a = RuleTable::standard();
        let mut b = RuleTable::standard();
        b.rules[6].points += 1;
        assert_ne!(a.fingerprint().unwrap(), b.fingerprint().unwrap());
        assert_eq!(a.fingerprint().unwrap(), RuleTable::standard().fingerprint().unwrap());
    }

    #[test]
    fn table_round_trips_through_json() {
        let json = serde_json::to_string(&RuleTable::standard()).unwrap();
        assert_eq!(RuleTable::from_json(&json).unwrap(), RuleTable::standard());
    }

    #[test]
    fn revoked_then_reissued() {
        let d = |m| NaiveDate::from_ymd_opt(2023, m, 1).unwrap();
        let mut carrier = Carrier::new(1, "A");
        carrier.authority_revoked = Some(d(1));
        carrier.authority_granted = Some(d(3));
        assert!(Predicate::AuthorityRevokedReissued.evaluate(&profile(&carrier)).unwrap());
        carrier.authority_granted = Some(d(1));
        carrier.authority_revoked = Some(d(3));
        assert!(!Predicate::AuthorityRevokedReissued.evaluate(&profile(&carrier)).unwrap());
    }
}
