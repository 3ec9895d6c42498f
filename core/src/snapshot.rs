//! Read-only input snapshot for one engine run.
//!
//! A snapshot is loaded once (from the store, or built in memory by tests)
//! and never mutated while stages run. Every stage reads from it; no stage
//! writes to it.

use crate::{
    error::EngineError,
    normalize::{is_known_address, normalize_address, normalize_name, normalize_phone},
    types::{AddressHash, DotNumber},
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum OperatingStatus {
    #[default]
    Active,
    Inactive,
}

impl OperatingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
        }
    }
}

impl FromStr for OperatingStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "inactive" => Ok(Self::Inactive),
            other => Err(EngineError::UnknownStatus(other.to_string())),
        }
    }
}

/// PPP totals aggregated from loans pre-matched to this carrier.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct PppTotals {
    pub loan_count: i64,
    pub loan_total: f64,
    pub forgiven_total: f64,
}

/// One registry record plus its safety and financial aggregates.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Carrier {
    pub dot_number: DotNumber,
    pub legal_name: String,
    pub physical_address: Option<String>,
    pub physical_city: Option<String>,
    pub physical_state: Option<String>,
    pub physical_zip: Option<String>,
    pub mailing_country: Option<String>,
    pub phone: Option<String>,
    pub status: OperatingStatus,
    pub authority_granted: Option<NaiveDate>,
    pub authority_revoked: Option<NaiveDate>,
    pub revocation_pending: bool,
    pub insurance_lapse_date: Option<NaiveDate>,
    pub power_units: i64,
    pub total_inspections: i64,
    pub total_crashes: i64,
    pub fatal_crashes: i64,
    pub vehicle_oos_rate: f64,
    pub driver_oos_rate: f64,
    pub eld_violations: i64,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub ppp: PppTotals,
    /// Derived from the physical address fields; see `rehash()`.
    pub address_hash: AddressHash,
}

impl Default for Carrier {
    fn default() -> Self {
        Self {
            dot_number: 0,
            legal_name: String::new(),
            physical_address: None,
            physical_city: None,
            physical_state: None,
            physical_zip: None,
            mailing_country: None,
            phone: None,
            status: OperatingStatus::Active,
            authority_granted: None,
            authority_revoked: None,
            revocation_pending: false,
            insurance_lapse_date: None,
            power_units: 0,
            total_inspections: 0,
            total_crashes: 0,
            fatal_crashes: 0,
            vehicle_oos_rate: 0.0,
            driver_oos_rate: 0.0,
            eld_violations: 0,
            latitude: None,
            longitude: None,
            ppp: PppTotals::default(),
            address_hash: crate::normalize::UNKNOWN_ADDRESS_HASH.to_string(),
        }
    }
}

impl Carrier {
    pub fn new(dot_number: DotNumber, legal_name: &str) -> Self {
        Self {
            dot_number,
            legal_name: legal_name.to_string(),
            ..Self::default()
        }
    }

    /// Recompute `address_hash` from the physical address fields.
    pub fn rehash(&mut self) {
        self.address_hash = normalize_address(
            self.physical_address.as_deref().unwrap_or_default(),
            self.physical_city.as_deref().unwrap_or_default(),
            self.physical_state.as_deref().unwrap_or_default(),
            self.physical_zip.as_deref().unwrap_or_default(),
        );
    }

    /// The address hash, unless it is the unknown sentinel.
    pub fn address_key(&self) -> Option<&str> {
        is_known_address(&self.address_hash).then_some(self.address_hash.as_str())
    }

    pub fn normalized_phone(&self) -> Option<String> {
        self.phone.as_deref().and_then(normalize_phone)
    }

    pub fn is_active(&self) -> bool {
        self.status == OperatingStatus::Active
    }

    pub fn state(&self) -> Option<&str> {
        self.physical_state
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    // ── Builders (fixtures, tooling) ───────────────────────────────

    pub fn at(mut self, street: &str, city: &str, state: &str, zip: &str) -> Self {
        self.physical_address = Some(street.to_string());
        self.physical_city = Some(city.to_string());
        self.physical_state = Some(state.to_string());
        self.physical_zip = Some(zip.to_string());
        self.rehash();
        self
    }

    pub fn with_phone(mut self, phone: &str) -> Self {
        self.phone = Some(phone.to_string());
        self
    }

    pub fn with_status(mut self, status: OperatingStatus) -> Self {
        self.status = status;
        self
    }

    pub fn granted(mut self, date: NaiveDate) -> Self {
        self.authority_granted = Some(date);
        self
    }

    /// Mark the carrier deactivated on `date`.
    pub fn revoked(mut self, date: NaiveDate) -> Self {
        self.authority_revoked = Some(date);
        self.status = OperatingStatus::Inactive;
        self
    }

    pub fn with_crashes(mut self, total: i64, fatal: i64) -> Self {
        self.total_crashes = total;
        self.fatal_crashes = fatal;
        self
    }

    pub fn with_inspections(mut self, total: i64, vehicle_oos_rate: f64, driver_oos_rate: f64) -> Self {
        self.total_inspections = total;
        self.vehicle_oos_rate = vehicle_oos_rate;
        self.driver_oos_rate = driver_oos_rate;
        self
    }

    pub fn with_coordinates(mut self, latitude: f64, longitude: f64) -> Self {
        self.latitude = Some(latitude);
        self.longitude = Some(longitude);
        self
    }

    pub fn with_ppp(mut self, loan_count: i64, loan_total: f64, forgiven_total: f64) -> Self {
        self.ppp = PppTotals {
            loan_count,
            loan_total,
            forgiven_total,
        };
        self
    }
}

/// One officer-roster row as ingested.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RosterEntry {
    pub dot_number: DotNumber,
    pub raw_name: String,
    #[serde(default)]
    pub normalized_name: String,
    #[serde(default)]
    pub position: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

impl RosterEntry {
    pub fn new(dot_number: DotNumber, raw_name: &str) -> Self {
        Self {
            dot_number,
            raw_name: raw_name.to_string(),
            normalized_name: normalize_name(raw_name),
            position: None,
            phone: None,
            email: None,
        }
    }

    pub fn with_phone(mut self, phone: &str) -> Self {
        self.phone = Some(phone.to_string());
        self
    }

    pub fn with_email(mut self, email: &str) -> Self {
        self.email = Some(email.to_string());
        self
    }

    pub fn with_position(mut self, position: &str) -> Self {
        self.position = Some(position.to_string());
        self
    }
}

/// One PPP loan row, matched to a carrier upstream (or not at all).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PppLoan {
    pub loan_id: String,
    #[serde(default)]
    pub matched_dot_number: Option<DotNumber>,
    #[serde(default)]
    pub borrower_name: String,
    pub loan_amount: f64,
    #[serde(default)]
    pub forgiven_amount: f64,
}

/// One insurance filing: a policy a company wrote for a carrier, and its
/// cancellation if any.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InsurancePolicy {
    pub dot_number: DotNumber,
    pub insurance_company: String,
    #[serde(default)]
    pub policy_number: Option<String>,
    #[serde(default)]
    pub effective_date: Option<NaiveDate>,
    #[serde(default)]
    pub cancel_effective_date: Option<NaiveDate>,
}

impl InsurancePolicy {
    pub fn new(dot_number: DotNumber, insurance_company: &str) -> Self {
        Self {
            dot_number,
            insurance_company: insurance_company.to_string(),
            policy_number: None,
            effective_date: None,
            cancel_effective_date: None,
        }
    }

    pub fn effective(mut self, date: NaiveDate) -> Self {
        self.effective_date = Some(date);
        self
    }

    pub fn cancelled(mut self, date: NaiveDate) -> Self {
        self.cancel_effective_date = Some(date);
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_effective_date.is_some()
    }
}

/// Insurer names grouped case- and spacing-insensitively.
pub fn insurer_key(raw: &str) -> String {
    raw.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_uppercase()
}

/// The raw input tables as one JSON document. Used by the runner's
/// `--load` and by fixtures. Carrier `ppp` totals in the document are
/// ignored: they are always aggregated from `ppp_loans`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Dataset {
    #[serde(default)]
    pub carriers: Vec<Carrier>,
    #[serde(default)]
    pub roster: Vec<RosterEntry>,
    #[serde(default)]
    pub ppp_loans: Vec<PppLoan>,
    #[serde(default)]
    pub insurance: Vec<InsurancePolicy>,
}

impl Dataset {
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

/// The full read-only input of a run, with lookup indexes.
#[derive(Debug, Clone)]
pub struct DatasetSnapshot {
    carriers: Vec<Carrier>,
    roster: Vec<RosterEntry>,
    by_dot: HashMap<DotNumber, usize>,
    names_by_dot: HashMap<DotNumber, BTreeSet<String>>,
    rehashed: Vec<DotNumber>,
    insurance: Vec<InsurancePolicy>,
}

impl DatasetSnapshot {
    /// Build a snapshot. Carriers are ordered by DOT number and roster rows
    /// by (name, DOT, raw name) so every downstream iteration is stable.
    /// Roster rows with an empty normalized name are dropped.
    ///
    /// Every address hash is recomputed here. Rows written by ingestion may
    /// carry the column default or a hash from an older algorithm; the ones
    /// that changed are listed by `rehashed()`.
    pub fn new(mut carriers: Vec<Carrier>, roster: Vec<RosterEntry>) -> Self {
        carriers.sort_by_key(|c| c.dot_number);
        carriers.dedup_by_key(|c| c.dot_number);

        let mut rehashed = Vec::new();
        for c in &mut carriers {
            let stored = std::mem::take(&mut c.address_hash);
            c.rehash();
            if c.address_hash != stored {
                rehashed.push(c.dot_number);
            }
        }

        let mut roster: Vec<RosterEntry> = roster
            .into_iter()
            .map(|mut r| {
                if r.normalized_name.is_empty() {
                    r.normalized_name = normalize_name(&r.raw_name);
                }
                r
            })
            .filter(|r| !r.normalized_name.is_empty())
            .collect();
        roster.sort_by(|a, b| {
            (&a.normalized_name, a.dot_number, &a.raw_name)
                .cmp(&(&b.normalized_name, b.dot_number, &b.raw_name))
        });

        let by_dot = carriers
            .iter()
            .enumerate()
            .map(|(i, c)| (c.dot_number, i))
            .collect();

        let mut names_by_dot: HashMap<DotNumber, BTreeSet<String>> = HashMap::new();
        for r in &roster {
            names_by_dot
                .entry(r.dot_number)
                .or_default()
                .insert(r.normalized_name.clone());
        }

        Self {
            carriers,
            roster,
            by_dot,
            names_by_dot,
            rehashed,
            insurance: Vec::new(),
        }
    }

    /// Attach insurance filings. Company names are folded with
    /// `insurer_key`; filings without a company are dropped. Ordered by
    /// (company, DOT, effective date, policy number).
    pub fn with_insurance(mut self, policies: Vec<InsurancePolicy>) -> Self {
        let mut policies: Vec<InsurancePolicy> = policies
            .into_iter()
            .map(|mut p| {
                p.insurance_company = insurer_key(&p.insurance_company);
                p
            })
            .filter(|p| !p.insurance_company.is_empty())
            .collect();
        policies.sort_by(|a, b| {
            (&a.insurance_company, a.dot_number, a.effective_date, &a.policy_number)
                .cmp(&(&b.insurance_company, b.dot_number, b.effective_date, &b.policy_number))
        });
        self.insurance = policies;
        self
    }

    pub fn carriers(&self) -> &[Carrier] {
        &self.carriers
    }

    pub fn roster(&self) -> &[RosterEntry] {
        &self.roster
    }

    pub fn carrier(&self, dot: DotNumber) -> Option<&Carrier> {
        self.by_dot.get(&dot).map(|&i| &self.carriers[i])
    }

    pub fn insurance(&self) -> &[InsurancePolicy] {
        &self.insurance
    }

    /// Carriers whose input address hash disagreed with the recomputed one,
    /// in DOT order.
    pub fn rehashed(&self) -> &[DotNumber] {
        &self.rehashed
    }

    /// All normalized officer names listed on a carrier.
    pub fn officer_names(&self, dot: DotNumber) -> Option<&BTreeSet<String>> {
        self.names_by_dot.get(&dot)
    }
}
