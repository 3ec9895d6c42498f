//! Chameleon carrier detection.
//!
//! A chameleon is a carrier that shuts down and comes back under a new
//! registration to shed a bad safety record. For every deactivated carrier
//! (inactive, with a revocation date) we look for carriers granted authority
//! strictly after the revocation and within the configured window, and
//! score the evidence tying them together:
//!   - address  same known address hash
//!   - officer  both in one resolved identity spanning 2+ carriers
//!   - phone    same valid phone
//!   - name     near-identical normalized legal names (Jaro-Winkler)
//!
//! Candidates are found through shared keys (address hash, phone, resolved
//! identity, leading characters of the name), never by scanning every
//! grant in the window.
//!
//! RULE: ambiguity is kept, not resolved. Every candidate with at least one
//! signal becomes a pair; `best_successor` ranks them when one is needed.

use crate::{
    config::ChameleonConfig,
    error::EngineResult,
    event::PipelineEvent,
    identity_stage::IdentityIndex,
    normalize::normalize_name,
    snapshot::{Carrier, DatasetSnapshot, OperatingStatus},
    stage::{PipelineStage, StageContext},
    types::{Confidence, DotNumber},
};
use chrono::NaiveDate;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// Variant order is the sorted order of `match_signals`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchSignal {
    Address,
    Name,
    Officer,
    Phone,
}

impl MatchSignal {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Address => "address",
            Self::Name => "name",
            Self::Officer => "officer",
            Self::Phone => "phone",
        }
    }
}

/// A directed predecessor → successor link. Chains are not collapsed:
/// A → B and B → C are two pairs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChameleonPair {
    pub predecessor_dot: DotNumber,
    pub successor_dot: DotNumber,
    pub deactivation_date: NaiveDate,
    pub activation_date: NaiveDate,
    pub days_gap: i64,
    /// Sorted, duplicate-free, never empty.
    pub match_signals: Vec<MatchSignal>,
    pub signal_count: usize,
    pub confidence: Confidence,
}

/// High: three or more signals, or a shared address backed by an officer
/// or a phone. Medium: any other two. Low: one.
pub fn confidence_for(signals: &BTreeSet<MatchSignal>) -> Confidence {
    let address = signals.contains(&MatchSignal::Address);
    let backed = signals.contains(&MatchSignal::Officer) || signals.contains(&MatchSignal::Phone);
    match signals.len() {
        n if n >= 3 => Confidence::High,
        2 if address && backed => Confidence::High,
        2 => Confidence::Medium,
        _ => Confidence::Low,
    }
}

/// Pick the most plausible successor of `predecessor`: shortest gap, then
/// most signals, then lowest DOT number.
pub fn best_successor(pairs: &[ChameleonPair], predecessor: DotNumber) -> Option<&ChameleonPair> {
    pairs
        .iter()
        .filter(|p| p.predecessor_dot == predecessor)
        .min_by(|a, b| {
            a.days_gap
                .cmp(&b.days_gap)
                .then_with(|| b.signal_count.cmp(&a.signal_count))
                .then_with(|| a.successor_dot.cmp(&b.successor_dot))
        })
}

/// Strongest tier per carrier on each side of the pairs it appears in.
pub fn strongest_tiers(pairs: &[ChameleonPair]) -> (HashMap<DotNumber, Confidence>, HashMap<DotNumber, Confidence>) {
    let mut as_successor: HashMap<DotNumber, Confidence> = HashMap::new();
    let mut as_predecessor: HashMap<DotNumber, Confidence> = HashMap::new();
    for pair in pairs {
        let s = as_successor.entry(pair.successor_dot).or_insert(pair.confidence);
        *s = (*s).max(pair.confidence);
        let p = as_predecessor.entry(pair.predecessor_dot).or_insert(pair.confidence);
        *p = (*p).max(pair.confidence);
    }
    (as_successor, as_predecessor)
}

// ── Detection ───────────────────────────────────────────────────────

/// Characters of a normalized legal name (spaces ignored) that two names
/// must share before the `name` signal is looked for. Jaro-Winkler's prefix
/// bonus covers the same four characters.
const NAME_BLOCK_CHARS: usize = 4;

/// A key a predecessor and a successor must share to be scored at all.
/// One kind per signal, so a pair with any address, officer or phone signal
/// is always reached.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum BlockKey {
    Address(String),
    Phone(String),
    Identity(usize),
    NamePrefix(String),
}

/// A carrier prepared for matching: normalized keys computed once.
/// `date` is the grant date of a successor or the revocation date of a
/// predecessor.
struct Candidate<'s> {
    carrier: &'s Carrier,
    date: NaiveDate,
    phone: Option<String>,
    name: String,
}

impl<'s> Candidate<'s> {
    fn new(carrier: &'s Carrier, date: NaiveDate) -> Self {
        Self {
            carrier,
            date,
            phone: carrier.normalized_phone(),
            name: normalize_name(&carrier.legal_name),
        }
    }

    fn block_keys(&self, identities: &IdentityIndex) -> Vec<BlockKey> {
        let mut keys = Vec::new();
        if let Some(hash) = self.carrier.address_key() {
            keys.push(BlockKey::Address(hash.to_string()));
        }
        if let Some(phone) = &self.phone {
            keys.push(BlockKey::Phone(phone.clone()));
        }
        keys.extend(
            identities
                .identities(self.carrier.dot_number)
                .iter()
                .map(|&i| BlockKey::Identity(i)),
        );
        let prefix: String = self
            .name
            .chars()
            .filter(|c| !c.is_whitespace())
            .take(NAME_BLOCK_CHARS)
            .collect();
        if !prefix.is_empty() {
            keys.push(BlockKey::NamePrefix(prefix));
        }
        keys
    }
}

/// Detection result plus the number of (predecessor, successor) pairs that
/// were actually scored.
#[derive(Debug, Clone, PartialEq)]
pub struct ChameleonScan {
    pub pairs: Vec<ChameleonPair>,
    pub candidates_scored: usize,
}

pub fn detect_chameleons(
    snapshot: &DatasetSnapshot,
    identities: &IdentityIndex,
    config: &ChameleonConfig,
) -> Vec<ChameleonPair> {
    scan_chameleons(snapshot, identities, config).pairs
}

/// Block, then score: successors are looked up by the keys they share with
/// the predecessor and only those are compared. Cost follows the size of
/// the blocks inside the window, not deactivated × granted.
pub fn scan_chameleons(
    snapshot: &DatasetSnapshot,
    identities: &IdentityIndex,
    config: &ChameleonConfig,
) -> ChameleonScan {
    // Every carrier with a grant date, ordered by that date.
    let mut by_grant: Vec<Candidate<'_>> = snapshot
        .carriers()
        .iter()
        .filter_map(|c| c.authority_granted.map(|granted| Candidate::new(c, granted)))
        .collect();
    by_grant.sort_by_key(|c| (c.date, c.carrier.dot_number));

    // Positions into `by_grant`, ascending, so each block is in grant order
    // and the window after a revocation is one contiguous slice of it.
    let mut blocks: HashMap<BlockKey, Vec<usize>> = HashMap::new();
    for (pos, candidate) in by_grant.iter().enumerate() {
        for key in candidate.block_keys(identities) {
            blocks.entry(key).or_default().push(pos);
        }
    }

    let deactivated: Vec<(&Carrier, NaiveDate)> = snapshot
        .carriers()
        .iter()
        .filter(|c| c.status == OperatingStatus::Inactive)
        .filter_map(|c| c.authority_revoked.map(|revoked| (c, revoked)))
        .collect();

    let per_predecessor: Vec<(Vec<ChameleonPair>, usize)> = deactivated
        .par_iter()
        .map(|&(predecessor, revoked)| {
            let pred = Candidate::new(predecessor, revoked);
            let mut positions = BTreeSet::new();
            for key in pred.block_keys(identities) {
                let Some(block) = blocks.get(&key) else {
                    continue;
                };
                let start = block.partition_point(|&p| by_grant[p].date <= revoked);
                positions.extend(
                    block[start..]
                        .iter()
                        .copied()
                        .take_while(|&p| (by_grant[p].date - revoked).num_days() <= config.max_gap_days),
                );
            }
            let successors: Vec<&Candidate<'_>> = positions
                .into_iter()
                .map(|p| &by_grant[p])
                .filter(|c| c.carrier.dot_number != predecessor.dot_number)
                .collect();
            let pairs = successors
                .iter()
                .filter_map(|succ| match_pair(&pred, succ, identities, config))
                .collect();
            (pairs, successors.len())
        })
        .collect();

    let candidates_scored = per_predecessor.iter().map(|(_, scored)| scored).sum();
    let mut pairs: Vec<ChameleonPair> = per_predecessor
        .into_iter()
        .flat_map(|(pairs, _)| pairs)
        .collect();
    pairs.sort_by_key(|p| (p.predecessor_dot, p.successor_dot));
    ChameleonScan {
        pairs,
        candidates_scored,
    }
}

fn match_pair(
    pred: &Candidate<'_>,
    succ: &Candidate<'_>,
    identities: &IdentityIndex,
    config: &ChameleonConfig,
) -> Option<ChameleonPair> {
    let mut signals = BTreeSet::new();

    if let (Some(a), Some(b)) = (pred.carrier.address_key(), succ.carrier.address_key()) {
        if a == b {
            signals.insert(MatchSignal::Address);
        }
    }
    if identities.shares_identity(pred.carrier.dot_number, succ.carrier.dot_number) {
        signals.insert(MatchSignal::Officer);
    }
    if pred.phone.is_some() && pred.phone == succ.phone {
        signals.insert(MatchSignal::Phone);
    }
    if !pred.name.is_empty()
        && !succ.name.is_empty()
        && strsim::jaro_winkler(&pred.name, &succ.name) >= config.name_similarity_threshold
    {
        signals.insert(MatchSignal::Name);
    }

    if signals.is_empty() {
        return None;
    }
    Some(ChameleonPair {
        predecessor_dot: pred.carrier.dot_number,
        successor_dot: succ.carrier.dot_number,
        deactivation_date: pred.date,
        activation_date: succ.date,
        days_gap: (succ.date - pred.date).num_days(),
        signal_count: signals.len(),
        confidence: confidence_for(&signals),
        match_signals: signals.into_iter().collect(),
    })
}

// ── Stage ───────────────────────────────────────────────────────────

pub struct ChameleonStage;

impl PipelineStage for ChameleonStage {
    fn name(&self) -> &'static str {
        "chameleon_pairs"
    }

    fn run(&mut self, ctx: &mut StageContext<'_>) -> EngineResult<Vec<PipelineEvent>> {
        let identities = IdentityIndex::build(ctx.outputs.identity_clusters(self.name())?);
        let ChameleonScan {
            pairs,
            candidates_scored,
        } = scan_chameleons(ctx.snapshot, &identities, &ctx.config.chameleon);

        let tier_count = |tier: Confidence| pairs.iter().filter(|p| p.confidence == tier).count();
        let event = PipelineEvent::ChameleonPairsDetected {
            candidates_scored,
            pair_count: pairs.len(),
            high: tier_count(Confidence::High),
            medium: tier_count(Confidence::Medium),
            low: tier_count(Confidence::Low),
        };
        log::info!(
            "chameleon detection: {} pairs from {candidates_scored} scored candidates",
            pairs.len()
        );
        log::debug!("chameleon tiers: {event:?}");

        ctx.outputs.chameleon_pairs = Some(pairs);
        Ok(vec![event])
    }
}
