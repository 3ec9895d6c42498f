//! Officer identity resolution.
//!
//! The same normalized name on many carriers may be one person or many.
//! Within each name, carriers are merged with union-find whenever they
//! share hard evidence:
//!   - phone     the same valid phone on the roster rows
//!   - email     the same valid email on the roster rows
//!   - address   the same known address hash on the carriers
//!   - co_officer both carriers also list some other officer
//!
//! `same_state` is recorded only where carriers already linked by one of
//! the above also share a state. It never links on its own.
//!
//! RULE: for every name, the clusters partition that name's carriers.
//! Every (name, carrier) pair lands in exactly one cluster.

use crate::{
    error::EngineResult,
    event::PipelineEvent,
    normalize::{normalize_email, normalize_phone},
    snapshot::{Carrier, DatasetSnapshot, RosterEntry},
    stage::{PipelineStage, StageContext},
    types::DotNumber,
    union_find::DisjointSet,
};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

/// Evidence that justified merging carriers under one identity.
/// Variant order is the sorted order of `link_signals`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkSignal {
    Address,
    CoOfficer,
    Email,
    NameOnly,
    Phone,
    SameState,
}

impl LinkSignal {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Address => "address",
            Self::CoOfficer => "co_officer",
            Self::Email => "email",
            Self::NameOnly => "name_only",
            Self::Phone => "phone",
            Self::SameState => "same_state",
        }
    }

    /// Direct contact or location evidence, as opposed to circumstantial.
    pub fn is_corroborating(&self) -> bool {
        matches!(self, Self::Phone | Self::Email | Self::Address)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityCluster {
    pub officer_name: String,
    /// Rank within the name: 0 is the largest cluster.
    pub cluster_index: usize,
    /// Ascending.
    pub member_dots: Vec<DotNumber>,
    /// Sorted, duplicate-free. `[name_only]` for singletons.
    pub link_signals: Vec<LinkSignal>,
    pub carrier_count: usize,
    pub total_crashes: i64,
    pub fatal_crashes: i64,
    pub power_units: i64,
    /// Filled in from this run's scores once scoring has finished.
    pub avg_risk_score: f64,
    pub ppp_total: f64,
    /// Sorted, duplicate-free.
    pub states: Vec<String>,
}

impl IdentityCluster {
    /// A singleton held together by nothing but the name. Low confidence.
    pub fn is_name_only(&self) -> bool {
        self.link_signals == [LinkSignal::NameOnly]
    }

    pub fn is_corroborated(&self) -> bool {
        self.link_signals.iter().any(LinkSignal::is_corroborating)
    }

    pub fn contains(&self, dot: DotNumber) -> bool {
        self.member_dots.binary_search(&dot).is_ok()
    }
}

// ── Resolution ──────────────────────────────────────────────────────

/// Resolve every name in the roster. Names are independent and run in
/// parallel; output is in name order, then cluster index.
pub fn resolve_identities(snapshot: &DatasetSnapshot) -> Vec<IdentityCluster> {
    name_groups(snapshot.roster())
        .par_iter()
        .map(|rows| resolve_name(snapshot, rows))
        .collect::<Vec<_>>()
        .into_iter()
        .flatten()
        .collect()
}

/// Split a roster sorted by normalized name into one slice per name.
fn name_groups(roster: &[RosterEntry]) -> Vec<&[RosterEntry]> {
    let mut groups = Vec::new();
    let mut start = 0;
    for i in 1..=roster.len() {
        if i == roster.len() || roster[i].normalized_name != roster[start].normalized_name {
            groups.push(&roster[start..i]);
            start = i;
        }
    }
    groups
}

/// All roster rows of one (name, carrier) pair, merged.
struct Member<'s> {
    dot: DotNumber,
    carrier: Option<&'s Carrier>,
    phones: BTreeSet<String>,
    emails: BTreeSet<String>,
}

fn resolve_name(snapshot: &DatasetSnapshot, rows: &[RosterEntry]) -> Vec<IdentityCluster> {
    let name = rows[0].normalized_name.as_str();

    let mut by_dot: BTreeMap<DotNumber, Member<'_>> = BTreeMap::new();
    for row in rows {
        let member = by_dot.entry(row.dot_number).or_insert_with(|| Member {
            dot: row.dot_number,
            carrier: snapshot.carrier(row.dot_number),
            phones: BTreeSet::new(),
            emails: BTreeSet::new(),
        });
        member.phones.extend(row.phone.as_deref().and_then(normalize_phone));
        member.emails.extend(row.email.as_deref().and_then(normalize_email));
    }
    let members: Vec<Member<'_>> = by_dot.into_values().collect();

    // Members sharing a key, per signal. Grouping by key keeps this linear
    // in the number of rows instead of quadratic in carriers.
    let mut keyed: BTreeMap<(LinkSignal, &str), Vec<usize>> = BTreeMap::new();
    for (i, m) in members.iter().enumerate() {
        for phone in &m.phones {
            keyed.entry((LinkSignal::Phone, phone.as_str())).or_default().push(i);
        }
        for email in &m.emails {
            keyed.entry((LinkSignal::Email, email.as_str())).or_default().push(i);
        }
        if let Some(hash) = m.carrier.and_then(Carrier::address_key) {
            keyed.entry((LinkSignal::Address, hash)).or_default().push(i);
        }
        if let Some(names) = snapshot.officer_names(m.dot) {
            for other in names.iter().filter(|n| n.as_str() != name) {
                keyed.entry((LinkSignal::CoOfficer, other.as_str())).or_default().push(i);
            }
        }
    }

    let mut ds = DisjointSet::new(members.len());
    let mut evidence: Vec<(usize, LinkSignal)> = Vec::new();
    for ((signal, _), group) in &keyed {
        if group.len() < 2 {
            continue;
        }
        for &other in &group[1..] {
            ds.union(group[0], other);
        }
        evidence.push((group[0], *signal));
        if shares_state(&members, group) {
            evidence.push((group[0], LinkSignal::SameState));
        }
    }

    let mut signals_by_root: HashMap<usize, BTreeSet<LinkSignal>> = HashMap::new();
    for (member, signal) in evidence {
        let root = ds.find(member);
        signals_by_root.entry(root).or_default().insert(signal);
    }

    let mut groups = ds.groups();
    // Member indexes follow DOT order, so the first index is the lowest DOT.
    groups.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a[0].cmp(&b[0])));

    groups
        .into_iter()
        .enumerate()
        .map(|(cluster_index, group)| {
            let link_signals = if group.len() == 1 {
                vec![LinkSignal::NameOnly]
            } else {
                let root = ds.find(group[0]);
                signals_by_root
                    .remove(&root)
                    .unwrap_or_default()
                    .into_iter()
                    .collect()
            };
            let cluster_members: Vec<&Member<'_>> = group.iter().map(|&i| &members[i]).collect();
            summarize(name, cluster_index, &cluster_members, link_signals)
        })
        .collect()
}

/// True when at least two members of a linked group are in the same state.
fn shares_state(members: &[Member<'_>], group: &[usize]) -> bool {
    let mut seen = HashSet::new();
    group
        .iter()
        .filter_map(|&i| members[i].carrier.and_then(Carrier::state))
        .any(|state| !seen.insert(state))
}

fn summarize(
    name: &str,
    cluster_index: usize,
    members: &[&Member<'_>],
    link_signals: Vec<LinkSignal>,
) -> IdentityCluster {
    let carriers: Vec<&Carrier> = members.iter().filter_map(|m| m.carrier).collect();
    let states: BTreeSet<String> = carriers
        .iter()
        .filter_map(|c| c.state())
        .map(str::to_uppercase)
        .collect();
    IdentityCluster {
        officer_name: name.to_string(),
        cluster_index,
        member_dots: members.iter().map(|m| m.dot).collect(),
        link_signals,
        carrier_count: members.len(),
        total_crashes: carriers.iter().map(|c| c.total_crashes.max(0)).sum(),
        fatal_crashes: carriers.iter().map(|c| c.fatal_crashes.max(0)).sum(),
        power_units: carriers.iter().map(|c| c.power_units.max(0)).sum(),
        avg_risk_score: 0.0,
        ppp_total: carriers
            .iter()
            .map(|c| c.ppp.loan_total)
            .filter(|v| v.is_finite())
            .sum(),
        states: states.into_iter().collect(),
    }
}

// ── Lookups for later stages ────────────────────────────────────────

/// Multi-carrier identities per carrier, as indexes into the cluster slice
/// the index was built from.
#[derive(Debug, Clone, Default)]
pub struct IdentityIndex {
    by_dot: HashMap<DotNumber, Vec<usize>>,
}

impl IdentityIndex {
    pub fn build(clusters: &[IdentityCluster]) -> Self {
        let mut by_dot: HashMap<DotNumber, Vec<usize>> = HashMap::new();
        for (i, cluster) in clusters.iter().enumerate() {
            if cluster.carrier_count < 2 {
                continue;
            }
            for &dot in &cluster.member_dots {
                by_dot.entry(dot).or_default().push(i);
            }
        }
        Self { by_dot }
    }

    /// Ascending cluster indexes the carrier belongs to.
    pub fn identities(&self, dot: DotNumber) -> &[usize] {
        self.by_dot.get(&dot).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn shares_identity(&self, a: DotNumber, b: DotNumber) -> bool {
        let (xs, ys) = (self.identities(a), self.identities(b));
        let (mut i, mut j) = (0, 0);
        while i < xs.len() && j < ys.len() {
            match xs[i].cmp(&ys[j]) {
                std::cmp::Ordering::Less => i += 1,
                std::cmp::Ordering::Greater => j += 1,
                std::cmp::Ordering::Equal => return true,
            }
        }
        false
    }
}

/// Size of the largest resolved (not name-only) identity each carrier is in.
pub fn officer_fan_out(clusters: &[IdentityCluster]) -> HashMap<DotNumber, usize> {
    let mut fan_out: HashMap<DotNumber, usize> = HashMap::new();
    for cluster in clusters.iter().filter(|c| !c.is_name_only()) {
        for &dot in &cluster.member_dots {
            let size = fan_out.entry(dot).or_default();
            *size = (*size).max(cluster.carrier_count);
        }
    }
    fan_out
}

/// Fill `avg_risk_score` from this run's scores, rounded to one decimal.
pub fn capture_average_risk(clusters: &mut [IdentityCluster], scores: &HashMap<DotNumber, u32>) {
    for cluster in clusters {
        let member_scores: Vec<u32> = cluster
            .member_dots
            .iter()
            .filter_map(|dot| scores.get(dot).copied())
            .collect();
        cluster.avg_risk_score = if member_scores.is_empty() {
            0.0
        } else {
            let mean = member_scores.iter().map(|&s| f64::from(s)).sum::<f64>() / member_scores.len() as f64;
            (mean * 10.0).round() / 10.0
        };
    }
}

// ── Stage ───────────────────────────────────────────────────────────

pub struct IdentityStage;

impl PipelineStage for IdentityStage {
    fn name(&self) -> &'static str {
        "identity_resolution"
    }

    fn run(&mut self, ctx: &mut StageContext<'_>) -> EngineResult<Vec<PipelineEvent>> {
        let clusters = resolve_identities(ctx.snapshot);

        let name_count = clusters.iter().filter(|c| c.cluster_index == 0).count();
        let corroborated_clusters = clusters.iter().filter(|c| c.is_corroborated()).count();
        let name_only_clusters = clusters.iter().filter(|c| c.is_name_only()).count();
        log::info!(
            "identity resolution: {name_count} names -> {} clusters ({corroborated_clusters} corroborated, {name_only_clusters} name-only)",
            clusters.len()
        );

        let event = PipelineEvent::IdentitiesResolved {
            name_count,
            cluster_count: clusters.len(),
            corroborated_clusters,
            name_only_clusters,
        };
        ctx.outputs.identity_clusters = Some(clusters);
        Ok(vec![event])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roster_splits_by_name() {
        let roster = vec![
            RosterEntry::new(1, "Ann Lee"),
            RosterEntry::new(2, "Ann Lee"),
            RosterEntry::new(1, "Bo Diaz"),
        ];
        let groups = name_groups(&roster);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].len(), 2);
        assert!(name_groups(&[]).is_empty());
    }

    #[test]
    fn signals_sort_alphabetically() {
        let mut signals = vec![LinkSignal::SameState, LinkSignal::Address, LinkSignal::Phone, LinkSignal::CoOfficer];
        signals.sort();
        let names: Vec<_> = signals.iter().map(LinkSignal::as_str).collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
    }

    #[test]
    fn average_risk_rounds_to_one_decimal() {
        let mut clusters = vec![IdentityCluster {
            officer_name: "ann lee".into(),
            cluster_index: 0,
            member_dots: vec![1, 2, 3],
            link_signals: vec![LinkSignal::Phone],
            carrier_count: 3,
            total_crashes: 0,
            fatal_crashes: 0,
            power_units: 0,
            avg_risk_score: 0.0,
            ppp_total: 0.0,
            states: vec![],
        }];
        let scores = HashMap::from([(1, 10), (2, 10), (3, 15)]);
        capture_average_risk(&mut clusters, &scores);
        assert_eq!(clusters[0].avg_risk_score, 11.7);
    }
}
