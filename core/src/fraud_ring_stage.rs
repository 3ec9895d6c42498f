//! Fraud ring detection.
//!
//! Carriers are nodes. Two carriers are linked when they share at least
//! `min_shared_identities` distinct resolved officer identities, counting
//! only identities that span two or more carriers. Rings are the connected
//! components of that graph with at least `min_ring_size` members.
//!
//! RULE: the edge relation is symmetric. Pairs are always keyed
//! (lower DOT, higher DOT), so no ring depends on iteration order.

use crate::{
    config::FraudRingConfig,
    error::EngineResult,
    event::PipelineEvent,
    identity_stage::IdentityCluster,
    snapshot::DatasetSnapshot,
    stage::{PipelineStage, StageContext},
    types::{AddressHash, Confidence, DotNumber},
    union_find::DisjointSet,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FraudRing {
    /// 1-based, stable only within one run.
    pub ring_id: usize,
    /// Ascending.
    pub member_dots: Vec<DotNumber>,
    /// Officer names on the ring's edges. Sorted, duplicate-free.
    pub officer_names: Vec<String>,
    /// Known address hashes held by two or more members. Sorted.
    pub shared_addresses: Vec<AddressHash>,
    pub carrier_count: usize,
    pub active_count: usize,
    pub total_crashes: i64,
    pub total_fatalities: i64,
    /// Sum of members' scores from this run. Filled in after scoring.
    pub combined_risk: u64,
    pub edge_count: usize,
    pub corroborated_edges: usize,
    pub confidence: Confidence,
}

/// Identities shared by one carrier pair, as indexes into the cluster slice.
type Edges = BTreeMap<(DotNumber, DotNumber), Vec<usize>>;

pub fn detect_fraud_rings(
    snapshot: &DatasetSnapshot,
    clusters: &[IdentityCluster],
    config: &FraudRingConfig,
) -> Vec<FraudRing> {
    let mut shared: Edges = BTreeMap::new();
    for (i, cluster) in clusters.iter().enumerate() {
        if cluster.carrier_count < 2 {
            continue;
        }
        let dots = &cluster.member_dots;
        for (a_pos, &a) in dots.iter().enumerate() {
            for &b in &dots[a_pos + 1..] {
                shared.entry((a, b)).or_default().push(i);
            }
        }
    }
    let edges: Edges = shared
        .into_iter()
        .filter(|(_, ids)| ids.len() >= config.min_shared_identities)
        .collect();

    // Dense ids for every carrier on an edge.
    let nodes: Vec<DotNumber> = edges
        .keys()
        .flat_map(|&(a, b)| [a, b])
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let position: HashMap<DotNumber, usize> = nodes.iter().enumerate().map(|(i, &d)| (d, i)).collect();

    let mut ds = DisjointSet::new(nodes.len());
    for &(a, b) in edges.keys() {
        ds.union(position[&a], position[&b]);
    }

    let mut components: Vec<Vec<DotNumber>> = ds
        .groups()
        .into_iter()
        .filter(|g| g.len() >= config.min_ring_size)
        .map(|g| g.into_iter().map(|i| nodes[i]).collect())
        .collect();
    components.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a[0].cmp(&b[0])));

    components
        .into_iter()
        .enumerate()
        .map(|(i, members)| summarize(i + 1, members, &edges, snapshot, clusters, config))
        .collect()
}

fn summarize(
    ring_id: usize,
    members: Vec<DotNumber>,
    edges: &Edges,
    snapshot: &DatasetSnapshot,
    clusters: &[IdentityCluster],
    config: &FraudRingConfig,
) -> FraudRing {
    // Components are closed under edges, so checking one endpoint suffices.
    let ring_edges: Vec<&Vec<usize>> = edges
        .iter()
        .filter(|((a, _), _)| members.binary_search(a).is_ok())
        .map(|(_, ids)| ids)
        .collect();

    let officer_names: BTreeSet<&str> = ring_edges
        .iter()
        .flat_map(|ids| ids.iter().map(|&i| clusters[i].officer_name.as_str()))
        .collect();
    let corroborated_edges = ring_edges
        .iter()
        .filter(|ids| ids.iter().any(|&i| clusters[i].is_corroborated()))
        .count();

    let carriers: Vec<_> = members.iter().filter_map(|&dot| snapshot.carrier(dot)).collect();
    let mut address_counts: BTreeMap<&str, usize> = BTreeMap::new();
    for carrier in &carriers {
        if let Some(hash) = carrier.address_key() {
            *address_counts.entry(hash).or_default() += 1;
        }
    }

    FraudRing {
        ring_id,
        carrier_count: members.len(),
        active_count: carriers.iter().filter(|c| c.is_active()).count(),
        total_crashes: carriers.iter().map(|c| c.total_crashes.max(0)).sum(),
        total_fatalities: carriers.iter().map(|c| c.fatal_crashes.max(0)).sum(),
        combined_risk: 0,
        edge_count: ring_edges.len(),
        corroborated_edges,
        confidence: ring_confidence(corroborated_edges, ring_edges.len(), config),
        officer_names: officer_names.into_iter().map(str::to_string).collect(),
        shared_addresses: address_counts
            .into_iter()
            .filter(|&(_, n)| n >= 2)
            .map(|(hash, _)| hash.to_string())
            .collect(),
        member_dots: members,
    }
}

fn ring_confidence(corroborated: usize, edges: usize, config: &FraudRingConfig) -> Confidence {
    if edges == 0 {
        return Confidence::Low;
    }
    let share = corroborated as f64 / edges as f64;
    if share >= config.high_corroboration {
        Confidence::High
    } else if share >= config.medium_corroboration {
        Confidence::Medium
    } else {
        Confidence::Low
    }
}

/// Ring confidence per member carrier. Rings are disjoint.
pub fn ring_tier_by_dot(rings: &[FraudRing]) -> HashMap<DotNumber, Confidence> {
    rings
        .iter()
        .flat_map(|r| r.member_dots.iter().map(move |&dot| (dot, r.confidence)))
        .collect()
}

pub fn capture_combined_risk(rings: &mut [FraudRing], scores: &HashMap<DotNumber, u32>) {
    for ring in rings {
        ring.combined_risk = ring
            .member_dots
            .iter()
            .filter_map(|dot| scores.get(dot))
            .map(|&s| u64::from(s))
            .sum();
    }
}

// ── Stage ───────────────────────────────────────────────────────────

pub struct FraudRingStage;

impl PipelineStage for FraudRingStage {
    fn name(&self) -> &'static str {
        "fraud_rings"
    }

    fn run(&mut self, ctx: &mut StageContext<'_>) -> EngineResult<Vec<PipelineEvent>> {
        let clusters = ctx.outputs.identity_clusters(self.name())?;
        let rings = detect_fraud_rings(ctx.snapshot, clusters, &ctx.config.fraud_ring);

        let carriers_in_rings = rings.iter().map(|r| r.carrier_count).sum();
        let largest_ring = rings.first().map_or(0, |r| r.carrier_count);
        log::info!("fraud rings: {} rings covering {carriers_in_rings} carriers", rings.len());

        let event = PipelineEvent::FraudRingsDetected {
            ring_count: rings.len(),
            carriers_in_rings,
            largest_ring,
        };
        ctx.outputs.fraud_rings = Some(rings);
        Ok(vec![event])
    }
}
