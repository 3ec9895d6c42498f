//! Address clustering: carriers registered at the same physical address.
//!
//! Groups carriers by known address hash and keeps groups of two or more.
//! The unknown sentinel never clusters. Fully recomputed every run.

use crate::{
    error::EngineResult,
    event::PipelineEvent,
    snapshot::Carrier,
    stage::{PipelineStage, StageContext},
    types::{AddressHash, DotNumber},
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

pub const MIN_CLUSTER_SIZE: usize = 2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddressCluster {
    pub address_hash: AddressHash,
    /// Ascending.
    pub member_dots: Vec<DotNumber>,
    pub carrier_count: usize,
    pub active_count: usize,
    /// Mean of members that have coordinates; `None` if none do.
    pub centroid_lat: Option<f64>,
    pub centroid_lon: Option<f64>,
    pub total_crashes: i64,
    pub total_inspections: i64,
    pub avg_vehicle_oos_rate: f64,
    /// Display address, taken from the lowest-numbered member.
    pub street: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub zip: Option<String>,
}

/// Build all clusters from carriers already ordered by DOT number.
/// Output is ordered by carrier count descending, then hash ascending.
pub fn build_address_clusters(carriers: &[Carrier]) -> Vec<AddressCluster> {
    let mut by_hash: BTreeMap<&str, Vec<&Carrier>> = BTreeMap::new();
    for carrier in carriers {
        if let Some(hash) = carrier.address_key() {
            by_hash.entry(hash).or_default().push(carrier);
        }
    }

    let mut clusters: Vec<AddressCluster> = by_hash
        .into_iter()
        .filter(|(_, members)| members.len() >= MIN_CLUSTER_SIZE)
        .map(|(hash, mut members)| {
            members.sort_by_key(|c| c.dot_number);
            summarize(hash, &members)
        })
        .collect();

    clusters.sort_by(|a, b| {
        b.carrier_count
            .cmp(&a.carrier_count)
            .then_with(|| a.address_hash.cmp(&b.address_hash))
    });
    clusters
}

fn summarize(hash: &str, members: &[&Carrier]) -> AddressCluster {
    let located: Vec<(f64, f64)> = members
        .iter()
        .filter_map(|c| Some((c.latitude?, c.longitude?)))
        .collect();
    let (centroid_lat, centroid_lon) = if located.is_empty() {
        (None, None)
    } else {
        let n = located.len() as f64;
        let lat = located.iter().map(|(lat, _)| lat).sum::<f64>() / n;
        let lon = located.iter().map(|(_, lon)| lon).sum::<f64>() / n;
        (Some(lat), Some(lon))
    };

    // Malformed rates are left out of the mean rather than poisoning it.
    let rates: Vec<f64> = members
        .iter()
        .map(|c| c.vehicle_oos_rate)
        .filter(|r| r.is_finite() && (0.0..=1.0).contains(r))
        .collect();
    let avg_vehicle_oos_rate = if rates.is_empty() {
        0.0
    } else {
        rates.iter().sum::<f64>() / rates.len() as f64
    };

    let display = members[0];
    AddressCluster {
        address_hash: hash.to_string(),
        member_dots: members.iter().map(|c| c.dot_number).collect(),
        carrier_count: members.len(),
        active_count: members.iter().filter(|c| c.is_active()).count(),
        centroid_lat,
        centroid_lon,
        total_crashes: members.iter().map(|c| c.total_crashes.max(0)).sum(),
        total_inspections: members.iter().map(|c| c.total_inspections.max(0)).sum(),
        avg_vehicle_oos_rate,
        street: display.physical_address.clone(),
        city: display.physical_city.clone(),
        state: display.physical_state.clone(),
        zip: display.physical_zip.clone(),
    }
}

/// Cluster size per member carrier.
pub fn cluster_size_by_dot(clusters: &[AddressCluster]) -> HashMap<DotNumber, usize> {
    clusters
        .iter()
        .flat_map(|c| c.member_dots.iter().map(move |&dot| (dot, c.carrier_count)))
        .collect()
}

// ── Stage ───────────────────────────────────────────────────────────

pub struct AddressClusterStage;

impl PipelineStage for AddressClusterStage {
    fn name(&self) -> &'static str {
        "address_clusters"
    }

    fn run(&mut self, ctx: &mut StageContext<'_>) -> EngineResult<Vec<PipelineEvent>> {
        let clusters = build_address_clusters(ctx.snapshot.carriers());
        let clustered_carriers = clusters.iter().map(|c| c.carrier_count).sum();
        let largest_cluster = clusters.first().map_or(0, |c| c.carrier_count);
        log::info!(
            "address clusters: {} clusters covering {clustered_carriers} carriers (largest {largest_cluster})",
            clusters.len()
        );

        let event = PipelineEvent::AddressClustersBuilt {
            cluster_count: clusters.len(),
            clustered_carriers,
            largest_cluster,
        };
        ctx.outputs.address_clusters = Some(clusters);
        Ok(vec![event])
    }
}
