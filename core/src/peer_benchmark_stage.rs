//! Peer benchmarks: how a carrier's safety record compares with carriers of
//! the same fleet size.
//!
//! Every carrier gets a fleet-size bucket from its power units. Carriers in
//! a known bucket with at least one inspection also get percentile ranks of
//! their crash count and vehicle OOS rate within that bucket.
//!
//! Percentile = 100 × (values strictly below) / (bucket size − 1), so ties
//! share the lowest rank and a bucket of one ranks at 0.

use crate::{
    error::EngineResult,
    event::PipelineEvent,
    snapshot::{Carrier, DatasetSnapshot},
    stage::{PipelineStage, StageContext},
    types::DotNumber,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FleetSizeBucket {
    #[serde(rename = "unknown")]
    Unknown,
    #[serde(rename = "1")]
    Single,
    #[serde(rename = "2-5")]
    Small,
    #[serde(rename = "6-20")]
    Medium,
    #[serde(rename = "21-100")]
    Large,
    #[serde(rename = "101-500")]
    VeryLarge,
    #[serde(rename = "500+")]
    Fleet,
}

impl FleetSizeBucket {
    pub fn from_power_units(power_units: i64) -> Self {
        match power_units {
            i64::MIN..=0 => Self::Unknown,
            1 => Self::Single,
            2..=5 => Self::Small,
            6..=20 => Self::Medium,
            21..=100 => Self::Large,
            101..=500 => Self::VeryLarge,
            _ => Self::Fleet,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Single => "1",
            Self::Small => "2-5",
            Self::Medium => "6-20",
            Self::Large => "21-100",
            Self::VeryLarge => "101-500",
            Self::Fleet => "500+",
        }
    }
}

impl FromStr for FleetSizeBucket {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unknown" => Ok(Self::Unknown),
            "1" => Ok(Self::Single),
            "2-5" => Ok(Self::Small),
            "6-20" => Ok(Self::Medium),
            "21-100" => Ok(Self::Large),
            "101-500" => Ok(Self::VeryLarge),
            "500+" => Ok(Self::Fleet),
            other => Err(format!("unknown fleet size bucket '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerBenchmark {
    pub dot_number: DotNumber,
    pub fleet_size_bucket: FleetSizeBucket,
    /// None outside a known bucket or without inspections.
    pub peer_crash_percentile: Option<f64>,
    pub peer_oos_percentile: Option<f64>,
}

impl PeerBenchmark {
    pub fn is_crash_outlier(&self, threshold: f64) -> bool {
        self.peer_crash_percentile.is_some_and(|p| p >= threshold)
    }

    pub fn is_oos_outlier(&self, threshold: f64) -> bool {
        self.peer_oos_percentile.is_some_and(|p| p >= threshold)
    }
}

/// Percent rank of each value, in input order.
pub fn percent_ranks(values: &[f64]) -> Vec<f64> {
    if values.len() < 2 {
        return vec![0.0; values.len()];
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let denominator = (values.len() - 1) as f64;
    values
        .iter()
        .map(|v| {
            let below = sorted.partition_point(|s| s.total_cmp(v).is_lt());
            100.0 * below as f64 / denominator
        })
        .collect()
}

fn is_ranked(carrier: &Carrier) -> bool {
    carrier.total_inspections > 0
}

/// One benchmark per carrier, in DOT order.
pub fn compute_peer_benchmarks(snapshot: &DatasetSnapshot) -> Vec<PeerBenchmark> {
    let mut benchmarks: Vec<PeerBenchmark> = snapshot
        .carriers()
        .iter()
        .map(|c| PeerBenchmark {
            dot_number: c.dot_number,
            fleet_size_bucket: FleetSizeBucket::from_power_units(c.power_units),
            peer_crash_percentile: None,
            peer_oos_percentile: None,
        })
        .collect();

    // Positions into `benchmarks` (and the carrier slice) per peer group.
    let mut peers: BTreeMap<FleetSizeBucket, Vec<usize>> = BTreeMap::new();
    for (i, (carrier, benchmark)) in snapshot.carriers().iter().zip(&benchmarks).enumerate() {
        if benchmark.fleet_size_bucket != FleetSizeBucket::Unknown && is_ranked(carrier) {
            peers.entry(benchmark.fleet_size_bucket).or_default().push(i);
        }
    }

    let carriers = snapshot.carriers();
    for members in peers.values() {
        let crashes: Vec<f64> = members.iter().map(|&i| carriers[i].total_crashes as f64).collect();
        let oos: Vec<f64> = members.iter().map(|&i| carriers[i].vehicle_oos_rate).collect();
        for ((&i, crash), oos) in members.iter().zip(percent_ranks(&crashes)).zip(percent_ranks(&oos)) {
            benchmarks[i].peer_crash_percentile = Some(crash);
            benchmarks[i].peer_oos_percentile = Some(oos);
        }
    }
    benchmarks
}

// ── Stage ───────────────────────────────────────────────────────────

pub struct PeerBenchmarkStage;

impl PipelineStage for PeerBenchmarkStage {
    fn name(&self) -> &'static str {
        "peer_benchmarks"
    }

    fn run(&mut self, ctx: &mut StageContext<'_>) -> EngineResult<Vec<PipelineEvent>> {
        let benchmarks = compute_peer_benchmarks(ctx.snapshot);
        let threshold = ctx.config.benchmarks.outlier_percentile;
        let benchmarked_carriers = benchmarks.iter().filter(|b| b.peer_crash_percentile.is_some()).count();
        let crash_outliers = benchmarks.iter().filter(|b| b.is_crash_outlier(threshold)).count();
        let oos_outliers = benchmarks.iter().filter(|b| b.is_oos_outlier(threshold)).count();
        log::info!(
            "peer benchmarks: {benchmarked_carriers} carriers ranked, {crash_outliers} crash and {oos_outliers} OOS outliers"
        );

        let event = PipelineEvent::PeerBenchmarksComputed {
            benchmarked_carriers,
            crash_outliers,
            oos_outliers,
        };
        ctx.outputs.peer_benchmarks = Some(benchmarks);
        Ok(vec![event])
    }
}
