//! Pipeline events: the audit trail of one run.
//!
//! RULE: every stage reports what it produced through events only.
//! Events are collected in memory and written to `event_log` inside the
//! publishing transaction, so a failed run leaves no trace.

use crate::types::RunId;
use serde::{Deserialize, Serialize};

/// Every event emitted during a run.
/// Variants are added, never removed or reordered.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    // ── Engine events ──────────────────────────────
    RunStarted {
        run_id: RunId,
        carrier_count: usize,
        roster_count: usize,
        rule_table_version: String,
        rule_table_fingerprint: String,
        /// Carriers whose stored address hash was stale and recomputed.
        rehashed_carriers: usize,
    },
    RunCompleted {
        run_id: RunId,
        flagged_carriers: usize,
        partial_evaluations: usize,
    },

    // ── Stage events ───────────────────────────────
    AddressClustersBuilt {
        cluster_count: usize,
        clustered_carriers: usize,
        largest_cluster: usize,
    },
    IdentitiesResolved {
        name_count: usize,
        cluster_count: usize,
        corroborated_clusters: usize,
        name_only_clusters: usize,
    },
    ChameleonPairsDetected {
        candidates_scored: usize,
        pair_count: usize,
        high: usize,
        medium: usize,
        low: usize,
    },
    FraudRingsDetected {
        ring_count: usize,
        carriers_in_rings: usize,
        largest_ring: usize,
    },
    CarriersScored {
        carrier_count: usize,
        flagged_carriers: usize,
        partial_evaluations: usize,
    },
    PeerBenchmarksComputed {
        benchmarked_carriers: usize,
        crash_outliers: usize,
        oos_outliers: usize,
    },
    InsuranceStatsComputed {
        company_count: usize,
        policy_count: usize,
        cancellations: usize,
    },
}

/// Stable string name of a variant, for the `event_type` column.
pub fn event_type_name(event: &PipelineEvent) -> &'static str {
    match event {
        PipelineEvent::RunStarted { .. }             => "run_started",
        PipelineEvent::RunCompleted { .. }           => "run_completed",
        PipelineEvent::AddressClustersBuilt { .. }   => "address_clusters_built",
        PipelineEvent::IdentitiesResolved { .. }     => "identities_resolved",
        PipelineEvent::ChameleonPairsDetected { .. } => "chameleon_pairs_detected",
        PipelineEvent::FraudRingsDetected { .. }     => "fraud_rings_detected",
        PipelineEvent::CarriersScored { .. }         => "carriers_scored",
        PipelineEvent::PeerBenchmarksComputed { .. } => "peer_benchmarks_computed",
        PipelineEvent::InsuranceStatsComputed { .. } => "insurance_stats_computed",
    }
}

/// An event tagged with the stage that emitted it, in emission order.
#[derive(Debug, Clone, PartialEq)]
pub struct StageEvent {
    pub stage: &'static str,
    pub event: PipelineEvent,
}

/// The event log entry as persisted to SQLite.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLogEntry {
    pub id: Option<i64>,
    pub run_id: RunId,
    pub seq: i64,
    pub stage: String,
    pub event_type: String,
    pub payload: String, // JSON-serialized PipelineEvent
}

impl EventLogEntry {
    pub fn from_stage_event(run_id: &str, seq: i64, e: &StageEvent) -> serde_json::Result<Self> {
        Ok(Self {
            id: None,
            run_id: run_id.to_string(),
            seq,
            stage: e.stage.to_string(),
            event_type: event_type_name(&e.event).to_string(),
            payload: serde_json::to_string(&e.event)?,
        })
    }
}
