//! Risk scoring: the rule table folded over each carrier's profile.
//!
//! RULE: scores are recomputed from scratch every run. A carrier's score and
//! flags depend only on this run's snapshot and stage outputs, never on a
//! previous score.
//!
//! RULE: one carrier's bad data never stops the batch. A rule that cannot
//! be evaluated is skipped, logged and surfaced as PARTIAL_EVALUATION.

use crate::{
    address_cluster_stage::cluster_size_by_dot,
    chameleon_stage::strongest_tiers,
    error::EngineResult,
    event::PipelineEvent,
    fraud_ring_stage::{capture_combined_risk, ring_tier_by_dot},
    identity_stage::{capture_average_risk, officer_fan_out},
    rules::{CarrierProfile, RuleTable},
    snapshot::{Carrier, DatasetSnapshot},
    stage::{PipelineStage, StageContext},
    types::{Confidence, DotNumber},
};
use chrono::NaiveDate;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CarrierScore {
    pub dot_number: DotNumber,
    pub risk_score: u32,
    /// Table order, duplicate-free.
    pub risk_flags: Vec<String>,
    pub partial: bool,
}

/// Per-carrier lookups joined from the earlier stages.
#[derive(Debug, Clone, Default)]
pub struct ScoringInputs {
    pub address_cluster_size: HashMap<DotNumber, usize>,
    pub officer_cluster_size: HashMap<DotNumber, usize>,
    pub chameleon_successor: HashMap<DotNumber, Confidence>,
    pub chameleon_predecessor: HashMap<DotNumber, Confidence>,
    pub fraud_ring: HashMap<DotNumber, Confidence>,
}

impl ScoringInputs {
    fn profile<'c>(&self, carrier: &'c Carrier, as_of: NaiveDate) -> CarrierProfile<'c> {
        let dot = carrier.dot_number;
        CarrierProfile {
            carrier,
            address_cluster_size: self.address_cluster_size.get(&dot).copied().unwrap_or(0),
            officer_cluster_size: self.officer_cluster_size.get(&dot).copied().unwrap_or(0),
            chameleon_successor: self.chameleon_successor.get(&dot).copied(),
            chameleon_predecessor: self.chameleon_predecessor.get(&dot).copied(),
            fraud_ring: self.fraud_ring.get(&dot).copied(),
            as_of,
        }
    }
}

/// Score every carrier in the snapshot, in DOT order.
pub fn score_carriers(
    snapshot: &DatasetSnapshot,
    inputs: &ScoringInputs,
    rules: &RuleTable,
    as_of: NaiveDate,
) -> Vec<CarrierScore> {
    snapshot
        .carriers()
        .par_iter()
        .map(|carrier| {
            let outcome = rules.evaluate(&inputs.profile(carrier, as_of));
            for (flag, err) in &outcome.failures {
                log::warn!("carrier {}: rule {flag} skipped: {err}", carrier.dot_number);
            }
            CarrierScore {
                dot_number: carrier.dot_number,
                risk_score: outcome.score,
                partial: outcome.is_partial(),
                risk_flags: outcome.flags,
            }
        })
        .collect()
}

// ── Stage ───────────────────────────────────────────────────────────

pub struct ScoringStage;

impl PipelineStage for ScoringStage {
    fn name(&self) -> &'static str {
        "risk_scoring"
    }

    fn run(&mut self, ctx: &mut StageContext<'_>) -> EngineResult<Vec<PipelineEvent>> {
        let stage = self.name();
        let (chameleon_successor, chameleon_predecessor) =
            strongest_tiers(ctx.outputs.chameleon_pairs(stage)?);
        let inputs = ScoringInputs {
            address_cluster_size: cluster_size_by_dot(ctx.outputs.address_clusters(stage)?),
            officer_cluster_size: officer_fan_out(ctx.outputs.identity_clusters(stage)?),
            chameleon_successor,
            chameleon_predecessor,
            fraud_ring: ring_tier_by_dot(ctx.outputs.fraud_rings(stage)?),
        };

        let scores = score_carriers(ctx.snapshot, &inputs, ctx.rules, ctx.config.as_of);

        // Aggregates over scores belong to this run, not the previous one.
        let by_dot: HashMap<DotNumber, u32> = scores.iter().map(|s| (s.dot_number, s.risk_score)).collect();
        if let Some(clusters) = ctx.outputs.identity_clusters.as_mut() {
            capture_average_risk(clusters, &by_dot);
        }
        if let Some(rings) = ctx.outputs.fraud_rings.as_mut() {
            capture_combined_risk(rings, &by_dot);
        }

        let flagged_carriers = scores.iter().filter(|s| s.risk_score > 0).count();
        let partial_evaluations = scores.iter().filter(|s| s.partial).count();
        if partial_evaluations > 0 {
            log::warn!("risk scoring: {partial_evaluations} carriers only partially evaluated");
        }
        log::info!(
            "risk scoring: {} carriers scored with table {}, {flagged_carriers} flagged",
            scores.len(),
            ctx.rules.version
        );

        let event = PipelineEvent::CarriersScored {
            carrier_count: scores.len(),
            flagged_carriers,
            partial_evaluations,
        };
        ctx.outputs.scores = Some(scores);
        Ok(vec![event])
    }
}
