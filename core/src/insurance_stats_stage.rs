//! Insurer statistics: the book of business of each insurance company.
//!
//! Per company: distinct carriers insured, filings, cancellations and
//! cancellation rate, plus the risk carried by its insured carriers taken
//! from this run's scores. Runs after risk scoring.

use crate::{
    error::EngineResult,
    event::PipelineEvent,
    scoring_stage::CarrierScore,
    snapshot::DatasetSnapshot,
    stage::{PipelineStage, StageContext},
    types::DotNumber,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsuranceCompanyStats {
    pub insurance_company: String,
    pub carriers_insured: usize,
    pub total_policies: usize,
    pub cancellations: usize,
    /// Percent of filings that were cancelled.
    pub cancellation_rate: f64,
    /// Insured carriers scoring at or above the high-risk threshold.
    pub high_risk_carriers: usize,
    /// Mean score of the insured carriers found in the registry.
    pub avg_carrier_risk: f64,
    pub total_crashes: i64,
}

/// One row per company, most carriers insured first, then by name.
pub fn compute_insurance_stats(
    snapshot: &DatasetSnapshot,
    scores: &[CarrierScore],
    high_risk_score: u32,
) -> Vec<InsuranceCompanyStats> {
    let score_by_dot: HashMap<DotNumber, u32> = scores.iter().map(|s| (s.dot_number, s.risk_score)).collect();

    let mut by_company: BTreeMap<&str, (BTreeSet<DotNumber>, usize, usize)> = BTreeMap::new();
    for policy in snapshot.insurance() {
        let (insured, policies, cancellations) = by_company.entry(policy.insurance_company.as_str()).or_default();
        insured.insert(policy.dot_number);
        *policies += 1;
        if policy.is_cancelled() {
            *cancellations += 1;
        }
    }

    let mut stats: Vec<InsuranceCompanyStats> = by_company
        .into_iter()
        .map(|(company, (insured, total_policies, cancellations))| {
            let known: Vec<DotNumber> = insured.iter().copied().filter(|&dot| snapshot.carrier(dot).is_some()).collect();
            let risk: Vec<u32> = known.iter().map(|dot| score_by_dot.get(dot).copied().unwrap_or(0)).collect();
            let avg_carrier_risk = if risk.is_empty() {
                0.0
            } else {
                risk.iter().map(|&r| f64::from(r)).sum::<f64>() / risk.len() as f64
            };
            InsuranceCompanyStats {
                insurance_company: company.to_string(),
                carriers_insured: insured.len(),
                total_policies,
                cancellations,
                cancellation_rate: 100.0 * cancellations as f64 / total_policies as f64,
                high_risk_carriers: risk.iter().filter(|&&r| r >= high_risk_score).count(),
                avg_carrier_risk,
                total_crashes: known
                    .iter()
                    .filter_map(|&dot| snapshot.carrier(dot))
                    .map(|c| c.total_crashes.max(0))
                    .sum(),
            }
        })
        .collect();

    stats.sort_by(|a, b| {
        b.carriers_insured
            .cmp(&a.carriers_insured)
            .then_with(|| a.insurance_company.cmp(&b.insurance_company))
    });
    stats
}

// ── Stage ───────────────────────────────────────────────────────────

pub struct InsuranceStatsStage;

impl PipelineStage for InsuranceStatsStage {
    fn name(&self) -> &'static str {
        "insurance_stats"
    }

    fn run(&mut self, ctx: &mut StageContext<'_>) -> EngineResult<Vec<PipelineEvent>> {
        let scores = ctx.outputs.scores(self.name())?;
        let stats = compute_insurance_stats(ctx.snapshot, scores, ctx.config.benchmarks.high_risk_score);

        let policy_count = ctx.snapshot.insurance().len();
        log::info!("insurance stats: {} companies over {policy_count} filings", stats.len());
        for s in stats.iter().take(3) {
            log::debug!(
                "insurer {}: {} insured, {:.1}% cancelled, {} high-risk",
                s.insurance_company,
                s.carriers_insured,
                s.cancellation_rate,
                s.high_risk_carriers
            );
        }

        let event = PipelineEvent::InsuranceStatsComputed {
            company_count: stats.len(),
            policy_count,
            cancellations: stats.iter().map(|s| s.cancellations).sum(),
        };
        ctx.outputs.insurance_stats = Some(stats);
        Ok(vec![event])
    }
}
