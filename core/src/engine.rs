//! The correlation engine: one batch run over a full dataset snapshot.
//!
//! EXECUTION ORDER (fixed, documented, never reordered):
//!   1. Address clustering
//!   2. Officer identity resolution
//!   3. Chameleon pair detection     (reads 2)
//!   4. Fraud ring detection         (reads 2)
//!   5. Risk scoring                 (reads 1-4)
//!   6. Peer benchmarks
//!   7. Insurer statistics           (reads 5)
//!
//! RULES:
//!   - Stages execute in registration order, once per run.
//!   - Stages read only the snapshot and earlier stages' outputs.
//!   - Nothing reaches the database until every stage has succeeded.
//!   - All outputs of a run are published in one transaction. Readers see
//!     the previous run or this one, never a mix.

use crate::{
    address_cluster_stage::{AddressCluster, AddressClusterStage},
    chameleon_stage::{ChameleonPair, ChameleonStage},
    config::EngineConfig,
    error::{EngineError, EngineResult},
    event::{PipelineEvent, StageEvent},
    fraud_ring_stage::{FraudRing, FraudRingStage},
    identity_stage::{IdentityCluster, IdentityStage},
    insurance_stats_stage::{InsuranceCompanyStats, InsuranceStatsStage},
    peer_benchmark_stage::{PeerBenchmark, PeerBenchmarkStage},
    rules::RuleTable,
    scoring_stage::{CarrierScore, ScoringStage},
    snapshot::DatasetSnapshot,
    stage::{PipelineStage, RunOutputs, StageContext},
    store::CarrierStore,
    types::{AddressHash, DotNumber, RunId},
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

const ENGINE: &str = "engine";

/// Everything one run produced, held in memory until publish.
#[derive(Debug, Clone)]
pub struct CorrelationOutput {
    pub address_clusters:  Vec<AddressCluster>,
    pub identity_clusters: Vec<IdentityCluster>,
    pub chameleon_pairs:   Vec<ChameleonPair>,
    pub fraud_rings:       Vec<FraudRing>,
    pub scores:            Vec<CarrierScore>,
    pub peer_benchmarks:   Vec<PeerBenchmark>,
    pub insurance_stats:   Vec<InsuranceCompanyStats>,
    /// Recomputed hashes of carriers whose stored hash was stale.
    pub rehashed:          Vec<(DotNumber, AddressHash)>,
    pub events:            Vec<StageEvent>,
}

/// The `engine_run` audit row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineRunRecord {
    pub run_id: RunId,
    pub as_of: NaiveDate,
    pub rule_table_version: String,
    pub rule_table_fingerprint: String,
    pub carrier_count: usize,
    pub flagged_carriers: usize,
    pub partial_evaluations: usize,
    pub address_cluster_count: usize,
    pub identity_cluster_count: usize,
    pub chameleon_pair_count: usize,
    pub fraud_ring_count: usize,
    pub benchmarked_carriers: usize,
    pub insurance_company_count: usize,
    /// Set by the store when the run is published.
    pub published_at: Option<String>,
}

pub struct CorrelationEngine {
    pub config:   EngineConfig,
    rules:        RuleTable,
    fingerprint:  String,
    stages:       Vec<Box<dyn PipelineStage>>,
    pub store:    CarrierStore,
}

impl CorrelationEngine {
    /// An engine with no stages. The rule table is validated and
    /// fingerprinted here, before any data is read.
    pub fn new(config: EngineConfig, store: CarrierStore) -> EngineResult<Self> {
        let rules = config.rule_table();
        rules.validate()?;
        let fingerprint = rules.fingerprint()?;
        Ok(Self {
            config,
            rules,
            fingerprint,
            stages: Vec::new(),
            store,
        })
    }

    /// Build a fully wired engine with all stages registered.
    /// Call this instead of new() + manual register() calls.
    pub fn build(config: EngineConfig, store: CarrierStore) -> EngineResult<Self> {
        let mut engine = Self::new(config, store)?;

        // EXECUTION ORDER: fixed, documented, never reordered.
        engine.register(Box::new(AddressClusterStage));
        engine.register(Box::new(IdentityStage));
        engine.register(Box::new(ChameleonStage));
        engine.register(Box::new(FraudRingStage));
        engine.register(Box::new(ScoringStage));
        engine.register(Box::new(PeerBenchmarkStage));
        engine.register(Box::new(InsuranceStatsStage));
        Ok(engine)
    }

    /// A fully wired engine over a fresh migrated in-memory store with the
    /// test config.
    pub fn build_test() -> EngineResult<Self> {
        Self::build_test_with(EngineConfig::default_test())
    }

    pub fn build_test_with(config: EngineConfig) -> EngineResult<Self> {
        let store = CarrierStore::in_memory()?;
        store.migrate()?;
        Self::build(config, store)
    }

    /// Register a stage. Call in the documented execution order.
    pub fn register(&mut self, stage: Box<dyn PipelineStage>) {
        self.stages.push(stage);
    }

    pub fn rule_table(&self) -> &RuleTable {
        &self.rules
    }

    pub fn rule_fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Run every stage over `snapshot`. Pure with respect to the store.
    pub fn compute(&mut self, run_id: &str, snapshot: &DatasetSnapshot) -> EngineResult<CorrelationOutput> {
        let rehashed: Vec<(DotNumber, AddressHash)> = snapshot
            .rehashed()
            .iter()
            .filter_map(|&dot| snapshot.carrier(dot).map(|c| (dot, c.address_hash.clone())))
            .collect();
        if !rehashed.is_empty() {
            log::warn!("[{run_id}] {} carriers had a stale address hash", rehashed.len());
        }

        let mut events = vec![StageEvent {
            stage: ENGINE,
            event: PipelineEvent::RunStarted {
                run_id: run_id.to_string(),
                carrier_count: snapshot.carriers().len(),
                roster_count: snapshot.roster().len(),
                rule_table_version: self.rules.version.clone(),
                rule_table_fingerprint: self.fingerprint.clone(),
                rehashed_carriers: rehashed.len(),
            },
        }];

        let mut ctx = StageContext::new(snapshot, &self.config, &self.rules);
        for stage in &mut self.stages {
            let name = stage.name();
            log::debug!("[{run_id}] stage {name} starting");
            let emitted = stage.run(&mut ctx)?;
            events.extend(emitted.into_iter().map(|event| StageEvent { stage: name, event }));
        }

        let RunOutputs {
            address_clusters,
            identity_clusters,
            chameleon_pairs,
            fraud_rings,
            scores,
            peer_benchmarks,
            insurance_stats,
        } = ctx.outputs;
        let missing = |slot: &'static str| EngineError::StageOrder { stage: ENGINE, missing: slot };
        let scores = scores.ok_or_else(|| missing("risk_scoring"))?;

        events.push(StageEvent {
            stage: ENGINE,
            event: PipelineEvent::RunCompleted {
                run_id: run_id.to_string(),
                flagged_carriers: scores.iter().filter(|s| s.risk_score > 0).count(),
                partial_evaluations: scores.iter().filter(|s| s.partial).count(),
            },
        });

        Ok(CorrelationOutput {
            address_clusters: address_clusters.ok_or_else(|| missing("address_clusters"))?,
            identity_clusters: identity_clusters.ok_or_else(|| missing("identity_resolution"))?,
            chameleon_pairs: chameleon_pairs.ok_or_else(|| missing("chameleon_pairs"))?,
            fraud_rings: fraud_rings.ok_or_else(|| missing("fraud_rings"))?,
            scores,
            peer_benchmarks: peer_benchmarks.ok_or_else(|| missing("peer_benchmarks"))?,
            insurance_stats: insurance_stats.ok_or_else(|| missing("insurance_stats"))?,
            rehashed,
            events,
        })
    }

    /// Load the snapshot, run every stage and publish atomically.
    /// On any error nothing is published and the previous run stays current.
    pub fn run(&mut self, run_id: &str) -> EngineResult<EngineRunRecord> {
        let snapshot = self.store.load_snapshot()?;
        log::info!(
            "[{run_id}] snapshot: {} carriers, {} roster rows",
            snapshot.carriers().len(),
            snapshot.roster().len()
        );

        let output = self.compute(run_id, &snapshot)?;
        let mut record = self.record(run_id, &output);
        record.published_at = Some(self.store.publish_run(&record, &output)?);
        log::info!(
            "[{run_id}] published: {} flagged carriers, {} rings, {} chameleon pairs",
            record.flagged_carriers,
            record.fraud_ring_count,
            record.chameleon_pair_count
        );
        Ok(record)
    }

    fn record(&self, run_id: &str, output: &CorrelationOutput) -> EngineRunRecord {
        EngineRunRecord {
            run_id: run_id.to_string(),
            as_of: self.config.as_of,
            rule_table_version: self.rules.version.clone(),
            rule_table_fingerprint: self.fingerprint.clone(),
            carrier_count: output.scores.len(),
            flagged_carriers: output.scores.iter().filter(|s| s.risk_score > 0).count(),
            partial_evaluations: output.scores.iter().filter(|s| s.partial).count(),
            address_cluster_count: output.address_clusters.len(),
            identity_cluster_count: output.identity_clusters.len(),
            chameleon_pair_count: output.chameleon_pairs.len(),
            fraud_ring_count: output.fraud_rings.len(),
            benchmarked_carriers: output
                .peer_benchmarks
                .iter()
                .filter(|b| b.peer_crash_percentile.is_some())
                .count(),
            insurance_company_count: output.insurance_stats.len(),
            published_at: None,
        }
    }
}
