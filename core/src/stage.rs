//! Stage trait and the shared run context.
//!
//! RULE: Every pipeline stage implements PipelineStage.
//! The engine calls run() on each registered stage once per run,
//! in registration order. Execution order is fixed and documented in engine.rs.
//!
//! RULE: stages never touch the store. They read the snapshot and the
//! outputs of earlier stages from the context and write only their own slot.

use crate::{
    address_cluster_stage::AddressCluster,
    chameleon_stage::ChameleonPair,
    config::EngineConfig,
    error::{EngineError, EngineResult},
    event::PipelineEvent,
    fraud_ring_stage::FraudRing,
    identity_stage::IdentityCluster,
    insurance_stats_stage::InsuranceCompanyStats,
    peer_benchmark_stage::PeerBenchmark,
    rules::RuleTable,
    scoring_stage::CarrierScore,
    snapshot::DatasetSnapshot,
};

/// The contract every stage must fulfill.
pub trait PipelineStage: Send {
    /// Unique stable name for this stage. Recorded with every event it emits.
    fn name(&self) -> &'static str;

    /// Called once per run by the engine.
    ///
    /// Returns the events describing what the stage produced.
    fn run(&mut self, ctx: &mut StageContext<'_>) -> EngineResult<Vec<PipelineEvent>>;
}

/// Read-only inputs plus the output slots filled in as stages complete.
pub struct StageContext<'a> {
    pub snapshot: &'a DatasetSnapshot,
    pub config:   &'a EngineConfig,
    pub rules:    &'a RuleTable,
    pub outputs:  RunOutputs,
}

impl<'a> StageContext<'a> {
    pub fn new(snapshot: &'a DatasetSnapshot, config: &'a EngineConfig, rules: &'a RuleTable) -> Self {
        Self {
            snapshot,
            config,
            rules,
            outputs: RunOutputs::default(),
        }
    }
}

/// One slot per stage. `None` until that stage has run.
#[derive(Debug, Clone, Default)]
pub struct RunOutputs {
    pub address_clusters:  Option<Vec<AddressCluster>>,
    pub identity_clusters: Option<Vec<IdentityCluster>>,
    pub chameleon_pairs:   Option<Vec<ChameleonPair>>,
    pub fraud_rings:       Option<Vec<FraudRing>>,
    pub scores:            Option<Vec<CarrierScore>>,
    pub peer_benchmarks:   Option<Vec<PeerBenchmark>>,
    pub insurance_stats:   Option<Vec<InsuranceCompanyStats>>,
}

fn require<'o, T>(slot: &'o Option<T>, stage: &'static str, missing: &'static str) -> EngineResult<&'o T> {
    slot.as_ref()
        .ok_or(EngineError::StageOrder { stage, missing })
}

impl RunOutputs {
    pub fn address_clusters(&self, stage: &'static str) -> EngineResult<&[AddressCluster]> {
        require(&self.address_clusters, stage, "address_clusters").map(Vec::as_slice)
    }

    pub fn identity_clusters(&self, stage: &'static str) -> EngineResult<&[IdentityCluster]> {
        require(&self.identity_clusters, stage, "identity_resolution").map(Vec::as_slice)
    }

    pub fn chameleon_pairs(&self, stage: &'static str) -> EngineResult<&[ChameleonPair]> {
        require(&self.chameleon_pairs, stage, "chameleon_pairs").map(Vec::as_slice)
    }

    pub fn fraud_rings(&self, stage: &'static str) -> EngineResult<&[FraudRing]> {
        require(&self.fraud_rings, stage, "fraud_rings").map(Vec::as_slice)
    }

    pub fn scores(&self, stage: &'static str) -> EngineResult<&[CarrierScore]> {
        require(&self.scores, stage, "risk_scoring").map(Vec::as_slice)
    }
}
