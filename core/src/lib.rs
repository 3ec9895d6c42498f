//! CarrierWatch correlation engine.
//!
//! Batch pipeline over a snapshot of public motor-carrier data: address
//! clustering, officer identity resolution, chameleon carrier detection,
//! fraud ring detection, rule-based risk scoring, peer benchmarks and
//! insurer statistics. See engine.rs for the fixed stage order.

pub mod address_cluster_stage;
pub mod chameleon_stage;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod fraud_ring_stage;
pub mod identity_stage;
pub mod insurance_stats_stage;
pub mod normalize;
pub mod peer_benchmark_stage;
pub mod rules;
pub mod scoring_stage;
pub mod snapshot;
pub mod stage;
pub mod store;
pub mod types;
pub mod union_find;
