//! carrierwatch-runner: headless batch runner for the correlation engine.
//!
//! Usage:
//!   carrierwatch-runner --db carriers.db
//!   carrierwatch-runner --db carriers.db --load dataset.json --as-of 2024-06-30
//!   carrierwatch-runner --db carriers.db --config engine.json --top 25
//!   carrierwatch-runner --print-rules > rules.json

use anyhow::{Context, Result};
use carrierwatch_core::{
    config::EngineConfig,
    engine::{CorrelationEngine, EngineRunRecord},
    rules::RuleTable,
    snapshot::Dataset,
    store::CarrierStore,
};
use chrono::NaiveDate;
use std::env;

fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();

    if args.iter().any(|a| a == "--print-rules") {
        println!("{}", serde_json::to_string_pretty(&RuleTable::standard())?);
        return Ok(());
    }

    let db = flag_value(&args, "--db").unwrap_or(":memory:");
    let load = flag_value(&args, "--load");
    let config_path = flag_value(&args, "--config");
    let rules_path = flag_value(&args, "--rules");
    let top = parse_arg(&args, "--top", 10usize);

    let mut config = match config_path {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::new(chrono::Utc::now().date_naive()),
    };
    if let Some(as_of) = flag_value(&args, "--as-of") {
        config.as_of = NaiveDate::parse_from_str(as_of, "%Y-%m-%d")
            .with_context(|| format!("--as-of must be YYYY-MM-DD, got {as_of}"))?;
    }
    if let Some(path) = rules_path {
        let json = std::fs::read_to_string(path).with_context(|| format!("Cannot read {path}"))?;
        config.rules = Some(RuleTable::from_json(&json)?);
    }

    println!("CarrierWatch correlation engine");
    println!("  db:       {db}");
    println!("  as_of:    {}", config.as_of);
    println!("  dataset:  {}", load.unwrap_or("(none)"));
    println!();

    let store = CarrierStore::open(db)?;
    store.migrate()?;

    if let Some(path) = load {
        let json = std::fs::read_to_string(path).with_context(|| format!("Cannot read {path}"))?;
        let dataset = Dataset::from_json(&json).with_context(|| format!("Cannot parse {path}"))?;
        store.load_dataset(&dataset)?;
    }
    log::info!("store holds {} carriers", store.carrier_count()?);

    let run_id = format!("run-{}", uuid::Uuid::new_v4());
    let mut engine = CorrelationEngine::build(config, store)?;
    let record = engine.run(&run_id)?;

    print_summary(&engine, &record, top)?;
    Ok(())
}

fn print_summary(engine: &CorrelationEngine, record: &EngineRunRecord, top: usize) -> Result<()> {
    println!("=== RUN SUMMARY ===");
    println!("  run_id:            {}", record.run_id);
    println!("  rule table:        {} ({})", record.rule_table_version, &record.rule_table_fingerprint[..12]);
    println!("  carriers scored:   {}", record.carrier_count);
    println!("  flagged:           {}", record.flagged_carriers);
    println!("  partial:           {}", record.partial_evaluations);
    println!("  address clusters:  {}", record.address_cluster_count);
    println!("  officer clusters:  {}", record.identity_cluster_count);
    println!("  chameleon pairs:   {}", record.chameleon_pair_count);
    println!("  fraud rings:       {}", record.fraud_ring_count);
    println!("  peer benchmarked:  {}", record.benchmarked_carriers);
    println!("  insurers:          {}", record.insurance_company_count);

    let mut scores = engine.store.carrier_scores()?;
    scores.retain(|s| s.risk_score > 0);
    scores.sort_by(|a, b| b.risk_score.cmp(&a.risk_score).then_with(|| a.dot_number.cmp(&b.dot_number)));

    println!();
    println!("=== TOP {top} CARRIERS BY RISK ===");
    if scores.is_empty() {
        println!("  (No carriers flagged)");
    }
    for s in scores.iter().take(top) {
        println!("  DOT {:>9} | {:>4} | {}", s.dot_number, s.risk_score, s.risk_flags.join(", "));
    }

    let rings = engine.store.fraud_rings()?;
    if !rings.is_empty() {
        println!();
        println!("=== FRAUD RINGS ===");
        for r in rings.iter().take(top) {
            println!(
                "  #{:<4} | {} carriers | {} | risk {} | officers: {}",
                r.ring_id,
                r.carrier_count,
                r.confidence.as_str(),
                r.combined_risk,
                r.officer_names.join(", ")
            );
        }
    }

    let insurers = engine.store.insurance_company_stats()?;
    if !insurers.is_empty() {
        println!();
        println!("=== INSURERS BY CARRIERS INSURED ===");
        for i in insurers.iter().take(top) {
            println!(
                "  {:<40} | {:>6} insured | {:>5.1}% cancelled | {} high-risk",
                i.insurance_company, i.carriers_insured, i.cancellation_rate, i.high_risk_carriers
            );
        }
    }
    Ok(())
}

fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.windows(2)
        .find(|w| w[0] == flag)
        .map(|w| w[1].as_str())
}

fn parse_arg<T: std::str::FromStr + Copy>(args: &[String], flag: &str, default: T) -> T {
    args.windows(2)
        .find(|w| w[0] == flag)
        .and_then(|w| w[1].parse().ok())
        .unwrap_or(default)
}
