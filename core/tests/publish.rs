//! Publishing: a run is all-or-nothing, audited and replayable from its event log.

use carrierwatch_core::{
    engine::CorrelationEngine,
    event::PipelineEvent,
    snapshot::{Carrier, Dataset, RosterEntry},
};

fn seed(engine: &CorrelationEngine) {
    for dot in 1..=3 {
        engine
            .store
            .upsert_carrier(
                &Carrier::new(dot, &format!("Carrier {dot}"))
                    .at("44 Wharf St", "Mobile", "AL", "36602")
                    .with_crashes(1, 0),
            )
            .unwrap();
        engine
            .store
            .insert_roster_entry(&RosterEntry::new(dot, "Ivy Nash").with_phone("251-555-0199"))
            .unwrap();
    }
}

#[test]
fn run_record_and_events_are_persisted() {
    let mut engine = CorrelationEngine::build_test().unwrap();
    seed(&engine);
    let record = engine.run("publish-run").unwrap();

    assert!(record.published_at.is_some(), "published runs carry a timestamp");
    assert_eq!(engine.store.run_count().unwrap(), 1);
    assert_eq!(engine.store.latest_run().unwrap().as_ref(), Some(&record));
    assert_eq!(record.carrier_count, 3);
    assert_eq!(record.address_cluster_count, 1);
    assert_eq!(record.rule_table_fingerprint, engine.rule_fingerprint());

    let events = engine.store.events_for_run("publish-run").unwrap();
    let stages: Vec<&str> = events.iter().map(|e| e.stage.as_str()).collect();
    assert_eq!(
        stages,
        vec![
            "engine",
            "address_clusters",
            "identity_resolution",
            "chameleon_pairs",
            "fraud_rings",
            "risk_scoring",
            "peer_benchmarks",
            "insurance_stats",
            "engine",
        ],
        "events must follow the fixed stage order"
    );
    for (i, e) in events.iter().enumerate() {
        assert_eq!(e.seq, i as i64, "event sequence has a gap at {i}");
    }

    let first: PipelineEvent = serde_json::from_str(&events[0].payload).unwrap();
    assert!(matches!(first, PipelineEvent::RunStarted { carrier_count: 3, .. }));
    assert_eq!(events.last().map(|e| e.event_type.as_str()), Some("run_completed"));
}

/// A failure while publishing leaves the previous run fully in place.
#[test]
fn failed_publish_keeps_previous_run() {
    let mut engine = CorrelationEngine::build_test().unwrap();
    seed(&engine);
    engine.run("good-run").unwrap();
    let clusters_before = engine.store.address_clusters().unwrap();
    let scores_before = engine.store.carrier_scores().unwrap();

    // New data that would change every score, then a broken output table.
    for dot in 1..=3 {
        engine
            .store
            .upsert_carrier(
                &Carrier::new(dot, &format!("Carrier {dot}"))
                    .at(&format!("{dot} Elsewhere Rd"), "Mobile", "AL", "36602")
                    .with_crashes(9, 3),
            )
            .unwrap();
    }
    engine.store.execute_batch("DROP TABLE fraud_ring;").unwrap();

    assert!(engine.run("broken-run").is_err(), "publish into a missing table must fail");
    assert_eq!(engine.store.run_count().unwrap(), 1);
    assert_eq!(engine.store.latest_run().unwrap().unwrap().run_id, "good-run");
    assert_eq!(engine.store.address_clusters().unwrap(), clusters_before);
    assert_eq!(engine.store.carrier_scores().unwrap(), scores_before);
    assert!(engine.store.events_for_run("broken-run").unwrap().is_empty());
}

/// Each run replaces the derived tables; nothing from a previous run lingers.
#[test]
fn rerun_replaces_derived_tables() {
    let mut engine = CorrelationEngine::build_test().unwrap();
    seed(&engine);
    engine.run("run-1").unwrap();
    assert_eq!(engine.store.address_clusters().unwrap().len(), 1);

    for dot in 1..=3 {
        engine
            .store
            .upsert_carrier(&Carrier::new(dot, "Moved").at(&format!("{dot} New St"), "Mobile", "AL", "36602"))
            .unwrap();
    }
    let record = engine.run("run-2").unwrap();

    assert!(engine.store.address_clusters().unwrap().is_empty(), "stale cluster survived");
    assert_eq!(record.address_cluster_count, 0);
    assert_eq!(engine.store.run_count().unwrap(), 2);
    assert_eq!(engine.store.latest_run().unwrap().unwrap().run_id, "run-2");
    assert_eq!(engine.store.events_for_run("run-1").unwrap().len(), 9, "history is kept");
}

#[test]
fn empty_store_runs_cleanly() {
    let mut engine = CorrelationEngine::build_test().unwrap();
    let record = engine.run("empty-run").unwrap();
    assert_eq!(record.carrier_count, 0);
    assert_eq!(record.flagged_carriers, 0);
    assert!(engine.store.carrier_scores().unwrap().is_empty());
}

/// The bundled demo dataset loads and correlates end to end.
#[test]
fn demo_dataset_runs_end_to_end() {
    let dataset = Dataset::from_json(include_str!("../../demos/dataset.json")).unwrap();
    let mut engine = CorrelationEngine::build_test().unwrap();
    engine.store.load_dataset(&dataset).unwrap();
    let record = engine.run("demo-run").unwrap();

    assert_eq!(record.carrier_count, 5);
    assert_eq!(record.address_cluster_count, 1, "the Amarillo yard is shared");
    let pairs = engine.store.chameleon_pairs().unwrap();
    assert!(
        pairs.iter().any(|p| p.predecessor_dot == 3100001 && p.successor_dot == 3100002),
        "Redline -> Bluebird should be detected: {pairs:?}"
    );
    let redline = engine.store.carrier_score(3100001).unwrap().unwrap();
    assert!(redline.risk_flags.contains(&"PPP_LARGE_LOAN".to_string()));
    assert_eq!(record.insurance_company_count, 2, "insurer names fold before grouping");
}
