//! Address clustering: carriers sharing one physical address.

use carrierwatch_core::{
    address_cluster_stage::{build_address_clusters, cluster_size_by_dot},
    engine::CorrelationEngine,
    event::PipelineEvent,
    normalize::normalize_address,
    snapshot::{Carrier, OperatingStatus},
};

fn at_main(dot: i64) -> Carrier {
    Carrier::new(dot, &format!("Carrier {dot}")).at("123 Main Street", "Springfield", "IL", "62704")
}

#[test]
fn six_carriers_at_one_address_form_one_cluster() {
    let mut carriers: Vec<Carrier> = (1..=6).map(at_main).collect();
    carriers.push(Carrier::new(7, "Elsewhere").at("9 Elm St", "Springfield", "IL", "62704"));

    let clusters = build_address_clusters(&carriers);
    assert_eq!(clusters.len(), 1, "only the shared address clusters");
    assert_eq!(clusters[0].member_dots, vec![1, 2, 3, 4, 5, 6]);
    assert_eq!(clusters[0].carrier_count, 6);

    let sizes = cluster_size_by_dot(&clusters);
    assert_eq!(sizes.get(&3), Some(&6));
    assert_eq!(sizes.get(&7), None, "a lone carrier has no cluster");
}

#[test]
fn spelling_variants_cluster_together() {
    let carriers = vec![
        Carrier::new(1, "A").at("123 Main Street", "Springfield", "IL", "62704"),
        Carrier::new(2, "B").at("123 MAIN ST.", "SPRINGFIELD", "IL", "62704-1111"),
        Carrier::new(3, "C").at("123 Main St Suite 9", "Springfield", "IL", "62704"),
    ];
    let clusters = build_address_clusters(&carriers);
    assert_eq!(clusters.len(), 1);
    assert_eq!(clusters[0].carrier_count, 3);
}

#[test]
fn unknown_addresses_never_cluster() {
    let carriers: Vec<Carrier> = (1..=5).map(|dot| Carrier::new(dot, "No Street")).collect();
    assert!(
        build_address_clusters(&carriers).is_empty(),
        "carriers without a street must not form a cluster"
    );
}

#[test]
fn centroid_averages_members_with_coordinates() {
    let carriers = vec![
        at_main(1).with_coordinates(10.0, 20.0),
        at_main(2).with_coordinates(20.0, 40.0),
        at_main(3),
    ];
    let cluster = &build_address_clusters(&carriers)[0];
    assert_eq!(cluster.centroid_lat, Some(15.0));
    assert_eq!(cluster.centroid_lon, Some(30.0));

    let no_coords = build_address_clusters(&[at_main(1), at_main(2)]);
    assert_eq!(no_coords[0].centroid_lat, None);
}

#[test]
fn aggregates_and_display_address() {
    let carriers = vec![
        at_main(1).with_crashes(3, 1).with_inspections(10, 0.2, 0.0),
        at_main(2).with_crashes(2, 0).with_inspections(5, 0.4, 0.0).with_status(OperatingStatus::Inactive),
    ];
    let cluster = &build_address_clusters(&carriers)[0];
    assert_eq!(cluster.active_count, 1);
    assert_eq!(cluster.total_crashes, 5);
    assert_eq!(cluster.total_inspections, 15);
    assert!((cluster.avg_vehicle_oos_rate - 0.3).abs() < 1e-9);
    assert_eq!(cluster.street.as_deref(), Some("123 Main Street"), "display address comes from lowest DOT");
}

#[test]
fn larger_clusters_come_first() {
    let mut carriers: Vec<Carrier> = (1..=2).map(at_main).collect();
    carriers.extend((10..=13).map(|dot| Carrier::new(dot, "X").at("77 Dock Rd", "Joliet", "IL", "60431")));
    let clusters = build_address_clusters(&carriers);
    assert_eq!(clusters.len(), 2);
    assert_eq!(clusters[0].carrier_count, 4);
    assert_eq!(clusters[1].carrier_count, 2);
}

/// Clusters published through the engine can be read back from the store.
#[test]
fn engine_publishes_clusters() {
    let mut engine = CorrelationEngine::build_test().unwrap();
    for dot in 1..=3 {
        engine.store.upsert_carrier(&at_main(dot)).unwrap();
    }
    engine
        .store
        .upsert_carrier(&Carrier::new(4, "Elsewhere").at("9 Elm St", "Springfield", "IL", "62704"))
        .unwrap();
    engine.run("cluster-run").unwrap();

    let stored = engine.store.address_clusters().unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].member_dots, vec![1, 2, 3]);
    assert_eq!(stored[0].address_hash, at_main(1).address_hash);
}

/// Rows written straight into the carrier table keep the column default
/// hash. The engine hashes them itself and writes the fresh hash back.
#[test]
fn rows_inserted_without_a_hash_still_cluster() {
    let mut engine = CorrelationEngine::build_test().unwrap();
    engine
        .store
        .execute_batch(
            "INSERT INTO carrier (dot_number, legal_name, physical_address, physical_city, physical_state, physical_zip)
             VALUES (1, 'A', '123 Main Street', 'Springfield', 'IL', '62704'),
                    (2, 'B', '123 MAIN ST', 'SPRINGFIELD', 'IL', '62704'),
                    (3, 'C', '9 Elm St', 'Springfield', 'IL', '62704');",
        )
        .unwrap();
    assert_eq!(engine.store.stored_address_hash(1).unwrap().as_deref(), Some("unknown"));

    let record = engine.run("raw-rows").unwrap();
    assert_eq!(record.address_cluster_count, 1, "raw rows must cluster on their address");
    let stored = engine.store.address_clusters().unwrap();
    assert_eq!(stored[0].member_dots, vec![1, 2]);

    let expected = normalize_address("123 Main Street", "Springfield", "IL", "62704");
    assert_eq!(stored[0].address_hash, expected);
    for dot in [1, 2] {
        assert_eq!(
            engine.store.stored_address_hash(dot).unwrap(),
            Some(expected.clone()),
            "publish must write the recomputed hash back for DOT {dot}"
        );
    }

    let events = engine.store.events_for_run("raw-rows").unwrap();
    let started: PipelineEvent = serde_json::from_str(&events[0].payload).unwrap();
    assert!(
        matches!(started, PipelineEvent::RunStarted { rehashed_carriers: 3, .. }),
        "every raw row had a stale hash: {started:?}"
    );

    // Hashes are current now, so a second run has nothing to rewrite.
    engine.run("raw-rows-2").unwrap();
    let events = engine.store.events_for_run("raw-rows-2").unwrap();
    let started: PipelineEvent = serde_json::from_str(&events[0].payload).unwrap();
    assert!(matches!(started, PipelineEvent::RunStarted { rehashed_carriers: 0, .. }));
}
