//! Officer identity resolution: splitting one name into the people behind it.

use carrierwatch_core::{
    engine::CorrelationEngine,
    identity_stage::{officer_fan_out, resolve_identities, IdentityCluster, LinkSignal},
    snapshot::{Carrier, DatasetSnapshot, RosterEntry},
};
use std::collections::BTreeSet;

fn carrier(dot: i64, state: &str) -> Carrier {
    Carrier::new(dot, &format!("Carrier {dot}")).at(&format!("{dot} Route Rd"), "Town", state, "00001")
}

fn clusters_for<'a>(clusters: &'a [IdentityCluster], name: &str) -> Vec<&'a IdentityCluster> {
    clusters.iter().filter(|c| c.officer_name == name).collect()
}

/// Every (name, carrier) pair lands in exactly one cluster of that name.
#[test]
fn clusters_partition_the_name() {
    let carriers = vec![carrier(1, "TX"), carrier(2, "OK"), carrier(3, "KS"), carrier(4, "NM"), carrier(5, "CO")];
    let roster = vec![
        RosterEntry::new(1, "John Smith").with_phone("555-123-4567"),
        RosterEntry::new(2, "JOHN SMITH").with_phone("(555) 123 4567"),
        RosterEntry::new(3, "John Smith").with_email("js@haul.example"),
        RosterEntry::new(4, "John Smith").with_email("JS@haul.example"),
        RosterEntry::new(5, "John Smith"),
    ];
    let clusters = resolve_identities(&DatasetSnapshot::new(carriers, roster));
    let john = clusters_for(&clusters, "john smith");

    assert_eq!(john.len(), 3, "phone pair, email pair and a singleton");
    let mut seen = BTreeSet::new();
    for cluster in &john {
        for dot in &cluster.member_dots {
            assert!(seen.insert(*dot), "DOT {dot} appears in two clusters");
        }
    }
    assert_eq!(seen, (1..=5).collect(), "every carrier must be covered");

    assert_eq!(john[0].member_dots, vec![1, 2]);
    assert_eq!(john[0].link_signals, vec![LinkSignal::Phone]);
    assert_eq!(john[1].member_dots, vec![3, 4]);
    assert_eq!(john[1].link_signals, vec![LinkSignal::Email]);
    assert_eq!(john[2].member_dots, vec![5]);
    assert!(john[2].is_name_only());
    let indexes: Vec<usize> = john.iter().map(|c| c.cluster_index).collect();
    assert_eq!(indexes, vec![0, 1, 2]);
}

/// A shared name alone never merges carriers.
#[test]
fn name_alone_does_not_link() {
    let carriers = vec![carrier(1, "TX"), carrier(2, "OK")];
    let roster = vec![RosterEntry::new(1, "Ann Lee"), RosterEntry::new(2, "Ann Lee")];
    let clusters = resolve_identities(&DatasetSnapshot::new(carriers, roster));
    assert_eq!(clusters.len(), 2);
    assert!(clusters.iter().all(IdentityCluster::is_name_only));
    assert!(
        officer_fan_out(&clusters).is_empty(),
        "name-only clusters must not count toward officer fan-out"
    );
}

/// Every old cluster sits inside one new cluster of the same name, and that
/// cluster kept all the evidence the old one had.
fn assert_only_merges(before: &[IdentityCluster], after: &[IdentityCluster]) {
    for old in before {
        let Some(new) = after
            .iter()
            .find(|new| new.officer_name == old.officer_name && old.member_dots.iter().all(|d| new.contains(*d)))
        else {
            panic!("cluster {} {:?} was split by extra evidence", old.officer_name, old.member_dots);
        };
        for signal in old.link_signals.iter().filter(|s| **s != LinkSignal::NameOnly) {
            assert!(
                new.link_signals.contains(signal),
                "{signal:?} of {:?} was lost after merging into {:?} ({:?})",
                old.member_dots,
                new.member_dots,
                new.link_signals
            );
        }
    }
}

/// Adding evidence can only merge clusters, never split them.
#[test]
fn more_evidence_only_merges() {
    let carriers = vec![carrier(1, "TX"), carrier(2, "OK"), carrier(3, "KS")];
    let before = vec![
        RosterEntry::new(1, "Ann Lee"),
        RosterEntry::new(2, "Ann Lee").with_phone("555-000-1111"),
        RosterEntry::new(3, "Ann Lee").with_phone("555-000-1111"),
    ];
    let mut after = before.clone();
    after[0] = RosterEntry::new(1, "Ann Lee").with_phone("555-000-1111");

    let a = resolve_identities(&DatasetSnapshot::new(carriers.clone(), before));
    let b = resolve_identities(&DatasetSnapshot::new(carriers, after));
    assert!(b.len() <= a.len());
    assert_only_merges(&a, &b);
    assert_eq!(b.len(), 1);
    assert_eq!(b[0].member_dots, vec![1, 2, 3]);
}

/// Circumstantial signals survive when a shared email pulls in another carrier.
#[test]
fn merging_keeps_existing_signals() {
    let carriers = vec![carrier(1, "TX"), carrier(2, "TX"), carrier(3, "OK")];
    let before = vec![
        RosterEntry::new(1, "Ann Lee"),
        RosterEntry::new(1, "Bo Diaz"),
        RosterEntry::new(2, "Ann Lee"),
        RosterEntry::new(2, "Bo Diaz"),
        RosterEntry::new(3, "Ann Lee"),
    ];
    let a = resolve_identities(&DatasetSnapshot::new(carriers.clone(), before.clone()));
    let ann = clusters_for(&a, "ann lee");
    assert_eq!(ann[0].member_dots, vec![1, 2]);
    assert_eq!(ann[0].link_signals, vec![LinkSignal::CoOfficer, LinkSignal::SameState]);
    assert!(ann[1].is_name_only());

    let mut after = before;
    after[2] = RosterEntry::new(2, "Ann Lee").with_email("ann@haul.example");
    after[4] = RosterEntry::new(3, "Ann Lee").with_email("ANN@haul.example");
    let b = resolve_identities(&DatasetSnapshot::new(carriers, after));

    assert_only_merges(&a, &b);
    let ann = clusters_for(&b, "ann lee");
    assert_eq!(ann.len(), 1);
    assert_eq!(ann[0].member_dots, vec![1, 2, 3]);
    assert_eq!(
        ann[0].link_signals,
        vec![LinkSignal::CoOfficer, LinkSignal::Email, LinkSignal::SameState],
        "the email link adds to the co-officer evidence"
    );
}

#[test]
fn co_officers_link_carriers() {
    let carriers = vec![carrier(10, "TX"), carrier(11, "OK")];
    let roster = vec![
        RosterEntry::new(10, "Ann Lee"),
        RosterEntry::new(10, "Bo Diaz"),
        RosterEntry::new(11, "Ann Lee"),
        RosterEntry::new(11, "Bo Diaz"),
    ];
    let clusters = resolve_identities(&DatasetSnapshot::new(carriers, roster));
    for name in ["ann lee", "bo diaz"] {
        let found = clusters_for(&clusters, name);
        assert_eq!(found.len(), 1, "{name} should resolve to one identity");
        assert_eq!(found[0].member_dots, vec![10, 11]);
        assert_eq!(found[0].link_signals, vec![LinkSignal::CoOfficer]);
        assert!(!found[0].is_corroborated(), "co-officer evidence is circumstantial");
    }
}

#[test]
fn same_state_only_annotates_linked_carriers() {
    let carriers = vec![carrier(20, "TX"), carrier(21, "TX"), carrier(22, "TX")];
    let roster = vec![
        RosterEntry::new(20, "Cy Park").with_phone("555-222-3333"),
        RosterEntry::new(21, "Cy Park").with_phone("555-222-3333"),
        RosterEntry::new(22, "Cy Park"),
    ];
    let clusters = resolve_identities(&DatasetSnapshot::new(carriers, roster));
    assert_eq!(clusters.len(), 2, "same state alone must not pull in DOT 22");
    assert_eq!(clusters[0].member_dots, vec![20, 21]);
    assert_eq!(clusters[0].link_signals, vec![LinkSignal::Phone, LinkSignal::SameState]);
    assert_eq!(clusters[0].states, vec!["TX".to_string()]);
    assert_eq!(clusters[1].link_signals, vec![LinkSignal::NameOnly]);
}

#[test]
fn shared_address_links() {
    let carriers = vec![
        Carrier::new(30, "A").at("5 Depot St", "Waco", "TX", "76701"),
        Carrier::new(31, "B").at("5 Depot Street", "Waco", "TX", "76701"),
    ];
    let roster = vec![RosterEntry::new(30, "Di Wu"), RosterEntry::new(31, "Di Wu")];
    let clusters = resolve_identities(&DatasetSnapshot::new(carriers, roster));
    assert_eq!(clusters.len(), 1);
    assert!(clusters[0].link_signals.contains(&LinkSignal::Address));
    assert!(clusters[0].is_corroborated());
}

#[test]
fn duplicate_rows_for_one_carrier_merge() {
    let carriers = vec![carrier(1, "TX")];
    let roster = vec![
        RosterEntry::new(1, "Eve Ross").with_position("President"),
        RosterEntry::new(1, "EVE ROSS").with_position("Secretary"),
    ];
    let clusters = resolve_identities(&DatasetSnapshot::new(carriers, roster));
    assert_eq!(clusters.len(), 1);
    assert_eq!(clusters[0].carrier_count, 1);
}

#[test]
fn cluster_aggregates() {
    let carriers = vec![
        carrier(1, "TX").with_crashes(4, 1).with_ppp(1, 50_000.0, 50_000.0),
        carrier(2, "ok").with_crashes(1, 0).with_ppp(1, 25_000.0, 0.0),
    ];
    let roster = vec![
        RosterEntry::new(1, "Fay Hale").with_email("fay@x.example"),
        RosterEntry::new(2, "Fay Hale").with_email("fay@x.example"),
    ];
    let clusters = resolve_identities(&DatasetSnapshot::new(carriers, roster));
    let c = &clusters[0];
    assert_eq!(c.total_crashes, 5);
    assert_eq!(c.fatal_crashes, 1);
    assert_eq!(c.ppp_total, 75_000.0);
    assert_eq!(c.states, vec!["OK".to_string(), "TX".to_string()]);
}

/// Resolved identities are stored per name with scores captured from the run.
#[test]
fn engine_publishes_identities_by_name() {
    let mut engine = CorrelationEngine::build_test().unwrap();
    for dot in 1..=2 {
        engine.store.upsert_carrier(&carrier(dot, "TX").with_crashes(0, 1)).unwrap();
        engine
            .store
            .insert_roster_entry(&RosterEntry::new(dot, "Gus Ortiz").with_phone("555-444-5555"))
            .unwrap();
    }
    engine.run("identity-run").unwrap();

    let stored = engine.store.identity_clusters_for_name("gus ortiz").unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].member_dots, vec![1, 2]);
    assert_eq!(
        stored[0].link_signals,
        vec![LinkSignal::Phone, LinkSignal::SameState]
    );
    let score = engine.store.carrier_score(1).unwrap().unwrap().risk_score;
    assert_eq!(stored[0].avg_risk_score, f64::from(score), "average of two equal scores");
}
