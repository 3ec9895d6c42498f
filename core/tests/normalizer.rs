//! Address and name normalization: the join keys every stage relies on.

use carrierwatch_core::{
    normalize::{normalize_address, normalize_name, UNKNOWN_ADDRESS_HASH},
    snapshot::Carrier,
};

/// Spelling variants of one street must fingerprint identically.
#[test]
fn street_spellings_share_a_hash() {
    let canonical = normalize_address("123 MAIN ST", "SPRINGFIELD", "IL", "62704");
    for variant in [
        "123 Main Street",
        "123 main st.",
        "  123   Main   Street ",
        "123 Main St, Suite 200",
        "123 Main St Ste 4B",
    ] {
        assert_eq!(
            normalize_address(variant, "Springfield", "il", "62704-0001"),
            canonical,
            "'{variant}' should hash like '123 MAIN ST'"
        );
    }
}

#[test]
fn directionals_and_suffixes_are_abbreviated() {
    assert_eq!(
        normalize_address("100 North Oak Avenue", "Tulsa", "OK", "74103"),
        normalize_address("100 N Oak Ave", "Tulsa", "OK", "74103"),
    );
    assert_eq!(
        normalize_address("9 West Industrial Parkway", "Gary", "IN", "46402"),
        normalize_address("9 W INDUSTRIAL PKWY", "Gary", "IN", "46402"),
    );
}

/// Different buildings never collide.
#[test]
fn different_addresses_differ() {
    let a = normalize_address("123 Main St", "Springfield", "IL", "62704");
    let b = normalize_address("125 Main St", "Springfield", "IL", "62704");
    let c = normalize_address("123 Main St", "Springfield", "MO", "62704");
    assert_ne!(a, b, "street number must be part of the key");
    assert_ne!(a, c, "state must be part of the key");
}

#[test]
fn carriers_without_a_street_are_unknown() {
    let carrier = Carrier::new(1, "Nowhere Freight").at("", "Dallas", "TX", "75201");
    assert_eq!(carrier.address_hash, UNKNOWN_ADDRESS_HASH);
    assert!(carrier.address_key().is_none(), "unknown address must not be usable as a key");
    assert!(Carrier::new(2, "Blank").address_key().is_none());
}

#[test]
fn names_fold_case_spacing_and_punctuation() {
    assert_eq!(normalize_name("JOHN  SMITH"), normalize_name("John Smith"));
    assert_eq!(normalize_name("John Q. Public"), "john q public");
    assert_eq!(normalize_name("ＪＯＨＮ ＳＭＩＴＨ"), "john smith", "full-width forms fold");
    assert_eq!(normalize_name("Blue Line Transport, Inc."), "blue line transport");
}

/// Token order carries meaning; reordered names are different people.
#[test]
fn name_token_order_is_preserved() {
    assert_ne!(normalize_name("Smith, John"), normalize_name("John Smith"));
}
