//! Canonical keys for cross-dataset matching.
//!
//! RULE: every producer and consumer of address-keyed data must go through
//! `normalize_address`. The algorithm below is a wire contract: changing a
//! single abbreviation silently breaks every join on `address_hash`.
//!
//! Address algorithm:
//!   1. Empty street → `UNKNOWN_ADDRESS_HASH` (never clustered).
//!   2. Upper-case, delete ASCII punctuation, split on whitespace.
//!   3. Drop a trailing unit designation (`STE 200`, `APT 4B`, `UNIT3`).
//!      The first token is always kept.
//!   4. Canonicalize street suffixes/directionals token by token.
//!   5. `STREET|CITY|STATE|ZIP5`, SHA-256, first 16 hex chars.

use sha2::{Digest, Sha256};
use unicode_normalization::UnicodeNormalization;

/// Sentinel hash for carriers without a usable street address.
pub const UNKNOWN_ADDRESS_HASH: &str = "unknown";

const ADDRESS_HASH_LEN: usize = 16;

const STREET_ABBREVIATIONS: &[(&str, &str)] = &[
    ("STREET", "ST"),
    ("AVENUE", "AVE"),
    ("AV", "AVE"),
    ("BOULEVARD", "BLVD"),
    ("DRIVE", "DR"),
    ("LANE", "LN"),
    ("ROAD", "RD"),
    ("COURT", "CT"),
    ("PLACE", "PL"),
    ("CIRCLE", "CIR"),
    ("PARKWAY", "PKWY"),
    ("HIGHWAY", "HWY"),
    ("NORTH", "N"),
    ("SOUTH", "S"),
    ("EAST", "E"),
    ("WEST", "W"),
];

/// Single-token directionals. After a unit designator they are a unit label
/// only at the end of the street ("STE E"), never mid-street ("SP N ST").
const DIRECTIONALS: &[&str] = &["N", "S", "E", "W", "NE", "NW", "SE", "SW"];

const UNIT_DESIGNATORS: &[&str] = &[
    "STE", "SUITE", "SUIT", "APT", "APARTMENT", "UNIT", "BLDG", "BUILDING", "FL", "FLOOR",
    "RM", "ROOM", "SP", "SPC", "SPACE", "LOT", "DEPT",
];

/// Corporate suffixes stripped from the end of officer names.
const CORPORATE_SUFFIXES: &[&str] = &[
    "inc",
    "incorporated",
    "corp",
    "corporation",
    "llc",
    "ltd",
    "limited",
    "co",
    "company",
    "lp",
    "llp",
    "pllc",
    "pc",
];

// ── Addresses ───────────────────────────────────────────────────────

/// Fingerprint a physical address. Returns `UNKNOWN_ADDRESS_HASH` when the
/// street is missing.
pub fn normalize_address(raw_address: &str, city: &str, state: &str, zip: &str) -> String {
    match canonical_address(raw_address, city, state, zip) {
        Some(canonical) => {
            let digest = Sha256::digest(canonical.as_bytes());
            let mut hash = hex::encode(digest);
            hash.truncate(ADDRESS_HASH_LEN);
            hash
        }
        None => UNKNOWN_ADDRESS_HASH.to_string(),
    }
}

/// The pre-digest canonical form `STREET|CITY|STATE|ZIP5`.
pub fn canonical_address(raw_address: &str, city: &str, state: &str, zip: &str) -> Option<String> {
    let street = canonical_street(raw_address)?;
    let city = city.trim().to_uppercase();
    let state = state.trim().to_uppercase();
    let zip5: String = zip.trim().chars().take(5).collect();
    Some(format!("{street}|{city}|{state}|{zip5}"))
}

/// True when `hash` may participate in clustering and matching.
pub fn is_known_address(hash: &str) -> bool {
    !hash.is_empty() && hash != UNKNOWN_ADDRESS_HASH
}

fn canonical_street(raw: &str) -> Option<String> {
    let tokens = street_tokens(raw);
    if tokens.is_empty() {
        return None;
    }
    let end = unit_designation_start(&tokens).unwrap_or(tokens.len());
    let street = tokens[..end]
        .iter()
        .map(|t| abbreviate(t))
        .collect::<Vec<_>>()
        .join(" ");
    Some(street)
}

fn street_tokens(raw: &str) -> Vec<String> {
    let cleaned: String = raw
        .to_uppercase()
        .chars()
        .filter(|c| !c.is_ascii_punctuation())
        .collect();
    cleaned.split_whitespace().map(str::to_string).collect()
}

/// Index of the first token that starts a unit designation, if any.
fn unit_designation_start(tokens: &[String]) -> Option<usize> {
    (1..tokens.len()).find(|&i| {
        let token = tokens[i].as_str();
        if UNIT_DESIGNATORS.contains(&token) {
            // Needs a unit label after it: "STE 200", "APT B".
            return is_unit_label(tokens, i + 1);
        }
        UNIT_DESIGNATORS.iter().any(|d| {
            token
                .strip_prefix(d)
                .and_then(|rest| rest.chars().next())
                .is_some_and(|c| c.is_ascii_digit())
        })
    })
}

/// A short or numbered token that is not a street word. "10 LOT RD" and
/// "5 SP N ST" name streets, not units.
fn is_unit_label(tokens: &[String], i: usize) -> bool {
    let Some(label) = tokens.get(i).map(String::as_str) else {
        return false;
    };
    if !(label.len() <= 2 || label.chars().any(|c| c.is_ascii_digit())) {
        return false;
    }
    if DIRECTIONALS.contains(&label) {
        return i + 1 == tokens.len();
    }
    !is_street_suffix(label)
}

fn is_street_suffix(token: &str) -> bool {
    STREET_ABBREVIATIONS
        .iter()
        .any(|(long, short)| *long == token || *short == token)
}

fn abbreviate(token: &str) -> &str {
    STREET_ABBREVIATIONS
        .iter()
        .find(|(long, _)| *long == token)
        .map(|(_, short)| *short)
        .unwrap_or(token)
}

/// PO boxes and private mailboxes cannot host a trucking operation.
pub fn looks_like_po_box(raw_address: &str) -> bool {
    let tokens = street_tokens(raw_address);
    let joined = tokens.join(" ");
    joined.starts_with("PO BOX")
        || joined.starts_with("P O BOX")
        || joined.starts_with("POST OFFICE BOX")
        || joined.starts_with("POBOX")
        || tokens.iter().any(|t| t == "PMB")
}

// ── Names ───────────────────────────────────────────────────────────

/// Normalize an officer or company name for equality matching.
///
/// Token order is preserved: "smith john" and "john smith" stay distinct.
pub fn normalize_name(raw_name: &str) -> String {
    let folded: String = raw_name.nfkc().collect();
    let cleaned: String = folded
        .chars()
        .filter(|c| !matches!(c, '.' | ',' | '\''))
        .flat_map(|c| {
            let c = if c.is_alphanumeric() { c } else { ' ' };
            c.to_lowercase()
        })
        .collect();

    let mut tokens: Vec<&str> = cleaned.split_whitespace().collect();
    while tokens.len() > 1 && tokens.last().is_some_and(|t| CORPORATE_SUFFIXES.contains(t)) {
        tokens.pop();
    }
    tokens.join(" ")
}

// ── Contact fields ──────────────────────────────────────────────────

/// Digits-only phone. Numbers shorter than 7 digits carry no signal.
pub fn normalize_phone(raw: &str) -> Option<String> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    let digits = if digits.len() == 11 && digits.starts_with('1') {
        digits[1..].to_string()
    } else {
        digits
    };
    (digits.len() >= 7).then_some(digits)
}

pub fn normalize_email(raw: &str) -> Option<String> {
    let email = raw.trim().to_lowercase();
    let (local, domain) = email.split_once('@')?;
    (!local.is_empty() && !domain.is_empty()).then_some(email)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_sixteen_hex_chars() {
        let h = normalize_address("123 Main St", "Springfield", "IL", "62704");
        assert_eq!(h.len(), 16);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn canonical_form_uses_pipe_separator() {
        assert_eq!(
            canonical_address("123 Main Street, Suite 200", "springfield ", "il", "62704-1234"),
            Some("123 MAIN ST|SPRINGFIELD|IL|62704".to_string())
        );
    }

    #[test]
    fn unit_words_without_a_label_are_kept() {
        assert_eq!(
            canonical_address("100 Space Center Blvd", "Houston", "TX", "77058"),
            Some("100 SPACE CENTER BLVD|HOUSTON|TX|77058".to_string())
        );
        assert_eq!(
            canonical_address("55 Oak Ave Apt4B", "Dayton", "OH", "45402"),
            Some("55 OAK AVE|DAYTON|OH|45402".to_string())
        );
    }

    #[test]
    fn street_words_after_a_designator_are_not_units() {
        assert_eq!(
            canonical_address("10 Lot Rd", "Ocala", "FL", "34470"),
            Some("10 LOT RD|OCALA|FL|34470".to_string())
        );
        assert_eq!(
            canonical_address("5 SP N St", "Yuma", "AZ", "85364"),
            Some("5 SP N ST|YUMA|AZ|85364".to_string())
        );
        assert_eq!(
            canonical_address("8 Depot Rd Ste E", "Yuma", "AZ", "85364"),
            Some("8 DEPOT RD|YUMA|AZ|85364".to_string()),
            "a trailing directional is still a suite letter"
        );
    }

    #[test]
    fn blank_street_is_unknown() {
        assert_eq!(normalize_address("   ", "X", "TX", "75001"), UNKNOWN_ADDRESS_HASH);
        assert_eq!(normalize_address("#,.", "X", "TX", "75001"), UNKNOWN_ADDRESS_HASH);
        assert!(!is_known_address(UNKNOWN_ADDRESS_HASH));
    }

    #[test]
    fn name_strips_trailing_suffix_only() {
        assert_eq!(normalize_name("  John  A. O'Brien "), "john a obrien");
        assert_eq!(normalize_name("Acme Trucking, LLC"), "acme trucking");
        assert_eq!(normalize_name("Co"), "co");
    }

    #[test]
    fn phone_and_email() {
        assert_eq!(normalize_phone("(555) 123-4567"), Some("5551234567".into()));
        assert_eq!(normalize_phone("1-555-123-4567"), Some("5551234567".into()));
        assert_eq!(normalize_phone("12345"), None);
        assert_eq!(normalize_email(" Ops@Carrier.COM "), Some("ops@carrier.com".into()));
        assert_eq!(normalize_email("not-an-email"), None);
    }

    #[test]
    fn po_box_detection() {
        assert!(looks_like_po_box("P.O. Box 1234"));
        assert!(looks_like_po_box("PO BOX 9"));
        assert!(looks_like_po_box("4500 Main St PMB 12"));
        assert!(!looks_like_po_box("12 Boxwood Ln"));
    }
}
