use once_cell::sync::Lazy;
use regex::Regex;

use crate::geocoder::NO_NUMBER;

static STREET_NUMBER_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(.*?),\s*(\d+|S/?N)(.*)$").expect("valid street pattern"));

/// State code trailing a neighborhood fragment, separated by space, comma or hyphen.
static REGION_SUFFIX_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)[\s,-]+(SP|MG|RJ|ES)$").expect("valid region pattern"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefinedAddress {
    pub street: String,
    pub house_number: String,
    pub neighborhood: String,
}

/// Splits `"STREET, NUMBER, NEIGHBORHOOD"` text. Never fails: unmatched input
/// comes back whole as the street with no number and no neighborhood.
pub fn refine(text: &str) -> RefinedAddress {
    let Some(captures) = STREET_NUMBER_PATTERN.captures(text) else {
        return RefinedAddress {
            street: text.to_string(),
            house_number: NO_NUMBER.to_string(),
            neighborhood: String::new(),
        };
    };

    let street = captures[1].trim().to_uppercase();
    let house_number = captures[2].trim().to_uppercase();
    let remainder = captures[3].trim();
    let neighborhood = if remainder.is_empty() {
        String::new()
    } else {
        clean_fragment(strip_region_code(remainder))
    };

    RefinedAddress {
        street,
        house_number,
        neighborhood,
    }
}

/// True when a street field still carries comma-separated sub-fields.
pub fn needs_refinement(street: &str) -> bool {
    street.contains(',') && street.chars().any(|c| c.is_ascii_digit())
}

/// Applies [`refine`] only when [`needs_refinement`] fires.
pub fn refine_street_field(street: &str) -> Option<RefinedAddress> {
    needs_refinement(street).then(|| refine(street))
}

fn clean_fragment(fragment: &str) -> String {
    fragment
        .replace(|c: char| c == ',' || c == '-', "")
        .trim()
        .to_uppercase()
}

/// Drops a trailing state code unless it is all that is left of the fragment.
fn strip_region_code(remainder: &str) -> &str {
    if clean_fragment(remainder).chars().count() <= 3 {
        return remainder;
    }
    match REGION_SUFFIX_PATTERN.find(remainder) {
        Some(suffix) => &remainder[..suffix.start()],
        None => remainder,
    }
}
