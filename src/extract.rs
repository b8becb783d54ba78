//! Best-effort structured-field extraction from raw listing text.
//!
//! Extraction is pure and never fails: anything that cannot be recognised is
//! simply left unset. The ingestion protocol treats the result as untrusted and
//! the metadata store validates it before the row is written.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::model::types::ExtractedFields;

/// Pure `text -> fields` collaborator used by the insertion coordinator.
pub trait FieldExtractor: Send + Sync {
    fn extract(&self, text: &str) -> ExtractedFields;
}

static BEDS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(\d+)\s*(?:BR|Bed|Beds|Bedroom|Bedrooms)").expect("beds regex")
});
static BATHS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(\d+(?:\.\d+)?)\s*(?:BA|Bath|Baths|Bathroom|Bathrooms)").expect("baths regex")
});
static PRICE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$([0-9]+(?:,[0-9]{3})*(?:\.\d{1,2})?)").expect("price regex")
});
static ADDRESS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\d{1,5}\s[\w\s]+,\s*\w+,\s*[A-Z]{2}\s*\d{5}").expect("address regex")
});
static COMPLEX_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:The\s)?[A-Z][A-Za-z0-9&\-']+(?:\s[A-Z][A-Za-z0-9&\-']+){0,4}")
        .expect("complex name regex")
});
static CITY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(Tallahassee|Athens|Tampa|College Town|FSU|UGA|USF)").expect("city regex")
});

/// Regex heuristics tuned for student-housing sublease posts.
#[derive(Debug, Clone, Copy, Default)]
pub struct RegexExtractor;

impl FieldExtractor for RegexExtractor {
    fn extract(&self, text: &str) -> ExtractedFields {
        let beds = BEDS_RE
            .captures(text)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<i64>().ok());
        let baths = BATHS_RE
            .captures(text)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<f64>().ok())
            .filter(|b| b.is_finite());
        let (price_min, price_max) = extract_price_range(text);

        ExtractedFields {
            location: extract_location(text),
            price_min,
            price_max,
            beds,
            baths,
        }
    }
}

/// A single price means "up to"; several prices give a range.
fn extract_price_range(text: &str) -> (Option<f64>, Option<f64>) {
    let prices: Vec<f64> = PRICE_RE
        .captures_iter(text)
        .filter_map(|c| c.get(1))
        .filter_map(|m| m.as_str().replace(',', "").parse::<f64>().ok())
        .filter(|p| p.is_finite())
        .collect();

    match prices.as_slice() {
        [] => (None, None),
        [only] => (Some(0.0), Some(*only)),
        many => {
            let min = many.iter().copied().fold(f64::INFINITY, f64::min);
            let max = many.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            (Some(min), Some(max))
        }
    }
}

/// Street address, then a capitalised complex name, then a known city.
fn extract_location(text: &str) -> Option<String> {
    ADDRESS_RE
        .find(text)
        .or_else(|| COMPLEX_RE.find(text))
        .or_else(|| CITY_RE.find(text))
        .map(|m| m.as_str().trim().to_string())
}
