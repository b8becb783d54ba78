//! Listing entities and the structured predicate used by search.

use serde::{Deserialize, Serialize};

use crate::error::{ListingError, ListingResult};

/// Structured fields pulled out of raw listing text. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractedFields {
    pub location: Option<String>,
    pub price_min: Option<f64>,
    pub price_max: Option<f64>,
    pub beds: Option<i64>,
    pub baths: Option<f64>,
}

/// Caller-supplied item for ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingInput {
    pub text: String,
    #[serde(default)]
    pub owner_id: String,
    #[serde(default)]
    pub owner_name: String,
}

impl ListingInput {
    pub fn new(
        text: impl Into<String>,
        owner_id: impl Into<String>,
        owner_name: impl Into<String>,
    ) -> Self {
        Self {
            text: text.into(),
            owner_id: owner_id.into(),
            owner_name: owner_name.into(),
        }
    }
}

/// A row ready for the metadata store; the id is assigned on insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewListing {
    pub raw_text: String,
    pub fields: ExtractedFields,
    pub owner_id: String,
    pub owner_name: String,
}

impl NewListing {
    pub fn from_input(input: &ListingInput, fields: ExtractedFields) -> Self {
        Self {
            raw_text: input.text.clone(),
            fields,
            owner_id: input.owner_id.clone(),
            owner_name: input.owner_name.clone(),
        }
    }

    pub fn validate(&self) -> ListingResult<()> {
        if self.raw_text.trim().is_empty() {
            return Err(ListingError::Validation("listing text is empty".into()));
        }
        let f = &self.fields;
        for (name, value) in [("price_min", f.price_min), ("price_max", f.price_max)] {
            if let Some(v) = value
                && (!v.is_finite() || v < 0.0)
            {
                return Err(ListingError::Validation(format!(
                    "{name} must be a non-negative finite number, got {v}"
                )));
            }
        }
        if let (Some(min), Some(max)) = (f.price_min, f.price_max)
            && min > max
        {
            return Err(ListingError::Validation(format!(
                "price_min {min} exceeds price_max {max}"
            )));
        }
        if let Some(beds) = f.beds
            && beds < 0
        {
            return Err(ListingError::Validation(format!("beds is negative: {beds}")));
        }
        if let Some(baths) = f.baths
            && (!baths.is_finite() || baths < 0.0)
        {
            return Err(ListingError::Validation(format!(
                "baths must be a non-negative finite number, got {baths}"
            )));
        }
        Ok(())
    }
}

/// A committed listing. Owned by the metadata store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingRecord {
    pub id: i64,
    pub raw_text: String,
    pub location: Option<String>,
    pub price_min: Option<f64>,
    pub price_max: Option<f64>,
    pub beds: Option<i64>,
    pub baths: Option<f64>,
    pub owner_id: String,
    pub owner_name: String,
    pub created_at: i64,
}

/// Conjunction of structured constraints. Unset fields do not constrain.
///
/// A constraint that is set never matches a record whose field is NULL.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListingPredicate {
    /// `price_min <= max_price`
    pub max_price: Option<f64>,
    /// `price_max >= min_price`
    pub min_price: Option<f64>,
    /// `beds >= min_beds`
    pub min_beds: Option<i64>,
    /// `baths >= min_baths`
    pub min_baths: Option<f64>,
    /// ASCII case-insensitive substring match on location.
    pub location: Option<String>,
}

impl ListingPredicate {
    pub fn with_max_price(mut self, price: f64) -> Self {
        self.max_price = Some(price);
        self
    }

    pub fn with_min_price(mut self, price: f64) -> Self {
        self.min_price = Some(price);
        self
    }

    pub fn with_min_beds(mut self, beds: i64) -> Self {
        self.min_beds = Some(beds);
        self
    }

    pub fn with_min_baths(mut self, baths: f64) -> Self {
        self.min_baths = Some(baths);
        self
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn is_unconstrained(&self) -> bool {
        self == &Self::default()
    }

    /// In-memory evaluation; must agree with the SQL form in the metadata store.
    pub fn matches(&self, record: &ListingRecord) -> bool {
        if let Some(max_price) = self.max_price
            && !record.price_min.is_some_and(|p| p <= max_price)
        {
            return false;
        }
        if let Some(min_price) = self.min_price
            && !record.price_max.is_some_and(|p| p >= min_price)
        {
            return false;
        }
        if let Some(min_beds) = self.min_beds
            && !record.beds.is_some_and(|b| b >= min_beds)
        {
            return false;
        }
        if let Some(min_baths) = self.min_baths
            && !record.baths.is_some_and(|b| b >= min_baths)
        {
            return false;
        }
        if let Some(needle) = &self.location {
            let needle = needle.to_ascii_lowercase();
            if !record
                .location
                .as_deref()
                .is_some_and(|loc| loc.to_ascii_lowercase().contains(&needle))
            {
                return false;
            }
        }
        true
    }
}

/// One ranked search result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    /// Squared L2 distance to the query embedding.
    pub distance: f32,
    pub record: ListingRecord,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> ListingRecord {
        ListingRecord {
            id: 1,
            raw_text: "2 bed 1 bath at The Standard, $800".into(),
            location: Some("The Standard".into()),
            price_min: Some(0.0),
            price_max: Some(800.0),
            beds: Some(2),
            baths: Some(1.0),
            owner_id: "u1".into(),
            owner_name: "Ana".into(),
            created_at: 0,
        }
    }

    #[test]
    fn empty_predicate_matches_everything() {
        assert!(ListingPredicate::default().matches(&record()));
        assert!(ListingPredicate::default().is_unconstrained());
    }

    #[test]
    fn predicate_is_a_conjunction() {
        let r = record();
        assert!(
            ListingPredicate::default()
                .with_max_price(900.0)
                .with_min_beds(2)
                .matches(&r)
        );
        assert!(
            !ListingPredicate::default()
                .with_max_price(900.0)
                .with_min_beds(3)
                .matches(&r)
        );
        assert!(
            ListingPredicate::default()
                .with_location("standard")
                .matches(&r)
        );
        assert!(!ListingPredicate::default().with_min_price(900.0).matches(&r));
    }

    #[test]
    fn null_fields_never_satisfy_a_set_constraint() {
        let mut r = record();
        r.beds = None;
        r.location = None;
        assert!(!ListingPredicate::default().with_min_beds(0).matches(&r));
        assert!(!ListingPredicate::default().with_location("a").matches(&r));
    }

    #[test]
    fn validation_rejects_malformed_rows() {
        let ok = NewListing {
            raw_text: "room".into(),
            fields: ExtractedFields::default(),
            owner_id: String::new(),
            owner_name: String::new(),
        };
        assert!(ok.validate().is_ok());

        let mut blank = ok.clone();
        blank.raw_text = "   ".into();
        assert!(matches!(blank.validate(), Err(ListingError::Validation(_))));

        let mut inverted = ok.clone();
        inverted.fields.price_min = Some(900.0);
        inverted.fields.price_max = Some(100.0);
        assert!(inverted.validate().is_err());

        let mut nan = ok;
        nan.fields.baths = Some(f64::NAN);
        assert!(nan.validate().is_err());
    }
}
