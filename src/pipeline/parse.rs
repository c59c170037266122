//! Parse stage: raw blob -> draft listing fields.
//!
//! Field extractors are pluggable per source; the built-in one reads the
//! JSON records the scrape adapters emit. Site-specific HTML extraction
//! lives outside the core behind the same trait. Missing fields stay None —
//! nothing is ever guessed here.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, warn};

use super::AppState;
use crate::models::ListingDraft;
use crate::queue::StageOutcome;

/// Consecutive parse failures before a raw listing is deactivated.
const MAX_PARSE_ERRORS: i64 = 3;

pub trait FieldExtractor: Send + Sync {
    fn extract(&self, raw_blob: &[u8]) -> Result<ListingDraft>;
}

pub struct ExtractorRegistry {
    by_source: HashMap<String, Arc<dyn FieldExtractor>>,
    default: Arc<dyn FieldExtractor>,
}

impl Default for ExtractorRegistry {
    fn default() -> Self {
        Self {
            by_source: HashMap::new(),
            default: Arc::new(JsonExtractor),
        }
    }
}

impl ExtractorRegistry {
    pub fn register(&mut self, source_id: &str, extractor: Arc<dyn FieldExtractor>) {
        self.by_source.insert(source_id.to_string(), extractor);
    }

    pub fn for_source(&self, source_id: &str) -> Arc<dyn FieldExtractor> {
        self.by_source
            .get(source_id)
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }
}

/// The adapter-emitted JSON record. Every field optional; unknown fields are
/// ignored so adapters can evolve ahead of the core.
#[derive(Debug, Default, Deserialize)]
struct JsonRecord {
    title: Option<String>,
    brand: Option<String>,
    model: Option<String>,
    price: Option<f64>,
    currency: Option<String>,
    year: Option<i64>,
    mileage: Option<serde_json::Value>,
    power: Option<serde_json::Value>,
    fuel: Option<String>,
    gearbox: Option<String>,
    body: Option<String>,
    region: Option<String>,
    description: Option<String>,
    #[serde(default)]
    images: Vec<String>,
    first_image_hash: Option<u64>,
    phone: Option<String>,
    seller_url: Option<String>,
}

pub struct JsonExtractor;

impl FieldExtractor for JsonExtractor {
    fn extract(&self, raw_blob: &[u8]) -> Result<ListingDraft> {
        let record: JsonRecord =
            serde_json::from_slice(raw_blob).context("raw blob is not a JSON record")?;
        let to_raw_string = |v: Option<serde_json::Value>| -> Option<String> {
            v.map(|v| match v {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            })
        };
        Ok(ListingDraft {
            title: record.title,
            brand_raw: record.brand,
            model_raw: record.model,
            price: record.price.filter(|p| p.is_finite() && *p > 0.0),
            currency: record.currency,
            year: record.year,
            mileage_raw: to_raw_string(record.mileage),
            power_raw: to_raw_string(record.power),
            fuel_raw: record.fuel,
            gearbox_raw: record.gearbox,
            body_raw: record.body,
            region_raw: record.region,
            description: record.description,
            image_urls: record.images,
            first_image_hash: record.first_image_hash,
            seller_phone: record.phone,
            seller_profile_url: record.seller_url,
        })
    }
}

pub async fn run(state: &AppState, raw_id: &str) -> Result<StageOutcome> {
    let Some(raw) = state.store.get_raw_listing(raw_id)? else {
        return Ok(StageOutcome::Skip(format!("unknown raw listing {raw_id}")));
    };
    if !raw.is_active {
        return Ok(StageOutcome::Skip("raw listing inactive".into()));
    }

    // a scrape can persist the row before the blob lands; treat a missing
    // blob as terminal until a new observation replaces the key
    let blob = match state.blob.get(&raw.raw_blob_key) {
        Ok(blob) => blob,
        Err(e) => {
            warn!(raw_id, key = %raw.raw_blob_key, error = %e, "Raw blob missing");
            state.store.record_parse_error(raw_id, MAX_PARSE_ERRORS)?;
            return Ok(StageOutcome::Skip("raw blob unavailable".into()));
        }
    };

    let extractor = state.extractors.for_source(&raw.source_id);
    let draft = match extractor.extract(&blob) {
        Ok(draft) => draft,
        Err(e) => {
            let deactivated = state.store.record_parse_error(raw_id, MAX_PARSE_ERRORS)?;
            if deactivated {
                warn!(raw_id, error = %e, "Parse failed repeatedly, listing deactivated");
            }
            return Ok(StageOutcome::Skip(format!("parse error: {e:#}")));
        }
    };

    let listing_id = state.store.save_parsed_draft(&raw, &draft)?;
    debug!(raw_id, listing_id = %listing_id, "Parsed draft saved");
    Ok(StageOutcome::Done)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_extractor_takes_what_is_there() {
        let blob = serde_json::json!({
            "title": "BMW X5 3.0d",
            "price": 28500.0,
            "currency": "BGN",
            "year": 2019,
            "mileage": "45000 км",
            "fuel": "дизел",
            "gearbox": "автоматик",
            "region": "София",
            "images": ["https://img.example/1.jpg"],
            "phone": "+359 88 123 4567",
            "somebody_elses_field": true
        });
        let draft = JsonExtractor
            .extract(serde_json::to_vec(&blob).unwrap().as_slice())
            .unwrap();
        assert_eq!(draft.title.as_deref(), Some("BMW X5 3.0d"));
        assert_eq!(draft.price, Some(28500.0));
        assert_eq!(draft.mileage_raw.as_deref(), Some("45000 км"));
        assert!(draft.description.is_none());
        assert!(draft.brand_raw.is_none()); // absent, not guessed
    }

    #[test]
    fn garbage_blob_is_an_error() {
        assert!(JsonExtractor.extract(b"<html>not json</html>").is_err());
    }

    #[test]
    fn nonsense_price_is_dropped() {
        let blob = br#"{"title": "t", "price": -5.0}"#;
        let draft = JsonExtractor.extract(blob).unwrap();
        assert!(draft.price.is_none());
    }
}
