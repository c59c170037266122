//! Normalize stage: free-form draft fields -> canonical listing.
//!
//! Brand/model resolve against the alias table (exact, alias, fuzzy), enums
//! map through the Bulgarian/English word tables, numerics come out of free
//! text by regex with plausibility bounds, prices convert to BGN on the
//! day's FX. A listing whose brand/model cannot be resolved stays a draft
//! and is revisited when the alias table grows.

use anyhow::Result;
use chrono::{Datelike, Utc};
use hmac::{Hmac, Mac};
use lazy_static::lazy_static;
use regex::Regex;
use sha2::{Digest, Sha256};
use tracing::debug;

use super::AppState;
use crate::catalog::{
    body_from_word, fuel_from_word, gearbox_from_word, region_from_word, BrandCatalog,
};
use crate::models::now_ts;
use crate::queue::StageOutcome;
use crate::store::listings::NormalizedFields;

lazy_static! {
    static ref YEAR_RE: Regex = Regex::new(r"\b(19[89]\d|20\d{2})\s*(?:г\.?|год\.?)?").unwrap();
    static ref MILEAGE_RE: Regex =
        Regex::new(r"(?i)(\d[\d\s.,]*)\s*(хил\.?\s*)?(?:км|km|к\.м\.?)").unwrap();
    static ref POWER_RE: Regex =
        Regex::new(r"(?i)(\d{2,4})\s*(?:к\.?\s?с\.?|hp|коня)").unwrap();
}

const MAX_PLAUSIBLE_MILEAGE: i64 = 1_000_000;

fn plausible_year(year: i64) -> bool {
    (1980..=Utc::now().year() as i64 + 1).contains(&year)
}

fn digits_of(text: &str) -> String {
    text.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// Year from a raw value or free text, rejecting implausible values.
pub fn extract_year(explicit: Option<i64>, texts: &[Option<&str>]) -> Option<i64> {
    if let Some(y) = explicit {
        return plausible_year(y).then_some(y);
    }
    for text in texts.iter().flatten() {
        for cap in YEAR_RE.captures_iter(text) {
            if let Ok(y) = cap[1].parse::<i64>() {
                if plausible_year(y) {
                    return Some(y);
                }
            }
        }
    }
    None
}

/// Mileage in km from "45000", "45 000 км", "45.000km", "145 хил.км".
pub fn extract_mileage(texts: &[Option<&str>]) -> Option<i64> {
    for text in texts.iter().flatten() {
        if let Some(cap) = MILEAGE_RE.captures(text) {
            let digits = digits_of(&cap[1]);
            if let Ok(mut km) = digits.parse::<i64>() {
                if cap.get(2).is_some() {
                    km *= 1000;
                }
                if (0..=MAX_PLAUSIBLE_MILEAGE).contains(&km) {
                    return Some(km);
                }
            }
        }
        // a bare number is accepted from the dedicated mileage field
        let digits = digits_of(text);
        if digits == text.trim() && !digits.is_empty() {
            if let Ok(km) = digits.parse::<i64>() {
                if (0..=MAX_PLAUSIBLE_MILEAGE).contains(&km) {
                    return Some(km);
                }
            }
        }
    }
    None
}

pub fn extract_power(texts: &[Option<&str>]) -> Option<i64> {
    for text in texts.iter().flatten() {
        if let Some(cap) = POWER_RE.captures(text) {
            if let Ok(hp) = cap[1].parse::<i64>() {
                if (20..=2000).contains(&hp) {
                    return Some(hp);
                }
            }
        }
        let digits = digits_of(text);
        if digits == text.trim() && !digits.is_empty() {
            if let Ok(hp) = digits.parse::<i64>() {
                if (20..=2000).contains(&hp) {
                    return Some(hp);
                }
            }
        }
    }
    None
}

/// SHA-256 over whitespace-normalized text, hex encoded.
pub fn description_hash(description: &str) -> String {
    let collapsed = description.split_whitespace().collect::<Vec<_>>().join(" ");
    hex::encode(Sha256::digest(collapsed.as_bytes()))
}

/// HMAC-SHA256 of the phone digits with the process salt. The raw number is
/// never persisted. Fewer than 6 digits is not a phone.
pub fn phone_hash(salt: &str, phone: &str) -> Option<String> {
    let digits = digits_of(phone);
    if digits.len() < 6 {
        return None;
    }
    let mut mac = Hmac::<Sha256>::new_from_slice(salt.as_bytes()).ok()?;
    mac.update(digits.as_bytes());
    Some(hex::encode(mac.finalize().into_bytes()))
}

pub async fn run(state: &AppState, listing_id: &str) -> Result<StageOutcome> {
    let Some(listing) = state.store.get_listing(listing_id)? else {
        return Ok(StageOutcome::Skip(format!("unknown listing {listing_id}")));
    };
    let Some(draft) = state.store.get_listing_draft(listing_id)? else {
        return Ok(StageOutcome::Skip("listing has no draft payload".into()));
    };

    let catalog = BrandCatalog::load(&state.store)?;
    let resolution = catalog.resolve(
        draft.brand_raw.as_deref(),
        draft.model_raw.as_deref(),
        draft.title.as_deref(),
    );

    let title = draft.title.as_deref();
    let description = draft.description.as_deref();
    let year = extract_year(draft.year, &[title, description]);
    let mileage_km = extract_mileage(&[draft.mileage_raw.as_deref(), description]);
    let power_hp = extract_power(&[draft.power_raw.as_deref(), title, description]);

    let currency = draft
        .currency
        .clone()
        .unwrap_or_else(|| "BGN".to_string())
        .to_uppercase();
    let (price_cents, price_bgn_cents) = match draft.price {
        Some(price) => {
            let bgn = state
                .store
                .convert_to_bgn_cents(price, &currency, now_ts())?;
            (Some((price * 100.0).round() as i64), Some(bgn))
        }
        None => (None, None),
    };

    let is_draft = resolution.is_none();
    let (brand_id, model_id) = match &resolution {
        Some((brand, model, quality)) => {
            debug!(listing_id, brand = %brand, model = %model, ?quality, "Brand/model resolved");
            (Some(brand.clone()), Some(model.clone()))
        }
        None => (None, None),
    };

    let fields = NormalizedFields {
        brand_id,
        model_id,
        year,
        mileage_km,
        power_hp,
        fuel: draft.fuel_raw.as_deref().and_then(fuel_from_word),
        gearbox: draft.gearbox_raw.as_deref().and_then(gearbox_from_word),
        body: draft.body_raw.as_deref().and_then(body_from_word),
        price_cents,
        currency: draft.price.map(|_| currency),
        price_bgn_cents,
        region: draft
            .region_raw
            .as_deref()
            .and_then(region_from_word)
            .map(|r| r.to_string()),
        description_hash: draft.description.as_deref().map(description_hash),
        features: Vec::new(),
        is_draft,
        seller_phone_hash: draft
            .seller_phone
            .as_deref()
            .and_then(|p| phone_hash(&state.config.phone_salt, p)),
        seller_profile_url: draft.seller_profile_url.clone(),
        image_urls: draft.image_urls.clone(),
    };

    state.store.finish_normalize(&listing.id, &fields)?;

    if is_draft {
        Ok(StageOutcome::Skip("brand/model unresolved, kept as draft".into()))
    } else {
        Ok(StageOutcome::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn year_extraction_respects_plausibility() {
        assert_eq!(extract_year(Some(2019), &[]), Some(2019));
        assert_eq!(extract_year(Some(1801), &[]), None);
        assert_eq!(
            extract_year(None, &[Some("BMW X5 2019 г. facelift")]),
            Some(2019)
        );
        assert_eq!(extract_year(None, &[Some("виж обявата")]), None);
    }

    #[test]
    fn mileage_parses_bulgarian_forms() {
        assert_eq!(extract_mileage(&[Some("45000 км")]), Some(45_000));
        assert_eq!(extract_mileage(&[Some("45 000 км")]), Some(45_000));
        assert_eq!(extract_mileage(&[Some("145 хил.км")]), Some(145_000));
        assert_eq!(extract_mileage(&[Some("45000")]), Some(45_000));
        assert_eq!(extract_mileage(&[Some("9999999 км")]), None); // over bound
    }

    #[test]
    fn power_parses_with_units() {
        assert_eq!(extract_power(&[Some("245 к.с.")]), Some(245));
        assert_eq!(extract_power(&[Some("184hp")]), Some(184));
        assert_eq!(extract_power(&[None, Some("3.0d 265 коня")]), Some(265));
    }

    #[test]
    fn description_hash_is_whitespace_insensitive() {
        assert_eq!(
            description_hash("Продавам   BMW\n X5"),
            description_hash("Продавам BMW X5")
        );
        assert_ne!(description_hash("a"), description_hash("b"));
    }

    #[test]
    fn phone_hash_hides_the_number() {
        let h = phone_hash("salt", "+359 88 123 4567").unwrap();
        assert!(!h.contains("359"));
        assert_eq!(h.len(), 64);
        // formatting does not change the hash
        assert_eq!(h, phone_hash("salt", "359-88-123-4567").unwrap());
        // different salts give different hashes
        assert_ne!(h, phone_hash("other", "+359 88 123 4567").unwrap());
        assert!(phone_hash("salt", "12").is_none());
    }
}
