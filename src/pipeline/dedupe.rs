//! Dedupe stage: multi-signal cascade with a single canonical survivor.
//!
//! Methods run in fixed order — phone, image, text, embedding — and the
//! first confident hit wins. The canonical of a group is the listing with
//! the earliest `first_seen`, independent of arrival order; when a late
//! arrival turns out to be older, the old canonical is re-pointed at it.

use anyhow::Result;
use tracing::{debug, info};

use super::AppState;
use crate::models::{DedupeMethod, Listing};
use crate::queue::StageOutcome;
use crate::similarity::{
    bytes_to_embedding, cosine, hamming64, jaccard, minhash, trigram_set_from_string,
    trigram_string, trigrams,
};
use crate::store::dedupe::Signature;

const PHONE_CONFIDENCE: f64 = 0.95;
const IMAGE_CONFIDENCE: f64 = 0.90;
const TEXT_CONFIDENCE: f64 = 0.75;
const EMBEDDING_CONFIDENCE: f64 = 0.80;

const IMAGE_HAMMING_MAX: u32 = 6;
const TEXT_SIMILARITY_MIN: f64 = 0.80;
const EMBEDDING_SIMILARITY_MIN: f64 = 0.85;
const PRICE_TOLERANCE: f64 = 0.10;
const TIEBREAK_MILEAGE_TOLERANCE: f64 = 0.30;

fn within_pct(a: i64, b: i64, tolerance: f64) -> bool {
    if b == 0 {
        return a == 0;
    }
    ((a - b).abs() as f64) / (b as f64) <= tolerance
}

fn build_signature(listing: &Listing) -> Signature {
    let title_trgm = listing
        .title
        .as_deref()
        .map(|t| trigram_string(&trigrams(t)))
        .unwrap_or_default();
    Signature {
        title_trgm,
        desc_minhash: listing.description.as_deref().and_then(minhash),
        image_hash: listing.first_image_hash,
        embedding: None,
    }
}

/// A confirmed duplicate hit against an existing listing.
struct Hit {
    other_id: String,
    method: DedupeMethod,
    confidence: f64,
}

fn find_phone_hit(state: &AppState, listing: &Listing) -> Result<Option<Hit>> {
    let Some(price) = listing.price_bgn_cents else {
        return Ok(None);
    };
    for candidate in state.store.phone_candidates(listing)? {
        let Some(other_price) = candidate.price_bgn_cents else {
            continue;
        };
        if within_pct(price, other_price, PRICE_TOLERANCE) {
            return Ok(Some(Hit {
                other_id: candidate.id,
                method: DedupeMethod::Phone,
                confidence: PHONE_CONFIDENCE,
            }));
        }
    }
    Ok(None)
}

fn find_image_hit(state: &AppState, listing: &Listing) -> Result<Option<Hit>> {
    let Some(hash) = listing.first_image_hash else {
        return Ok(None);
    };
    for (other_id, other_hash) in state.store.image_candidates(&listing.id)? {
        if hamming64(hash, other_hash) <= IMAGE_HAMMING_MAX {
            return Ok(Some(Hit {
                other_id,
                method: DedupeMethod::Image,
                confidence: IMAGE_CONFIDENCE,
            }));
        }
    }
    Ok(None)
}

/// Trigram similarity over titles, tie-broken on the listing attributes so a
/// generic title alone cannot merge two different cars.
fn find_text_hit(state: &AppState, listing: &Listing, sig: &Signature) -> Result<Option<Hit>> {
    if sig.title_trgm.is_empty() {
        return Ok(None);
    }
    let own = trigram_set_from_string(&sig.title_trgm);
    let own_vec: Vec<String> = own.iter().cloned().collect();
    let min_shared = (own.len() / 2).max(3);
    let candidates = state
        .store
        .trigram_candidates(&own_vec, &listing.id, min_shared, 50)?;

    for (other_id, other_trgm) in candidates {
        let similarity = jaccard(&own, &trigram_set_from_string(&other_trgm));
        if similarity < TEXT_SIMILARITY_MIN {
            continue;
        }
        let Some(other) = state.store.get_listing(&other_id)? else {
            continue;
        };
        if other.brand_id != listing.brand_id || other.model_id != listing.model_id {
            continue;
        }
        if other.year != listing.year {
            continue;
        }
        let mileage_ok = match (listing.mileage_km, other.mileage_km) {
            (Some(a), Some(b)) => within_pct(a, b, TIEBREAK_MILEAGE_TOLERANCE),
            _ => true,
        };
        let price_ok = match (listing.price_bgn_cents, other.price_bgn_cents) {
            (Some(a), Some(b)) => within_pct(a, b, PRICE_TOLERANCE),
            _ => false,
        };
        if mileage_ok && price_ok {
            return Ok(Some(Hit {
                other_id,
                method: DedupeMethod::Text,
                confidence: TEXT_CONFIDENCE,
            }));
        }
    }
    Ok(None)
}

/// Optional method: only fires when embeddings are populated for both sides.
fn find_embedding_hit(state: &AppState, listing: &Listing, sig: &Signature) -> Result<Option<Hit>> {
    let Some(own_bytes) = &sig.embedding else {
        return Ok(None);
    };
    let (Some(brand), Some(model)) = (&listing.brand_id, &listing.model_id) else {
        return Ok(None);
    };
    let own = bytes_to_embedding(own_bytes);
    for (other_id, other_bytes) in state
        .store
        .embedding_candidates(brand, model, &listing.id)?
    {
        let other = bytes_to_embedding(&other_bytes);
        if cosine(&own, &other) >= EMBEDDING_SIMILARITY_MIN {
            return Ok(Some(Hit {
                other_id,
                method: DedupeMethod::Embedding,
                confidence: EMBEDDING_CONFIDENCE,
            }));
        }
    }
    Ok(None)
}

pub async fn run(state: &AppState, listing_id: &str) -> Result<StageOutcome> {
    let Some(listing) = state.store.get_listing(listing_id)? else {
        return Ok(StageOutcome::Skip(format!("unknown listing {listing_id}")));
    };
    if listing.is_draft {
        return Ok(StageOutcome::Skip("draft listing does not dedupe".into()));
    }

    let sig = build_signature(&listing);

    let hit = match find_phone_hit(state, &listing)? {
        Some(hit) => Some(hit),
        None => match find_image_hit(state, &listing)? {
            Some(hit) => Some(hit),
            None => match find_text_hit(state, &listing, &sig)? {
                Some(hit) => Some(hit),
                None => find_embedding_hit(state, &listing, &sig)?,
            },
        },
    };

    let Some(hit) = hit else {
        state.store.finish_dedupe_unique(&listing.id, &sig)?;
        debug!(listing_id, "No duplicate found, proceeding to price");
        return Ok(StageOutcome::Done);
    };

    // canonical = earliest first_seen of the whole match group
    let root_id = state.store.canonical_root(&hit.other_id)?;
    let Some(root) = state.store.get_listing(&root_id)? else {
        state.store.finish_dedupe_unique(&listing.id, &sig)?;
        return Ok(StageOutcome::Done);
    };

    if listing.first_seen < root.first_seen {
        // this listing is the older observation: it becomes the canonical
        state.store.finish_dedupe_unique(&listing.id, &sig)?;
        state
            .store
            .repoint_canonical(&root.id, &listing.id, hit.method, hit.confidence)?;
        info!(
            listing_id,
            demoted = %root.id,
            method = hit.method.as_str(),
            "Listing supersedes previous canonical"
        );
        return Ok(StageOutcome::Done);
    }

    state
        .store
        .finish_dedupe_duplicate(&listing.id, &root.id, hit.method, hit.confidence, &sig)?;
    info!(
        listing_id,
        canonical = %root.id,
        method = hit.method.as_str(),
        confidence = hit.confidence,
        "Duplicate detected"
    );
    Ok(StageOutcome::Done)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn price_tolerance_is_relative() {
        assert!(within_pct(2_850_000, 2_830_000, 0.10));
        assert!(within_pct(2_850_000, 2_600_000, 0.10));
        assert!(!within_pct(2_850_000, 2_500_000, 0.10));
    }

    #[test]
    fn signature_includes_title_and_description() {
        let listing = Listing {
            id: "L".into(),
            raw_id: "R".into(),
            brand_id: Some("bmw".into()),
            model_id: Some("x5".into()),
            year: Some(2019),
            mileage_km: Some(45_000),
            power_hp: None,
            fuel: None,
            gearbox: None,
            body: None,
            price_cents: None,
            currency: None,
            price_bgn_cents: Some(2_850_000),
            region: None,
            title: Some("BMW X5 3.0d".into()),
            description: Some(
                "Продавам чисто нов внос от Германия, обслужен, без забележки".into(),
            ),
            description_hash: None,
            features: vec![],
            first_image_hash: Some(0xDEAD_BEEF),
            seller_id: None,
            version: 1,
            is_draft: false,
            is_duplicate: false,
            canonical_of: None,
            first_seen: 0,
        };
        let sig = build_signature(&listing);
        assert!(!sig.title_trgm.is_empty());
        assert!(sig.desc_minhash.is_some());
        assert_eq!(sig.image_hash, Some(0xDEAD_BEEF));
        assert!(sig.embedding.is_none());
    }
}
