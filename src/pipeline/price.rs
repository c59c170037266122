//! Price stage: nonparametric estimate from comparables.
//!
//! The comparable set is selected by progressively relaxed filters and the
//! estimate is the empirical P50. Confidence folds in both sample size and
//! price dispersion, so a thin or noisy set cannot approve a listing
//! downstream.

use anyhow::Result;
use statrs::statistics::Statistics;
use tracing::debug;

use super::AppState;
use crate::models::{cents_to_bgn, now_ts, CompCache, Listing};
use crate::queue::StageOutcome;
use crate::store::pricing::CompFilter;

const MODEL_VERSION: &str = "comps-v1";
const TARGET_SAMPLE: usize = 30;
const MIN_SAMPLE: usize = 5;
const MAX_COMPARABLES: usize = 200;
const COMP_WINDOW_DAYS: i64 = 180;

/// Empirical percentile over a sorted sample.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((p / 100.0) * (sorted.len() - 1) as f64).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

/// The relaxation ladder of §comparable selection: each step loosens one
/// constraint; the first step reaching the target sample wins.
fn ladder(listing: &Listing) -> Vec<CompFilter> {
    let brand = listing.brand_id.clone().unwrap_or_default();
    let model = listing.model_id.clone().unwrap_or_default();
    let base = CompFilter {
        brand_id: brand,
        model_id: model,
        exclude_listing_id: listing.id.clone(),
        year: listing.year,
        year_tolerance: 2,
        mileage_km: listing.mileage_km,
        mileage_tolerance: Some(0.30),
        fuel: listing.fuel,
        gearbox: listing.gearbox,
        since_ts: now_ts() - COMP_WINDOW_DAYS * 86_400,
        limit: MAX_COMPARABLES,
    };
    vec![
        base.clone(),
        CompFilter {
            mileage_tolerance: Some(0.50),
            ..base.clone()
        },
        CompFilter {
            mileage_tolerance: Some(0.50),
            gearbox: None,
            ..base.clone()
        },
        CompFilter {
            mileage_tolerance: Some(0.50),
            gearbox: None,
            fuel: None,
            ..base.clone()
        },
        CompFilter {
            mileage_tolerance: Some(0.50),
            gearbox: None,
            fuel: None,
            year_tolerance: 4,
            ..base
        },
    ]
}

pub async fn run(state: &AppState, listing_id: &str) -> Result<StageOutcome> {
    let Some(listing) = state.store.get_listing(listing_id)? else {
        return Ok(StageOutcome::Skip(format!("unknown listing {listing_id}")));
    };
    if listing.is_duplicate {
        return Ok(StageOutcome::Skip("duplicates are not priced".into()));
    }
    if listing.brand_id.is_none() || listing.model_id.is_none() {
        return Ok(StageOutcome::Skip("unresolved brand/model".into()));
    }

    let mut prices_cents: Vec<i64> = Vec::new();
    for (step, filter) in ladder(&listing).into_iter().enumerate() {
        prices_cents = state.store.comparable_prices(&filter)?;
        if prices_cents.len() >= TARGET_SAMPLE {
            debug!(listing_id, step, sample = prices_cents.len(), "Comparable ladder settled");
            break;
        }
    }

    let sample = prices_cents.len();
    let computed_at = now_ts();

    let comp = if sample < MIN_SAMPLE {
        CompCache {
            listing_id: listing.id.clone(),
            p10_cents: None,
            p25_cents: None,
            p50_cents: None,
            p75_cents: None,
            p90_cents: None,
            predicted_cents: None,
            discount_pct: None,
            sample_size: sample as i64,
            confidence: 0.0,
            computed_at,
            model_version: MODEL_VERSION.to_string(),
        }
    } else {
        let mut bgn: Vec<f64> = prices_cents.iter().map(|&c| cents_to_bgn(c)).collect();
        bgn.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let mean = bgn.iter().mean();
        let sd = if bgn.len() > 1 { bgn.iter().std_dev() } else { 0.0 };
        let cv = if mean > 0.0 { sd / mean } else { 1.0 };

        let p50 = percentile(&bgn, 50.0);
        let predicted_cents = (p50 * 100.0).round() as i64;
        let discount_pct = listing.price_bgn_cents.map(|price| {
            let price = cents_to_bgn(price);
            if p50 > 0.0 {
                (p50 - price) / p50
            } else {
                0.0
            }
        });

        let confidence = ((sample as f64 / TARGET_SAMPLE as f64).min(1.0)
            * (1.0 - cv).clamp(0.0, 1.0))
        .clamp(0.0, 1.0);

        CompCache {
            listing_id: listing.id.clone(),
            p10_cents: Some((percentile(&bgn, 10.0) * 100.0).round() as i64),
            p25_cents: Some((percentile(&bgn, 25.0) * 100.0).round() as i64),
            p50_cents: Some(predicted_cents),
            p75_cents: Some((percentile(&bgn, 75.0) * 100.0).round() as i64),
            p90_cents: Some((percentile(&bgn, 90.0) * 100.0).round() as i64),
            predicted_cents: Some(predicted_cents),
            discount_pct,
            sample_size: sample as i64,
            confidence,
            computed_at,
            model_version: MODEL_VERSION.to_string(),
        }
    };

    state.store.finish_price(&comp, listing.price_bgn_cents)?;
    debug!(
        listing_id,
        sample,
        confidence = comp.confidence,
        predicted = ?comp.predicted_cents,
        "Price estimate persisted"
    );
    Ok(StageOutcome::Done)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentile_hits_the_median() {
        let v: Vec<f64> = (1..=100).map(|i| i as f64).collect();
        assert!((percentile(&v, 50.0) - 50.0).abs() <= 1.0);
        assert!((percentile(&v, 10.0) - 10.0).abs() <= 1.0);
        assert!((percentile(&v, 90.0) - 90.0).abs() <= 1.0);
    }

    #[test]
    fn ladder_relaxes_in_order() {
        let listing = Listing {
            id: "L".into(),
            raw_id: "R".into(),
            brand_id: Some("bmw".into()),
            model_id: Some("x5".into()),
            year: Some(2019),
            mileage_km: Some(45_000),
            power_hp: None,
            fuel: Some(crate::models::Fuel::Diesel),
            gearbox: Some(crate::models::Gearbox::Automatic),
            body: None,
            price_cents: None,
            currency: None,
            price_bgn_cents: Some(2_850_000),
            region: None,
            title: None,
            description: None,
            description_hash: None,
            features: vec![],
            first_image_hash: None,
            seller_id: None,
            version: 1,
            is_draft: false,
            is_duplicate: false,
            canonical_of: None,
            first_seen: 0,
        };
        let steps = ladder(&listing);
        assert_eq!(steps.len(), 5);
        assert_eq!(steps[0].mileage_tolerance, Some(0.30));
        assert_eq!(steps[1].mileage_tolerance, Some(0.50));
        assert!(steps[1].gearbox.is_some());
        assert!(steps[2].gearbox.is_none());
        assert!(steps[2].fuel.is_some());
        assert!(steps[3].fuel.is_none());
        assert_eq!(steps[3].year_tolerance, 2);
        assert_eq!(steps[4].year_tolerance, 4);
    }
}
