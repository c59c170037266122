//! Filter-against-listing matching.
//!
//! A listing matches when every populated filter field is satisfied. Fields
//! the listing does not carry (no power extracted, no region) fail the
//! corresponding filter: we never guess in the user's favor.

use crate::catalog::region_matches;
use crate::models::Listing;

use super::dsl::AlertFilters;

pub fn listing_matches(filters: &AlertFilters, listing: &Listing) -> bool {
    if let Some(brand) = &filters.brand_id {
        if listing.brand_id.as_deref() != Some(brand.as_str()) {
            return false;
        }
    }
    if let Some(model) = &filters.model_id {
        if listing.model_id.as_deref() != Some(model.as_str()) {
            return false;
        }
    }
    if let Some(fuel) = filters.fuel {
        if listing.fuel != Some(fuel) {
            return false;
        }
    }
    if let Some(gearbox) = filters.gearbox {
        if listing.gearbox != Some(gearbox) {
            return false;
        }
    }
    if let Some(body) = filters.body {
        if listing.body != Some(body) {
            return false;
        }
    }
    if let Some(region) = &filters.region {
        match &listing.region {
            Some(lr) if region_matches(lr, region) => {}
            _ => return false,
        }
    }

    if !range_ok(listing.year, filters.min_year, filters.max_year) {
        return false;
    }
    if !range_ok(
        listing.price_bgn_cents,
        filters.min_price_cents,
        filters.max_price_cents,
    ) {
        return false;
    }
    if !range_ok(
        listing.mileage_km,
        filters.min_mileage_km,
        filters.max_mileage_km,
    ) {
        return false;
    }
    if !range_ok(listing.power_hp, filters.min_power_hp, filters.max_power_hp) {
        return false;
    }
    true
}

fn range_ok(value: Option<i64>, min: Option<i64>, max: Option<i64>) -> bool {
    if min.is_none() && max.is_none() {
        return true;
    }
    let Some(v) = value else {
        return false;
    };
    if let Some(min) = min {
        if v < min {
            return false;
        }
    }
    if let Some(max) = max {
        if v > max {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Fuel, Gearbox};

    fn listing() -> Listing {
        Listing {
            id: "L1".into(),
            raw_id: "R1".into(),
            brand_id: Some("bmw".into()),
            model_id: Some("x5".into()),
            year: Some(2019),
            mileage_km: Some(45_000),
            power_hp: Some(265),
            fuel: Some(Fuel::Diesel),
            gearbox: Some(Gearbox::Automatic),
            body: None,
            price_cents: Some(2_400_000),
            currency: Some("BGN".into()),
            price_bgn_cents: Some(2_400_000),
            region: Some("sofia".into()),
            title: Some("BMW X5 3.0d".into()),
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
        }
    }

    fn filters() -> AlertFilters {
        AlertFilters {
            brand_id: Some("bmw".into()),
            model_id: Some("x5".into()),
            fuel: Some(Fuel::Diesel),
            gearbox: Some(Gearbox::Automatic),
            max_price_cents: Some(2_500_000),
            min_year: Some(2018),
            ..Default::default()
        }
    }

    #[test]
    fn reference_match_passes() {
        assert!(listing_matches(&filters(), &listing()));
    }

    #[test]
    fn bounds_are_inclusive() {
        let mut l = listing();
        l.price_bgn_cents = Some(2_500_000);
        l.year = Some(2018);
        assert!(listing_matches(&filters(), &l));
        l.price_bgn_cents = Some(2_500_001);
        assert!(!listing_matches(&filters(), &l));
    }

    #[test]
    fn missing_listing_field_fails_populated_filter() {
        let mut f = filters();
        f.min_power_hp = Some(200);
        let mut l = listing();
        l.power_hp = None;
        assert!(!listing_matches(&f, &l));
    }

    #[test]
    fn region_containment_tolerated() {
        let mut f = filters();
        f.region = Some("blagoevgrad".into());
        let mut l = listing();
        l.region = Some("bansko".into());
        assert!(listing_matches(&f, &l));
        l.region = Some("varna".into());
        assert!(!listing_matches(&f, &l));
    }

    #[test]
    fn empty_filters_match_everything() {
        assert!(listing_matches(&AlertFilters::default(), &listing()));
    }
}
