//! Outbound side of the pipeline: channel broadcasts, alert matching, and
//! per-user notification dispatch.

pub mod alerts;
pub mod channel;
pub mod notify;
pub mod transport;

use crate::models::{cents_to_bgn, Listing};

/// Shared caption composer for channel posts and user notifications.
pub fn compose_caption(listing: &Listing, predicted_cents: Option<i64>, score: Option<f64>) -> String {
    let mut lines: Vec<String> = Vec::new();

    let title = listing
        .title
        .clone()
        .unwrap_or_else(|| "(без заглавие)".to_string());
    lines.push(format!("🚗 {title}"));

    if let Some(price) = listing.price_bgn_cents {
        let mut price_line = format!("💰 {:.0} лв.", cents_to_bgn(price));
        if let Some(predicted) = predicted_cents {
            if predicted > 0 {
                let discount = (cents_to_bgn(predicted) - cents_to_bgn(price))
                    / cents_to_bgn(predicted)
                    * 100.0;
                if discount >= 1.0 {
                    price_line.push_str(&format!(
                        " ({discount:.0}% под пазарната от {:.0} лв.)",
                        cents_to_bgn(predicted)
                    ));
                }
            }
        }
        lines.push(price_line);
    }

    let mut details: Vec<String> = Vec::new();
    if let Some(year) = listing.year {
        details.push(format!("{year} г."));
    }
    if let Some(km) = listing.mileage_km {
        details.push(format!("{km} км"));
    }
    if let Some(fuel) = listing.fuel {
        details.push(fuel.as_str().to_string());
    }
    if let Some(gearbox) = listing.gearbox {
        details.push(gearbox.as_str().to_string());
    }
    if let Some(region) = &listing.region {
        details.push(region.clone());
    }
    if !details.is_empty() {
        lines.push(format!("📋 {}", details.join(" · ")));
    }

    if let Some(score) = score {
        lines.push(format!("⭐ Оценка: {score:.1}/10"));
    }

    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Fuel, Gearbox};

    #[test]
    fn caption_mentions_price_and_discount() {
        let listing = Listing {
            id: "L".into(),
            raw_id: "R".into(),
            brand_id: Some("bmw".into()),
            model_id: Some("x5".into()),
            year: Some(2019),
            mileage_km: Some(45_000),
            power_hp: None,
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
        };
        let caption = compose_caption(&listing, Some(3_200_000), Some(8.2));
        assert!(caption.contains("BMW X5"));
        assert!(caption.contains("24000 лв."));
        assert!(caption.contains("25%"));
        assert!(caption.contains("8.2/10"));
    }
}
