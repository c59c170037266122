//! Alert query DSL.
//!
//! Whitespace-separated tokens in any order, case-insensitive:
//!
//! ```text
//! BMW X5 diesel <25000 2018+ automatic <150000km софия
//! ```
//!
//! Unknown tokens are warnings, never errors, so old queries keep parsing as
//! the vocabulary grows. Filters are a fixed record of optionals; rendering
//! a parsed query and re-parsing it reproduces the same filters.

use serde::{Deserialize, Serialize};

use crate::catalog::{
    body_from_word, fuel_from_word, gearbox_from_word, region_from_word, BrandCatalog,
};
use crate::models::{Body, Fuel, Gearbox};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlertFilters {
    pub brand_id: Option<String>,
    pub model_id: Option<String>,
    pub fuel: Option<Fuel>,
    pub gearbox: Option<Gearbox>,
    pub body: Option<Body>,
    pub region: Option<String>,
    pub min_year: Option<i64>,
    pub max_year: Option<i64>,
    pub min_price_cents: Option<i64>,
    pub max_price_cents: Option<i64>,
    pub min_mileage_km: Option<i64>,
    pub max_mileage_km: Option<i64>,
    pub min_power_hp: Option<i64>,
    pub max_power_hp: Option<i64>,
}

impl AlertFilters {
    pub fn is_empty(&self) -> bool {
        *self == AlertFilters::default()
    }
}

#[derive(Debug, Clone)]
pub struct ParsedQuery {
    pub filters: AlertFilters,
    pub warnings: Vec<String>,
}

const KM_SUFFIXES: &[&str] = &["к.м.", "к.м", "км", "km"];
const HP_SUFFIXES: &[&str] = &["к.с.", "к.с", "кс", "hp"];

/// Split an `<op><int><suffix?>` token. Returns (is_upper_bound, value, suffix).
fn parse_range_token(token: &str) -> Option<(bool, i64, String)> {
    let (upper, rest) = if let Some(r) = token.strip_prefix("<=") {
        (true, r)
    } else if let Some(r) = token.strip_prefix(">=") {
        (false, r)
    } else if let Some(r) = token.strip_prefix('<') {
        (true, r)
    } else if let Some(r) = token.strip_prefix('>') {
        (false, r)
    } else {
        return None;
    };

    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    let suffix = rest[digits.len()..].to_lowercase();
    let value: i64 = digits.parse().ok()?;
    Some((upper, value, suffix))
}

fn year_token(token: &str) -> Option<(i64, Option<i64>)> {
    if let Some(y) = token.strip_suffix('+') {
        let year: i64 = y.parse().ok()?;
        if (1950..=2100).contains(&year) {
            return Some((year, None));
        }
        return None;
    }
    let (lo, hi) = token.split_once('-')?;
    let lo: i64 = lo.parse().ok()?;
    let hi: i64 = hi.parse().ok()?;
    if (1950..=2100).contains(&lo) && (1950..=2100).contains(&hi) && lo <= hi {
        return Some((lo, Some(hi)));
    }
    None
}

pub fn parse_query(query: &str, catalog: &BrandCatalog) -> ParsedQuery {
    let tokens: Vec<String> = query.split_whitespace().map(|t| t.to_string()).collect();
    let n = tokens.len();
    let mut consumed = vec![false; n];
    let mut filters = AlertFilters::default();
    let mut warnings = Vec::new();

    // brand first, longest phrase wins, so the model pass can anchor on it
    'brand: for i in 0..n {
        for k in (1..=3.min(n - i)).rev() {
            let phrase = tokens[i..i + k].join(" ");
            if let Some(brand) = catalog.brand_from_word(&phrase) {
                filters.brand_id = Some(brand);
                for c in consumed.iter_mut().skip(i).take(k) {
                    *c = true;
                }
                break 'brand;
            }
        }
    }

    let mut i = 0;
    while i < n {
        if consumed[i] {
            i += 1;
            continue;
        }
        let token = &tokens[i];
        let lower = token.to_lowercase();

        if let Some((upper, value, suffix)) = parse_range_token(&lower) {
            if suffix.is_empty() {
                if upper {
                    filters.max_price_cents = Some(value * 100);
                } else {
                    filters.min_price_cents = Some(value * 100);
                }
            } else if KM_SUFFIXES.contains(&suffix.as_str()) {
                if upper {
                    filters.max_mileage_km = Some(value);
                } else {
                    filters.min_mileage_km = Some(value);
                }
            } else if HP_SUFFIXES.contains(&suffix.as_str()) {
                if upper {
                    filters.max_power_hp = Some(value);
                } else {
                    filters.min_power_hp = Some(value);
                }
            } else {
                warnings.push(format!("unknown unit in '{token}'"));
            }
            i += 1;
            continue;
        }

        if let Some((lo, hi)) = year_token(&lower) {
            filters.min_year = Some(lo);
            if hi.is_some() {
                filters.max_year = hi;
            }
            i += 1;
            continue;
        }

        if let Some(fuel) = fuel_from_word(&lower) {
            filters.fuel = Some(fuel);
            i += 1;
            continue;
        }
        if let Some(gearbox) = gearbox_from_word(&lower) {
            filters.gearbox = Some(gearbox);
            i += 1;
            continue;
        }
        if let Some(body) = body_from_word(&lower) {
            filters.body = Some(body);
            i += 1;
            continue;
        }
        if let Some(region) = region_from_word(&lower) {
            filters.region = Some(region.to_string());
            i += 1;
            continue;
        }

        // model phrases, longest first, anchored on the brand
        if let (Some(brand), None) = (&filters.brand_id, &filters.model_id) {
            let mut matched = 0;
            for k in (1..=3.min(n - i)).rev() {
                if tokens[i..i + k].iter().enumerate().any(|(j, _)| consumed[i + j]) {
                    continue;
                }
                let phrase = tokens[i..i + k].join(" ");
                if let Some((model, _)) = catalog.model_within_brand(brand, &phrase) {
                    filters.model_id = Some(model);
                    matched = k;
                    break;
                }
            }
            if matched > 0 {
                i += matched;
                continue;
            }
        }

        warnings.push(format!("unrecognized token '{token}'"));
        i += 1;
    }

    ParsedQuery { filters, warnings }
}

/// Canonical DSL string for a filter record. `parse_query(render_filters(f))`
/// returns `f` for any parse-produced record.
pub fn render_filters(f: &AlertFilters) -> String {
    let mut parts: Vec<String> = Vec::new();
    if let Some(brand) = &f.brand_id {
        parts.push(brand.clone());
    }
    if let Some(model) = &f.model_id {
        parts.push(model.clone());
    }
    if let Some(fuel) = f.fuel {
        if fuel != Fuel::Other {
            parts.push(fuel.as_str().to_string());
        }
    }
    if let Some(gearbox) = f.gearbox {
        if gearbox != Gearbox::Other {
            parts.push(gearbox.as_str().to_string());
        }
    }
    if let Some(body) = f.body {
        if body != Body::Other {
            parts.push(body.as_str().to_string());
        }
    }
    if let Some(region) = &f.region {
        parts.push(region.clone());
    }
    match (f.min_year, f.max_year) {
        (Some(lo), Some(hi)) => parts.push(format!("{lo}-{hi}")),
        (Some(lo), None) => parts.push(format!("{lo}+")),
        (None, Some(hi)) => parts.push(format!("1950-{hi}")),
        (None, None) => {}
    }
    if let Some(min) = f.min_price_cents {
        parts.push(format!(">{}", min / 100));
    }
    if let Some(max) = f.max_price_cents {
        parts.push(format!("<{}", max / 100));
    }
    if let Some(min) = f.min_mileage_km {
        parts.push(format!(">{min}km"));
    }
    if let Some(max) = f.max_mileage_km {
        parts.push(format!("<{max}km"));
    }
    if let Some(min) = f.min_power_hp {
        parts.push(format!(">{min}hp"));
    }
    if let Some(max) = f.max_power_hp {
        parts.push(format!("<{max}hp"));
    }
    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    fn catalog() -> BrandCatalog {
        BrandCatalog::load(&Store::open_in_memory().unwrap()).unwrap()
    }

    #[test]
    fn parses_the_reference_query() {
        let parsed = parse_query("BMW X5 diesel <25000 2018+ automatic", &catalog());
        let f = &parsed.filters;
        assert_eq!(f.brand_id.as_deref(), Some("bmw"));
        assert_eq!(f.model_id.as_deref(), Some("x5"));
        assert_eq!(f.fuel, Some(Fuel::Diesel));
        assert_eq!(f.gearbox, Some(Gearbox::Automatic));
        assert_eq!(f.max_price_cents, Some(2_500_000));
        assert_eq!(f.min_year, Some(2018));
        assert!(parsed.warnings.is_empty());
    }

    #[test]
    fn token_order_does_not_matter() {
        let a = parse_query("diesel <25000 bmw x5 2018+", &catalog()).filters;
        let b = parse_query("bmw x5 2018+ diesel <25000", &catalog()).filters;
        assert_eq!(a, b);
    }

    #[test]
    fn bulgarian_tokens_and_units() {
        let parsed = parse_query("бмв х5 дизел софия <150000км >150кс", &catalog());
        let f = &parsed.filters;
        assert_eq!(f.brand_id.as_deref(), Some("bmw"));
        assert_eq!(f.model_id.as_deref(), Some("x5"));
        assert_eq!(f.fuel, Some(Fuel::Diesel));
        assert_eq!(f.region.as_deref(), Some("sofia"));
        assert_eq!(f.max_mileage_km, Some(150_000));
        assert_eq!(f.min_power_hp, Some(150));
        assert!(parsed.warnings.is_empty());
    }

    #[test]
    fn year_range_and_price_bounds() {
        let f = parse_query("vw golf 2005-2010 >3000 <=9000", &catalog()).filters;
        assert_eq!(f.min_year, Some(2005));
        assert_eq!(f.max_year, Some(2010));
        assert_eq!(f.min_price_cents, Some(300_000));
        assert_eq!(f.max_price_cents, Some(900_000));
    }

    #[test]
    fn unknown_tokens_warn_but_do_not_fail() {
        let parsed = parse_query("bmw x5 sparkly <25000", &catalog());
        assert_eq!(parsed.filters.brand_id.as_deref(), Some("bmw"));
        assert_eq!(parsed.warnings.len(), 1);
        assert!(parsed.warnings[0].contains("sparkly"));
    }

    #[test]
    fn render_then_reparse_is_fixed_point() {
        let cat = catalog();
        for q in [
            "BMW X5 diesel <25000 2018+ automatic",
            "opel astra 2005-2012 <8000 >100000km",
            "мерцедес e-class автоматик седан пловдив >200hp",
        ] {
            let first = parse_query(q, &cat).filters;
            let rendered = render_filters(&first);
            let second = parse_query(&rendered, &cat).filters;
            assert_eq!(first, second, "query: {q} rendered: {rendered}");
        }
    }
}
