//! Comparable selection and price-estimate caching.

use anyhow::Result;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, OptionalExtension};

use super::Store;
use crate::models::{now_ts, CompCache, Fuel, Gearbox};
use crate::queue::{self, Stage};

/// One step of the relaxation ladder. `None` filters are skipped entirely.
#[derive(Debug, Clone)]
pub struct CompFilter {
    pub brand_id: String,
    pub model_id: String,
    pub exclude_listing_id: String,
    pub year: Option<i64>,
    pub year_tolerance: i64,
    pub mileage_km: Option<i64>,
    /// e.g. 0.30 for ±30%. None drops the mileage constraint.
    pub mileage_tolerance: Option<f64>,
    pub fuel: Option<Fuel>,
    pub gearbox: Option<Gearbox>,
    /// Only comparables first seen after this.
    pub since_ts: i64,
    pub limit: usize,
}

impl Store {
    /// BGN prices (cents) of comparables matching the filter, most recent
    /// first. Drafts, duplicates, inactive raws, and unpriced listings are
    /// never comparables.
    pub fn comparable_prices(&self, f: &CompFilter) -> Result<Vec<i64>> {
        let mut sql = String::from(
            "SELECT l.price_bgn_cents FROM listings l
             JOIN raw_listings r ON r.id = l.raw_id
             WHERE l.brand_id = ? AND l.model_id = ? AND l.id != ?
               AND l.is_draft = 0 AND l.is_duplicate = 0 AND r.is_active = 1
               AND l.price_bgn_cents IS NOT NULL
               AND l.first_seen >= ?",
        );
        let mut args: Vec<Value> = vec![
            Value::Text(f.brand_id.clone()),
            Value::Text(f.model_id.clone()),
            Value::Text(f.exclude_listing_id.clone()),
            Value::Integer(f.since_ts),
        ];

        if let Some(year) = f.year {
            sql.push_str(" AND l.year BETWEEN ? AND ?");
            args.push(Value::Integer(year - f.year_tolerance));
            args.push(Value::Integer(year + f.year_tolerance));
        }
        if let (Some(km), Some(tol)) = (f.mileage_km, f.mileage_tolerance) {
            let lo = ((km as f64) * (1.0 - tol)).max(0.0) as i64;
            let hi = ((km as f64) * (1.0 + tol)) as i64;
            sql.push_str(" AND l.mileage_km BETWEEN ? AND ?");
            args.push(Value::Integer(lo));
            args.push(Value::Integer(hi));
        }
        if let Some(fuel) = f.fuel {
            sql.push_str(" AND l.fuel = ?");
            args.push(Value::Text(fuel.as_str().to_string()));
        }
        if let Some(gearbox) = f.gearbox {
            sql.push_str(" AND l.gearbox = ?");
            args.push(Value::Text(gearbox.as_str().to_string()));
        }
        sql.push_str(" ORDER BY l.first_seen DESC LIMIT ?");
        args.push(Value::Integer(f.limit as i64));

        self.with_conn(|c| {
            let mut stmt = c.prepare(&sql)?;
            let prices = stmt
                .query_map(params_from_iter(args.iter()), |r| r.get::<_, i64>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(prices)
        })
    }

    /// Persist the estimate, append price history on change, and enqueue the
    /// risk stage, atomically.
    pub fn finish_price(&self, comp: &CompCache, price_bgn_cents: Option<i64>) -> Result<()> {
        self.with_tx(|tx| {
            tx.execute(
                "INSERT INTO comp_cache
                 (listing_id, p10_cents, p25_cents, p50_cents, p75_cents, p90_cents,
                  predicted_cents, discount_pct, sample_size, confidence, computed_at, model_version)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                 ON CONFLICT(listing_id) DO UPDATE SET
                     p10_cents = excluded.p10_cents,
                     p25_cents = excluded.p25_cents,
                     p50_cents = excluded.p50_cents,
                     p75_cents = excluded.p75_cents,
                     p90_cents = excluded.p90_cents,
                     predicted_cents = excluded.predicted_cents,
                     discount_pct = excluded.discount_pct,
                     sample_size = excluded.sample_size,
                     confidence = excluded.confidence,
                     computed_at = excluded.computed_at,
                     model_version = excluded.model_version",
                rusqlite::params![
                    comp.listing_id,
                    comp.p10_cents,
                    comp.p25_cents,
                    comp.p50_cents,
                    comp.p75_cents,
                    comp.p90_cents,
                    comp.predicted_cents,
                    comp.discount_pct,
                    comp.sample_size,
                    comp.confidence,
                    comp.computed_at,
                    comp.model_version
                ],
            )?;
            if let Some(cents) = price_bgn_cents {
                Store::append_price_if_changed_tx(tx, &comp.listing_id, cents, comp.computed_at)?;
            }
            queue::enqueue(tx, Stage::Risk, &comp.listing_id, now_ts())?;
            Ok(())
        })
    }

    pub fn get_comp_cache(&self, listing_id: &str) -> Result<Option<CompCache>> {
        self.with_conn(|c| {
            Ok(c.query_row(
                "SELECT listing_id, p10_cents, p25_cents, p50_cents, p75_cents, p90_cents,
                        predicted_cents, discount_pct, sample_size, confidence, computed_at,
                        model_version
                 FROM comp_cache WHERE listing_id = ?1",
                rusqlite::params![listing_id],
                |r| {
                    Ok(CompCache {
                        listing_id: r.get(0)?,
                        p10_cents: r.get(1)?,
                        p25_cents: r.get(2)?,
                        p50_cents: r.get(3)?,
                        p75_cents: r.get(4)?,
                        p90_cents: r.get(5)?,
                        predicted_cents: r.get(6)?,
                        discount_pct: r.get(7)?,
                        sample_size: r.get(8)?,
                        confidence: r.get(9)?,
                        computed_at: r.get(10)?,
                        model_version: r.get(11)?,
                    })
                },
            )
            .optional()?)
        })
    }
}
