//! Daily FX rates. BGN is the reference currency; EUR is pegged.
//!
//! Rates are versioned by day so re-running normalize on an old listing
//! reproduces the same BGN price. A static fallback row keeps the pipeline
//! moving when no daily rate has been loaded yet.

use anyhow::{Context, Result};
use rusqlite::{params, OptionalExtension};

use super::Store;
use crate::models::ts_to_datetime;

/// (currency, rate_to_bgn). EUR is the currency-board peg.
pub const FALLBACK_RATES: &[(&str, f64)] = &[("BGN", 1.0), ("EUR", 1.95583), ("USD", 1.80)];

/// Day key for FX versioning.
pub fn fx_day(ts: i64) -> String {
    ts_to_datetime(ts).format("%Y-%m-%d").to_string()
}

impl Store {
    pub fn upsert_fx_rate(&self, day: &str, currency: &str, rate_to_bgn: f64) -> Result<()> {
        self.with_conn(|c| {
            c.execute(
                "INSERT INTO fx_rates (day, currency, rate_to_bgn) VALUES (?1, ?2, ?3)
                 ON CONFLICT(day, currency) DO UPDATE SET rate_to_bgn = excluded.rate_to_bgn",
                params![day, currency.to_uppercase(), rate_to_bgn],
            )?;
            Ok(())
        })
    }

    /// Rate for a currency on a given day: exact day, else the most recent
    /// loaded day, else the static fallback.
    pub fn fx_rate(&self, day: &str, currency: &str) -> Result<f64> {
        let currency = currency.to_uppercase();
        if currency == "BGN" {
            return Ok(1.0);
        }
        self.with_conn(|c| {
            let exact: Option<f64> = c
                .query_row(
                    "SELECT rate_to_bgn FROM fx_rates WHERE day = ?1 AND currency = ?2",
                    params![day, currency],
                    |r| r.get(0),
                )
                .optional()?;
            if let Some(rate) = exact {
                return Ok(rate);
            }
            let latest: Option<f64> = c
                .query_row(
                    "SELECT rate_to_bgn FROM fx_rates
                     WHERE currency = ?1 AND day != 'fallback'
                     ORDER BY day DESC LIMIT 1",
                    params![currency],
                    |r| r.get(0),
                )
                .optional()?;
            if let Some(rate) = latest {
                return Ok(rate);
            }
            c.query_row(
                "SELECT rate_to_bgn FROM fx_rates WHERE day = 'fallback' AND currency = ?1",
                params![currency],
                |r| r.get(0),
            )
            .optional()?
            .with_context(|| format!("no FX rate for {currency}"))
        })
    }

    /// Convert a price in `currency` to BGN stotinki using the rate for the
    /// given day.
    pub fn convert_to_bgn_cents(&self, amount: f64, currency: &str, at_ts: i64) -> Result<i64> {
        let rate = self.fx_rate(&fx_day(at_ts), currency)?;
        Ok((amount * rate * 100.0).round() as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eur_uses_peg_fallback() {
        let store = Store::open_in_memory().unwrap();
        let cents = store.convert_to_bgn_cents(10_000.0, "eur", 1_700_000_000).unwrap();
        assert_eq!(cents, 1_955_830);
    }

    #[test]
    fn daily_rate_beats_fallback() {
        let store = Store::open_in_memory().unwrap();
        let day = fx_day(1_700_000_000);
        store.upsert_fx_rate(&day, "USD", 1.75).unwrap();
        let cents = store.convert_to_bgn_cents(100.0, "USD", 1_700_000_000).unwrap();
        assert_eq!(cents, 17_500);
    }

    #[test]
    fn bgn_is_identity() {
        let store = Store::open_in_memory().unwrap();
        let cents = store.convert_to_bgn_cents(28_500.0, "BGN", 0).unwrap();
        assert_eq!(cents, 2_850_000);
    }
}
