//! Persisted token buckets.
//!
//! Buckets live in the store so limits survive restarts and hold across
//! workers. One row per bucket key; take-or-refuse is a single read-modify-
//! write under the store transaction, nothing is held between calls.

use anyhow::Result;
use rusqlite::{params, OptionalExtension};

use crate::models::now_ts;
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TokenTake {
    Taken,
    Empty { retry_after_secs: i64 },
}

impl Store {
    /// Take one token from `key`, refilling at `refill_per_sec` up to
    /// `capacity` since the last touch.
    pub fn take_token(&self, key: &str, capacity: f64, refill_per_sec: f64) -> Result<TokenTake> {
        let now = now_ts();
        self.with_tx(|tx| {
            let row: Option<(f64, i64)> = tx
                .query_row(
                    "SELECT tokens, updated_at FROM rate_buckets WHERE key = ?1",
                    params![key],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
                .optional()?;

            let (mut tokens, updated_at) = row.unwrap_or((capacity, now));
            let elapsed = (now - updated_at).max(0) as f64;
            tokens = (tokens + elapsed * refill_per_sec).min(capacity);

            let take = if tokens >= 1.0 {
                tokens -= 1.0;
                TokenTake::Taken
            } else {
                let deficit = 1.0 - tokens;
                TokenTake::Empty {
                    retry_after_secs: (deficit / refill_per_sec).ceil() as i64,
                }
            };

            tx.execute(
                "INSERT INTO rate_buckets (key, tokens, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET tokens = excluded.tokens,
                                                updated_at = excluded.updated_at",
                params![key, tokens, now],
            )?;
            Ok(take)
        })
    }

    /// Empty the bucket until `retry_after_secs` from now. Used when the
    /// external service said it is rate limited: its verdict wins over our
    /// local accounting.
    pub fn penalize_bucket(&self, key: &str, retry_after_secs: i64) -> Result<()> {
        let resume_at = now_ts() + retry_after_secs.max(0);
        self.with_conn(|c| {
            c.execute(
                "INSERT INTO rate_buckets (key, tokens, updated_at) VALUES (?1, 0, ?2)
                 ON CONFLICT(key) DO UPDATE SET tokens = 0, updated_at = excluded.updated_at",
                params![key, resume_at],
            )?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_allows_burst_then_refuses() {
        let store = Store::open_in_memory().unwrap();
        for _ in 0..5 {
            assert_eq!(
                store.take_token("chan:test", 5.0, 1.0 / 180.0).unwrap(),
                TokenTake::Taken
            );
        }
        match store.take_token("chan:test", 5.0, 1.0 / 180.0).unwrap() {
            TokenTake::Empty { retry_after_secs } => {
                assert!(retry_after_secs > 0 && retry_after_secs <= 180);
            }
            TokenTake::Taken => panic!("bucket should be empty"),
        }
    }

    #[test]
    fn buckets_are_independent_per_key() {
        let store = Store::open_in_memory().unwrap();
        assert_eq!(store.take_token("a", 1.0, 0.1).unwrap(), TokenTake::Taken);
        assert_eq!(store.take_token("b", 1.0, 0.1).unwrap(), TokenTake::Taken);
        assert!(matches!(
            store.take_token("a", 1.0, 0.1).unwrap(),
            TokenTake::Empty { .. }
        ));
    }

    #[test]
    fn penalty_empties_the_bucket() {
        let store = Store::open_in_memory().unwrap();
        assert_eq!(store.take_token("p", 3.0, 1.0).unwrap(), TokenTake::Taken);
        store.penalize_bucket("p", 60).unwrap();
        assert!(matches!(
            store.take_token("p", 3.0, 1.0).unwrap(),
            TokenTake::Empty { .. }
        ));
    }
}
