//! Score persistence and the approval fan-out.

use anyhow::{Context, Result};
use rusqlite::{params, OptionalExtension};

use super::Store;
use crate::models::{now_ts, Score, ScoreState};
use crate::queue::{self, Stage};

impl Store {
    /// Persist the score; approved listings fan out to channel delivery and
    /// alert matching in the same transaction.
    pub fn finish_score(&self, score: &Score) -> Result<()> {
        let reasons = serde_json::to_string(&score.reasons).context("serialize score reasons")?;
        self.with_tx(|tx| {
            tx.execute(
                "INSERT INTO scores
                 (listing_id, score, price_score, risk_penalty, freshness, liquidity,
                  reasons, state, scored_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(listing_id) DO UPDATE SET
                     score = excluded.score,
                     price_score = excluded.price_score,
                     risk_penalty = excluded.risk_penalty,
                     freshness = excluded.freshness,
                     liquidity = excluded.liquidity,
                     reasons = excluded.reasons,
                     state = excluded.state,
                     scored_at = excluded.scored_at",
                params![
                    score.listing_id,
                    score.score,
                    score.price_score,
                    score.risk_penalty,
                    score.freshness,
                    score.liquidity,
                    reasons,
                    score.state.as_str(),
                    score.scored_at
                ],
            )?;
            if score.state == ScoreState::Approved {
                queue::enqueue(tx, Stage::Channel, &score.listing_id, now_ts())?;
                queue::enqueue(tx, Stage::AlertMatch, &score.listing_id, now_ts())?;
            }
            Ok(())
        })
    }

    pub fn get_score(&self, listing_id: &str) -> Result<Option<Score>> {
        self.with_conn(|c| {
            Ok(c.query_row(
                "SELECT listing_id, score, price_score, risk_penalty, freshness, liquidity,
                        reasons, state, scored_at
                 FROM scores WHERE listing_id = ?1",
                params![listing_id],
                |r| {
                    let reasons: String = r.get(6)?;
                    let state: String = r.get(7)?;
                    Ok(Score {
                        listing_id: r.get(0)?,
                        score: r.get(1)?,
                        price_score: r.get(2)?,
                        risk_penalty: r.get(3)?,
                        freshness: r.get(4)?,
                        liquidity: r.get(5)?,
                        reasons: serde_json::from_str(&reasons).unwrap_or_default(),
                        state: ScoreState::parse(&state).unwrap_or(ScoreState::Draft),
                        scored_at: r.get(8)?,
                    })
                },
            )
            .optional()?)
        })
    }
}
