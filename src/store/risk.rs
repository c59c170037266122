//! Risk evaluation persistence and the LLM escalation cache.

use anyhow::{Context, Result};
use rusqlite::{params, OptionalExtension};

use super::Store;
use crate::models::{now_ts, RiskEvaluation, RiskLevel};
use crate::queue::{self, Stage};

impl Store {
    /// Persist the evaluation and enqueue scoring, atomically.
    pub fn finish_risk(&self, eval: &RiskEvaluation) -> Result<()> {
        let flags = serde_json::to_string(&eval.flags).context("serialize risk flags")?;
        let reasons = serde_json::to_string(&eval.llm_reasons).context("serialize llm reasons")?;
        self.with_tx(|tx| {
            tx.execute(
                "INSERT INTO risk_evaluations
                 (listing_id, flags, risk_level, rule_confidence, llm_summary, llm_reasons,
                  llm_confidence, llm_unavailable, evaluated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(listing_id) DO UPDATE SET
                     flags = excluded.flags,
                     risk_level = excluded.risk_level,
                     rule_confidence = excluded.rule_confidence,
                     llm_summary = excluded.llm_summary,
                     llm_reasons = excluded.llm_reasons,
                     llm_confidence = excluded.llm_confidence,
                     llm_unavailable = excluded.llm_unavailable,
                     evaluated_at = excluded.evaluated_at",
                params![
                    eval.listing_id,
                    flags,
                    eval.risk_level.as_str(),
                    eval.rule_confidence,
                    eval.llm_summary,
                    reasons,
                    eval.llm_confidence,
                    eval.llm_unavailable as i64,
                    eval.evaluated_at
                ],
            )?;
            queue::enqueue(tx, Stage::Score, &eval.listing_id, now_ts())?;
            Ok(())
        })
    }

    pub fn get_risk(&self, listing_id: &str) -> Result<Option<RiskEvaluation>> {
        self.with_conn(|c| {
            Ok(c.query_row(
                "SELECT listing_id, flags, risk_level, rule_confidence, llm_summary,
                        llm_reasons, llm_confidence, llm_unavailable, evaluated_at
                 FROM risk_evaluations WHERE listing_id = ?1",
                params![listing_id],
                |r| {
                    let flags: String = r.get(1)?;
                    let reasons: String = r.get(5)?;
                    let level: String = r.get(2)?;
                    Ok(RiskEvaluation {
                        listing_id: r.get(0)?,
                        flags: serde_json::from_str(&flags).unwrap_or_default(),
                        risk_level: RiskLevel::parse(&level).unwrap_or(RiskLevel::Yellow),
                        rule_confidence: r.get(3)?,
                        llm_summary: r.get(4)?,
                        llm_reasons: serde_json::from_str(&reasons).unwrap_or_default(),
                        llm_confidence: r.get(6)?,
                        llm_unavailable: r.get::<_, i64>(7)? != 0,
                        evaluated_at: r.get(8)?,
                    })
                },
            )
            .optional()?)
        })
    }

    pub fn llm_cache_get(
        &self,
        description_hash: &str,
        prompt_version: &str,
    ) -> Result<Option<String>> {
        self.with_conn(|c| {
            Ok(c.query_row(
                "SELECT response_json FROM llm_cache
                 WHERE description_hash = ?1 AND prompt_version = ?2",
                params![description_hash, prompt_version],
                |r| r.get(0),
            )
            .optional()?)
        })
    }

    pub fn llm_cache_put(
        &self,
        description_hash: &str,
        prompt_version: &str,
        response_json: &str,
    ) -> Result<()> {
        self.with_conn(|c| {
            c.execute(
                "INSERT INTO llm_cache (description_hash, prompt_version, response_json, created_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(description_hash, prompt_version) DO UPDATE SET
                     response_json = excluded.response_json",
                params![description_hash, prompt_version, response_json, now_ts()],
            )?;
            Ok(())
        })
    }
}
