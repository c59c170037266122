//! Scoring stage: four additive components, a 1-10 scale, and the approval
//! gate. Reasons record every component and the decisive thresholds so a
//! rejection can always be explained from the stored row.

use anyhow::Result;
use tracing::{debug, info};

use super::AppState;
use crate::models::{now_ts, CompCache, RiskEvaluation, RiskLevel, Score, ScoreState};
use crate::queue::StageOutcome;

const MAX_DISCOUNT_FOR_FULL_SCORE: f64 = 0.25;
const FRESH_FULL_HOURS: f64 = 1.0;
const FRESH_ZERO_HOURS: f64 = 24.0;
const LIQUIDITY_FULL_SAMPLE: f64 = 60.0;

/// [0,5]: linear in discount up to 25%, scaled by estimate confidence.
pub fn price_score(discount_pct: f64, confidence: f64) -> f64 {
    let base = (discount_pct / MAX_DISCOUNT_FOR_FULL_SCORE).clamp(0.0, 1.0) * 5.0;
    base * confidence.clamp(0.0, 1.0)
}

/// [-4,0], with one extra point off for a hard accident flag.
pub fn risk_penalty(risk: &RiskEvaluation) -> f64 {
    let base = match risk.risk_level {
        RiskLevel::Green => 0.0,
        RiskLevel::Yellow => -2.0,
        RiskLevel::Red => -4.0,
    };
    if risk.flags.contains_key("accident") {
        base - 1.0
    } else {
        base
    }
}

/// [0,0.5]: full inside the first hour, gone by 24h.
pub fn freshness(first_seen: i64, now: i64) -> f64 {
    let age_hours = (now - first_seen).max(0) as f64 / 3600.0;
    if age_hours <= FRESH_FULL_HOURS {
        0.5
    } else if age_hours >= FRESH_ZERO_HOURS {
        0.0
    } else {
        0.5 * (FRESH_ZERO_HOURS - age_hours) / (FRESH_ZERO_HOURS - FRESH_FULL_HOURS)
    }
}

/// [0,1]: comparables volume as a liquidity proxy.
pub fn liquidity(sample_size: i64) -> f64 {
    (sample_size as f64 / LIQUIDITY_FULL_SAMPLE).min(1.0)
}

fn compose(listing_first_seen: i64, comp: &CompCache, risk: &RiskEvaluation, now: i64) -> Score {
    let ps = price_score(comp.discount_pct.unwrap_or(0.0), comp.confidence);
    let rp = risk_penalty(risk);
    let fr = freshness(listing_first_seen, now);
    let lq = liquidity(comp.sample_size);
    let total = (1.0 + ps + rp + fr + lq).clamp(1.0, 10.0);

    Score {
        listing_id: comp.listing_id.clone(),
        score: total,
        price_score: ps,
        risk_penalty: rp,
        freshness: fr,
        liquidity: lq,
        reasons: Vec::new(),
        state: ScoreState::Draft,
        scored_at: now,
    }
}

pub async fn run(state: &AppState, listing_id: &str) -> Result<StageOutcome> {
    let Some(listing) = state.store.get_listing(listing_id)? else {
        return Ok(StageOutcome::Skip(format!("unknown listing {listing_id}")));
    };
    if listing.is_duplicate {
        return Ok(StageOutcome::Skip("duplicates are not scored".into()));
    }
    let Some(comp) = state.store.get_comp_cache(listing_id)? else {
        return Ok(StageOutcome::DeadLetter("score ran before price".into()));
    };
    let Some(risk) = state.store.get_risk(listing_id)? else {
        return Ok(StageOutcome::DeadLetter("score ran before risk".into()));
    };

    let now = now_ts();
    let mut score = compose(listing.first_seen, &comp, &risk, now);

    let cfg = &state.config;
    let gates = [
        (
            score.score >= cfg.score_threshold,
            format!("score {:.2} vs threshold {:.1}", score.score, cfg.score_threshold),
        ),
        (
            comp.sample_size >= cfg.sample_threshold,
            format!("sample {} vs minimum {}", comp.sample_size, cfg.sample_threshold),
        ),
        (
            comp.confidence >= cfg.confidence_threshold,
            format!(
                "confidence {:.2} vs minimum {:.2}",
                comp.confidence, cfg.confidence_threshold
            ),
        ),
        (
            risk.risk_level != RiskLevel::Red,
            format!("risk level {}", risk.risk_level.as_str()),
        ),
    ];

    let approved = gates.iter().all(|(ok, _)| *ok);
    score.state = if approved {
        ScoreState::Approved
    } else {
        ScoreState::Rejected
    };

    score.reasons = vec![
        format!("price_score {:.2}", score.price_score),
        format!("risk_penalty {:.2}", score.risk_penalty),
        format!("freshness {:.2}", score.freshness),
        format!("liquidity {:.2}", score.liquidity),
    ];
    for (ok, detail) in &gates {
        score
            .reasons
            .push(format!("{} {detail}", if *ok { "pass:" } else { "fail:" }));
    }

    state.store.finish_score(&score)?;
    if approved {
        info!(listing_id, score = score.score, "Listing approved for broadcast");
    } else {
        debug!(listing_id, score = score.score, "Listing rejected");
    }
    Ok(StageOutcome::Done)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn comp(discount: f64, sample: i64, confidence: f64) -> CompCache {
        CompCache {
            listing_id: "L".into(),
            p10_cents: None,
            p25_cents: None,
            p50_cents: Some(3_200_000),
            p75_cents: None,
            p90_cents: None,
            predicted_cents: Some(3_200_000),
            discount_pct: Some(discount),
            sample_size: sample,
            confidence,
            computed_at: 0,
            model_version: "comps-v1".into(),
        }
    }

    fn risk(level: RiskLevel) -> RiskEvaluation {
        RiskEvaluation {
            listing_id: "L".into(),
            flags: BTreeMap::new(),
            risk_level: level,
            rule_confidence: 0.7,
            llm_summary: None,
            llm_reasons: vec![],
            llm_confidence: None,
            llm_unavailable: false,
            evaluated_at: 0,
        }
    }

    #[test]
    fn price_score_is_linear_and_capped() {
        assert_eq!(price_score(0.0, 1.0), 0.0);
        assert_eq!(price_score(-0.1, 1.0), 0.0);
        assert!((price_score(0.125, 1.0) - 2.5).abs() < 1e-9);
        assert_eq!(price_score(0.25, 1.0), 5.0);
        assert_eq!(price_score(0.40, 1.0), 5.0);
        assert!((price_score(0.25, 0.5) - 2.5).abs() < 1e-9);
    }

    #[test]
    fn score_is_monotone_in_discount() {
        // raising the price (smaller discount) never raises the score
        let now = 100_000;
        let better = compose(0, &comp(0.20, 50, 0.8), &risk(RiskLevel::Green), now);
        let worse = compose(0, &comp(0.10, 50, 0.8), &risk(RiskLevel::Green), now);
        assert!(better.score >= worse.score);
    }

    #[test]
    fn freshness_decays_to_zero() {
        let now = 1_000_000;
        assert_eq!(freshness(now - 600, now), 0.5); // 10 minutes old
        assert_eq!(freshness(now - 25 * 3600, now), 0.0);
        let mid = freshness(now - 12 * 3600, now);
        assert!(mid > 0.0 && mid < 0.5);
    }

    #[test]
    fn red_risk_floors_the_penalty() {
        let mut r = risk(RiskLevel::Red);
        assert_eq!(risk_penalty(&r), -4.0);
        r.flags
            .insert("accident".into(), vec!["катастрофирал".into()]);
        assert_eq!(risk_penalty(&r), -5.0);
    }

    #[test]
    fn perfect_components_hit_the_gate() {
        // identical comparables: cv = 0, confidence = 1
        let s = compose(99_000, &comp(0.30, 60, 1.0), &risk(RiskLevel::Green), 100_000);
        // 1 + 5 + 0 + 0.5 + 1 = 7.5
        assert!((s.score - 7.5).abs() < 1e-9);
    }
}
