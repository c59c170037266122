//! Risk stage: keyword rules first, LLM escalation only when the rules are
//! unsure, cached by description hash so one ad text is never paid for
//! twice. The LLM can never block the pipeline: any failure falls back to
//! the rule verdict with `llm_unavailable` set.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Result;
use lazy_static::lazy_static;
use tracing::{debug, warn};

use super::AppState;
use crate::llm::{AssessmentRequest, RiskAssessment};
use crate::models::{now_ts, Listing, RiskEvaluation, RiskLevel};
use crate::queue::StageOutcome;
use crate::similarity::normalize_text;

const ESCALATION_THRESHOLD: f64 = 0.7;

/// Versioned keyword lists, Bulgarian primary. Hard categories force red on
/// any hit; soft ones accumulate.
pub const KEYWORDS_VERSION: &str = "kw-v2";

struct Category {
    name: &'static str,
    hard: bool,
    keywords: &'static [&'static str],
}

lazy_static! {
    static ref CATEGORIES: Vec<Category> = vec![
        Category {
            name: "accident",
            hard: true,
            keywords: &[
                "катастрофирал", "катастрофа", "ударен", "ударена", "удар",
                "след пт", "пт п", "crashed", "accident damage", "unfall",
            ],
        },
        Category {
            name: "salvage",
            hard: true,
            keywords: &[
                "за части", "на части", "тотална щета", "тотал щета", "salvage",
                "не пали", "не запалва", "за скрап",
            ],
        },
        Category {
            name: "import",
            hard: false,
            keywords: &[
                "внос от", "току що внесен", "новодошъл", "без регистрация",
                "не е регистриран", "import", "чужди номера",
            ],
        },
        Category {
            name: "urgency",
            hard: false,
            keywords: &[
                "спешно", "спешна продажба", "заминавам", "заминаване", "днес",
                "бърза продажба", "urgent", "цена до",
            ],
        },
        Category {
            name: "odometer_tamper",
            hard: false,
            keywords: &[
                "превъртян", "въртян километраж", "сменен километраж",
                "не гарантирам километри", "километрите не са реални",
            ],
        },
        Category {
            name: "cosmetic",
            hard: false,
            keywords: &[
                "драскотини", "вдлъбнатини", "ръжда", "забележки по", "за боядисване",
                "халогени счупени", "пукнато стъкло",
            ],
        },
    ];
}

pub struct RuleVerdict {
    pub flags: BTreeMap<String, Vec<String>>,
    pub risk_level: RiskLevel,
    pub confidence: f64,
    pub escalate: bool,
}

/// Scan title + description against the keyword table and apply the
/// decision ladder.
pub fn classify(text: &str) -> RuleVerdict {
    let haystack = normalize_text(text);
    let mut flags: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut hard_hits = 0usize;
    let mut soft_categories = 0usize;

    for category in CATEGORIES.iter() {
        let matched: Vec<String> = category
            .keywords
            .iter()
            .filter(|kw| haystack.contains(&normalize_text(kw)))
            .map(|kw| kw.to_string())
            .collect();
        if matched.is_empty() {
            continue;
        }
        if category.hard {
            hard_hits += matched.len();
        } else {
            soft_categories += 1;
        }
        flags.insert(category.name.to_string(), matched);
    }

    if hard_hits > 0 {
        let confidence = (0.8 + 0.05 * (hard_hits.saturating_sub(1)) as f64).min(0.95);
        return RuleVerdict {
            flags,
            risk_level: RiskLevel::Red,
            confidence,
            escalate: false,
        };
    }
    if soft_categories >= 3 {
        let confidence = (0.6 + 0.1 * (soft_categories - 3) as f64).min(0.9);
        return RuleVerdict {
            flags,
            risk_level: RiskLevel::Yellow,
            confidence,
            escalate: false,
        };
    }
    if soft_categories == 0 {
        return RuleVerdict {
            flags,
            risk_level: RiskLevel::Green,
            confidence: 0.7,
            escalate: false,
        };
    }
    // one or two soft flags: unsure, let the LLM weigh in
    RuleVerdict {
        flags,
        risk_level: RiskLevel::Yellow,
        confidence: 0.45 + 0.1 * soft_categories as f64,
        escalate: true,
    }
}

/// Cached LLM escalation. Returns None on any failure or schema deviation.
async fn escalate(state: &AppState, listing: &Listing) -> Option<RiskAssessment> {
    let description_hash = listing.description_hash.as_deref()?;
    let prompt_version = &state.config.llm_prompt_version;

    if let Ok(Some(cached)) = state.store.llm_cache_get(description_hash, prompt_version) {
        if let Ok(assessment) = serde_json::from_str::<RiskAssessment>(&cached) {
            debug!(listing_id = %listing.id, "LLM cache hit");
            return assessment.validate().ok();
        }
    }

    let request = AssessmentRequest {
        prompt_version: prompt_version.clone(),
        title: listing.title.clone().unwrap_or_default(),
        description: listing.description.clone().unwrap_or_default(),
        features: listing.features.clone(),
    };
    let deadline = Duration::from_millis(state.config.llm_timeout_ms);
    let result = tokio::time::timeout(deadline, state.llm.assess(&request)).await;

    match result {
        Ok(Ok(assessment)) => {
            if let Ok(json) = serde_json::to_string(&assessment) {
                let _ = state
                    .store
                    .llm_cache_put(description_hash, prompt_version, &json);
            }
            Some(assessment)
        }
        Ok(Err(e)) => {
            warn!(listing_id = %listing.id, error = %e, "LLM assessment failed");
            None
        }
        Err(_) => {
            warn!(listing_id = %listing.id, "LLM assessment timed out");
            None
        }
    }
}

pub async fn run(state: &AppState, listing_id: &str) -> Result<StageOutcome> {
    let Some(listing) = state.store.get_listing(listing_id)? else {
        return Ok(StageOutcome::Skip(format!("unknown listing {listing_id}")));
    };
    if listing.is_duplicate {
        return Ok(StageOutcome::Skip("duplicates are not risk-evaluated".into()));
    }

    // a blacklisted seller is red regardless of what the ad says
    if let Some(seller_id) = &listing.seller_id {
        if state.store.seller_blacklisted(seller_id)? {
            let mut flags = BTreeMap::new();
            flags.insert(
                "seller_blacklisted".to_string(),
                vec!["seller on blacklist".to_string()],
            );
            state.store.finish_risk(&RiskEvaluation {
                listing_id: listing.id.clone(),
                flags,
                risk_level: RiskLevel::Red,
                rule_confidence: 0.95,
                llm_summary: None,
                llm_reasons: Vec::new(),
                llm_confidence: None,
                llm_unavailable: false,
                evaluated_at: now_ts(),
            })?;
            return Ok(StageOutcome::Done);
        }
    }

    let text = format!(
        "{} {}",
        listing.title.as_deref().unwrap_or(""),
        listing.description.as_deref().unwrap_or("")
    );
    let verdict = classify(&text);

    let mut eval = RiskEvaluation {
        listing_id: listing.id.clone(),
        flags: verdict.flags,
        risk_level: verdict.risk_level,
        rule_confidence: verdict.confidence,
        llm_summary: None,
        llm_reasons: Vec::new(),
        llm_confidence: None,
        llm_unavailable: false,
        evaluated_at: now_ts(),
    };

    if verdict.escalate || verdict.confidence < ESCALATION_THRESHOLD {
        match escalate(state, &listing).await {
            Some(assessment) => {
                eval.llm_summary = Some(assessment.summary.clone());
                eval.llm_reasons = assessment.reasons.clone();
                eval.llm_confidence = Some(assessment.confidence);
                // the model's verdict wins only when it is more sure than the rules
                if assessment.confidence > eval.rule_confidence {
                    eval.risk_level = assessment.risk_level;
                }
            }
            None => {
                eval.llm_unavailable = true;
            }
        }
    }

    debug!(
        listing_id,
        level = eval.risk_level.as_str(),
        rule_confidence = eval.rule_confidence,
        llm = eval.llm_confidence.is_some(),
        "Risk evaluated"
    );
    state.store.finish_risk(&eval)?;
    Ok(StageOutcome::Done)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn salvage_keyword_forces_red_without_llm() {
        let v = classify("BMW E46 на части, двигателят работи");
        assert_eq!(v.risk_level, RiskLevel::Red);
        assert!(v.confidence >= 0.8);
        assert!(!v.escalate);
        assert!(v.flags.contains_key("salvage"));
    }

    #[test]
    fn accident_keyword_forces_red() {
        let v = classify("Колата е катастрофирала в предницата");
        assert_eq!(v.risk_level, RiskLevel::Red);
        assert!(v.flags.contains_key("accident"));
    }

    #[test]
    fn clean_text_is_green_without_escalation() {
        let v = classify("Перфектно състояние, обслужен, нови гуми, първи собственик");
        assert_eq!(v.risk_level, RiskLevel::Green);
        assert!((v.confidence - 0.7).abs() < f64::EPSILON);
        assert!(!v.escalate);
        assert!(v.flags.is_empty());
    }

    #[test]
    fn three_soft_categories_is_yellow() {
        let v = classify(
            "Спешно! Внос от Германия, има драскотини по задната броня",
        );
        assert_eq!(v.risk_level, RiskLevel::Yellow);
        assert!(v.confidence >= 0.6);
        assert!(!v.escalate);
    }

    #[test]
    fn one_soft_flag_escalates() {
        let v = classify("Продавам спешно поради заминаване");
        assert!(v.escalate);
        assert!(v.confidence < ESCALATION_THRESHOLD);
        assert_eq!(v.risk_level, RiskLevel::Yellow);
    }
}
