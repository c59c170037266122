//! Core domain types shared across the pipeline stages.
//!
//! Money is fixed-point: all `*_cents` fields are stotinki (1/100 BGN) unless
//! the field also carries a `currency`. Timestamps are unix seconds UTC.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Fuel type after normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Fuel {
    Petrol,
    Diesel,
    Hybrid,
    Electric,
    Lpg,
    Cng,
    Other,
}

impl Fuel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Fuel::Petrol => "petrol",
            Fuel::Diesel => "diesel",
            Fuel::Hybrid => "hybrid",
            Fuel::Electric => "electric",
            Fuel::Lpg => "lpg",
            Fuel::Cng => "cng",
            Fuel::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "petrol" => Some(Fuel::Petrol),
            "diesel" => Some(Fuel::Diesel),
            "hybrid" => Some(Fuel::Hybrid),
            "electric" => Some(Fuel::Electric),
            "lpg" => Some(Fuel::Lpg),
            "cng" => Some(Fuel::Cng),
            "other" => Some(Fuel::Other),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Gearbox {
    Manual,
    Automatic,
    SemiAuto,
    Other,
}

impl Gearbox {
    pub fn as_str(&self) -> &'static str {
        match self {
            Gearbox::Manual => "manual",
            Gearbox::Automatic => "automatic",
            Gearbox::SemiAuto => "semi_auto",
            Gearbox::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "manual" => Some(Gearbox::Manual),
            "automatic" => Some(Gearbox::Automatic),
            "semi_auto" => Some(Gearbox::SemiAuto),
            "other" => Some(Gearbox::Other),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Body {
    Sedan,
    Hatchback,
    Estate,
    Suv,
    Coupe,
    Convertible,
    Van,
    Pickup,
    Other,
}

impl Body {
    pub fn as_str(&self) -> &'static str {
        match self {
            Body::Sedan => "sedan",
            Body::Hatchback => "hatchback",
            Body::Estate => "estate",
            Body::Suv => "suv",
            Body::Coupe => "coupe",
            Body::Convertible => "convertible",
            Body::Van => "van",
            Body::Pickup => "pickup",
            Body::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sedan" => Some(Body::Sedan),
            "hatchback" => Some(Body::Hatchback),
            "estate" => Some(Body::Estate),
            "suv" => Some(Body::Suv),
            "coupe" => Some(Body::Coupe),
            "convertible" => Some(Body::Convertible),
            "van" => Some(Body::Van),
            "pickup" => Some(Body::Pickup),
            "other" => Some(Body::Other),
            _ => None,
        }
    }
}

/// Risk classification produced by the rule stage, possibly overridden by LLM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Green,
    Yellow,
    Red,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Green => "green",
            RiskLevel::Yellow => "yellow",
            RiskLevel::Red => "red",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "green" => Some(RiskLevel::Green),
            "yellow" => Some(RiskLevel::Yellow),
            "red" => Some(RiskLevel::Red),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreState {
    Draft,
    Approved,
    Rejected,
}

impl ScoreState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScoreState::Draft => "draft",
            ScoreState::Approved => "approved",
            ScoreState::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(ScoreState::Draft),
            "approved" => Some(ScoreState::Approved),
            "rejected" => Some(ScoreState::Rejected),
            _ => None,
        }
    }
}

/// How a duplicate was detected. Order matters: the cascade tries them in
/// this sequence and the first confident hit wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupeMethod {
    Phone,
    Image,
    Text,
    Embedding,
}

impl DedupeMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            DedupeMethod::Phone => "phone",
            DedupeMethod::Image => "image",
            DedupeMethod::Text => "text",
            DedupeMethod::Embedding => "embedding",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
    Pending,
    Notified,
    Skipped,
    Failed,
}

impl MatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchStatus::Pending => "pending",
            MatchStatus::Notified => "notified",
            MatchStatus::Skipped => "skipped",
            MatchStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(MatchStatus::Pending),
            "notified" => Some(MatchStatus::Notified),
            "skipped" => Some(MatchStatus::Skipped),
            "failed" => Some(MatchStatus::Failed),
            _ => None,
        }
    }
}

/// Subscription tiers. Caps and delays live on the `plans` table so they can
/// be tuned without a deploy; these are the seed values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanName {
    Free,
    Premium,
    Pro,
}

impl PlanName {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanName::Free => "free",
            PlanName::Premium => "premium",
            PlanName::Pro => "pro",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "free" => Some(PlanName::Free),
            "premium" => Some(PlanName::Premium),
            "pro" => Some(PlanName::Pro),
            _ => None,
        }
    }
}

/// A classifieds source (marketplace) the scheduler ticks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub id: String,
    pub name: String,
    pub base_url: String,
    pub enabled: bool,
    pub crawl_interval_secs: i64,
}

/// What a scrape adapter hands the core per observed ad.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawRecord {
    pub source_id: String,
    pub site_ad_id: String,
    pub url: String,
    pub raw_blob_key: String,
    /// SHA-256 of the raw blob; drives re-parse on content change.
    pub content_hash: String,
    pub observed_at: i64,
}

/// One scraped ad as first persisted.
#[derive(Debug, Clone)]
pub struct RawListing {
    pub id: String,
    pub source_id: String,
    pub site_ad_id: String,
    pub url: String,
    pub raw_blob_key: String,
    pub content_hash: String,
    pub http_status: Option<i64>,
    pub first_seen: i64,
    pub last_seen: i64,
    pub is_active: bool,
    pub version: i64,
    pub parse_errors: i64,
}

/// Parse output: whatever could be safely extracted, nothing guessed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListingDraft {
    pub title: Option<String>,
    pub brand_raw: Option<String>,
    pub model_raw: Option<String>,
    pub price: Option<f64>,
    pub currency: Option<String>,
    pub year: Option<i64>,
    pub mileage_raw: Option<String>,
    pub power_raw: Option<String>,
    pub fuel_raw: Option<String>,
    pub gearbox_raw: Option<String>,
    pub body_raw: Option<String>,
    pub region_raw: Option<String>,
    pub description: Option<String>,
    pub image_urls: Vec<String>,
    /// 64-bit perceptual hash of the first image, supplied by the adapter.
    pub first_image_hash: Option<u64>,
    pub seller_phone: Option<String>,
    pub seller_profile_url: Option<String>,
}

/// The normalized listing record, one-to-one with a raw listing per parse
/// generation. `is_draft` means brand/model could not be mapped confidently.
#[derive(Debug, Clone)]
pub struct Listing {
    pub id: String,
    pub raw_id: String,
    pub brand_id: Option<String>,
    pub model_id: Option<String>,
    pub year: Option<i64>,
    pub mileage_km: Option<i64>,
    pub power_hp: Option<i64>,
    pub fuel: Option<Fuel>,
    pub gearbox: Option<Gearbox>,
    pub body: Option<Body>,
    pub price_cents: Option<i64>,
    pub currency: Option<String>,
    pub price_bgn_cents: Option<i64>,
    pub region: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub description_hash: Option<String>,
    pub features: Vec<String>,
    pub first_image_hash: Option<u64>,
    pub seller_id: Option<String>,
    pub version: i64,
    pub is_draft: bool,
    pub is_duplicate: bool,
    pub canonical_of: Option<String>,
    pub first_seen: i64,
}

#[derive(Debug, Clone)]
pub struct Seller {
    pub id: String,
    pub phone_hash: String,
    pub profile_url: Option<String>,
    pub contact_count: i64,
    pub blacklisted: bool,
}

/// Comparable-set price estimate for one listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompCache {
    pub listing_id: String,
    pub p10_cents: Option<i64>,
    pub p25_cents: Option<i64>,
    pub p50_cents: Option<i64>,
    pub p75_cents: Option<i64>,
    pub p90_cents: Option<i64>,
    pub predicted_cents: Option<i64>,
    pub discount_pct: Option<f64>,
    pub sample_size: i64,
    pub confidence: f64,
    pub computed_at: i64,
    pub model_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskEvaluation {
    pub listing_id: String,
    /// category -> matched keywords
    pub flags: std::collections::BTreeMap<String, Vec<String>>,
    pub risk_level: RiskLevel,
    pub rule_confidence: f64,
    pub llm_summary: Option<String>,
    pub llm_reasons: Vec<String>,
    pub llm_confidence: Option<f64>,
    pub llm_unavailable: bool,
    pub evaluated_at: i64,
}

impl RiskEvaluation {
    /// True when an accident/salvage keyword fired (the hard penalty case).
    pub fn has_hard_flag(&self) -> bool {
        self.flags.contains_key("accident") || self.flags.contains_key("salvage")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Score {
    pub listing_id: String,
    pub score: f64,
    pub price_score: f64,
    pub risk_penalty: f64,
    pub freshness: f64,
    pub liquidity: f64,
    pub reasons: Vec<String>,
    pub state: ScoreState,
    pub scored_at: i64,
}

#[derive(Debug, Clone)]
pub struct ChannelPost {
    pub channel: String,
    pub listing_id: String,
    pub message_id: i64,
    pub posted_at: i64,
    pub last_price_bgn_cents: i64,
}

#[derive(Debug, Clone)]
pub struct User {
    pub id: String,
    pub telegram_user_id: i64,
    pub plan_id: String,
    pub status: String,
}

#[derive(Debug, Clone)]
pub struct Plan {
    pub id: String,
    pub name: PlanName,
    pub max_alerts: i64,
    pub notification_delay_secs: i64,
    /// None = unlimited.
    pub daily_cap: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct Alert {
    pub id: String,
    pub user_id: String,
    pub dsl_query: String,
    pub filters: crate::alerts::dsl::AlertFilters,
    pub active: bool,
    pub created_at: i64,
}

#[derive(Debug, Clone)]
pub struct AlertMatch {
    pub id: String,
    pub alert_id: String,
    pub listing_id: String,
    pub matched_at: i64,
    pub deliver_after: i64,
    pub notified_at: Option<i64>,
    pub status: MatchStatus,
}

pub fn cents_to_bgn(cents: i64) -> f64 {
    cents as f64 / 100.0
}

pub fn bgn_to_cents(bgn: f64) -> i64 {
    (bgn * 100.0).round() as i64
}

pub fn now_ts() -> i64 {
    Utc::now().timestamp()
}

pub fn ts_to_datetime(ts: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(ts, 0).unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enum_round_trips() {
        for f in [
            Fuel::Petrol,
            Fuel::Diesel,
            Fuel::Hybrid,
            Fuel::Electric,
            Fuel::Lpg,
            Fuel::Cng,
            Fuel::Other,
        ] {
            assert_eq!(Fuel::parse(f.as_str()), Some(f));
        }
        assert_eq!(Gearbox::parse("semi_auto"), Some(Gearbox::SemiAuto));
        assert_eq!(RiskLevel::parse("purple"), None);
    }

    #[test]
    fn money_round_trip() {
        assert_eq!(bgn_to_cents(28500.0), 2_850_000);
        assert!((cents_to_bgn(2_850_000) - 28500.0).abs() < f64::EPSILON);
        assert_eq!(bgn_to_cents(0.015), 2); // rounds, does not truncate
    }
}
