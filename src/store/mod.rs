//! SQLite-backed state store.
//!
//! Single source of truth for every pipeline entity plus the durable work
//! queue, so a stage can persist its results and enqueue the next stage in
//! one transaction. WAL mode keeps readers off the writers' backs.

pub mod alerts;
pub mod channel;
pub mod dedupe;
pub mod fx;
pub mod listings;
pub mod pricing;
pub mod risk;
pub mod scoring;

pub use fx::{fx_day, FALLBACK_RATES};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{Connection, Transaction};
use std::sync::Arc;
use tracing::info;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS sources (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    base_url TEXT NOT NULL,
    enabled INTEGER NOT NULL DEFAULT 1,
    crawl_interval_secs INTEGER NOT NULL DEFAULT 300
);

CREATE TABLE IF NOT EXISTS raw_listings (
    id TEXT PRIMARY KEY,
    source_id TEXT NOT NULL,
    site_ad_id TEXT NOT NULL,
    url TEXT NOT NULL,
    raw_blob_key TEXT NOT NULL,
    content_hash TEXT NOT NULL DEFAULT '',
    http_status INTEGER,
    first_seen INTEGER NOT NULL,
    last_seen INTEGER NOT NULL,
    is_active INTEGER NOT NULL DEFAULT 1,
    version INTEGER NOT NULL DEFAULT 1,
    parse_errors INTEGER NOT NULL DEFAULT 0,
    UNIQUE(source_id, site_ad_id)
);

CREATE TABLE IF NOT EXISTS listings (
    id TEXT PRIMARY KEY,
    raw_id TEXT NOT NULL UNIQUE,
    brand_id TEXT,
    model_id TEXT,
    year INTEGER,
    mileage_km INTEGER,
    power_hp INTEGER,
    fuel TEXT,
    gearbox TEXT,
    body TEXT,
    price_cents INTEGER,
    currency TEXT,
    price_bgn_cents INTEGER,
    region TEXT,
    title TEXT,
    description TEXT,
    description_hash TEXT,
    features TEXT NOT NULL DEFAULT '[]',
    first_image_hash INTEGER,
    draft_json TEXT,
    seller_id TEXT,
    version INTEGER NOT NULL DEFAULT 1,
    is_draft INTEGER NOT NULL DEFAULT 1,
    is_duplicate INTEGER NOT NULL DEFAULT 0,
    canonical_of TEXT,
    first_seen INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_listings_brand_model_year ON listings(brand_id, model_id, year);
CREATE INDEX IF NOT EXISTS idx_listings_price ON listings(price_bgn_cents);
CREATE INDEX IF NOT EXISTS idx_listings_seller ON listings(seller_id);

CREATE TABLE IF NOT EXISTS brand_models (
    brand_id TEXT NOT NULL,
    model_id TEXT NOT NULL,
    aliases TEXT NOT NULL DEFAULT '[]',
    locale TEXT NOT NULL DEFAULT 'bg',
    active INTEGER NOT NULL DEFAULT 1,
    PRIMARY KEY (brand_id, model_id)
);

CREATE TABLE IF NOT EXISTS images (
    id TEXT PRIMARY KEY,
    listing_id TEXT NOT NULL,
    url TEXT NOT NULL,
    content_hash TEXT,
    width INTEGER,
    height INTEGER,
    idx INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_images_listing ON images(listing_id, idx);

CREATE TABLE IF NOT EXISTS sellers (
    id TEXT PRIMARY KEY,
    phone_hash TEXT NOT NULL UNIQUE,
    profile_url TEXT,
    contact_count INTEGER NOT NULL DEFAULT 0,
    blacklisted INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_sellers_blacklisted ON sellers(phone_hash) WHERE blacklisted = 1;

CREATE TABLE IF NOT EXISTS price_history (
    listing_id TEXT NOT NULL,
    price_bgn_cents INTEGER NOT NULL,
    seen_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_price_history_listing ON price_history(listing_id, seen_at DESC);

CREATE TABLE IF NOT EXISTS comp_cache (
    listing_id TEXT PRIMARY KEY,
    p10_cents INTEGER,
    p25_cents INTEGER,
    p50_cents INTEGER,
    p75_cents INTEGER,
    p90_cents INTEGER,
    predicted_cents INTEGER,
    discount_pct REAL,
    sample_size INTEGER NOT NULL DEFAULT 0,
    confidence REAL NOT NULL DEFAULT 0,
    computed_at INTEGER NOT NULL,
    model_version TEXT NOT NULL DEFAULT 'comps-v1'
);

CREATE TABLE IF NOT EXISTS risk_evaluations (
    listing_id TEXT PRIMARY KEY,
    flags TEXT NOT NULL DEFAULT '{}',
    risk_level TEXT NOT NULL,
    rule_confidence REAL NOT NULL,
    llm_summary TEXT,
    llm_reasons TEXT NOT NULL DEFAULT '[]',
    llm_confidence REAL,
    llm_unavailable INTEGER NOT NULL DEFAULT 0,
    evaluated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS scores (
    listing_id TEXT PRIMARY KEY,
    score REAL NOT NULL,
    price_score REAL NOT NULL,
    risk_penalty REAL NOT NULL,
    freshness REAL NOT NULL,
    liquidity REAL NOT NULL,
    reasons TEXT NOT NULL DEFAULT '[]',
    state TEXT NOT NULL DEFAULT 'draft',
    scored_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS dedupe_signatures (
    listing_id TEXT PRIMARY KEY,
    title_trgm TEXT NOT NULL DEFAULT '',
    desc_minhash BLOB,
    image_hash INTEGER,
    embedding BLOB
);

CREATE TABLE IF NOT EXISTS trigram_index (
    trgm TEXT NOT NULL,
    listing_id TEXT NOT NULL,
    PRIMARY KEY (trgm, listing_id)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS duplicate_log (
    listing_id TEXT NOT NULL,
    duplicate_of TEXT NOT NULL,
    method TEXT NOT NULL,
    confidence REAL NOT NULL,
    decided_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS users (
    id TEXT PRIMARY KEY,
    telegram_user_id INTEGER NOT NULL UNIQUE,
    plan_id TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'active',
    current_period_end INTEGER
);

CREATE TABLE IF NOT EXISTS plans (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    max_alerts INTEGER NOT NULL,
    notification_delay_secs INTEGER NOT NULL,
    daily_cap INTEGER
);

CREATE TABLE IF NOT EXISTS alerts (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    dsl_query TEXT NOT NULL,
    filters TEXT NOT NULL DEFAULT '{}',
    active INTEGER NOT NULL DEFAULT 1,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_alerts_user ON alerts(user_id);

CREATE TABLE IF NOT EXISTS alert_matches (
    id TEXT PRIMARY KEY,
    alert_id TEXT NOT NULL,
    listing_id TEXT NOT NULL,
    matched_at INTEGER NOT NULL,
    deliver_after INTEGER NOT NULL,
    notified_at INTEGER,
    status TEXT NOT NULL DEFAULT 'pending',
    UNIQUE(alert_id, listing_id)
);
CREATE INDEX IF NOT EXISTS idx_alert_matches_due ON alert_matches(status, deliver_after);

CREATE TABLE IF NOT EXISTS channel_posts (
    channel TEXT NOT NULL,
    listing_id TEXT NOT NULL,
    message_id INTEGER NOT NULL,
    posted_at INTEGER NOT NULL,
    last_price_bgn_cents INTEGER NOT NULL,
    PRIMARY KEY (channel, listing_id)
);
CREATE INDEX IF NOT EXISTS idx_channel_posts_time ON channel_posts(channel, posted_at DESC);

CREATE TABLE IF NOT EXISTS fx_rates (
    day TEXT NOT NULL,
    currency TEXT NOT NULL,
    rate_to_bgn REAL NOT NULL,
    PRIMARY KEY (day, currency)
);

CREATE TABLE IF NOT EXISTS scrape_ticks (
    source_id TEXT NOT NULL,
    tick_bucket INTEGER NOT NULL,
    ticked_at INTEGER NOT NULL,
    PRIMARY KEY (source_id, tick_bucket)
);

CREATE TABLE IF NOT EXISTS queue_jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    stage TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    run_at INTEGER NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'pending',
    lease_until INTEGER,
    last_error TEXT,
    created_at INTEGER NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_queue_live ON queue_jobs(stage, entity_id)
    WHERE status IN ('pending', 'leased');
CREATE INDEX IF NOT EXISTS idx_queue_due ON queue_jobs(status, run_at);

CREATE TABLE IF NOT EXISTS llm_cache (
    description_hash TEXT NOT NULL,
    prompt_version TEXT NOT NULL,
    response_json TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    PRIMARY KEY (description_hash, prompt_version)
);

CREATE TABLE IF NOT EXISTS rate_buckets (
    key TEXT PRIMARY KEY,
    tokens REAL NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS notify_counters (
    user_id TEXT NOT NULL,
    day TEXT NOT NULL,
    count INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (user_id, day)
);

CREATE TABLE IF NOT EXISTS quarantine (
    stage TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    attempts INTEGER NOT NULL,
    last_error TEXT,
    quarantined_at INTEGER NOT NULL,
    PRIMARY KEY (stage, entity_id)
);
"#;

#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("open database at {db_path}"))?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON").ok();
        conn.execute_batch(SCHEMA_SQL).context("apply schema")?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.seed_defaults()?;
        Ok(store)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory database")?;
        conn.execute_batch(SCHEMA_SQL).context("apply schema")?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.seed_defaults()?;
        Ok(store)
    }

    /// Run a closure against the connection.
    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock();
        f(&conn)
    }

    /// Run a closure inside an IMMEDIATE transaction. Commit on Ok, roll
    /// back on Err. Stage handlers use this so result persistence and the
    /// next-stage enqueue land atomically.
    pub fn with_tx<T>(&self, f: impl FnOnce(&Transaction) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        let out = f(&tx)?;
        tx.commit().context("commit transaction")?;
        Ok(out)
    }

    /// Seed plans, FX fallbacks, and the brand/model alias table on an empty
    /// database. Safe to call repeatedly.
    fn seed_defaults(&self) -> Result<()> {
        let conn = self.conn.lock();

        let plan_count: i64 = conn.query_row("SELECT COUNT(*) FROM plans", [], |r| r.get(0))?;
        if plan_count == 0 {
            conn.execute(
                "INSERT INTO plans (id, name, max_alerts, notification_delay_secs, daily_cap)
                 VALUES ('plan-free', 'free', 3, 1800, 10),
                        ('plan-premium', 'premium', 10, 0, 50),
                        ('plan-pro', 'pro', 50, 0, NULL)",
                [],
            )?;
            info!("Seeded subscription plans");
        }

        for (currency, rate) in fx::FALLBACK_RATES {
            conn.execute(
                "INSERT OR IGNORE INTO fx_rates (day, currency, rate_to_bgn)
                 VALUES ('fallback', ?1, ?2)",
                rusqlite::params![currency, rate],
            )?;
        }

        let bm_count: i64 =
            conn.query_row("SELECT COUNT(*) FROM brand_models", [], |r| r.get(0))?;
        if bm_count == 0 {
            for (brand, model, aliases) in SEED_BRAND_MODELS {
                conn.execute(
                    "INSERT INTO brand_models (brand_id, model_id, aliases, locale, active)
                     VALUES (?1, ?2, ?3, 'bg', 1)",
                    rusqlite::params![brand, model, aliases],
                )?;
            }
            info!(count = SEED_BRAND_MODELS.len(), "Seeded brand/model alias table");
        }

        Ok(())
    }
}

/// Starter alias table. Admin tooling grows this; the matcher re-reads it on
/// every normalize pass so draft listings pick up additions.
const SEED_BRAND_MODELS: &[(&str, &str, &str)] = &[
    ("bmw", "x5", r#"["bmw x5","х5","x 5"]"#),
    ("bmw", "x3", r#"["bmw x3","х3"]"#),
    ("bmw", "3-series", r#"["318","320","320d","325","330","335","тройка","3er","3 series"]"#),
    ("bmw", "5-series", r#"["520","520d","525","530","530d","535","петица","5er","5 series"]"#),
    ("vw", "golf", r#"["volkswagen golf","голф","golf 4","golf 5","golf 6","golf 7"]"#),
    ("vw", "passat", r#"["volkswagen passat","пасат"]"#),
    ("audi", "a4", r#"["ауди а4","а4"]"#),
    ("audi", "a6", r#"["ауди а6","а6"]"#),
    ("mercedes", "c-class", r#"["c180","c200","c220","с класа","c klasse","c-klasse"]"#),
    ("mercedes", "e-class", r#"["e200","e220","e320","е класа","e klasse","e-klasse"]"#),
    ("opel", "astra", r#"["опел астра","астра"]"#),
    ("opel", "corsa", r#"["опел корса","корса"]"#),
    ("toyota", "corolla", r#"["тойота корола","корола"]"#),
    ("toyota", "rav4", r#"["рав4","rav 4"]"#),
    ("ford", "focus", r#"["форд фокус","фокус"]"#),
    ("renault", "megane", r#"["рено меган","меган"]"#),
    ("peugeot", "308", r#"["пежо 308"]"#),
    ("skoda", "octavia", r#"["шкода октавия","октавия"]"#),
    ("honda", "civic", r#"["хонда сивик","сивик"]"#),
    ("nissan", "qashqai", r#"["нисан кашкай","кашкай"]"#),
];
