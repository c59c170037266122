//! Raw and normalized listing persistence, sellers, images, price history,
//! sources, and scheduler tick claims.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use super::Store;
use crate::models::{
    now_ts, Body, Fuel, Gearbox, Listing, ListingDraft, RawListing, RawRecord, Source,
};
use crate::queue::{self, Stage};

/// Result of observing a scraped record.
#[derive(Debug, Clone)]
pub struct Observation {
    pub raw_id: String,
    pub is_new: bool,
    pub content_changed: bool,
}

/// Canonical fields produced by the normalize stage.
#[derive(Debug, Clone, Default)]
pub struct NormalizedFields {
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
    pub description_hash: Option<String>,
    pub features: Vec<String>,
    pub is_draft: bool,
    pub seller_phone_hash: Option<String>,
    pub seller_profile_url: Option<String>,
    pub image_urls: Vec<String>,
}

fn row_to_raw(row: &Row) -> rusqlite::Result<RawListing> {
    Ok(RawListing {
        id: row.get(0)?,
        source_id: row.get(1)?,
        site_ad_id: row.get(2)?,
        url: row.get(3)?,
        raw_blob_key: row.get(4)?,
        content_hash: row.get(5)?,
        http_status: row.get(6)?,
        first_seen: row.get(7)?,
        last_seen: row.get(8)?,
        is_active: row.get::<_, i64>(9)? != 0,
        version: row.get(10)?,
        parse_errors: row.get(11)?,
    })
}

const RAW_COLS: &str = "id, source_id, site_ad_id, url, raw_blob_key, content_hash, http_status, \
                        first_seen, last_seen, is_active, version, parse_errors";

pub(crate) fn row_to_listing(row: &Row) -> rusqlite::Result<Listing> {
    let features: String = row.get(17)?;
    Ok(Listing {
        id: row.get(0)?,
        raw_id: row.get(1)?,
        brand_id: row.get(2)?,
        model_id: row.get(3)?,
        year: row.get(4)?,
        mileage_km: row.get(5)?,
        power_hp: row.get(6)?,
        fuel: row.get::<_, Option<String>>(7)?.as_deref().and_then(Fuel::parse),
        gearbox: row
            .get::<_, Option<String>>(8)?
            .as_deref()
            .and_then(Gearbox::parse),
        body: row.get::<_, Option<String>>(9)?.as_deref().and_then(Body::parse),
        price_cents: row.get(10)?,
        currency: row.get(11)?,
        price_bgn_cents: row.get(12)?,
        region: row.get(13)?,
        title: row.get(14)?,
        description: row.get(15)?,
        description_hash: row.get(16)?,
        features: serde_json::from_str(&features).unwrap_or_default(),
        first_image_hash: row.get::<_, Option<i64>>(18)?.map(|v| v as u64),
        seller_id: row.get(19)?,
        version: row.get(20)?,
        is_draft: row.get::<_, i64>(21)? != 0,
        is_duplicate: row.get::<_, i64>(22)? != 0,
        canonical_of: row.get(23)?,
        first_seen: row.get(24)?,
    })
}

pub(crate) const LISTING_COLS: &str =
    "id, raw_id, brand_id, model_id, year, mileage_km, power_hp, fuel, gearbox, body, \
     price_cents, currency, price_bgn_cents, region, title, description, description_hash, \
     features, first_image_hash, seller_id, version, is_draft, is_duplicate, canonical_of, \
     first_seen";

impl Store {
    // ---- sources -------------------------------------------------------

    pub fn upsert_source(&self, source: &Source) -> Result<()> {
        self.with_conn(|c| {
            c.execute(
                "INSERT INTO sources (id, name, base_url, enabled, crawl_interval_secs)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                     name = excluded.name,
                     base_url = excluded.base_url,
                     enabled = excluded.enabled,
                     crawl_interval_secs = excluded.crawl_interval_secs",
                params![
                    source.id,
                    source.name,
                    source.base_url,
                    source.enabled as i64,
                    source.crawl_interval_secs
                ],
            )?;
            Ok(())
        })
    }

    pub fn enabled_sources(&self) -> Result<Vec<Source>> {
        self.with_conn(|c| {
            let mut stmt = c.prepare(
                "SELECT id, name, base_url, enabled, crawl_interval_secs
                 FROM sources WHERE enabled = 1",
            )?;
            let rows = stmt
                .query_map([], |r| {
                    Ok(Source {
                        id: r.get(0)?,
                        name: r.get(1)?,
                        base_url: r.get(2)?,
                        enabled: r.get::<_, i64>(3)? != 0,
                        crawl_interval_secs: r.get(4)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    /// Claim a scheduler tick. Returns false when this `(source, bucket)` was
    /// already processed, making tick replays no-ops.
    pub fn try_claim_tick(&self, source_id: &str, tick_bucket: i64) -> Result<bool> {
        self.with_conn(|c| {
            let n = c.execute(
                "INSERT OR IGNORE INTO scrape_ticks (source_id, tick_bucket, ticked_at)
                 VALUES (?1, ?2, ?3)",
                params![source_id, tick_bucket, now_ts()],
            )?;
            Ok(n > 0)
        })
    }

    // ---- raw listings --------------------------------------------------

    /// Upsert a scraped record and enqueue parse when the content is new or
    /// changed, atomically.
    pub fn observe_record(&self, rec: &RawRecord, http_status: Option<i64>) -> Result<Observation> {
        self.with_tx(|tx| {
            let existing: Option<(String, String)> = tx
                .query_row(
                    "SELECT id, content_hash FROM raw_listings
                     WHERE source_id = ?1 AND site_ad_id = ?2",
                    params![rec.source_id, rec.site_ad_id],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
                .optional()?;

            match existing {
                None => {
                    let raw_id = Uuid::new_v4().to_string();
                    tx.execute(
                        "INSERT INTO raw_listings
                         (id, source_id, site_ad_id, url, raw_blob_key, content_hash,
                          http_status, first_seen, last_seen, is_active, version)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8, 1, 1)",
                        params![
                            raw_id,
                            rec.source_id,
                            rec.site_ad_id,
                            rec.url,
                            rec.raw_blob_key,
                            rec.content_hash,
                            http_status,
                            rec.observed_at
                        ],
                    )?;
                    queue::enqueue(tx, Stage::Parse, &raw_id, rec.observed_at)?;
                    Ok(Observation {
                        raw_id,
                        is_new: true,
                        content_changed: true,
                    })
                }
                Some((raw_id, old_hash)) => {
                    let changed = old_hash != rec.content_hash;
                    if changed {
                        tx.execute(
                            "UPDATE raw_listings
                             SET last_seen = ?2, raw_blob_key = ?3, content_hash = ?4,
                                 http_status = ?5, version = version + 1, is_active = 1,
                                 parse_errors = 0
                             WHERE id = ?1",
                            params![raw_id, rec.observed_at, rec.raw_blob_key, rec.content_hash, http_status],
                        )?;
                        queue::enqueue(tx, Stage::Parse, &raw_id, rec.observed_at)?;
                    } else {
                        tx.execute(
                            "UPDATE raw_listings SET last_seen = ?2, http_status = ?3 WHERE id = ?1",
                            params![raw_id, rec.observed_at, http_status],
                        )?;
                    }
                    Ok(Observation {
                        raw_id,
                        is_new: false,
                        content_changed: changed,
                    })
                }
            }
        })
    }

    pub fn get_raw_listing(&self, raw_id: &str) -> Result<Option<RawListing>> {
        self.with_conn(|c| {
            Ok(c.query_row(
                &format!("SELECT {RAW_COLS} FROM raw_listings WHERE id = ?1"),
                params![raw_id],
                row_to_raw,
            )
            .optional()?)
        })
    }

    /// Count a parse failure; `max_consecutive` failures deactivate the raw
    /// listing until a new scrape changes its content.
    pub fn record_parse_error(&self, raw_id: &str, max_consecutive: i64) -> Result<bool> {
        self.with_conn(|c| {
            c.execute(
                "UPDATE raw_listings SET parse_errors = parse_errors + 1 WHERE id = ?1",
                params![raw_id],
            )?;
            let errors: i64 = c.query_row(
                "SELECT parse_errors FROM raw_listings WHERE id = ?1",
                params![raw_id],
                |r| r.get(0),
            )?;
            if errors >= max_consecutive {
                c.execute(
                    "UPDATE raw_listings SET is_active = 0 WHERE id = ?1",
                    params![raw_id],
                )?;
                return Ok(true);
            }
            Ok(false)
        })
    }

    // ---- normalized listings -------------------------------------------

    /// Persist the parse output as a draft listing and enqueue normalize.
    /// One listing per raw id; a re-parse generation replaces the draft and
    /// resets normalization state.
    pub fn save_parsed_draft(&self, raw: &RawListing, draft: &ListingDraft) -> Result<String> {
        let draft_json = serde_json::to_string(draft).context("serialize draft")?;
        self.with_tx(|tx| {
            let existing: Option<String> = tx
                .query_row(
                    "SELECT id FROM listings WHERE raw_id = ?1",
                    params![raw.id],
                    |r| r.get(0),
                )
                .optional()?;
            let listing_id = existing.unwrap_or_else(|| Uuid::new_v4().to_string());

            tx.execute(
                "INSERT INTO listings
                 (id, raw_id, title, description, draft_json, version, is_draft,
                  is_duplicate, canonical_of, first_seen, first_image_hash)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, 0, NULL, ?7, ?8)
                 ON CONFLICT(raw_id) DO UPDATE SET
                     title = excluded.title,
                     description = excluded.description,
                     draft_json = excluded.draft_json,
                     version = excluded.version,
                     is_draft = 1,
                     first_image_hash = excluded.first_image_hash",
                params![
                    listing_id,
                    raw.id,
                    draft.title,
                    draft.description,
                    draft_json,
                    raw.version,
                    raw.first_seen,
                    draft.first_image_hash.map(|h| h as i64),
                ],
            )?;
            queue::enqueue(tx, Stage::Normalize, &listing_id, now_ts())?;
            Ok(listing_id)
        })
    }

    pub fn get_listing(&self, listing_id: &str) -> Result<Option<Listing>> {
        self.with_conn(|c| {
            Ok(c.query_row(
                &format!("SELECT {LISTING_COLS} FROM listings WHERE id = ?1"),
                params![listing_id],
                row_to_listing,
            )
            .optional()?)
        })
    }

    pub fn get_listing_draft(&self, listing_id: &str) -> Result<Option<ListingDraft>> {
        self.with_conn(|c| {
            let json: Option<Option<String>> = c
                .query_row(
                    "SELECT draft_json FROM listings WHERE id = ?1",
                    params![listing_id],
                    |r| r.get(0),
                )
                .optional()?;
            Ok(json
                .flatten()
                .and_then(|j| serde_json::from_str(&j).ok()))
        })
    }

    /// Write the normalization result: canonical fields, seller, images,
    /// price history, and the dedupe job for non-drafts — one transaction.
    pub fn finish_normalize(&self, listing_id: &str, f: &NormalizedFields) -> Result<()> {
        self.with_tx(|tx| {
            let seller_id = match &f.seller_phone_hash {
                Some(hash) => Some(Store::upsert_seller_tx(
                    tx,
                    hash,
                    f.seller_profile_url.as_deref(),
                )?),
                None => None,
            };
            tx.execute(
                "UPDATE listings SET
                     brand_id = ?2, model_id = ?3, year = ?4, mileage_km = ?5, power_hp = ?6,
                     fuel = ?7, gearbox = ?8, body = ?9, price_cents = ?10, currency = ?11,
                     price_bgn_cents = ?12, region = ?13, description_hash = ?14,
                     features = ?15, seller_id = ?16, is_draft = ?17
                 WHERE id = ?1",
                params![
                    listing_id,
                    f.brand_id,
                    f.model_id,
                    f.year,
                    f.mileage_km,
                    f.power_hp,
                    f.fuel.map(|v| v.as_str()),
                    f.gearbox.map(|v| v.as_str()),
                    f.body.map(|v| v.as_str()),
                    f.price_cents,
                    f.currency,
                    f.price_bgn_cents,
                    f.region,
                    f.description_hash,
                    serde_json::to_string(&f.features).unwrap_or_else(|_| "[]".into()),
                    seller_id,
                    f.is_draft as i64,
                ],
            )?;
            Store::replace_images_tx(tx, listing_id, &f.image_urls)?;
            if let Some(cents) = f.price_bgn_cents {
                Store::append_price_if_changed_tx(tx, listing_id, cents, now_ts())?;
            }
            if !f.is_draft {
                queue::enqueue(tx, Stage::Dedupe, listing_id, now_ts())?;
            }
            Ok(())
        })
    }

    // ---- sellers -------------------------------------------------------

    pub(crate) fn upsert_seller_tx(
        c: &Connection,
        phone_hash: &str,
        profile_url: Option<&str>,
    ) -> Result<String> {
        let existing: Option<String> = c
            .query_row(
                "SELECT id FROM sellers WHERE phone_hash = ?1",
                params![phone_hash],
                |r| r.get(0),
            )
            .optional()?;
        match existing {
            Some(id) => {
                c.execute(
                    "UPDATE sellers SET contact_count = contact_count + 1,
                            profile_url = COALESCE(?2, profile_url)
                     WHERE id = ?1",
                    params![id, profile_url],
                )?;
                Ok(id)
            }
            None => {
                let id = Uuid::new_v4().to_string();
                c.execute(
                    "INSERT INTO sellers (id, phone_hash, profile_url, contact_count, blacklisted)
                     VALUES (?1, ?2, ?3, 1, 0)",
                    params![id, phone_hash, profile_url],
                )?;
                Ok(id)
            }
        }
    }

    pub fn seller_blacklisted(&self, seller_id: &str) -> Result<bool> {
        self.with_conn(|c| {
            let flag: Option<i64> = c
                .query_row(
                    "SELECT blacklisted FROM sellers WHERE id = ?1",
                    params![seller_id],
                    |r| r.get(0),
                )
                .optional()?;
            Ok(flag.unwrap_or(0) != 0)
        })
    }

    pub fn set_seller_blacklisted(&self, phone_hash: &str, blacklisted: bool) -> Result<()> {
        self.with_conn(|c| {
            c.execute(
                "UPDATE sellers SET blacklisted = ?2 WHERE phone_hash = ?1",
                params![phone_hash, blacklisted as i64],
            )?;
            Ok(())
        })
    }

    // ---- images --------------------------------------------------------

    pub(crate) fn replace_images_tx(
        c: &Connection,
        listing_id: &str,
        urls: &[String],
    ) -> Result<()> {
        c.execute(
            "DELETE FROM images WHERE listing_id = ?1",
            params![listing_id],
        )?;
        for (idx, url) in urls.iter().take(5).enumerate() {
            c.execute(
                "INSERT INTO images (id, listing_id, url, idx) VALUES (?1, ?2, ?3, ?4)",
                params![Uuid::new_v4().to_string(), listing_id, url, idx as i64],
            )?;
        }
        Ok(())
    }

    pub fn listing_image_urls(&self, listing_id: &str) -> Result<Vec<String>> {
        self.with_conn(|c| {
            let mut stmt =
                c.prepare("SELECT url FROM images WHERE listing_id = ?1 ORDER BY idx LIMIT 5")?;
            let urls = stmt
                .query_map(params![listing_id], |r| r.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            Ok(urls)
        })
    }

    // ---- price history -------------------------------------------------

    pub(crate) fn append_price_if_changed_tx(
        c: &Connection,
        listing_id: &str,
        price_bgn_cents: i64,
        seen_at: i64,
    ) -> Result<bool> {
        let last: Option<i64> = c
            .query_row(
                "SELECT price_bgn_cents FROM price_history
                 WHERE listing_id = ?1 ORDER BY seen_at DESC, rowid DESC LIMIT 1",
                params![listing_id],
                |r| r.get(0),
            )
            .optional()?;
        if last == Some(price_bgn_cents) {
            return Ok(false);
        }
        c.execute(
            "INSERT INTO price_history (listing_id, price_bgn_cents, seen_at)
             VALUES (?1, ?2, ?3)",
            params![listing_id, price_bgn_cents, seen_at],
        )?;
        Ok(true)
    }

    pub fn price_history(&self, listing_id: &str) -> Result<Vec<(i64, i64)>> {
        self.with_conn(|c| {
            let mut stmt = c.prepare(
                "SELECT price_bgn_cents, seen_at FROM price_history
                 WHERE listing_id = ?1 ORDER BY seen_at",
            )?;
            let rows = stmt
                .query_map(params![listing_id], |r| Ok((r.get(0)?, r.get(1)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(site_ad_id: &str, hash: &str) -> RawRecord {
        RawRecord {
            source_id: "src-mobile".into(),
            site_ad_id: site_ad_id.into(),
            url: format!("https://m.example/{site_ad_id}"),
            raw_blob_key: format!("src-mobile/{site_ad_id}/1"),
            content_hash: hash.into(),
            observed_at: 1_700_000_000,
        }
    }

    #[test]
    fn observe_inserts_then_updates() {
        let store = Store::open_in_memory().unwrap();

        let first = store.observe_record(&record("M1", "h1"), Some(200)).unwrap();
        assert!(first.is_new);
        assert!(first.content_changed);

        // same content: bump last_seen only, no re-parse
        let again = store.observe_record(&record("M1", "h1"), Some(200)).unwrap();
        assert!(!again.is_new);
        assert!(!again.content_changed);
        assert_eq!(again.raw_id, first.raw_id);

        // changed content: version bump and re-parse
        let changed = store.observe_record(&record("M1", "h2"), Some(200)).unwrap();
        assert!(changed.content_changed);
        let raw = store.get_raw_listing(&first.raw_id).unwrap().unwrap();
        assert_eq!(raw.version, 2);
    }

    #[test]
    fn parse_errors_deactivate_after_budget() {
        let store = Store::open_in_memory().unwrap();
        let obs = store.observe_record(&record("M2", "h1"), None).unwrap();
        assert!(!store.record_parse_error(&obs.raw_id, 3).unwrap());
        assert!(!store.record_parse_error(&obs.raw_id, 3).unwrap());
        assert!(store.record_parse_error(&obs.raw_id, 3).unwrap());
        let raw = store.get_raw_listing(&obs.raw_id).unwrap().unwrap();
        assert!(!raw.is_active);
    }

    #[test]
    fn tick_claims_are_idempotent() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.try_claim_tick("src-mobile", 1234).unwrap());
        assert!(!store.try_claim_tick("src-mobile", 1234).unwrap());
        assert!(store.try_claim_tick("src-mobile", 1235).unwrap());
    }

    #[test]
    fn price_history_appends_only_on_change() {
        let store = Store::open_in_memory().unwrap();
        store
            .with_tx(|tx| {
                assert!(Store::append_price_if_changed_tx(tx, "L1", 2_850_000, 100)?);
                assert!(!Store::append_price_if_changed_tx(tx, "L1", 2_850_000, 200)?);
                assert!(Store::append_price_if_changed_tx(tx, "L1", 2_250_000, 300)?);
                Ok(())
            })
            .unwrap();
        assert_eq!(store.price_history("L1").unwrap().len(), 2);
    }
}
