//! Dedupe signature persistence, candidate lookup, and duplicate marking.
//!
//! The trigram inverted index lives here as a plain table: one row per
//! (trigram, listing) so candidate lookup is an IN query plus a GROUP BY,
//! cheap enough at classifieds volume.

use anyhow::Result;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};

use super::listings::{row_to_listing, LISTING_COLS};
use super::Store;
use crate::models::{now_ts, DedupeMethod, Listing};
use crate::queue::{self, Stage};

/// Signature computed for a listing before candidate matching.
#[derive(Debug, Clone, Default)]
pub struct Signature {
    /// Sorted, space-joined title trigrams.
    pub title_trgm: String,
    /// 64 minhash buckets over description shingles, little-endian u64s.
    pub desc_minhash: Option<Vec<u8>>,
    pub image_hash: Option<u64>,
    /// f32 little-endian vector, when an embedding backend populated one.
    pub embedding: Option<Vec<u8>>,
}

impl Store {
    /// Persist the signature and index rows, clear the duplicate flag, and
    /// enqueue the price stage — one transaction, so the listing becomes
    /// matchable for future arrivals exactly when it survives dedupe.
    pub fn finish_dedupe_unique(&self, listing_id: &str, sig: &Signature) -> Result<()> {
        self.with_tx(|tx| {
            save_signature(tx, listing_id, sig)?;
            tx.execute(
                "UPDATE listings SET is_duplicate = 0, canonical_of = NULL WHERE id = ?1",
                params![listing_id],
            )?;
            queue::enqueue(tx, Stage::Price, listing_id, now_ts())?;
            Ok(())
        })
    }

    /// Mark a listing duplicate of `canonical_of` and log the decision.
    /// Signature rows still persist so transitive matches resolve, but the
    /// listing does not advance.
    pub fn finish_dedupe_duplicate(
        &self,
        listing_id: &str,
        canonical_of: &str,
        method: DedupeMethod,
        confidence: f64,
        sig: &Signature,
    ) -> Result<()> {
        self.with_tx(|tx| {
            save_signature(tx, listing_id, sig)?;
            tx.execute(
                "UPDATE listings SET is_duplicate = 1, canonical_of = ?2 WHERE id = ?1",
                params![listing_id, canonical_of],
            )?;
            tx.execute(
                "INSERT INTO duplicate_log (listing_id, duplicate_of, method, confidence, decided_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![listing_id, canonical_of, method.as_str(), confidence, now_ts()],
            )?;
            Ok(())
        })
    }

    /// Re-point an old canonical at a newer root (the rare out-of-order case
    /// where a later-arriving listing carries an earlier `first_seen`).
    pub fn repoint_canonical(
        &self,
        old_root: &str,
        new_root: &str,
        method: DedupeMethod,
        confidence: f64,
    ) -> Result<()> {
        self.with_tx(|tx| {
            tx.execute(
                "UPDATE listings SET is_duplicate = 1, canonical_of = ?2 WHERE id = ?1",
                params![old_root, new_root],
            )?;
            tx.execute(
                "INSERT INTO duplicate_log (listing_id, duplicate_of, method, confidence, decided_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![old_root, new_root, method.as_str(), confidence, now_ts()],
            )?;
            Ok(())
        })
    }

    /// Follow `canonical_of` pointers to the root, compressing the path on
    /// the way. Chains deeper than one hop should not occur, but the
    /// reconciliation is cheap.
    pub fn canonical_root(&self, listing_id: &str) -> Result<String> {
        let mut current = listing_id.to_string();
        let mut hops = 0;
        loop {
            let next: Option<Option<String>> = self.with_conn(|c| {
                Ok(c.query_row(
                    "SELECT canonical_of FROM listings WHERE id = ?1 AND is_duplicate = 1",
                    params![current],
                    |r| r.get(0),
                )
                .optional()?)
            })?;
            match next.flatten() {
                Some(parent) if hops < 16 => {
                    hops += 1;
                    current = parent;
                }
                _ => break,
            }
        }
        if hops > 1 {
            // compress: point the starting listing straight at the root
            self.with_conn(|c| {
                c.execute(
                    "UPDATE listings SET canonical_of = ?2 WHERE id = ?1 AND is_duplicate = 1",
                    params![listing_id, current],
                )?;
                Ok(())
            })?;
        }
        Ok(current)
    }

    /// Active non-duplicate listings by the same seller with the same
    /// brand/model. Price tolerance is applied by the caller.
    pub fn phone_candidates(&self, listing: &Listing) -> Result<Vec<Listing>> {
        let (Some(seller), Some(brand), Some(model)) =
            (&listing.seller_id, &listing.brand_id, &listing.model_id)
        else {
            return Ok(Vec::new());
        };
        self.with_conn(|c| {
            let mut stmt = c.prepare(&format!(
                "SELECT {LISTING_COLS} FROM listings
                 JOIN raw_listings ON raw_listings.id = listings.raw_id
                 WHERE listings.seller_id = ?1 AND listings.id != ?2
                   AND listings.brand_id = ?3 AND listings.model_id = ?4
                   AND listings.is_draft = 0 AND listings.is_duplicate = 0
                   AND raw_listings.is_active = 1"
            ))?;
            let rows = stmt
                .query_map(
                    params![seller, listing.id, brand, model],
                    row_to_listing,
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    /// `(listing_id, image_hash)` pairs for active non-duplicate listings
    /// with an image signature.
    pub fn image_candidates(&self, exclude_id: &str) -> Result<Vec<(String, u64)>> {
        self.with_conn(|c| {
            let mut stmt = c.prepare(
                "SELECT s.listing_id, s.image_hash FROM dedupe_signatures s
                 JOIN listings l ON l.id = s.listing_id
                 JOIN raw_listings r ON r.id = l.raw_id
                 WHERE s.image_hash IS NOT NULL AND s.listing_id != ?1
                   AND l.is_duplicate = 0 AND r.is_active = 1
                 LIMIT 10000",
            )?;
            let rows = stmt
                .query_map(params![exclude_id], |r| {
                    Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)? as u64))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    /// Candidates sharing at least `min_shared` title trigrams, most-shared
    /// first, with their stored trigram strings for exact similarity.
    pub fn trigram_candidates(
        &self,
        trigrams: &[String],
        exclude_id: &str,
        min_shared: usize,
        limit: usize,
    ) -> Result<Vec<(String, String)>> {
        if trigrams.is_empty() {
            return Ok(Vec::new());
        }
        self.with_conn(|c| {
            let placeholders = vec!["?"; trigrams.len()].join(",");
            let sql = format!(
                "SELECT t.listing_id, COUNT(*) AS shared FROM trigram_index t
                 JOIN listings l ON l.id = t.listing_id
                 JOIN raw_listings r ON r.id = l.raw_id
                 WHERE t.trgm IN ({placeholders}) AND t.listing_id != ?
                   AND l.is_duplicate = 0 AND r.is_active = 1
                 GROUP BY t.listing_id
                 HAVING shared >= ?
                 ORDER BY shared DESC
                 LIMIT ?"
            );
            let mut args: Vec<rusqlite::types::Value> = trigrams
                .iter()
                .map(|t| rusqlite::types::Value::Text(t.clone()))
                .collect();
            args.push(rusqlite::types::Value::Text(exclude_id.to_string()));
            args.push(rusqlite::types::Value::Integer(min_shared as i64));
            args.push(rusqlite::types::Value::Integer(limit as i64));

            let mut stmt = c.prepare(&sql)?;
            let ids = stmt
                .query_map(params_from_iter(args.iter()), |r| r.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            let mut out = Vec::with_capacity(ids.len());
            for id in ids {
                let trgm: Option<String> = c
                    .query_row(
                        "SELECT title_trgm FROM dedupe_signatures WHERE listing_id = ?1",
                        params![id],
                        |r| r.get(0),
                    )
                    .optional()?;
                if let Some(trgm) = trgm {
                    out.push((id, trgm));
                }
            }
            Ok(out)
        })
    }

    /// Embedding vectors for active non-duplicate listings of the same
    /// brand/model.
    pub fn embedding_candidates(
        &self,
        brand_id: &str,
        model_id: &str,
        exclude_id: &str,
    ) -> Result<Vec<(String, Vec<u8>)>> {
        self.with_conn(|c| {
            let mut stmt = c.prepare(
                "SELECT s.listing_id, s.embedding FROM dedupe_signatures s
                 JOIN listings l ON l.id = s.listing_id
                 JOIN raw_listings r ON r.id = l.raw_id
                 WHERE s.embedding IS NOT NULL AND s.listing_id != ?1
                   AND l.brand_id = ?2 AND l.model_id = ?3
                   AND l.is_duplicate = 0 AND r.is_active = 1
                 LIMIT 2000",
            )?;
            let rows = stmt
                .query_map(params![exclude_id, brand_id, model_id], |r| {
                    Ok((r.get::<_, String>(0)?, r.get::<_, Vec<u8>>(1)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    pub fn duplicate_log_for(&self, listing_id: &str) -> Result<Vec<(String, String, f64)>> {
        self.with_conn(|c| {
            let mut stmt = c.prepare(
                "SELECT duplicate_of, method, confidence FROM duplicate_log
                 WHERE listing_id = ?1 ORDER BY decided_at",
            )?;
            let rows = stmt
                .query_map(params![listing_id], |r| {
                    Ok((r.get(0)?, r.get(1)?, r.get(2)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }
}

fn save_signature(c: &Connection, listing_id: &str, sig: &Signature) -> Result<()> {
    c.execute(
        "INSERT INTO dedupe_signatures (listing_id, title_trgm, desc_minhash, image_hash, embedding)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(listing_id) DO UPDATE SET
             title_trgm = excluded.title_trgm,
             desc_minhash = excluded.desc_minhash,
             image_hash = excluded.image_hash,
             embedding = excluded.embedding",
        params![
            listing_id,
            sig.title_trgm,
            sig.desc_minhash,
            sig.image_hash.map(|h| h as i64),
            sig.embedding
        ],
    )?;
    c.execute(
        "DELETE FROM trigram_index WHERE listing_id = ?1",
        params![listing_id],
    )?;
    for trgm in sig.title_trgm.split_whitespace() {
        c.execute(
            "INSERT OR IGNORE INTO trigram_index (trgm, listing_id) VALUES (?1, ?2)",
            params![trgm, listing_id],
        )?;
    }
    Ok(())
}
