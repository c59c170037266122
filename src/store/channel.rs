//! Channel post bookkeeping: one row per `(channel, listing)`, edits update
//! the price in place, and the diversity window counts recent posts per
//! brand/model.

use anyhow::Result;
use rusqlite::{params, OptionalExtension};

use super::Store;
use crate::models::ChannelPost;

impl Store {
    pub fn get_channel_post(&self, channel: &str, listing_id: &str) -> Result<Option<ChannelPost>> {
        self.with_conn(|c| {
            Ok(c.query_row(
                "SELECT channel, listing_id, message_id, posted_at, last_price_bgn_cents
                 FROM channel_posts WHERE channel = ?1 AND listing_id = ?2",
                params![channel, listing_id],
                |r| {
                    Ok(ChannelPost {
                        channel: r.get(0)?,
                        listing_id: r.get(1)?,
                        message_id: r.get(2)?,
                        posted_at: r.get(3)?,
                        last_price_bgn_cents: r.get(4)?,
                    })
                },
            )
            .optional()?)
        })
    }

    /// Insert the post row. The primary key makes a concurrent second create
    /// for the same `(channel, listing)` fail loudly rather than double-post.
    pub fn insert_channel_post(&self, post: &ChannelPost) -> Result<()> {
        self.with_conn(|c| {
            c.execute(
                "INSERT INTO channel_posts
                 (channel, listing_id, message_id, posted_at, last_price_bgn_cents)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    post.channel,
                    post.listing_id,
                    post.message_id,
                    post.posted_at,
                    post.last_price_bgn_cents
                ],
            )?;
            Ok(())
        })
    }

    pub fn update_channel_post_price(
        &self,
        channel: &str,
        listing_id: &str,
        price_bgn_cents: i64,
    ) -> Result<()> {
        self.with_conn(|c| {
            c.execute(
                "UPDATE channel_posts SET last_price_bgn_cents = ?3
                 WHERE channel = ?1 AND listing_id = ?2",
                params![channel, listing_id, price_bgn_cents],
            )?;
            Ok(())
        })
    }

    /// Posts for the same brand/model in this channel since `since_ts`.
    pub fn diversity_count(
        &self,
        channel: &str,
        brand_id: &str,
        model_id: &str,
        since_ts: i64,
    ) -> Result<i64> {
        self.with_conn(|c| {
            Ok(c.query_row(
                "SELECT COUNT(*) FROM channel_posts cp
                 JOIN listings l ON l.id = cp.listing_id
                 WHERE cp.channel = ?1 AND cp.posted_at >= ?2
                   AND l.brand_id = ?3 AND l.model_id = ?4",
                params![channel, since_ts, brand_id, model_id],
                |r| r.get(0),
            )?)
        })
    }
}
