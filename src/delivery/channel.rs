//! Channel delivery: rate-limited, diversity-filtered, idempotent posts.
//!
//! One live `(channel, listing)` job at a time — the queue's live-job index
//! plus the lease serialize create/edit per key — and the `ChannelPost`
//! primary key backstops double-creates. A price change on an already
//! posted listing becomes an edit of the original message, never a repost.

use anyhow::Result;
use tracing::{info, warn};

use super::transport::SendError;
use super::compose_caption;
use crate::models::{now_ts, ChannelPost};
use crate::pipeline::AppState;
use crate::queue::StageOutcome;

pub async fn run(state: &AppState, listing_id: &str) -> Result<StageOutcome> {
    let Some(listing) = state.store.get_listing(listing_id)? else {
        return Ok(StageOutcome::Skip(format!("unknown listing {listing_id}")));
    };
    let Some(price_cents) = listing.price_bgn_cents else {
        return Ok(StageOutcome::Skip("listing has no BGN price".into()));
    };
    let channel = state.config.channel.clone();

    // bucket first: edits and posts share the channel budget
    let capacity = state.config.channel_post_rate as f64;
    let refill = capacity / 3600.0;
    match state
        .store
        .take_token(&format!("channel:{channel}"), capacity, refill)?
    {
        crate::ratelimit::TokenTake::Taken => {}
        crate::ratelimit::TokenTake::Empty { retry_after_secs } => {
            return Ok(StageOutcome::Retry(format!(
                "channel bucket empty, retry in {retry_after_secs}s"
            )));
        }
    }

    let comp = state.store.get_comp_cache(listing_id)?;
    let score = state.store.get_score(listing_id)?;
    let caption = compose_caption(
        &listing,
        comp.as_ref().and_then(|c| c.predicted_cents),
        score.as_ref().map(|s| s.score),
    );

    if let Some(existing) = state.store.get_channel_post(&channel, listing_id)? {
        if existing.last_price_bgn_cents == price_cents {
            return Ok(StageOutcome::Skip("already posted at this price".into()));
        }
        return match state
            .messenger
            .edit_message(&channel, existing.message_id, &caption)
            .await
        {
            Ok(()) => {
                state
                    .store
                    .update_channel_post_price(&channel, listing_id, price_cents)?;
                info!(listing_id, channel = %channel, "Channel post price updated");
                Ok(StageOutcome::Done)
            }
            Err(e) => Ok(settle_send_error(state, &channel, e, "edit")),
        };
    }

    // diversity: cap posts per (brand, model) per rolling window
    if let (Some(brand), Some(model)) = (&listing.brand_id, &listing.model_id) {
        let since = now_ts() - state.config.diversity_window_h * 3600;
        let recent = state
            .store
            .diversity_count(&channel, brand, model, since)?;
        if recent >= state.config.diversity_cap_per_model {
            return Ok(StageOutcome::Skip(format!(
                "diversity cap reached for {brand}/{model}"
            )));
        }
    }

    let images = state.store.listing_image_urls(listing_id)?;
    match state
        .messenger
        .send_media_group(&channel, &images, &caption, &[])
        .await
    {
        Ok(message_id) => {
            state.store.insert_channel_post(&ChannelPost {
                channel: channel.clone(),
                listing_id: listing_id.to_string(),
                message_id,
                posted_at: now_ts(),
                last_price_bgn_cents: price_cents,
            })?;
            info!(listing_id, channel = %channel, message_id, "Posted to channel");
            Ok(StageOutcome::Done)
        }
        Err(e) => Ok(settle_send_error(state, &channel, e, "post")),
    }
}

fn settle_send_error(
    state: &AppState,
    channel: &str,
    err: SendError,
    action: &str,
) -> StageOutcome {
    match err {
        SendError::RateLimited { retry_after_secs } => {
            // the transport's accounting beats ours
            let _ = state
                .store
                .penalize_bucket(&format!("channel:{channel}"), retry_after_secs);
            StageOutcome::Retry(format!("transport rate limited ({retry_after_secs}s)"))
        }
        SendError::Transient(msg) => StageOutcome::Retry(format!("transient {action}: {msg}")),
        SendError::InvalidRecipient => {
            warn!(channel, "Channel unreachable, skipping");
            StageOutcome::Skip("invalid channel recipient".into())
        }
        SendError::Permanent(msg) => {
            warn!(channel, action, error = %msg, "Permanent delivery failure, skipping");
            StageOutcome::Skip(format!("permanent {action} failure: {msg}"))
        }
    }
}
