//! Notification dispatch: one queue job per alert match, fired at or after
//! the plan delay. Entitlement and alert state are re-checked at send time;
//! the delivered mark and the daily counter move in one transaction with
//! the send acknowledgment. Permanent failures settle as `failed` and are
//! never retried — users are not spammed with retries.

use anyhow::Result;
use tracing::{debug, info, warn};

use super::compose_caption;
use super::transport::SendError;
use crate::models::{now_ts, MatchStatus};
use crate::pipeline::AppState;
use crate::queue::StageOutcome;
use crate::ratelimit::TokenTake;

pub async fn run(state: &AppState, match_id: &str) -> Result<StageOutcome> {
    let Some((m, alert, user)) = state.store.match_context(match_id)? else {
        return Ok(StageOutcome::Skip(format!("unknown alert match {match_id}")));
    };
    if m.status != MatchStatus::Pending {
        return Ok(StageOutcome::Skip(format!(
            "match already {}",
            m.status.as_str()
        )));
    }

    let now = now_ts();
    if now < m.deliver_after {
        // the queue released us early; push back to the scheduled time
        return Ok(StageOutcome::Retry(format!(
            "plan delay not elapsed ({}s left)",
            m.deliver_after - now
        )));
    }

    // re-check everything that may have changed during the delay
    if !alert.active {
        state.store.settle_match(match_id, MatchStatus::Skipped)?;
        return Ok(StageOutcome::Skip("alert deactivated".into()));
    }
    let Some(entitlement) = state.store.entitlement(&user.id)? else {
        state.store.settle_match(match_id, MatchStatus::Skipped)?;
        return Ok(StageOutcome::Skip("no entitlement".into()));
    };
    if entitlement.status != "active" {
        state.store.settle_match(match_id, MatchStatus::Skipped)?;
        return Ok(StageOutcome::Skip("subscription not active".into()));
    }
    if let Some(cap) = entitlement.plan.daily_cap {
        if state.store.notify_count(&user.id, now)? >= cap {
            state.store.settle_match(match_id, MatchStatus::Skipped)?;
            debug!(user_id = %user.id, cap, "Daily cap reached at dispatch");
            return Ok(StageOutcome::Skip("daily cap reached".into()));
        }
    }

    let Some(listing) = state.store.get_listing(&m.listing_id)? else {
        state.store.settle_match(match_id, MatchStatus::Skipped)?;
        return Ok(StageOutcome::Skip("listing vanished".into()));
    };

    // transport-wide bucket, independent of the channel budget
    let capacity = state.config.notify_rate_per_min as f64;
    match state
        .store
        .take_token("notify:transport", capacity, capacity / 60.0)?
    {
        TokenTake::Taken => {}
        TokenTake::Empty { retry_after_secs } => {
            return Ok(StageOutcome::Retry(format!(
                "notify bucket empty, retry in {retry_after_secs}s"
            )));
        }
    }

    let comp = state.store.get_comp_cache(&m.listing_id)?;
    let score = state.store.get_score(&m.listing_id)?;
    let caption = format!(
        "🔔 Съвпадение за \"{}\"\n\n{}",
        alert.dsl_query,
        compose_caption(
            &listing,
            comp.as_ref().and_then(|c| c.predicted_cents),
            score.as_ref().map(|s| s.score),
        )
    );
    let images = state.store.listing_image_urls(&m.listing_id)?;
    let recipient = user.telegram_user_id.to_string();

    match state
        .messenger
        .send_media_group(&recipient, &images, &caption, &[])
        .await
    {
        Ok(_message_id) => {
            state.store.record_delivery(match_id, &user.id, now_ts())?;
            info!(match_id, user_id = %user.id, "Alert notification delivered");
            Ok(StageOutcome::Done)
        }
        Err(SendError::RateLimited { retry_after_secs }) => {
            let _ = state
                .store
                .penalize_bucket("notify:transport", retry_after_secs);
            Ok(StageOutcome::Retry(format!(
                "transport rate limited ({retry_after_secs}s)"
            )))
        }
        Err(SendError::Transient(msg)) => Ok(StageOutcome::Retry(format!("transient: {msg}"))),
        Err(SendError::InvalidRecipient) => {
            state.store.settle_match(match_id, MatchStatus::Failed)?;
            warn!(match_id, user_id = %user.id, "Recipient invalid, match failed");
            Ok(StageOutcome::Skip("invalid recipient".into()))
        }
        Err(SendError::Permanent(msg)) => {
            state.store.settle_match(match_id, MatchStatus::Failed)?;
            warn!(match_id, error = %msg, "Permanent send failure, match failed");
            Ok(StageOutcome::Skip(format!("permanent failure: {msg}")))
        }
    }
}
