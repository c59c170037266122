//! Alert-match stage: fan an approved listing out to every matching alert.
//!
//! Match rows are unique per `(alert, listing)`, so re-running the stage
//! creates nothing new. Delivery is scheduled at `matched_at + plan delay`;
//! a user already at their daily cap gets the match recorded as skipped
//! rather than a deferred surprise.

use anyhow::Result;
use tracing::{debug, info};

use crate::alerts::matcher::listing_matches;
use crate::models::{now_ts, MatchStatus};
use crate::pipeline::AppState;
use crate::queue::StageOutcome;

pub async fn run(state: &AppState, listing_id: &str) -> Result<StageOutcome> {
    let Some(listing) = state.store.get_listing(listing_id)? else {
        return Ok(StageOutcome::Skip(format!("unknown listing {listing_id}")));
    };
    if listing.is_duplicate {
        return Ok(StageOutcome::Skip("duplicates do not match alerts".into()));
    }

    let now = now_ts();
    let mut matched = 0usize;

    for alert in state.store.active_alerts()? {
        if !listing_matches(&alert.filters, &listing) {
            continue;
        }
        let Some(entitlement) = state.store.entitlement(&alert.user_id)? else {
            continue;
        };
        let delay = entitlement.plan.notification_delay_secs.max(0);
        let Some(match_id) =
            state
                .store
                .insert_alert_match(&alert.id, &listing.id, now, now + delay)?
        else {
            // already matched earlier; nothing new to schedule
            continue;
        };
        matched += 1;

        // at-cap users are settled immediately so the pending queue stays honest
        if let Some(cap) = entitlement.plan.daily_cap {
            if state.store.notify_count(&alert.user_id, now)? >= cap {
                state.store.settle_match(&match_id, MatchStatus::Skipped)?;
                debug!(
                    alert_id = %alert.id,
                    user_id = %alert.user_id,
                    "Daily cap reached, match skipped"
                );
                continue;
            }
        }
        debug!(
            alert_id = %alert.id,
            listing_id,
            delay_secs = delay,
            "Alert matched, delivery scheduled"
        );
    }

    if matched > 0 {
        info!(listing_id, matched, "Alert matching complete");
    }
    Ok(StageOutcome::Done)
}
