//! Users, plans, alerts, alert matches, and the per-user daily counters.

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use super::Store;
use crate::alerts::dsl::AlertFilters;
use crate::models::{now_ts, ts_to_datetime, Alert, AlertMatch, MatchStatus, Plan, PlanName, User};
use crate::queue::{self, Stage};

/// Read-only projection the dispatcher consults before every send.
#[derive(Debug, Clone)]
pub struct Entitlement {
    pub plan: Plan,
    pub status: String,
    pub current_period_end: Option<i64>,
}

/// UTC day key for the daily-cap counters.
pub fn utc_day(ts: i64) -> String {
    ts_to_datetime(ts).format("%Y-%m-%d").to_string()
}

fn row_to_plan(r: &rusqlite::Row) -> rusqlite::Result<Plan> {
    let name: String = r.get(1)?;
    Ok(Plan {
        id: r.get(0)?,
        name: PlanName::parse(&name).unwrap_or(PlanName::Free),
        max_alerts: r.get(2)?,
        notification_delay_secs: r.get(3)?,
        daily_cap: r.get(4)?,
    })
}

impl Store {
    /// Push the configured delays and caps onto the seeded plan rows.
    pub fn apply_plan_limits(&self, config: &crate::config::Config) -> Result<()> {
        self.with_conn(|c| {
            c.execute(
                "UPDATE plans SET notification_delay_secs = ?1, daily_cap = ?2 WHERE name = 'free'",
                params![config.free_alert_delay_min * 60, config.free_daily_cap],
            )?;
            c.execute(
                "UPDATE plans SET daily_cap = ?1 WHERE name = 'premium'",
                params![config.premium_daily_cap],
            )?;
            Ok(())
        })
    }

    // ---- users ---------------------------------------------------------

    pub fn upsert_user(&self, telegram_user_id: i64, plan: PlanName) -> Result<User> {
        self.with_conn(|c| {
            let plan_id: String = c.query_row(
                "SELECT id FROM plans WHERE name = ?1",
                params![plan.as_str()],
                |r| r.get(0),
            )?;
            let existing: Option<String> = c
                .query_row(
                    "SELECT id FROM users WHERE telegram_user_id = ?1",
                    params![telegram_user_id],
                    |r| r.get(0),
                )
                .optional()?;
            let id = match existing {
                Some(id) => {
                    c.execute(
                        "UPDATE users SET plan_id = ?2 WHERE id = ?1",
                        params![id, plan_id],
                    )?;
                    id
                }
                None => {
                    let id = Uuid::new_v4().to_string();
                    c.execute(
                        "INSERT INTO users (id, telegram_user_id, plan_id, status)
                         VALUES (?1, ?2, ?3, 'active')",
                        params![id, telegram_user_id, plan_id],
                    )?;
                    id
                }
            };
            Ok(User {
                id,
                telegram_user_id,
                plan_id,
                status: "active".to_string(),
            })
        })
    }

    pub fn set_user_status(&self, user_id: &str, status: &str) -> Result<()> {
        self.with_conn(|c| {
            c.execute(
                "UPDATE users SET status = ?2 WHERE id = ?1",
                params![user_id, status],
            )?;
            Ok(())
        })
    }

    /// The entitlements view: plan limits plus subscription status.
    pub fn entitlement(&self, user_id: &str) -> Result<Option<Entitlement>> {
        self.with_conn(|c| {
            Ok(c.query_row(
                "SELECT p.id, p.name, p.max_alerts, p.notification_delay_secs, p.daily_cap,
                        u.status, u.current_period_end
                 FROM users u JOIN plans p ON p.id = u.plan_id
                 WHERE u.id = ?1",
                params![user_id],
                |r| {
                    Ok(Entitlement {
                        plan: row_to_plan(r)?,
                        status: r.get(5)?,
                        current_period_end: r.get(6)?,
                    })
                },
            )
            .optional()?)
        })
    }

    // ---- alerts --------------------------------------------------------

    /// Create an alert, enforcing the plan's `max_alerts`.
    pub fn create_alert(
        &self,
        user_id: &str,
        dsl_query: &str,
        filters: &AlertFilters,
    ) -> Result<Alert> {
        let filters_json = serde_json::to_string(filters).context("serialize filters")?;
        let ent = self
            .entitlement(user_id)?
            .ok_or_else(|| anyhow!("unknown user {user_id}"))?;
        self.with_conn(|c| {
            let active: i64 = c.query_row(
                "SELECT COUNT(*) FROM alerts WHERE user_id = ?1 AND active = 1",
                params![user_id],
                |r| r.get(0),
            )?;
            if active >= ent.plan.max_alerts {
                return Err(anyhow!(
                    "alert limit reached for plan {} ({})",
                    ent.plan.name.as_str(),
                    ent.plan.max_alerts
                ));
            }
            let id = Uuid::new_v4().to_string();
            let created_at = now_ts();
            c.execute(
                "INSERT INTO alerts (id, user_id, dsl_query, filters, active, created_at)
                 VALUES (?1, ?2, ?3, ?4, 1, ?5)",
                params![id, user_id, dsl_query, filters_json, created_at],
            )?;
            Ok(Alert {
                id,
                user_id: user_id.to_string(),
                dsl_query: dsl_query.to_string(),
                filters: filters.clone(),
                active: true,
                created_at,
            })
        })
    }

    pub fn set_alert_active(&self, alert_id: &str, active: bool) -> Result<()> {
        self.with_conn(|c| {
            c.execute(
                "UPDATE alerts SET active = ?2 WHERE id = ?1",
                params![alert_id, active as i64],
            )?;
            Ok(())
        })
    }

    pub fn active_alerts(&self) -> Result<Vec<Alert>> {
        self.with_conn(|c| {
            let mut stmt = c.prepare(
                "SELECT id, user_id, dsl_query, filters, active, created_at
                 FROM alerts WHERE active = 1",
            )?;
            let rows = stmt
                .query_map([], |r| {
                    let filters: String = r.get(3)?;
                    Ok(Alert {
                        id: r.get(0)?,
                        user_id: r.get(1)?,
                        dsl_query: r.get(2)?,
                        filters: serde_json::from_str(&filters).unwrap_or_default(),
                        active: r.get::<_, i64>(4)? != 0,
                        created_at: r.get(5)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    // ---- alert matches -------------------------------------------------

    /// Record a match and schedule its delivery. Returns None when the
    /// `(alert, listing)` pair already matched — concurrent duplicates
    /// collapse on the unique constraint.
    pub fn insert_alert_match(
        &self,
        alert_id: &str,
        listing_id: &str,
        matched_at: i64,
        deliver_after: i64,
    ) -> Result<Option<String>> {
        self.with_tx(|tx| {
            let id = Uuid::new_v4().to_string();
            let n = tx.execute(
                "INSERT INTO alert_matches
                 (id, alert_id, listing_id, matched_at, deliver_after, status)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'pending')
                 ON CONFLICT(alert_id, listing_id) DO NOTHING",
                params![id, alert_id, listing_id, matched_at, deliver_after],
            )?;
            if n == 0 {
                return Ok(None);
            }
            queue::enqueue(tx, Stage::Notify, &id, deliver_after)?;
            Ok(Some(id))
        })
    }

    pub fn get_alert_match(&self, match_id: &str) -> Result<Option<AlertMatch>> {
        self.with_conn(|c| {
            Ok(c.query_row(
                "SELECT id, alert_id, listing_id, matched_at, deliver_after, notified_at, status
                 FROM alert_matches WHERE id = ?1",
                params![match_id],
                |r| {
                    let status: String = r.get(6)?;
                    Ok(AlertMatch {
                        id: r.get(0)?,
                        alert_id: r.get(1)?,
                        listing_id: r.get(2)?,
                        matched_at: r.get(3)?,
                        deliver_after: r.get(4)?,
                        notified_at: r.get(5)?,
                        status: MatchStatus::parse(&status).unwrap_or(MatchStatus::Pending),
                    })
                },
            )
            .optional()?)
        })
    }

    /// Everything the dispatcher needs for one match.
    pub fn match_context(&self, match_id: &str) -> Result<Option<(AlertMatch, Alert, User)>> {
        let Some(m) = self.get_alert_match(match_id)? else {
            return Ok(None);
        };
        self.with_conn(|c| {
            let alert = c
                .query_row(
                    "SELECT id, user_id, dsl_query, filters, active, created_at
                     FROM alerts WHERE id = ?1",
                    params![m.alert_id],
                    |r| {
                        let filters: String = r.get(3)?;
                        Ok(Alert {
                            id: r.get(0)?,
                            user_id: r.get(1)?,
                            dsl_query: r.get(2)?,
                            filters: serde_json::from_str(&filters).unwrap_or_default(),
                            active: r.get::<_, i64>(4)? != 0,
                            created_at: r.get(5)?,
                        })
                    },
                )
                .optional()?;
            let Some(alert) = alert else {
                return Ok(None);
            };
            let user = c
                .query_row(
                    "SELECT id, telegram_user_id, plan_id, status FROM users WHERE id = ?1",
                    params![alert.user_id],
                    |r| {
                        Ok(User {
                            id: r.get(0)?,
                            telegram_user_id: r.get(1)?,
                            plan_id: r.get(2)?,
                            status: r.get(3)?,
                        })
                    },
                )
                .optional()?;
            Ok(user.map(|u| (m.clone(), alert, u)))
        })
    }

    /// Terminal skip/fail states. No counter movement.
    pub fn settle_match(&self, match_id: &str, status: MatchStatus) -> Result<()> {
        self.with_conn(|c| {
            c.execute(
                "UPDATE alert_matches SET status = ?2 WHERE id = ?1",
                params![match_id, status.as_str()],
            )?;
            Ok(())
        })
    }

    /// Mark a match delivered and bump the user's daily counter in one
    /// transaction, so the cap holds under concurrent dispatch.
    pub fn record_delivery(&self, match_id: &str, user_id: &str, delivered_at: i64) -> Result<()> {
        let day = utc_day(delivered_at);
        self.with_tx(|tx| {
            tx.execute(
                "UPDATE alert_matches SET status = 'notified', notified_at = ?2 WHERE id = ?1",
                params![match_id, delivered_at],
            )?;
            tx.execute(
                "INSERT INTO notify_counters (user_id, day, count) VALUES (?1, ?2, 1)
                 ON CONFLICT(user_id, day) DO UPDATE SET count = count + 1",
                params![user_id, day],
            )?;
            Ok(())
        })
    }

    pub fn notify_count(&self, user_id: &str, at_ts: i64) -> Result<i64> {
        let day = utc_day(at_ts);
        self.with_conn(|c| {
            Ok(c.query_row(
                "SELECT count FROM notify_counters WHERE user_id = ?1 AND day = ?2",
                params![user_id, day],
                |r| r.get(0),
            )
            .optional()?
            .unwrap_or(0))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alert_limit_enforced_per_plan() {
        let store = Store::open_in_memory().unwrap();
        let user = store.upsert_user(1001, PlanName::Free).unwrap();
        let filters = AlertFilters::default();
        for _ in 0..3 {
            store.create_alert(&user.id, "bmw x5", &filters).unwrap();
        }
        assert!(store.create_alert(&user.id, "bmw x5", &filters).is_err());
    }

    #[test]
    fn alert_match_unique_per_pair() {
        let store = Store::open_in_memory().unwrap();
        let user = store.upsert_user(1002, PlanName::Premium).unwrap();
        let alert = store
            .create_alert(&user.id, "audi a4", &AlertFilters::default())
            .unwrap();

        let first = store
            .insert_alert_match(&alert.id, "L1", 1000, 1000)
            .unwrap();
        assert!(first.is_some());
        let second = store
            .insert_alert_match(&alert.id, "L1", 1001, 1001)
            .unwrap();
        assert!(second.is_none());
    }

    #[test]
    fn delivery_counts_roll_per_utc_day() {
        let store = Store::open_in_memory().unwrap();
        let user = store.upsert_user(1003, PlanName::Free).unwrap();
        let alert = store
            .create_alert(&user.id, "vw golf", &AlertFilters::default())
            .unwrap();
        let m = store
            .insert_alert_match(&alert.id, "L2", 1_700_000_000, 1_700_000_000)
            .unwrap()
            .unwrap();

        assert_eq!(store.notify_count(&user.id, 1_700_000_000).unwrap(), 0);
        store.record_delivery(&m, &user.id, 1_700_000_000).unwrap();
        assert_eq!(store.notify_count(&user.id, 1_700_000_000).unwrap(), 1);
        // next UTC day starts a fresh counter
        assert_eq!(store.notify_count(&user.id, 1_700_000_000 + 86_400).unwrap(), 0);
    }
}
