//! Durable typed work queue.
//!
//! Jobs are `(stage, entity_id)` rows in the same SQLite database as the
//! state they mutate, which is what makes the transactional outbox work: a
//! stage commits its writes and the next stage's job in one transaction.
//!
//! Delivery is at-least-once. A partial unique index collapses concurrent
//! enqueues of the same live job, leases stop two workers from running the
//! same job at once, and expired leases are reaped back to pending.

use anyhow::{Context, Result};
use rand::Rng;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{error, warn};

use crate::models::now_ts;
use crate::store::Store;

const BACKOFF_BASE_SECS: i64 = 5;
const BACKOFF_CAP_SECS: i64 = 900;

/// Pipeline stages, in execution order. `Channel`, `AlertMatch` and `Notify`
/// fan out from `Score`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Parse,
    Normalize,
    Dedupe,
    Price,
    Risk,
    Score,
    Channel,
    AlertMatch,
    Notify,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Parse => "parse",
            Stage::Normalize => "normalize",
            Stage::Dedupe => "dedupe",
            Stage::Price => "price",
            Stage::Risk => "risk",
            Stage::Score => "score",
            Stage::Channel => "channel",
            Stage::AlertMatch => "alert_match",
            Stage::Notify => "notify",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "parse" => Some(Stage::Parse),
            "normalize" => Some(Stage::Normalize),
            "dedupe" => Some(Stage::Dedupe),
            "price" => Some(Stage::Price),
            "risk" => Some(Stage::Risk),
            "score" => Some(Stage::Score),
            "channel" => Some(Stage::Channel),
            "alert_match" => Some(Stage::AlertMatch),
            "notify" => Some(Stage::Notify),
            _ => None,
        }
    }
}

/// A leased unit of work. `entity_id` is a raw listing id for Parse, a
/// listing id for the mid stages, and an alert-match id for Notify.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: i64,
    pub stage: Stage,
    pub entity_id: String,
    pub run_at: i64,
    pub attempts: i64,
}

/// What a stage handler tells the queue about a finished job.
#[derive(Debug, Clone)]
pub enum StageOutcome {
    Done,
    /// Transient failure; retry with backoff.
    Retry(String),
    /// Unrecoverable; park in quarantine.
    DeadLetter(String),
    /// Nothing to do (duplicate, draft, gate not met); terminal, not an error.
    Skip(String),
}

/// Enqueue inside an existing transaction (or on a bare connection). Returns
/// false when an identical live job already exists — re-running a stage on an
/// unchanged entity produces no new message.
pub fn enqueue(conn: &Connection, stage: Stage, entity_id: &str, run_at: i64) -> Result<bool> {
    let n = conn
        .execute(
            "INSERT INTO queue_jobs (stage, entity_id, run_at, status, created_at)
             VALUES (?1, ?2, ?3, 'pending', ?4)
             ON CONFLICT DO NOTHING",
            params![stage.as_str(), entity_id, run_at, now_ts()],
        )
        .context("enqueue job")?;
    Ok(n > 0)
}

fn backoff_with_jitter(attempts: i64) -> i64 {
    let exp = attempts.clamp(0, 8) as u32;
    let base = (BACKOFF_BASE_SECS << exp).min(BACKOFF_CAP_SECS);
    let jitter = rand::thread_rng().gen_range(0.5..1.5);
    ((base as f64) * jitter) as i64
}

impl Store {
    pub fn enqueue_job(&self, stage: Stage, entity_id: &str, delay_secs: i64) -> Result<bool> {
        self.with_conn(|c| enqueue(c, stage, entity_id, now_ts() + delay_secs))
    }

    /// Lease the oldest due job. The attempt counter bumps at lease time, so
    /// `attempts` on the returned job counts this delivery.
    pub fn dequeue_job(&self, lease_secs: i64) -> Result<Option<Job>> {
        let now = now_ts();
        self.with_conn(|c| {
            let job = c
                .query_row(
                    "UPDATE queue_jobs
                     SET status = 'leased', lease_until = ?1, attempts = attempts + 1
                     WHERE id = (
                         SELECT id FROM queue_jobs
                         WHERE status = 'pending' AND run_at <= ?2
                         ORDER BY run_at, id LIMIT 1
                     )
                     RETURNING id, stage, entity_id, run_at, attempts",
                    params![now + lease_secs, now],
                    |r| {
                        Ok((
                            r.get::<_, i64>(0)?,
                            r.get::<_, String>(1)?,
                            r.get::<_, String>(2)?,
                            r.get::<_, i64>(3)?,
                            r.get::<_, i64>(4)?,
                        ))
                    },
                )
                .optional()?;

            Ok(job.and_then(|(id, stage, entity_id, run_at, attempts)| {
                let Some(stage) = Stage::parse(&stage) else {
                    error!(job_id = id, stage, "Unknown stage in queue, marking dead");
                    let _ = c.execute(
                        "UPDATE queue_jobs SET status = 'dead', last_error = 'unknown stage'
                         WHERE id = ?1",
                        params![id],
                    );
                    return None;
                };
                Some(Job {
                    id,
                    stage,
                    entity_id,
                    run_at,
                    attempts,
                })
            }))
        })
    }

    /// Settle a leased job according to its handler outcome.
    pub fn finish_job(&self, job: &Job, outcome: StageOutcome, max_attempts: i64) -> Result<()> {
        let now = now_ts();
        self.with_conn(|c| match outcome {
            StageOutcome::Done => {
                c.execute(
                    "UPDATE queue_jobs SET status = 'done', lease_until = NULL WHERE id = ?1",
                    params![job.id],
                )?;
                Ok(())
            }
            StageOutcome::Skip(reason) => {
                c.execute(
                    "UPDATE queue_jobs SET status = 'done', lease_until = NULL, last_error = ?2
                     WHERE id = ?1",
                    params![job.id, reason],
                )?;
                Ok(())
            }
            StageOutcome::Retry(reason) => {
                if job.attempts >= max_attempts {
                    warn!(
                        stage = job.stage.as_str(),
                        entity = %job.entity_id,
                        attempts = job.attempts,
                        reason = %reason,
                        "Retry budget exhausted, quarantining"
                    );
                    quarantine(c, job, &reason, now)
                } else {
                    let delay = backoff_with_jitter(job.attempts);
                    c.execute(
                        "UPDATE queue_jobs
                         SET status = 'pending', lease_until = NULL, run_at = ?2, last_error = ?3
                         WHERE id = ?1",
                        params![job.id, now + delay, reason],
                    )?;
                    Ok(())
                }
            }
            StageOutcome::DeadLetter(reason) => {
                error!(
                    stage = job.stage.as_str(),
                    entity = %job.entity_id,
                    reason = %reason,
                    "Dead-lettering job"
                );
                quarantine(c, job, &reason, now)
            }
        })
    }

    /// Return expired leases to pending so crashed workers do not strand
    /// work. Call periodically from the runtime.
    pub fn reap_expired_leases(&self) -> Result<usize> {
        let now = now_ts();
        self.with_conn(|c| {
            let n = c.execute(
                "UPDATE queue_jobs SET status = 'pending', lease_until = NULL
                 WHERE status = 'leased' AND lease_until < ?1",
                params![now],
            )?;
            if n > 0 {
                warn!(count = n, "Reaped expired job leases");
            }
            Ok(n)
        })
    }

    /// Depth of the pending queue per stage, for backpressure decisions.
    pub fn queue_depth(&self, stage: Stage) -> Result<i64> {
        self.with_conn(|c| {
            Ok(c.query_row(
                "SELECT COUNT(*) FROM queue_jobs WHERE stage = ?1 AND status = 'pending'",
                params![stage.as_str()],
                |r| r.get(0),
            )?)
        })
    }

    /// Drop finished job rows older than the horizon.
    pub fn purge_finished_jobs(&self, older_than_secs: i64) -> Result<usize> {
        self.with_conn(|c| {
            Ok(c.execute(
                "DELETE FROM queue_jobs WHERE status = 'done' AND created_at < ?1",
                params![now_ts() - older_than_secs],
            )?)
        })
    }
}

fn quarantine(c: &Connection, job: &Job, reason: &str, now: i64) -> Result<()> {
    c.execute(
        "UPDATE queue_jobs SET status = 'dead', lease_until = NULL, last_error = ?2
         WHERE id = ?1",
        params![job.id, reason],
    )?;
    c.execute(
        "INSERT INTO quarantine (stage, entity_id, attempts, last_error, quarantined_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(stage, entity_id) DO UPDATE SET
             attempts = excluded.attempts,
             last_error = excluded.last_error,
             quarantined_at = excluded.quarantined_at",
        params![job.stage.as_str(), job.entity_id, job.attempts, reason, now],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enqueue_is_idempotent_while_live() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.enqueue_job(Stage::Parse, "L1", 0).unwrap());
        assert!(!store.enqueue_job(Stage::Parse, "L1", 0).unwrap());
        // a different stage is a different job
        assert!(store.enqueue_job(Stage::Normalize, "L1", 0).unwrap());
    }

    #[test]
    fn dequeue_leases_and_finish_done_settles() {
        let store = Store::open_in_memory().unwrap();
        store.enqueue_job(Stage::Parse, "L1", 0).unwrap();

        let job = store.dequeue_job(60).unwrap().expect("job due");
        assert_eq!(job.stage, Stage::Parse);
        assert_eq!(job.attempts, 1);
        // leased: nothing else due
        assert!(store.dequeue_job(60).unwrap().is_none());

        store.finish_job(&job, StageOutcome::Done, 3).unwrap();
        // done rows do not block a fresh enqueue
        assert!(store.enqueue_job(Stage::Parse, "L1", 0).unwrap());
    }

    #[test]
    fn retry_requeues_until_quarantine() {
        let store = Store::open_in_memory().unwrap();
        store.enqueue_job(Stage::Price, "L9", 0).unwrap();

        let job = store.dequeue_job(60).unwrap().unwrap();
        store
            .finish_job(&job, StageOutcome::Retry("db deadlock".into()), 1)
            .unwrap();

        // attempts (1) >= max (1): quarantined, queue empty
        assert!(store.dequeue_job(60).unwrap().is_none());
        store
            .with_conn(|c| {
                let n: i64 = c.query_row(
                    "SELECT COUNT(*) FROM quarantine WHERE stage = 'price' AND entity_id = 'L9'",
                    [],
                    |r| r.get(0),
                )?;
                assert_eq!(n, 1);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn delayed_jobs_wait_their_turn() {
        let store = Store::open_in_memory().unwrap();
        store.enqueue_job(Stage::Notify, "M1", 3600).unwrap();
        assert!(store.dequeue_job(60).unwrap().is_none());
    }

    #[test]
    fn reaper_recovers_expired_leases() {
        let store = Store::open_in_memory().unwrap();
        store.enqueue_job(Stage::Dedupe, "L2", 0).unwrap();
        let job = store.dequeue_job(-10).unwrap().unwrap(); // lease already expired
        assert_eq!(store.reap_expired_leases().unwrap(), 1);
        let again = store.dequeue_job(60).unwrap().unwrap();
        assert_eq!(again.entity_id, job.entity_id);
        assert_eq!(again.attempts, 2);
    }
}
