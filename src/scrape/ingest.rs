//! Record ingestion: fetch detail payloads, persist blobs, upsert raw
//! listings, and let the store enqueue parse for new or changed content.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rand::Rng;
use sha2::{Digest, Sha256};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use super::adapter::{AdapterRecord, SourceAdapter};
use crate::models::{now_ts, RawRecord};
use crate::pipeline::AppState;

const FETCH_ATTEMPTS: u32 = 3;
const FETCH_BACKOFF_MS: u64 = 500;

async fn fetch_with_retry(adapter: &dyn SourceAdapter, url: &str) -> Result<Vec<u8>> {
    let mut last_err = None;
    for attempt in 0..FETCH_ATTEMPTS {
        match adapter.fetch_detail(url).await {
            Ok(blob) => return Ok(blob),
            Err(e) => {
                let backoff = FETCH_BACKOFF_MS << attempt;
                let jitter = rand::thread_rng().gen_range(0..backoff / 2 + 1);
                debug!(url, attempt, error = %e, "Detail fetch failed, backing off");
                tokio::time::sleep(Duration::from_millis(backoff + jitter)).await;
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("fetch failed"))).context("detail fetch")
}

/// Ingest one sweep of records. Returns how many observations changed state
/// (new ad or changed content).
pub async fn ingest_records(
    state: &AppState,
    adapter: Arc<dyn SourceAdapter>,
    records: Vec<AdapterRecord>,
) -> Result<usize> {
    let semaphore = Arc::new(Semaphore::new(state.config.per_source_concurrency.max(1)));
    let mut handles = Vec::with_capacity(records.len());

    for record in records {
        let state = state.clone();
        let adapter = adapter.clone();
        let semaphore = semaphore.clone();
        handles.push(tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.ok()?;
            let source_id = adapter.source_id().to_string();

            let blob = match fetch_with_retry(adapter.as_ref(), &record.url).await {
                Ok(blob) => blob,
                Err(e) => {
                    warn!(source = %source_id, url = %record.url, error = %e, "Giving up on detail");
                    return None;
                }
            };

            let content_hash = hex::encode(Sha256::digest(&blob));
            let blob_key = format!(
                "{}/{}/{}",
                source_id,
                record.site_ad_id,
                &content_hash[..12]
            );
            if let Err(e) = state.blob.put(&blob_key, &blob) {
                warn!(key = %blob_key, error = %e, "Blob write failed");
                return None;
            }

            let raw_record = RawRecord {
                source_id,
                site_ad_id: record.site_ad_id.clone(),
                url: record.url.clone(),
                raw_blob_key: blob_key,
                content_hash,
                observed_at: now_ts(),
            };
            match state.store.observe_record(&raw_record, record.http_status) {
                Ok(obs) => Some(obs.is_new || obs.content_changed),
                Err(e) => {
                    warn!(site_ad_id = %record.site_ad_id, error = %e, "Observe failed");
                    None
                }
            }
        }));
    }

    let mut changed = 0usize;
    for handle in handles {
        if let Ok(Some(true)) = handle.await {
            changed += 1;
        }
    }
    Ok(changed)
}
