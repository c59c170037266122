//! Source adapter contract.
//!
//! Site-specific extraction lives outside the core; an adapter only has to
//! list recently-changed ads and fetch raw detail payloads. Adapters must
//! respect their own politeness budgets; the core adds per-source
//! concurrency limits and retry with backoff on top.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;

/// One ad observed in a listing page sweep. Conditional-request metadata is
/// passed through so the core can skip unchanged content cheaply.
#[derive(Debug, Clone)]
pub struct AdapterRecord {
    pub site_ad_id: String,
    pub url: String,
    pub http_status: Option<i64>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &str;

    /// Page through recently listed/changed ads. `None` cursor starts from
    /// the top; a `None` next-cursor ends the sweep.
    async fn list_recent(
        &self,
        cursor: Option<String>,
    ) -> Result<(Vec<AdapterRecord>, Option<String>)>;

    /// Fetch the raw detail payload for one ad.
    async fn fetch_detail(&self, url: &str) -> Result<Vec<u8>>;
}

/// Scripted adapter for tests: serves a fixed page of records and canned
/// detail blobs, optionally failing a set number of times first.
pub struct StaticAdapter {
    source_id: String,
    records: Mutex<Vec<AdapterRecord>>,
    details: Mutex<HashMap<String, Vec<u8>>>,
    fail_remaining: Mutex<u32>,
}

impl StaticAdapter {
    pub fn new(source_id: &str) -> Self {
        Self {
            source_id: source_id.to_string(),
            records: Mutex::new(Vec::new()),
            details: Mutex::new(HashMap::new()),
            fail_remaining: Mutex::new(0),
        }
    }

    pub fn add_record(&self, site_ad_id: &str, url: &str, detail: Vec<u8>) {
        self.records.lock().push(AdapterRecord {
            site_ad_id: site_ad_id.to_string(),
            url: url.to_string(),
            http_status: Some(200),
            etag: None,
            last_modified: None,
        });
        self.details.lock().insert(url.to_string(), detail);
    }

    pub fn replace_detail(&self, url: &str, detail: Vec<u8>) {
        self.details.lock().insert(url.to_string(), detail);
    }

    pub fn fail_next(&self, times: u32) {
        *self.fail_remaining.lock() = times;
    }
}

#[async_trait]
impl SourceAdapter for StaticAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn list_recent(
        &self,
        _cursor: Option<String>,
    ) -> Result<(Vec<AdapterRecord>, Option<String>)> {
        {
            let mut remaining = self.fail_remaining.lock();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(anyhow!("simulated transport failure"));
            }
        }
        Ok((self.records.lock().clone(), None))
    }

    async fn fetch_detail(&self, url: &str) -> Result<Vec<u8>> {
        self.details
            .lock()
            .get(url)
            .cloned()
            .ok_or_else(|| anyhow!("no detail for {url}"))
    }
}
